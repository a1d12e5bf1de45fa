//! Signed sparse append-only logs.
//!
//! A log is a sequence of blocks owned by one keypair. Readers hold only the
//! public key and verify every block they insert; the owner appends. Blocks
//! may arrive out of order during replication, so presence is a sparse set
//! and `length` is a monotonic high-water mark.

use std::collections::BTreeSet;
use std::fs;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use ed25519_dalek::{SigningKey, VerifyingKey};
use peartube_core::{CoreError, Result};
use tokio::sync::broadcast;
use tracing::warn;

use crate::crypto::{sign_block, verify_block};

const BLOCK_SUFFIX: &str = ".blk";
const SIGNATURE_LEN: usize = 64;
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Notification for one newly stored block.
#[derive(Debug, Clone, Copy)]
pub struct LogUpdate {
    /// Index of the stored block.
    pub index: u64,
    /// Payload size in bytes.
    pub byte_len: u64,
}

#[derive(Debug, Default)]
struct LogState {
    present: BTreeSet<u64>,
    length: u64,
    total_bytes: u64,
}

/// One signed sparse log persisted under a directory.
pub struct Log {
    dir: PathBuf,
    public_key: VerifyingKey,
    secret: Option<SigningKey>,
    state: RwLock<LogState>,
    updates: broadcast::Sender<LogUpdate>,
}

impl Log {
    /// Open (or create) a log under `dir` for the given public key.
    ///
    /// Passing the matching secret key makes the log writable.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created or scanned, or
    /// when the public key bytes are not a valid key.
    pub fn open(
        dir: impl Into<PathBuf>,
        public_key: &[u8; 32],
        secret: Option<SigningKey>,
    ) -> Result<Arc<Self>> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CoreError::storage("log.open", source))?;
        let public_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| CoreError::internal("log public key is not a valid ed25519 key"))?;

        if let Some(secret) = &secret
            && secret.verifying_key() != public_key
        {
            return Err(CoreError::internal("secret key does not match log key"));
        }

        let mut state = LogState::default();
        for entry in
            fs::read_dir(&dir).map_err(|source| CoreError::storage("log.scan", source))?
        {
            let entry = entry.map_err(|source| CoreError::storage("log.scan", source))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(index) = name
                .strip_suffix(BLOCK_SUFFIX)
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };
            let size = entry
                .metadata()
                .map_err(|source| CoreError::storage("log.scan", source))?
                .len();
            state.present.insert(index);
            state.length = state.length.max(index + 1);
            state.total_bytes += size.saturating_sub(SIGNATURE_LEN as u64);
        }

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            dir,
            public_key,
            secret,
            state: RwLock::new(state),
            updates,
        }))
    }

    /// The log's public key bytes.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.public_key.to_bytes()
    }

    /// Whether this node holds the owner secret.
    #[must_use]
    pub const fn writable(&self) -> bool {
        self.secret.is_some()
    }

    /// High-water mark: one past the highest known block index.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.read_state().length
    }

    /// Sum of locally present payload bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.read_state().total_bytes
    }

    /// Whether the block at `index` is locally present.
    #[must_use]
    pub fn has(&self, index: u64) -> bool {
        self.read_state().present.contains(&index)
    }

    /// Count the locally present blocks inside `range`.
    #[must_use]
    pub fn present_in(&self, range: Range<u64>) -> u64 {
        self.read_state().present.range(range).count() as u64
    }

    /// The indices inside `range` that are not locally present.
    #[must_use]
    pub fn missing_in(&self, range: Range<u64>) -> Vec<u64> {
        let state = self.read_state();
        range
            .filter(|index| !state.present.contains(index))
            .collect()
    }

    /// Subscribe to block-stored notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogUpdate> {
        self.updates.subscribe()
    }

    /// Append a block as the owner.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] without the secret key, or a storage
    /// error when the write fails.
    pub fn append(&self, payload: &[u8]) -> Result<u64> {
        let Some(secret) = &self.secret else {
            return Err(CoreError::ReadOnly);
        };

        let mut state = self.write_state();
        let index = state.length;
        let signature = sign_block(secret, index, payload);
        self.persist(index, payload, &signature)?;
        state.present.insert(index);
        state.length = index + 1;
        state.total_bytes += payload.len() as u64;
        drop(state);

        let _ = self.updates.send(LogUpdate {
            index,
            byte_len: payload.len() as u64,
        });
        Ok(index)
    }

    /// Store a replicated block after verifying its signature.
    ///
    /// Returns `true` only when the block was newly stored.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BadSignature`] when verification fails, or a
    /// storage error when the write fails.
    pub fn insert(&self, index: u64, payload: &[u8], signature: &[u8; 64]) -> Result<bool> {
        verify_block(&self.public_key, index, payload, signature)?;

        let mut state = self.write_state();
        if state.present.contains(&index) {
            return Ok(false);
        }
        self.persist(index, payload, signature)?;
        state.present.insert(index);
        state.length = state.length.max(index + 1);
        state.total_bytes += payload.len() as u64;
        drop(state);

        let _ = self.updates.send(LogUpdate {
            index,
            byte_len: payload.len() as u64,
        });
        Ok(true)
    }

    /// Read a locally present block.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the block file cannot be read.
    pub fn get(&self, index: u64) -> Result<Option<Bytes>> {
        Ok(self
            .get_with_signature(index)?
            .map(|(payload, _signature)| payload))
    }

    /// Read a locally present block together with its signature, as served to
    /// replication peers.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the block file cannot be read.
    pub fn get_with_signature(&self, index: u64) -> Result<Option<(Bytes, [u8; 64])>> {
        if !self.has(index) {
            return Ok(None);
        }
        let raw = match fs::read(self.block_path(index)) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                warn!(index, dir = %self.dir.display(), "block vanished under the log");
                return Ok(None);
            }
            Err(source) => return Err(CoreError::storage("log.read", source)),
        };
        if raw.len() < SIGNATURE_LEN {
            return Err(CoreError::internal(format!(
                "block {index} is shorter than its signature"
            )));
        }
        let mut signature = [0_u8; 64];
        signature.copy_from_slice(&raw[..SIGNATURE_LEN]);
        Ok(Some((
            Bytes::copy_from_slice(&raw[SIGNATURE_LEN..]),
            signature,
        )))
    }

    fn persist(&self, index: u64, payload: &[u8], signature: &[u8; 64]) -> Result<()> {
        let mut raw = Vec::with_capacity(SIGNATURE_LEN + payload.len());
        raw.extend_from_slice(signature);
        raw.extend_from_slice(payload);
        fs::write(self.block_path(index), raw)
            .map_err(|source| CoreError::storage("log.write", source))
    }

    fn block_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{index}{BLOCK_SUFFIX}"))
    }

    fn read_state(&self) -> RwLockReadGuard<'_, LogState> {
        self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, LogState> {
        self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Log")
            .field("dir", &self.dir)
            .field("length", &self.length())
            .field("writable", &self.writable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DriveKeys;
    use tempfile::TempDir;

    fn owner_log(dir: &TempDir) -> Arc<Log> {
        let keys = DriveKeys::generate();
        let signing = keys.meta_signing_key().expect("signing key");
        let public = signing.verifying_key().to_bytes();
        Log::open(dir.path().join("log"), &public, Some(signing)).expect("log opens")
    }

    #[test]
    fn append_grows_length_and_bytes() {
        let dir = TempDir::new().expect("tempdir");
        let log = owner_log(&dir);

        assert_eq!(log.append(b"alpha").expect("append"), 0);
        assert_eq!(log.append(b"beta").expect("append"), 1);
        assert_eq!(log.length(), 2);
        assert_eq!(log.total_bytes(), 9);
        assert_eq!(log.get(0).expect("read").as_deref(), Some(b"alpha".as_ref()));
    }

    #[test]
    fn readers_verify_inserts_and_stay_sparse() {
        let dir = TempDir::new().expect("tempdir");
        let keys = DriveKeys::generate();
        let signing = keys.meta_signing_key().expect("signing key");
        let public = signing.verifying_key().to_bytes();

        let reader = Log::open(dir.path().join("reader"), &public, None).expect("log opens");
        assert!(!reader.writable());
        assert!(matches!(reader.append(b"nope"), Err(CoreError::ReadOnly)));

        let signature = sign_block(&signing, 5, b"block five");
        assert!(reader.insert(5, b"block five", &signature).expect("insert"));
        assert!(!reader.insert(5, b"block five", &signature).expect("dup insert"));
        assert_eq!(reader.length(), 6);
        assert_eq!(reader.present_in(0..6), 1);
        assert_eq!(reader.missing_in(4..6), vec![4]);

        let bad = sign_block(&signing, 6, b"other payload");
        assert!(matches!(
            reader.insert(6, b"block six", &bad),
            Err(CoreError::BadSignature { index: 6 })
        ));
    }

    #[test]
    fn reopen_recovers_state_from_disk() {
        let dir = TempDir::new().expect("tempdir");
        let keys = DriveKeys::generate();
        let signing = keys.meta_signing_key().expect("signing key");
        let public = signing.verifying_key().to_bytes();
        let path = dir.path().join("log");

        {
            let log = Log::open(&path, &public, Some(signing.clone())).expect("log opens");
            log.append(b"one").expect("append");
            log.append(b"two").expect("append");
        }

        let reopened = Log::open(&path, &public, Some(signing)).expect("log reopens");
        assert_eq!(reopened.length(), 2);
        assert_eq!(reopened.total_bytes(), 6);
        assert!(reopened.has(1));
    }

    #[tokio::test]
    async fn updates_are_broadcast_per_block() {
        let dir = TempDir::new().expect("tempdir");
        let log = owner_log(&dir);
        let mut updates = log.subscribe();

        log.append(b"notify").expect("append");
        let update = updates.recv().await.expect("update delivered");
        assert_eq!(update.index, 0);
        assert_eq!(update.byte_len, 6);
    }
}
