//! Content-addressed filesystem over a pair of logs.
//!
//! Entry 0 of the metadata log is a header recording the paired blob log key;
//! every later entry is a put or delete record mapping an absolute path to a
//! blob descriptor. File bytes live in the blob log in fixed-size blocks. A
//! path index folds the metadata log in order, stopping at the first gap, so
//! reads always see a prefix-consistent view.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use peartube_core::{BlobDescriptor, ChannelKey, CoreError, Result, validate_path};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::crypto::{DriveKeys, discovery_key};
use crate::log::Log;

/// Chunk size for file bytes appended to the blob log.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Header stored at entry 0 of the metadata log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveHeader {
    version: u32,
    blobs_key: String,
}

/// One metadata log record after the header.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum MetaRecord {
    Put {
        path: String,
        blob: BlobDescriptor,
    },
    Del {
        path: String,
    },
}

#[derive(Debug, Default)]
struct PathIndex {
    entries: BTreeMap<String, BlobDescriptor>,
    folded: u64,
}

/// Handle to one channel's drive.
pub struct Drive {
    channel_key: ChannelKey,
    discovery: [u8; 32],
    dir: PathBuf,
    meta: Arc<Log>,
    blobs_secret: Option<SigningKey>,
    blobs: RwLock<Option<Arc<Log>>>,
    index: RwLock<PathIndex>,
}

impl Drive {
    /// Open the drive for `channel_key` under `base_dir`.
    ///
    /// Passing the owner key material makes the drive writable; without it
    /// the drive is a verifying reader.
    ///
    /// # Errors
    ///
    /// Returns an error when storage cannot be prepared or the key material
    /// does not match the channel key.
    pub fn open(
        base_dir: impl Into<PathBuf>,
        channel_key: ChannelKey,
        keys: Option<&DriveKeys>,
    ) -> Result<Arc<Self>> {
        let dir = base_dir.into().join(channel_key.to_string());
        let meta_secret = keys.map(DriveKeys::meta_signing_key).transpose()?;
        let blobs_secret = keys.map(DriveKeys::blobs_signing_key).transpose()?;
        let meta = Log::open(dir.join("meta"), channel_key.as_bytes(), meta_secret)?;

        let drive = Arc::new(Self {
            channel_key,
            discovery: discovery_key(channel_key.as_bytes()),
            dir,
            meta,
            blobs_secret,
            blobs: RwLock::new(None),
            index: RwLock::new(PathIndex {
                entries: BTreeMap::new(),
                folded: 1,
            }),
        });
        drive.refresh()?;
        Ok(drive)
    }

    /// Create a fresh owner drive under `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error when storage cannot be prepared.
    pub fn create(base_dir: impl Into<PathBuf>) -> Result<(Arc<Self>, DriveKeys)> {
        let keys = DriveKeys::generate();
        let channel_key = keys.channel_key()?;
        let drive = Self::open(base_dir, channel_key, Some(&keys))?;

        if drive.meta.length() == 0 {
            let blobs_key = keys.blobs_signing_key()?.verifying_key().to_bytes();
            let header = DriveHeader {
                version: 1,
                blobs_key: hex::encode(blobs_key),
            };
            let payload = serde_json::to_vec(&header)
                .map_err(|source| CoreError::encoding("drive.header", source))?;
            drive.meta.append(&payload)?;
            drive.refresh()?;
        }
        Ok((drive, keys))
    }

    /// The channel key naming this drive.
    #[must_use]
    pub const fn channel_key(&self) -> ChannelKey {
        self.channel_key
    }

    /// One-way hash of the channel key, safe to announce on the overlay.
    #[must_use]
    pub const fn discovery_key(&self) -> [u8; 32] {
        self.discovery
    }

    /// The metadata log.
    #[must_use]
    pub fn meta(&self) -> Arc<Log> {
        Arc::clone(&self.meta)
    }

    /// The paired blob log, once its key is known from the header entry.
    #[must_use]
    pub fn blobs(&self) -> Option<Arc<Log>> {
        self.blobs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Whether this node can write to the drive.
    #[must_use]
    pub const fn writable(&self) -> bool {
        self.blobs_secret.is_some()
    }

    /// Fold any newly arrived metadata entries into the path index and
    /// initialise the blob log once the header is present.
    ///
    /// # Errors
    ///
    /// Returns an error when a log read fails or a record cannot be decoded.
    pub fn refresh(&self) -> Result<()> {
        self.init_blobs()?;

        let mut index = self.write_index();
        while index.folded < self.meta.length() {
            let at = index.folded;
            let Some(payload) = self.meta.get(at)? else {
                break;
            };
            let record: MetaRecord = serde_json::from_slice(&payload)
                .map_err(|source| CoreError::encoding("drive.record", source))?;
            match record {
                MetaRecord::Put { path, blob } => {
                    index.entries.insert(path, blob);
                }
                MetaRecord::Del { path } => {
                    index.entries.remove(&path);
                }
            }
            index.folded = at + 1;
        }
        Ok(())
    }

    /// Resolve the blob descriptor stored at `path`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when the path is invalid or the index cannot fold.
    pub fn entry(&self, path: &str) -> Result<Option<BlobDescriptor>> {
        validate_path(path)?;
        self.refresh()?;
        Ok(self
            .index
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entries
            .get(path)
            .copied())
    }

    /// Resolve `path`, waiting up to `timeout` for the entry to replicate.
    ///
    /// Falls back to the plain non-waiting read when the wait elapses.
    ///
    /// # Errors
    ///
    /// Returns an error when the path is invalid or the index cannot fold.
    pub async fn entry_wait(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<BlobDescriptor>> {
        if let Some(blob) = self.entry(path)? {
            return Ok(Some(blob));
        }

        let mut updates = self.meta.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(path, "entry wait elapsed; falling back to local read");
                return self.entry(path);
            }
            match tokio::time::timeout(remaining, updates.recv()).await {
                Ok(Ok(_)) | Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {
                    if let Some(blob) = self.entry(path)? {
                        return Ok(Some(blob));
                    }
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) | Err(_) => {
                    return self.entry(path);
                }
            }
        }
    }

    /// List the `(path, blob)` pairs whose path starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot fold.
    pub fn entries_under(&self, prefix: &str) -> Result<Vec<(String, BlobDescriptor)>> {
        self.refresh()?;
        let index = self
            .index
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(index
            .entries
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, blob)| (path.clone(), *blob))
            .collect())
    }

    /// Write a file into an owner drive, chunking its bytes into the blob
    /// log and recording the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] for reader drives, or a storage or
    /// encoding error.
    pub fn write_file(&self, path: &str, bytes: &[u8]) -> Result<BlobDescriptor> {
        validate_path(path)?;
        let blobs = self.blobs().ok_or(CoreError::ReadOnly)?;
        if !blobs.writable() {
            return Err(CoreError::ReadOnly);
        }

        let byte_offset = blobs.total_bytes();
        let block_offset = blobs.length();
        let mut block_length = 0_u64;
        for chunk in bytes.chunks(DEFAULT_BLOCK_SIZE) {
            blobs.append(chunk)?;
            block_length += 1;
        }

        let blob = BlobDescriptor {
            block_offset,
            block_length,
            byte_length: bytes.len() as u64,
            byte_offset,
        };
        let record = MetaRecord::Put {
            path: path.to_string(),
            blob,
        };
        let payload = serde_json::to_vec(&record)
            .map_err(|source| CoreError::encoding("drive.record", source))?;
        self.meta.append(&payload)?;
        self.refresh()?;
        Ok(blob)
    }

    /// Remove a file from an owner drive.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] for reader drives, or a storage or
    /// encoding error.
    pub fn remove_file(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        if !self.writable() {
            return Err(CoreError::ReadOnly);
        }
        let record = MetaRecord::Del {
            path: path.to_string(),
        };
        let payload = serde_json::to_vec(&record)
            .map_err(|source| CoreError::encoding("drive.record", source))?;
        self.meta.append(&payload)?;
        self.refresh()
    }

    /// Read a file from locally present blocks only.
    ///
    /// Returns `None` when the entry is missing or any block of its range has
    /// not replicated yet.
    ///
    /// # Errors
    ///
    /// Returns an error when the path is invalid or a block read fails.
    pub fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let Some(blob) = self.entry(path)? else {
            return Ok(None);
        };
        let Some(blobs) = self.blobs() else {
            return Ok(None);
        };

        let mut bytes = Vec::with_capacity(usize::try_from(blob.byte_length).unwrap_or(0));
        for index in blob.block_offset..blob.block_end() {
            let Some(block) = blobs.get(index)? else {
                return Ok(None);
            };
            bytes.extend_from_slice(&block);
        }
        Ok(Some(bytes))
    }

    /// Storage directory of this drive.
    #[must_use]
    pub fn storage_dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn init_blobs(&self) -> Result<()> {
        if self.blobs().is_some() || !self.meta.has(0) {
            return Ok(());
        }
        let Some(payload) = self.meta.get(0)? else {
            return Ok(());
        };
        let header: DriveHeader = serde_json::from_slice(&payload)
            .map_err(|source| CoreError::encoding("drive.header", source))?;
        let mut key = [0_u8; 32];
        hex::decode_to_slice(&header.blobs_key, &mut key)
            .map_err(|_| CoreError::internal("drive header carries a malformed blob key"))?;

        let blobs = Log::open(
            self.dir.join("blobs"),
            &key,
            self.blobs_secret.clone(),
        )?;
        *self
            .blobs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(blobs);
        Ok(())
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, PathIndex> {
        self.index
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Drive {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Drive")
            .field("channel_key", &self.channel_key)
            .field("writable", &self.writable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_writes_header_and_files_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let (drive, _keys) = Drive::create(dir.path()).expect("drive creates");

        assert!(drive.writable());
        assert!(drive.blobs().is_some());

        let payload = vec![7_u8; DEFAULT_BLOCK_SIZE + 10];
        let blob = drive
            .write_file("/videos/demo.bin", &payload)
            .expect("file writes");
        assert_eq!(blob.block_length, 2);
        assert_eq!(blob.byte_length, payload.len() as u64);
        assert_eq!(blob.block_offset, 0);

        let read = drive
            .read_file("/videos/demo.bin")
            .expect("file reads")
            .expect("file present");
        assert_eq!(read, payload);
    }

    #[test]
    fn byte_offsets_accumulate_across_files() {
        let dir = TempDir::new().expect("tempdir");
        let (drive, _keys) = Drive::create(dir.path()).expect("drive creates");

        drive.write_file("/a", b"12345").expect("first write");
        let second = drive.write_file("/b", b"678").expect("second write");
        assert_eq!(second.byte_offset, 5);
        assert_eq!(second.block_offset, 1);
    }

    #[test]
    fn delete_removes_the_entry() {
        let dir = TempDir::new().expect("tempdir");
        let (drive, _keys) = Drive::create(dir.path()).expect("drive creates");

        drive.write_file("/gone", b"bytes").expect("write");
        drive.remove_file("/gone").expect("remove");
        assert!(drive.entry("/gone").expect("entry resolves").is_none());
    }

    #[test]
    fn entries_under_filters_by_prefix() {
        let dir = TempDir::new().expect("tempdir");
        let (drive, _keys) = Drive::create(dir.path()).expect("drive creates");

        drive.write_file("/videos/a.json", b"{}").expect("write");
        drive.write_file("/videos/b.json", b"{}").expect("write");
        drive.write_file("/channel.json", b"{}").expect("write");

        let videos = drive.entries_under("/videos/").expect("listing");
        assert_eq!(videos.len(), 2);
    }

    #[test]
    fn reader_drive_follows_replicated_records() {
        let dir = TempDir::new().expect("tempdir");
        let (owner, keys) = Drive::create(dir.path().join("owner")).expect("drive creates");
        owner.write_file("/hello", b"world").expect("write");

        let channel = keys.channel_key().expect("channel key");
        let reader =
            Drive::open(dir.path().join("reader"), channel, None).expect("reader opens");
        assert!(!reader.writable());
        assert!(reader.blobs().is_none(), "header not replicated yet");

        // Replay the owner's logs the way replication would.
        let owner_meta = owner.meta();
        let reader_meta = reader.meta();
        for index in 0..owner_meta.length() {
            let (payload, signature) = owner_meta
                .get_with_signature(index)
                .expect("owner block reads")
                .expect("owner block present");
            reader_meta
                .insert(index, &payload, &signature)
                .expect("reader accepts block");
        }
        assert!(reader.entry("/hello").expect("entry resolves").is_some());
        assert!(reader.blobs().is_some(), "header initialises the blob log");

        let owner_blobs = owner.blobs().expect("owner blobs");
        let reader_blobs = reader.blobs().expect("reader blobs");
        for index in 0..owner_blobs.length() {
            let (payload, signature) = owner_blobs
                .get_with_signature(index)
                .expect("owner blob reads")
                .expect("owner blob present");
            reader_blobs
                .insert(index, &payload, &signature)
                .expect("reader accepts blob");
        }
        assert_eq!(
            reader.read_file("/hello").expect("file reads"),
            Some(b"world".to_vec())
        );
    }

    #[tokio::test]
    async fn entry_wait_falls_back_after_timeout() {
        let dir = TempDir::new().expect("tempdir");
        let (drive, _keys) = Drive::create(dir.path()).expect("drive creates");
        let blob = drive
            .entry_wait("/missing", Duration::from_millis(50))
            .await
            .expect("wait resolves");
        assert!(blob.is_none());
    }
}
