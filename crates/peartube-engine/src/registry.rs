//! Single source of truth for open drives.
//!
//! The registry bridges a channel key to its I/O: it opens at most one drive
//! per key, registers every drive for replication, joins the overlay topic
//! derived from the drive's discovery key, and offers a bounded,
//! non-blocking sync wait.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use peartube_core::{ChannelKey, Result};
use peartube_drive::{Drive, DriveKeys, ReplicatorSet};
use peartube_swarm::SwarmHost;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default bounded wait for a metadata sync.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for [`DriveRegistry::open`].
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Trigger a bounded metadata sync before returning.
    pub wait_for_sync: bool,
    /// Budget for the sync wait.
    pub sync_timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            wait_for_sync: false,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }
}

/// Owns the per-channel drive handles.
pub struct DriveRegistry {
    storage_dir: PathBuf,
    swarm: Arc<SwarmHost>,
    replicator: Arc<ReplicatorSet>,
    identity: Option<DriveKeys>,
    drives: Mutex<HashMap<ChannelKey, Arc<Drive>>>,
}

impl DriveRegistry {
    /// Construct a registry storing drives under `storage_dir`.
    ///
    /// `identity` carries the owner key material of the local channel, when
    /// one exists; opening that channel yields a writable drive.
    #[must_use]
    pub fn new(
        storage_dir: impl Into<PathBuf>,
        swarm: &Arc<SwarmHost>,
        identity: Option<DriveKeys>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage_dir: storage_dir.into(),
            replicator: swarm.replicator(),
            swarm: Arc::clone(swarm),
            identity,
            drives: Mutex::new(HashMap::new()),
        })
    }

    /// Open (or return the already open) drive for `key`.
    ///
    /// A fresh open constructs the drive, registers it for replication,
    /// joins the overlay topic under its discovery key, and waits for the
    /// join to flush. Sync-wait timeouts are swallowed: the caller continues
    /// with whatever state is available.
    ///
    /// # Errors
    ///
    /// Returns an error when drive storage cannot be prepared.
    pub async fn open(&self, key: ChannelKey, options: OpenOptions) -> Result<Arc<Drive>> {
        let (drive, fresh) = {
            let mut drives = self.drives.lock().await;
            if let Some(existing) = drives.get(&key) {
                (Arc::clone(existing), false)
            } else {
                let keys = self
                    .identity
                    .as_ref()
                    .filter(|keys| keys.channel_key().is_ok_and(|own| own == key));
                let drive = Drive::open(&self.storage_dir, key, keys)?;
                self.replicator.add_drive(&drive);
                drives.insert(key, Arc::clone(&drive));
                (drive, true)
            }
        };

        if fresh {
            // Announce ourselves under the drive topic before handing the
            // drive out, so peers can find us as soon as we return.
            let join = self.swarm.join(drive.discovery_key());
            join.flushed().await?;
            info!(channel = %key, writable = drive.writable(), "drive opened");
        }

        if options.wait_for_sync {
            self.sync_wait(&drive, options.sync_timeout).await;
        }
        Ok(drive)
    }

    /// Create a new owner drive, join its topic, and return the key material.
    ///
    /// # Errors
    ///
    /// Returns an error when drive storage cannot be prepared.
    pub async fn create(&self) -> Result<(Arc<Drive>, ChannelKey, DriveKeys)> {
        let (drive, keys) = Drive::create(&self.storage_dir)?;
        let key = drive.channel_key();
        {
            let mut drives = self.drives.lock().await;
            drives.insert(key, Arc::clone(&drive));
        }
        self.replicator.add_drive(&drive);
        self.swarm.join(drive.discovery_key()).flushed().await?;
        info!(channel = %key, "owner drive created");
        Ok((drive, key, keys))
    }

    /// Already-open drive for `key`, if any. Never constructs.
    pub async fn get_open(&self, key: ChannelKey) -> Option<Arc<Drive>> {
        self.drives.lock().await.get(&key).cloned()
    }

    /// Trigger a metadata update with a bounded wait.
    ///
    /// Resolves as soon as newer metadata folds in or every polled peer
    /// reports nothing newer; without peers it returns immediately. This is
    /// an observational helper, not a blocker: a timeout leaves the drive in
    /// whatever state replication has reached.
    pub async fn sync_wait(&self, drive: &Arc<Drive>, timeout: Duration) {
        if self.replicator.connection_count() == 0 {
            return;
        }

        let meta = drive.meta();
        let discovery = drive.discovery_key();
        let length_before = meta.length();
        let mut updates = meta.subscribe();
        let mut haves = self.replicator.subscribe_haves();
        self.replicator.request_update(&discovery);

        let waited = tokio::time::timeout(timeout, async {
            loop {
                if meta.length() > length_before {
                    return;
                }
                tokio::select! {
                    update = updates.recv() => {
                        if update.is_err() {
                            return;
                        }
                    }
                    have = haves.recv() => match have {
                        Ok((key, remote_length))
                            if key == discovery && remote_length <= meta.length() =>
                        {
                            // The peer has nothing newer; the wait is over.
                            return;
                        }
                        Ok(_) => {}
                        Err(_) => return,
                    },
                }
            }
        })
        .await;

        if waited.is_err() {
            debug!(channel = %drive.channel_key(), "sync wait elapsed without an update");
        } else if let Err(error) = drive.refresh() {
            debug!(channel = %drive.channel_key(), error = %error, "failed to fold synced metadata");
        }
    }

    /// Find the blob log whose public key is `blobs_key` among open drives.
    pub async fn blob_log(
        &self,
        blobs_key: &[u8; 32],
    ) -> Option<Arc<peartube_drive::Log>> {
        let drives = self.drives.lock().await;
        drives
            .values()
            .filter_map(|drive| drive.blobs())
            .find(|log| &log.public_key() == blobs_key)
    }

    /// The replication set drives are registered with.
    #[must_use]
    pub fn replicator(&self) -> Arc<ReplicatorSet> {
        Arc::clone(&self.replicator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peartube_core::NodeStore;
    use peartube_events::EventBus;
    use peartube_swarm::FeedGossip;
    use tempfile::TempDir;

    fn build_swarm(dir: &std::path::Path) -> Arc<SwarmHost> {
        let feed = Arc::new(
            FeedGossip::new(NodeStore::new(dir), EventBus::with_capacity(16))
                .expect("gossip constructs"),
        );
        SwarmHost::new("00".repeat(32), ReplicatorSet::new(), feed)
    }

    #[tokio::test]
    async fn second_open_returns_the_first_handle() {
        let dir = TempDir::new().expect("tempdir");
        let swarm = build_swarm(&dir.path().join("state"));
        let registry = DriveRegistry::new(dir.path().join("drives"), &swarm, None);

        let key = ChannelKey::from_bytes([0x5a; 32]);
        let first = registry
            .open(key, OpenOptions::default())
            .await
            .expect("first open");
        let second = registry
            .open(key, OpenOptions::default())
            .await
            .expect("second open");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn create_yields_a_writable_registered_drive() {
        let dir = TempDir::new().expect("tempdir");
        let swarm = build_swarm(&dir.path().join("state"));
        let registry = DriveRegistry::new(dir.path().join("drives"), &swarm, None);

        let (drive, key, keys) = registry.create().await.expect("create succeeds");
        assert!(drive.writable());
        assert_eq!(keys.channel_key().expect("channel key"), key);
        assert!(registry.get_open(key).await.is_some());
    }

    #[tokio::test]
    async fn identity_keys_make_the_own_channel_writable() {
        let dir = TempDir::new().expect("tempdir");
        let swarm = build_swarm(&dir.path().join("state"));

        let keys = DriveKeys::generate();
        let key = keys.channel_key().expect("channel key");
        let registry = DriveRegistry::new(dir.path().join("drives"), &swarm, Some(keys));

        let drive = registry
            .open(key, OpenOptions::default())
            .await
            .expect("open succeeds");
        assert!(drive.writable());

        let other = registry
            .open(ChannelKey::from_bytes([0x77; 32]), OpenOptions::default())
            .await
            .expect("open succeeds");
        assert!(!other.writable());
    }

    #[tokio::test]
    async fn sync_wait_swallows_the_timeout() {
        let dir = TempDir::new().expect("tempdir");
        let swarm = build_swarm(&dir.path().join("state"));
        let registry = DriveRegistry::new(dir.path().join("drives"), &swarm, None);

        let drive = registry
            .open(
                ChannelKey::from_bytes([0x31; 32]),
                OpenOptions {
                    wait_for_sync: true,
                    sync_timeout: Duration::from_millis(50),
                },
            )
            .await
            .expect("open succeeds despite no peers");
        assert_eq!(drive.meta().length(), 0);
    }

    #[tokio::test]
    async fn blob_log_lookup_matches_by_key() {
        let dir = TempDir::new().expect("tempdir");
        let swarm = build_swarm(&dir.path().join("state"));
        let registry = DriveRegistry::new(dir.path().join("drives"), &swarm, None);

        let (drive, _key, _keys) = registry.create().await.expect("create succeeds");
        let blobs = drive.blobs().expect("blob log");
        let found = registry
            .blob_log(&blobs.public_key())
            .await
            .expect("lookup succeeds");
        assert_eq!(found.public_key(), blobs.public_key());
        assert!(registry.blob_log(&[0xff; 32]).await.is_none());
    }
}
