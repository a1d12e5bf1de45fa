//! Seed registry bounded by a storage quota.
//!
//! Tracks which files this node has pledged to serve. Quota overflow evicts
//! by `(priority, added_at)` ascending; pinned seeds are never evicted, so a
//! node whose pinned content alone exceeds the quota stays over it. The
//! manager revokes pledges only; it never deletes physical blocks.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use peartube_core::store::{KEY_ACTIVE_SEEDS, KEY_PINNED_CHANNELS, KEY_SEEDING_CONFIG};
use peartube_core::{
    ChannelKey, NodeStore, Result, SeedReason, SeedRecord, SeedingConfig, SeedingConfigPatch,
    epoch_ms_now,
};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Shape of one byte-count accounting entry handed to [`SeedingManager::add_seed`].
#[derive(Debug, Clone, Copy)]
pub struct SeedSize {
    /// Number of blob blocks the file spans.
    pub block_count: u64,
    /// Total size of the file in bytes.
    pub byte_count: u64,
}

/// Aggregate view returned by [`SeedingManager::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedingStatus {
    /// Number of active seed pledges.
    pub active_seeds: usize,
    /// Channels whose seeds are never evicted.
    pub pinned_channels: Vec<ChannelKey>,
    /// Bytes currently pledged.
    pub storage_used_bytes: u64,
    /// Quota in gigabytes.
    pub max_storage_gb: u64,
    /// Full configuration.
    pub config: SeedingConfig,
    /// Per-seed listing.
    pub seeds: Vec<SeedListing>,
}

/// One row of the seed listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedListing {
    /// Channel the seed belongs to.
    pub channel_key: ChannelKey,
    /// Drive path of the seeded file.
    pub path: String,
    /// Why the pledge exists.
    pub reason: SeedReason,
    /// Pledged bytes.
    pub bytes: u64,
    /// When the pledge was made, epoch milliseconds.
    pub added_at: i64,
}

struct SeedingState {
    config: SeedingConfig,
    pinned: HashSet<ChannelKey>,
    seeds: HashMap<(ChannelKey, String), SeedRecord>,
}

/// Persistent registry of seed pledges.
pub struct SeedingManager {
    store: NodeStore,
    state: Mutex<SeedingState>,
}

impl SeedingManager {
    /// Load configuration, pinned channels, and active seeds from the store.
    ///
    /// # Errors
    ///
    /// Returns an error when a persisted document cannot be loaded.
    pub fn init(store: NodeStore) -> Result<Self> {
        let config = store
            .get::<SeedingConfig>(KEY_SEEDING_CONFIG)?
            .unwrap_or_default();
        let pinned: HashSet<ChannelKey> = store
            .get::<Vec<ChannelKey>>(KEY_PINNED_CHANNELS)?
            .unwrap_or_default()
            .into_iter()
            .collect();
        let seeds = store
            .get::<Vec<SeedRecord>>(KEY_ACTIVE_SEEDS)?
            .unwrap_or_default()
            .into_iter()
            .map(|record| ((record.channel_key, record.path.clone()), record))
            .collect();
        Ok(Self {
            store,
            state: Mutex::new(SeedingState {
                config,
                pinned,
                seeds,
            }),
        })
    }

    /// Register a seed pledge. Returns false when the pledge is suppressed by
    /// configuration or already present.
    ///
    /// # Errors
    ///
    /// Returns an error when persistence fails.
    pub fn add_seed(
        &self,
        channel_key: ChannelKey,
        path: &str,
        reason: SeedReason,
        size: SeedSize,
    ) -> Result<bool> {
        {
            let mut state = self.lock_state();
            match reason {
                SeedReason::Watched if !state.config.auto_seed_watched => return Ok(false),
                SeedReason::Subscribed if !state.config.auto_seed_subscribed => return Ok(false),
                _ => {}
            }
            let slot = (channel_key, path.to_string());
            if state.seeds.contains_key(&slot) {
                return Ok(false);
            }
            state.seeds.insert(
                slot,
                SeedRecord {
                    channel_key,
                    path: path.to_string(),
                    reason,
                    added_at: epoch_ms_now(),
                    block_count: size.block_count,
                    byte_count: size.byte_count,
                },
            );
            self.persist_seeds(&state)?;
        }
        info!(channel = %channel_key, path, ?reason, "seed registered");
        self.enforce_quota()?;
        Ok(true)
    }

    /// Drop a seed pledge. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when persistence fails.
    pub fn remove_seed(&self, channel_key: ChannelKey, path: &str) -> Result<()> {
        let mut state = self.lock_state();
        if state
            .seeds
            .remove(&(channel_key, path.to_string()))
            .is_some()
        {
            self.persist_seeds(&state)?;
            debug!(channel = %channel_key, path, "seed removed");
        }
        Ok(())
    }

    /// Pin a channel: its seeds are never evicted by quota.
    ///
    /// # Errors
    ///
    /// Returns an error when persistence fails.
    pub fn pin(&self, channel_key: ChannelKey) -> Result<()> {
        let mut state = self.lock_state();
        if state.pinned.insert(channel_key) {
            self.persist_pinned(&state)?;
        }
        Ok(())
    }

    /// Unpin a channel. Affects only the pinned-channel set.
    ///
    /// # Errors
    ///
    /// Returns an error when persistence fails.
    pub fn unpin(&self, channel_key: ChannelKey) -> Result<()> {
        let mut state = self.lock_state();
        if state.pinned.remove(&channel_key) {
            self.persist_pinned(&state)?;
        }
        Ok(())
    }

    /// The pinned-channel set.
    #[must_use]
    pub fn pinned_channels(&self) -> Vec<ChannelKey> {
        let mut pinned: Vec<ChannelKey> = self.lock_state().pinned.iter().copied().collect();
        pinned.sort();
        pinned
    }

    /// Whether a channel is pinned.
    #[must_use]
    pub fn is_pinned(&self, channel_key: ChannelKey) -> bool {
        self.lock_state().pinned.contains(&channel_key)
    }

    /// Merge and persist a configuration patch.
    ///
    /// # Errors
    ///
    /// Returns an error when persistence fails.
    pub fn set_config(&self, patch: SeedingConfigPatch) -> Result<SeedingConfig> {
        let config = {
            let mut state = self.lock_state();
            state.config.apply(patch);
            self.store.put(KEY_SEEDING_CONFIG, &state.config)?;
            state.config.clone()
        };
        self.enforce_quota()?;
        Ok(config)
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> SeedingConfig {
        self.lock_state().config.clone()
    }

    /// Bytes currently pledged.
    #[must_use]
    pub fn storage_used(&self) -> u64 {
        self.lock_state()
            .seeds
            .values()
            .map(|seed| seed.byte_count)
            .sum()
    }

    /// Aggregate status for the control plane.
    #[must_use]
    pub fn status(&self) -> SeedingStatus {
        let state = self.lock_state();
        let mut seeds: Vec<SeedListing> = state
            .seeds
            .values()
            .map(|record| SeedListing {
                channel_key: record.channel_key,
                path: record.path.clone(),
                reason: record.reason,
                bytes: record.byte_count,
                added_at: record.added_at,
            })
            .collect();
        seeds.sort_by(|a, b| a.added_at.cmp(&b.added_at));
        let mut pinned: Vec<ChannelKey> = state.pinned.iter().copied().collect();
        pinned.sort();
        SeedingStatus {
            active_seeds: state.seeds.len(),
            pinned_channels: pinned,
            storage_used_bytes: state.seeds.values().map(|seed| seed.byte_count).sum(),
            max_storage_gb: state.config.max_storage_gb,
            config: state.config.clone(),
            seeds,
        }
    }

    /// Evict seeds until the pledge total fits the quota.
    ///
    /// Eviction order is `(priority, added_at)` ascending; pinned seeds are
    /// skipped. Persists once at the end.
    ///
    /// # Errors
    ///
    /// Returns an error when persistence fails.
    pub fn enforce_quota(&self) -> Result<usize> {
        let mut state = self.lock_state();
        let max_bytes = state.config.max_bytes();
        let mut current_bytes: u64 = state.seeds.values().map(|seed| seed.byte_count).sum();
        if current_bytes <= max_bytes {
            return Ok(0);
        }

        let mut ordered: Vec<(ChannelKey, String, SeedReason, i64, u64)> = state
            .seeds
            .values()
            .map(|seed| {
                (
                    seed.channel_key,
                    seed.path.clone(),
                    seed.reason,
                    seed.added_at,
                    seed.byte_count,
                )
            })
            .collect();
        ordered.sort_by(|a, b| (a.2.priority(), a.3).cmp(&(b.2.priority(), b.3)));

        let mut evicted = 0_usize;
        for (channel_key, path, reason, _added_at, byte_count) in ordered {
            if current_bytes <= max_bytes {
                break;
            }
            if reason == SeedReason::Pinned {
                continue;
            }
            state.seeds.remove(&(channel_key, path.clone()));
            current_bytes -= byte_count;
            evicted += 1;
            info!(channel = %channel_key, path, bytes = byte_count, "seed evicted by quota");
        }

        if current_bytes > max_bytes {
            warn!(
                used = current_bytes,
                quota = max_bytes,
                "pinned seeds keep the node over quota"
            );
        }
        self.persist_seeds(&state)?;
        Ok(evicted)
    }

    fn persist_seeds(&self, state: &SeedingState) -> Result<()> {
        let records: Vec<&SeedRecord> = state.seeds.values().collect();
        self.store.put(KEY_ACTIVE_SEEDS, &records)
    }

    fn persist_pinned(&self, state: &SeedingState) -> Result<()> {
        let pinned: Vec<ChannelKey> = state.pinned.iter().copied().collect();
        self.store.put(KEY_PINNED_CHANNELS, &pinned)
    }

    fn lock_state(&self) -> MutexGuard<'_, SeedingState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    fn key(byte: u8) -> ChannelKey {
        ChannelKey::from_bytes([byte; 32])
    }

    fn size(bytes: u64) -> SeedSize {
        SeedSize {
            block_count: bytes / MB,
            byte_count: bytes,
        }
    }

    fn manager(dir: &TempDir) -> SeedingManager {
        SeedingManager::init(NodeStore::new(dir.path())).expect("manager initialises")
    }

    #[test]
    fn defaults_load_when_nothing_is_persisted() {
        let dir = TempDir::new().expect("tempdir");
        let seeding = manager(&dir);
        let config = seeding.config();
        assert_eq!(config.max_storage_gb, 10);
        assert!(config.auto_seed_watched);
        assert!(!config.auto_seed_subscribed);
        assert_eq!(config.max_videos_per_channel, 10);
    }

    #[test]
    fn add_seed_dedupes_and_respects_config_gates() {
        let dir = TempDir::new().expect("tempdir");
        let seeding = manager(&dir);

        assert!(
            seeding
                .add_seed(key(1), "/videos/a.mp4", SeedReason::Watched, size(MB))
                .expect("add succeeds")
        );
        assert!(
            !seeding
                .add_seed(key(1), "/videos/a.mp4", SeedReason::Watched, size(MB))
                .expect("duplicate is refused")
        );
        assert!(
            !seeding
                .add_seed(key(2), "/videos/b.mp4", SeedReason::Subscribed, size(MB))
                .expect("subscribed gate applies")
        );

        seeding
            .set_config(SeedingConfigPatch {
                auto_seed_watched: Some(false),
                ..SeedingConfigPatch::default()
            })
            .expect("config updates");
        assert!(
            !seeding
                .add_seed(key(3), "/videos/c.mp4", SeedReason::Watched, size(MB))
                .expect("watched gate applies")
        );
    }

    #[test]
    fn state_survives_reinitialisation() {
        let dir = TempDir::new().expect("tempdir");
        {
            let seeding = manager(&dir);
            seeding
                .add_seed(key(1), "/videos/a.mp4", SeedReason::Watched, size(5 * MB))
                .expect("add succeeds");
            seeding.pin(key(9)).expect("pin persists");
        }
        let seeding = manager(&dir);
        assert_eq!(seeding.status().active_seeds, 1);
        assert!(seeding.is_pinned(key(9)));
        assert_eq!(seeding.storage_used(), 5 * MB);
    }

    #[test]
    fn quota_evicts_older_watched_first_and_never_pinned() {
        let dir = TempDir::new().expect("tempdir");
        let seeding = manager(&dir);
        seeding
            .set_config(SeedingConfigPatch {
                max_storage_gb: Some(1),
                ..SeedingConfigPatch::default()
            })
            .expect("config updates");

        // Scenario: A(watched, 500 MB, oldest), B(watched, 500 MB),
        // C(pinned, 600 MB) pushes the total over the 1 GB quota. The sleeps
        // keep the millisecond timestamps strictly ordered.
        seeding
            .add_seed(key(0xa), "/videos/a.mp4", SeedReason::Watched, size(500 * MB))
            .expect("add A");
        std::thread::sleep(std::time::Duration::from_millis(5));
        seeding
            .add_seed(key(0xb), "/videos/b.mp4", SeedReason::Watched, size(500 * MB))
            .expect("add B");
        std::thread::sleep(std::time::Duration::from_millis(5));
        seeding
            .add_seed(key(0xc), "/videos/c.mp4", SeedReason::Pinned, size(600 * MB))
            .expect("add C");

        let status = seeding.status();
        assert_eq!(status.active_seeds, 2);
        let paths: Vec<&str> = status.seeds.iter().map(|seed| seed.path.as_str()).collect();
        assert!(!paths.contains(&"/videos/a.mp4"), "oldest watched evicted");
        assert!(paths.contains(&"/videos/b.mp4"));
        assert!(paths.contains(&"/videos/c.mp4"), "pinned survives");
        // 1.1 GB remains: tolerated because the overflow is pinned.
        assert_eq!(status.storage_used_bytes, 1_100 * MB);
    }

    #[test]
    fn quota_stops_once_under_the_limit() {
        let dir = TempDir::new().expect("tempdir");
        let seeding = manager(&dir);
        seeding
            .set_config(SeedingConfigPatch {
                max_storage_gb: Some(1),
                ..SeedingConfigPatch::default()
            })
            .expect("config updates");

        for (index, bytes) in [(1_u8, 400 * MB), (2, 400 * MB), (3, 400 * MB)] {
            seeding
                .add_seed(
                    key(index),
                    &format!("/videos/{index}.mp4"),
                    SeedReason::Watched,
                    size(bytes),
                )
                .expect("add succeeds");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let status = seeding.status();
        assert_eq!(status.active_seeds, 2, "one eviction suffices");
        assert!(status.storage_used_bytes <= 1 << 30);
    }

    #[test]
    fn remove_seed_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let seeding = manager(&dir);
        seeding
            .add_seed(key(1), "/videos/a.mp4", SeedReason::Watched, size(MB))
            .expect("add succeeds");
        seeding.remove_seed(key(1), "/videos/a.mp4").expect("remove");
        seeding.remove_seed(key(1), "/videos/a.mp4").expect("noop remove");
        assert_eq!(seeding.status().active_seeds, 0);
    }

    #[test]
    fn unpin_only_touches_the_pinned_set() {
        let dir = TempDir::new().expect("tempdir");
        let seeding = manager(&dir);
        seeding
            .add_seed(key(5), "/videos/p.mp4", SeedReason::Pinned, size(MB))
            .expect("add succeeds");
        seeding.pin(key(5)).expect("pin");
        seeding.unpin(key(5)).expect("unpin");
        assert!(seeding.pinned_channels().is_empty());
        assert_eq!(seeding.status().active_seeds, 1, "seed record remains");
    }
}
