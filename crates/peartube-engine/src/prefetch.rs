//! Block-level prefetch with live progress.
//!
//! For a `(channel, path)` request the engine resolves the file to its blob
//! block range, counts what is already local, and downloads the rest while an
//! attached monitor streams progress to the event bus. Completion registers
//! the file as a `watched` seed exactly once, turning the viewer into a
//! seeder. Monitors are owned here and released on a timer after completion;
//! a replacing prefetch implicitly detaches its predecessor.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use peartube_core::{
    BlobDescriptor, ChannelKey, CoreError, Result, SeedReason, VideoStats, VideoStatus,
    epoch_ms_now, validate_path,
};
use peartube_drive::{Drive, DriveMonitor, LogId, MonitorSnapshot};
use peartube_events::{Event, EventBus};
use peartube_swarm::SwarmHost;
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::registry::{DriveRegistry, OpenOptions};
use crate::seeding::{SeedSize, SeedingManager};

/// Sync budget for drive opens triggered by a prefetch.
const PREFETCH_SYNC_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-block budget of the salvage pass.
const SALVAGE_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// The salvage pass re-requests at most this many missing blocks.
const SALVAGE_BLOCK_LIMIT: usize = 50;
/// How long a monitor outlives completion to serve late stats queries.
const MONITOR_RELEASE_DELAY: Duration = Duration::from_secs(30);

/// Immediate answer to a prefetch request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchReport {
    /// Every block was already local.
    pub cached: bool,
    /// Blocks in the file's blob range.
    pub total_blocks: u64,
    /// Total size of the file in bytes.
    pub total_bytes: u64,
    /// Peers observed at request time.
    pub peer_count: usize,
    /// Blocks already local when the download was issued; absent for cached
    /// answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_blocks: Option<u64>,
}

type PairKey = (ChannelKey, String);

struct TrackEntry {
    stats: VideoStats,
    epoch: u64,
    seeded: bool,
    last_logged_decile: u8,
    tasks: Vec<AbortHandle>,
}

/// Downloads file ranges and tracks their progress.
pub struct PrefetchEngine {
    registry: Arc<DriveRegistry>,
    swarm: Arc<SwarmHost>,
    seeding: Arc<SeedingManager>,
    events: EventBus,
    entries: Mutex<HashMap<PairKey, TrackEntry>>,
    next_epoch: AtomicU64,
}

impl PrefetchEngine {
    /// Construct the engine over its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<DriveRegistry>,
        swarm: Arc<SwarmHost>,
        seeding: Arc<SeedingManager>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            swarm,
            seeding,
            events,
            entries: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
        })
    }

    /// Ensure every blob block of `(channel_key, file_path)` is locally
    /// present.
    ///
    /// Returns immediately once the range is resolved; the download proceeds
    /// asynchronously with progress on the event bus.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey`/`InvalidPath` for malformed input, `NotFound`
    /// when the file entry is missing or blob-less, and surfaces drive-open
    /// failures. Failures also park the stats record in the `error` state.
    pub async fn prefetch(self: &Arc<Self>, channel_key: &str, file_path: &str) -> Result<PrefetchReport> {
        let channel = ChannelKey::parse(channel_key)?;
        validate_path(file_path)?;
        let pair = (channel, file_path.to_string());
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);

        {
            // An existing monitor for this pair is detached and replaced.
            let mut entries = self.lock_entries();
            if let Some(previous) = entries.remove(&pair) {
                debug!(channel = %channel, path = file_path, "replacing existing monitor");
                abort_all(previous.tasks);
            }
            entries.insert(
                pair.clone(),
                TrackEntry {
                    stats: VideoStats {
                        status: VideoStatus::Connecting,
                        started_at: epoch_ms_now(),
                        peer_count: self.swarm.connection_count(),
                        ..VideoStats::default()
                    },
                    epoch,
                    seeded: false,
                    last_logged_decile: 0,
                    tasks: Vec::new(),
                },
            );
        }

        match self.start(&pair, epoch).await {
            Ok(report) => Ok(report),
            Err(error) => {
                self.fail(&pair, epoch, &error.to_string());
                Err(error)
            }
        }
    }

    /// Stats for one pair. Never fails: unknown pairs (and malformed keys)
    /// yield a zeroed record with the swarm connection count.
    #[must_use]
    pub fn stats(&self, channel_key: &str, file_path: &str) -> VideoStats {
        let Ok(channel) = ChannelKey::parse(channel_key) else {
            return VideoStats::unknown(self.swarm.connection_count());
        };
        self.lock_entries()
            .get(&(channel, file_path.to_string()))
            .map_or_else(
                || VideoStats::unknown(self.swarm.connection_count()),
                |entry| entry.stats.clone(),
            )
    }

    async fn start(self: &Arc<Self>, pair: &PairKey, epoch: u64) -> Result<PrefetchReport> {
        let (channel, path) = pair;
        let drive = self
            .registry
            .open(
                *channel,
                OpenOptions {
                    wait_for_sync: true,
                    sync_timeout: PREFETCH_SYNC_TIMEOUT,
                },
            )
            .await?;
        self.mutate_stats(pair, epoch, |stats| stats.status = VideoStatus::Resolving);

        let blob = drive.entry(path)?.ok_or_else(|| CoreError::NotFound {
            path: path.clone(),
        })?;
        let blobs = drive
            .blobs()
            .ok_or_else(|| CoreError::internal("drive resolved an entry without its blob log"))?;

        let range = blob.block_offset..blob.block_end();
        let initial_blocks = blobs.present_in(range.clone());
        let peer_count = self.swarm.connection_count();
        self.mutate_stats(pair, epoch, |stats| {
            stats.total_blocks = blob.block_length;
            stats.total_bytes = blob.byte_length;
            stats.initial_blocks = initial_blocks;
            stats.downloaded_blocks = 0;
            stats.peer_count = peer_count;
        });
        self.emit_stats(pair);

        if initial_blocks == blob.block_length {
            self.mutate_stats(pair, epoch, |stats| stats.status = VideoStatus::Complete);
            self.emit_stats(pair);
            self.register_seed(pair, epoch, &blob);
            info!(channel = %channel, path, blocks = blob.block_length, "prefetch served from cache");
            return Ok(PrefetchReport {
                cached: true,
                total_blocks: blob.block_length,
                total_bytes: blob.byte_length,
                peer_count,
                initial_blocks: None,
            });
        }

        self.mutate_stats(pair, epoch, |stats| stats.status = VideoStatus::Downloading);
        let monitor =
            DriveMonitor::attach(&self.registry.replicator(), &drive, range.clone())?;

        let monitor_task = {
            let engine = Arc::clone(self);
            let pair = pair.clone();
            tokio::spawn(async move {
                engine.run_monitor(pair, epoch, monitor, blob).await;
            })
            .abort_handle()
        };
        let download_task = {
            let engine = Arc::clone(self);
            let pair = pair.clone();
            let drive = Arc::clone(&drive);
            tokio::spawn(async move {
                engine.run_download(pair, epoch, drive, blob, range).await;
            })
            .abort_handle()
        };
        self.track_tasks(pair, epoch, vec![monitor_task, download_task]);

        info!(
            channel = %channel,
            path,
            total = blob.block_length,
            initial = initial_blocks,
            "prefetch started"
        );
        Ok(PrefetchReport {
            cached: false,
            total_blocks: blob.block_length,
            total_bytes: blob.byte_length,
            peer_count,
            initial_blocks: Some(initial_blocks),
        })
    }

    async fn run_monitor(
        self: &Arc<Self>,
        pair: PairKey,
        epoch: u64,
        mut monitor: DriveMonitor,
        blob: BlobDescriptor,
    ) {
        while let Some(snapshot) = monitor.tick().await {
            if !self.apply_tick(&pair, epoch, &snapshot, &blob) {
                break;
            }
        }
    }

    /// Fold one monitor tick into the stats record. Returns false when the
    /// entry has been replaced and the monitor should stop.
    fn apply_tick(
        self: &Arc<Self>,
        pair: &PairKey,
        epoch: u64,
        snapshot: &MonitorSnapshot,
        blob: &BlobDescriptor,
    ) -> bool {
        let swarm_peers = self.swarm.connection_count();
        let mut completed = false;
        let mut milestone = None;
        {
            let mut entries = self.lock_entries();
            let Some(entry) = entries.get_mut(pair) else {
                return false;
            };
            if entry.epoch != epoch {
                return false;
            }

            let stats = &mut entry.stats;
            stats.downloaded_blocks = snapshot.blocks;
            stats.peer_count = if snapshot.peers > 0 {
                snapshot.peers
            } else {
                swarm_peers
            };
            stats.download_speed = snapshot.download_speed;
            stats.upload_speed = snapshot.upload_speed;
            let done = stats.initial_blocks + stats.downloaded_blocks >= blob.block_length;
            if done && stats.status != VideoStatus::Complete {
                stats.status = VideoStatus::Complete;
                completed = true;
            } else if !done {
                stats.status = VideoStatus::Downloading;
            }

            let decile = decile_of(stats.progress());
            if decile > entry.last_logged_decile {
                entry.last_logged_decile = decile;
                milestone = Some((decile, stats.clone()));
            }
        }

        if let Some((decile, stats)) = milestone {
            info!(
                channel = %pair.0,
                path = %pair.1,
                percent = u32::from(decile) * 10,
                blocks = stats.initial_blocks + stats.downloaded_blocks,
                total = stats.total_blocks,
                "prefetch progress"
            );
        }
        self.emit_stats(pair);
        if completed {
            self.register_seed(pair, epoch, blob);
            self.schedule_release(pair, epoch);
        }
        true
    }

    async fn run_download(
        self: &Arc<Self>,
        pair: PairKey,
        epoch: u64,
        drive: Arc<Drive>,
        blob: BlobDescriptor,
        range: Range<u64>,
    ) {
        let replicator = self.registry.replicator();
        if let Err(error) = replicator
            .download_range(&drive, LogId::Blobs, range.clone())
            .await
        {
            self.fail(&pair, epoch, &error.to_string());
            return;
        }

        // The range reported done; trust nothing and verify locally.
        let Some(blobs) = drive.blobs() else {
            self.fail(&pair, epoch, "blob log vanished during download");
            return;
        };
        let missing = blobs.missing_in(range.clone());
        if !missing.is_empty() {
            // Conservative salvage pass for blocks the range request lost.
            warn!(
                channel = %pair.0,
                path = %pair.1,
                missing = missing.len(),
                "range reported done with missing blocks; salvaging"
            );
            for index in missing.into_iter().take(SALVAGE_BLOCK_LIMIT) {
                match replicator
                    .download_block(&drive, LogId::Blobs, index, SALVAGE_BLOCK_TIMEOUT)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!(index, "salvage request timed out"),
                    Err(error) => {
                        debug!(index, error = %error, "salvage request failed");
                    }
                }
            }
        }

        let verified = blobs.present_in(range.clone());
        let complete = verified == blob.block_length;
        let mut newly_complete = false;
        {
            let mut entries = self.lock_entries();
            if let Some(entry) = entries.get_mut(&pair)
                && entry.epoch == epoch
            {
                if complete {
                    newly_complete = entry.stats.status != VideoStatus::Complete;
                    entry.stats.status = VideoStatus::Complete;
                    entry.stats.downloaded_blocks =
                        blob.block_length.saturating_sub(entry.stats.initial_blocks);
                } else {
                    // The caller may retry; leave the record downloading.
                    entry.stats.status = VideoStatus::Downloading;
                }
            }
        }
        self.emit_stats(&pair);

        if complete {
            info!(channel = %pair.0, path = %pair.1, blocks = verified, "prefetch complete");
            if newly_complete {
                self.register_seed(&pair, epoch, &blob);
            }
            self.schedule_release(&pair, epoch);
        } else {
            warn!(
                channel = %pair.0,
                path = %pair.1,
                verified,
                total = blob.block_length,
                "prefetch left incomplete after salvage"
            );
        }
    }

    /// Register the `watched` seed for a completed pair, at most once per
    /// tracked prefetch.
    fn register_seed(&self, pair: &PairKey, epoch: u64, blob: &BlobDescriptor) {
        {
            let mut entries = self.lock_entries();
            let Some(entry) = entries.get_mut(pair) else {
                return;
            };
            if entry.epoch != epoch || entry.seeded {
                return;
            }
            entry.seeded = true;
        }
        match self.seeding.add_seed(
            pair.0,
            &pair.1,
            SeedReason::Watched,
            SeedSize {
                block_count: blob.block_length,
                byte_count: blob.byte_length,
            },
        ) {
            Ok(true) => debug!(channel = %pair.0, path = %pair.1, "watched seed registered"),
            Ok(false) => debug!(channel = %pair.0, path = %pair.1, "watched seed suppressed"),
            Err(error) => {
                warn!(channel = %pair.0, path = %pair.1, error = %error, "seed registration failed");
            }
        }
    }

    /// Keep the monitor for a grace period after completion, then release it
    /// together with the stats record.
    fn schedule_release(self: &Arc<Self>, pair: &PairKey, epoch: u64) {
        let engine = Arc::clone(self);
        let pair = pair.clone();
        // The epoch guard makes a stale release harmless, so the task itself
        // is not tracked.
        tokio::spawn(async move {
            tokio::time::sleep(MONITOR_RELEASE_DELAY).await;
            let mut entries = engine.lock_entries();
            if entries
                .get(&pair)
                .is_some_and(|entry| entry.epoch == epoch)
            {
                if let Some(entry) = entries.remove(&pair) {
                    abort_all(entry.tasks);
                }
                debug!(channel = %pair.0, path = %pair.1, "monitor released");
            }
        });
    }

    fn fail(&self, pair: &PairKey, epoch: u64, message: &str) {
        let mut detached = Vec::new();
        {
            let mut entries = self.lock_entries();
            if let Some(entry) = entries.get_mut(pair) {
                if entry.epoch != epoch {
                    return;
                }
                entry.stats.status = VideoStatus::Error;
                entry.stats.error = Some(message.to_string());
                detached = std::mem::take(&mut entry.tasks);
            }
        }
        warn!(channel = %pair.0, path = %pair.1, error = message, "prefetch failed");
        self.emit_stats(pair);
        abort_all(detached);
    }

    fn mutate_stats(&self, pair: &PairKey, epoch: u64, mutate: impl FnOnce(&mut VideoStats)) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(pair)
            && entry.epoch == epoch
        {
            mutate(&mut entry.stats);
        }
    }

    fn emit_stats(&self, pair: &PairKey) {
        let stats = {
            let entries = self.lock_entries();
            match entries.get(pair) {
                Some(entry) => entry.stats.clone(),
                None => return,
            }
        };
        self.events.publish(stats_event(pair, &stats));
    }

    fn track_tasks(&self, pair: &PairKey, epoch: u64, handles: Vec<AbortHandle>) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(pair)
            && entry.epoch == epoch
        {
            entry.tasks.extend(handles);
        } else {
            abort_all(handles);
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<PairKey, TrackEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Identifier of a video derived from its drive path (`/videos/<id>.<ext>`).
#[must_use]
pub fn video_id_for_path(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('.').next().unwrap_or(name).to_string()
}

fn stats_event(pair: &PairKey, stats: &VideoStats) -> Event {
    let blocks_done = stats.initial_blocks + stats.downloaded_blocks;
    let downloaded_bytes = if stats.total_blocks == 0 {
        0
    } else {
        u64::try_from(
            u128::from(stats.total_bytes) * u128::from(blocks_done)
                / u128::from(stats.total_blocks),
        )
        .unwrap_or(u64::MAX)
    };
    Event::VideoStats {
        video_id: video_id_for_path(&pair.1),
        channel_key: pair.0,
        downloaded_bytes,
        total_bytes: stats.total_bytes,
        download_progress: stats.progress() * 100.0,
        peer_count: stats.peer_count,
        download_speed: stats.download_speed,
        upload_speed: stats.upload_speed,
    }
}

fn decile_of(progress: f64) -> u8 {
    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "progress is clamped to [0, 1] so the decile fits a u8"
    )]
    {
        (progress.clamp(0.0, 1.0) * 10.0).floor() as u8
    }
}

fn abort_all(handles: Vec<AbortHandle>) {
    for handle in handles {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_ids_strip_directories_and_extensions() {
        assert_eq!(video_id_for_path("/videos/abc123.mp4"), "abc123");
        assert_eq!(video_id_for_path("/videos/plain"), "plain");
        assert_eq!(video_id_for_path("clip.webm"), "clip");
    }

    #[test]
    fn deciles_round_down() {
        assert_eq!(decile_of(0.0), 0);
        assert_eq!(decile_of(0.19), 1);
        assert_eq!(decile_of(0.999), 9);
        assert_eq!(decile_of(1.0), 10);
    }

    #[test]
    fn stats_events_scale_bytes_by_blocks() {
        let pair = (
            ChannelKey::from_bytes([1; 32]),
            "/videos/demo.mp4".to_string(),
        );
        let stats = VideoStats {
            status: VideoStatus::Downloading,
            total_blocks: 100,
            total_bytes: 1_000,
            initial_blocks: 10,
            downloaded_blocks: 40,
            ..VideoStats::default()
        };
        match stats_event(&pair, &stats) {
            Event::VideoStats {
                video_id,
                downloaded_bytes,
                download_progress,
                ..
            } => {
                assert_eq!(video_id, "demo");
                assert_eq!(downloaded_bytes, 500);
                assert!((download_progress - 50.0).abs() < f64::EPSILON);
            }
            other => panic!("expected stats event, got {other:?}"),
        }
    }
}
