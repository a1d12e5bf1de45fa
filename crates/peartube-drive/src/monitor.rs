//! Event-driven download monitors for one file's blob range.
//!
//! A monitor owns a background task subscribed to the blob log's update
//! broadcast. Block arrivals inside the watched range produce ticks carrying
//! the cumulative delta since attach, the peers currently serving the drive,
//! and smoothed transfer rates. A slow heartbeat keeps rates decaying while
//! nothing arrives.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use peartube_core::{CoreError, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::drive::Drive;
use crate::replicate::ReplicatorSet;

const TICK_CAPACITY: usize = 64;
const HEARTBEAT: Duration = Duration::from_secs(1);
const SPEED_SMOOTHING: f64 = 0.3;

/// One observation of a monitored range.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MonitorSnapshot {
    /// Blocks stored inside the range since the monitor attached.
    pub blocks: u64,
    /// Bytes stored inside the range since the monitor attached.
    pub bytes: u64,
    /// Peers currently attached to the drive.
    pub peers: usize,
    /// Smoothed download rate in bytes per second.
    pub download_speed: f64,
    /// Smoothed upload rate in bytes per second.
    pub upload_speed: f64,
}

/// Live monitor over a blob block range.
pub struct DriveMonitor {
    ticks: mpsc::Receiver<MonitorSnapshot>,
    task: tokio::task::JoinHandle<()>,
}

impl DriveMonitor {
    /// Attach a monitor to `range` of the drive's blob log.
    ///
    /// # Errors
    ///
    /// Returns an error when the blob log is not initialised yet.
    pub fn attach(
        set: &Arc<ReplicatorSet>,
        drive: &Arc<Drive>,
        range: Range<u64>,
    ) -> Result<Self> {
        let blobs = drive
            .blobs()
            .ok_or_else(|| CoreError::internal("cannot monitor a drive without its blob log"))?;
        let discovery_key = drive.discovery_key();
        let set = Arc::clone(set);
        let (ticks_tx, ticks) = mpsc::channel(TICK_CAPACITY);

        let task = tokio::spawn(async move {
            let mut updates = blobs.subscribe();
            let mut heartbeat = tokio::time::interval(HEARTBEAT);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            let mut blocks = 0_u64;
            let mut bytes = 0_u64;
            let mut download_speed = 0.0_f64;
            let mut upload_speed = 0.0_f64;
            let mut window_started = Instant::now();
            let mut window_bytes = 0_u64;
            let mut uploaded_before = set.uploaded_bytes(&discovery_key);

            loop {
                let arrived = tokio::select! {
                    update = updates.recv() => match update {
                        Ok(update) if range.contains(&update.index) => {
                            blocks += 1;
                            bytes += update.byte_len;
                            window_bytes += update.byte_len;
                            true
                        }
                        Ok(_) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = heartbeat.tick() => false,
                };

                let elapsed = window_started.elapsed().as_secs_f64();
                if elapsed >= HEARTBEAT.as_secs_f64() || (arrived && elapsed > 0.0) {
                    let instant_rate = to_rate(window_bytes, elapsed);
                    download_speed = smooth(download_speed, instant_rate);

                    let uploaded_now = set.uploaded_bytes(&discovery_key);
                    let upload_rate =
                        to_rate(uploaded_now.saturating_sub(uploaded_before), elapsed);
                    upload_speed = smooth(upload_speed, upload_rate);

                    uploaded_before = uploaded_now;
                    window_started = Instant::now();
                    window_bytes = 0;
                }

                let snapshot = MonitorSnapshot {
                    blocks,
                    bytes,
                    peers: set.peer_count(&discovery_key),
                    download_speed,
                    upload_speed,
                };
                trace!(blocks, bytes, "monitor tick");
                if ticks_tx.try_send(snapshot).is_err() && ticks_tx.is_closed() {
                    break;
                }
            }
        });

        Ok(Self { ticks, task })
    }

    /// Await the next tick; `None` once the monitor is detached.
    pub async fn tick(&mut self) -> Option<MonitorSnapshot> {
        self.ticks.recv().await
    }
}

impl Drop for DriveMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn to_rate(bytes: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 {
        0.0
    } else {
        #[expect(
            clippy::cast_precision_loss,
            reason = "byte windows are far below the f64 mantissa for rate reporting"
        )]
        {
            bytes as f64 / elapsed
        }
    }
}

fn smooth(previous: f64, sample: f64) -> f64 {
    previous.mul_add(1.0 - SPEED_SMOOTHING, sample * SPEED_SMOOTHING)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::Drive;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn ticks_count_blocks_in_range_only() {
        let dir = TempDir::new().expect("tempdir");
        let (drive, _keys) = Drive::create(dir.path()).expect("drive creates");
        let set = ReplicatorSet::new();
        set.add_drive(&drive);

        let blobs = drive.blobs().expect("blob log");
        blobs.append(b"before range").expect("append");

        let mut monitor = DriveMonitor::attach(&set, &drive, 1..3).expect("monitor attaches");
        blobs.append(b"block one").expect("append");
        blobs.append(b"block two").expect("append");

        let mut last = MonitorSnapshot::default();
        while last.blocks < 2 {
            last = timeout(Duration::from_secs(2), monitor.tick())
                .await
                .expect("tick arrives")
                .expect("monitor alive");
        }
        assert_eq!(last.blocks, 2);
        assert_eq!(last.bytes, 18);
    }

    #[tokio::test]
    async fn out_of_range_blocks_do_not_tick_counts() {
        let dir = TempDir::new().expect("tempdir");
        let (drive, _keys) = Drive::create(dir.path()).expect("drive creates");
        let set = ReplicatorSet::new();
        set.add_drive(&drive);

        let blobs = drive.blobs().expect("blob log");
        let mut monitor = DriveMonitor::attach(&set, &drive, 10..20).expect("monitor attaches");
        blobs.append(b"outside").expect("append");

        // Only heartbeat ticks show up, all with zero progress.
        let snapshot = timeout(Duration::from_secs(3), monitor.tick())
            .await
            .expect("tick arrives")
            .expect("monitor alive");
        assert_eq!(snapshot.blocks, 0);
    }

    #[test]
    fn smoothing_moves_toward_the_sample() {
        let smoothed = smooth(0.0, 100.0);
        assert!(smoothed > 0.0 && smoothed < 100.0);
        assert!((to_rate(0, 0.0)).abs() < f64::EPSILON);
    }
}
