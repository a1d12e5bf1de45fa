//! Drive replication over duplex byte channels.
//!
//! Every connection carries length-prefixed JSON frames. Both sides announce
//! the drives they hold (`open` + `have`), metadata logs sync automatically
//! (they are small and every reader needs them whole), and blob blocks move
//! only on request (`want`), driven by the prefetch engine. Blocks are
//! verified against the log key on insert, so a misbehaving peer can waste
//! bandwidth but not corrupt a drive.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use peartube_core::{CoreError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

use crate::drive::Drive;
use crate::log::Log;

const OUTBOX_CAPACITY: usize = 1_024;
const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;
const WANT_REBROADCAST: Duration = Duration::from_secs(5);
const HAVE_CHANNEL_CAPACITY: usize = 256;

/// Which log of a drive a frame refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogId {
    /// The metadata log.
    Meta,
    /// The paired blob log.
    Blobs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Open {
        discovery_key: String,
    },
    Sync {
        discovery_key: String,
    },
    Have {
        discovery_key: String,
        log: LogId,
        length: u64,
    },
    Want {
        discovery_key: String,
        log: LogId,
        start: u64,
        end: u64,
    },
    Block {
        discovery_key: String,
        log: LogId,
        index: u64,
        payload: String,
        signature: String,
    },
}

struct DriveSlot {
    drive: Arc<Drive>,
    uploaded: Arc<AtomicU64>,
    downloaded: Arc<AtomicU64>,
}

struct ConnState {
    outbox: mpsc::Sender<WireMessage>,
    attached: HashSet<[u8; 32]>,
}

#[derive(Default)]
struct SetState {
    drives: HashMap<[u8; 32], DriveSlot>,
    conns: HashMap<u64, ConnState>,
    next_conn: u64,
}

/// Replicates every registered drive over every connected peer.
pub struct ReplicatorSet {
    state: Mutex<SetState>,
    have_events: tokio::sync::broadcast::Sender<([u8; 32], u64)>,
}

impl Default for ReplicatorSet {
    fn default() -> Self {
        let (have_events, _) = tokio::sync::broadcast::channel(HAVE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(SetState::default()),
            have_events,
        }
    }
}

impl ReplicatorSet {
    /// Construct an empty set.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total replication peers, attached or not.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock_state().conns.len()
    }

    /// Subscribe to inbound metadata `have` announcements as
    /// `(discovery_key, remote_length)` pairs. Sync waits use these to learn
    /// that a peer has nothing newer.
    #[must_use]
    pub fn subscribe_haves(&self) -> tokio::sync::broadcast::Receiver<([u8; 32], u64)> {
        self.have_events.subscribe()
    }

    /// Register a drive for replication and announce it to every peer.
    pub fn add_drive(self: &Arc<Self>, drive: &Arc<Drive>) {
        let key = drive.discovery_key();
        let announcements = {
            let mut state = self.lock_state();
            if state.drives.contains_key(&key) {
                return;
            }
            state.drives.insert(
                key,
                DriveSlot {
                    drive: Arc::clone(drive),
                    uploaded: Arc::new(AtomicU64::new(0)),
                    downloaded: Arc::new(AtomicU64::new(0)),
                },
            );
            state
                .conns
                .values()
                .map(|conn| conn.outbox.clone())
                .collect::<Vec<_>>()
        };

        for outbox in announcements {
            send_or_drop(&outbox, open_message(&key));
            send_or_drop(&outbox, have_message(&key, LogId::Meta, drive.meta().length()));
        }

        let set = Arc::clone(self);
        let drive = Arc::clone(drive);
        tokio::spawn(async move {
            set.announce_loop(drive).await;
        });
    }

    /// Attach a duplex byte channel as a replication peer.
    ///
    /// Returns the connection id used for later removal.
    #[must_use]
    pub fn handle_connection<T>(self: &Arc<Self>, io: T) -> u64
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbox, mut outbox_rx) = mpsc::channel::<WireMessage>(OUTBOX_CAPACITY);

        let (conn_id, greetings) = {
            let mut state = self.lock_state();
            state.next_conn += 1;
            let conn_id = state.next_conn;
            state.conns.insert(
                conn_id,
                ConnState {
                    outbox: outbox.clone(),
                    attached: HashSet::new(),
                },
            );
            let greetings = state
                .drives
                .values()
                .flat_map(|slot| {
                    let key = slot.drive.discovery_key();
                    let mut frames = vec![
                        open_message(&key),
                        have_message(&key, LogId::Meta, slot.drive.meta().length()),
                    ];
                    if let Some(blobs) = slot.drive.blobs() {
                        frames.push(have_message(&key, LogId::Blobs, blobs.length()));
                    }
                    frames
                })
                .collect::<Vec<_>>();
            (conn_id, greetings)
        };

        for frame in greetings {
            send_or_drop(&outbox, frame);
        }

        tokio::spawn(async move {
            let codec = LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec();
            let mut sink = FramedWrite::new(write_half, codec);
            while let Some(message) = outbox_rx.recv().await {
                let Ok(frame) = serde_json::to_vec(&message) else {
                    continue;
                };
                if sink.send(frame.into()).await.is_err() {
                    break;
                }
            }
        });

        let set = Arc::clone(self);
        tokio::spawn(async move {
            let codec = LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec();
            let mut frames = FramedRead::new(read_half, codec);
            while let Some(frame) = frames.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(error) => {
                        debug!(conn_id, error = %error, "replication stream failed");
                        break;
                    }
                };
                match serde_json::from_slice::<WireMessage>(&frame) {
                    Ok(message) => set.handle_message(conn_id, message),
                    Err(error) => {
                        warn!(conn_id, error = %error, "ignoring malformed replication frame");
                    }
                }
            }
            set.remove_connection(conn_id);
        });

        conn_id
    }

    /// Detach a replication peer.
    pub fn remove_connection(&self, conn_id: u64) {
        let removed = self.lock_state().conns.remove(&conn_id).is_some();
        if removed {
            debug!(conn_id, "replication peer detached");
        }
    }

    /// Number of peers attached to the drive behind `discovery_key`.
    #[must_use]
    pub fn peer_count(&self, discovery_key: &[u8; 32]) -> usize {
        self.lock_state()
            .conns
            .values()
            .filter(|conn| conn.attached.contains(discovery_key))
            .count()
    }

    /// Bytes served to peers for the drive behind `discovery_key`.
    #[must_use]
    pub fn uploaded_bytes(&self, discovery_key: &[u8; 32]) -> u64 {
        self.lock_state()
            .drives
            .get(discovery_key)
            .map_or(0, |slot| slot.uploaded.load(Ordering::Relaxed))
    }

    /// Ask every peer to report its log lengths for one drive, prompting a
    /// metadata sync.
    pub fn request_update(&self, discovery_key: &[u8; 32]) {
        self.broadcast(sync_message(discovery_key));
    }

    /// Ask peers for a block range.
    pub fn request_range(&self, discovery_key: &[u8; 32], log: LogId, range: &Range<u64>) {
        self.broadcast(WireMessage::Want {
            discovery_key: hex::encode(discovery_key),
            log,
            start: range.start,
            end: range.end,
        });
    }

    /// Download every block of `range` into the drive's log, re-requesting
    /// periodically until all blocks are present. Resolves only on
    /// completion; cancel by dropping.
    ///
    /// # Errors
    ///
    /// Returns an error when the target log is not available (blob log before
    /// its header replicates).
    pub async fn download_range(
        &self,
        drive: &Arc<Drive>,
        log_id: LogId,
        range: Range<u64>,
    ) -> Result<()> {
        let log = resolve_log(drive, log_id)?;
        let key = drive.discovery_key();
        let mut updates = log.subscribe();
        loop {
            let missing = log.missing_in(range.clone());
            if missing.is_empty() {
                return Ok(());
            }
            // Ask only for what is still missing so responders never resend
            // blocks that already landed.
            for span in contiguous_spans(&missing) {
                self.request_range(&key, log_id, &span);
            }
            let _ =
                tokio::time::timeout(WANT_REBROADCAST, async { updates.recv().await.ok() }).await;
        }
    }

    /// Download one block with a bounded wait. Returns whether the block is
    /// locally present afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error when the target log is not available.
    pub async fn download_block(
        &self,
        drive: &Arc<Drive>,
        log_id: LogId,
        index: u64,
        timeout: Duration,
    ) -> Result<bool> {
        let log = resolve_log(drive, log_id)?;
        if log.has(index) {
            return Ok(true);
        }
        let key = drive.discovery_key();
        let mut updates = log.subscribe();
        self.request_range(&key, log_id, &(index..index + 1));

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if log.has(index) {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if tokio::time::timeout(remaining, updates.recv()).await.is_err() {
                return Ok(log.has(index));
            }
        }
    }

    fn handle_message(self: &Arc<Self>, conn_id: u64, message: WireMessage) {
        match message {
            WireMessage::Open { discovery_key } => {
                let Some(key) = parse_key(&discovery_key) else {
                    return;
                };
                let reply = {
                    let mut state = self.lock_state();
                    if !state.drives.contains_key(&key) {
                        return;
                    }
                    if let Some(conn) = state.conns.get_mut(&conn_id) {
                        conn.attached.insert(key);
                    }
                    state.conns.get(&conn_id).map(|conn| conn.outbox.clone())
                };
                if let Some(outbox) = reply {
                    self.send_haves(&outbox, &key);
                }
            }
            WireMessage::Sync { discovery_key } => {
                let Some(key) = parse_key(&discovery_key) else {
                    return;
                };
                let outbox = self.lock_state().conns.get(&conn_id).map(|c| c.outbox.clone());
                if let Some(outbox) = outbox {
                    self.send_haves(&outbox, &key);
                }
            }
            WireMessage::Have {
                discovery_key,
                log,
                length,
            } => {
                let Some(key) = parse_key(&discovery_key) else {
                    return;
                };
                // Metadata logs sync in full as soon as a longer one shows up.
                if log != LogId::Meta {
                    return;
                }
                let _ = self.have_events.send((key, length));
                let (local_length, outbox) = {
                    let state = self.lock_state();
                    let Some(slot) = state.drives.get(&key) else {
                        return;
                    };
                    (
                        slot.drive.meta().length(),
                        state.conns.get(&conn_id).map(|c| c.outbox.clone()),
                    )
                };
                if length > local_length
                    && let Some(outbox) = outbox
                {
                    send_or_drop(
                        &outbox,
                        WireMessage::Want {
                            discovery_key,
                            log: LogId::Meta,
                            start: local_length,
                            end: length,
                        },
                    );
                }
            }
            WireMessage::Want {
                discovery_key,
                log,
                start,
                end,
            } => self.answer_want(conn_id, &discovery_key, log, start..end),
            WireMessage::Block {
                discovery_key,
                log,
                index,
                payload,
                signature,
            } => self.store_block(conn_id, &discovery_key, log, index, &payload, &signature),
        }
    }

    fn answer_want(
        self: &Arc<Self>,
        conn_id: u64,
        discovery_key: &str,
        log_id: LogId,
        range: Range<u64>,
    ) {
        let Some(key) = parse_key(discovery_key) else {
            return;
        };
        let (log, uploaded, outbox) = {
            let state = self.lock_state();
            let Some(slot) = state.drives.get(&key) else {
                return;
            };
            let log = match log_id {
                LogId::Meta => slot.drive.meta(),
                LogId::Blobs => match slot.drive.blobs() {
                    Some(blobs) => blobs,
                    None => return,
                },
            };
            let Some(conn) = state.conns.get(&conn_id) else {
                return;
            };
            (log, Arc::clone(&slot.uploaded), conn.outbox.clone())
        };

        for index in range {
            let block = match log.get_with_signature(index) {
                Ok(Some(block)) => block,
                Ok(None) => continue,
                Err(error) => {
                    warn!(index, error = %error, "failed to read block for peer");
                    continue;
                }
            };
            let (payload, signature) = block;
            uploaded.fetch_add(payload.len() as u64, Ordering::Relaxed);
            trace!(conn_id, index, "serving block");
            send_or_drop(
                &outbox,
                WireMessage::Block {
                    discovery_key: discovery_key.to_string(),
                    log: log_id,
                    index,
                    payload: BASE64.encode(&payload),
                    signature: BASE64.encode(signature),
                },
            );
        }
    }

    fn store_block(
        self: &Arc<Self>,
        conn_id: u64,
        discovery_key: &str,
        log_id: LogId,
        index: u64,
        payload: &str,
        signature: &str,
    ) {
        let Some(key) = parse_key(discovery_key) else {
            return;
        };
        let (log, downloaded) = {
            let state = self.lock_state();
            let Some(slot) = state.drives.get(&key) else {
                return;
            };
            let log = match log_id {
                LogId::Meta => slot.drive.meta(),
                LogId::Blobs => match slot.drive.blobs() {
                    Some(blobs) => blobs,
                    // Blob blocks before the header are unverifiable; the
                    // range request machinery re-asks once the header lands.
                    None => return,
                },
            };
            (log, Arc::clone(&slot.downloaded))
        };

        let (Ok(payload), Ok(signature)) = (BASE64.decode(payload), BASE64.decode(signature))
        else {
            warn!(conn_id, index, "ignoring block with malformed encoding");
            return;
        };
        let Ok(signature) = <[u8; 64]>::try_from(signature) else {
            warn!(conn_id, index, "ignoring block with malformed signature");
            return;
        };
        match log.insert(index, &payload, &signature) {
            Ok(true) => {
                downloaded.fetch_add(payload.len() as u64, Ordering::Relaxed);
                if log_id == LogId::Meta {
                    let drive = self.lock_state().drives.get(&key).map(|s| Arc::clone(&s.drive));
                    if let Some(drive) = drive
                        && let Err(error) = drive.refresh()
                    {
                        warn!(error = %error, "failed to fold replicated metadata");
                    }
                }
            }
            Ok(false) => {}
            Err(error) => {
                warn!(conn_id, index, error = %error, "rejecting replicated block");
            }
        }
    }

    fn send_haves(&self, outbox: &mpsc::Sender<WireMessage>, key: &[u8; 32]) {
        let (meta_length, blobs_length) = {
            let state = self.lock_state();
            let Some(slot) = state.drives.get(key) else {
                return;
            };
            (
                slot.drive.meta().length(),
                slot.drive.blobs().map(|blobs| blobs.length()),
            )
        };
        send_or_drop(outbox, have_message(key, LogId::Meta, meta_length));
        if let Some(length) = blobs_length {
            send_or_drop(outbox, have_message(key, LogId::Blobs, length));
        }
    }

    async fn announce_loop(self: Arc<Self>, drive: Arc<Drive>) {
        let mut meta_updates = drive.meta().subscribe();
        let mut blobs_updates = None;
        loop {
            if blobs_updates.is_none()
                && let Some(blobs) = drive.blobs()
            {
                blobs_updates = Some(blobs.subscribe());
                self.broadcast(have_message(
                    &drive.discovery_key(),
                    LogId::Blobs,
                    blobs.length(),
                ));
            }

            let updated = if let Some(blobs_rx) = blobs_updates.as_mut() {
                tokio::select! {
                    update = meta_updates.recv() => update.map(|_| LogId::Meta),
                    update = blobs_rx.recv() => update.map(|_| LogId::Blobs),
                }
            } else {
                meta_updates.recv().await.map(|_| LogId::Meta)
            };

            match updated {
                Ok(LogId::Meta) => {
                    if let Err(error) = drive.refresh() {
                        warn!(error = %error, "failed to fold appended metadata");
                    }
                    self.broadcast(have_message(
                        &drive.discovery_key(),
                        LogId::Meta,
                        drive.meta().length(),
                    ));
                }
                Ok(LogId::Blobs) => {
                    if let Some(blobs) = drive.blobs() {
                        self.broadcast(have_message(
                            &drive.discovery_key(),
                            LogId::Blobs,
                            blobs.length(),
                        ));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn broadcast(&self, message: WireMessage) {
        let outboxes = self
            .lock_state()
            .conns
            .values()
            .map(|conn| conn.outbox.clone())
            .collect::<Vec<_>>();
        for outbox in outboxes {
            send_or_drop(&outbox, message.clone());
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SetState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn open_message(key: &[u8; 32]) -> WireMessage {
    WireMessage::Open {
        discovery_key: hex::encode(key),
    }
}

fn sync_message(key: &[u8; 32]) -> WireMessage {
    WireMessage::Sync {
        discovery_key: hex::encode(key),
    }
}

fn have_message(key: &[u8; 32], log: LogId, length: u64) -> WireMessage {
    WireMessage::Have {
        discovery_key: hex::encode(key),
        log,
        length,
    }
}

fn resolve_log(drive: &Arc<Drive>, log_id: LogId) -> Result<Arc<Log>> {
    match log_id {
        LogId::Meta => Ok(drive.meta()),
        LogId::Blobs => drive
            .blobs()
            .ok_or_else(|| CoreError::internal("blob log is not initialised yet")),
    }
}

fn parse_key(value: &str) -> Option<[u8; 32]> {
    let mut key = [0_u8; 32];
    hex::decode_to_slice(value, &mut key).ok()?;
    Some(key)
}

/// Collapse a sorted index list into contiguous half-open ranges.
fn contiguous_spans(indices: &[u64]) -> Vec<Range<u64>> {
    let mut spans: Vec<Range<u64>> = Vec::new();
    for &index in indices {
        match spans.last_mut() {
            Some(span) if span.end == index => span.end = index + 1,
            _ => spans.push(index..index + 1),
        }
    }
    spans
}

fn send_or_drop(outbox: &mpsc::Sender<WireMessage>, message: WireMessage) {
    if outbox.try_send(message).is_err() {
        debug!("replication outbox full or closed; dropping frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::Drive;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

    async fn wait_for(mut check: impl FnMut() -> bool) {
        timeout(SYNC_TIMEOUT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn metadata_syncs_between_two_sets() {
        let dir = TempDir::new().expect("tempdir");
        let (owner_drive, keys) = Drive::create(dir.path().join("a")).expect("drive creates");
        owner_drive.write_file("/hello", b"world").expect("write");

        let channel = keys.channel_key().expect("channel key");
        let reader_drive =
            Drive::open(dir.path().join("b"), channel, None).expect("reader opens");

        let owner_set = ReplicatorSet::new();
        let reader_set = ReplicatorSet::new();
        owner_set.add_drive(&owner_drive);
        reader_set.add_drive(&reader_drive);

        let (left, right) = tokio::io::duplex(256 * 1024);
        let _ = owner_set.handle_connection(left);
        let _ = reader_set.handle_connection(right);

        let probe = Arc::clone(&reader_drive);
        wait_for(move || probe.entry("/hello").ok().flatten().is_some()).await;
        assert_eq!(reader_set.peer_count(&reader_drive.discovery_key()), 1);
    }

    #[tokio::test]
    async fn blob_range_downloads_on_request() {
        let dir = TempDir::new().expect("tempdir");
        let (owner_drive, keys) = Drive::create(dir.path().join("a")).expect("drive creates");
        let payload = vec![3_u8; crate::drive::DEFAULT_BLOCK_SIZE * 3];
        let blob = owner_drive.write_file("/video.bin", &payload).expect("write");

        let channel = keys.channel_key().expect("channel key");
        let reader_drive =
            Drive::open(dir.path().join("b"), channel, None).expect("reader opens");

        let owner_set = ReplicatorSet::new();
        let reader_set = ReplicatorSet::new();
        owner_set.add_drive(&owner_drive);
        reader_set.add_drive(&reader_drive);

        let (left, right) = tokio::io::duplex(1024 * 1024);
        let _ = owner_set.handle_connection(left);
        let _ = reader_set.handle_connection(right);

        let probe = Arc::clone(&reader_drive);
        wait_for(move || probe.entry("/video.bin").ok().flatten().is_some()).await;

        timeout(
            SYNC_TIMEOUT,
            reader_set.download_range(
                &reader_drive,
                LogId::Blobs,
                blob.block_offset..blob.block_end(),
            ),
        )
        .await
        .expect("download finished")
        .expect("download succeeded");

        assert_eq!(
            reader_drive.read_file("/video.bin").expect("file reads"),
            Some(payload)
        );
        assert!(owner_set.uploaded_bytes(&owner_drive.discovery_key()) > 0);
    }

    #[tokio::test]
    async fn download_block_times_out_without_peers() {
        let dir = TempDir::new().expect("tempdir");
        let (drive, _keys) = Drive::create(dir.path()).expect("drive creates");
        let set = ReplicatorSet::new();
        set.add_drive(&drive);

        let present = set
            .download_block(&drive, LogId::Blobs, 9, Duration::from_millis(50))
            .await
            .expect("wait resolves");
        assert!(!present);
    }

    #[test]
    fn contiguous_spans_collapse_runs() {
        assert_eq!(contiguous_spans(&[]), Vec::<Range<u64>>::new());
        assert_eq!(contiguous_spans(&[3]), vec![3..4]);
        assert_eq!(contiguous_spans(&[1, 2, 3, 7, 9, 10]), vec![1..4, 7..8, 9..11]);
    }

    #[tokio::test]
    async fn removed_connections_stop_counting() {
        let dir = TempDir::new().expect("tempdir");
        let (drive, _keys) = Drive::create(dir.path()).expect("drive creates");
        let set = ReplicatorSet::new();
        set.add_drive(&drive);

        let (left, _right) = tokio::io::duplex(16 * 1024);
        let conn_id = set.handle_connection(left);
        set.remove_connection(conn_id);
        assert_eq!(set.peer_count(&drive.discovery_key()), 0);
    }
}
