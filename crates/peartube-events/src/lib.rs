#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Server-push events for the PearTube node.
//!
//! A subscriber sees everything published after it attaches; a reconnecting
//! subscriber that presents its last-seen id (the SSE `Last-Event-ID` case)
//! additionally gets a replay of the retained history. Fan-out rides
//! `tokio::broadcast`, so a stalled consumer skips ahead instead of holding
//! publishers up; ids are assigned inside the history ring, which keeps the
//! replay and the id sequence in lockstep.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use peartube_core::ChannelKey;
use tokio::sync::broadcast;

/// Identifier assigned to each event emitted by the node.
pub type EventId = u64;

/// How many events the bus retains for reconnecting subscribers.
const HISTORY_CAPACITY: usize = 1_024;

/// Typed events surfaced to the UI control plane.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Event {
    /// The core finished initialising; emitted exactly once.
    Ready {
        /// Loopback port of the blob bridge.
        blob_server_port: u16,
    },
    /// A prefetch monitor ticked.
    VideoStats {
        /// Identifier of the video being tracked.
        video_id: String,
        /// Channel the video belongs to.
        channel_key: ChannelKey,
        /// Bytes present locally.
        downloaded_bytes: u64,
        /// Total size of the file in bytes.
        total_bytes: u64,
        /// Completion percentage in `[0, 100]`.
        download_progress: f64,
        /// Peers observed for the download.
        peer_count: usize,
        /// Smoothed download rate in bytes per second.
        download_speed: f64,
        /// Smoothed upload rate in bytes per second.
        upload_speed: f64,
    },
    /// The visible public feed gained an entry.
    FeedUpdate {},
    /// The core failed to initialise.
    Error {
        /// Human-readable failure description.
        message: String,
    },
}

impl Event {
    /// Machine-friendly discriminator for SSE consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::VideoStats { .. } => "video_stats",
            Self::FeedUpdate {} => "feed_update",
            Self::Error { .. } => "error",
        }
    }
}

/// An event as delivered to subscribers: the payload stamped with its id and
/// publication time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Position in the node's event sequence, starting at 1.
    pub id: EventId,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// The event itself.
    pub event: Event,
}

/// Bounded retention ring. Owns id assignment so history order and the id
/// sequence cannot drift apart.
struct History {
    ring: VecDeque<EventEnvelope>,
    capacity: usize,
    tail: EventId,
}

impl History {
    fn stamp(&mut self, event: Event) -> EventEnvelope {
        self.tail += 1;
        let envelope = EventEnvelope {
            id: self.tail,
            timestamp: Utc::now(),
            event,
        };
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(envelope.clone());
        envelope
    }

    fn replay_after(&self, id: EventId) -> VecDeque<EventEnvelope> {
        self.ring
            .iter()
            .filter(|envelope| envelope.id > id)
            .cloned()
            .collect()
    }
}

/// Handle for publishing node events and attaching subscribers.
#[derive(Clone)]
pub struct EventBus {
    live: broadcast::Sender<EventEnvelope>,
    history: Arc<Mutex<History>>,
}

impl EventBus {
    /// Build a bus retaining up to `capacity` events for replay. The live
    /// channel gets the same bound, so replay and fan-out degrade together.
    ///
    /// # Panics
    ///
    /// A zero capacity is a programming error and panics.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event retention capacity must be non-zero");
        let (live, _) = broadcast::channel(capacity);
        Self {
            live,
            history: Arc::new(Mutex::new(History {
                ring: VecDeque::with_capacity(capacity),
                capacity,
                tail: 0,
            })),
        }
    }

    /// Build a bus with the default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    /// Publish an event to every subscriber and into the replay history.
    pub fn publish(&self, event: Event) {
        let envelope = self.lock_history().stamp(event);
        let _ = self.live.send(envelope);
    }

    /// Attach a subscriber. With `since`, retained events newer than that id
    /// are replayed before live delivery; without it, delivery starts at the
    /// next published event.
    #[must_use]
    pub fn subscribe(&self, since: Option<EventId>) -> EventStream {
        // Subscribing before snapshotting means an event can land in both
        // the snapshot and the live receiver; the stream's cursor drops the
        // second copy. The reverse order would lose it entirely.
        let live = self.live.subscribe();
        let backlog = match since {
            Some(id) => self.lock_history().replay_after(id),
            None => VecDeque::new(),
        };
        EventStream {
            backlog,
            live,
            cursor: since.unwrap_or(0),
        }
    }

    /// Id of the most recently published event, if any.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let tail = self.lock_history().tail;
        (tail > 0).then_some(tail)
    }

    fn lock_history(&self) -> MutexGuard<'_, History> {
        // A panicked publisher leaves the ring intact; keep going.
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's view of the event sequence: replayed history first, then
/// live events, each id delivered at most once.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    live: broadcast::Receiver<EventEnvelope>,
    cursor: EventId,
}

impl EventStream {
    /// The next event, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            self.cursor = envelope.id;
            return Some(envelope);
        }
        loop {
            match self.live.recv().await {
                Ok(envelope) if envelope.id > self.cursor => {
                    self.cursor = envelope.id;
                    return Some(envelope);
                }
                // Already delivered from the replay snapshot.
                Ok(_) => {}
                // Fell behind; resume with whatever is still buffered.
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(1);

    fn stats_event(tick: u64) -> Event {
        Event::VideoStats {
            video_id: format!("video-{tick}"),
            channel_key: ChannelKey::from_bytes([0xab; 32]),
            downloaded_bytes: tick * 1_000,
            total_bytes: 500_000,
            download_progress: 10.0,
            peer_count: 2,
            download_speed: 1_024.0,
            upload_speed: 0.0,
        }
    }

    async fn expect_next(stream: &mut EventStream) -> EventEnvelope {
        timeout(RECV_TIMEOUT, stream.next())
            .await
            .expect("stream stalled")
            .expect("stream closed")
    }

    #[test]
    fn event_kinds_cover_all_variants() {
        let events = [
            Event::Ready {
                blob_server_port: 4321,
            },
            stats_event(0),
            Event::FeedUpdate {},
            Event::Error {
                message: "boom".to_string(),
            },
        ];
        let kinds: Vec<&str> = events.iter().map(Event::kind).collect();
        assert_eq!(kinds, ["ready", "video_stats", "feed_update", "error"]);
    }

    #[test]
    fn events_serialise_with_type_tags_and_camel_case_fields() {
        let json = serde_json::to_value(Event::Ready {
            blob_server_port: 9000,
        })
        .expect("serializes");
        assert_eq!(json["type"], "ready");
        assert_eq!(json["blobServerPort"], 9000);

        let json = serde_json::to_value(stats_event(1)).expect("serializes");
        assert_eq!(json["type"], "video_stats");
        assert_eq!(json["downloadedBytes"], 1_000);
        assert_eq!(json["videoId"], "video-1");
    }

    #[tokio::test]
    async fn reconnect_replays_only_events_after_the_presented_id() {
        let bus = EventBus::with_capacity(16);
        for tick in 0..5 {
            bus.publish(stats_event(tick));
        }
        assert_eq!(bus.last_event_id(), Some(5));

        let mut stream = bus.subscribe(Some(2));
        for expected in 3..=5 {
            assert_eq!(expect_next(&mut stream).await.id, expected);
        }
    }

    #[tokio::test]
    async fn live_subscribers_start_at_the_next_event() {
        let bus = EventBus::with_capacity(16);
        bus.publish(Event::FeedUpdate {});
        bus.publish(Event::FeedUpdate {});

        let mut stream = bus.subscribe(None);
        bus.publish(stats_event(7));
        let envelope = expect_next(&mut stream).await;
        assert_eq!(envelope.id, 3);
        assert_eq!(envelope.event.kind(), "video_stats");
    }

    #[tokio::test]
    async fn replay_and_live_delivery_never_duplicate_an_id() {
        let bus = EventBus::with_capacity(16);
        for tick in 0..3 {
            bus.publish(stats_event(tick));
        }

        let mut stream = bus.subscribe(Some(0));
        bus.publish(stats_event(3));

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(expect_next(&mut stream).await.id);
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn retention_drops_the_oldest_events_first() {
        let bus = EventBus::with_capacity(2);
        for tick in 0..3 {
            bus.publish(stats_event(tick));
        }

        let mut stream = bus.subscribe(Some(0));
        assert_eq!(expect_next(&mut stream).await.id, 2);
        assert_eq!(expect_next(&mut stream).await.id, 3);
    }

    #[tokio::test]
    async fn stream_ends_when_the_bus_is_dropped() {
        let mut stream = {
            let bus = EventBus::with_capacity(1);
            let stream = bus.subscribe(None);
            drop(bus);
            stream
        };
        assert!(
            stream.next().await.is_none(),
            "a dropped bus should end the stream"
        );
    }

    #[test]
    fn last_event_id_is_absent_before_the_first_publish() {
        let bus = EventBus::with_capacity(4);
        assert!(bus.last_event_id().is_none());
        bus.publish(Event::FeedUpdate {});
        assert_eq!(bus.last_event_id(), Some(1));
    }
}
