//! Public-feed gossip: learn which channels exist.
//!
//! Every connection carries one logical feed channel. On open each side sends
//! its full key set; submissions propagate with the arrival connection
//! excluded from the fan-out. The protocol is best-effort: malformed
//! messages, unknown tags, and send failures are logged and ignored, and no
//! peer is ever disconnected for bad feed behaviour.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use peartube_core::store::KEY_HIDDEN_CHANNELS;
use peartube_core::{ChannelKey, FeedEntry, FeedSource, NodeStore, Result, epoch_ms_now};
use peartube_events::{Event, EventBus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Well-known topic name both sides hash for the public feed rendezvous.
pub const FEED_TOPIC_NAME: &str = "peartube-public-feed-v1";

/// Messages exchanged on the feed channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeedMessage {
    /// Full set of channels the sender knows.
    #[serde(rename = "HAVE_FEED")]
    HaveFeed {
        /// Channel keys in canonical hex.
        keys: Vec<String>,
    },
    /// A channel worth remembering and forwarding.
    #[serde(rename = "SUBMIT_CHANNEL")]
    SubmitChannel {
        /// Channel key in canonical hex.
        key: String,
    },
    /// Legacy request for a `HAVE_FEED`.
    #[serde(rename = "NEED_FEED")]
    NeedFeed {},
    /// Legacy alias of `HAVE_FEED`; accepted inbound, never sent.
    #[serde(rename = "FEED_RESPONSE")]
    FeedResponse {
        /// Channel keys in canonical hex.
        keys: Vec<String>,
    },
}

struct FeedPeer {
    sender: mpsc::Sender<FeedMessage>,
}

#[derive(Default)]
struct FeedState {
    entries: HashMap<ChannelKey, FeedEntry>,
    hidden: HashSet<ChannelKey>,
    peers: HashMap<u64, FeedPeer>,
}

/// Aggregate counters surfaced with the feed listing.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStats {
    /// Visible entries.
    pub total_entries: usize,
    /// Permanently hidden keys.
    pub hidden_count: usize,
    /// Feed channels currently open.
    pub peer_count: usize,
}

/// The node's view of the public feed.
pub struct FeedGossip {
    state: Mutex<FeedState>,
    store: NodeStore,
    events: EventBus,
}

impl FeedGossip {
    /// Construct the gossip component, loading the persisted hidden set.
    ///
    /// # Errors
    ///
    /// Returns an error when the hidden set cannot be loaded from the store.
    pub fn new(store: NodeStore, events: EventBus) -> Result<Self> {
        let hidden: HashSet<ChannelKey> = store
            .get::<Vec<ChannelKey>>(KEY_HIDDEN_CHANNELS)?
            .unwrap_or_default()
            .into_iter()
            .collect();
        Ok(Self {
            state: Mutex::new(FeedState {
                hidden,
                ..FeedState::default()
            }),
            store,
            events,
        })
    }

    /// Open the feed channel towards a connection. The first open wins;
    /// reopening is a no-op. Sends the full local key set.
    pub fn attach_peer(&self, conn_id: u64, sender: mpsc::Sender<FeedMessage>) {
        let have = {
            let mut state = self.lock_state();
            if state.peers.contains_key(&conn_id) {
                return;
            }
            state.peers.insert(conn_id, FeedPeer { sender });
            have_message(&state)
        };
        self.send_to(conn_id, have);
    }

    /// Drop the channel bookkeeping for a closed connection.
    pub fn detach_peer(&self, conn_id: u64) {
        if self.lock_state().peers.remove(&conn_id).is_some() {
            debug!(conn_id, "feed channel detached");
        }
    }

    /// Number of feed channels currently open.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.lock_state().peers.len()
    }

    /// Handle one inbound feed message from `conn_id`.
    pub fn handle_message(&self, conn_id: u64, message: FeedMessage) {
        match message {
            FeedMessage::HaveFeed { keys } | FeedMessage::FeedResponse { keys } => {
                for key in keys {
                    let _ = self.add_entry(&key, FeedSource::Peer);
                }
            }
            FeedMessage::SubmitChannel { key } => {
                // Re-gossip only what is newly learned, excluding the arrival
                // connection; duplicates would otherwise circulate forever.
                if self.add_entry(&key, FeedSource::Peer) {
                    self.broadcast_except(FeedMessage::SubmitChannel { key }, Some(conn_id));
                }
            }
            FeedMessage::NeedFeed {} => {
                let have = have_message(&self.lock_state());
                self.send_to(conn_id, have);
            }
        }
    }

    /// Record a channel key. Returns true only when the entry is newly added.
    ///
    /// Non-canonical keys are rejected with a log line; hidden keys are
    /// silently ignored; duplicates are a no-op.
    #[must_use]
    pub fn add_entry(&self, key: &str, source: FeedSource) -> bool {
        let Ok(channel_key) = ChannelKey::parse(key) else {
            warn!(key, "rejecting feed entry with non-canonical key");
            return false;
        };

        let added = {
            let mut state = self.lock_state();
            if state.hidden.contains(&channel_key) || state.entries.contains_key(&channel_key) {
                false
            } else {
                state.entries.insert(
                    channel_key,
                    FeedEntry {
                        channel_key,
                        added_at: epoch_ms_now(),
                        source,
                    },
                );
                true
            }
        };

        if added {
            debug!(channel = %channel_key, ?source, "feed entry added");
            self.events.publish(Event::FeedUpdate {});
        }
        added
    }

    /// Submit a locally known channel and gossip it to every peer.
    ///
    /// # Errors
    ///
    /// Returns [`peartube_core::CoreError::InvalidKey`] for malformed keys.
    pub fn submit(&self, key: &str) -> Result<bool> {
        let channel_key = ChannelKey::parse(key)?;
        let added = self.add_entry(key, FeedSource::Local);
        self.broadcast_except(
            FeedMessage::SubmitChannel {
                key: channel_key.to_string(),
            },
            None,
        );
        Ok(added)
    }

    /// Permanently hide a channel from the feed.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed keys or when the hidden set cannot be
    /// persisted.
    pub fn hide(&self, key: &str) -> Result<()> {
        let channel_key = ChannelKey::parse(key)?;
        let hidden: Vec<ChannelKey> = {
            let mut state = self.lock_state();
            state.entries.remove(&channel_key);
            state.hidden.insert(channel_key);
            state.hidden.iter().copied().collect()
        };
        self.store.put(KEY_HIDDEN_CHANNELS, &hidden)?;
        Ok(())
    }

    /// Visible entries, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<FeedEntry> {
        let mut entries: Vec<FeedEntry> = self.lock_state().entries.values().cloned().collect();
        entries.sort_by(|a, b| b.added_at.cmp(&a.added_at));
        entries
    }

    /// Aggregate feed counters.
    #[must_use]
    pub fn stats(&self) -> FeedStats {
        let state = self.lock_state();
        FeedStats {
            total_entries: state.entries.len(),
            hidden_count: state.hidden.len(),
            peer_count: state.peers.len(),
        }
    }

    /// Re-send `HAVE_FEED` to every peer, prompting reciprocal announcements.
    /// Returns the number of peers contacted.
    #[must_use]
    pub fn request_from_peers(&self) -> usize {
        let (have, senders) = {
            let state = self.lock_state();
            (
                have_message(&state),
                state
                    .peers
                    .values()
                    .map(|peer| peer.sender.clone())
                    .collect::<Vec<_>>(),
            )
        };
        for sender in &senders {
            if sender.try_send(have.clone()).is_err() {
                debug!("feed send failed; peer channel busy or closed");
            }
        }
        senders.len()
    }

    fn broadcast_except(&self, message: FeedMessage, excluded: Option<u64>) {
        let senders: Vec<(u64, mpsc::Sender<FeedMessage>)> = self
            .lock_state()
            .peers
            .iter()
            .filter(|(conn_id, _)| Some(**conn_id) != excluded)
            .map(|(conn_id, peer)| (*conn_id, peer.sender.clone()))
            .collect();
        for (conn_id, sender) in senders {
            if sender.try_send(message.clone()).is_err() {
                debug!(conn_id, "feed send failed; peer channel busy or closed");
            }
        }
    }

    fn send_to(&self, conn_id: u64, message: FeedMessage) {
        let sender = self
            .lock_state()
            .peers
            .get(&conn_id)
            .map(|peer| peer.sender.clone());
        if let Some(sender) = sender
            && sender.try_send(message).is_err()
        {
            debug!(conn_id, "feed send failed; peer channel busy or closed");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, FeedState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn have_message(state: &FeedState) -> FeedMessage {
    FeedMessage::HaveFeed {
        keys: state.entries.keys().map(ChannelKey::to_string).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gossip(dir: &TempDir) -> FeedGossip {
        FeedGossip::new(NodeStore::new(dir.path()), EventBus::with_capacity(64))
            .expect("gossip constructs")
    }

    fn key(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    #[test]
    fn add_entry_is_idempotent_and_validates() {
        let dir = TempDir::new().expect("tempdir");
        let feed = gossip(&dir);

        assert!(feed.add_entry(&key(0xaa), FeedSource::Peer));
        assert!(!feed.add_entry(&key(0xaa), FeedSource::Peer));
        assert!(!feed.add_entry("zz", FeedSource::Peer));
        assert_eq!(feed.list().len(), 1);
    }

    #[test]
    fn hidden_keys_never_revive() {
        let dir = TempDir::new().expect("tempdir");
        let feed = gossip(&dir);

        feed.hide(&key(0xbb)).expect("hide persists");
        feed.handle_message(
            1,
            FeedMessage::HaveFeed {
                keys: vec![key(0xbb), key(0xcc)],
            },
        );
        let entries = feed.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].channel_key.to_string(), key(0xcc));
    }

    #[test]
    fn hidden_set_survives_reconstruction() {
        let dir = TempDir::new().expect("tempdir");
        {
            let feed = gossip(&dir);
            feed.hide(&key(0xbb)).expect("hide persists");
        }
        let feed = gossip(&dir);
        assert!(!feed.add_entry(&key(0xbb), FeedSource::Peer));
        assert_eq!(feed.stats().hidden_count, 1);
    }

    #[tokio::test]
    async fn submit_broadcasts_to_every_peer() {
        let dir = TempDir::new().expect("tempdir");
        let feed = gossip(&dir);

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        feed.attach_peer(1, tx_a);
        feed.attach_peer(2, tx_b);

        // Drain the on-open HAVE_FEED messages.
        assert!(matches!(
            rx_a.recv().await,
            Some(FeedMessage::HaveFeed { .. })
        ));
        assert!(matches!(
            rx_b.recv().await,
            Some(FeedMessage::HaveFeed { .. })
        ));

        assert!(feed.submit(&key(0xaa)).expect("submit succeeds"));
        assert!(matches!(
            rx_a.recv().await,
            Some(FeedMessage::SubmitChannel { .. })
        ));
        assert!(matches!(
            rx_b.recv().await,
            Some(FeedMessage::SubmitChannel { .. })
        ));
    }

    #[tokio::test]
    async fn regossip_excludes_the_sender() {
        let dir = TempDir::new().expect("tempdir");
        let feed = gossip(&dir);

        let (tx_sender, mut rx_sender) = mpsc::channel(8);
        let (tx_other, mut rx_other) = mpsc::channel(8);
        feed.attach_peer(1, tx_sender);
        feed.attach_peer(2, tx_other);
        let _ = rx_sender.recv().await;
        let _ = rx_other.recv().await;

        feed.handle_message(1, FeedMessage::SubmitChannel { key: key(0xdd) });

        assert!(matches!(
            rx_other.recv().await,
            Some(FeedMessage::SubmitChannel { .. })
        ));
        assert!(
            rx_sender.try_recv().is_err(),
            "sender must not receive its own submission back"
        );

        // A duplicate submission does not fan out again.
        feed.handle_message(2, FeedMessage::SubmitChannel { key: key(0xdd) });
        assert!(rx_sender.try_recv().is_err());
    }

    #[tokio::test]
    async fn need_feed_is_answered_with_have_feed() {
        let dir = TempDir::new().expect("tempdir");
        let feed = gossip(&dir);
        assert!(feed.add_entry(&key(0x11), FeedSource::Local));

        let (tx, mut rx) = mpsc::channel(8);
        feed.attach_peer(7, tx);
        let _ = rx.recv().await;

        feed.handle_message(7, FeedMessage::NeedFeed {});
        match rx.recv().await {
            Some(FeedMessage::HaveFeed { keys }) => assert_eq!(keys, vec![key(0x11)]),
            other => panic!("expected HAVE_FEED, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn feed_update_event_fires_once_per_new_key() {
        let dir = TempDir::new().expect("tempdir");
        let events = EventBus::with_capacity(64);
        let feed = FeedGossip::new(NodeStore::new(dir.path()), events.clone())
            .expect("gossip constructs");
        let mut stream = events.subscribe(None);

        assert!(feed.add_entry(&key(0xaa), FeedSource::Peer));
        assert!(!feed.add_entry(&key(0xaa), FeedSource::Peer));

        let envelope = stream.next().await.expect("event delivered");
        assert!(matches!(envelope.event, Event::FeedUpdate {}));
        assert_eq!(events.last_event_id(), Some(envelope.id));
    }

    #[test]
    fn wire_tags_match_the_protocol() {
        let json = serde_json::to_value(FeedMessage::SubmitChannel { key: key(0xee) })
            .expect("serializes");
        assert_eq!(json["type"], "SUBMIT_CHANNEL");

        let parsed: FeedMessage =
            serde_json::from_str(r#"{"type":"NEED_FEED"}"#).expect("legacy tag parses");
        assert!(matches!(parsed, FeedMessage::NeedFeed {}));

        assert!(serde_json::from_str::<FeedMessage>(r#"{"type":"MYSTERY"}"#).is_err());
    }
}
