//! Overlay connection management.
//!
//! Each peer connection is a framed TCP stream carrying three channels: a
//! hello/topic handshake, the drive replication byte stream (tunnelled
//! through an in-process duplex pipe so the log layer sees a plain byte
//! channel), and the feed protocol. Server and client roles are identical
//! after the handshake; connections are deduplicated by remote node id.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peartube_core::{CoreError, Result};
use peartube_drive::ReplicatorSet;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::feed::{FeedGossip, FeedMessage};

const CHANNEL_REPLICATION: u8 = 0;
const CHANNEL_FEED: u8 = 1;
const CHANNEL_HELLO: u8 = 2;
const CHANNEL_TOPICS: u8 = 3;

const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;
const OUTBOX_CAPACITY: usize = 256;
const FEED_CHANNEL_CAPACITY: usize = 64;
const REPLICATION_PIPE_BYTES: usize = 1024 * 1024;
const REPLICATION_CHUNK_BYTES: usize = 16 * 1024;
const REDIAL_DELAY: Duration = Duration::from_secs(15);

type Frame = (u8, Vec<u8>);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hello {
    node_id: String,
    topics: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicAnnounce {
    topics: Vec<String>,
}

struct PeerHandle {
    #[allow(dead_code)]
    node_id: String,
    outbox: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct HostState {
    peers: HashMap<u64, PeerHandle>,
    node_ids: HashSet<String>,
    topics: HashSet<[u8; 32]>,
    next_conn: u64,
}

/// Handle returned from a topic join; completes once the announcement has
/// been flushed to every current peer.
#[derive(Debug)]
pub struct TopicJoin {
    announced: usize,
}

impl TopicJoin {
    /// Wait for the join announcement to flush.
    ///
    /// # Errors
    ///
    /// Infallible on this overlay; the `Result` keeps the call shape of
    /// overlays whose joins can fail.
    pub async fn flushed(&self) -> Result<()> {
        // Announcements are enqueued synchronously; nothing left to wait on.
        debug!(peers = self.announced, "topic join flushed");
        Ok(())
    }
}

/// Maintains peer connections and routes each one to replication and gossip.
pub struct SwarmHost {
    node_id: String,
    replicator: Arc<ReplicatorSet>,
    feed: Arc<FeedGossip>,
    state: Mutex<HostState>,
    connections: AtomicUsize,
}

impl SwarmHost {
    /// Construct a host identified by `node_id` (the local identity key in
    /// hex).
    #[must_use]
    pub fn new(
        node_id: String,
        replicator: Arc<ReplicatorSet>,
        feed: Arc<FeedGossip>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            replicator,
            feed,
            state: Mutex::new(HostState::default()),
            connections: AtomicUsize::new(0),
        })
    }

    /// The feed gossip component served by this host.
    #[must_use]
    pub fn feed(&self) -> Arc<FeedGossip> {
        Arc::clone(&self.feed)
    }

    /// The drive replication set served by this host.
    #[must_use]
    pub fn replicator(&self) -> Arc<ReplicatorSet> {
        Arc::clone(&self.replicator)
    }

    /// Total open peer connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Bind the overlay listener and start accepting peers.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot bind.
    pub async fn bind(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CoreError::storage("swarm.bind", source))?;
        let local = listener
            .local_addr()
            .map_err(|source| CoreError::storage("swarm.bind", source))?;
        info!(addr = %local, "overlay listener ready");

        let host = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        debug!(peer = %peer_addr, "inbound overlay connection");
                        let host = Arc::clone(&host);
                        tokio::spawn(async move {
                            if let Err(error) = host.run_connection(socket).await {
                                debug!(peer = %peer_addr, error = %error, "connection ended");
                            }
                        });
                    }
                    Err(error) => {
                        warn!(error = %error, "overlay accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(local)
    }

    /// Keep dialling a bootstrap address, reconnecting when the link drops.
    pub fn add_bootstrap(self: &Arc<Self>, addr: String) {
        let host = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match TcpStream::connect(&addr).await {
                    Ok(socket) => {
                        debug!(peer = %addr, "outbound overlay connection");
                        if let Err(error) = host.run_connection(socket).await {
                            debug!(peer = %addr, error = %error, "connection ended");
                        }
                    }
                    Err(error) => {
                        debug!(peer = %addr, error = %error, "dial failed");
                    }
                }
                tokio::time::sleep(REDIAL_DELAY).await;
            }
        });
    }

    /// Join an overlay topic, announcing it to every connected peer.
    #[must_use]
    pub fn join(&self, topic: [u8; 32]) -> TopicJoin {
        let outboxes = {
            let mut state = self.lock_state();
            state.topics.insert(topic);
            state
                .peers
                .values()
                .map(|peer| peer.outbox.clone())
                .collect::<Vec<_>>()
        };
        let announce = TopicAnnounce {
            topics: vec![hex::encode(topic)],
        };
        let frame = serde_json::to_vec(&announce).unwrap_or_default();
        for outbox in &outboxes {
            if outbox.try_send((CHANNEL_TOPICS, frame.clone())).is_err() {
                debug!("topic announce dropped; peer outbox busy");
            }
        }
        TopicJoin {
            announced: outboxes.len(),
        }
    }

    async fn run_connection(self: &Arc<Self>, socket: TcpStream) -> Result<()> {
        let (read_half, write_half) = socket.into_split();
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        let mut frames_in = FramedRead::new(read_half, codec.clone());
        let mut frames_out = FramedWrite::new(write_half, codec);

        // Hello exchange: identify ourselves, learn (and dedup on) the remote
        // node id.
        let hello = {
            let state = self.lock_state();
            Hello {
                node_id: self.node_id.clone(),
                topics: state.topics.iter().map(hex::encode).collect(),
            }
        };
        let payload =
            serde_json::to_vec(&hello).map_err(|source| CoreError::encoding("swarm.hello", source))?;
        frames_out
            .send(encode_frame(CHANNEL_HELLO, &payload))
            .await
            .map_err(|source| CoreError::storage("swarm.hello", source))?;

        let first = frames_in
            .next()
            .await
            .ok_or_else(|| CoreError::internal("peer closed before hello"))?
            .map_err(|source| CoreError::storage("swarm.hello", source))?;
        let (channel, payload) = decode_frame(&first)?;
        if channel != CHANNEL_HELLO {
            return Err(CoreError::internal("peer spoke before hello"));
        }
        let remote: Hello = serde_json::from_slice(payload)
            .map_err(|source| CoreError::encoding("swarm.hello", source))?;

        if remote.node_id == self.node_id {
            debug!("dropping connection to self");
            return Ok(());
        }

        let (conn_id, outbox, mut outbox_rx) = {
            let mut state = self.lock_state();
            if !state.node_ids.insert(remote.node_id.clone()) {
                debug!(node = %remote.node_id, "duplicate connection dropped");
                return Ok(());
            }
            state.next_conn += 1;
            let conn_id = state.next_conn;
            let (outbox, outbox_rx) = mpsc::channel::<Frame>(OUTBOX_CAPACITY);
            state.peers.insert(
                conn_id,
                PeerHandle {
                    node_id: remote.node_id.clone(),
                    outbox: outbox.clone(),
                },
            );
            (conn_id, outbox, outbox_rx)
        };

        // Replication rides an in-process pipe so the log layer replicates
        // over a plain duplex byte channel.
        let (pipe_local, pipe_remote) = tokio::io::duplex(REPLICATION_PIPE_BYTES);
        let repl_conn = self.replicator.handle_connection(pipe_remote);
        let (mut pipe_read, mut pipe_write) = tokio::io::split(pipe_local);

        let repl_outbox = outbox.clone();
        let repl_pump = tokio::spawn(async move {
            let mut buffer = vec![0_u8; REPLICATION_CHUNK_BYTES];
            loop {
                match pipe_read.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        if repl_outbox
                            .send((CHANNEL_REPLICATION, buffer[..read].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        // The feed channel: gossip hands us typed messages, the writer frames
        // them.
        let (feed_tx, mut feed_rx) = mpsc::channel::<FeedMessage>(FEED_CHANNEL_CAPACITY);
        let feed_outbox = outbox.clone();
        let feed_pump = tokio::spawn(async move {
            while let Some(message) = feed_rx.recv().await {
                let Ok(payload) = serde_json::to_vec(&message) else {
                    continue;
                };
                if feed_outbox.send((CHANNEL_FEED, payload)).await.is_err() {
                    break;
                }
            }
        });
        self.feed.attach_peer(conn_id, feed_tx);
        self.connections.fetch_add(1, Ordering::Relaxed);
        info!(conn_id, node = %remote.node_id, "peer connected");

        let writer = tokio::spawn(async move {
            while let Some((channel, payload)) = outbox_rx.recv().await {
                if frames_out
                    .send(encode_frame(channel, &payload))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Inbound dispatch runs on this task until the stream ends.
        while let Some(frame) = frames_in.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(error) => {
                    debug!(conn_id, error = %error, "peer stream failed");
                    break;
                }
            };
            let Ok((channel, payload)) = decode_frame(&frame) else {
                warn!(conn_id, "ignoring malformed frame");
                continue;
            };
            match channel {
                CHANNEL_REPLICATION => {
                    if pipe_write.write_all(payload).await.is_err() {
                        break;
                    }
                }
                CHANNEL_FEED => match serde_json::from_slice::<FeedMessage>(payload) {
                    Ok(message) => self.feed.handle_message(conn_id, message),
                    Err(error) => {
                        warn!(conn_id, error = %error, "ignoring malformed feed message");
                    }
                },
                CHANNEL_TOPICS => {
                    // Topic announcements are bookkeeping only on this
                    // overlay; drives replicate regardless.
                    if let Ok(announce) = serde_json::from_slice::<TopicAnnounce>(payload) {
                        debug!(conn_id, topics = announce.topics.len(), "peer joined topics");
                    }
                }
                CHANNEL_HELLO => {}
                other => {
                    debug!(conn_id, channel = other, "ignoring unknown channel");
                }
            }
        }

        // Teardown: purge the connection everywhere.
        self.feed.detach_peer(conn_id);
        self.replicator.remove_connection(repl_conn);
        {
            let mut state = self.lock_state();
            state.peers.remove(&conn_id);
            state.node_ids.remove(&remote.node_id);
        }
        self.connections.fetch_sub(1, Ordering::Relaxed);
        repl_pump.abort();
        feed_pump.abort();
        writer.abort();
        info!(conn_id, node = %remote.node_id, "peer disconnected");
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, HostState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn encode_frame(channel: u8, payload: &[u8]) -> bytes::Bytes {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(channel);
    frame.extend_from_slice(payload);
    frame.into()
}

fn decode_frame(frame: &[u8]) -> Result<(u8, &[u8])> {
    match frame.split_first() {
        Some((channel, payload)) => Ok((*channel, payload)),
        None => Err(CoreError::internal("empty frame")),
    }
}
