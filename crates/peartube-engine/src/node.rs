//! Facade the control plane talks to.
//!
//! Bundles the registry, gossip, prefetch, and seeding components behind the
//! method surface of the UI protocol, and owns the node identity (the local
//! channel's key material) plus the subscription set.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use peartube_core::store::{KEY_IDENTITY, KEY_SUBSCRIPTIONS};
use peartube_core::{
    ChannelInfo, ChannelKey, CoreError, NodeStore, Result, SeedingConfig, SeedingConfigPatch,
    VideoInfo, VideoStats, epoch_ms_now,
};
use peartube_drive::{Drive, DriveKeys, LogId};
use peartube_events::EventBus;
use peartube_swarm::{FeedGossip, FeedStats, SwarmHost};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::prefetch::{PrefetchEngine, PrefetchReport};
use crate::registry::{DriveRegistry, OpenOptions};
use crate::seeding::{SeedingManager, SeedingStatus};

/// Budget for resolving feed documents (entry wait and block fetch alike).
const DOCUMENT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// The node's persisted identity: its own channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDoc {
    /// Channel key of the local channel.
    pub channel_key: ChannelKey,
    /// Owner key material for the local channel's drive.
    pub keys: DriveKeys,
}

/// One enriched feed row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedViewEntry {
    /// Channel the entry names.
    pub channel_key: ChannelKey,
    /// Channel display name, when the drive has replicated far enough.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    /// Number of published videos, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_count: Option<usize>,
    /// Peers replicating the channel, when the drive is open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_count: Option<usize>,
    /// When the entry was learned, epoch milliseconds.
    pub last_seen: i64,
}

/// The public feed as served to the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedView {
    /// Visible entries, newest first.
    pub entries: Vec<FeedViewEntry>,
    /// Aggregate counters.
    pub stats: FeedStats,
}

/// Channel metadata synthesised from `/channel.json` and the video listing.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMeta {
    /// Channel display name; empty while unreplicated.
    pub name: String,
    /// Channel description; empty while unreplicated.
    pub description: String,
    /// Number of `/videos/*.json` documents.
    pub video_count: usize,
}

/// One video row of a channel listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoListing {
    /// The published metadata document.
    #[serde(flatten)]
    pub info: VideoInfo,
    /// Channel the video belongs to.
    pub channel_key: ChannelKey,
}

/// Request to publish a video into the local channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishVideo {
    /// Video identifier, also the path stem.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Content type handed to players.
    pub mime_type: String,
    /// Media file extension (e.g. `mp4`).
    pub extension: String,
    /// Raw media bytes.
    pub bytes: Vec<u8>,
}

/// The assembled PearTube node core.
pub struct Node {
    store: NodeStore,
    identity: IdentityDoc,
    registry: Arc<DriveRegistry>,
    swarm: Arc<SwarmHost>,
    feed: Arc<FeedGossip>,
    seeding: Arc<SeedingManager>,
    prefetch: Arc<PrefetchEngine>,
    events: EventBus,
    blob_port: AtomicU16,
}

impl Node {
    /// Load the node identity, generating and persisting one on first boot.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read or written.
    pub fn load_or_create_identity(store: &NodeStore) -> Result<IdentityDoc> {
        if let Some(identity) = store.get::<IdentityDoc>(KEY_IDENTITY)? {
            return Ok(identity);
        }
        let keys = DriveKeys::generate();
        let identity = IdentityDoc {
            channel_key: keys.channel_key()?,
            keys,
        };
        store.put(KEY_IDENTITY, &identity)?;
        info!(channel = %identity.channel_key, "generated node identity");
        Ok(identity)
    }

    /// Assemble the facade over its components.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: NodeStore,
        identity: IdentityDoc,
        registry: Arc<DriveRegistry>,
        swarm: Arc<SwarmHost>,
        seeding: Arc<SeedingManager>,
        prefetch: Arc<PrefetchEngine>,
        events: EventBus,
    ) -> Arc<Self> {
        let feed = swarm.feed();
        Arc::new(Self {
            store,
            identity,
            registry,
            swarm,
            feed,
            seeding,
            prefetch,
            events,
            blob_port: AtomicU16::new(0),
        })
    }

    /// The event bus shared with the control plane.
    #[must_use]
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// The drive registry.
    #[must_use]
    pub fn registry(&self) -> Arc<DriveRegistry> {
        Arc::clone(&self.registry)
    }

    /// The local channel key.
    #[must_use]
    pub const fn channel_key(&self) -> ChannelKey {
        self.identity.channel_key
    }

    /// Record the bound blob bridge port.
    pub fn set_blob_server_port(&self, port: u16) {
        self.blob_port.store(port, Ordering::Relaxed);
    }

    /// The bound blob bridge port (zero before the bridge is up).
    #[must_use]
    pub fn blob_server_port(&self) -> u16 {
        self.blob_port.load(Ordering::Relaxed)
    }

    /// The visible public feed with whatever channel detail is local.
    pub async fn public_feed(&self) -> FeedView {
        let mut entries = Vec::new();
        for entry in self.feed.list() {
            let mut row = FeedViewEntry {
                channel_key: entry.channel_key,
                channel_name: None,
                video_count: None,
                peer_count: None,
                last_seen: entry.added_at,
            };
            if let Some(drive) = self.registry.get_open(entry.channel_key).await {
                if let Ok(Some(bytes)) = drive.read_file("/channel.json")
                    && let Ok(info) = serde_json::from_slice::<ChannelInfo>(&bytes)
                {
                    row.channel_name = Some(info.name);
                }
                if let Ok(videos) = drive.entries_under("/videos/") {
                    row.video_count = Some(
                        videos
                            .iter()
                            .filter(|(path, _)| path.ends_with(".json"))
                            .count(),
                    );
                }
                row.peer_count = Some(
                    self.registry
                        .replicator()
                        .peer_count(&drive.discovery_key()),
                );
            }
            entries.push(row);
        }
        FeedView {
            entries,
            stats: self.feed.stats(),
        }
    }

    /// Re-request the feed from every peer; returns the number contacted.
    #[must_use]
    pub fn refresh_feed(&self) -> usize {
        self.feed.request_from_peers()
    }

    /// Submit a channel key to the public feed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for malformed keys.
    pub fn submit_to_feed(&self, channel_key: &str) -> Result<()> {
        self.feed.submit(channel_key)?;
        Ok(())
    }

    /// Permanently hide a channel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for malformed keys or a storage error.
    pub fn hide_channel(&self, channel_key: &str) -> Result<()> {
        self.feed.hide(channel_key)
    }

    /// Channel metadata synthesised from the drive's documents.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for malformed keys or a storage error; a channel
    /// that has not replicated yet yields empty defaults.
    pub async fn channel_meta(&self, channel_key: &str) -> Result<ChannelMeta> {
        let key = ChannelKey::parse(channel_key)?;
        let drive = self
            .registry
            .open(key, OpenOptions {
                wait_for_sync: true,
                ..OpenOptions::default()
            })
            .await?;

        let mut meta = ChannelMeta::default();
        if let Some(bytes) = self.fetch_document(&drive, "/channel.json").await?
            && let Ok(info) = serde_json::from_slice::<ChannelInfo>(&bytes)
        {
            meta.name = info.name;
            meta.description = info.description;
        }
        meta.video_count = drive
            .entries_under("/videos/")?
            .iter()
            .filter(|(path, _)| path.ends_with(".json"))
            .count();
        Ok(meta)
    }

    /// The channel's published videos, newest first.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for malformed keys or a storage error.
    pub async fn list_videos(&self, channel_key: &str) -> Result<Vec<VideoListing>> {
        let key = ChannelKey::parse(channel_key)?;
        let drive = self
            .registry
            .open(key, OpenOptions {
                wait_for_sync: true,
                ..OpenOptions::default()
            })
            .await?;

        let mut videos = Vec::new();
        for (path, _blob) in drive.entries_under("/videos/")? {
            if !path.ends_with(".json") {
                continue;
            }
            let Some(bytes) = self.fetch_document(&drive, &path).await? else {
                debug!(channel = %key, path, "video document not replicated yet");
                continue;
            };
            match serde_json::from_slice::<VideoInfo>(&bytes) {
                Ok(info) => videos.push(VideoListing {
                    info,
                    channel_key: key,
                }),
                Err(error) => debug!(channel = %key, path, error = %error, "skipping malformed video document"),
            }
        }
        videos.sort_by(|a, b| b.info.uploaded_at.cmp(&a.info.uploaded_at));
        Ok(videos)
    }

    /// Blob bridge URL for a video, carrying the content type chosen here.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the video or its blob is unknown.
    pub async fn video_url(&self, channel_key: &str, video_id: &str) -> Result<String> {
        let key = ChannelKey::parse(channel_key)?;
        let drive = self
            .registry
            .open(key, OpenOptions::default())
            .await?;
        let info = self.video_info(&drive, video_id).await?;
        let blob = drive
            .entry(&info.path)?
            .ok_or_else(|| CoreError::NotFound {
                path: info.path.clone(),
            })?;
        let blobs = drive
            .blobs()
            .ok_or_else(|| CoreError::internal("drive has no blob log for its video"))?;

        let descriptor = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&blob)
                .map_err(|source| CoreError::encoding("video_url", source))?,
        );
        Ok(format!(
            "http://127.0.0.1:{}/{}/{}?mime={}",
            self.blob_server_port(),
            hex::encode(blobs.public_key()),
            descriptor,
            info.mime_type,
        ))
    }

    /// Prefetch a video's media blob.
    ///
    /// # Errors
    ///
    /// Surfaces validation, resolution, and drive-open failures.
    pub async fn prefetch_video(&self, channel_key: &str, video_id: &str) -> Result<PrefetchReport> {
        let key = ChannelKey::parse(channel_key)?;
        let drive = self
            .registry
            .open(key, OpenOptions::default())
            .await?;
        let info = self.video_info(&drive, video_id).await?;
        self.prefetch.prefetch(channel_key, &info.path).await
    }

    /// Stats for a video's prefetch. Never fails.
    pub async fn video_stats(&self, channel_key: &str, video_id: &str) -> VideoStats {
        let Ok(key) = ChannelKey::parse(channel_key) else {
            return VideoStats::unknown(self.swarm.connection_count());
        };
        let Some(drive) = self.registry.get_open(key).await else {
            return VideoStats::unknown(self.swarm.connection_count());
        };
        let path = drive
            .read_file(&format!("/videos/{video_id}.json"))
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice::<VideoInfo>(&bytes).ok())
            .map(|info| info.path);
        match path {
            Some(path) => self.prefetch.stats(channel_key, &path),
            None => VideoStats::unknown(self.swarm.connection_count()),
        }
    }

    /// Aggregate seeding status.
    #[must_use]
    pub fn seeding_status(&self) -> SeedingStatus {
        self.seeding.status()
    }

    /// Merge a seeding configuration patch.
    ///
    /// # Errors
    ///
    /// Returns a storage error when persistence fails.
    pub fn set_seeding_config(&self, patch: SeedingConfigPatch) -> Result<SeedingConfig> {
        self.seeding.set_config(patch)
    }

    /// Pin a channel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for malformed keys or a storage error.
    pub fn pin_channel(&self, channel_key: &str) -> Result<()> {
        self.seeding.pin(ChannelKey::parse(channel_key)?)
    }

    /// Unpin a channel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for malformed keys or a storage error.
    pub fn unpin_channel(&self, channel_key: &str) -> Result<()> {
        self.seeding.unpin(ChannelKey::parse(channel_key)?)
    }

    /// The pinned-channel set.
    #[must_use]
    pub fn pinned_channels(&self) -> Vec<ChannelKey> {
        self.seeding.pinned_channels()
    }

    /// Subscribe to a channel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for malformed keys or a storage error.
    pub fn subscribe(&self, channel_key: &str) -> Result<()> {
        let key = ChannelKey::parse(channel_key)?;
        let mut subscriptions = self.subscriptions()?;
        if !subscriptions.contains(&key) {
            subscriptions.push(key);
            self.store.put(KEY_SUBSCRIPTIONS, &subscriptions)?;
        }
        Ok(())
    }

    /// Unsubscribe from a channel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for malformed keys or a storage error.
    pub fn unsubscribe(&self, channel_key: &str) -> Result<()> {
        let key = ChannelKey::parse(channel_key)?;
        let mut subscriptions = self.subscriptions()?;
        let before = subscriptions.len();
        subscriptions.retain(|existing| *existing != key);
        if subscriptions.len() != before {
            self.store.put(KEY_SUBSCRIPTIONS, &subscriptions)?;
        }
        Ok(())
    }

    /// The subscribed-channel set.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the set cannot be loaded.
    pub fn subscriptions(&self) -> Result<Vec<ChannelKey>> {
        Ok(self
            .store
            .get::<Vec<ChannelKey>>(KEY_SUBSCRIPTIONS)?
            .unwrap_or_default())
    }

    /// Write the local channel's `/channel.json` and announce the channel on
    /// the feed.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the drive write fails.
    pub async fn publish_channel(&self, name: &str, description: &str) -> Result<ChannelKey> {
        let drive = self.own_drive().await?;
        let info = ChannelInfo {
            name: name.to_string(),
            description: description.to_string(),
            created_at: epoch_ms_now(),
        };
        let bytes = serde_json::to_vec(&info)
            .map_err(|source| CoreError::encoding("publish_channel", source))?;
        drive.write_file("/channel.json", &bytes)?;
        self.feed.submit(&self.identity.channel_key.to_string())?;
        info!(channel = %self.identity.channel_key, name, "channel published");
        Ok(self.identity.channel_key)
    }

    /// Publish a video into the local channel: media blob plus metadata
    /// document, laid out for interop.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the drive writes fail.
    pub async fn publish_video(&self, request: PublishVideo) -> Result<VideoListing> {
        let drive = self.own_drive().await?;
        let media_path = format!("/videos/{}.{}", request.id, request.extension);
        drive.write_file(&media_path, &request.bytes)?;

        let info = VideoInfo {
            id: request.id.clone(),
            title: request.title,
            description: request.description,
            path: media_path,
            mime_type: request.mime_type,
            size: request.bytes.len() as u64,
            uploaded_at: epoch_ms_now(),
        };
        let document = serde_json::to_vec(&info)
            .map_err(|source| CoreError::encoding("publish_video", source))?;
        drive.write_file(&format!("/videos/{}.json", request.id), &document)?;
        info!(channel = %self.identity.channel_key, video = %info.id, bytes = info.size, "video published");
        Ok(VideoListing {
            info,
            channel_key: self.identity.channel_key,
        })
    }

    async fn own_drive(&self) -> Result<Arc<Drive>> {
        let drive = self
            .registry
            .open(self.identity.channel_key, OpenOptions::default())
            .await?;
        if !drive.writable() {
            return Err(CoreError::ReadOnly);
        }
        Ok(drive)
    }

    async fn video_info(&self, drive: &Arc<Drive>, video_id: &str) -> Result<VideoInfo> {
        let path = format!("/videos/{video_id}.json");
        let bytes = self
            .fetch_document(drive, &path)
            .await?
            .ok_or(CoreError::NotFound { path })?;
        serde_json::from_slice(&bytes)
            .map_err(|source| CoreError::encoding("video_info", source))
    }

    /// Resolve a small document with a bounded wait for both the entry and
    /// its blob blocks, falling back to whatever is local.
    async fn fetch_document(&self, drive: &Arc<Drive>, path: &str) -> Result<Option<Vec<u8>>> {
        let Some(blob) = drive.entry_wait(path, DOCUMENT_FETCH_TIMEOUT).await? else {
            return Ok(None);
        };
        if let Some(blobs) = drive.blobs() {
            let range = blob.block_offset..blob.block_end();
            if !blobs.missing_in(range.clone()).is_empty() {
                let _ = tokio::time::timeout(
                    DOCUMENT_FETCH_TIMEOUT,
                    self.registry
                        .replicator()
                        .download_range(drive, LogId::Blobs, range),
                )
                .await;
            }
        }
        drive.read_file(path)
    }
}
