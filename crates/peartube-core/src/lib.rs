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

//! Shared domain types and DTOs for the PearTube node.
//!
//! Everything that crosses a crate boundary lives here: channel keys, blob
//! descriptors, feed/seed/stats models, the persisted channel and video
//! documents, the error taxonomy, and the node's JSON key-value store.

pub mod error;
pub mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use error::{CoreError, Result};
pub use store::NodeStore;

/// A 32-byte public key naming a channel and its metadata log.
///
/// The canonical textual form is 64 lowercase hex characters; any other shape
/// is rejected at every ingress point.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey([u8; 32]);

impl ChannelKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the canonical 64-character lowercase hex form.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidKey`] when the input is not exactly 64
    /// lowercase hex characters.
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() != 64
            || !value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(CoreError::InvalidKey {
                value: value.to_string(),
            });
        }
        let mut bytes = [0_u8; 32];
        hex::decode_to_slice(value, &mut bytes).map_err(|_| CoreError::InvalidKey {
            value: value.to_string(),
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "ChannelKey({self})")
    }
}

impl FromStr for ChannelKey {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl Serialize for ChannelKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChannelKey {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// Validate a drive path: non-empty and absolute.
///
/// # Errors
///
/// Returns [`CoreError::InvalidPath`] for empty or relative paths.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(CoreError::InvalidPath {
            value: path.to_string(),
        });
    }
    Ok(())
}

/// Milliseconds since the Unix epoch, as carried by every persisted document.
#[must_use]
pub fn epoch_ms_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Location of one file's bytes inside the paired blob log.
///
/// The descriptor identifies the contiguous half-open block range
/// `[block_offset, block_offset + block_length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    /// First block of the file in the blob log.
    pub block_offset: u64,
    /// Number of blocks the file spans.
    pub block_length: u64,
    /// Total size of the file in bytes.
    pub byte_length: u64,
    /// Byte offset of the first block within the blob log.
    pub byte_offset: u64,
}

impl BlobDescriptor {
    /// End of the half-open block range.
    #[must_use]
    pub const fn block_end(&self) -> u64 {
        self.block_offset + self.block_length
    }
}

/// Where a feed entry was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSource {
    /// Announced by a remote peer.
    Peer,
    /// Submitted on this node.
    Local,
}

/// A channel known to the public feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    /// Channel the entry names.
    pub channel_key: ChannelKey,
    /// When the entry was first added, epoch milliseconds.
    pub added_at: i64,
    /// How the entry was learned.
    pub source: FeedSource,
}

/// Why a file is being seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedReason {
    /// Seeded automatically after a complete watch.
    Watched,
    /// Belongs to an explicitly pinned channel.
    Pinned,
    /// Belongs to a subscribed channel.
    Subscribed,
}

impl SeedReason {
    /// Eviction priority: higher values are evicted later.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Pinned => 3,
            Self::Subscribed => 2,
            Self::Watched => 1,
        }
    }
}

/// One pledge to keep a file's blocks present and reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRecord {
    /// Channel the file belongs to.
    pub channel_key: ChannelKey,
    /// Absolute path of the file within the drive.
    pub path: String,
    /// Why the pledge exists.
    pub reason: SeedReason,
    /// When the pledge was made, epoch milliseconds.
    pub added_at: i64,
    /// Number of blob blocks the file spans.
    pub block_count: u64,
    /// Total size of the file in bytes.
    pub byte_count: u64,
}

/// Seeding configuration persisted under the `seeding-config` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedingConfig {
    /// Storage quota in gigabytes.
    pub max_storage_gb: u64,
    /// Register a seed automatically when a watched file completes.
    pub auto_seed_watched: bool,
    /// Register seeds for subscribed channels automatically.
    pub auto_seed_subscribed: bool,
    /// Cap on automatically seeded videos per channel.
    pub max_videos_per_channel: u32,
}

impl Default for SeedingConfig {
    fn default() -> Self {
        Self {
            max_storage_gb: 10,
            auto_seed_watched: true,
            auto_seed_subscribed: false,
            max_videos_per_channel: 10,
        }
    }
}

impl SeedingConfig {
    /// Quota in bytes.
    #[must_use]
    pub const fn max_bytes(&self) -> u64 {
        self.max_storage_gb * (1 << 30)
    }

    /// Merge a partial update into this configuration.
    pub fn apply(&mut self, patch: SeedingConfigPatch) {
        if let Some(value) = patch.max_storage_gb {
            self.max_storage_gb = value;
        }
        if let Some(value) = patch.auto_seed_watched {
            self.auto_seed_watched = value;
        }
        if let Some(value) = patch.auto_seed_subscribed {
            self.auto_seed_subscribed = value;
        }
        if let Some(value) = patch.max_videos_per_channel {
            self.max_videos_per_channel = value;
        }
    }
}

/// Partial seeding configuration update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedingConfigPatch {
    /// New storage quota in gigabytes.
    #[serde(default)]
    pub max_storage_gb: Option<u64>,
    /// New auto-seed-watched flag.
    #[serde(default)]
    pub auto_seed_watched: Option<bool>,
    /// New auto-seed-subscribed flag.
    #[serde(default)]
    pub auto_seed_subscribed: Option<bool>,
    /// New per-channel auto-seed cap.
    #[serde(default)]
    pub max_videos_per_channel: Option<u32>,
}

/// Lifecycle of one tracked prefetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    /// Nothing has happened yet.
    Idle,
    /// Resolving the drive for the channel.
    Connecting,
    /// Resolving the file entry within the drive.
    Resolving,
    /// Blocks are arriving.
    Downloading,
    /// Every block of the range is local.
    Complete,
    /// The prefetch failed; see the error field.
    Error,
    /// No record exists for the queried pair.
    #[default]
    Unknown,
}

/// Live statistics for one `(channel, path)` prefetch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStats {
    /// Current lifecycle state.
    pub status: VideoStatus,
    /// Blocks in the file's blob range.
    pub total_blocks: u64,
    /// Total size of the file in bytes.
    pub total_bytes: u64,
    /// Blocks already local when the prefetch started.
    pub initial_blocks: u64,
    /// Blocks downloaded since monitoring began.
    pub downloaded_blocks: u64,
    /// Peers observed for the download.
    pub peer_count: usize,
    /// When the prefetch started, epoch milliseconds.
    pub started_at: i64,
    /// Smoothed download rate in bytes per second.
    pub download_speed: f64,
    /// Smoothed upload rate in bytes per second.
    pub upload_speed: f64,
    /// Failure detail when `status == Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VideoStats {
    /// Completion ratio in `[0, 1]`; zero while the range is unknown.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.total_blocks == 0 {
            0.0
        } else {
            blocks_to_f64(self.initial_blocks + self.downloaded_blocks)
                / blocks_to_f64(self.total_blocks)
        }
    }

    /// Whether every block of a non-empty range is local.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total_blocks > 0 && self.initial_blocks + self.downloaded_blocks >= self.total_blocks
    }

    /// The zeroed stats object served for unknown pairs.
    #[must_use]
    pub fn unknown(peer_count: usize) -> Self {
        Self {
            status: VideoStatus::Unknown,
            peer_count,
            ..Self::default()
        }
    }
}

const fn blocks_to_f64(value: u64) -> f64 {
    #[expect(
        clippy::cast_precision_loss,
        reason = "block counts are far below the f64 mantissa for progress reporting"
    )]
    {
        value as f64
    }
}

/// The `/channel.json` document of a drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    /// Display name of the channel.
    pub name: String,
    /// Free-form channel description.
    pub description: String,
    /// When the channel was created, epoch milliseconds.
    pub created_at: i64,
}

/// One `/videos/<id>.json` document of a drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    /// Identifier, also the stem of the metadata and media paths.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Absolute drive path of the media blob.
    pub path: String,
    /// Content type the player should be handed.
    pub mime_type: String,
    /// Media size in bytes.
    pub size: u64,
    /// When the video was published, epoch milliseconds.
    pub uploaded_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_key_accepts_canonical_hex() {
        let value = "aa".repeat(32);
        let key = ChannelKey::parse(&value).expect("canonical key parses");
        assert_eq!(key.to_string(), value);
        assert_eq!(key.as_bytes()[0], 0xaa);
    }

    #[test]
    fn channel_key_rejects_bad_shapes() {
        let inputs = [
            String::new(),
            "zz".to_string(),
            "aa".repeat(31),
            "aa".repeat(33),
            "AA".repeat(32),
            format!("{}g", "a".repeat(63)),
        ];
        for value in &inputs {
            assert!(
                ChannelKey::parse(value).is_err(),
                "{value:?} should be rejected"
            );
        }
    }

    #[test]
    fn channel_key_serde_round_trips_as_hex() {
        let key = ChannelKey::parse(&"ab".repeat(32)).expect("key parses");
        let json = serde_json::to_string(&key).expect("serializes");
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: ChannelKey = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(back, key);
    }

    #[test]
    fn path_validation_requires_absolute_paths() {
        assert!(validate_path("/videos/a.mp4").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("videos/a.mp4").is_err());
    }

    #[test]
    fn blob_descriptor_serialises_camel_case() {
        let blob = BlobDescriptor {
            block_offset: 4,
            block_length: 2,
            byte_length: 1024,
            byte_offset: 2048,
        };
        let value = serde_json::to_value(blob).expect("serializes");
        assert_eq!(value["blockOffset"], 4);
        assert_eq!(value["byteLength"], 1024);
        assert_eq!(blob.block_end(), 6);
    }

    #[test]
    fn seed_reason_priorities_order_eviction() {
        assert!(SeedReason::Pinned.priority() > SeedReason::Subscribed.priority());
        assert!(SeedReason::Subscribed.priority() > SeedReason::Watched.priority());
    }

    #[test]
    fn seeding_config_patch_merges_fields() {
        let mut config = SeedingConfig::default();
        config.apply(SeedingConfigPatch {
            max_storage_gb: Some(1),
            auto_seed_watched: Some(false),
            ..SeedingConfigPatch::default()
        });
        assert_eq!(config.max_storage_gb, 1);
        assert!(!config.auto_seed_watched);
        assert!(!config.auto_seed_subscribed);
        assert_eq!(config.max_bytes(), 1 << 30);
    }

    #[test]
    fn video_stats_progress_and_completion() {
        let mut stats = VideoStats {
            status: VideoStatus::Downloading,
            total_blocks: 100,
            initial_blocks: 25,
            downloaded_blocks: 25,
            ..VideoStats::default()
        };
        assert!((stats.progress() - 0.5).abs() < f64::EPSILON);
        assert!(!stats.is_complete());

        stats.downloaded_blocks = 75;
        assert!(stats.is_complete());

        let empty = VideoStats::default();
        assert!(empty.progress().abs() < f64::EPSILON);
        assert!(!empty.is_complete());
    }

    #[test]
    fn unknown_stats_carry_peer_count() {
        let stats = VideoStats::unknown(3);
        assert_eq!(stats.status, VideoStatus::Unknown);
        assert_eq!(stats.peer_count, 3);
        assert_eq!(stats.total_blocks, 0);
    }
}
