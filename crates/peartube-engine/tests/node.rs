//! End-to-end scenarios over two in-process nodes wired through loopback TCP.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use peartube_core::{NodeStore, SeedReason, VideoStatus};
use peartube_drive::ReplicatorSet;
use peartube_engine::{Node, PrefetchEngine, PublishVideo, SeedingManager};
use peartube_engine::{DriveRegistry, OpenOptions};
use peartube_events::{Event, EventBus};
use peartube_swarm::{FeedGossip, FeedMessage, SwarmHost};
use tempfile::TempDir;
use tokio::time::timeout;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

struct TestNode {
    node: Arc<Node>,
    swarm: Arc<SwarmHost>,
    seeding: Arc<SeedingManager>,
    events: EventBus,
    addr: SocketAddr,
}

async fn spawn_node(dir: &Path, bootstrap: Option<SocketAddr>) -> Result<TestNode> {
    let store = NodeStore::new(dir.join("state"));
    let events = EventBus::with_capacity(512);
    let feed = Arc::new(FeedGossip::new(store.clone(), events.clone())?);
    let identity = Node::load_or_create_identity(&store)?;

    let swarm = SwarmHost::new(identity.channel_key.to_string(), ReplicatorSet::new(), feed);
    let addr = swarm
        .bind("127.0.0.1:0".parse().context("listen addr")?)
        .await?;
    if let Some(peer) = bootstrap {
        swarm.add_bootstrap(peer.to_string());
    }

    let registry = DriveRegistry::new(dir.join("drives"), &swarm, Some(identity.keys.clone()));
    let seeding = Arc::new(SeedingManager::init(store.clone())?);
    let prefetch = PrefetchEngine::new(
        Arc::clone(&registry),
        Arc::clone(&swarm),
        Arc::clone(&seeding),
        events.clone(),
    );
    let node = Node::new(
        store,
        identity,
        registry,
        Arc::clone(&swarm),
        Arc::clone(&seeding),
        prefetch,
        events.clone(),
    );
    Ok(TestNode {
        node,
        swarm,
        seeding,
        events,
        addr,
    })
}

async fn settle(mut check: impl FnMut() -> bool) {
    timeout(SETTLE_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn settle_async<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(SETTLE_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn feed_round_trip_between_two_nodes() -> Result<()> {
    let dir = TempDir::new()?;
    let node_a = spawn_node(&dir.path().join("a"), None).await?;
    let node_b = spawn_node(&dir.path().join("b"), Some(node_a.addr)).await?;

    let swarm = Arc::clone(&node_a.swarm);
    settle(move || swarm.connection_count() == 1).await;

    let submitted = "aa".repeat(32);
    node_a.node.submit_to_feed(&submitted)?;

    let feed_b = node_b.swarm.feed();
    settle(move || feed_b.list().len() == 1).await;

    let view = node_b.node.public_feed().await;
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.entries[0].channel_key.to_string(), submitted);
    assert_eq!(view.stats.total_entries, 1);
    Ok(())
}

#[tokio::test]
async fn invalid_keys_are_rejected_at_ingress() -> Result<()> {
    let dir = TempDir::new()?;
    let node = spawn_node(dir.path(), None).await?;

    assert!(node.node.submit_to_feed("zz").is_err());
    assert!(node.node.hide_channel("not-hex").is_err());
    assert!(node.node.pin_channel(&"AA".repeat(32)).is_err());

    let view = node.node.public_feed().await;
    assert_eq!(view.stats.total_entries, 0, "feed size unchanged");
    Ok(())
}

#[tokio::test]
async fn hidden_channels_stay_hidden_from_peer_announcements() -> Result<()> {
    let dir = TempDir::new()?;
    let node = spawn_node(dir.path(), None).await?;

    let hidden = "bb".repeat(32);
    let visible = "cc".repeat(32);
    node.node.hide_channel(&hidden)?;

    node.swarm.feed().handle_message(
        42,
        FeedMessage::HaveFeed {
            keys: vec![hidden, visible.clone()],
        },
    );

    let view = node.node.public_feed().await;
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.entries[0].channel_key.to_string(), visible);
    assert_eq!(view.stats.hidden_count, 1);
    Ok(())
}

#[tokio::test]
async fn cached_prefetch_answers_immediately() -> Result<()> {
    let dir = TempDir::new()?;
    let node = spawn_node(dir.path(), None).await?;

    node.node.publish_channel("local", "local channel").await?;
    let media = vec![0x42_u8; 3 * peartube_drive::DEFAULT_BLOCK_SIZE];
    let listing = node
        .node
        .publish_video(PublishVideo {
            id: "intro".to_string(),
            title: "Intro".to_string(),
            description: String::new(),
            mime_type: "video/mp4".to_string(),
            extension: "mp4".to_string(),
            bytes: media.clone(),
        })
        .await?;

    let started = std::time::Instant::now();
    let channel = listing.channel_key.to_string();
    let report = node.node.prefetch_video(&channel, "intro").await?;
    assert!(report.cached, "all blocks are local");
    assert_eq!(report.total_blocks, 3);
    assert_eq!(report.total_bytes, media.len() as u64);
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "cached answers must not wait on the network"
    );

    let stats = node.node.video_stats(&channel, "intro").await;
    assert_eq!(stats.status, VideoStatus::Complete);
    assert!(stats.is_complete());
    Ok(())
}

#[tokio::test]
async fn prefetch_pulls_blocks_and_registers_one_watched_seed() -> Result<()> {
    let dir = TempDir::new()?;
    let publisher = spawn_node(&dir.path().join("pub"), None).await?;
    let viewer = spawn_node(&dir.path().join("view"), Some(publisher.addr)).await?;

    let swarm = Arc::clone(&viewer.swarm);
    settle(move || swarm.connection_count() == 1).await;

    publisher.node.publish_channel("pub", "publisher").await?;
    let media = vec![0x7e_u8; 4 * peartube_drive::DEFAULT_BLOCK_SIZE];
    let listing = publisher
        .node
        .publish_video(PublishVideo {
            id: "clip".to_string(),
            title: "Clip".to_string(),
            description: "a clip".to_string(),
            mime_type: "video/webm".to_string(),
            extension: "webm".to_string(),
            bytes: media,
        })
        .await?;
    let channel = listing.channel_key.to_string();

    let report = viewer.node.prefetch_video(&channel, "clip").await?;
    assert!(!report.cached);
    assert_eq!(report.total_blocks, 4);

    let seeding = Arc::clone(&viewer.seeding);
    settle(move || seeding.status().active_seeds == 1).await;

    let status = viewer.seeding.status();
    assert_eq!(status.active_seeds, 1, "seed registered exactly once");
    assert_eq!(status.seeds[0].reason, SeedReason::Watched);
    assert!(status.seeds[0].path.ends_with("clip.webm"));

    let node = Arc::clone(&viewer.node);
    let channel_probe = channel.clone();
    settle_async(move || {
        let node = Arc::clone(&node);
        let channel = channel_probe.clone();
        async move {
            node.video_stats(&channel, "clip").await.status == VideoStatus::Complete
        }
    })
    .await;

    // A second completed watch of the same file does not add another pledge.
    let again = viewer.node.prefetch_video(&channel, "clip").await?;
    assert!(again.cached);
    assert_eq!(viewer.seeding.status().active_seeds, 1);
    Ok(())
}

#[tokio::test]
async fn video_listing_and_urls_follow_the_published_layout() -> Result<()> {
    let dir = TempDir::new()?;
    let publisher = spawn_node(&dir.path().join("pub"), None).await?;
    let viewer = spawn_node(&dir.path().join("view"), Some(publisher.addr)).await?;

    let swarm = Arc::clone(&viewer.swarm);
    settle(move || swarm.connection_count() == 1).await;

    publisher.node.publish_channel("tube", "a tube").await?;
    publisher
        .node
        .publish_video(PublishVideo {
            id: "first".to_string(),
            title: "First".to_string(),
            description: String::new(),
            mime_type: "video/mp4".to_string(),
            extension: "mp4".to_string(),
            bytes: vec![1_u8; 512],
        })
        .await?;
    let channel = publisher.node.channel_key().to_string();

    let videos = viewer.node.list_videos(&channel).await?;
    assert_eq!(videos.len(), 1);
    assert_eq!(videos[0].info.id, "first");
    assert_eq!(videos[0].info.path, "/videos/first.mp4");

    let meta = viewer.node.channel_meta(&channel).await?;
    assert_eq!(meta.name, "tube");
    assert_eq!(meta.video_count, 1);

    viewer.node.set_blob_server_port(40_123);
    let url = viewer.node.video_url(&channel, "first").await?;
    assert!(url.starts_with("http://127.0.0.1:40123/"));
    assert!(url.ends_with("?mime=video/mp4"));
    Ok(())
}

#[tokio::test]
async fn stats_events_report_monotonic_progress() -> Result<()> {
    let dir = TempDir::new()?;
    let publisher = spawn_node(&dir.path().join("pub"), None).await?;
    let viewer = spawn_node(&dir.path().join("view"), Some(publisher.addr)).await?;

    let swarm = Arc::clone(&viewer.swarm);
    settle(move || swarm.connection_count() == 1).await;

    publisher.node.publish_channel("pub", "publisher").await?;
    let listing = publisher
        .node
        .publish_video(PublishVideo {
            id: "steady".to_string(),
            title: "Steady".to_string(),
            description: String::new(),
            mime_type: "video/mp4".to_string(),
            extension: "mp4".to_string(),
            bytes: vec![9_u8; 6 * peartube_drive::DEFAULT_BLOCK_SIZE],
        })
        .await?;
    let channel = listing.channel_key.to_string();

    let mut stream = viewer.events.subscribe(None);
    viewer.node.prefetch_video(&channel, "steady").await?;

    let mut last_bytes = 0_u64;
    let mut saw_complete = false;
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while !saw_complete {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let envelope = timeout(remaining, stream.next())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        if let Event::VideoStats {
            downloaded_bytes,
            download_progress,
            ..
        } = envelope.event
        {
            assert!(
                downloaded_bytes >= last_bytes,
                "progress must be monotonic within one prefetch"
            );
            last_bytes = downloaded_bytes;
            if (download_progress - 100.0).abs() < f64::EPSILON {
                saw_complete = true;
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn unknown_stats_are_zeroed_and_never_fail() -> Result<()> {
    let dir = TempDir::new()?;
    let node = spawn_node(dir.path(), None).await?;

    let stats = node
        .node
        .video_stats(&"dd".repeat(32), "never-fetched")
        .await;
    assert_eq!(stats.status, VideoStatus::Unknown);
    assert_eq!(stats.total_blocks, 0);

    let malformed = node.node.video_stats("not-a-key", "x").await;
    assert_eq!(malformed.status, VideoStatus::Unknown);
    Ok(())
}

#[tokio::test]
async fn prefetch_of_a_missing_video_surfaces_not_found() -> Result<()> {
    let dir = TempDir::new()?;
    let node = spawn_node(dir.path(), None).await?;
    node.node.publish_channel("solo", "no videos").await?;

    let channel = node.node.channel_key().to_string();
    let result = node.node.prefetch_video(&channel, "ghost").await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn registry_hands_out_one_drive_per_key() -> Result<()> {
    let dir = TempDir::new()?;
    let node = spawn_node(dir.path(), None).await?;
    let registry = node.node.registry();

    let key = peartube_core::ChannelKey::from_bytes([0x3c; 32]);
    let first = registry.open(key, OpenOptions::default()).await?;
    let second = registry.open(key, OpenOptions::default()).await?;
    assert!(Arc::ptr_eq(&first, &second));
    Ok(())
}
