//! Wires the node together and runs it until shutdown.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use peartube_api::{ApiServer, BlobBridge};
use peartube_core::NodeStore;
use peartube_drive::ReplicatorSet;
use peartube_engine::{DriveRegistry, Node, OpenOptions, PrefetchEngine, SeedingManager};
use peartube_events::{Event, EventBus};
use peartube_swarm::{FeedGossip, SwarmHost};
use peartube_telemetry::LoggingConfig;
use tracing::{error, info};

use crate::config::NodeConfig;
use crate::error::{AppError, AppResult};

/// Entry point for the PearTube node boot sequence.
///
/// # Errors
///
/// Returns an error when configuration, wiring, or the API listener fails.
pub async fn run_app() -> AppResult<()> {
    peartube_telemetry::init_logging(&LoggingConfig::default())
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    let config = NodeConfig::from_env()?;
    info!(data_dir = %config.data_dir.display(), "PearTube node starting");

    let events = EventBus::new();
    match assemble(&config, events.clone()).await {
        Ok(node) => serve(&config, node).await,
        Err(err) => {
            // Initialisation failures are fatal: announce and exit.
            error!(error = %err, "core initialisation failed");
            events.publish(Event::Error {
                message: err.to_string(),
            });
            Err(err)
        }
    }
}

async fn assemble(config: &NodeConfig, events: EventBus) -> AppResult<Arc<Node>> {
    let store = NodeStore::new(config.state_dir());
    store
        .ensure_initialized()
        .map_err(|err| AppError::core("store.init", err))?;

    let identity =
        Node::load_or_create_identity(&store).map_err(|err| AppError::core("identity", err))?;
    let feed = Arc::new(
        FeedGossip::new(store.clone(), events.clone())
            .map_err(|err| AppError::core("feed.init", err))?,
    );

    let swarm = SwarmHost::new(
        identity.channel_key.to_string(),
        ReplicatorSet::new(),
        feed,
    );
    swarm
        .bind(config.swarm_addr)
        .await
        .map_err(|err| AppError::core("swarm.bind", err))?;
    for peer in &config.bootstrap {
        swarm.add_bootstrap(peer.clone());
    }

    // Rendezvous for channel discovery: the well-known public feed topic.
    swarm
        .join(peartube_drive::topic_hash(peartube_swarm::FEED_TOPIC_NAME))
        .flushed()
        .await
        .map_err(|err| AppError::core("swarm.join_feed", err))?;

    let registry = DriveRegistry::new(config.drives_dir(), &swarm, Some(identity.keys.clone()));
    let seeding = Arc::new(
        SeedingManager::init(store.clone()).map_err(|err| AppError::core("seeding.init", err))?,
    );
    let prefetch = PrefetchEngine::new(
        Arc::clone(&registry),
        Arc::clone(&swarm),
        Arc::clone(&seeding),
        events.clone(),
    );
    let node = Node::new(
        store,
        identity,
        Arc::clone(&registry),
        swarm,
        seeding,
        prefetch,
        events,
    );

    // Keep the local channel open so it replicates and announces from boot.
    registry
        .open(node.channel_key(), OpenOptions::default())
        .await
        .map_err(|err| AppError::core("registry.open_own", err))?;

    let bridge = BlobBridge::new(registry);
    let port = bridge
        .serve()
        .await
        .map_err(|err| AppError::core("bridge.serve", err))?;
    node.set_blob_server_port(port);
    node.events().publish(Event::Ready {
        blob_server_port: port,
    });
    info!(port, "core initialised");
    Ok(node)
}

async fn serve(config: &NodeConfig, node: Arc<Node>) -> AppResult<()> {
    let api = ApiServer::new(node);
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.api_port);
    info!(addr = %addr, "launching control-plane listener");

    tokio::select! {
        served = api.serve(addr) => {
            served.map_err(|err| AppError::core("api.serve", err))
        }
        signalled = tokio::signal::ctrl_c() => {
            if let Err(err) = signalled {
                error!(error = %err, "signal handler failed");
            }
            info!("shutdown signal received");
            Ok(())
        }
    }
}
