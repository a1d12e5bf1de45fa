//! Control-plane HTTP server: the UI's request/response methods plus the
//! server-push event stream.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{self, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use peartube_core::{CoreError, SeedingConfigPatch};
use peartube_engine::{Node, PublishVideo};
use peartube_events::{EventBus, EventId};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::ApiError;

const HEADER_LAST_EVENT_ID: &str = "last-event-id";
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

struct ApiState {
    node: Arc<Node>,
    events: EventBus,
}

/// Axum router wrapper hosting the control plane.
pub struct ApiServer {
    router: Router,
}

impl ApiServer {
    /// Build the server over the node facade.
    #[must_use]
    pub fn new(node: Arc<Node>) -> Self {
        let events = node.events();
        let state = Arc::new(ApiState { node, events });
        let router = Router::new()
            .route("/v1/feed", get(get_public_feed))
            .route("/v1/feed/refresh", post(refresh_feed))
            .route("/v1/feed/submit", post(submit_to_feed))
            .route("/v1/feed/hide", post(hide_channel))
            .route("/v1/channels/{key}/meta", get(get_channel_meta))
            .route("/v1/channels/{key}/videos", get(list_videos))
            .route("/v1/channels/{key}/videos/{id}/url", get(get_video_url))
            .route(
                "/v1/channels/{key}/videos/{id}/prefetch",
                post(prefetch_video),
            )
            .route("/v1/channels/{key}/videos/{id}/stats", get(get_video_stats))
            .route("/v1/seeding/status", get(get_seeding_status))
            .route("/v1/seeding/config", post(set_seeding_config))
            .route("/v1/seeding/pin", post(pin_channel))
            .route("/v1/seeding/unpin", post(unpin_channel))
            .route("/v1/seeding/pinned", get(get_pinned_channels))
            .route("/v1/subscriptions", get(get_subscriptions))
            .route("/v1/subscriptions/add", post(add_subscription))
            .route("/v1/subscriptions/remove", post(remove_subscription))
            .route("/v1/publish/channel", post(publish_channel))
            .route("/v1/publish/video", post(publish_video))
            .route("/v1/server/port", get(get_blob_server_port))
            .route("/v1/events", get(stream_events))
            .layer(TraceLayer::new_for_http())
            .with_state(state);
        Self { router }
    }

    /// Bind and serve until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns an error when binding or serving fails.
    pub async fn serve(self, addr: SocketAddr) -> peartube_core::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CoreError::storage("api.bind", source))?;
        axum::serve(listener, self.router.into_make_service())
            .await
            .map_err(|source| CoreError::storage("api.serve", source))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelKeyBody {
    channel_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishChannelBody {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishVideoBody {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    mime_type: String,
    extension: String,
    /// Media payload, base64 encoded.
    bytes: String,
}

async fn get_public_feed(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let feed = state.node.public_feed().await;
    Json(json!({ "entries": feed.entries, "stats": feed.stats }))
}

async fn refresh_feed(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let contacted = state.node.refresh_feed();
    Json(json!({ "success": true, "peerCount": contacted }))
}

async fn submit_to_feed(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ChannelKeyBody>,
) -> Result<Json<Value>, ApiError> {
    state.node.submit_to_feed(&body.channel_key)?;
    Ok(Json(json!({ "success": true })))
}

async fn hide_channel(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ChannelKeyBody>,
) -> Result<Json<Value>, ApiError> {
    state.node.hide_channel(&body.channel_key)?;
    Ok(Json(json!({ "success": true })))
}

async fn get_channel_meta(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let meta = state.node.channel_meta(&key).await?;
    Ok(Json(serde_json::to_value(meta).map_err(|error| {
        ApiError::internal(error.to_string())
    })?))
}

async fn list_videos(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let videos = state.node.list_videos(&key).await?;
    Ok(Json(json!({ "videos": videos })))
}

async fn get_video_url(
    State(state): State<Arc<ApiState>>,
    Path((key, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let url = state.node.video_url(&key, &id).await?;
    Ok(Json(json!({ "url": url })))
}

async fn prefetch_video(
    State(state): State<Arc<ApiState>>,
    Path((key, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let report = state.node.prefetch_video(&key, &id).await?;
    Ok(Json(json!({ "success": true, "report": report })))
}

async fn get_video_stats(
    State(state): State<Arc<ApiState>>,
    Path((key, id)): Path<(String, String)>,
) -> Json<Value> {
    let stats = state.node.video_stats(&key, &id).await;
    Json(json!({ "stats": stats }))
}

async fn get_seeding_status(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({ "status": state.node.seeding_status() }))
}

async fn set_seeding_config(
    State(state): State<Arc<ApiState>>,
    Json(patch): Json<SeedingConfigPatch>,
) -> Result<Json<Value>, ApiError> {
    let config = state.node.set_seeding_config(patch)?;
    Ok(Json(json!({ "success": true, "config": config })))
}

async fn pin_channel(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ChannelKeyBody>,
) -> Result<Json<Value>, ApiError> {
    state.node.pin_channel(&body.channel_key)?;
    Ok(Json(json!({ "success": true })))
}

async fn unpin_channel(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ChannelKeyBody>,
) -> Result<Json<Value>, ApiError> {
    state.node.unpin_channel(&body.channel_key)?;
    Ok(Json(json!({ "success": true })))
}

async fn get_pinned_channels(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({ "channels": state.node.pinned_channels() }))
}

async fn get_subscriptions(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!({ "channels": state.node.subscriptions()? })))
}

async fn add_subscription(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ChannelKeyBody>,
) -> Result<Json<Value>, ApiError> {
    state.node.subscribe(&body.channel_key)?;
    Ok(Json(json!({ "success": true })))
}

async fn remove_subscription(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ChannelKeyBody>,
) -> Result<Json<Value>, ApiError> {
    state.node.unsubscribe(&body.channel_key)?;
    Ok(Json(json!({ "success": true })))
}

async fn publish_channel(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<PublishChannelBody>,
) -> Result<Json<Value>, ApiError> {
    let channel_key = state
        .node
        .publish_channel(&body.name, &body.description)
        .await?;
    Ok(Json(json!({ "success": true, "channelKey": channel_key })))
}

async fn publish_video(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<PublishVideoBody>,
) -> Result<Json<Value>, ApiError> {
    let bytes = BASE64
        .decode(&body.bytes)
        .map_err(|_| ApiError::bad_request("video bytes are not valid base64"))?;
    let listing = state
        .node
        .publish_video(PublishVideo {
            id: body.id,
            title: body.title,
            description: body.description,
            mime_type: body.mime_type,
            extension: body.extension,
            bytes,
        })
        .await?;
    Ok(Json(json!({ "success": true, "video": listing })))
}

async fn get_blob_server_port(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({ "port": state.node.blob_server_port() }))
}

async fn stream_events(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Sse<impl futures_core::Stream<Item = Result<sse::Event, Infallible>> + Send> {
    let last_id = headers
        .get(HEADER_LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<EventId>().ok());
    let events = state.events.clone();

    let stream = stream! {
        let mut subscription = events.subscribe(last_id);
        while let Some(envelope) = subscription.next().await {
            match serde_json::to_string(&envelope) {
                Ok(payload) => {
                    yield Ok(sse::Event::default()
                        .id(envelope.id.to_string())
                        .event(envelope.event.kind())
                        .data(payload));
                }
                Err(err) => {
                    error!(error = %err, "failed to serialise SSE event payload");
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        sse::KeepAlive::new()
            .interval(SSE_KEEP_ALIVE)
            .text("keep-alive"),
    )
}
