//! The blob HTTP bridge.
//!
//! Maps `GET /{blobs_key_hex}/{descriptor}` to the byte stream of one file's
//! blob range so a local media player can play while blocks are still
//! arriving. Reads use the non-waiting session policy: locally present
//! blocks stream immediately, the first absent block ends the body (a short
//! read the player recovers from by re-requesting). Range requests are
//! honoured because the player's seek UX depends on them. The server binds
//! to loopback on an ephemeral port. No auth.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use peartube_core::{BlobDescriptor, CoreError};
use peartube_drive::{BlobStoreAdapter, DEFAULT_BLOCK_SIZE, GetOptions};
use peartube_engine::DriveRegistry;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Per-core session budget: reads never stall a player longer than this.
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

struct BridgeState {
    registry: Arc<DriveRegistry>,
}

/// Loopback HTTP server streaming blob ranges to local players.
pub struct BlobBridge {
    registry: Arc<DriveRegistry>,
}

impl BlobBridge {
    /// Build the bridge over the drive registry.
    #[must_use]
    pub const fn new(registry: Arc<DriveRegistry>) -> Self {
        Self { registry }
    }

    /// Bind loopback on an ephemeral port and serve in the background.
    ///
    /// Returns the chosen port for the `ready` announcement.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot bind.
    pub async fn serve(self) -> peartube_core::Result<u16> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .map_err(|source| CoreError::storage("bridge.bind", source))?;
        let port = listener
            .local_addr()
            .map_err(|source| CoreError::storage("bridge.bind", source))?
            .port();
        info!(port, "blob bridge listening");

        let router = self.router();
        tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, router.into_make_service()).await {
                tracing::error!(error = %error, "blob bridge server failed");
            }
        });
        Ok(port)
    }

    fn router(&self) -> Router {
        let state = Arc::new(BridgeState {
            registry: Arc::clone(&self.registry),
        });
        Router::new()
            .route("/{key}/{descriptor}", get(serve_blob))
            .with_state(state)
    }
}

async fn serve_blob(
    State(state): State<Arc<BridgeState>>,
    Path((key, descriptor)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let Some(blobs_key) = parse_key(&key) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(blob) = parse_descriptor(&descriptor) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(log) = state.registry.blob_log(&blobs_key).await else {
        debug!(key, "no open drive serves this blob log");
        return StatusCode::NOT_FOUND.into_response();
    };
    let adapter = BlobStoreAdapter::new(log).with_default_timeout(SESSION_TIMEOUT);

    let total = blob.byte_length;
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_range(value, total));
    if headers.contains_key(header::RANGE) && range.is_none() {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    }
    let (start, end) = range.unwrap_or((0, total.saturating_sub(1)));
    let content_length = if total == 0 { 0 } else { end - start + 1 };

    let mime = params
        .get("mime")
        .cloned()
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let body = if content_length == 0 {
        Body::empty()
    } else {
        Body::from_stream(block_stream(adapter, blob, start, content_length))
    };

    let mut response = Response::builder()
        .status(if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::CONTENT_TYPE, mime)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, content_length);
    if range.is_some() {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{total}"),
        );
    }
    response
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Stream `length` bytes of the blob starting at byte `start`, ending early
/// at the first absent block.
fn block_stream(
    adapter: BlobStoreAdapter,
    blob: BlobDescriptor,
    start: u64,
    length: u64,
) -> impl futures_core::Stream<Item = Result<Bytes, std::io::Error>> + Send {
    stream! {
        let block_size = DEFAULT_BLOCK_SIZE as u64;
        let mut index = blob.block_offset + start / block_size;
        let mut skip = start % block_size;
        let mut remaining = length;

        while remaining > 0 && index < blob.block_end() {
            // Local blocks only: an absent block ends the stream rather than
            // stalling the player on a network fetch.
            match adapter.get(index, GetOptions::local_only()).await {
                Ok(Some(block)) => {
                    let available = block.len() as u64;
                    if skip >= available {
                        break;
                    }
                    let take = remaining.min(available - skip);
                    let from = usize::try_from(skip).unwrap_or(usize::MAX);
                    let to = usize::try_from(skip + take).unwrap_or(usize::MAX);
                    yield Ok(block.slice(from..to));
                    remaining -= take;
                    skip = 0;
                    index += 1;
                }
                Ok(None) => {
                    debug!(index, "blob block not local; ending stream short");
                    break;
                }
                Err(error) => {
                    debug!(index, error = %error, "blob read failed; ending stream");
                    break;
                }
            }
        }
    }
}

fn parse_key(value: &str) -> Option<[u8; 32]> {
    let mut key = [0_u8; 32];
    hex::decode_to_slice(value, &mut key).ok()?;
    Some(key)
}

fn parse_descriptor(value: &str) -> Option<BlobDescriptor> {
    let raw = URL_SAFE_NO_PAD.decode(value).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Parse a single `bytes=` range against `total`, returning inclusive
/// bounds.
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    let spec = value.strip_prefix("bytes=")?.split(',').next()?.trim();
    let (start_raw, end_raw) = spec.split_once('-')?;

    if start_raw.is_empty() {
        // Suffix form: the final N bytes.
        let suffix: u64 = end_raw.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        let start = total.saturating_sub(suffix);
        return Some((start, total - 1));
    }

    let start: u64 = start_raw.parse().ok()?;
    if start >= total {
        return None;
    }
    let end = if end_raw.is_empty() {
        total - 1
    } else {
        end_raw.parse::<u64>().ok()?.min(total - 1)
    };
    (start <= end).then_some((start, end))
}
