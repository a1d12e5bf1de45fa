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

//! HTTP surfaces of the PearTube node: the UI control plane (request/response
//! methods plus the SSE event stream) and the loopback blob bridge local
//! media players stream from.

pub mod bridge;
pub mod error;
pub mod server;

pub use bridge::BlobBridge;
pub use error::ApiError;
pub use server::ApiServer;
