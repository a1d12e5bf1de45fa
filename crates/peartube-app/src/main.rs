#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    missing_docs
)]
#![allow(clippy::multiple_crate_versions)]

//! Binary entrypoint for the PearTube node.

use peartube_app::AppResult;

/// Bootstraps the PearTube node and blocks until shutdown.
#[tokio::main]
async fn main() -> AppResult<()> {
    peartube_app::bootstrap::run_app().await
}
