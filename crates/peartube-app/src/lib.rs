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

//! Wires the PearTube services together and launches the node.

/// Application bootstrap wiring.
pub mod bootstrap;
/// Environment configuration.
pub mod config;
/// Application error type.
pub mod error;

pub use config::NodeConfig;
pub use error::{AppError, AppResult};
