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

//! Append-only log stack consumed by the PearTube core.
//!
//! A channel is a pair of signed sparse logs: a metadata log describing a
//! small filesystem and a blob log carrying file bytes in fixed-size blocks.
//! This crate owns the logs, the drive filesystem folded over them, the
//! replication protocol that syncs them over any duplex byte channel, the
//! per-file download monitors, and the non-waiting read adapter used by the
//! blob HTTP bridge.

pub mod adapter;
pub mod crypto;
pub mod drive;
pub mod log;
pub mod monitor;
pub mod replicate;

pub use adapter::{BlobStoreAdapter, GetOptions};
pub use crypto::{DriveKeys, discovery_key, topic_hash};
pub use drive::{DEFAULT_BLOCK_SIZE, Drive};
pub use log::{Log, LogUpdate};
pub use monitor::{DriveMonitor, MonitorSnapshot};
pub use replicate::{LogId, ReplicatorSet};
