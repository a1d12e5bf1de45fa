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

//! Overlay networking for the PearTube node: peer connections multiplexing
//! drive replication and the public-feed gossip protocol.

pub mod feed;
pub mod host;

pub use feed::{FEED_TOPIC_NAME, FeedGossip, FeedMessage, FeedStats};
pub use host::{SwarmHost, TopicJoin};
