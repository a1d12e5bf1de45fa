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

//! The PearTube data-plane engine: drive registry, block prefetch, seeding
//! quota, and the node facade the control plane talks to.

pub mod node;
pub mod prefetch;
pub mod registry;
pub mod seeding;

pub use node::{
    ChannelMeta, FeedView, FeedViewEntry, IdentityDoc, Node, PublishVideo, VideoListing,
};
pub use prefetch::{PrefetchEngine, PrefetchReport, video_id_for_path};
pub use registry::{DEFAULT_SYNC_TIMEOUT, DriveRegistry, OpenOptions};
pub use seeding::{SeedListing, SeedSize, SeedingManager, SeedingStatus};
