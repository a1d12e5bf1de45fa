//! Read-side façade over a blob log for the HTTP bridge.
//!
//! The bridge must never stall a player's network thread on a block that has
//! not replicated yet, so the adapter owns the session policy: non-waiting
//! reads return only local blocks, waiting reads are bounded by a process-wide
//! 30 second default unless the caller supplies its own budget.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use peartube_core::Result;
use tokio::time::Instant;

use crate::log::Log;

/// Process-wide default budget for waiting reads.
pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for one block read.
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    /// Wait for the block to replicate instead of failing fast.
    pub wait: bool,
    /// Budget for waiting reads; the adapter default applies when absent.
    pub timeout: Option<Duration>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            wait: true,
            timeout: None,
        }
    }
}

impl GetOptions {
    /// The non-waiting session policy used by the blob bridge.
    #[must_use]
    pub const fn local_only() -> Self {
        Self {
            wait: false,
            timeout: None,
        }
    }
}

/// Wraps a blob log with default timeouts and the non-waiting session policy.
#[derive(Clone)]
pub struct BlobStoreAdapter {
    blobs: Arc<Log>,
    default_timeout: Duration,
}

impl BlobStoreAdapter {
    /// Wrap a blob log with the process-wide default read budget.
    #[must_use]
    pub fn new(blobs: Arc<Log>) -> Self {
        Self {
            blobs,
            default_timeout: DEFAULT_GET_TIMEOUT,
        }
    }

    /// Override the default read budget (used by tests).
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The wrapped log.
    #[must_use]
    pub fn log(&self) -> Arc<Log> {
        Arc::clone(&self.blobs)
    }

    /// Read one block under the session policy.
    ///
    /// Non-waiting reads return `None` immediately for absent blocks; waiting
    /// reads block until the block replicates or the budget elapses.
    ///
    /// # Errors
    ///
    /// Returns a storage error when a present block cannot be read.
    pub async fn get(&self, index: u64, options: GetOptions) -> Result<Option<Bytes>> {
        if let Some(block) = self.blobs.get(index)? {
            return Ok(Some(block));
        }
        if !options.wait {
            return Ok(None);
        }

        let budget = options.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + budget;
        let mut updates = self.blobs.subscribe();
        loop {
            if let Some(block) = self.blobs.get(index)? {
                return Ok(Some(block));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, updates.recv()).await.is_err() {
                return self.blobs.get(index);
            }
        }
    }
}
