//! # Design
//!
//! - One taxonomy for every failure the node surfaces to a caller.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Transient per-peer failures never appear here; components absorb them.

use std::io;

use thiserror::Error;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Failures surfaced across the node's component boundaries.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A channel key failed the canonical hex/length check.
    #[error("invalid channel key")]
    InvalidKey {
        /// The rejected input.
        value: String,
    },
    /// A drive path was empty or not absolute.
    #[error("invalid drive path")]
    InvalidPath {
        /// The rejected input.
        value: String,
    },
    /// A file entry was missing or carried no blob.
    #[error("entry not found")]
    NotFound {
        /// Path that failed to resolve.
        path: String,
    },
    /// A bounded wait elapsed.
    #[error("operation timed out")]
    Timeout {
        /// Operation identifier.
        operation: &'static str,
    },
    /// Writing to an owner drive was attempted without the secret key.
    #[error("drive is read-only")]
    ReadOnly,
    /// A block or entry failed signature verification.
    #[error("signature verification failed")]
    BadSignature {
        /// Index of the offending block.
        index: u64,
    },
    /// Disk storage failed underneath a component.
    #[error("storage operation failed")]
    Storage {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying IO failure.
        #[source]
        source: io::Error,
    },
    /// A persisted or wire document failed to encode or decode.
    #[error("encoding operation failed")]
    Encoding {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying serialisation failure.
        #[source]
        source: serde_json::Error,
    },
    /// An invariant broke inside the node.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable detail.
        message: String,
    },
}

impl CoreError {
    /// Build a [`CoreError::Storage`] with an operation identifier.
    #[must_use]
    pub const fn storage(operation: &'static str, source: io::Error) -> Self {
        Self::Storage { operation, source }
    }

    /// Build a [`CoreError::Encoding`] with an operation identifier.
    #[must_use]
    pub const fn encoding(operation: &'static str, source: serde_json::Error) -> Self {
        Self::Encoding { operation, source }
    }

    /// Build a [`CoreError::Internal`] from any displayable detail.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn messages_stay_constant_and_sources_survive() {
        let storage = CoreError::storage("log.append", io::Error::other("disk full"));
        assert_eq!(storage.to_string(), "storage operation failed");
        assert!(storage.source().is_some());

        let invalid = CoreError::InvalidKey {
            value: "zz".to_string(),
        };
        assert_eq!(invalid.to_string(), "invalid channel key");
        assert!(invalid.source().is_none());

        let timeout = CoreError::Timeout {
            operation: "sync_wait",
        };
        assert_eq!(timeout.to_string(), "operation timed out");
    }
}
