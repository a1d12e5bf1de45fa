//! # Design
//!
//! - Centralize application-level errors for bootstrap and wiring.
//! - Keep error messages constant while carrying context fields for
//!   debugging.
//! - Preserve source errors without re-logging at call sites.

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Telemetry setup failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: anyhow::Error,
    },
    /// A core component failed during bootstrap.
    #[error("core operation failed")]
    Core {
        /// Operation identifier.
        operation: &'static str,
        /// Source core error.
        source: peartube_core::CoreError,
    },
    /// Configuration values were invalid.
    #[error("invalid configuration")]
    InvalidConfig {
        /// Environment variable that failed validation.
        field: &'static str,
        /// Machine-readable reason for the failure.
        reason: &'static str,
        /// Offending value.
        value: Option<String>,
    },
}

impl AppError {
    pub(crate) const fn telemetry(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn core(
        operation: &'static str,
        source: peartube_core::CoreError,
    ) -> Self {
        Self::Core { operation, source }
    }
}
