//! API error wrapper.
//!
//! Nothing throws across the RPC boundary: every failure is encoded in the
//! response payload as `{ "success": false, "error": "..." }` with a status
//! code matching the error taxonomy.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use peartube_core::CoreError;
use serde_json::json;

/// Structured API failure.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Build a bad-request failure.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Build a not-found failure.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Build an internal failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        let status = match &error {
            CoreError::InvalidKey { .. } | CoreError::InvalidPath { .. } => {
                StatusCode::BAD_REQUEST
            }
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::ReadOnly => StatusCode::FORBIDDEN,
            CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CoreError::BadSignature { .. }
            | CoreError::Storage { .. }
            | CoreError::Encoding { .. }
            | CoreError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({
            "success": false,
            "error": self.message,
        });
        (self.status, Json(payload)).into_response()
    }
}
