//! Gateway error types with HTTP status code mapping.
//!
//! [`GatewayError`] is the central error type for the gateway. The same
//! taxonomy is used on every path: device protocol, federation links, the
//! WebSocket command boundary, and the read-only HTTP endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2001,
///     "message": "routing error: telescope T9 is not registered",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Numeric error code (see code ranges on [`GatewayError`]).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server-side error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category          | HTTP Status                 |
/// |-----------|-------------------|-----------------------------|
/// | 1000–1999 | Validation/Parse  | 400 Bad Request             |
/// | 2000–2999 | Routing           | 404 Not Found               |
/// | 3000–3999 | Server            | 500 Internal Server Error   |
/// | 4000–4999 | Device/Peer       | 422 / 503 / 504             |
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Transport unavailable or reconnect attempts exhausted.
    #[error("connection error: {0}")]
    Connection(String),

    /// No correlated response arrived before the deadline.
    #[error("request timeout: no response to {operation} within {timeout_ms} ms")]
    Timeout {
        /// What was being waited on (method name or message id).
        operation: String,
        /// The deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// A frame or envelope could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// The device or peer reported the command as failed.
    #[error("command failed: {0}")]
    Command(String),

    /// A command named a telescope that is neither local nor remote, or a
    /// registration would make an id ambiguous.
    #[error("routing error: {0}")]
    Routing(String),

    /// Request validation failed (unknown action, bad parameters).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Builds a [`GatewayError::Timeout`] from an operation label and deadline.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, deadline: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::Parse(_) => 1002,
            Self::Routing(_) => 2001,
            Self::Internal(_) => 3000,
            Self::Command(_) => 4001,
            Self::Connection(_) => 4002,
            Self::Timeout { .. } => 4003,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::Parse(_) => StatusCode::BAD_REQUEST,
            Self::Routing(_) => StatusCode::NOT_FOUND,
            Self::Command(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timeout_message_mentions_timeout() {
        let err = GatewayError::timeout("scope_park", Duration::from_secs(10));
        let text = err.to_string();
        assert!(text.contains("timeout"));
        assert!(text.contains("10000"));
    }

    #[test]
    fn status_codes_follow_categories() {
        assert_eq!(
            GatewayError::Routing("x".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::Connection("x".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(GatewayError::Parse("x".to_string()).error_code(), 1002);
    }

    #[test]
    fn json_error_converts_to_parse() {
        let Err(json_err) = serde_json::from_str::<serde_json::Value>("{not json") else {
            panic!("expected a json error");
        };
        let err = GatewayError::from(json_err);
        assert!(matches!(err, GatewayError::Parse(_)));
    }
}
