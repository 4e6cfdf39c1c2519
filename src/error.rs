//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **`AppError`**: failures of the HTTP surface (health, metrics, config endpoints and the
//!   WebSocket upgrade). These are converted into JSON responses through actix-web's
//!   `ResponseError` trait.
//! - **`BridgeError`**: failures inside one call session. They never reach an HTTP client;
//!   they end the duty that hit them and become the session's end cause.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "service_unavailable",
//!     "message": "Maximum concurrent calls (10) reached",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
///
/// ## Status Code Mapping:
/// - `Internal` → 500
/// - `BadRequest` / `ValidationError` → 400
/// - `NotFound` → 404
/// - `ServiceUnavailable` → 503 (call capacity reached)
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    /// Machine-readable error type used in the JSON body.
    fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ValidationError(_) => "validation_error",
            AppError::ServiceUnavailable(_) => "service_unavailable",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ValidationError(msg)
            | AppError::ServiceUnavailable(msg) => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error, so `?` works on helpers returning `anyhow::Result`.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Which side of the bridge a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// The Twilio Media Streams connection.
    Telephony,
    /// The voice-agent WebSocket.
    Agent,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Telephony => write!(f, "telephony"),
            Peer::Agent => write!(f, "agent"),
        }
    }
}

/// Failures inside a single call session.
///
/// ## Variants:
/// - **ProtocolViolation**: a malformed or out-of-order telephony event (bad JSON, missing
///   fields, undecodable payload, a second `start`). Ends the session.
/// - **UpstreamUnavailable**: the agent socket could not be opened, timed out, or rejected the
///   settings message before any audio flowed. Ends the session; never retried.
/// - **PeerClosed**: one of the two sockets closed or failed mid-call. This is the ordinary
///   way a call ends when the caller hangs up without a `stop` or the agent drops.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("agent unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("{0} socket closed")]
    PeerClosed(Peer),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::ServiceUnavailable("full".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::ValidationError("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_json_error_maps_to_bad_request() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let app_err: AppError = err.into();
        assert!(matches!(app_err, AppError::BadRequest(_)));
    }

    #[test]
    fn test_bridge_error_display() {
        assert_eq!(
            BridgeError::PeerClosed(Peer::Agent).to_string(),
            "agent socket closed"
        );
        assert_eq!(
            BridgeError::ProtocolViolation("duplicate start".into()).to_string(),
            "protocol violation: duplicate start"
        );
    }
}
