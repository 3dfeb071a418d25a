//! Error types for the relay.

use crate::jsonrpc::JsonRpcMessage;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Main error type for the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid connection parameters or process configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An explicit session id that is not (or no longer) registered.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// No session id supplied and the implicit fallback does not apply.
    #[error("Session id required: {0}")]
    SessionRequired(String),

    /// The session exists but no longer accepts messages.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// The inbound payload is not a usable JSON-RPC message.
    #[error("Bad message: {message}")]
    BadMessage { code: i64, message: String },

    /// Startup errors (spec loading, binding the listener).
    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Config(_)
            | Self::SessionRequired(_)
            | Self::BadMessage { .. } => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionClosed(_) => StatusCode::GONE,
            Self::Startup(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "invalid_config",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionRequired(_) => "session_required",
            Self::SessionClosed(_) => "session_closed",
            Self::BadMessage { .. } => "bad_message",
            Self::Startup(_) | Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Malformed messages are answered in the protocol's own error shape.
        if let Self::BadMessage { code, message } = self {
            return (status, Json(JsonRpcMessage::error_response(None, code, message)))
                .into_response();
        }

        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(json!({
                "error": self.code(),
                "message": message,
            })),
        )
            .into_response()
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
