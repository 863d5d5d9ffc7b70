//! Error types for zero-pair.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Service errors, mapped onto HTTP status codes at the route boundary.
#[derive(Debug, thiserror::Error)]
pub enum PairError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Command timed out after {secs} seconds: {command}")]
    Timeout { command: String, secs: u64 },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0:#}")]
    Engine(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PairError>;

impl From<anyhow::Error> for PairError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<PairError>() {
            Ok(inner) => inner,
            Err(err) => PairError::Engine(err),
        }
    }
}

impl PairError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PairError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            PairError::InvalidRequest(_) | PairError::Config(_) => StatusCode::BAD_REQUEST,
            PairError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PairError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PairError::Internal(_) | PairError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for PairError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "Request failed");
        } else {
            tracing::warn!(status = status.as_u16(), error = %message, "Request rejected");
        }

        (status, Json(ErrorBody { error: message })).into_response()
    }
}
