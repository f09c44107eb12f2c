use std::sync::MutexGuard;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use tessel_shared::protocol::Message;
use tessel_shared::CodecError;
use tessel_store::{Database, SharedDatabase, StoreError};

#[derive(Debug, Error)]
pub enum ServerError {
    /// Registration proof did not check out.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Session expired")]
    SessionExpired,

    /// Missing, stale or expired access token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Object too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::AuthenticationFailed(_) | ServerError::Forbidden(_) => {
                StatusCode::FORBIDDEN
            }
            ServerError::SessionExpired | ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::Store(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to a peer.
    fn public_message(&self) -> String {
        match self {
            ServerError::Store(_) => "Storage error".to_string(),
            ServerError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// The ERROR frame answering request `request_id`.
    pub fn to_message(&self, request_id: i32) -> Message {
        Message::error(self.status().as_u16(), self.public_message(), request_id)
    }
}

/// Lock the cafe database.
pub fn lock_db(db: &SharedDatabase) -> Result<MutexGuard<'_, Database>, ServerError> {
    db.lock().map_err(|_| ServerError::Store(StoreError::Poisoned))
}

impl From<CodecError> for ServerError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::SigningError(e) => ServerError::Internal(e.to_string()),
            other => ServerError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(self, ServerError::Store(_) | ServerError::Internal(_)) {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.public_message(),
        });

        (self.status(), axum::Json(body)).into_response()
    }
}
