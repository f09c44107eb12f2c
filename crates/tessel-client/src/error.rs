use std::sync::MutexGuard;

use thiserror::Error;

use tessel_net::{NetError, QueryError};
use tessel_shared::protocol::ErrorPayload;
use tessel_shared::{Address, Cid, CodecError, CryptoError};
use tessel_store::{Database, SharedDatabase, StoreError};
use tessel_thread::ThreadError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The cafe rejected our registration proof or token.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The refresh token is no longer accepted; register again.
    #[error("Session with cafe {0} expired")]
    SessionExpired(Address),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not registered with cafe {0}")]
    NotRegistered(Address),

    /// Any other ERROR frame from a cafe.
    #[error("Cafe error {code}: {message}")]
    Cafe { code: u16, message: String },

    /// No local copy and no cafe that would hand it out.
    #[error("Object {0} not found")]
    ObjectNotFound(Cid),

    /// Neither pinned nor announced anywhere the recipient looks.
    #[error("Undeliverable: {0}")]
    Undeliverable(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Thread error: {0}")]
    Thread(#[from] ThreadError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),
}

impl ClientError {
    /// Map an ERROR frame by status code.
    pub fn from_cafe(error: ErrorPayload) -> Self {
        match error.code {
            401 => ClientError::Unauthorized(error.message),
            403 => ClientError::AuthenticationFailed(error.message),
            code => ClientError::Cafe {
                code,
                message: error.message,
            },
        }
    }

    /// Worth another try against the same cafe.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ClientError::Cafe { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub(crate) fn lock_db(db: &SharedDatabase) -> Result<MutexGuard<'_, Database>> {
    db.lock().map_err(|_| ClientError::Store(StoreError::Poisoned))
}
