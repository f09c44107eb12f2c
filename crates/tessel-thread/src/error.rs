use thiserror::Error;

use tessel_shared::{BlockId, CodecError, CryptoError, ThreadId};

/// Block log validation and storage failures.
///
/// Validation errors leave the thread exactly as it was.
#[derive(Error, Debug)]
pub enum ThreadError {
    #[error("Unknown parent block {0}")]
    UnknownParent(BlockId),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    #[error("Block not found: {0}")]
    NotFound(BlockId),

    #[error("Unknown thread {0}")]
    UnknownThread(ThreadId),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Block store error: {0}")]
    Store(String),

    #[error("Invalid invite: {0}")]
    Invite(String),
}

pub type Result<T> = std::result::Result<T, ThreadError>;
