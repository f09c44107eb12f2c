use thiserror::Error;

/// Failures opening or sealing an [`Envelope`](crate::envelope::Envelope).
///
/// These are fatal to the one message they concern, never to the
/// connection it arrived on.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Signing failed: {0}")]
    SigningError(#[from] CryptoError),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Signing key unavailable")]
    KeyUnavailable,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Key file error: {0}")]
    KeyFile(String),
}

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> Self {
        CodecError::MalformedEnvelope(e.to_string())
    }
}
