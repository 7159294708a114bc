//! Error types for key and secure-channel providers.

use thiserror::Error;

/// Errors raised by the key and secure-channel providers.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Key not found for owner: {owner_id}")]
    KeyNotFound { owner_id: String },

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Secure session with '{peer}' failed: {reason}")]
    SessionFailed { peer: String, reason: String },

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Signature verification failed: {0}")]
    Signature(String),

    #[error("Entropy source unavailable: {0}")]
    EntropyUnavailable(String),
}

/// Result type for provider operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
