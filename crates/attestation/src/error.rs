//! Error types for attestation engine operations.

use thiserror::Error;

/// Errors that can occur inside the attestation engine. These never cross
/// the worker boundary as-is; public replies carry an
/// [`AttestationStatus`](crate::types::AttestationStatus) instead.
#[derive(Debug, Error)]
pub enum AttestationError {
    /// TPM operation failed
    #[error("TPM error: {0}")]
    Tpm(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Database read/write failed
    #[error("Database error: {0}")]
    Database(String),

    /// Key store read/write failed
    #[error("Key store error: {0}")]
    KeyStore(String),

    /// The CA could not be reached
    #[error("CA transport error: {0}")]
    CaTransport(String),

    /// A flow or operation was attempted in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The engine has shut down and can no longer answer requests
    #[error("Attestation service stopped")]
    ServiceStopped,

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Core errors
    #[error("Core error: {0}")]
    Core(#[from] certus_core::CoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for attestation operations.
pub type Result<T> = std::result::Result<T, AttestationError>;
