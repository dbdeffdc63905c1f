//! Memoria error types

use thiserror::Error;

/// Failures raised by the encryption layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    /// The key referenced by an envelope is no longer held by the keyring
    #[error("key not found: {key_id}")]
    KeyNotFound {
        /// Key id recorded in the envelope
        key_id: String,
    },

    /// The authentication tag did not verify (tampered or wrong key)
    #[error("authentication failure")]
    AuthenticationFailure,

    /// Malformed envelope or cipher setup failure
    #[error("cipher error: {0}")]
    Cipher(String),
}

/// Memoria error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed record, rejected before storage or encryption
    #[error("Validation error: {0}")]
    Validation(String),

    /// Consent resolved to NONE or the requested change is not permitted
    #[error("Consent denied: {0}")]
    ConsentDenied(String),

    /// Key unavailable or tamper detected
    #[error("Encryption failure: {0}")]
    Encryption(#[from] EncryptionError),

    /// Record or bundle absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Archive written by an unknown format version
    #[error("Schema version mismatch: found {found}, supported {supported}")]
    SchemaVersionMismatch {
        /// Version declared by the archive manifest
        found: u32,
        /// Version this build understands
        supported: u32,
    },

    /// Configuration error (including unknown consent levels)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requester does not own and was not granted the record
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Target already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Embedding backend failure
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Memoria operations
pub type Result<T> = std::result::Result<T, Error>;
