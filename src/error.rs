//! Error types for the deduplication engine.

use thiserror::Error;

/// Main error type for engine and storage operations.
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,
}

impl From<serde_json::Error> for DedupError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            DedupError::Deserialization(e.to_string())
        } else {
            DedupError::Serialization(e.to_string())
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, DedupError>;
