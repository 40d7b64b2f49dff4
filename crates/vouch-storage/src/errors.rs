//! Storage error types.

use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Invalid column family
    #[error("Invalid column family: {0}")]
    InvalidColumnFamily(String),

    /// Waiting for a row lock took longer than the configured timeout
    #[error("Timed out after {timeout_ms} ms waiting for row lock in {cf}")]
    LockTimeout {
        /// Column family of the contended row
        cf: String,
        /// Configured wait timeout in milliseconds
        timeout_ms: u64,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
