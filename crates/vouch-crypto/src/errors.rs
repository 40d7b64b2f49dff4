//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic operation errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key size
    #[error("Invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize {
        /// Expected key size in bytes
        expected: usize,
        /// Actual key size in bytes
        actual: usize,
    },

    /// Invalid nonce size
    #[error("Invalid nonce size: expected {expected}, got {actual}")]
    InvalidNonceSize {
        /// Expected nonce size in bytes
        expected: usize,
        /// Actual nonce size in bytes
        actual: usize,
    },

    /// Key bytes could not be parsed
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// Invalid signature
    #[error("Invalid signature")]
    InvalidSignature,

    /// MAC verification failed
    #[error("MAC verification failed")]
    MacVerificationFailed,

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Invalid input data
    #[error("Invalid input data: {0}")]
    InvalidInput(String),

    /// Random number generation failed
    #[error("Random number generation failed: {0}")]
    RandomGenerationFailed(String),

    /// Argon2 hashing failed
    #[error("Argon2 hashing failed: {0}")]
    Argon2Failed(String),

    /// Invalid hash format
    #[error("Invalid hash format")]
    InvalidHashFormat,

    /// HKDF error
    #[error("HKDF error: insufficient output length")]
    HkdfError,
}

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;
