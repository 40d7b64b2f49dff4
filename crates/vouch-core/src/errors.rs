//! Service error types.
//!
//! Every error carries a stable code and an [`ErrorKind`]. Errors are rollback-neutral unless
//! they are storage or unknown failures, or a call site past its first staged write wraps them
//! with [`ServiceError::rollback`].

use crate::types::{ActivationStatus, RecoveryCodeStatus};
use thiserror::Error;
use vouch_crypto::CryptoError;
use vouch_storage::StorageError;

/// Coarse classification of a [`ServiceError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Structurally invalid input, detected before any write
    InvalidRequest,
    /// Key format, provider or KDF failure
    CryptoFailure,
    /// Activation, recovery code or application absent
    NotFound,
    /// Verification failed or a forbidden signature type was used
    InvalidSignature,
    /// Operation attempted against a record in an incompatible state
    StateConflict,
    /// Unexpected runtime failure
    UnknownError,
}

/// Service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown or unsupported application
    #[error("Invalid application: {0}")]
    InvalidApplication(String),

    /// Encrypted secret found but no master key configured
    #[error("Master database encryption key is not configured")]
    MissingMasterKey,

    /// Key or ciphertext has an invalid format
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// Cryptographic provider failure
    #[error("Cryptographic provider failure: {0}")]
    CryptoProviderFailure(String),

    /// Key derivation failure
    #[error("Key derivation failed: {0}")]
    KdfFailure(String),

    /// Encryption failure
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Decryption or MAC verification failure
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Activation absent
    #[error("Activation not found: {0}")]
    ActivationNotFound(String),

    /// Pending activation passed its expiry
    #[error("Activation expired: {0}")]
    ActivationExpired(String),

    /// Activation is in a state that does not allow the operation
    #[error("Activation {activation_id} is in incorrect state: {status:?}")]
    ActivationIncorrectState {
        /// Activation identifier
        activation_id: String,
        /// Current status
        status: ActivationStatus,
    },

    /// Activation OTP rejected
    #[error("Invalid activation OTP, remaining attempts: {remaining_attempts}")]
    InvalidActivationOtp {
        /// Attempts left before the activation is removed
        remaining_attempts: u32,
    },

    /// Signature rejected
    #[error("Invalid signature")]
    InvalidSignature,

    /// Temporary key absent, expired or bound elsewhere
    #[error("Temporary key not found: {0}")]
    TemporaryKeyNotFound(String),

    /// Recovery code absent
    #[error("Recovery code not found")]
    RecoveryCodeNotFound,

    /// User already holds a live recovery code
    #[error("Recovery code already exists")]
    RecoveryCodeAlreadyExists,

    /// Recovery code or PUK rejected
    #[error("Invalid recovery code, current PUK index: {current_puk_index:?}")]
    InvalidRecoveryCode {
        /// Index of the PUK the caller should use next, if any
        current_puk_index: Option<u32>,
    },

    /// Recovery code cannot be used in its current state
    #[error("Recovery code is in incorrect state: {status:?}")]
    RecoveryCodeIncorrectState {
        /// Current status
        status: RecoveryCodeStatus,
    },

    /// Recovery disabled or postcard keys missing
    #[error("Invalid recovery configuration: {0}")]
    InvalidRecoveryConfiguration(String),

    /// No unique recovery code found within the iteration budget
    #[error("Unable to generate recovery code")]
    UnableToGenerateRecoveryCode,

    /// No unique activation code found within the iteration budget
    #[error("Unable to generate activation code")]
    UnableToGenerateActivationCode,

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Unexpected failure
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// Error raised past a staged write; the enclosing transaction must roll back
    #[error("{0}")]
    RollbackRequired(Box<ServiceError>),
}

impl ServiceError {
    /// Mark this error as raised after a mutating write
    pub fn rollback(self) -> Self {
        match self {
            ServiceError::RollbackRequired(_) => self,
            other => ServiceError::RollbackRequired(Box::new(other)),
        }
    }

    /// Whether the enclosing transaction must be rolled back
    pub fn requires_rollback(&self) -> bool {
        matches!(
            self,
            ServiceError::RollbackRequired(_) | ServiceError::Storage(_) | ServiceError::Unknown(_)
        )
    }

    /// The underlying error, without rollback marking
    pub fn root(&self) -> &ServiceError {
        match self {
            ServiceError::RollbackRequired(inner) => inner.root(),
            other => other,
        }
    }

    /// Strip rollback marking
    pub fn into_root(self) -> ServiceError {
        match self {
            ServiceError::RollbackRequired(inner) => inner.into_root(),
            other => other,
        }
    }

    /// Error classification
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            ServiceError::InvalidRequest(_)
            | ServiceError::InvalidApplication(_)
            | ServiceError::InvalidActivationOtp { .. }
            | ServiceError::TemporaryKeyNotFound(_)
            | ServiceError::InvalidRecoveryCode { .. }
            | ServiceError::InvalidRecoveryConfiguration(_) => ErrorKind::InvalidRequest,
            ServiceError::MissingMasterKey
            | ServiceError::InvalidKeyFormat(_)
            | ServiceError::CryptoProviderFailure(_)
            | ServiceError::KdfFailure(_)
            | ServiceError::EncryptionFailed
            | ServiceError::DecryptionFailed => ErrorKind::CryptoFailure,
            ServiceError::ActivationNotFound(_) | ServiceError::RecoveryCodeNotFound => {
                ErrorKind::NotFound
            }
            ServiceError::InvalidSignature => ErrorKind::InvalidSignature,
            ServiceError::ActivationExpired(_)
            | ServiceError::ActivationIncorrectState { .. }
            | ServiceError::RecoveryCodeAlreadyExists
            | ServiceError::RecoveryCodeIncorrectState { .. } => ErrorKind::StateConflict,
            ServiceError::UnableToGenerateRecoveryCode
            | ServiceError::UnableToGenerateActivationCode
            | ServiceError::Storage(_)
            | ServiceError::Unknown(_)
            | ServiceError::RollbackRequired(_) => ErrorKind::UnknownError,
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self.root() {
            ServiceError::InvalidRequest(_) => "INVALID_REQUEST",
            ServiceError::InvalidApplication(_) => "INVALID_APPLICATION",
            ServiceError::MissingMasterKey => "MISSING_MASTER_DB_ENCRYPTION_KEY",
            ServiceError::InvalidKeyFormat(_) => "INVALID_KEY_FORMAT",
            ServiceError::CryptoProviderFailure(_) => "INVALID_CRYPTO_PROVIDER",
            ServiceError::KdfFailure(_) => "GENERIC_CRYPTOGRAPHY_ERROR",
            ServiceError::EncryptionFailed => "ENCRYPTION_FAILED",
            ServiceError::DecryptionFailed => "DECRYPTION_FAILED",
            ServiceError::ActivationNotFound(_) => "ACTIVATION_NOT_FOUND",
            ServiceError::ActivationExpired(_) => "ACTIVATION_EXPIRED",
            ServiceError::ActivationIncorrectState { .. } => "ACTIVATION_INCORRECT_STATE",
            ServiceError::InvalidActivationOtp { .. } => "INVALID_ACTIVATION_OTP",
            ServiceError::InvalidSignature => "INVALID_SIGNATURE",
            ServiceError::TemporaryKeyNotFound(_) => "TEMPORARY_KEY_NOT_FOUND",
            ServiceError::RecoveryCodeNotFound => "RECOVERY_CODE_NOT_FOUND",
            ServiceError::RecoveryCodeAlreadyExists => "RECOVERY_CODE_ALREADY_EXISTS",
            ServiceError::InvalidRecoveryCode { .. } => "INVALID_RECOVERY_CODE",
            ServiceError::RecoveryCodeIncorrectState { .. } => "RECOVERY_CODE_INCORRECT_STATE",
            ServiceError::InvalidRecoveryConfiguration(_) => "INVALID_RECOVERY_CONFIGURATION",
            ServiceError::UnableToGenerateRecoveryCode => "UNABLE_TO_GENERATE_RECOVERY_CODE",
            ServiceError::UnableToGenerateActivationCode => "UNABLE_TO_GENERATE_ACTIVATION_CODE",
            ServiceError::Storage(_) | ServiceError::Unknown(_) | ServiceError::RollbackRequired(_) => {
                "UNKNOWN_ERROR"
            }
        }
    }

    /// Text safe to show a caller
    ///
    /// Only unknown errors expose their message; everything else is reduced to its code.
    pub fn public_message(&self) -> String {
        match self.root() {
            ServiceError::Unknown(message) => message.clone(),
            other => other.code().to_string(),
        }
    }
}

impl From<CryptoError> for ServiceError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKeySize { .. } | CryptoError::InvalidKeyFormat(_) => {
                ServiceError::InvalidKeyFormat(err.to_string())
            }
            CryptoError::InvalidNonceSize { .. } | CryptoError::InvalidInput(_) => {
                ServiceError::InvalidRequest(err.to_string())
            }
            CryptoError::MacVerificationFailed | CryptoError::DecryptionFailed(_) => {
                ServiceError::DecryptionFailed
            }
            CryptoError::EncryptionFailed(_) => ServiceError::EncryptionFailed,
            CryptoError::InvalidSignature => ServiceError::InvalidSignature,
            CryptoError::KeyDerivationFailed(_) | CryptoError::HkdfError => {
                ServiceError::KdfFailure(err.to_string())
            }
            CryptoError::RandomGenerationFailed(_)
            | CryptoError::Argon2Failed(_)
            | CryptoError::InvalidHashFormat => {
                ServiceError::CryptoProviderFailure(err.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::InvalidRequest(format!("malformed payload: {}", err))
    }
}

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_marking_is_idempotent() {
        let err = ServiceError::InvalidSignature.rollback().rollback();
        assert!(err.requires_rollback());
        assert!(matches!(err.root(), ServiceError::InvalidSignature));
        assert_eq!(err.code(), "INVALID_SIGNATURE");
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[test]
    fn test_storage_errors_require_rollback() {
        let err: ServiceError = StorageError::Database("down".to_string()).into();
        assert!(err.requires_rollback());
        assert_eq!(err.kind(), ErrorKind::UnknownError);
        assert!(!ServiceError::InvalidRequest("x".to_string()).requires_rollback());
    }

    #[test]
    fn test_crypto_error_mapping() {
        let err: ServiceError = CryptoError::MacVerificationFailed.into();
        assert_eq!(err.code(), "DECRYPTION_FAILED");

        let err: ServiceError = CryptoError::InvalidKeyFormat("bad".to_string()).into();
        assert_eq!(err.code(), "INVALID_KEY_FORMAT");
        assert_eq!(err.kind(), ErrorKind::CryptoFailure);
    }

    #[test]
    fn test_public_message_hides_detail() {
        let err = ServiceError::InvalidKeyFormat("payload shorter than IV".to_string());
        assert_eq!(err.public_message(), "INVALID_KEY_FORMAT");

        let err = ServiceError::Unknown("clock went backwards".to_string());
        assert_eq!(err.public_message(), "clock went backwards");
    }
}
