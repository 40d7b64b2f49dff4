//! Persisted record types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;
use vouch_crypto::context_index;

/// How a secret field is protected at rest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncryptionMode {
    /// Payload is the literal secret
    NoEncryption,
    /// Payload is `Base64(IV || AES-128-CBC ciphertext)` under a context-derived key
    AesHmac,
}

/// A secret as stored, tagged with its encryption mode
///
/// Replaced wholesale on every write, never mutated in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// Encryption mode the payload was written with
    pub encryption_mode: EncryptionMode,
    /// Literal secret or Base64 text, depending on the mode
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSecret")
            .field("encryption_mode", &self.encryption_mode)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Ordered business context a record key is derived from
///
/// The same fields in the same order must be supplied on encrypt and decrypt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretContext(Vec<String>);

impl SecretContext {
    /// Build a context from its fields
    pub fn new<I, T>(fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    /// Context fields in order
    pub fn fields(&self) -> &[String] {
        &self.0
    }

    /// KDF index: UTF-8 fields joined by `&`
    pub fn index(&self) -> Vec<u8> {
        context_index(&self.0)
    }
}

/// Registered application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    /// Application name, unique
    pub application_id: String,
    /// Sequential record number, part of recovery secret contexts
    pub record_id: u64,
    /// Public application key presented by clients
    pub application_key: String,
    /// Application secret, hashed into envelope shared info
    pub application_secret: String,
    /// Compressed P-256 master public key
    pub master_public_key: Vec<u8>,
    /// P-256 master private key
    pub master_private_key: Vec<u8>,
    /// Whether clients of this application are accepted
    pub supported: bool,
    /// Creation time (Unix seconds)
    pub created_at: u64,
}

/// Activation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivationStatus {
    /// Initialised, waiting for key exchange
    Created,
    /// Keys exchanged, waiting for commit
    PendingCommit,
    /// Usable
    Active,
    /// Temporarily disabled
    Blocked,
    /// Terminal
    Removed,
}

impl ActivationStatus {
    /// Activation has not completed its lifecycle setup
    pub fn is_pending(self) -> bool {
        matches!(self, ActivationStatus::Created | ActivationStatus::PendingCommit)
    }
}

/// Step at which an activation becomes `ACTIVE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitPhase {
    /// Explicit commit required
    #[default]
    OnCommit,
    /// Active right after key exchange
    OnKeyExchange,
}

/// Step at which the activation OTP is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtpValidation {
    /// No OTP
    #[default]
    None,
    /// OTP checked on commit
    OnCommit,
    /// OTP checked during key exchange
    OnKeyExchange,
}

/// Signature protocol generation of an activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Numeric counter
    V2,
    /// Hash-based counter
    V3,
}

/// One device bound to a user within an application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activation {
    pub activation_id: Uuid,
    /// Present only while `CREATED`
    pub activation_code: Option<String>,
    pub user_id: String,
    pub application_id: String,
    pub status: ActivationStatus,
    pub blocked_reason: Option<String>,
    pub server_public_key: Vec<u8>,
    pub server_private_key: EncryptedSecret,
    pub device_public_key: Option<Vec<u8>>,
    pub activation_name: Option<String>,
    pub platform: Option<String>,
    pub device_info: Option<String>,
    /// Numeric counter, advanced on every verification attempt
    pub counter: u64,
    /// Hash-based counter data; always present for V3, present for V2 once an upgrade started
    pub ctr_data: Option<Vec<u8>>,
    pub failed_attempts: u32,
    pub max_failed_attempts: u32,
    pub flags: BTreeSet<String>,
    pub commit_phase: CommitPhase,
    pub otp_validation: OtpValidation,
    pub otp: Option<String>,
    pub protocol: ProtocolVersion,
    pub created_at: u64,
    pub last_changed_at: u64,
    /// Expiry of the pending phase (Unix seconds)
    pub expires_at: u64,
    /// Next history sequence number
    pub history_seq: u64,
}

impl Activation {
    /// Pending activation past its expiry
    pub fn is_expired(&self, now: u64) -> bool {
        self.status.is_pending() && now > self.expires_at
    }

    /// Attempts left before forced removal
    pub fn remaining_attempts(&self) -> u32 {
        self.max_failed_attempts.saturating_sub(self.failed_attempts)
    }

    /// Count one failed OTP or signature attempt
    ///
    /// Returns `true` when the failure exhausted the attempts and removed the activation.
    pub fn record_failure(&mut self) -> bool {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        if self.failed_attempts >= self.max_failed_attempts {
            self.status = ActivationStatus::Removed;
            return true;
        }
        false
    }
}

/// Audit trail entry for an activation status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationHistoryEntry {
    pub activation_id: Uuid,
    pub sequence: u64,
    pub status: ActivationStatus,
    pub event_reason: Option<String>,
    pub external_user_id: Option<String>,
    pub timestamp: u64,
}

/// Recovery code status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryCodeStatus {
    Created,
    Active,
    Blocked,
    Revoked,
}

/// Recovery PUK status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPukStatus {
    Valid,
    /// Terminal
    Used,
    Invalid,
}

/// Single-use recovery password
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPuk {
    /// 1-based position within the code
    pub index: u32,
    /// Argon2id hash of the PUK, through the PUK converter
    pub hash: EncryptedSecret,
    pub status: RecoveryPukStatus,
    pub last_changed_at: u64,
}

/// Recovery code with the PUKs it owns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryCode {
    pub recovery_code_id: Uuid,
    pub code: String,
    pub application_id: String,
    pub user_id: String,
    /// Activation the code was issued for; `None` for postcard codes
    pub activation_id: Option<Uuid>,
    pub status: RecoveryCodeStatus,
    pub failed_attempts: u32,
    pub max_failed_attempts: u32,
    pub puks: Vec<RecoveryPuk>,
    pub created_at: u64,
    pub last_changed_at: u64,
}

impl RecoveryCode {
    /// Code has not been revoked or blocked
    pub fn is_live(&self) -> bool {
        matches!(self.status, RecoveryCodeStatus::Created | RecoveryCodeStatus::Active)
    }
}

/// Per-application recovery settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub application_id: String,
    pub activation_recovery_enabled: bool,
    pub recovery_postcard_enabled: bool,
    pub allow_multiple_recovery_codes: bool,
    pub postcard_public_key: Option<Vec<u8>>,
    /// Through the recovery private key converter
    pub postcard_private_key: Option<EncryptedSecret>,
    /// Public key of the printing centre
    pub remote_postcard_public_key: Option<Vec<u8>>,
}

/// Short-lived key pair clients may encrypt envelopes to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporaryKey {
    pub key_id: String,
    pub application_key: String,
    pub activation_id: Option<Uuid>,
    pub public_key: Vec<u8>,
    /// Through the temporary key converter
    pub private_key: EncryptedSecret,
    /// Expiry (Unix milliseconds)
    pub expires_at: u64,
}

/// Replay guard entry for a consumed envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UsedNonce {
    /// Entry may be purged after this time (Unix milliseconds)
    pub expires_at: u64,
}
