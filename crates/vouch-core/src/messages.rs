//! Request, response and envelope payload types.
//!
//! Plain structs are exchanged with callers of [`crate::ActivationEngine`]. Types marked as
//! payloads travel as JSON inside ECIES envelopes, with binary fields Base64 encoded.

use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;
use vouch_crypto::{CryptographicEnvelope, EncryptedResponse, SignatureType};

/// Base64 encoding of binary JSON fields
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as standard Base64
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserialize bytes from standard Base64
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// ECIES request as received from a client
#[derive(Debug, Clone)]
pub struct EncryptedRequest {
    /// Application key the client belongs to
    pub application_key: String,
    /// Temporary key the envelope was encrypted to, instead of the default recipient key
    pub temporary_key_id: Option<String>,
    pub envelope: CryptographicEnvelope,
}

// ----------------------------------------------------------------------------------------------
// Activations
// ----------------------------------------------------------------------------------------------

/// Init activation request
#[derive(Debug, Clone, Default)]
pub struct InitActivationRequest {
    pub application_id: String,
    pub user_id: String,
    pub max_failed_attempts: Option<u32>,
    /// Pending-phase expiry (Unix seconds)
    pub expires_at: Option<u64>,
    pub commit_phase: CommitPhase,
    pub otp_validation: OtpValidation,
    pub otp: Option<String>,
    pub flags: BTreeSet<String>,
}

/// Init activation response
#[derive(Debug, Clone)]
pub struct InitActivationResponse {
    pub activation_id: Uuid,
    pub activation_code: String,
    /// ECDSA signature of the activation code by the application master key (DER)
    pub activation_signature: Vec<u8>,
    pub user_id: String,
    pub application_id: String,
}

/// Prepare activation request: key exchange for a `CREATED` activation
#[derive(Debug, Clone)]
pub struct PrepareActivationRequest {
    pub activation_code: String,
    pub encrypted: EncryptedRequest,
}

/// Create activation request: init and key exchange in one step
#[derive(Debug, Clone)]
pub struct CreateActivationRequest {
    pub user_id: String,
    pub max_failed_attempts: Option<u32>,
    pub expires_at: Option<u64>,
    pub otp_validation: OtpValidation,
    pub otp: Option<String>,
    pub encrypted: EncryptedRequest,
}

/// Result of a key exchange
#[derive(Debug, Clone)]
pub struct ActivationKeyExchangeResponse {
    pub activation_id: Uuid,
    pub user_id: String,
    pub application_id: String,
    pub activation_status: ActivationStatus,
    /// Carries a [`KeyExchangeResponsePayload`]
    pub encrypted_response: EncryptedResponse,
}

/// Key exchange payload sent by the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchangePayload {
    #[serde(with = "base64_bytes")]
    pub device_public_key: Vec<u8>,
    pub activation_name: Option<String>,
    pub platform: Option<String>,
    pub device_info: Option<String>,
    pub activation_otp: Option<String>,
    /// Legacy clients announce protocol 2; anything else means 3
    pub protocol_version: Option<u8>,
}

/// Recovery code issued together with an activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecovery {
    pub recovery_code: String,
    pub puk: String,
}

/// Key exchange payload returned to the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchangeResponsePayload {
    pub activation_id: Uuid,
    #[serde(with = "base64_bytes")]
    pub server_public_key: Vec<u8>,
    /// Initial hash-based counter data; empty for protocol 2
    #[serde(with = "base64_bytes")]
    pub ctr_data: Vec<u8>,
    pub activation_recovery: Option<ActivationRecovery>,
}

/// Activation status view
#[derive(Debug, Clone)]
pub struct ActivationStatusResponse {
    pub activation_id: Uuid,
    pub status: ActivationStatus,
    pub blocked_reason: Option<String>,
    pub user_id: String,
    pub application_id: String,
    pub activation_name: Option<String>,
    pub platform: Option<String>,
    pub device_info: Option<String>,
    pub flags: BTreeSet<String>,
    pub protocol: ProtocolVersion,
    pub failed_attempts: u32,
    pub max_failed_attempts: u32,
    /// Present while `CREATED`
    pub activation_code: Option<String>,
    pub created_at: u64,
    pub last_changed_at: u64,
    pub expires_at: u64,
}

impl From<&Activation> for ActivationStatusResponse {
    fn from(activation: &Activation) -> Self {
        Self {
            activation_id: activation.activation_id,
            status: activation.status,
            blocked_reason: activation.blocked_reason.clone(),
            user_id: activation.user_id.clone(),
            application_id: activation.application_id.clone(),
            activation_name: activation.activation_name.clone(),
            platform: activation.platform.clone(),
            device_info: activation.device_info.clone(),
            flags: activation.flags.clone(),
            protocol: activation.protocol,
            failed_attempts: activation.failed_attempts,
            max_failed_attempts: activation.max_failed_attempts,
            activation_code: activation.activation_code.clone(),
            created_at: activation.created_at,
            last_changed_at: activation.last_changed_at,
            expires_at: activation.expires_at,
        }
    }
}

// ----------------------------------------------------------------------------------------------
// Signatures
// ----------------------------------------------------------------------------------------------

/// Online signature verification request
#[derive(Debug, Clone)]
pub struct VerifySignatureRequest {
    pub activation_id: Uuid,
    pub application_key: String,
    pub data: Vec<u8>,
    pub signature: String,
    pub signature_type: SignatureType,
    /// `Some(3)` forces hash-based counters on a V2 activation during upgrade
    pub forced_signature_version: Option<u8>,
}

/// Offline signature verification request
#[derive(Debug, Clone)]
pub struct VerifyOfflineSignatureRequest {
    pub activation_id: Uuid,
    pub data: Vec<u8>,
    pub signature: String,
    pub allow_biometry: bool,
}

/// Signature verification outcome
#[derive(Debug, Clone)]
pub struct VerifySignatureResponse {
    pub signature_valid: bool,
    pub activation_id: Uuid,
    pub activation_status: ActivationStatus,
    pub blocked_reason: Option<String>,
    pub user_id: String,
    pub application_id: String,
    pub remaining_attempts: u32,
    pub signature_type: SignatureType,
}

/// Server-signed offline payload
#[derive(Debug, Clone)]
pub struct OfflinePayload {
    pub data: String,
    /// Base64 of 16 random bytes
    pub nonce: String,
    /// ECDSA (DER) over `data \n nonce`
    pub signature: Vec<u8>,
    /// `data \n nonce \n Base64(signature)`
    pub offline_data: String,
}

// ----------------------------------------------------------------------------------------------
// Vault unlock and upgrade
// ----------------------------------------------------------------------------------------------

/// Vault unlock request
#[derive(Debug, Clone)]
pub struct VaultUnlockRequest {
    pub activation_id: Uuid,
    pub signature: String,
    pub signature_type: SignatureType,
    pub signed_data: Vec<u8>,
    pub encrypted: EncryptedRequest,
}

/// Vault unlock payload sent by the device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultUnlockPayload {
    pub reason: Option<String>,
}

/// Vault unlock payload returned to the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultUnlockResponsePayload {
    /// `IV || AES-128-CBC(transport key, vault key)`
    #[serde(with = "base64_bytes")]
    pub encrypted_vault_encryption_key: Vec<u8>,
}

/// Vault unlock outcome
#[derive(Debug, Clone)]
pub struct VaultUnlockResponse {
    pub signature_valid: bool,
    pub activation_id: Uuid,
    pub activation_status: ActivationStatus,
    pub remaining_attempts: u32,
    /// Carries a [`VaultUnlockResponsePayload`] when the signature was valid
    pub encrypted_response: Option<EncryptedResponse>,
}

/// Upgrade start payload returned to the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeResponsePayload {
    #[serde(with = "base64_bytes")]
    pub ctr_data: Vec<u8>,
}

// ----------------------------------------------------------------------------------------------
// Recovery
// ----------------------------------------------------------------------------------------------

/// Recovery configuration change
#[derive(Debug, Clone, Default)]
pub struct UpdateRecoveryConfigRequest {
    pub application_id: String,
    pub activation_recovery_enabled: bool,
    pub recovery_postcard_enabled: bool,
    pub allow_multiple_recovery_codes: bool,
    pub remote_postcard_public_key: Option<Vec<u8>>,
}

/// Recovery configuration view, without private material
#[derive(Debug, Clone)]
pub struct RecoveryConfigResponse {
    pub application_id: String,
    pub activation_recovery_enabled: bool,
    pub recovery_postcard_enabled: bool,
    pub allow_multiple_recovery_codes: bool,
    pub postcard_public_key: Option<Vec<u8>>,
    pub remote_postcard_public_key: Option<Vec<u8>>,
}

impl From<&RecoveryConfig> for RecoveryConfigResponse {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            application_id: config.application_id.clone(),
            activation_recovery_enabled: config.activation_recovery_enabled,
            recovery_postcard_enabled: config.recovery_postcard_enabled,
            allow_multiple_recovery_codes: config.allow_multiple_recovery_codes,
            postcard_public_key: config.postcard_public_key.clone(),
            remote_postcard_public_key: config.remote_postcard_public_key.clone(),
        }
    }
}

/// Postcard recovery code request
#[derive(Debug, Clone)]
pub struct CreateRecoveryCodeRequest {
    pub application_id: String,
    pub user_id: String,
    pub puk_count: u32,
}

/// PUK derivation info for the printing centre
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PukDerivation {
    pub puk_index: u32,
    pub derivation_index: u64,
}

/// Postcard recovery code response
///
/// Neither the code nor the PUKs are included; the printing centre reproduces them from the
/// nonce and the derivation indexes.
#[derive(Debug, Clone)]
pub struct CreateRecoveryCodeResponse {
    pub recovery_code_id: Uuid,
    pub application_id: String,
    pub user_id: String,
    pub status: RecoveryCodeStatus,
    pub nonce: Vec<u8>,
    pub puks: Vec<PukDerivation>,
}

/// Confirm recovery code payload sent by the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRecoveryCodePayload {
    pub recovery_code: String,
}

/// Confirm recovery code payload returned to the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRecoveryCodeResponsePayload {
    pub already_confirmed: bool,
}

/// Confirm recovery code outcome
#[derive(Debug, Clone)]
pub struct ConfirmRecoveryCodeResponse {
    pub activation_id: Uuid,
    pub user_id: String,
    pub already_confirmed: bool,
    /// Carries a [`ConfirmRecoveryCodeResponsePayload`]
    pub encrypted_response: EncryptedResponse,
}

/// Recovery activation request
#[derive(Debug, Clone)]
pub struct RecoveryActivationRequest {
    pub max_failed_attempts: Option<u32>,
    /// Carries a [`RecoveryActivationPayload`]
    pub encrypted: EncryptedRequest,
}

/// Recovery activation payload sent by the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryActivationPayload {
    pub recovery_code: String,
    pub puk: String,
    #[serde(flatten)]
    pub key_exchange: KeyExchangePayload,
}

/// Recovery code lookup filter
#[derive(Debug, Clone, Default)]
pub struct LookupRecoveryCodesFilter {
    pub user_id: String,
    pub activation_id: Option<Uuid>,
    pub application_id: Option<String>,
    pub recovery_code_status: Option<RecoveryCodeStatus>,
    pub puk_status: Option<RecoveryPukStatus>,
}

/// PUK view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPukView {
    pub puk_index: u32,
    pub status: RecoveryPukStatus,
}

/// Recovery code view
#[derive(Debug, Clone)]
pub struct RecoveryCodeView {
    pub recovery_code_id: Uuid,
    pub recovery_code: String,
    pub application_id: String,
    pub user_id: String,
    pub activation_id: Option<Uuid>,
    pub status: RecoveryCodeStatus,
    pub puks: Vec<RecoveryPukView>,
}

impl From<&RecoveryCode> for RecoveryCodeView {
    fn from(code: &RecoveryCode) -> Self {
        Self {
            recovery_code_id: code.recovery_code_id,
            recovery_code: code.code.clone(),
            application_id: code.application_id.clone(),
            user_id: code.user_id.clone(),
            activation_id: code.activation_id,
            status: code.status,
            puks: code
                .puks
                .iter()
                .map(|p| RecoveryPukView {
                    puk_index: p.index,
                    status: p.status,
                })
                .collect(),
        }
    }
}

// ----------------------------------------------------------------------------------------------
// Temporary keys
// ----------------------------------------------------------------------------------------------

/// Temporary key issued to a client
#[derive(Debug, Clone)]
pub struct TemporaryKeyResponse {
    pub key_id: String,
    pub application_key: String,
    pub activation_id: Option<Uuid>,
    pub public_key: Vec<u8>,
    /// Expiry (Unix milliseconds)
    pub expires_at: u64,
    /// ECDSA (DER) over `key_id \n Base64(public_key) \n expires_at`, by the application
    /// master key or the activation server key
    pub signature: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_fields_are_base64_in_json() {
        let payload = UpgradeResponsePayload {
            ctr_data: vec![0xff; 4],
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"ctr_data":"/////w=="}"#);

        let parsed: UpgradeResponsePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.ctr_data, vec![0xff; 4]);
    }

    #[test]
    fn test_recovery_payload_flattens_key_exchange() {
        let json = r#"{
            "recovery_code": "AAAAA-AAAAA-AAAAA-AAAAA",
            "puk": "0123456789",
            "device_public_key": "AQI=",
            "activation_name": "phone",
            "platform": null,
            "device_info": null,
            "activation_otp": null,
            "protocol_version": null
        }"#;
        let parsed: RecoveryActivationPayload = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.key_exchange.device_public_key, vec![1, 2]);
        assert_eq!(parsed.key_exchange.activation_name.as_deref(), Some("phone"));
    }
}
