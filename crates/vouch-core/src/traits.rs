//! Engine trait definitions.

use crate::{audit::SignatureAuditRecord, errors::Result, messages::*, types::*};
use async_trait::async_trait;
use std::collections::BTreeSet;
use uuid::Uuid;
use vouch_crypto::EncryptedResponse;

/// Receives one record per signature verification attempt
///
/// A failing sink never fails the verification; the engine logs and moves on.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record a verification attempt
    async fn record(&self, record: SignatureAuditRecord) -> Result<()>;
}

/// Activation engine facade
///
/// Every method runs in its own transaction.
#[async_trait]
pub trait ActivationEngine: Send + Sync {
    // Applications

    /// Register an application with a fresh key, secret and master key pair
    async fn create_application(&self, application_id: String) -> Result<Application>;

    /// Get an application by name
    async fn get_application(&self, application_id: String) -> Result<Application>;

    /// Accept or refuse clients of an application
    async fn set_application_supported(&self, application_id: String, supported: bool) -> Result<Application>;

    // Activation lifecycle

    /// Create a `CREATED` activation with an activation code
    async fn init_activation(&self, request: InitActivationRequest) -> Result<InitActivationResponse>;

    /// Key exchange by activation code
    async fn prepare_activation(&self, request: PrepareActivationRequest) -> Result<ActivationKeyExchangeResponse>;

    /// Init and key exchange in one step for a known user
    async fn create_activation(&self, request: CreateActivationRequest) -> Result<ActivationKeyExchangeResponse>;

    /// `PENDING_COMMIT → ACTIVE`
    async fn commit_activation(
        &self,
        activation_id: Uuid,
        external_user_id: Option<String>,
        otp: Option<String>,
    ) -> Result<ActivationStatusResponse>;

    /// Current state of an activation
    async fn get_activation_status(&self, activation_id: Uuid) -> Result<ActivationStatusResponse>;

    /// Activations of a user, optionally limited to one application
    async fn list_activations(
        &self,
        user_id: String,
        application_id: Option<String>,
    ) -> Result<Vec<ActivationStatusResponse>>;

    /// Status changes of an activation, oldest first
    async fn activation_history(&self, activation_id: Uuid) -> Result<Vec<ActivationHistoryEntry>>;

    /// `ACTIVE → BLOCKED`
    async fn block_activation(
        &self,
        activation_id: Uuid,
        reason: Option<String>,
        external_user_id: Option<String>,
    ) -> Result<ActivationStatusResponse>;

    /// `BLOCKED → ACTIVE`
    async fn unblock_activation(
        &self,
        activation_id: Uuid,
        external_user_id: Option<String>,
    ) -> Result<ActivationStatusResponse>;

    /// Any state → `REMOVED`
    async fn remove_activation(
        &self,
        activation_id: Uuid,
        external_user_id: Option<String>,
        revoke_recovery_codes: bool,
    ) -> Result<ActivationStatusResponse>;

    /// Add flags; returns the resulting set
    async fn add_activation_flags(&self, activation_id: Uuid, flags: Vec<String>) -> Result<BTreeSet<String>>;

    /// Remove flags; returns the resulting set
    async fn remove_activation_flags(&self, activation_id: Uuid, flags: Vec<String>) -> Result<BTreeSet<String>>;

    // Signatures

    /// Verify an online signature
    async fn verify_signature(&self, request: VerifySignatureRequest) -> Result<VerifySignatureResponse>;

    /// Verify an offline signature
    async fn verify_offline_signature(&self, request: VerifyOfflineSignatureRequest) -> Result<VerifySignatureResponse>;

    /// Offline payload signed by the activation's server key
    async fn create_personalized_offline_payload(&self, activation_id: Uuid, data: String) -> Result<OfflinePayload>;

    /// Offline payload signed by the application master key
    async fn create_non_personalized_offline_payload(
        &self,
        application_id: String,
        data: String,
    ) -> Result<OfflinePayload>;

    /// Release the vault encryption key after a valid signature
    async fn vault_unlock(&self, request: VaultUnlockRequest) -> Result<VaultUnlockResponse>;

    // Protocol upgrade

    /// Hand out hash-based counter data to a V2 activation
    async fn start_upgrade(&self, activation_id: Uuid, encrypted: EncryptedRequest) -> Result<EncryptedResponse>;

    /// Switch a V2 activation to V3
    async fn commit_upgrade(&self, activation_id: Uuid, application_key: String) -> Result<ActivationStatusResponse>;

    // Recovery

    /// Change the recovery settings of an application
    async fn update_recovery_config(&self, request: UpdateRecoveryConfigRequest) -> Result<RecoveryConfigResponse>;

    /// Recovery settings of an application
    async fn get_recovery_config(&self, application_id: String) -> Result<RecoveryConfigResponse>;

    /// Issue a postcard recovery code
    async fn create_recovery_code(&self, request: CreateRecoveryCodeRequest) -> Result<CreateRecoveryCodeResponse>;

    /// `CREATED → ACTIVE` for a code the device has stored
    async fn confirm_recovery_code(
        &self,
        activation_id: Uuid,
        encrypted: EncryptedRequest,
    ) -> Result<ConfirmRecoveryCodeResponse>;

    /// Recovery codes matching a filter
    async fn lookup_recovery_codes(&self, filter: LookupRecoveryCodesFilter) -> Result<Vec<RecoveryCodeView>>;

    /// Revoke codes; returns how many changed
    async fn revoke_recovery_codes(&self, recovery_code_ids: Vec<Uuid>) -> Result<usize>;

    /// Consume a PUK and activate a new device
    async fn create_activation_using_recovery_code(
        &self,
        request: RecoveryActivationRequest,
    ) -> Result<ActivationKeyExchangeResponse>;

    // Temporary keys

    /// Issue a temporary envelope key
    async fn create_temporary_key(
        &self,
        application_key: String,
        activation_id: Option<Uuid>,
    ) -> Result<TemporaryKeyResponse>;

    /// Delete a temporary key; `false` when it did not exist
    async fn remove_temporary_key(&self, key_id: String) -> Result<bool>;

    // Housekeeping

    /// Remove pending activations past their expiry
    async fn expire_pending_activations(&self) -> Result<usize>;

    /// Delete expired temporary keys
    async fn purge_expired_temporary_keys(&self) -> Result<usize>;

    /// Delete expired replay guard entries
    async fn purge_used_nonces(&self) -> Result<usize>;
}
