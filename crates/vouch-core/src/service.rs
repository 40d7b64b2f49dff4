//! Activation engine service implementation.

mod activation;
mod application;
mod housekeeping;
mod recovery;
mod signature;
mod temporary_key;
mod upgrade;
mod vault;

use crate::{
    audit::SignatureAuditRecord,
    config::ServiceConfig,
    converters::SecretConverters,
    encryption::ContextEncryptionService,
    envelope::{nonce_key, shared_info2, validate_envelope, EnvelopeScope},
    errors::*,
    locking::RecordLocker,
    messages::*,
    traits::*,
    transaction::TransactionScope,
    types::*,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use vouch_crypto::{
    current_timestamp, current_timestamp_millis, ActivationKeys, EciesSession, EncryptedResponse, KeyPair,
};
use vouch_storage::{
    Storage, Transaction, CF_ACTIVATIONS, CF_ACTIVATIONS_BY_CODE, CF_ACTIVATIONS_BY_USER, CF_ACTIVATION_HISTORY,
    CF_APPLICATIONS, CF_APPLICATIONS_BY_KEY, CF_RECOVERY_CODES, CF_RECOVERY_CODES_BY_CODE,
    CF_RECOVERY_CODES_BY_USER, CF_TEMPORARY_KEYS, CF_USED_NONCES,
};

/// History details of a status change
#[derive(Debug, Clone, Default)]
pub(crate) struct HistoryNote {
    pub reason: Option<String>,
    pub external_user_id: Option<String>,
}

impl HistoryNote {
    pub(crate) fn reason(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            external_user_id: None,
        }
    }

    pub(crate) fn by(reason: Option<String>, external_user_id: Option<String>) -> Self {
        Self {
            reason,
            external_user_id,
        }
    }
}

/// Activation engine over a storage engine and an audit sink
pub struct VouchService<S, A>
where
    S: Storage,
    A: AuditSink,
{
    pub(super) storage: Arc<S>,
    pub(super) audit: Arc<A>,
    pub(super) config: Arc<ServiceConfig>,
    pub(super) encryption: Arc<ContextEncryptionService>,
    pub(super) converters: SecretConverters,
    pub(super) locker: RecordLocker<S>,
}

impl<S, A> VouchService<S, A>
where
    S: Storage + 'static,
    A: AuditSink + 'static,
{
    /// Create the service
    ///
    /// The locking strategy is picked here, once, from the storage engine identity.
    pub fn new(storage: Arc<S>, audit: Arc<A>, config: ServiceConfig) -> Self {
        let encryption = Arc::new(ContextEncryptionService::new(
            config.master_db_encryption_key.as_deref(),
        ));
        let converters = SecretConverters::new(Arc::clone(&encryption));
        let locker = RecordLocker::new(Arc::clone(&storage));

        Self {
            storage,
            audit,
            config: Arc::new(config),
            encryption,
            converters,
            locker,
        }
    }

    /// Configuration snapshot in use
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Whether secrets are encrypted at rest
    pub fn encrypts_secrets(&self) -> bool {
        self.encryption.is_configured()
    }

    pub(super) async fn begin(&self, operation: &'static str) -> Result<TransactionScope> {
        TransactionScope::begin(&*self.storage, operation).await
    }

    /// Application by name; unknown names are invalid applications
    pub(super) async fn application_by_id(&self, application_id: &str) -> Result<Application> {
        self.storage
            .get(CF_APPLICATIONS, &application_id.to_string())
            .await?
            .ok_or_else(|| ServiceError::InvalidApplication(application_id.to_string()))
    }

    /// Supported application by its public key
    pub(super) async fn application_by_key(&self, application_key: &str) -> Result<Application> {
        let application_id: Option<String> = self
            .storage
            .get(CF_APPLICATIONS_BY_KEY, &application_key.to_string())
            .await?;
        let application_id =
            application_id.ok_or_else(|| ServiceError::InvalidApplication("unknown application key".to_string()))?;

        let application = self.application_by_id(&application_id).await?;
        if !application.supported {
            warn!("Rejected request for unsupported application {}", application.application_id);
            return Err(ServiceError::InvalidApplication(application.application_id));
        }
        Ok(application)
    }

    /// Lock an activation or fail with not found
    pub(super) async fn lock_activation(&self, tx: &mut Transaction, activation_id: Uuid) -> Result<Activation> {
        self.locker
            .lock_for_update(tx, activation_id)
            .await
            .ok_or_else(|| ServiceError::ActivationNotFound(activation_id.to_string()))
    }

    /// Stage an activation, its indexes and optionally a history entry
    pub(super) fn save_activation(
        &self,
        tx: &mut Transaction,
        activation: &mut Activation,
        note: Option<HistoryNote>,
    ) -> Result<()> {
        activation.last_changed_at = current_timestamp();

        if let Some(code) = &activation.activation_code {
            let index_key = (activation.application_id.as_str(), code.as_str());
            if activation.status == ActivationStatus::Created {
                tx.put(CF_ACTIVATIONS_BY_CODE, &index_key, &activation.activation_id)?;
            } else {
                tx.delete(CF_ACTIVATIONS_BY_CODE, &index_key)?;
                activation.activation_code = None;
            }
        }

        if let Some(note) = note {
            let entry = ActivationHistoryEntry {
                activation_id: activation.activation_id,
                sequence: activation.history_seq,
                status: activation.status,
                event_reason: note.reason,
                external_user_id: note.external_user_id,
                timestamp: activation.last_changed_at,
            };
            activation.history_seq += 1;
            tx.put(
                CF_ACTIVATION_HISTORY,
                &(activation.activation_id, entry.sequence),
                &entry,
            )?;
        }

        tx.put(CF_ACTIVATIONS, &activation.activation_id, &*activation)?;
        tx.put(
            CF_ACTIVATIONS_BY_USER,
            &(activation.user_id.as_str(), activation.activation_id),
            &activation.activation_id,
        )?;
        Ok(())
    }

    /// Remove a pending activation past its expiry
    ///
    /// The removal is staged and the expiry error returned; the error does not roll back, so the
    /// removal is kept.
    pub(super) fn expire_if_pending(&self, tx: &mut Transaction, activation: &mut Activation) -> Result<()> {
        if !activation.is_expired(current_timestamp()) {
            return Ok(());
        }

        activation.status = ActivationStatus::Removed;
        self.save_activation(tx, activation, Some(HistoryNote::reason("ACTIVATION_EXPIRED")))?;
        warn!("Activation expired: {}", activation.activation_id);
        Err(ServiceError::ActivationExpired(activation.activation_id.to_string()))
    }

    /// Stage a recovery code and its indexes
    pub(super) fn save_recovery_code(&self, tx: &mut Transaction, code: &mut RecoveryCode) -> Result<()> {
        code.last_changed_at = current_timestamp();
        tx.put(CF_RECOVERY_CODES, &code.recovery_code_id, &*code)?;
        tx.put(
            CF_RECOVERY_CODES_BY_CODE,
            &(code.application_id.as_str(), code.code.as_str()),
            &code.recovery_code_id,
        )?;
        tx.put(
            CF_RECOVERY_CODES_BY_USER,
            &(code.user_id.as_str(), code.recovery_code_id),
            &code.recovery_code_id,
        )?;
        Ok(())
    }

    /// Recovery codes of a user, unlocked
    pub(super) async fn recovery_codes_of_user(&self, user_id: &str) -> Result<Vec<RecoveryCode>> {
        let ids: Vec<(Vec<u8>, Uuid)> = self
            .storage
            .get_by_prefix(CF_RECOVERY_CODES_BY_USER, &user_id.to_string())
            .await?;

        let mut codes = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(code) = self.storage.get(CF_RECOVERY_CODES, &id).await? {
                codes.push(code);
            }
        }
        Ok(codes)
    }

    /// Server key pair of an activation
    pub(super) fn server_key_pair(&self, activation: &Activation) -> Result<KeyPair> {
        let private_key = self.converters.server_private_key.from_storage(
            &activation.server_private_key,
            &activation.user_id,
            activation.activation_id,
        )?;
        Ok(KeyPair::from_private_bytes(&private_key[..])?)
    }

    /// Signature, transport and vault keys of an activation
    pub(super) fn activation_keys(&self, activation: &Activation) -> Result<ActivationKeys> {
        let device_public_key =
            activation
                .device_public_key
                .as_deref()
                .ok_or_else(|| ServiceError::ActivationIncorrectState {
                    activation_id: activation.activation_id.to_string(),
                    status: activation.status,
                })?;

        let master_secret = self.server_key_pair(activation)?.diffie_hellman(device_public_key)?;
        Ok(ActivationKeys::derive(&master_secret[..])?)
    }

    /// Verify, decrypt and parse an encrypted request
    ///
    /// Nothing is staged until the MAC has been verified and the payload parsed. The consumed
    /// nonce is then staged so the envelope cannot be replayed.
    pub(super) async fn open_envelope<T>(
        &self,
        tx: &mut Transaction,
        scope: EnvelopeScope,
        application: &Application,
        request: &EncryptedRequest,
        activation: Option<&Activation>,
    ) -> Result<(T, EciesSession)>
    where
        T: DeserializeOwned + Send,
    {
        let now_ms = current_timestamp_millis();
        validate_envelope(&request.envelope, &self.config, now_ms)?;

        let replay_key = nonce_key(&request.envelope);
        if self.storage.exists(CF_USED_NONCES, &replay_key).await? {
            warn!("Replayed envelope rejected for application {}", application.application_id);
            return Err(ServiceError::InvalidRequest("envelope was already used".to_string()));
        }

        let recipient = self
            .envelope_recipient(scope, application, request, activation, now_ms)
            .await?;

        let (plaintext, session) = EciesSession::open_request(
            &recipient,
            scope.shared_info1(),
            &shared_info2(application),
            &request.envelope,
        )
        .map_err(|e| {
            debug!("Envelope rejected: {}", e);
            ServiceError::from(e)
        })?;

        let payload: T = serde_json::from_slice(&plaintext)?;

        let expires_at = now_ms
            .saturating_add(self.config.request_timestamp_validity_ms)
            .saturating_add(self.config.request_timestamp_tolerance_ms);
        tx.put(CF_USED_NONCES, &replay_key, &UsedNonce { expires_at })?;

        Ok((payload, session))
    }

    async fn envelope_recipient(
        &self,
        scope: EnvelopeScope,
        application: &Application,
        request: &EncryptedRequest,
        activation: Option<&Activation>,
        now_ms: u64,
    ) -> Result<KeyPair> {
        if let Some(key_id) = &request.temporary_key_id {
            let key: TemporaryKey = self
                .storage
                .get(CF_TEMPORARY_KEYS, key_id)
                .await?
                .ok_or_else(|| ServiceError::TemporaryKeyNotFound(key_id.clone()))?;

            let bound_to = activation.map(|a| a.activation_id);
            if key.application_key != application.application_key
                || key.activation_id != bound_to
                || key.expires_at < now_ms
            {
                return Err(ServiceError::TemporaryKeyNotFound(key_id.clone()));
            }

            let private_key = self.converters.temporary_key.from_storage(
                &key.private_key,
                &key.key_id,
                &key.application_key,
                key.activation_id,
            )?;
            return Ok(KeyPair::from_private_bytes(&private_key[..])?);
        }

        match (scope.is_application_scope(), activation) {
            (true, _) => Ok(KeyPair::from_private_bytes(&application.master_private_key)?),
            (false, Some(activation)) => self.server_key_pair(activation),
            (false, None) => Err(ServiceError::Unknown(
                "activation envelope opened without an activation".to_string(),
            )),
        }
    }

    /// Hand a record to the audit sink; failures are logged and ignored
    pub(super) async fn audit(&self, record: SignatureAuditRecord) {
        if let Err(e) = self.audit.record(record).await {
            warn!("Audit sink rejected record: {}", e);
        }
    }
}

#[async_trait]
impl<S, A> ActivationEngine for VouchService<S, A>
where
    S: Storage + 'static,
    A: AuditSink + 'static,
{
    async fn create_application(&self, application_id: String) -> Result<Application> {
        let mut scope = self.begin("create_application").await?;
        let result = self.create_application_internal(&mut scope, application_id).await;
        scope.finish(result).await
    }

    async fn get_application(&self, application_id: String) -> Result<Application> {
        self.application_by_id(&application_id).await
    }

    async fn set_application_supported(&self, application_id: String, supported: bool) -> Result<Application> {
        let mut scope = self.begin("set_application_supported").await?;
        let result = self
            .set_application_supported_internal(&mut scope, application_id, supported)
            .await;
        scope.finish(result).await
    }

    async fn init_activation(&self, request: InitActivationRequest) -> Result<InitActivationResponse> {
        let mut scope = self.begin("init_activation").await?;
        let result = self.init_activation_internal(&mut scope, request).await;
        scope.finish(result).await
    }

    async fn prepare_activation(&self, request: PrepareActivationRequest) -> Result<ActivationKeyExchangeResponse> {
        let mut scope = self.begin("prepare_activation").await?;
        let result = self.prepare_activation_internal(&mut scope, request).await;
        scope.finish(result).await
    }

    async fn create_activation(&self, request: CreateActivationRequest) -> Result<ActivationKeyExchangeResponse> {
        let mut scope = self.begin("create_activation").await?;
        let result = self.create_activation_internal(&mut scope, request).await;
        scope.finish(result).await
    }

    async fn commit_activation(
        &self,
        activation_id: Uuid,
        external_user_id: Option<String>,
        otp: Option<String>,
    ) -> Result<ActivationStatusResponse> {
        let mut scope = self.begin("commit_activation").await?;
        let result = self
            .commit_activation_internal(&mut scope, activation_id, external_user_id, otp)
            .await;
        scope.finish(result).await
    }

    async fn get_activation_status(&self, activation_id: Uuid) -> Result<ActivationStatusResponse> {
        let mut scope = self.begin("get_activation_status").await?;
        let result = self.get_activation_status_internal(&mut scope, activation_id).await;
        scope.finish(result).await
    }

    async fn list_activations(
        &self,
        user_id: String,
        application_id: Option<String>,
    ) -> Result<Vec<ActivationStatusResponse>> {
        self.list_activations_internal(user_id, application_id).await
    }

    async fn activation_history(&self, activation_id: Uuid) -> Result<Vec<ActivationHistoryEntry>> {
        self.activation_history_internal(activation_id).await
    }

    async fn block_activation(
        &self,
        activation_id: Uuid,
        reason: Option<String>,
        external_user_id: Option<String>,
    ) -> Result<ActivationStatusResponse> {
        let mut scope = self.begin("block_activation").await?;
        let result = self
            .block_activation_internal(&mut scope, activation_id, reason, external_user_id)
            .await;
        scope.finish(result).await
    }

    async fn unblock_activation(
        &self,
        activation_id: Uuid,
        external_user_id: Option<String>,
    ) -> Result<ActivationStatusResponse> {
        let mut scope = self.begin("unblock_activation").await?;
        let result = self
            .unblock_activation_internal(&mut scope, activation_id, external_user_id)
            .await;
        scope.finish(result).await
    }

    async fn remove_activation(
        &self,
        activation_id: Uuid,
        external_user_id: Option<String>,
        revoke_recovery_codes: bool,
    ) -> Result<ActivationStatusResponse> {
        let mut scope = self.begin("remove_activation").await?;
        let result = self
            .remove_activation_internal(&mut scope, activation_id, external_user_id, revoke_recovery_codes)
            .await;
        scope.finish(result).await
    }

    async fn add_activation_flags(&self, activation_id: Uuid, flags: Vec<String>) -> Result<BTreeSet<String>> {
        let mut scope = self.begin("add_activation_flags").await?;
        let result = self
            .update_activation_flags_internal(&mut scope, activation_id, flags, true)
            .await;
        scope.finish(result).await
    }

    async fn remove_activation_flags(&self, activation_id: Uuid, flags: Vec<String>) -> Result<BTreeSet<String>> {
        let mut scope = self.begin("remove_activation_flags").await?;
        let result = self
            .update_activation_flags_internal(&mut scope, activation_id, flags, false)
            .await;
        scope.finish(result).await
    }

    async fn verify_signature(&self, request: VerifySignatureRequest) -> Result<VerifySignatureResponse> {
        let mut scope = self.begin("verify_signature").await?;
        let result = self.verify_signature_internal(&mut scope, request).await;
        scope.finish(result).await
    }

    async fn verify_offline_signature(&self, request: VerifyOfflineSignatureRequest) -> Result<VerifySignatureResponse> {
        let mut scope = self.begin("verify_offline_signature").await?;
        let result = self.verify_offline_signature_internal(&mut scope, request).await;
        scope.finish(result).await
    }

    async fn create_personalized_offline_payload(&self, activation_id: Uuid, data: String) -> Result<OfflinePayload> {
        self.create_personalized_offline_payload_internal(activation_id, data)
            .await
    }

    async fn create_non_personalized_offline_payload(
        &self,
        application_id: String,
        data: String,
    ) -> Result<OfflinePayload> {
        self.create_non_personalized_offline_payload_internal(application_id, data)
            .await
    }

    async fn vault_unlock(&self, request: VaultUnlockRequest) -> Result<VaultUnlockResponse> {
        let mut scope = self.begin("vault_unlock").await?;
        let result = self.vault_unlock_internal(&mut scope, request).await;
        scope.finish(result).await
    }

    async fn start_upgrade(&self, activation_id: Uuid, encrypted: EncryptedRequest) -> Result<EncryptedResponse> {
        let mut scope = self.begin("start_upgrade").await?;
        let result = self.start_upgrade_internal(&mut scope, activation_id, encrypted).await;
        scope.finish(result).await
    }

    async fn commit_upgrade(&self, activation_id: Uuid, application_key: String) -> Result<ActivationStatusResponse> {
        let mut scope = self.begin("commit_upgrade").await?;
        let result = self
            .commit_upgrade_internal(&mut scope, activation_id, application_key)
            .await;
        scope.finish(result).await
    }

    async fn update_recovery_config(&self, request: UpdateRecoveryConfigRequest) -> Result<RecoveryConfigResponse> {
        let mut scope = self.begin("update_recovery_config").await?;
        let result = self.update_recovery_config_internal(&mut scope, request).await;
        scope.finish(result).await
    }

    async fn get_recovery_config(&self, application_id: String) -> Result<RecoveryConfigResponse> {
        self.get_recovery_config_internal(application_id).await
    }

    async fn create_recovery_code(&self, request: CreateRecoveryCodeRequest) -> Result<CreateRecoveryCodeResponse> {
        let mut scope = self.begin("create_recovery_code").await?;
        let result = self.create_recovery_code_internal(&mut scope, request).await;
        scope.finish(result).await
    }

    async fn confirm_recovery_code(
        &self,
        activation_id: Uuid,
        encrypted: EncryptedRequest,
    ) -> Result<ConfirmRecoveryCodeResponse> {
        let mut scope = self.begin("confirm_recovery_code").await?;
        let result = self
            .confirm_recovery_code_internal(&mut scope, activation_id, encrypted)
            .await;
        scope.finish(result).await
    }

    async fn lookup_recovery_codes(&self, filter: LookupRecoveryCodesFilter) -> Result<Vec<RecoveryCodeView>> {
        self.lookup_recovery_codes_internal(filter).await
    }

    async fn revoke_recovery_codes(&self, recovery_code_ids: Vec<Uuid>) -> Result<usize> {
        let mut scope = self.begin("revoke_recovery_codes").await?;
        let result = self
            .revoke_recovery_codes_internal(&mut scope, recovery_code_ids)
            .await;
        scope.finish(result).await
    }

    async fn create_activation_using_recovery_code(
        &self,
        request: RecoveryActivationRequest,
    ) -> Result<ActivationKeyExchangeResponse> {
        let mut scope = self.begin("create_activation_using_recovery_code").await?;
        let result = self.recovery_activation_internal(&mut scope, request).await;
        scope.finish(result).await
    }

    async fn create_temporary_key(
        &self,
        application_key: String,
        activation_id: Option<Uuid>,
    ) -> Result<TemporaryKeyResponse> {
        let mut scope = self.begin("create_temporary_key").await?;
        let result = self
            .create_temporary_key_internal(&mut scope, application_key, activation_id)
            .await;
        scope.finish(result).await
    }

    async fn remove_temporary_key(&self, key_id: String) -> Result<bool> {
        let mut scope = self.begin("remove_temporary_key").await?;
        let result = self.remove_temporary_key_internal(&mut scope, key_id).await;
        scope.finish(result).await
    }

    async fn expire_pending_activations(&self) -> Result<usize> {
        self.expire_pending_activations_internal().await
    }

    async fn purge_expired_temporary_keys(&self) -> Result<usize> {
        self.purge_expired_temporary_keys_internal().await
    }

    async fn purge_used_nonces(&self) -> Result<usize> {
        self.purge_used_nonces_internal().await
    }
}
