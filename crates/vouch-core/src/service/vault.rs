//! Vault unlock.

use crate::{
    envelope::{seal_json, EnvelopeScope},
    errors::*,
    messages::*,
    signature::{counter_mode, vault_unlock_allow_list},
    traits::AuditSink,
    transaction::RollbackExt,
    types::*,
};
use std::collections::BTreeMap;
use tracing::{info, warn};
use vouch_crypto::{aes_cbc_encrypt_with_random_iv, ONLINE_COMPONENT_LENGTH};
use vouch_storage::{Storage, Transaction};

use super::{signature::SignatureAttempt, VouchService};

impl<S, A> VouchService<S, A>
where
    S: Storage + 'static,
    A: AuditSink + 'static,
{
    /// Verify a signature and hand out the vault key encrypted under the transport key
    pub(crate) async fn vault_unlock_internal(
        &self,
        tx: &mut Transaction,
        request: VaultUnlockRequest,
    ) -> Result<VaultUnlockResponse> {
        let application = self
            .application_by_key(&request.encrypted.application_key)
            .await?;
        let mut activation = self.lock_activation(tx, request.activation_id).await?;
        let mode = counter_mode(&activation, None);

        if activation.status != ActivationStatus::Active
            || activation.application_id != application.application_id
        {
            self.audit_rejection(
                &activation,
                request.signature_type,
                mode,
                "Vault unlock for an unusable activation",
            )
            .await;
            return Ok(vault_response(&activation, false, None));
        }

        let (_payload, session): (VaultUnlockPayload, _) = self
            .open_envelope(
                tx,
                EnvelopeScope::VaultUnlock,
                &application,
                &request.encrypted,
                Some(&activation),
            )
            .await?;

        let allowed = vault_unlock_allow_list(&self.config);
        if !allowed.contains(&request.signature_type) {
            self.record_signature_failure(
                tx,
                &mut activation,
                mode,
                request.signature_type,
                "Signature type not allowed for vault unlock",
                BTreeMap::new(),
            )
            .await?;
            warn!(
                "Vault unlock with {} rejected for activation {}",
                request.signature_type, activation.activation_id
            );
            return Err(ServiceError::InvalidSignature);
        }

        let keys = self.activation_keys(&activation)?;
        let candidates = [request.signature_type];
        let matched = self
            .check_signature(
                tx,
                &mut activation,
                SignatureAttempt {
                    mode,
                    candidates: &candidates,
                    data: &request.signed_data,
                    signature: &request.signature,
                    component_length: ONLINE_COMPONENT_LENGTH,
                    failure_attributes: BTreeMap::new(),
                },
            )
            .await?;

        if matched.is_none() {
            return Ok(vault_response(&activation, false, None));
        }

        // Past the staged counter update
        let encrypted_vault_encryption_key =
            aes_cbc_encrypt_with_random_iv(keys.transport_key(), keys.vault_key()).or_rollback()?;
        let encrypted_response = seal_json(
            &session,
            &VaultUnlockResponsePayload {
                encrypted_vault_encryption_key,
            },
        )
        .or_rollback()?;

        info!("Vault unlocked for activation {}", activation.activation_id);
        Ok(vault_response(&activation, true, Some(encrypted_response)))
    }
}

fn vault_response(
    activation: &Activation,
    signature_valid: bool,
    encrypted_response: Option<vouch_crypto::EncryptedResponse>,
) -> VaultUnlockResponse {
    VaultUnlockResponse {
        signature_valid,
        activation_id: activation.activation_id,
        activation_status: activation.status,
        remaining_attempts: activation.remaining_attempts(),
        encrypted_response,
    }
}
