//! Temporary envelope keys.

use crate::{errors::*, messages::*, traits::AuditSink, types::*};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::info;
use uuid::Uuid;
use vouch_crypto::{current_timestamp_millis, KeyPair};
use vouch_storage::{Storage, Transaction, CF_ACTIVATIONS, CF_TEMPORARY_KEYS};

use super::{activation::incorrect_state, VouchService};

impl<S, A> VouchService<S, A>
where
    S: Storage + 'static,
    A: AuditSink + 'static,
{
    /// Issue a key pair clients may encrypt one or more envelopes to
    ///
    /// A key bound to an activation is signed by its server key, otherwise by the application
    /// master key.
    pub(crate) async fn create_temporary_key_internal(
        &self,
        tx: &mut Transaction,
        application_key: String,
        activation_id: Option<Uuid>,
    ) -> Result<TemporaryKeyResponse> {
        let application = self.application_by_key(&application_key).await?;

        let signing_key = match activation_id {
            Some(id) => {
                let activation: Activation = self
                    .storage
                    .get(CF_ACTIVATIONS, &id)
                    .await?
                    .ok_or_else(|| ServiceError::ActivationNotFound(id.to_string()))?;
                if activation.application_id != application.application_id {
                    return Err(ServiceError::ActivationNotFound(id.to_string()));
                }
                if activation.status != ActivationStatus::Active {
                    return Err(incorrect_state(&activation));
                }
                self.server_key_pair(&activation)?
            }
            None => KeyPair::from_private_bytes(&application.master_private_key)?,
        };

        let key_id = Uuid::new_v4().to_string();
        let key_pair = KeyPair::generate();
        let validity_ms = u64::try_from(self.config.temporary_key_validity.as_millis()).unwrap_or(u64::MAX);
        let expires_at = current_timestamp_millis().saturating_add(validity_ms);
        let private_key = self.converters.temporary_key.to_storage(
            &key_pair.private_key_bytes(),
            &key_id,
            &application_key,
            activation_id,
        )?;

        let key = TemporaryKey {
            key_id: key_id.clone(),
            application_key: application_key.clone(),
            activation_id,
            public_key: key_pair.public_key_bytes(),
            private_key,
            expires_at,
        };
        tx.put(CF_TEMPORARY_KEYS, &key_id, &key)?;

        let signature = signing_key.sign(temporary_key_signed_text(&key).as_bytes());

        info!(
            "Temporary key {} issued for application {}",
            key_id, application.application_id
        );
        Ok(TemporaryKeyResponse {
            key_id,
            application_key,
            activation_id,
            public_key: key.public_key,
            expires_at,
            signature,
        })
    }

    pub(crate) async fn remove_temporary_key_internal(&self, tx: &mut Transaction, key_id: String) -> Result<bool> {
        if !self.storage.exists(CF_TEMPORARY_KEYS, &key_id).await? {
            return Ok(false);
        }

        tx.delete(CF_TEMPORARY_KEYS, &key_id)?;
        info!("Temporary key {} removed", key_id);
        Ok(true)
    }
}

/// `key_id \n Base64(public_key) \n expires_at`
pub(crate) fn temporary_key_signed_text(key: &TemporaryKey) -> String {
    format!(
        "{}\n{}\n{}",
        key.key_id,
        STANDARD.encode(&key.public_key),
        key.expires_at
    )
}
