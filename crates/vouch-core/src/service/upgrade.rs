//! Protocol 2 → 3 upgrade.

use crate::{
    envelope::{seal_json, EnvelopeScope},
    errors::*,
    messages::*,
    traits::AuditSink,
    transaction::RollbackExt,
    types::*,
};
use serde::de::IgnoredAny;
use tracing::info;
use uuid::Uuid;
use vouch_crypto::{init_ctr_data, EncryptedResponse};
use vouch_storage::{Storage, Transaction};

use super::{activation::incorrect_state, HistoryNote, VouchService};

impl<S, A> VouchService<S, A>
where
    S: Storage + 'static,
    A: AuditSink + 'static,
{
    /// Give a V2 activation hash-based counter data
    ///
    /// Repeated starts return the same counter data until the upgrade is committed.
    pub(crate) async fn start_upgrade_internal(
        &self,
        tx: &mut Transaction,
        activation_id: Uuid,
        encrypted: EncryptedRequest,
    ) -> Result<EncryptedResponse> {
        let application = self.application_by_key(&encrypted.application_key).await?;
        let mut activation = self.lock_activation(tx, activation_id).await?;
        check_upgradable(&activation, &application)?;

        let (_payload, session): (IgnoredAny, _) = self
            .open_envelope(
                tx,
                EnvelopeScope::UpgradeStart,
                &application,
                &encrypted,
                Some(&activation),
            )
            .await?;

        if activation.ctr_data.is_none() {
            activation.ctr_data = Some(init_ctr_data()?.to_vec());
            self.save_activation(tx, &mut activation, None)?;
            info!("Upgrade started for activation {}", activation_id);
        }

        let payload = UpgradeResponsePayload {
            ctr_data: activation.ctr_data.clone().unwrap_or_default(),
        };
        // Past the staged counter data
        seal_json(&session, &payload).or_rollback()
    }

    pub(crate) async fn commit_upgrade_internal(
        &self,
        tx: &mut Transaction,
        activation_id: Uuid,
        application_key: String,
    ) -> Result<ActivationStatusResponse> {
        let application = self.application_by_key(&application_key).await?;
        let mut activation = self.lock_activation(tx, activation_id).await?;
        check_upgradable(&activation, &application)?;

        if activation.ctr_data.is_none() {
            return Err(ServiceError::InvalidRequest("upgrade was not started".to_string()));
        }

        activation.protocol = ProtocolVersion::V3;
        self.save_activation(tx, &mut activation, Some(HistoryNote::reason("PROTOCOL_UPGRADE")))?;

        info!("Activation {} upgraded to protocol 3", activation_id);
        Ok((&activation).into())
    }
}

fn check_upgradable(activation: &Activation, application: &Application) -> Result<()> {
    if activation.application_id != application.application_id {
        return Err(ServiceError::ActivationNotFound(activation.activation_id.to_string()));
    }
    if activation.status != ActivationStatus::Active || activation.protocol != ProtocolVersion::V2 {
        return Err(incorrect_state(activation));
    }
    Ok(())
}
