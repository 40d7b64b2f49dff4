//! Application registry.

use crate::{errors::*, traits::AuditSink, types::*};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::info;
use vouch_crypto::{current_timestamp, random_bytes, KeyPair};
use vouch_storage::{Storage, Transaction, CF_APPLICATIONS, CF_APPLICATIONS_BY_KEY};

use super::VouchService;

/// Row locked while a record number is assigned
const APPLICATION_REGISTRY_KEY: &str = "";

impl<S, A> VouchService<S, A>
where
    S: Storage + 'static,
    A: AuditSink + 'static,
{
    /// Register an application
    ///
    /// Record numbers are sequential and feed the recovery secret contexts, so they are assigned
    /// under the registry lock.
    pub(crate) async fn create_application_internal(
        &self,
        tx: &mut Transaction,
        application_id: String,
    ) -> Result<Application> {
        let application_id = application_id.trim().to_string();
        if application_id.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "application name must not be empty".to_string(),
            ));
        }

        let registry_lock = self
            .storage
            .lock_for_update(CF_APPLICATIONS, &APPLICATION_REGISTRY_KEY.to_string())
            .await?;
        tx.hold(registry_lock);

        if self.storage.exists(CF_APPLICATIONS, &application_id).await? {
            return Err(ServiceError::InvalidRequest(format!(
                "application {} already exists",
                application_id
            )));
        }

        let existing: Vec<(Vec<u8>, Application)> = self.storage.scan_all(CF_APPLICATIONS).await?;
        let master_key = KeyPair::generate();

        let application = Application {
            application_id: application_id.clone(),
            record_id: existing.len() as u64 + 1,
            application_key: STANDARD.encode(random_bytes::<16>()?),
            application_secret: STANDARD.encode(random_bytes::<16>()?),
            master_public_key: master_key.public_key_bytes(),
            master_private_key: master_key.private_key_bytes().to_vec(),
            supported: true,
            created_at: current_timestamp(),
        };

        tx.put(CF_APPLICATIONS, &application_id, &application)?;
        tx.put(
            CF_APPLICATIONS_BY_KEY,
            &application.application_key,
            &application_id,
        )?;

        info!(
            "Application created: {} (record {})",
            application_id, application.record_id
        );
        Ok(application)
    }

    pub(crate) async fn set_application_supported_internal(
        &self,
        tx: &mut Transaction,
        application_id: String,
        supported: bool,
    ) -> Result<Application> {
        let lock = self.storage.lock_for_update(CF_APPLICATIONS, &application_id).await?;
        tx.hold(lock);

        let mut application = self.application_by_id(&application_id).await?;
        application.supported = supported;
        tx.put(CF_APPLICATIONS, &application_id, &application)?;

        info!("Application {} supported: {}", application_id, supported);
        Ok(application)
    }
}
