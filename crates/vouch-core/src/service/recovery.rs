//! Recovery codes and PUKs.

use crate::{
    converters::PukContext,
    envelope::{seal_json, EnvelopeScope},
    errors::*,
    messages::*,
    traits::AuditSink,
    transaction::RollbackExt,
    types::*,
};
use tracing::{info, warn};
use uuid::Uuid;
use vouch_crypto::{
    current_timestamp, generate_activation_code, generate_recovery_code, hash_secret, mask_code,
    normalize_public_key, random_bytes, verify_secret, KeyPair, PUK_LENGTH,
};
use vouch_storage::{
    Storage, Transaction, CF_RECOVERY_CODES, CF_RECOVERY_CODES_BY_CODE, CF_RECOVERY_CODES_BY_USER, CF_RECOVERY_CONFIGS,
};

use super::{
    activation::{incorrect_state, ActivationParams},
    HistoryNote, VouchService,
};

impl<S, A> VouchService<S, A>
where
    S: Storage + 'static,
    A: AuditSink + 'static,
{
    /// Change the recovery settings of an application
    ///
    /// A missing remote key keeps the stored one. The postcard key pair is generated the first
    /// time postcards are enabled.
    pub(crate) async fn update_recovery_config_internal(
        &self,
        tx: &mut Transaction,
        request: UpdateRecoveryConfigRequest,
    ) -> Result<RecoveryConfigResponse> {
        if request.recovery_postcard_enabled && !request.activation_recovery_enabled {
            return Err(ServiceError::InvalidRecoveryConfiguration(
                "postcards require recovery to be enabled".to_string(),
            ));
        }

        let application = self.application_by_id(&request.application_id).await?;
        let lock = self
            .storage
            .lock_for_update(CF_RECOVERY_CONFIGS, &application.application_id)
            .await?;
        tx.hold(lock);

        let mut config = self.recovery_config(&application.application_id).await?;

        if let Some(remote_key) = &request.remote_postcard_public_key {
            config.remote_postcard_public_key = Some(normalize_public_key(remote_key)?);
        }
        config.activation_recovery_enabled = request.activation_recovery_enabled;
        config.recovery_postcard_enabled = request.recovery_postcard_enabled;
        config.allow_multiple_recovery_codes = request.allow_multiple_recovery_codes;

        if config.recovery_postcard_enabled && config.postcard_private_key.is_none() {
            let postcard_key = KeyPair::generate();
            config.postcard_private_key = Some(
                self.converters
                    .recovery_private_key
                    .to_storage(&postcard_key.private_key_bytes(), application.record_id)?,
            );
            config.postcard_public_key = Some(postcard_key.public_key_bytes());
            info!("Postcard key pair generated for application {}", application.application_id);
        }

        tx.put(CF_RECOVERY_CONFIGS, &application.application_id, &config)?;

        info!("Recovery configuration updated for application {}", application.application_id);
        Ok((&config).into())
    }

    pub(crate) async fn get_recovery_config_internal(&self, application_id: String) -> Result<RecoveryConfigResponse> {
        let application = self.application_by_id(&application_id).await?;
        let config = self.recovery_config(&application.application_id).await?;
        Ok((&config).into())
    }

    /// Issue a postcard code; the response carries only what the printing centre needs
    pub(crate) async fn create_recovery_code_internal(
        &self,
        tx: &mut Transaction,
        request: CreateRecoveryCodeRequest,
    ) -> Result<CreateRecoveryCodeResponse> {
        let max_puk_count = self.config.max_puk_count();
        if request.puk_count == 0 || request.puk_count > max_puk_count {
            return Err(ServiceError::InvalidRequest(format!(
                "PUK count must be between 1 and {}",
                max_puk_count
            )));
        }
        if request.user_id.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("user ID must not be empty".to_string()));
        }

        let application = self.application_by_id(&request.application_id).await?;
        let config = self.recovery_config(&application.application_id).await?;
        if !config.activation_recovery_enabled || !config.recovery_postcard_enabled {
            return Err(ServiceError::InvalidRecoveryConfiguration(
                "postcard recovery is disabled".to_string(),
            ));
        }
        let (Some(postcard_private_key), Some(remote_public_key)) =
            (&config.postcard_private_key, &config.remote_postcard_public_key)
        else {
            return Err(ServiceError::InvalidRecoveryConfiguration(
                "postcard keys are not configured".to_string(),
            ));
        };

        let user_lock = self
            .storage
            .lock_for_update(CF_RECOVERY_CODES_BY_USER, &request.user_id)
            .await?;
        tx.hold(user_lock);

        if !config.allow_multiple_recovery_codes {
            let existing = self.recovery_codes_of_user(&request.user_id).await?;
            let has_live = existing.iter().any(|code| {
                code.application_id == application.application_id
                    && code.activation_id.is_none()
                    && code.is_live()
            });
            if has_live {
                return Err(ServiceError::RecoveryCodeAlreadyExists);
            }
        }

        let private_key = self
            .converters
            .recovery_private_key
            .from_storage(postcard_private_key, application.record_id)?;
        let shared_secret = KeyPair::from_private_bytes(&private_key[..])?.diffie_hellman(remote_public_key)?;

        let mut info = None;
        for _ in 0..self.config.generate_recovery_code_iterations.max(1) {
            let candidate = generate_recovery_code(&shared_secret[..], request.puk_count)?;
            let taken = self
                .storage
                .exists(
                    CF_RECOVERY_CODES_BY_CODE,
                    &(application.application_id.as_str(), candidate.recovery_code.as_str()),
                )
                .await?;
            if !taken {
                info = Some(candidate);
                break;
            }
        }
        let info = info.ok_or(ServiceError::UnableToGenerateRecoveryCode)?;

        let now = current_timestamp();
        let mut puks = Vec::with_capacity(info.puks.len());
        for (index, puk) in &info.puks {
            let hash = hash_secret(puk.as_bytes())?;
            let stored = self.converters.recovery_puk.to_storage(
                &hash,
                PukContext {
                    application_record_id: application.record_id,
                    user_id: &request.user_id,
                    recovery_code: &info.recovery_code,
                    puk_index: *index,
                },
            )?;
            puks.push(RecoveryPuk {
                index: *index,
                hash: stored,
                status: RecoveryPukStatus::Valid,
                last_changed_at: now,
            });
        }

        let mut code = RecoveryCode {
            recovery_code_id: Uuid::new_v4(),
            code: info.recovery_code.clone(),
            application_id: application.application_id.clone(),
            user_id: request.user_id.clone(),
            activation_id: None,
            status: RecoveryCodeStatus::Created,
            failed_attempts: 0,
            max_failed_attempts: self.config.recovery_max_failed_attempts,
            puks,
            created_at: now,
            last_changed_at: now,
        };
        self.save_recovery_code(tx, &mut code)?;

        info!(
            "Postcard recovery code {} created for user {} with {} PUKs",
            mask_code(&code.code),
            code.user_id,
            code.puks.len()
        );
        Ok(CreateRecoveryCodeResponse {
            recovery_code_id: code.recovery_code_id,
            application_id: code.application_id,
            user_id: code.user_id,
            status: code.status,
            nonce: info.nonce.to_vec(),
            puks: info
                .puks
                .iter()
                .zip(&info.puk_derivation_indexes)
                .map(|((puk_index, _), derivation_index)| PukDerivation {
                    puk_index: *puk_index,
                    derivation_index: *derivation_index,
                })
                .collect(),
        })
    }

    /// `CREATED → ACTIVE` for a code the device holds
    pub(crate) async fn confirm_recovery_code_internal(
        &self,
        tx: &mut Transaction,
        activation_id: Uuid,
        encrypted: EncryptedRequest,
    ) -> Result<ConfirmRecoveryCodeResponse> {
        let application = self.application_by_key(&encrypted.application_key).await?;
        let activation = self.lock_activation(tx, activation_id).await?;
        if activation.application_id != application.application_id {
            return Err(ServiceError::ActivationNotFound(activation_id.to_string()));
        }
        if activation.status != ActivationStatus::Active {
            return Err(incorrect_state(&activation));
        }

        let (payload, session): (ConfirmRecoveryCodePayload, _) = self
            .open_envelope(
                tx,
                EnvelopeScope::ConfirmRecoveryCode,
                &application,
                &encrypted,
                Some(&activation),
            )
            .await?;

        let recovery_code_id = self
            .recovery_code_id_by_value(&application, &payload.recovery_code)
            .await?;
        let mut code = self
            .locker
            .lock_recovery_code(tx, recovery_code_id)
            .await
            .ok_or(ServiceError::RecoveryCodeNotFound)?;
        if code.user_id != activation.user_id {
            warn!("Recovery code confirmation by a different user, activation {}", activation_id);
            return Err(ServiceError::RecoveryCodeNotFound);
        }

        let already_confirmed = match code.status {
            RecoveryCodeStatus::Created => {
                code.status = RecoveryCodeStatus::Active;
                self.save_recovery_code(tx, &mut code)?;
                info!("Recovery code {} confirmed", mask_code(&code.code));
                false
            }
            RecoveryCodeStatus::Active => true,
            status => return Err(ServiceError::RecoveryCodeIncorrectState { status }),
        };

        // Past the staged confirmation
        let encrypted_response =
            seal_json(&session, &ConfirmRecoveryCodeResponsePayload { already_confirmed }).or_rollback()?;

        Ok(ConfirmRecoveryCodeResponse {
            activation_id,
            user_id: activation.user_id,
            already_confirmed,
            encrypted_response,
        })
    }

    /// Consume a PUK and activate a new device for the code's user
    pub(crate) async fn recovery_activation_internal(
        &self,
        tx: &mut Transaction,
        request: RecoveryActivationRequest,
    ) -> Result<ActivationKeyExchangeResponse> {
        let application = self
            .application_by_key(&request.encrypted.application_key)
            .await?;
        let config = self.recovery_config(&application.application_id).await?;
        if !config.activation_recovery_enabled {
            return Err(ServiceError::InvalidRecoveryConfiguration(
                "activation recovery is disabled".to_string(),
            ));
        }

        let (payload, session): (RecoveryActivationPayload, _) = self
            .open_envelope(
                tx,
                EnvelopeScope::RecoveryActivation,
                &application,
                &request.encrypted,
                None,
            )
            .await?;

        if payload.puk.len() != PUK_LENGTH || !payload.puk.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ServiceError::InvalidRequest("malformed PUK".to_string()));
        }

        // Activation before code, the order every other path takes
        let recovery_code_id = self
            .recovery_code_id_by_value(&application, &payload.recovery_code)
            .await?;
        let unlocked: Option<RecoveryCode> = self.storage.get(CF_RECOVERY_CODES, &recovery_code_id).await?;
        let previous_activation = unlocked.ok_or(ServiceError::RecoveryCodeNotFound)?.activation_id;
        let mut previous = match previous_activation {
            Some(previous_id) => Some(
                self.locker
                    .lock_for_update(tx, previous_id)
                    .await
                    .ok_or_else(|| ServiceError::Unknown(format!("unable to lock activation {}", previous_id)))?,
            ),
            None => None,
        };

        let mut code = self
            .locker
            .lock_recovery_code(tx, recovery_code_id)
            .await
            .ok_or(ServiceError::RecoveryCodeNotFound)?;
        if code.activation_id != previous_activation {
            return Err(ServiceError::Unknown(format!(
                "recovery code {} changed while locking",
                recovery_code_id
            )));
        }
        if code.status != RecoveryCodeStatus::Active {
            return Err(ServiceError::RecoveryCodeIncorrectState { status: code.status });
        }
        let Some(position) = code
            .puks
            .iter()
            .position(|p| p.status == RecoveryPukStatus::Valid)
        else {
            return Err(ServiceError::RecoveryCodeIncorrectState { status: code.status });
        };
        let puk_index = code.puks[position].index;

        if !self.puk_matches(&application, &code, &code.puks[position], &payload.puk)? {
            for used in code.puks.iter().filter(|p| p.status == RecoveryPukStatus::Used) {
                if self.puk_matches(&application, &code, used, &payload.puk)? {
                    warn!("Used PUK {} presented for code {}", used.index, mask_code(&code.code));
                    return Err(ServiceError::RecoveryCodeIncorrectState { status: code.status });
                }
            }
            return Err(self.record_puk_failure(tx, &mut code, position)?);
        }

        let now = current_timestamp();
        code.puks[position].status = RecoveryPukStatus::Used;
        code.puks[position].last_changed_at = now;
        code.failed_attempts = 0;
        let user_id = code.user_id.clone();
        self.save_recovery_code(tx, &mut code)?;
        info!("PUK {} of recovery code {} used", puk_index, mask_code(&code.code));

        // Everything below runs past the consumed PUK
        if let Some(previous) = previous.as_mut() {
            if previous.status != ActivationStatus::Removed {
                previous.status = ActivationStatus::Removed;
                self.save_activation(tx, previous, Some(HistoryNote::reason("RECOVERY")))
                    .or_rollback()?;
                info!("Activation {} removed by recovery", previous.activation_id);
            }
        }

        let mut activation = self
            .build_activation(
                &application,
                ActivationParams {
                    user_id,
                    max_failed_attempts: request.max_failed_attempts,
                    ..Default::default()
                },
            )
            .await
            .or_rollback()?;
        let recovery = self
            .key_exchange(tx, &application, &mut activation, &payload.key_exchange)
            .await
            .or_rollback()?;

        info!(
            "Activation {} created from recovery code {}",
            activation.activation_id,
            mask_code(&code.code)
        );
        self.key_exchange_response(&activation, recovery, &session)
    }

    pub(crate) async fn lookup_recovery_codes_internal(
        &self,
        filter: LookupRecoveryCodesFilter,
    ) -> Result<Vec<RecoveryCodeView>> {
        if filter.user_id.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("user ID must not be empty".to_string()));
        }

        let mut views: Vec<RecoveryCodeView> = self
            .recovery_codes_of_user(&filter.user_id)
            .await?
            .iter()
            .filter(|code| filter.activation_id.is_none() || code.activation_id == filter.activation_id)
            .filter(|code| {
                filter
                    .application_id
                    .as_deref()
                    .map_or(true, |app| app == code.application_id)
            })
            .filter(|code| filter.recovery_code_status.map_or(true, |status| status == code.status))
            .map(RecoveryCodeView::from)
            .filter_map(|mut view| match filter.puk_status {
                Some(status) => {
                    view.puks.retain(|p| p.status == status);
                    (!view.puks.is_empty()).then_some(view)
                }
                None => Some(view),
            })
            .collect();

        views.sort_by(|a, b| a.recovery_code_id.cmp(&b.recovery_code_id));
        Ok(views)
    }

    pub(crate) async fn revoke_recovery_codes_internal(
        &self,
        tx: &mut Transaction,
        recovery_code_ids: Vec<Uuid>,
    ) -> Result<usize> {
        let mut revoked = 0;
        for id in recovery_code_ids {
            let Some(mut code) = self.locker.lock_recovery_code(tx, id).await else {
                warn!("Recovery code {} not found for revocation", id);
                continue;
            };
            if revoke(&mut code) {
                self.save_recovery_code(tx, &mut code)?;
                revoked += 1;
            }
        }

        info!("Revoked {} recovery codes", revoked);
        Ok(revoked)
    }

    /// Recovery code handed out with a new activation, if recovery is enabled
    ///
    /// Nothing is staged; the PUK hash is encrypted here.
    pub(crate) async fn issue_activation_recovery_code(
        &self,
        application: &Application,
        activation: &Activation,
    ) -> Result<Option<(RecoveryCode, ActivationRecovery)>> {
        let config = self.recovery_config(&application.application_id).await?;
        if !config.activation_recovery_enabled {
            return Ok(None);
        }

        let mut recovery_code = None;
        for _ in 0..self.config.generate_recovery_code_iterations.max(1) {
            let candidate = generate_activation_code()?;
            let taken = self
                .storage
                .exists(
                    CF_RECOVERY_CODES_BY_CODE,
                    &(application.application_id.as_str(), candidate.as_str()),
                )
                .await?;
            if !taken {
                recovery_code = Some(candidate);
                break;
            }
        }
        let recovery_code = recovery_code.ok_or(ServiceError::UnableToGenerateRecoveryCode)?;

        let puk = random_puk()?;
        let hash = hash_secret(puk.as_bytes())?;
        let stored = self.converters.recovery_puk.to_storage(
            &hash,
            PukContext {
                application_record_id: application.record_id,
                user_id: &activation.user_id,
                recovery_code: &recovery_code,
                puk_index: 1,
            },
        )?;

        let now = current_timestamp();
        let status = if activation.status == ActivationStatus::Active {
            RecoveryCodeStatus::Active
        } else {
            RecoveryCodeStatus::Created
        };
        let code = RecoveryCode {
            recovery_code_id: Uuid::new_v4(),
            code: recovery_code.clone(),
            application_id: application.application_id.clone(),
            user_id: activation.user_id.clone(),
            activation_id: Some(activation.activation_id),
            status,
            failed_attempts: 0,
            max_failed_attempts: self.config.recovery_max_failed_attempts,
            puks: vec![RecoveryPuk {
                index: 1,
                hash: stored,
                status: RecoveryPukStatus::Valid,
                last_changed_at: now,
            }],
            created_at: now,
            last_changed_at: now,
        };

        Ok(Some((code, ActivationRecovery { recovery_code, puk })))
    }

    /// Activate the `CREATED` codes issued for a committed activation
    pub(crate) async fn activate_recovery_codes(&self, tx: &mut Transaction, activation: &Activation) -> Result<()> {
        for code in self.bound_recovery_codes(activation).await? {
            if code.status != RecoveryCodeStatus::Created {
                continue;
            }
            let mut code = self.lock_bound_code(tx, code.recovery_code_id).await?;
            code.status = RecoveryCodeStatus::Active;
            self.save_recovery_code(tx, &mut code)?;
        }
        Ok(())
    }

    /// Revoke the live codes issued for an activation
    pub(crate) async fn revoke_activation_recovery_codes(
        &self,
        tx: &mut Transaction,
        activation: &Activation,
    ) -> Result<()> {
        for code in self.bound_recovery_codes(activation).await? {
            let mut code = self.lock_bound_code(tx, code.recovery_code_id).await?;
            if revoke(&mut code) {
                self.save_recovery_code(tx, &mut code)?;
            }
        }
        Ok(())
    }

    /// Lock a code already known to exist; failing to do so aborts the cascade
    async fn lock_bound_code(&self, tx: &mut Transaction, recovery_code_id: Uuid) -> Result<RecoveryCode> {
        self.locker
            .lock_recovery_code(tx, recovery_code_id)
            .await
            .ok_or_else(|| ServiceError::Unknown(format!("unable to lock recovery code {}", recovery_code_id)))
    }

    async fn bound_recovery_codes(&self, activation: &Activation) -> Result<Vec<RecoveryCode>> {
        Ok(self
            .recovery_codes_of_user(&activation.user_id)
            .await?
            .into_iter()
            .filter(|code| code.activation_id == Some(activation.activation_id))
            .collect())
    }

    async fn recovery_config(&self, application_id: &str) -> Result<RecoveryConfig> {
        let config: Option<RecoveryConfig> = self
            .storage
            .get(CF_RECOVERY_CONFIGS, &application_id.to_string())
            .await?;
        Ok(config.unwrap_or_else(|| RecoveryConfig {
            application_id: application_id.to_string(),
            ..Default::default()
        }))
    }

    async fn recovery_code_id_by_value(&self, application: &Application, recovery_code: &str) -> Result<Uuid> {
        self.storage
            .get(
                CF_RECOVERY_CODES_BY_CODE,
                &(application.application_id.as_str(), recovery_code),
            )
            .await?
            .ok_or(ServiceError::RecoveryCodeNotFound)
    }

    fn puk_matches(
        &self,
        application: &Application,
        code: &RecoveryCode,
        puk: &RecoveryPuk,
        candidate: &str,
    ) -> Result<bool> {
        let hash = self.converters.recovery_puk.from_storage(
            &puk.hash,
            PukContext {
                application_record_id: application.record_id,
                user_id: &code.user_id,
                recovery_code: &code.code,
                puk_index: puk.index,
            },
        )?;
        Ok(verify_secret(candidate.as_bytes(), &hash)?)
    }

    /// Count a wrong PUK; blocks the code at the maximum
    ///
    /// Returns the error to hand back once the failure is staged.
    fn record_puk_failure(&self, tx: &mut Transaction, code: &mut RecoveryCode, position: usize) -> Result<ServiceError> {
        code.failed_attempts = code.failed_attempts.saturating_add(1);
        let blocked = code.failed_attempts >= code.max_failed_attempts;
        if blocked {
            code.status = RecoveryCodeStatus::Blocked;
            code.puks[position].status = RecoveryPukStatus::Invalid;
            code.puks[position].last_changed_at = current_timestamp();
        }
        self.save_recovery_code(tx, code)?;

        if blocked {
            warn!("Recovery code {} blocked after {} failed PUKs", mask_code(&code.code), code.failed_attempts);
        } else {
            warn!(
                "Wrong PUK for recovery code {}, {} attempts left",
                mask_code(&code.code),
                code.max_failed_attempts - code.failed_attempts
            );
        }

        Ok(ServiceError::InvalidRecoveryCode {
            current_puk_index: (!blocked).then_some(code.puks[position].index),
        })
    }
}

/// Revoke a live code and invalidate its usable PUKs; `false` when already revoked
fn revoke(code: &mut RecoveryCode) -> bool {
    if code.status == RecoveryCodeStatus::Revoked {
        return false;
    }

    let now = current_timestamp();
    code.status = RecoveryCodeStatus::Revoked;
    for puk in code.puks.iter_mut().filter(|p| p.status == RecoveryPukStatus::Valid) {
        puk.status = RecoveryPukStatus::Invalid;
        puk.last_changed_at = now;
    }
    true
}

/// Random decimal PUK for a code issued with an activation
fn random_puk() -> Result<String> {
    let value = u64::from_be_bytes(random_bytes::<8>()?) % 10u64.pow(PUK_LENGTH as u32);
    Ok(format!("{:0width$}", value, width = PUK_LENGTH))
}
