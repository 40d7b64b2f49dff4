//! Activation lifecycle operations.

use crate::{
    envelope::{seal_json, EnvelopeScope},
    errors::*,
    messages::*,
    traits::AuditSink,
    transaction::RollbackExt,
    types::*,
};
use std::collections::BTreeSet;
use tracing::{info, warn};
use uuid::Uuid;
use vouch_crypto::{
    constant_time_eq, current_timestamp, generate_activation_code, init_ctr_data, normalize_public_key,
    validate_code, EciesSession, KeyPair,
};
use vouch_storage::{
    Storage, Transaction, CF_ACTIVATIONS, CF_ACTIVATIONS_BY_CODE, CF_ACTIVATIONS_BY_USER, CF_ACTIVATION_HISTORY,
};

use super::{HistoryNote, VouchService};

/// Blocked reason used when the caller gives none
pub const DEFAULT_BLOCKED_REASON: &str = "NOT_SPECIFIED";

/// Acting identity recorded when the caller gives none
pub const SELF_ACTOR: &str = "self";

const MAX_FLAG_LENGTH: usize = 255;

/// Settings of a new activation
#[derive(Debug, Clone, Default)]
pub(crate) struct ActivationParams {
    pub user_id: String,
    pub max_failed_attempts: Option<u32>,
    pub expires_at: Option<u64>,
    pub commit_phase: CommitPhase,
    pub otp_validation: OtpValidation,
    pub otp: Option<String>,
    pub flags: BTreeSet<String>,
}

impl ActivationParams {
    fn validate(&self, now: u64) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("user ID must not be empty".to_string()));
        }
        if self.max_failed_attempts == Some(0) {
            return Err(ServiceError::InvalidRequest(
                "max failed attempts must be positive".to_string(),
            ));
        }
        if matches!(self.expires_at, Some(expires_at) if expires_at <= now) {
            return Err(ServiceError::InvalidRequest("expiry is in the past".to_string()));
        }

        let otp_present = self.otp.as_deref().is_some_and(|otp| !otp.is_empty());
        match (self.otp_validation, otp_present) {
            (OtpValidation::None, true) => {
                return Err(ServiceError::InvalidRequest(
                    "OTP given without OTP validation".to_string(),
                ))
            }
            (OtpValidation::OnCommit | OtpValidation::OnKeyExchange, false) => {
                return Err(ServiceError::InvalidRequest("OTP validation requires an OTP".to_string()))
            }
            _ => {}
        }
        if self.commit_phase == CommitPhase::OnKeyExchange && self.otp_validation == OtpValidation::OnCommit {
            return Err(ServiceError::InvalidRequest(
                "OTP cannot be checked on commit when the activation commits on key exchange".to_string(),
            ));
        }
        Ok(())
    }
}

impl<S, A> VouchService<S, A>
where
    S: Storage + 'static,
    A: AuditSink + 'static,
{
    pub(crate) async fn init_activation_internal(
        &self,
        tx: &mut Transaction,
        request: InitActivationRequest,
    ) -> Result<InitActivationResponse> {
        let application = self.application_by_id(&request.application_id).await?;
        let mut activation = self
            .build_activation(
                &application,
                ActivationParams {
                    user_id: request.user_id,
                    max_failed_attempts: request.max_failed_attempts,
                    expires_at: request.expires_at,
                    commit_phase: request.commit_phase,
                    otp_validation: request.otp_validation,
                    otp: request.otp,
                    flags: request.flags,
                },
            )
            .await?;

        let activation_code = activation
            .activation_code
            .clone()
            .ok_or_else(|| ServiceError::Unknown("activation built without a code".to_string()))?;
        let activation_signature =
            KeyPair::from_private_bytes(&application.master_private_key)?.sign(activation_code.as_bytes());

        self.save_activation(tx, &mut activation, Some(HistoryNote::default()))?;

        info!(
            "Activation initialized: {} for user {}",
            activation.activation_id, activation.user_id
        );
        Ok(InitActivationResponse {
            activation_id: activation.activation_id,
            activation_code,
            activation_signature,
            user_id: activation.user_id,
            application_id: activation.application_id,
        })
    }

    pub(crate) async fn prepare_activation_internal(
        &self,
        tx: &mut Transaction,
        request: PrepareActivationRequest,
    ) -> Result<ActivationKeyExchangeResponse> {
        if !validate_code(&request.activation_code) {
            return Err(ServiceError::InvalidRequest("malformed activation code".to_string()));
        }

        let application = self
            .application_by_key(&request.encrypted.application_key)
            .await?;
        let (payload, session): (KeyExchangePayload, _) = self
            .open_envelope(
                tx,
                EnvelopeScope::ActivationKeyExchange,
                &application,
                &request.encrypted,
                None,
            )
            .await?;

        let activation_id: Uuid = self
            .storage
            .get(
                CF_ACTIVATIONS_BY_CODE,
                &(application.application_id.as_str(), request.activation_code.as_str()),
            )
            .await?
            .ok_or_else(|| ServiceError::ActivationNotFound(request.activation_code.clone()))?;

        let mut activation = self.lock_activation(tx, activation_id).await?;
        let recovery = self
            .key_exchange(tx, &application, &mut activation, &payload)
            .await?;

        self.key_exchange_response(&activation, recovery, &session)
    }

    pub(crate) async fn create_activation_internal(
        &self,
        tx: &mut Transaction,
        request: CreateActivationRequest,
    ) -> Result<ActivationKeyExchangeResponse> {
        let application = self
            .application_by_key(&request.encrypted.application_key)
            .await?;
        let (payload, session): (KeyExchangePayload, _) = self
            .open_envelope(
                tx,
                EnvelopeScope::ActivationKeyExchange,
                &application,
                &request.encrypted,
                None,
            )
            .await?;

        let mut activation = self
            .build_activation(
                &application,
                ActivationParams {
                    user_id: request.user_id,
                    max_failed_attempts: request.max_failed_attempts,
                    expires_at: request.expires_at,
                    otp_validation: request.otp_validation,
                    otp: request.otp,
                    ..Default::default()
                },
            )
            .await?;

        // The record is new: any key exchange failure, OTP included, leaves nothing behind
        let recovery = self
            .key_exchange(tx, &application, &mut activation, &payload)
            .await
            .or_rollback()?;

        self.key_exchange_response(&activation, recovery, &session)
    }

    pub(crate) async fn commit_activation_internal(
        &self,
        tx: &mut Transaction,
        activation_id: Uuid,
        external_user_id: Option<String>,
        otp: Option<String>,
    ) -> Result<ActivationStatusResponse> {
        let mut activation = self.lock_activation(tx, activation_id).await?;
        self.expire_if_pending(tx, &mut activation)?;

        if activation.status != ActivationStatus::PendingCommit {
            return Err(incorrect_state(&activation));
        }

        self.check_otp(tx, &mut activation, OtpValidation::OnCommit, otp.as_deref())?;

        activation.status = ActivationStatus::Active;
        self.save_activation(
            tx,
            &mut activation,
            Some(HistoryNote::by(None, external_user_id)),
        )?;

        // Past the staged commit
        self.activate_recovery_codes(tx, &activation)
            .await
            .or_rollback()?;

        info!("Activation committed: {}", activation_id);
        Ok((&activation).into())
    }

    /// Status of an activation; an expired pending activation is removed and reported as such
    pub(crate) async fn get_activation_status_internal(
        &self,
        tx: &mut Transaction,
        activation_id: Uuid,
    ) -> Result<ActivationStatusResponse> {
        let mut activation = self.lock_activation(tx, activation_id).await?;

        match self.expire_if_pending(tx, &mut activation) {
            Ok(()) | Err(ServiceError::ActivationExpired(_)) => Ok((&activation).into()),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn list_activations_internal(
        &self,
        user_id: String,
        application_id: Option<String>,
    ) -> Result<Vec<ActivationStatusResponse>> {
        let ids: Vec<(Vec<u8>, Uuid)> = self
            .storage
            .get_by_prefix(CF_ACTIVATIONS_BY_USER, &user_id)
            .await?;

        let mut activations = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            let activation: Option<Activation> = self.storage.get(CF_ACTIVATIONS, &id).await?;
            if let Some(activation) = activation {
                let wanted = application_id
                    .as_deref()
                    .map_or(true, |app| app == activation.application_id);
                if wanted {
                    activations.push(ActivationStatusResponse::from(&activation));
                }
            }
        }

        activations.sort_by_key(|a| a.created_at);
        Ok(activations)
    }

    pub(crate) async fn activation_history_internal(
        &self,
        activation_id: Uuid,
    ) -> Result<Vec<ActivationHistoryEntry>> {
        if !self.storage.exists(CF_ACTIVATIONS, &activation_id).await? {
            return Err(ServiceError::ActivationNotFound(activation_id.to_string()));
        }

        let mut entries: Vec<ActivationHistoryEntry> = self
            .storage
            .get_by_prefix(CF_ACTIVATION_HISTORY, &activation_id)
            .await?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect();
        entries.sort_by_key(|e: &ActivationHistoryEntry| e.sequence);
        Ok(entries)
    }

    pub(crate) async fn block_activation_internal(
        &self,
        tx: &mut Transaction,
        activation_id: Uuid,
        reason: Option<String>,
        external_user_id: Option<String>,
    ) -> Result<ActivationStatusResponse> {
        let mut activation = self.lock_activation(tx, activation_id).await?;

        match activation.status {
            ActivationStatus::Blocked => return Ok((&activation).into()),
            ActivationStatus::Active => {}
            _ => return Err(incorrect_state(&activation)),
        }

        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BLOCKED_REASON.to_string());
        let actor = external_user_id.unwrap_or_else(|| SELF_ACTOR.to_string());

        activation.status = ActivationStatus::Blocked;
        activation.blocked_reason = Some(reason.clone());
        self.save_activation(
            tx,
            &mut activation,
            Some(HistoryNote::by(Some(reason), Some(actor))),
        )?;

        info!("Activation blocked: {}", activation_id);
        Ok((&activation).into())
    }

    pub(crate) async fn unblock_activation_internal(
        &self,
        tx: &mut Transaction,
        activation_id: Uuid,
        external_user_id: Option<String>,
    ) -> Result<ActivationStatusResponse> {
        let mut activation = self.lock_activation(tx, activation_id).await?;

        match activation.status {
            ActivationStatus::Active => return Ok((&activation).into()),
            ActivationStatus::Blocked => {}
            _ => return Err(incorrect_state(&activation)),
        }

        let actor = external_user_id.unwrap_or_else(|| SELF_ACTOR.to_string());
        activation.status = ActivationStatus::Active;
        activation.blocked_reason = None;
        activation.failed_attempts = 0;
        self.save_activation(tx, &mut activation, Some(HistoryNote::by(None, Some(actor))))?;

        info!("Activation unblocked: {}", activation_id);
        Ok((&activation).into())
    }

    pub(crate) async fn remove_activation_internal(
        &self,
        tx: &mut Transaction,
        activation_id: Uuid,
        external_user_id: Option<String>,
        revoke_recovery_codes: bool,
    ) -> Result<ActivationStatusResponse> {
        let mut activation = self.lock_activation(tx, activation_id).await?;

        if activation.status != ActivationStatus::Removed {
            activation.status = ActivationStatus::Removed;
            self.save_activation(
                tx,
                &mut activation,
                Some(HistoryNote::by(None, external_user_id)),
            )?;
            info!("Activation removed: {}", activation_id);
        }

        if revoke_recovery_codes {
            // Past the staged removal
            self.revoke_activation_recovery_codes(tx, &activation)
                .await
                .or_rollback()?;
        }

        Ok((&activation).into())
    }

    pub(crate) async fn update_activation_flags_internal(
        &self,
        tx: &mut Transaction,
        activation_id: Uuid,
        flags: Vec<String>,
        add: bool,
    ) -> Result<BTreeSet<String>> {
        if let Some(bad) = flags
            .iter()
            .find(|f| f.trim().is_empty() || f.len() > MAX_FLAG_LENGTH)
        {
            return Err(ServiceError::InvalidRequest(format!("invalid activation flag: {:?}", bad)));
        }

        let mut activation = self.lock_activation(tx, activation_id).await?;
        if activation.status == ActivationStatus::Removed {
            return Err(incorrect_state(&activation));
        }

        for flag in flags {
            if add {
                activation.flags.insert(flag);
            } else {
                activation.flags.remove(&flag);
            }
        }
        self.save_activation(tx, &mut activation, None)?;

        Ok(activation.flags)
    }

    /// Build a `CREATED` activation without staging it
    ///
    /// The server private key is encrypted here, before any write.
    pub(crate) async fn build_activation(
        &self,
        application: &Application,
        params: ActivationParams,
    ) -> Result<Activation> {
        let now = current_timestamp();
        params.validate(now)?;

        let activation_id = Uuid::new_v4();
        let activation_code = self
            .unique_activation_code(&application.application_id)
            .await?;

        let server_key = KeyPair::generate();
        let server_private_key = self.converters.server_private_key.to_storage(
            &server_key.private_key_bytes(),
            &params.user_id,
            activation_id,
        )?;

        Ok(Activation {
            activation_id,
            activation_code: Some(activation_code),
            user_id: params.user_id,
            application_id: application.application_id.clone(),
            status: ActivationStatus::Created,
            blocked_reason: None,
            server_public_key: server_key.public_key_bytes(),
            server_private_key,
            device_public_key: None,
            activation_name: None,
            platform: None,
            device_info: None,
            counter: 0,
            ctr_data: None,
            failed_attempts: 0,
            max_failed_attempts: params
                .max_failed_attempts
                .unwrap_or(self.config.max_failed_attempts),
            flags: params.flags,
            commit_phase: params.commit_phase,
            otp_validation: params.otp_validation,
            otp: params.otp.filter(|otp| !otp.is_empty()),
            protocol: ProtocolVersion::V3,
            created_at: now,
            last_changed_at: now,
            expires_at: params
                .expires_at
                .unwrap_or_else(|| now + self.config.activation_validity.as_secs()),
            history_seq: 0,
        })
    }

    async fn unique_activation_code(&self, application_id: &str) -> Result<String> {
        for _ in 0..self.config.generate_activation_code_iterations.max(1) {
            let code = generate_activation_code()?;
            let taken = self
                .storage
                .exists(CF_ACTIVATIONS_BY_CODE, &(application_id, code.as_str()))
                .await?;
            if !taken {
                return Ok(code);
            }
        }

        warn!("No unused activation code found for application {}", application_id);
        Err(ServiceError::UnableToGenerateActivationCode)
    }

    /// Bind the device key to a `CREATED` activation and stage the result
    ///
    /// Returns the recovery code issued with the activation, if recovery is enabled.
    pub(crate) async fn key_exchange(
        &self,
        tx: &mut Transaction,
        application: &Application,
        activation: &mut Activation,
        payload: &KeyExchangePayload,
    ) -> Result<Option<ActivationRecovery>> {
        if activation.status != ActivationStatus::Created {
            return Err(incorrect_state(activation));
        }
        self.expire_if_pending(tx, activation)?;

        let device_public_key = normalize_public_key(&payload.device_public_key)?;
        let (protocol, ctr_data) = match payload.protocol_version {
            None | Some(3) => (ProtocolVersion::V3, Some(init_ctr_data()?.to_vec())),
            Some(2) => (ProtocolVersion::V2, None),
            Some(other) => {
                return Err(ServiceError::InvalidRequest(format!(
                    "unsupported protocol version {}",
                    other
                )))
            }
        };

        self.check_otp(
            tx,
            activation,
            OtpValidation::OnKeyExchange,
            payload.activation_otp.as_deref(),
        )?;

        activation.device_public_key = Some(device_public_key);
        activation.activation_name = payload.activation_name.clone();
        activation.platform = payload.platform.clone();
        activation.device_info = payload.device_info.clone();
        activation.protocol = protocol;
        activation.ctr_data = ctr_data;
        activation.counter = 0;
        activation.status = match activation.commit_phase {
            CommitPhase::OnKeyExchange => ActivationStatus::Active,
            CommitPhase::OnCommit => ActivationStatus::PendingCommit,
        };

        let recovery = self
            .issue_activation_recovery_code(application, activation)
            .await?;

        self.save_activation(tx, activation, Some(HistoryNote::default()))?;
        let recovery = match recovery {
            Some((mut code, delivered)) => {
                self.save_recovery_code(tx, &mut code)?;
                Some(delivered)
            }
            None => None,
        };

        info!(
            "Key exchange completed for activation {}, status {:?}",
            activation.activation_id, activation.status
        );
        Ok(recovery)
    }

    pub(crate) fn key_exchange_response(
        &self,
        activation: &Activation,
        activation_recovery: Option<ActivationRecovery>,
        session: &EciesSession,
    ) -> Result<ActivationKeyExchangeResponse> {
        let payload = KeyExchangeResponsePayload {
            activation_id: activation.activation_id,
            server_public_key: activation.server_public_key.clone(),
            ctr_data: activation.ctr_data.clone().unwrap_or_default(),
            activation_recovery,
        };

        // Past the staged key exchange
        let encrypted_response = seal_json(session, &payload).or_rollback()?;

        Ok(ActivationKeyExchangeResponse {
            activation_id: activation.activation_id,
            user_id: activation.user_id.clone(),
            application_id: activation.application_id.clone(),
            activation_status: activation.status,
            encrypted_response,
        })
    }

    /// Check the activation OTP for one stage
    ///
    /// A mismatch is staged (counter, possibly forced removal) before the error is returned.
    fn check_otp(
        &self,
        tx: &mut Transaction,
        activation: &mut Activation,
        stage: OtpValidation,
        provided: Option<&str>,
    ) -> Result<()> {
        if activation.otp_validation != stage {
            if provided.is_some() {
                warn!(
                    "OTP sent at a stage that does not check it, activation {}",
                    activation.activation_id
                );
                return Err(ServiceError::InvalidActivationOtp {
                    remaining_attempts: activation.remaining_attempts(),
                });
            }
            return Ok(());
        }

        let matches = match (activation.otp.as_deref(), provided) {
            (Some(expected), Some(given)) => constant_time_eq(expected.as_bytes(), given.as_bytes()),
            _ => false,
        };
        if matches {
            activation.failed_attempts = 0;
            return Ok(());
        }

        let removed = activation.record_failure();
        let note = removed.then(|| HistoryNote::reason("MAX_FAILED_ATTEMPTS"));
        self.save_activation(tx, activation, note)?;

        warn!(
            "Invalid OTP for activation {}, {} attempts left",
            activation.activation_id,
            activation.remaining_attempts()
        );
        Err(ServiceError::InvalidActivationOtp {
            remaining_attempts: activation.remaining_attempts(),
        })
    }
}

pub(crate) fn incorrect_state(activation: &Activation) -> ServiceError {
    ServiceError::ActivationIncorrectState {
        activation_id: activation.activation_id.to_string(),
        status: activation.status,
    }
}
