//! Signature verification and offline payloads.

use crate::{
    audit::{SignatureAuditRecord, AUDIT_BIOMETRY_ALLOWED},
    errors::*,
    messages::*,
    signature::{apply_failure, apply_success, counter_mode, offline_allow_list, CounterMode, SignatureCheck},
    traits::AuditSink,
    types::*,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;
use vouch_crypto::{current_timestamp, random_bytes, KeyPair, SignatureType, ONLINE_COMPONENT_LENGTH};
use vouch_storage::{Storage, Transaction, CF_ACTIVATIONS};

use super::{activation::incorrect_state, HistoryNote, VouchService};

/// One verification attempt against a locked activation
pub(crate) struct SignatureAttempt<'a> {
    pub mode: CounterMode,
    /// Allowed types in order; the first one is audited on failure
    pub candidates: &'a [SignatureType],
    pub data: &'a [u8],
    pub signature: &'a str,
    pub component_length: usize,
    /// Extra audit attributes for a failed attempt
    pub failure_attributes: BTreeMap<String, String>,
}

impl<S, A> VouchService<S, A>
where
    S: Storage + 'static,
    A: AuditSink + 'static,
{
    pub(crate) async fn verify_signature_internal(
        &self,
        tx: &mut Transaction,
        request: VerifySignatureRequest,
    ) -> Result<VerifySignatureResponse> {
        let application = self.application_by_key(&request.application_key).await?;
        let mut activation = self.lock_activation(tx, request.activation_id).await?;
        let mode = counter_mode(&activation, request.forced_signature_version);

        if activation.application_id != application.application_id {
            warn!(
                "Signature for activation {} presented with a foreign application key",
                activation.activation_id
            );
            self.audit_rejection(&activation, request.signature_type, mode, "Application mismatch")
                .await;
            return Ok(signature_response(&activation, false, request.signature_type));
        }
        if activation.status != ActivationStatus::Active {
            self.audit_rejection(&activation, request.signature_type, mode, "Activation is not active")
                .await;
            return Ok(signature_response(&activation, false, request.signature_type));
        }

        let candidates = [request.signature_type];
        let matched = self
            .check_signature(
                tx,
                &mut activation,
                SignatureAttempt {
                    mode,
                    candidates: &candidates,
                    data: &request.data,
                    signature: &request.signature,
                    component_length: ONLINE_COMPONENT_LENGTH,
                    failure_attributes: BTreeMap::new(),
                },
            )
            .await?;

        Ok(signature_response(
            &activation,
            matched.is_some(),
            request.signature_type,
        ))
    }

    pub(crate) async fn verify_offline_signature_internal(
        &self,
        tx: &mut Transaction,
        request: VerifyOfflineSignatureRequest,
    ) -> Result<VerifySignatureResponse> {
        let mut activation = self.lock_activation(tx, request.activation_id).await?;
        let mode = counter_mode(&activation, None);
        let candidates = offline_allow_list(request.allow_biometry);
        let audited_type = candidates[0];

        if activation.status != ActivationStatus::Active {
            self.audit_rejection(&activation, audited_type, mode, "Activation is not active")
                .await;
            return Ok(signature_response(&activation, false, audited_type));
        }

        let mut failure_attributes = BTreeMap::new();
        if request.allow_biometry {
            failure_attributes.insert(AUDIT_BIOMETRY_ALLOWED.to_string(), "TRUE".to_string());
        }

        let matched = self
            .check_signature(
                tx,
                &mut activation,
                SignatureAttempt {
                    mode,
                    candidates: &candidates,
                    data: &request.data,
                    signature: &request.signature,
                    component_length: self.config.offline_component_length(),
                    failure_attributes,
                },
            )
            .await?;

        Ok(signature_response(
            &activation,
            matched.is_some(),
            matched.unwrap_or(audited_type),
        ))
    }

    pub(crate) async fn create_personalized_offline_payload_internal(
        &self,
        activation_id: Uuid,
        data: String,
    ) -> Result<OfflinePayload> {
        let activation: Activation = self
            .storage
            .get(CF_ACTIVATIONS, &activation_id)
            .await?
            .ok_or_else(|| ServiceError::ActivationNotFound(activation_id.to_string()))?;
        if activation.status != ActivationStatus::Active {
            return Err(incorrect_state(&activation));
        }

        let server_key = self.server_key_pair(&activation)?;
        offline_payload(&server_key, data)
    }

    pub(crate) async fn create_non_personalized_offline_payload_internal(
        &self,
        application_id: String,
        data: String,
    ) -> Result<OfflinePayload> {
        let application = self.application_by_id(&application_id).await?;
        let master_key = KeyPair::from_private_bytes(&application.master_private_key)?;
        offline_payload(&master_key, data)
    }

    /// Verify a signature and stage the counter movement
    ///
    /// Keys are derived before anything is staged. Returns the matched type, or `None` after
    /// the failure has been counted.
    pub(crate) async fn check_signature(
        &self,
        tx: &mut Transaction,
        activation: &mut Activation,
        attempt: SignatureAttempt<'_>,
    ) -> Result<Option<SignatureType>> {
        let keys = self.activation_keys(activation)?;
        let check = SignatureCheck {
            keys: &keys,
            mode: attempt.mode,
            candidates: attempt.candidates,
            data: attempt.data,
            signature: attempt.signature,
            component_length: attempt.component_length,
            lookahead: self.config.signature_validation_lookahead,
        };

        if let Some(matched) = check.find(activation)? {
            apply_success(activation, attempt.mode, &matched);
            self.save_activation(tx, activation, None)?;
            self.audit(audit_record(
                activation,
                matched.signature_type,
                attempt.mode,
                true,
                "Signature valid",
                BTreeMap::new(),
            ))
            .await;
            return Ok(Some(matched.signature_type));
        }

        let audited_type = attempt
            .candidates
            .first()
            .copied()
            .unwrap_or(SignatureType::PossessionKnowledge);
        self.record_signature_failure(
            tx,
            activation,
            attempt.mode,
            audited_type,
            "Signature invalid",
            attempt.failure_attributes,
        )
        .await?;
        Ok(None)
    }

    /// Count a failed attempt, stage it and audit it
    pub(crate) async fn record_signature_failure(
        &self,
        tx: &mut Transaction,
        activation: &mut Activation,
        mode: CounterMode,
        signature_type: SignatureType,
        note: &str,
        attributes: BTreeMap<String, String>,
    ) -> Result<()> {
        let removed = apply_failure(activation, mode);
        let history = removed.then(|| HistoryNote::reason("MAX_FAILED_ATTEMPTS"));
        self.save_activation(tx, activation, history)?;

        if removed {
            warn!(
                "Activation {} removed after {} failed signatures",
                activation.activation_id, activation.failed_attempts
            );
        } else {
            warn!(
                "Invalid {} signature for activation {}, {} attempts left",
                signature_type,
                activation.activation_id,
                activation.remaining_attempts()
            );
        }

        self.audit(audit_record(activation, signature_type, mode, false, note, attributes))
            .await;
        Ok(())
    }

    pub(crate) async fn audit_rejection(
        &self,
        activation: &Activation,
        signature_type: SignatureType,
        mode: CounterMode,
        note: &str,
    ) {
        self.audit(audit_record(
            activation,
            signature_type,
            mode,
            false,
            note,
            BTreeMap::new(),
        ))
        .await;
    }
}

fn audit_record(
    activation: &Activation,
    signature_type: SignatureType,
    mode: CounterMode,
    valid: bool,
    note: &str,
    attributes: BTreeMap<String, String>,
) -> SignatureAuditRecord {
    SignatureAuditRecord {
        activation_id: activation.activation_id,
        user_id: activation.user_id.clone(),
        application_id: activation.application_id.clone(),
        signature_type,
        signature_version: mode.signature_version(),
        valid,
        counter: activation.counter,
        activation_status: activation.status,
        failed_attempts: activation.failed_attempts,
        note: note.to_string(),
        attributes,
        timestamp: current_timestamp(),
    }
}

fn signature_response(
    activation: &Activation,
    signature_valid: bool,
    signature_type: SignatureType,
) -> VerifySignatureResponse {
    VerifySignatureResponse {
        signature_valid,
        activation_id: activation.activation_id,
        activation_status: activation.status,
        blocked_reason: activation.blocked_reason.clone(),
        user_id: activation.user_id.clone(),
        application_id: activation.application_id.clone(),
        remaining_attempts: activation.remaining_attempts(),
        signature_type,
    }
}

/// Sign `data \n nonce` and lay out the offline text
fn offline_payload(key: &KeyPair, data: String) -> Result<OfflinePayload> {
    if data.is_empty() {
        return Err(ServiceError::InvalidRequest("offline data must not be empty".to_string()));
    }

    let nonce = STANDARD.encode(random_bytes::<16>()?);
    let signed = format!("{}\n{}", data, nonce);
    let signature = key.sign(signed.as_bytes());
    let offline_data = format!("{}\n{}", signed, STANDARD.encode(&signature));

    Ok(OfflinePayload {
        data,
        nonce,
        signature,
        offline_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vouch_crypto::verify_ecdsa;

    #[test]
    fn test_offline_payload_layout() {
        let key = KeyPair::generate();
        let payload = offline_payload(&key, "pay 10 EUR".to_string()).unwrap();

        let lines: Vec<&str> = payload.offline_data.split('\n').collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "pay 10 EUR");
        assert_eq!(lines[1], payload.nonce);
        assert_eq!(STANDARD.decode(&payload.nonce).unwrap().len(), 16);

        let signed = format!("{}\n{}", lines[0], lines[1]);
        verify_ecdsa(&key.public_key_bytes(), signed.as_bytes(), &payload.signature).unwrap();
    }

    #[test]
    fn test_offline_payload_rejects_empty_data() {
        let key = KeyPair::generate();
        let err = offline_payload(&key, String::new()).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }
}
