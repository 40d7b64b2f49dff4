//! Envelope checks shared by every encrypted operation.

use crate::{
    config::ServiceConfig,
    errors::{Result, ServiceError},
    types::Application,
};
use serde::Serialize;
use vouch_crypto::{
    sha256, CryptographicEnvelope, EciesSession, EncryptedResponse, ENVELOPE_NONCE_SIZE, PUBLIC_KEY_SIZE,
};

/// Operation an envelope belongs to
///
/// The scope is mixed into the key derivation, so an envelope made for one operation cannot be
/// replayed against another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeScope {
    ActivationKeyExchange,
    RecoveryActivation,
    VaultUnlock,
    ConfirmRecoveryCode,
    UpgradeStart,
}

impl EnvelopeScope {
    /// Per-operation shared info
    pub fn shared_info1(self) -> &'static [u8] {
        match self {
            EnvelopeScope::ActivationKeyExchange => b"/vouch/activation/create",
            EnvelopeScope::RecoveryActivation => b"/vouch/recovery/activation",
            EnvelopeScope::VaultUnlock => b"/vouch/vault/unlock",
            EnvelopeScope::ConfirmRecoveryCode => b"/vouch/recovery/confirm",
            EnvelopeScope::UpgradeStart => b"/vouch/upgrade/start",
        }
    }

    /// Encrypted to the application master key rather than an activation's server key
    pub fn is_application_scope(self) -> bool {
        matches!(
            self,
            EnvelopeScope::ActivationKeyExchange | EnvelopeScope::RecoveryActivation
        )
    }
}

/// Shared info bound into every MAC for an application
pub fn shared_info2(application: &Application) -> [u8; 32] {
    sha256(application.application_secret.as_bytes())
}

/// Reject envelopes with a wrong shape or outside the accepted time window
pub fn validate_envelope(envelope: &CryptographicEnvelope, config: &ServiceConfig, now_ms: u64) -> Result<()> {
    if envelope.nonce.len() != ENVELOPE_NONCE_SIZE {
        return Err(ServiceError::InvalidRequest(format!(
            "envelope nonce must be {} bytes",
            ENVELOPE_NONCE_SIZE
        )));
    }
    if envelope.ephemeral_public_key.len() != PUBLIC_KEY_SIZE {
        return Err(ServiceError::InvalidRequest(
            "ephemeral key must be a compressed P-256 point".to_string(),
        ));
    }
    if envelope.encrypted_data.is_empty() || envelope.mac.is_empty() {
        return Err(ServiceError::InvalidRequest("envelope is empty".to_string()));
    }

    if envelope.timestamp.saturating_add(config.request_timestamp_validity_ms) < now_ms {
        return Err(ServiceError::InvalidRequest("envelope has expired".to_string()));
    }
    if envelope.timestamp > now_ms.saturating_add(config.request_timestamp_tolerance_ms) {
        return Err(ServiceError::InvalidRequest(
            "envelope timestamp is in the future".to_string(),
        ));
    }

    Ok(())
}

/// Replay guard key of an envelope
pub fn nonce_key(envelope: &CryptographicEnvelope) -> (Vec<u8>, Vec<u8>) {
    (envelope.ephemeral_public_key.clone(), envelope.nonce.clone())
}

/// Encrypt a JSON response payload inside an open session
pub fn seal_json<T: Serialize>(session: &EciesSession, payload: &T) -> Result<EncryptedResponse> {
    let json = serde_json::to_vec(payload).map_err(|e| ServiceError::Unknown(e.to_string()))?;
    Ok(session.seal_response(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const NOW: u64 = 1_700_000_000_000;

    fn envelope(nonce_len: usize, key_len: usize, timestamp: u64) -> CryptographicEnvelope {
        CryptographicEnvelope {
            ephemeral_public_key: vec![2u8; key_len],
            encrypted_data: vec![1u8; 16],
            mac: vec![0u8; 32],
            nonce: vec![0u8; nonce_len],
            timestamp,
        }
    }

    #[rstest]
    #[case(envelope(16, 33, NOW), true)]
    #[case(envelope(12, 33, NOW), false)]
    #[case(envelope(16, 65, NOW), false)]
    #[case(envelope(16, 33, NOW - 7_200_000), true)]
    #[case(envelope(16, 33, NOW - 7_200_001), false)]
    #[case(envelope(16, 33, NOW + 60_000), true)]
    #[case(envelope(16, 33, NOW + 60_001), false)]
    fn test_envelope_window(#[case] envelope: CryptographicEnvelope, #[case] accepted: bool) {
        let result = validate_envelope(&envelope, &ServiceConfig::default(), NOW);
        assert_eq!(result.is_ok(), accepted);
        if let Err(err) = result {
            assert_eq!(err.code(), "INVALID_REQUEST");
        }
    }

    #[test]
    fn test_scopes_are_distinct() {
        let scopes = [
            EnvelopeScope::ActivationKeyExchange,
            EnvelopeScope::RecoveryActivation,
            EnvelopeScope::VaultUnlock,
            EnvelopeScope::ConfirmRecoveryCode,
            EnvelopeScope::UpgradeStart,
        ];
        let infos: std::collections::HashSet<_> = scopes.iter().map(|s| s.shared_info1()).collect();
        assert_eq!(infos.len(), scopes.len());
        assert!(EnvelopeScope::RecoveryActivation.is_application_scope());
        assert!(!EnvelopeScope::VaultUnlock.is_application_scope());
    }
}
