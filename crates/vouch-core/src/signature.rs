//! Signature verification rules.
//!
//! Allow-lists are ordered. The first entry is what the audit trail names when no candidate
//! matched. Single-factor types never unlock the vault, whatever the configuration says.

use crate::{
    config::ServiceConfig,
    errors::{Result, ServiceError},
    types::{Activation, ProtocolVersion},
};
use vouch_crypto::{
    compute_signature, next_ctr_data, numeric_ctr_data, signature_matches, ActivationKeys, SignatureType,
};

/// The only forced signature version honoured
pub const FORCED_SIGNATURE_VERSION: u8 = 3;

/// Types accepted for vault unlock
pub fn vault_unlock_allow_list(config: &ServiceConfig) -> Vec<SignatureType> {
    let mut allowed = vec![SignatureType::PossessionKnowledge];
    if config.vault_unlock_allow_biometry {
        allowed.push(SignatureType::PossessionBiometry);
    }
    allowed
}

/// Types tried for an offline signature, in order
pub fn offline_allow_list(allow_biometry: bool) -> Vec<SignatureType> {
    let mut allowed = vec![SignatureType::PossessionKnowledge];
    if allow_biometry {
        allowed.push(SignatureType::PossessionBiometry);
    }
    allowed
}

/// How counter data is produced for a verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    /// `ctr_data` derived from the numeric counter (protocol 2)
    Numeric,
    /// `ctr_data` chained through SHA-256 (protocol 3)
    HashBased,
}

impl CounterMode {
    /// Signature version this mode corresponds to
    pub fn signature_version(self) -> u8 {
        match self {
            CounterMode::Numeric => 2,
            CounterMode::HashBased => 3,
        }
    }
}

/// Counter mode of an activation
///
/// A V2 activation switches to hash-based counters only when version 3 is forced and the
/// upgrade already produced counter data. Any other forced value is ignored.
pub fn counter_mode(activation: &Activation, forced_signature_version: Option<u8>) -> CounterMode {
    match activation.protocol {
        ProtocolVersion::V3 => CounterMode::HashBased,
        ProtocolVersion::V2 => {
            if forced_signature_version == Some(FORCED_SIGNATURE_VERSION) && activation.ctr_data.is_some() {
                CounterMode::HashBased
            } else {
                CounterMode::Numeric
            }
        }
    }
}

/// A signature that matched within the look-ahead window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMatch {
    pub signature_type: SignatureType,
    /// Positions past the stored counter
    pub offset: u64,
    /// Counter data the signature was made with
    pub ctr_data: Vec<u8>,
}

/// Inputs of one verification walk
pub struct SignatureCheck<'a> {
    pub keys: &'a ActivationKeys,
    pub mode: CounterMode,
    pub candidates: &'a [SignatureType],
    pub data: &'a [u8],
    pub signature: &'a str,
    pub component_length: usize,
    pub lookahead: u64,
}

impl SignatureCheck<'_> {
    /// Walk the look-ahead window for a matching candidate
    pub fn find(&self, activation: &Activation) -> Result<Option<SignatureMatch>> {
        let mut ctr_data = self.start_ctr_data(activation)?;

        for offset in 0..self.lookahead.max(1) {
            if self.mode == CounterMode::Numeric {
                ctr_data = numeric_ctr_data(activation.counter.wrapping_add(offset)).to_vec();
            }

            for candidate in self.candidates {
                let expected = compute_signature(
                    self.keys,
                    *candidate,
                    &ctr_data,
                    self.data,
                    self.component_length,
                )?;
                if signature_matches(&expected, self.signature) {
                    return Ok(Some(SignatureMatch {
                        signature_type: *candidate,
                        offset,
                        ctr_data,
                    }));
                }
            }

            if self.mode == CounterMode::HashBased {
                ctr_data = next_ctr_data(&ctr_data).to_vec();
            }
        }

        Ok(None)
    }

    fn start_ctr_data(&self, activation: &Activation) -> Result<Vec<u8>> {
        match self.mode {
            CounterMode::Numeric => Ok(numeric_ctr_data(activation.counter).to_vec()),
            CounterMode::HashBased => activation
                .ctr_data
                .clone()
                .ok_or_else(|| ServiceError::Unknown("activation has no counter data".to_string())),
        }
    }
}

/// Move the counter past a matched signature and clear the failures
pub fn apply_success(activation: &mut Activation, mode: CounterMode, matched: &SignatureMatch) {
    activation.counter = activation.counter.wrapping_add(matched.offset + 1);
    if mode == CounterMode::HashBased {
        activation.ctr_data = Some(next_ctr_data(&matched.ctr_data).to_vec());
    }
    activation.failed_attempts = 0;
}

/// Advance the counter past a failed attempt and count the failure
///
/// Returns `true` when the activation was removed.
pub fn apply_failure(activation: &mut Activation, mode: CounterMode) -> bool {
    activation.counter = activation.counter.wrapping_add(1);
    if mode == CounterMode::HashBased {
        if let Some(ctr_data) = &activation.ctr_data {
            activation.ctr_data = Some(next_ctr_data(ctr_data).to_vec());
        }
    }
    activation.record_failure()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use rstest::rstest;
    use std::collections::BTreeSet;
    use uuid::Uuid;
    use vouch_crypto::init_ctr_data;

    fn activation(protocol: ProtocolVersion, ctr_data: Option<Vec<u8>>) -> Activation {
        Activation {
            activation_id: Uuid::new_v4(),
            activation_code: None,
            user_id: "u1".to_string(),
            application_id: "a1".to_string(),
            status: ActivationStatus::Active,
            blocked_reason: None,
            server_public_key: vec![],
            server_private_key: EncryptedSecret {
                encryption_mode: EncryptionMode::NoEncryption,
                payload: vec![],
            },
            device_public_key: None,
            activation_name: None,
            platform: None,
            device_info: None,
            counter: 0,
            ctr_data,
            failed_attempts: 0,
            max_failed_attempts: 3,
            flags: BTreeSet::new(),
            commit_phase: CommitPhase::OnCommit,
            otp_validation: OtpValidation::None,
            otp: None,
            protocol,
            created_at: 0,
            last_changed_at: 0,
            expires_at: 0,
            history_seq: 0,
        }
    }

    fn check<'a>(
        keys: &'a ActivationKeys,
        mode: CounterMode,
        candidates: &'a [SignatureType],
        signature: &'a str,
    ) -> SignatureCheck<'a> {
        SignatureCheck {
            keys,
            mode,
            candidates,
            data: b"payment 100 EUR",
            signature,
            component_length: 8,
            lookahead: 5,
        }
    }

    #[test]
    fn test_vault_unlock_never_allows_single_factor() {
        for allow_biometry in [false, true] {
            let config = ServiceConfig {
                vault_unlock_allow_biometry: allow_biometry,
                ..Default::default()
            };
            let allowed = vault_unlock_allow_list(&config);
            assert_eq!(allowed[0], SignatureType::PossessionKnowledge);
            assert!(allowed.iter().all(|t| t.is_multi_factor()));
            assert_eq!(allowed.contains(&SignatureType::PossessionBiometry), allow_biometry);
        }
    }

    #[test]
    fn test_offline_list_order() {
        assert_eq!(offline_allow_list(false), vec![SignatureType::PossessionKnowledge]);
        assert_eq!(
            offline_allow_list(true),
            vec![SignatureType::PossessionKnowledge, SignatureType::PossessionBiometry]
        );
    }

    #[rstest]
    #[case(ProtocolVersion::V3, None, true, CounterMode::HashBased)]
    #[case(ProtocolVersion::V2, None, true, CounterMode::Numeric)]
    #[case(ProtocolVersion::V2, Some(3), false, CounterMode::Numeric)]
    #[case(ProtocolVersion::V2, Some(3), true, CounterMode::HashBased)]
    #[case(ProtocolVersion::V2, Some(2), true, CounterMode::Numeric)]
    #[case(ProtocolVersion::V2, Some(4), true, CounterMode::Numeric)]
    fn test_forced_version(
        #[case] protocol: ProtocolVersion,
        #[case] forced: Option<u8>,
        #[case] has_ctr_data: bool,
        #[case] expected: CounterMode,
    ) {
        let ctr_data = has_ctr_data.then(|| vec![1u8; 16]);
        assert_eq!(counter_mode(&activation(protocol, ctr_data), forced), expected);
    }

    #[test]
    fn test_hash_counter_within_lookahead() {
        let keys = ActivationKeys::derive(&[7u8; 32]).unwrap();
        let start = init_ctr_data().unwrap();
        let mut record = activation(ProtocolVersion::V3, Some(start.to_vec()));

        // Device is two steps ahead
        let device_ctr = next_ctr_data(&next_ctr_data(&start));
        let signature = compute_signature(
            &keys,
            SignatureType::PossessionKnowledge,
            &device_ctr,
            b"payment 100 EUR",
            8,
        )
        .unwrap();

        let candidates = [SignatureType::PossessionKnowledge];
        let matched = check(&keys, CounterMode::HashBased, &candidates, &signature)
            .find(&record)
            .unwrap()
            .unwrap();
        assert_eq!(matched.offset, 2);

        apply_success(&mut record, CounterMode::HashBased, &matched);
        assert_eq!(record.counter, 3);
        assert_eq!(record.ctr_data, Some(next_ctr_data(&device_ctr).to_vec()));
    }

    #[test]
    fn test_numeric_counter_and_wrong_type() {
        let keys = ActivationKeys::derive(&[8u8; 32]).unwrap();
        let record = activation(ProtocolVersion::V2, None);

        let signature = compute_signature(
            &keys,
            SignatureType::PossessionBiometry,
            &numeric_ctr_data(0),
            b"payment 100 EUR",
            8,
        )
        .unwrap();

        let knowledge_only = [SignatureType::PossessionKnowledge];
        assert!(check(&keys, CounterMode::Numeric, &knowledge_only, &signature)
            .find(&record)
            .unwrap()
            .is_none());

        let both = [SignatureType::PossessionKnowledge, SignatureType::PossessionBiometry];
        let matched = check(&keys, CounterMode::Numeric, &both, &signature)
            .find(&record)
            .unwrap()
            .unwrap();
        assert_eq!(matched.signature_type, SignatureType::PossessionBiometry);
        assert_eq!(matched.offset, 0);
    }

    #[test]
    fn test_failures_remove_at_maximum() {
        let mut record = activation(ProtocolVersion::V3, Some(vec![0u8; 16]));
        assert!(!apply_failure(&mut record, CounterMode::HashBased));
        assert!(!apply_failure(&mut record, CounterMode::HashBased));
        assert!(apply_failure(&mut record, CounterMode::HashBased));
        assert_eq!(record.status, ActivationStatus::Removed);
        assert_eq!(record.counter, 3);
        assert_ne!(record.ctr_data, Some(vec![0u8; 16]));
    }
}
