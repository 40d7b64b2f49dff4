//! Service configuration snapshot.

use std::time::Duration;
use vouch_crypto::{MAX_COMPONENT_LENGTH, MIN_COMPONENT_LENGTH, PUK_COUNT_MAX};

/// Immutable configuration injected into [`crate::VouchService`]
#[derive(Clone)]
pub struct ServiceConfig {
    /// Master key for context-derived at-rest encryption; `None` stores secrets unencrypted
    pub master_db_encryption_key: Option<Vec<u8>>,

    /// Failed attempts before an activation is removed, when init does not set one
    pub max_failed_attempts: u32,

    /// Lifetime of a `CREATED`/`PENDING_COMMIT` activation, when init does not set one
    pub activation_validity: Duration,

    /// Number of counter positions tried ahead of the stored counter
    pub signature_validation_lookahead: u64,

    /// Decimal digits per factor in offline signatures (4 to 8)
    pub offline_signature_component_length: usize,

    /// Accept `POSSESSION_BIOMETRY` for vault unlock
    pub vault_unlock_allow_biometry: bool,

    /// How far in the past an envelope timestamp may lie (milliseconds)
    pub request_timestamp_validity_ms: u64,

    /// How far in the future an envelope timestamp may lie (milliseconds)
    pub request_timestamp_tolerance_ms: u64,

    /// Failed PUK attempts before a recovery code is blocked
    pub recovery_max_failed_attempts: u32,

    /// Upper bound on PUKs per recovery code (never above 100)
    pub recovery_max_puk_count: u32,

    /// Attempts at finding an unused activation code
    pub generate_activation_code_iterations: u32,

    /// Attempts at finding an unused recovery code
    pub generate_recovery_code_iterations: u32,

    /// Lifetime of a temporary encryption key
    pub temporary_key_validity: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            master_db_encryption_key: None,
            max_failed_attempts: 5,
            activation_validity: Duration::from_secs(120),
            signature_validation_lookahead: 20,
            offline_signature_component_length: 8,
            vault_unlock_allow_biometry: false,
            request_timestamp_validity_ms: 7_200_000,
            request_timestamp_tolerance_ms: 60_000,
            recovery_max_failed_attempts: 10,
            recovery_max_puk_count: PUK_COUNT_MAX,
            generate_activation_code_iterations: 10,
            generate_recovery_code_iterations: 10,
            temporary_key_validity: Duration::from_secs(300),
        }
    }
}

impl ServiceConfig {
    /// Effective PUK bound
    pub fn max_puk_count(&self) -> u32 {
        self.recovery_max_puk_count.clamp(1, PUK_COUNT_MAX)
    }

    /// Effective offline component length
    pub fn offline_component_length(&self) -> usize {
        self.offline_signature_component_length
            .clamp(MIN_COMPONENT_LENGTH, MAX_COMPONENT_LENGTH)
    }
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field(
                "master_db_encryption_key",
                &self.master_db_encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .field("max_failed_attempts", &self.max_failed_attempts)
            .field("activation_validity", &self.activation_validity)
            .field("signature_validation_lookahead", &self.signature_validation_lookahead)
            .field(
                "offline_signature_component_length",
                &self.offline_signature_component_length,
            )
            .field("vault_unlock_allow_biometry", &self.vault_unlock_allow_biometry)
            .field("request_timestamp_validity_ms", &self.request_timestamp_validity_ms)
            .field("request_timestamp_tolerance_ms", &self.request_timestamp_tolerance_ms)
            .field("recovery_max_failed_attempts", &self.recovery_max_failed_attempts)
            .field("recovery_max_puk_count", &self.recovery_max_puk_count)
            .field("temporary_key_validity", &self.temporary_key_validity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_puk_bound_never_exceeds_hard_limit() {
        let config = ServiceConfig {
            recovery_max_puk_count: 500,
            ..Default::default()
        };
        assert_eq!(config.max_puk_count(), PUK_COUNT_MAX);
    }

    #[test]
    fn test_debug_redacts_master_key() {
        let config = ServiceConfig {
            master_db_encryption_key: Some(vec![7u8; 16]),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("7, 7"));
    }
}
