//! Column family definitions.

/// Applications: application_id → Application
pub const CF_APPLICATIONS: &str = "applications";

/// Applications by key index: application_key → application_id
pub const CF_APPLICATIONS_BY_KEY: &str = "applications_by_key";

/// Recovery configuration: application_id → RecoveryConfig
pub const CF_RECOVERY_CONFIGS: &str = "recovery_configs";

/// Activations: activation_id → Activation
pub const CF_ACTIVATIONS: &str = "activations";

/// Activation code index: (application_id, activation_code) → activation_id
///
/// Entries exist only while the activation is `CREATED`.
pub const CF_ACTIVATIONS_BY_CODE: &str = "activations_by_code";

/// Activations by user index: (user_id, activation_id) → activation_id
pub const CF_ACTIVATIONS_BY_USER: &str = "activations_by_user";

/// Activation history: (activation_id, sequence) → ActivationHistoryEntry
pub const CF_ACTIVATION_HISTORY: &str = "activation_history";

/// Recovery codes: recovery_code_id → RecoveryCode
pub const CF_RECOVERY_CODES: &str = "recovery_codes";

/// Recovery code index: (application_id, recovery_code) → recovery_code_id
pub const CF_RECOVERY_CODES_BY_CODE: &str = "recovery_codes_by_code";

/// Recovery codes by user index: (user_id, recovery_code_id) → recovery_code_id
pub const CF_RECOVERY_CODES_BY_USER: &str = "recovery_codes_by_user";

/// Temporary keys: key_id → TemporaryKey (TTL: temporary key validity)
pub const CF_TEMPORARY_KEYS: &str = "temporary_keys";

/// Used envelope nonces: (ephemeral_public_key, nonce) → expiry_timestamp
pub const CF_USED_NONCES: &str = "used_nonces";

/// Get all column family names
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        CF_APPLICATIONS,
        CF_APPLICATIONS_BY_KEY,
        CF_RECOVERY_CONFIGS,
        CF_ACTIVATIONS,
        CF_ACTIVATIONS_BY_CODE,
        CF_ACTIVATIONS_BY_USER,
        CF_ACTIVATION_HISTORY,
        CF_RECOVERY_CODES,
        CF_RECOVERY_CODES_BY_CODE,
        CF_RECOVERY_CODES_BY_USER,
        CF_TEMPORARY_KEYS,
        CF_USED_NONCES,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_column_families_non_empty() {
        let cfs = all_column_families();
        assert!(!cfs.is_empty());
    }

    #[test]
    fn test_no_duplicate_column_families() {
        let cfs = all_column_families();
        let mut unique = std::collections::HashSet::new();

        for cf in &cfs {
            assert!(unique.insert(cf), "Duplicate column family: {}", cf);
        }
    }
}
