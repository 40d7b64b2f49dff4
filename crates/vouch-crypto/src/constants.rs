//! Cryptographic constants and domain separation strings.
//!
//! Sizes and derivation labels are part of the protocol. Changing any of them breaks
//! compatibility with provisioned devices and with data already encrypted at rest.

/// AES-128 key size in bytes
pub const AES_KEY_SIZE: usize = 16;

/// AES block size, also the CBC IV size, in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// Size of derived at-rest record keys in bytes
pub const RECORD_KEY_SIZE: usize = 16;

/// Size of a P-256 private scalar in bytes
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Size of a compressed SEC1 P-256 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Size of the ECDH shared secret in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

/// Size of HMAC-SHA256 output in bytes
pub const HMAC_SIZE: usize = 32;

/// Size of ECIES envelope nonces in bytes
pub const ENVELOPE_NONCE_SIZE: usize = 16;

/// Size of signature counter data in bytes
pub const CTR_DATA_SIZE: usize = 16;

/// Size of factor signature keys in bytes
pub const SIGNATURE_KEY_SIZE: usize = 16;

/// Decimal digits in an online signature component
pub const ONLINE_COMPONENT_LENGTH: usize = 8;

/// Shortest accepted decimal signature component
pub const MIN_COMPONENT_LENGTH: usize = 4;

/// Longest accepted decimal signature component
pub const MAX_COMPONENT_LENGTH: usize = 8;

/// Random bytes behind an activation or recovery code (before checksum)
pub const CODE_RANDOM_BYTES: usize = 10;

/// Decimal digits in a recovery PUK
pub const PUK_LENGTH: usize = 10;

/// Hard upper bound on PUKs attached to one recovery code
pub const PUK_COUNT_MAX: u32 = 100;

/// Delimiter joining secret context fields into the KDF index
pub const CONTEXT_DELIMITER: &str = "&";

/// Domain separation for possession factor key derivation
pub const DOMAIN_SIGNATURE_POSSESSION: &str = "vouch:signature:possession:v1";

/// Domain separation for knowledge factor key derivation
pub const DOMAIN_SIGNATURE_KNOWLEDGE: &str = "vouch:signature:knowledge:v1";

/// Domain separation for biometry factor key derivation
pub const DOMAIN_SIGNATURE_BIOMETRY: &str = "vouch:signature:biometry:v1";

/// Domain separation for the transport key
pub const DOMAIN_TRANSPORT_KEY: &str = "vouch:transport:v1";

/// Domain separation for the vault encryption key
pub const DOMAIN_VAULT_KEY: &str = "vouch:vault:v1";

/// Domain separation for the recovery postcard seed
pub const DOMAIN_RECOVERY_SEED: &str = "vouch:recovery:seed:v1";

/// Label for recovery code derivation inside a postcard seed
pub const LABEL_RECOVERY_CODE: &[u8] = b"recovery-code";

/// Argon2id parameters for PUK hashing
pub mod argon2_params {
    use argon2::{Params, Version};

    /// Memory cost: 19 MiB
    pub const MEMORY_COST: u32 = 19 * 1024;

    /// Time cost: 2 iterations
    pub const TIME_COST: u32 = 2;

    /// Parallelism: 1 thread
    pub const PARALLELISM: u32 = 1;

    /// Output length: 32 bytes
    pub const OUTPUT_LENGTH: usize = 32;

    /// Argon2 version
    pub const VERSION: Version = Version::V0x13;

    /// Build Argon2id parameters
    pub fn get_params() -> Result<Params, argon2::Error> {
        Params::new(MEMORY_COST, TIME_COST, PARALLELISM, Some(OUTPUT_LENGTH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_strings_are_distinct() {
        let domains = [
            DOMAIN_SIGNATURE_POSSESSION,
            DOMAIN_SIGNATURE_KNOWLEDGE,
            DOMAIN_SIGNATURE_BIOMETRY,
            DOMAIN_TRANSPORT_KEY,
            DOMAIN_VAULT_KEY,
            DOMAIN_RECOVERY_SEED,
        ];
        for (i, a) in domains.iter().enumerate() {
            for b in domains.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_argon2_params_are_valid() {
        let params = argon2_params::get_params().unwrap();
        assert!(params.m_cost() > 0);
        assert!(params.t_cost() > 0);
    }

    #[test]
    fn test_component_length_bounds() {
        assert!(MIN_COMPONENT_LENGTH <= ONLINE_COMPONENT_LENGTH);
        assert!(ONLINE_COMPONENT_LENGTH <= MAX_COMPONENT_LENGTH);
    }
}
