//! Argon2id hashing for recovery PUKs.

use crate::{constants::*, errors::*};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

fn argon2() -> Result<Argon2<'static>> {
    let params =
        argon2_params::get_params().map_err(|e| CryptoError::Argon2Failed(e.to_string()))?;
    Ok(Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2_params::VERSION,
        params,
    ))
}

/// Hash a secret using Argon2id with a fresh salt
///
/// # Returns
///
/// PHC-formatted hash string that includes algorithm, parameters, salt, and hash
pub fn hash_secret(secret: &[u8]) -> Result<String> {
    let salt = SaltString::generate(&mut rand::thread_rng());
    let hash = argon2()?
        .hash_password(secret, &salt)
        .map_err(|e| CryptoError::Argon2Failed(e.to_string()))?;

    Ok(hash.to_string())
}

/// Verify a secret against an Argon2id hash
///
/// Returns `Ok(true)` on match and `Ok(false)` on mismatch. A hash that cannot be parsed is an
/// error, not a mismatch.
pub fn verify_secret(secret: &[u8], hash_str: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash_str).map_err(|_| CryptoError::InvalidHashFormat)?;

    match argon2()?.verify_password(secret, &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(CryptoError::Argon2Failed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_secret(b"0123456789").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_secret(b"0123456789", &hash).unwrap());
        assert!(!verify_secret(b"9876543210", &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let a = hash_secret(b"same").unwrap();
        let b = hash_secret(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_hash_format() {
        assert!(matches!(
            verify_secret(b"x", "not-a-phc-string"),
            Err(CryptoError::InvalidHashFormat)
        ));
    }
}
