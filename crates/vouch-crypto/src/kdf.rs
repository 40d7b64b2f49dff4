//! Key derivation: HMAC-SHA256 based record keys and HKDF-SHA256 protocol keys.

use crate::{constants::*, errors::*};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 of `data` under `key`
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; HMAC_SIZE]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Compute HMAC-SHA256 over several parts without concatenating them first
pub fn hmac_sha256_parts(key: &[u8], parts: &[&[u8]]) -> Result<[u8; HMAC_SIZE]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Verify an HMAC-SHA256 tag over several parts in constant time
pub fn hmac_sha256_verify(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag)
        .map_err(|_| CryptoError::MacVerificationFailed)
}

/// Internal KDF for at-rest record keys
///
/// Computes `HMAC-SHA256(master_key, index)` and folds the 32-byte output into 16 bytes by
/// XOR-ing its halves. The index is the caller-supplied context material (see
/// [`context_index`]).
pub fn kdf_internal(master_key: &[u8], index: &[u8]) -> Result<Zeroizing<[u8; RECORD_KEY_SIZE]>> {
    if master_key.is_empty() {
        return Err(CryptoError::KeyDerivationFailed(
            "master key must not be empty".to_string(),
        ));
    }
    let full = Zeroizing::new(hmac_sha256(master_key, index)?);
    Ok(xor_fold(&full))
}

/// Join context fields with the context delimiter into KDF index bytes
pub fn context_index<S: AsRef<str>>(fields: &[S]) -> Vec<u8> {
    fields
        .iter()
        .map(|f| f.as_ref())
        .collect::<Vec<_>>()
        .join(CONTEXT_DELIMITER)
        .into_bytes()
}

/// Fold 32 bytes into 16 by XOR-ing the two halves
pub fn xor_fold(input: &[u8; 32]) -> Zeroizing<[u8; 16]> {
    let mut out = Zeroizing::new([0u8; 16]);
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = input[i] ^ input[i + 16];
    }
    out
}

/// Derive a key using HKDF-SHA256
///
/// # Arguments
///
/// * `ikm` - Input key material
/// * `info` - Domain separation string and context
/// * `output_len` - Length of output key material
pub fn hkdf_derive(ikm: &[u8], info: &[u8], output_len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut output = Zeroizing::new(vec![0u8; output_len]);

    hkdf.expand(info, &mut output)
        .map_err(|_| CryptoError::HkdfError)?;

    Ok(output)
}

/// Derive a 16-byte key using HKDF-SHA256
pub fn hkdf_derive_16(ikm: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; 16]>> {
    let output = hkdf_derive(ikm, info, 16)?;
    let mut key = Zeroizing::new([0u8; 16]);
    key.copy_from_slice(&output);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_internal_is_deterministic() {
        let master = [7u8; 16];
        let k1 = kdf_internal(&master, b"app&user&activation").unwrap();
        let k2 = kdf_internal(&master, b"app&user&activation").unwrap();
        assert_eq!(*k1, *k2);
    }

    #[test]
    fn test_kdf_internal_depends_on_index() {
        let master = [7u8; 16];
        let k1 = kdf_internal(&master, b"user&a1").unwrap();
        let k2 = kdf_internal(&master, b"user&a2").unwrap();
        assert_ne!(*k1, *k2);
    }

    #[test]
    fn test_kdf_internal_rejects_empty_master() {
        assert!(kdf_internal(&[], b"index").is_err());
    }

    #[test]
    fn test_kdf_internal_matches_folded_hmac() {
        let master = [1u8; 16];
        let full = hmac_sha256(&master, b"x").unwrap();
        let folded = kdf_internal(&master, b"x").unwrap();
        for i in 0..16 {
            assert_eq!(folded[i], full[i] ^ full[i + 16]);
        }
    }

    #[test]
    fn test_context_index_joins_fields() {
        assert_eq!(context_index(&["u1", "a1"]), b"u1&a1".to_vec());
        assert_eq!(context_index(&["only"]), b"only".to_vec());
        assert_eq!(context_index::<&str>(&[]), Vec::<u8>::new());
    }

    #[test]
    fn test_hkdf_derive_is_deterministic() {
        let ikm = b"input key material";
        let a = hkdf_derive(ikm, DOMAIN_VAULT_KEY.as_bytes(), 32).unwrap();
        let b = hkdf_derive(ikm, DOMAIN_VAULT_KEY.as_bytes(), 32).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_hkdf_derive_different_info() {
        let ikm = b"input key material";
        let a = hkdf_derive_16(ikm, DOMAIN_VAULT_KEY.as_bytes()).unwrap();
        let b = hkdf_derive_16(ikm, DOMAIN_TRANSPORT_KEY.as_bytes()).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_hmac_verify_rejects_tampered_tag() {
        let key = [3u8; 32];
        let mut tag = hmac_sha256_parts(&key, &[b"a", b"b"]).unwrap();
        assert!(hmac_sha256_verify(&key, &[b"a", b"b"], &tag).is_ok());
        assert!(hmac_sha256_verify(&key, &[b"ab"], &tag).is_ok());
        tag[0] ^= 1;
        assert!(matches!(
            hmac_sha256_verify(&key, &[b"a", b"b"], &tag),
            Err(CryptoError::MacVerificationFailed)
        ));
    }
}
