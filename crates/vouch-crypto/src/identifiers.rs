//! Activation codes, recovery codes and recovery PUKs.
//!
//! Codes are 10 bytes of entropy plus a 2-byte checksum, Base32 encoded (RFC 4648 alphabet,
//! no padding) and grouped as `XXXXX-XXXXX-XXXXX-XXXXX`.
//!
//! Recovery codes for postcards are derived, not random: the server and the printing centre
//! share an ECDH secret, and every code/PUK set is reproducible from that secret, a nonce and
//! the PUK derivation indexes.

use crate::{constants::*, errors::*, kdf::*, utils::*};
use base32::Alphabet;
use std::collections::HashSet;
use zeroize::Zeroizing;

const CODE_ALPHABET: Alphabet = Alphabet::Rfc4648 { padding: false };
const CODE_GROUP: usize = 5;
const CODE_CHARS: usize = 20;

/// Recovery code with its PUKs and the seed material needed to reproduce them
#[derive(Debug, Clone)]
pub struct RecoveryInfo {
    /// Recovery code in `XXXXX-XXXXX-XXXXX-XXXXX` form
    pub recovery_code: String,
    /// PUKs keyed by 1-based index
    pub puks: Vec<(u32, String)>,
    /// Nonce the seed key was derived from
    pub nonce: [u8; 16],
    /// PUK derivation indexes, parallel to `puks`
    pub puk_derivation_indexes: Vec<u64>,
}

/// Generate a random activation code
pub fn generate_activation_code() -> Result<String> {
    let entropy: [u8; CODE_RANDOM_BYTES] = random_bytes()?;
    Ok(code_from_entropy(&entropy))
}

/// Check the format and checksum of an activation or recovery code
pub fn validate_code(code: &str) -> bool {
    let compact: String = code.split('-').collect();
    let groups_ok = code.split('-').count() == CODE_CHARS / CODE_GROUP
        && code.split('-').all(|g| g.len() == CODE_GROUP);
    if !groups_ok || compact.len() != CODE_CHARS {
        return false;
    }
    if !compact.bytes().all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b)) {
        return false;
    }

    let Some(bytes) = base32::decode(CODE_ALPHABET, &compact) else {
        return false;
    };
    if bytes.len() < CODE_RANDOM_BYTES + 2 {
        return false;
    }
    let (entropy, checksum) = bytes.split_at(CODE_RANDOM_BYTES);
    checksum[..2] == code_checksum(entropy)
}

/// Generate a recovery code and `puk_count` PUKs from a shared secret
///
/// A fresh nonce is drawn on every call, so repeated calls yield different codes.
pub fn generate_recovery_code(shared_secret: &[u8], puk_count: u32) -> Result<RecoveryInfo> {
    if puk_count == 0 || puk_count > PUK_COUNT_MAX {
        return Err(CryptoError::InvalidInput(format!(
            "PUK count {} out of range",
            puk_count
        )));
    }

    let nonce: [u8; 16] = random_bytes()?;
    let recovery_code = derive_recovery_code(shared_secret, &nonce)?;

    let mut seen = HashSet::with_capacity(puk_count as usize);
    let mut puks = Vec::with_capacity(puk_count as usize);
    let mut indexes = Vec::with_capacity(puk_count as usize);

    for index in 1..=puk_count {
        let derivation_index = loop {
            let candidate = u64::from_be_bytes(random_bytes()?);
            if seen.insert(candidate) {
                break candidate;
            }
        };
        puks.push((index, derive_puk(shared_secret, &nonce, derivation_index)?));
        indexes.push(derivation_index);
    }

    Ok(RecoveryInfo {
        recovery_code,
        puks,
        nonce,
        puk_derivation_indexes: indexes,
    })
}

/// Reproduce the recovery code for a nonce
pub fn derive_recovery_code(shared_secret: &[u8], nonce: &[u8]) -> Result<String> {
    let seed = recovery_seed(shared_secret, nonce)?;
    let material = hmac_sha256(&seed[..], LABEL_RECOVERY_CODE)?;
    Ok(code_from_entropy(&material[..CODE_RANDOM_BYTES]))
}

/// Reproduce the PUK for a nonce and derivation index
pub fn derive_puk(shared_secret: &[u8], nonce: &[u8], derivation_index: u64) -> Result<String> {
    let seed = recovery_seed(shared_secret, nonce)?;
    let material = hmac_sha256(&seed[..], &derivation_index.to_be_bytes())?;

    let mut head = [0u8; 8];
    head.copy_from_slice(&material[..8]);
    let value = u64::from_be_bytes(head) % 10u64.pow(PUK_LENGTH as u32);
    Ok(format!("{:0width$}", value, width = PUK_LENGTH))
}

/// Mask a code for logging, keeping only the last group
pub fn mask_code(code: &str) -> String {
    match code.rsplit_once('-') {
        Some((head, tail)) => {
            let masked: String = head.chars().map(|c| if c == '-' { '-' } else { '*' }).collect();
            format!("{}-{}", masked, tail)
        }
        None => "*".repeat(code.len()),
    }
}

fn recovery_seed(shared_secret: &[u8], nonce: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let base = hkdf_derive(shared_secret, DOMAIN_RECOVERY_SEED.as_bytes(), 32)?;
    Ok(Zeroizing::new(hmac_sha256(&base, nonce)?))
}

fn code_checksum(entropy: &[u8]) -> [u8; 2] {
    let crc = crc32fast::hash(entropy);
    [(crc >> 8) as u8, crc as u8]
}

fn code_from_entropy(entropy: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(entropy.len() + 2);
    bytes.extend_from_slice(entropy);
    bytes.extend_from_slice(&code_checksum(entropy));

    let encoded = base32::encode(CODE_ALPHABET, &bytes);
    encoded
        .as_bytes()
        .chunks(CODE_GROUP)
        .take(CODE_CHARS / CODE_GROUP)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}
