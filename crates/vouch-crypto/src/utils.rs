//! Common utility functions for vouch cryptographic operations.

use crate::errors::*;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in seconds.
///
/// This is the single source of truth for record timestamps across vouch. A clock set before
/// the Unix epoch yields 0.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in milliseconds.
///
/// Envelope timestamps are expressed in milliseconds.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Fill a fixed-size array from the OS-seeded thread RNG
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    rand::thread_rng()
        .try_fill_bytes(&mut out)
        .map_err(|e| CryptoError::RandomGenerationFailed(e.to_string()))?;
    Ok(out)
}

/// Generate `len` random bytes
pub fn random_vec(len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    rand::thread_rng()
        .try_fill_bytes(&mut out)
        .map_err(|e| CryptoError::RandomGenerationFailed(e.to_string()))?;
    Ok(out)
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Securely compare two byte slices in constant time
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;

    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
