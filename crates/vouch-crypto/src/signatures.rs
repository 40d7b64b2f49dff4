//! Multi-factor activation signatures and signature counters.
//!
//! Every activation shares a master secret between device and server (ECDH of the device key
//! and the per-activation server key). Factor keys are derived from it with HKDF and domain
//! separated labels. A signature is one decimal component per factor:
//!
//! ```text
//! component = truncate(HMAC(HMAC(factor_key, ctr_data), data), length)
//! signature = component_1 "-" component_2 ...
//! ```
//!
//! `ctr_data` comes from the activation's counter. Protocol V2 uses a numeric counter encoded
//! into 16 bytes; protocol V3 uses a hash chain where the next value is the first 16 bytes of
//! SHA-256 of the current one.

use crate::{constants::*, errors::*, kdf::*, utils::*};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Single authentication factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureFactor {
    /// Something the user has (device-bound key)
    Possession,
    /// Something the user knows (PIN/password-protected key)
    Knowledge,
    /// Something the user is (biometry-protected key)
    Biometry,
}

/// Accepted combinations of signature factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureType {
    /// Possession only
    Possession,
    /// Knowledge only
    Knowledge,
    /// Biometry only
    Biometry,
    /// Possession and knowledge
    PossessionKnowledge,
    /// Possession and biometry
    PossessionBiometry,
    /// All three factors
    PossessionKnowledgeBiometry,
}

impl SignatureType {
    /// All signature types
    pub const ALL: [SignatureType; 6] = [
        SignatureType::Possession,
        SignatureType::Knowledge,
        SignatureType::Biometry,
        SignatureType::PossessionKnowledge,
        SignatureType::PossessionBiometry,
        SignatureType::PossessionKnowledgeBiometry,
    ];

    /// Factors covered by this type, in signing order
    pub fn factors(self) -> &'static [SignatureFactor] {
        use SignatureFactor::*;
        match self {
            SignatureType::Possession => &[Possession],
            SignatureType::Knowledge => &[Knowledge],
            SignatureType::Biometry => &[Biometry],
            SignatureType::PossessionKnowledge => &[Possession, Knowledge],
            SignatureType::PossessionBiometry => &[Possession, Biometry],
            SignatureType::PossessionKnowledgeBiometry => &[Possession, Knowledge, Biometry],
        }
    }

    /// Canonical upper-case name
    pub fn as_str(self) -> &'static str {
        match self {
            SignatureType::Possession => "POSSESSION",
            SignatureType::Knowledge => "KNOWLEDGE",
            SignatureType::Biometry => "BIOMETRY",
            SignatureType::PossessionKnowledge => "POSSESSION_KNOWLEDGE",
            SignatureType::PossessionBiometry => "POSSESSION_BIOMETRY",
            SignatureType::PossessionKnowledgeBiometry => "POSSESSION_KNOWLEDGE_BIOMETRY",
        }
    }

    /// Whether the type combines more than one factor
    pub fn is_multi_factor(self) -> bool {
        self.factors().len() > 1
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureType {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        SignatureType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CryptoError::InvalidInput(format!("unknown signature type: {}", s)))
    }
}

/// Keys derived from an activation master secret
pub struct ActivationKeys {
    possession: Zeroizing<[u8; SIGNATURE_KEY_SIZE]>,
    knowledge: Zeroizing<[u8; SIGNATURE_KEY_SIZE]>,
    biometry: Zeroizing<[u8; SIGNATURE_KEY_SIZE]>,
    transport: Zeroizing<[u8; SIGNATURE_KEY_SIZE]>,
    vault: Zeroizing<[u8; SIGNATURE_KEY_SIZE]>,
}

impl ActivationKeys {
    /// Derive all activation keys from the ECDH master secret
    pub fn derive(master_secret: &[u8]) -> Result<Self> {
        Ok(Self {
            possession: hkdf_derive_16(master_secret, DOMAIN_SIGNATURE_POSSESSION.as_bytes())?,
            knowledge: hkdf_derive_16(master_secret, DOMAIN_SIGNATURE_KNOWLEDGE.as_bytes())?,
            biometry: hkdf_derive_16(master_secret, DOMAIN_SIGNATURE_BIOMETRY.as_bytes())?,
            transport: hkdf_derive_16(master_secret, DOMAIN_TRANSPORT_KEY.as_bytes())?,
            vault: hkdf_derive_16(master_secret, DOMAIN_VAULT_KEY.as_bytes())?,
        })
    }

    /// Signature key for a factor
    pub fn factor_key(&self, factor: SignatureFactor) -> &[u8; SIGNATURE_KEY_SIZE] {
        match factor {
            SignatureFactor::Possession => &*self.possession,
            SignatureFactor::Knowledge => &*self.knowledge,
            SignatureFactor::Biometry => &*self.biometry,
        }
    }

    /// Transport key, protects the vault key on its way to the device
    pub fn transport_key(&self) -> &[u8; SIGNATURE_KEY_SIZE] {
        &*self.transport
    }

    /// Vault encryption key released by vault unlock
    pub fn vault_key(&self) -> &[u8; SIGNATURE_KEY_SIZE] {
        &*self.vault
    }
}

/// Counter data for a numeric (protocol V2) counter
pub fn numeric_ctr_data(counter: u64) -> [u8; CTR_DATA_SIZE] {
    let mut out = [0u8; CTR_DATA_SIZE];
    out[8..].copy_from_slice(&counter.to_be_bytes());
    out
}

/// Initial value of a hash-based (protocol V3) counter
pub fn init_ctr_data() -> Result<[u8; CTR_DATA_SIZE]> {
    random_bytes()
}

/// Next value of a hash-based counter
pub fn next_ctr_data(ctr_data: &[u8]) -> [u8; CTR_DATA_SIZE] {
    let digest = sha256(ctr_data);
    let mut out = [0u8; CTR_DATA_SIZE];
    out.copy_from_slice(&digest[..CTR_DATA_SIZE]);
    out
}

/// Compute a multi-factor signature value
///
/// # Arguments
///
/// * `keys` - Activation keys
/// * `signature_type` - Factors to sign with
/// * `ctr_data` - 16-byte counter data
/// * `data` - Signed payload
/// * `component_length` - Decimal digits per factor (4 to 8)
pub fn compute_signature(
    keys: &ActivationKeys,
    signature_type: SignatureType,
    ctr_data: &[u8],
    data: &[u8],
    component_length: usize,
) -> Result<String> {
    if ctr_data.len() != CTR_DATA_SIZE {
        return Err(CryptoError::InvalidInput(format!(
            "counter data must be {} bytes, got {}",
            CTR_DATA_SIZE,
            ctr_data.len()
        )));
    }
    if !(MIN_COMPONENT_LENGTH..=MAX_COMPONENT_LENGTH).contains(&component_length) {
        return Err(CryptoError::InvalidInput(format!(
            "component length {} out of range",
            component_length
        )));
    }

    let modulus = 10u32.pow(component_length as u32);
    let mut components = Vec::with_capacity(signature_type.factors().len());

    for factor in signature_type.factors() {
        let derived = Zeroizing::new(hmac_sha256(keys.factor_key(*factor), ctr_data)?);
        let mac = hmac_sha256(&derived[..], data)?;

        let offset = (mac[HMAC_SIZE - 1] & 0x0f) as usize;
        let code = u32::from_be_bytes([mac[offset], mac[offset + 1], mac[offset + 2], mac[offset + 3]])
            & 0x7fff_ffff;

        components.push(format!("{:0width$}", code % modulus, width = component_length));
    }

    Ok(components.join("-"))
}

/// Compare a computed and a provided signature value in constant time
pub fn signature_matches(expected: &str, provided: &str) -> bool {
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}
