//! P-256 key pairs, ECDH key agreement and ECDSA signatures.

use crate::{constants::*, errors::*};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// P-256 key pair
///
/// Used for application master keys, per-activation server keys, device keys, temporary keys
/// and recovery postcard keys. The private scalar is zeroized on drop.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Restore a key pair from its 32-byte private scalar
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PRIVATE_KEY_SIZE {
            return Err(CryptoError::InvalidKeySize {
                expected: PRIVATE_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;
        Ok(Self { secret })
    }

    /// Private scalar bytes
    pub fn private_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// Compressed SEC1 public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// ECDH with a peer public key, returning the raw 32-byte shared secret
    pub fn diffie_hellman(&self, peer_public_key: &[u8]) -> Result<Zeroizing<[u8; SHARED_SECRET_SIZE]>> {
        let peer = parse_public_key(peer_public_key)?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());

        let mut out = Zeroizing::new([0u8; SHARED_SECRET_SIZE]);
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }

    /// Sign a message with ECDSA (SHA-256), returning a DER-encoded signature
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::from(&self.secret);
        let signature: Signature = signing_key.sign(message);
        signature.to_der().as_bytes().to_vec()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_bytes())
            .finish_non_exhaustive()
    }
}

/// Parse a SEC1-encoded P-256 public key (compressed or uncompressed)
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_sec1_bytes(bytes).map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))
}

/// Re-encode a public key in compressed form
///
/// Device keys are stored normalized so equality checks do not depend on the encoding the
/// client picked.
pub fn normalize_public_key(bytes: &[u8]) -> Result<Vec<u8>> {
    Ok(parse_public_key(bytes)?
        .to_encoded_point(true)
        .as_bytes()
        .to_vec())
}

/// Verify a DER-encoded ECDSA signature
pub fn verify_ecdsa(public_key: &[u8], message: &[u8], signature_der: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;
    let signature = Signature::from_der(signature_der).map_err(|_| CryptoError::InvalidSignature)?;

    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}
