//! ECIES request/response envelope.
//!
//! A client encrypts a request to a recipient P-256 public key with a fresh ephemeral key. Both
//! sides derive the same session keys:
//!
//! ```text
//! shared   = ECDH(recipient, ephemeral)
//! okm      = HKDF-SHA256(shared, info = shared_info1 || ephemeral_public_key, 64)
//! k_enc    = okm[0..16], k_mac = okm[16..48], k_iv = okm[48..64]
//! iv       = HMAC(k_iv, nonce)[0..16]
//! mac      = HMAC(k_mac, data || shared_info2 || nonce || timestamp_be || ephemeral_public_key)
//! ```
//!
//! The response reuses the session keys with a new nonce and timestamp.

use crate::{constants::*, errors::*, kdf::*, keys::KeyPair, symmetric::*, utils::*};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Encrypted request envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptographicEnvelope {
    /// Compressed ephemeral public key of the sender
    pub ephemeral_public_key: Vec<u8>,
    /// AES-128-CBC ciphertext
    pub encrypted_data: Vec<u8>,
    /// HMAC-SHA256 tag
    pub mac: Vec<u8>,
    /// 16-byte request nonce
    pub nonce: Vec<u8>,
    /// Request timestamp in Unix milliseconds
    pub timestamp: u64,
}

/// Encrypted response envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedResponse {
    /// AES-128-CBC ciphertext
    pub encrypted_data: Vec<u8>,
    /// HMAC-SHA256 tag
    pub mac: Vec<u8>,
    /// 16-byte response nonce
    pub nonce: Vec<u8>,
    /// Response timestamp in Unix milliseconds
    pub timestamp: u64,
}

/// Session keys shared by both ends of one ECIES exchange
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EciesSession {
    k_enc: [u8; AES_KEY_SIZE],
    k_mac: [u8; HMAC_SIZE],
    k_iv: [u8; AES_KEY_SIZE],
    #[zeroize(skip)]
    ephemeral_public_key: Vec<u8>,
    #[zeroize(skip)]
    shared_info2: Vec<u8>,
}

impl EciesSession {
    fn derive(
        shared_secret: &[u8],
        ephemeral_public_key: &[u8],
        shared_info1: &[u8],
        shared_info2: &[u8],
    ) -> Result<Self> {
        let mut info = Vec::with_capacity(shared_info1.len() + ephemeral_public_key.len());
        info.extend_from_slice(shared_info1);
        info.extend_from_slice(ephemeral_public_key);

        let okm = hkdf_derive(shared_secret, &info, AES_KEY_SIZE + HMAC_SIZE + AES_KEY_SIZE)?;

        let mut session = Self {
            k_enc: [0u8; AES_KEY_SIZE],
            k_mac: [0u8; HMAC_SIZE],
            k_iv: [0u8; AES_KEY_SIZE],
            ephemeral_public_key: ephemeral_public_key.to_vec(),
            shared_info2: shared_info2.to_vec(),
        };
        session.k_enc.copy_from_slice(&okm[..AES_KEY_SIZE]);
        session.k_mac.copy_from_slice(&okm[AES_KEY_SIZE..AES_KEY_SIZE + HMAC_SIZE]);
        session.k_iv.copy_from_slice(&okm[AES_KEY_SIZE + HMAC_SIZE..]);
        Ok(session)
    }

    /// Client side: encrypt a request to `recipient_public_key`
    ///
    /// Returns the envelope to send and the session needed to open the response.
    pub fn seal_request(
        recipient_public_key: &[u8],
        shared_info1: &[u8],
        shared_info2: &[u8],
        plaintext: &[u8],
    ) -> Result<(CryptographicEnvelope, Self)> {
        let ephemeral = KeyPair::generate();
        let ephemeral_public_key = ephemeral.public_key_bytes();
        let shared_secret = ephemeral.diffie_hellman(recipient_public_key)?;

        let session = Self::derive(
            &shared_secret[..],
            &ephemeral_public_key,
            shared_info1,
            shared_info2,
        )?;

        let nonce: [u8; ENVELOPE_NONCE_SIZE] = random_bytes()?;
        let timestamp = current_timestamp_millis();
        let (encrypted_data, mac) = session.seal(plaintext, &nonce, timestamp)?;

        let envelope = CryptographicEnvelope {
            ephemeral_public_key,
            encrypted_data,
            mac,
            nonce: nonce.to_vec(),
            timestamp,
        };
        Ok((envelope, session))
    }

    /// Server side: verify and decrypt a request with the recipient key pair
    ///
    /// The MAC is verified before any decryption happens.
    pub fn open_request(
        recipient: &KeyPair,
        shared_info1: &[u8],
        shared_info2: &[u8],
        envelope: &CryptographicEnvelope,
    ) -> Result<(Vec<u8>, Self)> {
        if envelope.nonce.len() != ENVELOPE_NONCE_SIZE {
            return Err(CryptoError::InvalidNonceSize {
                expected: ENVELOPE_NONCE_SIZE,
                actual: envelope.nonce.len(),
            });
        }

        let shared_secret = recipient.diffie_hellman(&envelope.ephemeral_public_key)?;
        let session = Self::derive(
            &shared_secret[..],
            &envelope.ephemeral_public_key,
            shared_info1,
            shared_info2,
        )?;

        let plaintext = session.open(
            &envelope.encrypted_data,
            &envelope.mac,
            &envelope.nonce,
            envelope.timestamp,
        )?;
        Ok((plaintext, session))
    }

    /// Encrypt a response inside this session
    pub fn seal_response(&self, plaintext: &[u8]) -> Result<EncryptedResponse> {
        let nonce: [u8; ENVELOPE_NONCE_SIZE] = random_bytes()?;
        let timestamp = current_timestamp_millis();
        let (encrypted_data, mac) = self.seal(plaintext, &nonce, timestamp)?;

        Ok(EncryptedResponse {
            encrypted_data,
            mac,
            nonce: nonce.to_vec(),
            timestamp,
        })
    }

    /// Verify and decrypt a response inside this session
    pub fn open_response(&self, response: &EncryptedResponse) -> Result<Vec<u8>> {
        if response.nonce.len() != ENVELOPE_NONCE_SIZE {
            return Err(CryptoError::InvalidNonceSize {
                expected: ENVELOPE_NONCE_SIZE,
                actual: response.nonce.len(),
            });
        }
        self.open(
            &response.encrypted_data,
            &response.mac,
            &response.nonce,
            response.timestamp,
        )
    }

    fn seal(&self, plaintext: &[u8], nonce: &[u8], timestamp: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let iv = self.iv(nonce)?;
        let encrypted_data = aes_cbc_encrypt(&self.k_enc, &iv, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let mac = hmac_sha256_parts(&self.k_mac, &self.mac_parts(&encrypted_data, nonce, &timestamp.to_be_bytes()))?;
        Ok((encrypted_data, mac.to_vec()))
    }

    fn open(&self, encrypted_data: &[u8], mac: &[u8], nonce: &[u8], timestamp: u64) -> Result<Vec<u8>> {
        hmac_sha256_verify(
            &self.k_mac,
            &self.mac_parts(encrypted_data, nonce, &timestamp.to_be_bytes()),
            mac,
        )?;

        let iv = self.iv(nonce)?;
        aes_cbc_decrypt(&self.k_enc, &iv, encrypted_data)
    }

    fn iv(&self, nonce: &[u8]) -> Result<[u8; AES_BLOCK_SIZE]> {
        let full = hmac_sha256(&self.k_iv, nonce)?;
        let mut iv = [0u8; AES_BLOCK_SIZE];
        iv.copy_from_slice(&full[..AES_BLOCK_SIZE]);
        Ok(iv)
    }

    fn mac_parts<'a>(&'a self, data: &'a [u8], nonce: &'a [u8], timestamp: &'a [u8]) -> [&'a [u8]; 5] {
        [
            data,
            &self.shared_info2,
            nonce,
            timestamp,
            &self.ephemeral_public_key,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCOPE: &[u8] = b"/vouch/test";

    #[test]
    fn test_request_response_roundtrip() {
        let server = KeyPair::generate();
        let (envelope, client) =
            EciesSession::seal_request(&server.public_key_bytes(), SCOPE, b"app-secret", b"{\"k\":1}").unwrap();

        let (plaintext, server_session) =
            EciesSession::open_request(&server, SCOPE, b"app-secret", &envelope).unwrap();
        assert_eq!(plaintext, b"{\"k\":1}".to_vec());

        let response = server_session.seal_response(b"response body").unwrap();
        assert_eq!(client.open_response(&response).unwrap(), b"response body".to_vec());
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected_before_decryption() {
        let server = KeyPair::generate();
        let (mut envelope, _) =
            EciesSession::seal_request(&server.public_key_bytes(), SCOPE, b"s2", b"payload").unwrap();
        envelope.encrypted_data[0] ^= 0x01;

        assert!(matches!(
            EciesSession::open_request(&server, SCOPE, b"s2", &envelope),
            Err(CryptoError::MacVerificationFailed)
        ));
    }

    #[test]
    fn test_timestamp_is_authenticated() {
        let server = KeyPair::generate();
        let (mut envelope, _) =
            EciesSession::seal_request(&server.public_key_bytes(), SCOPE, b"s2", b"payload").unwrap();
        envelope.timestamp += 1;

        assert!(EciesSession::open_request(&server, SCOPE, b"s2", &envelope).is_err());
    }

    #[test]
    fn test_shared_info_mismatch_is_rejected() {
        let server = KeyPair::generate();
        let (envelope, _) =
            EciesSession::seal_request(&server.public_key_bytes(), SCOPE, b"s2", b"payload").unwrap();

        assert!(EciesSession::open_request(&server, b"/vouch/other", b"s2", &envelope).is_err());
        assert!(EciesSession::open_request(&server, SCOPE, b"other", &envelope).is_err());
    }

    #[test]
    fn test_wrong_recipient_is_rejected() {
        let server = KeyPair::generate();
        let other = KeyPair::generate();
        let (envelope, _) =
            EciesSession::seal_request(&server.public_key_bytes(), SCOPE, b"s2", b"payload").unwrap();

        assert!(EciesSession::open_request(&other, SCOPE, b"s2", &envelope).is_err());
    }

    #[test]
    fn test_short_nonce_is_rejected() {
        let server = KeyPair::generate();
        let (mut envelope, _) =
            EciesSession::seal_request(&server.public_key_bytes(), SCOPE, b"s2", b"payload").unwrap();
        envelope.nonce.truncate(8);

        assert!(matches!(
            EciesSession::open_request(&server, SCOPE, b"s2", &envelope),
            Err(CryptoError::InvalidNonceSize { expected: 16, actual: 8 })
        ));
    }
}
