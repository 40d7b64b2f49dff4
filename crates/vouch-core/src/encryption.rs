//! Context-derived at-rest encryption.
//!
//! Each record gets its own AES-128 key, derived from the master key and the record's business
//! context:
//!
//! ```text
//! record_key = xor_fold(HMAC-SHA256(master_key, fields.join("&")))
//! payload    = Base64(IV || AES-128-CBC/PKCS7(record_key, IV, plaintext))
//! ```
//!
//! Without a master key secrets are stored as `NO_ENCRYPTION` with the plaintext passed through.
//! Unencrypted deployments depend on this, so it is allowed, but it is announced with a warning
//! when the service is built.

use crate::{
    errors::{Result, ServiceError},
    types::{EncryptedSecret, EncryptionMode, SecretContext},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::warn;
use vouch_crypto::{aes_cbc_decrypt, aes_cbc_encrypt_with_random_iv, kdf_internal, CryptoError, AES_BLOCK_SIZE};
use zeroize::Zeroizing;

/// Encrypts and decrypts secrets under keys derived from their context
pub struct ContextEncryptionService {
    master_key: Option<Zeroizing<Vec<u8>>>,
}

impl ContextEncryptionService {
    /// Create the service
    ///
    /// An absent or empty master key disables encryption.
    pub fn new(master_key: Option<&[u8]>) -> Self {
        let master_key = master_key
            .filter(|key| !key.is_empty())
            .map(|key| Zeroizing::new(key.to_vec()));

        if master_key.is_none() {
            warn!("No master DB encryption key configured, secrets will be stored unencrypted");
        }

        Self { master_key }
    }

    /// Whether new secrets are encrypted
    pub fn is_configured(&self) -> bool {
        self.master_key.is_some()
    }

    /// Protect a secret for storage
    pub fn encrypt(&self, plaintext: &[u8], context: &SecretContext) -> Result<EncryptedSecret> {
        let Some(master_key) = &self.master_key else {
            return Ok(EncryptedSecret {
                encryption_mode: EncryptionMode::NoEncryption,
                payload: plaintext.to_vec(),
            });
        };

        let record_key = derive_record_key(master_key, context)?;
        let sealed = aes_cbc_encrypt_with_random_iv(&record_key[..], plaintext).map_err(|e| match e {
            CryptoError::RandomGenerationFailed(msg) => ServiceError::CryptoProviderFailure(msg),
            _ => ServiceError::EncryptionFailed,
        })?;

        Ok(EncryptedSecret {
            encryption_mode: EncryptionMode::AesHmac,
            payload: STANDARD.encode(sealed).into_bytes(),
        })
    }

    /// Recover a stored secret
    ///
    /// Dispatches on the stored mode, so unencrypted records stay readable after a master key
    /// is introduced.
    pub fn decrypt(&self, secret: &EncryptedSecret, context: &SecretContext) -> Result<Zeroizing<Vec<u8>>> {
        match secret.encryption_mode {
            EncryptionMode::NoEncryption => Ok(Zeroizing::new(secret.payload.clone())),
            EncryptionMode::AesHmac => {
                let master_key = self.master_key.as_ref().ok_or(ServiceError::MissingMasterKey)?;

                let sealed = Zeroizing::new(
                    STANDARD
                        .decode(&secret.payload)
                        .map_err(|e| ServiceError::InvalidKeyFormat(format!("payload is not Base64: {}", e)))?,
                );
                if sealed.len() < AES_BLOCK_SIZE {
                    return Err(ServiceError::InvalidKeyFormat(format!(
                        "payload of {} bytes is shorter than the IV",
                        sealed.len()
                    )));
                }

                let record_key = derive_record_key(master_key, context)?;
                let (iv, ciphertext) = sealed.split_at(AES_BLOCK_SIZE);
                let plaintext = aes_cbc_decrypt(&record_key[..], iv, ciphertext)
                    .map_err(|_| ServiceError::DecryptionFailed)?;
                Ok(Zeroizing::new(plaintext))
            }
        }
    }
}

fn derive_record_key(master_key: &[u8], context: &SecretContext) -> Result<Zeroizing<[u8; 16]>> {
    kdf_internal(master_key, &context.index()).map_err(|e| ServiceError::KdfFailure(e.to_string()))
}
