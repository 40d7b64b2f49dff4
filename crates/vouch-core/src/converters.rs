//! Secret field converters.
//!
//! Each converter fixes the context a class of secrets is encrypted under:
//!
//! | Secret | Context |
//! |---|---|
//! | Server private key | `[user_id, activation_id]` |
//! | Recovery postcard private key | `[application_record_id]` |
//! | Recovery PUK hash | `[application_record_id, user_id, recovery_code, puk_index]` |
//! | Temporary private key | `[key_id, application_key, activation_id or ""]` |
//!
//! Converters run before anything is staged, so an encryption failure never reaches storage.

use crate::{
    encryption::ContextEncryptionService,
    errors::{Result, ServiceError},
    types::{EncryptedSecret, EncryptionMode, SecretContext},
};
use std::sync::Arc;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Server private key of an activation
#[derive(Clone)]
pub struct ServerPrivateKeyConverter {
    encryption: Arc<ContextEncryptionService>,
}

impl ServerPrivateKeyConverter {
    /// Create the converter
    pub fn new(encryption: Arc<ContextEncryptionService>) -> Self {
        Self { encryption }
    }

    fn context(user_id: &str, activation_id: Uuid) -> SecretContext {
        SecretContext::new([user_id.to_string(), activation_id.to_string()])
    }

    /// Protect a server private key
    pub fn to_storage(&self, private_key: &[u8], user_id: &str, activation_id: Uuid) -> Result<EncryptedSecret> {
        self.encryption
            .encrypt(private_key, &Self::context(user_id, activation_id))
    }

    /// Recover a server private key
    pub fn from_storage(
        &self,
        secret: &EncryptedSecret,
        user_id: &str,
        activation_id: Uuid,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.encryption
            .decrypt(secret, &Self::context(user_id, activation_id))
    }
}

/// Recovery postcard private key of an application
#[derive(Clone)]
pub struct RecoveryPrivateKeyConverter {
    encryption: Arc<ContextEncryptionService>,
}

impl RecoveryPrivateKeyConverter {
    /// Create the converter
    pub fn new(encryption: Arc<ContextEncryptionService>) -> Self {
        Self { encryption }
    }

    /// Protect a postcard private key
    pub fn to_storage(&self, private_key: &[u8], application_record_id: u64) -> Result<EncryptedSecret> {
        self.encryption
            .encrypt(private_key, &SecretContext::new([application_record_id.to_string()]))
    }

    /// Recover a postcard private key
    pub fn from_storage(&self, secret: &EncryptedSecret, application_record_id: u64) -> Result<Zeroizing<Vec<u8>>> {
        self.encryption
            .decrypt(secret, &SecretContext::new([application_record_id.to_string()]))
    }
}

/// Hash of a recovery PUK
///
/// The hash is text. Unencrypted records hold its UTF-8 bytes; encrypted ones hold Base64
/// ciphertext, so the stored mode decides how the payload is read.
#[derive(Clone)]
pub struct RecoveryPukConverter {
    encryption: Arc<ContextEncryptionService>,
}

/// Context of one PUK
#[derive(Debug, Clone, Copy)]
pub struct PukContext<'a> {
    pub application_record_id: u64,
    pub user_id: &'a str,
    pub recovery_code: &'a str,
    pub puk_index: u32,
}

impl PukContext<'_> {
    fn secret_context(&self) -> SecretContext {
        SecretContext::new([
            self.application_record_id.to_string(),
            self.user_id.to_string(),
            self.recovery_code.to_string(),
            self.puk_index.to_string(),
        ])
    }
}

impl RecoveryPukConverter {
    /// Create the converter
    pub fn new(encryption: Arc<ContextEncryptionService>) -> Self {
        Self { encryption }
    }

    /// Protect a PUK hash
    pub fn to_storage(&self, puk_hash: &str, context: PukContext<'_>) -> Result<EncryptedSecret> {
        self.encryption
            .encrypt(puk_hash.as_bytes(), &context.secret_context())
    }

    /// Recover a PUK hash
    pub fn from_storage(&self, secret: &EncryptedSecret, context: PukContext<'_>) -> Result<String> {
        let bytes = match secret.encryption_mode {
            EncryptionMode::NoEncryption => Zeroizing::new(secret.payload.clone()),
            EncryptionMode::AesHmac => self.encryption.decrypt(secret, &context.secret_context())?,
        };

        String::from_utf8(bytes.to_vec())
            .map_err(|_| ServiceError::InvalidKeyFormat("PUK hash is not valid UTF-8".to_string()))
    }
}

/// Private key of a temporary key pair
#[derive(Clone)]
pub struct TemporaryKeyConverter {
    encryption: Arc<ContextEncryptionService>,
}

impl TemporaryKeyConverter {
    /// Create the converter
    pub fn new(encryption: Arc<ContextEncryptionService>) -> Self {
        Self { encryption }
    }

    fn context(key_id: &str, application_key: &str, activation_id: Option<Uuid>) -> SecretContext {
        SecretContext::new([
            key_id.to_string(),
            application_key.to_string(),
            activation_id.map(|id| id.to_string()).unwrap_or_default(),
        ])
    }

    /// Protect a temporary private key
    pub fn to_storage(
        &self,
        private_key: &[u8],
        key_id: &str,
        application_key: &str,
        activation_id: Option<Uuid>,
    ) -> Result<EncryptedSecret> {
        self.encryption
            .encrypt(private_key, &Self::context(key_id, application_key, activation_id))
    }

    /// Recover a temporary private key
    pub fn from_storage(
        &self,
        secret: &EncryptedSecret,
        key_id: &str,
        application_key: &str,
        activation_id: Option<Uuid>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.encryption
            .decrypt(secret, &Self::context(key_id, application_key, activation_id))
    }
}

/// The four converters, sharing one key service
#[derive(Clone)]
pub struct SecretConverters {
    pub server_private_key: ServerPrivateKeyConverter,
    pub recovery_private_key: RecoveryPrivateKeyConverter,
    pub recovery_puk: RecoveryPukConverter,
    pub temporary_key: TemporaryKeyConverter,
}

impl SecretConverters {
    /// Build all converters over one key service
    pub fn new(encryption: Arc<ContextEncryptionService>) -> Self {
        Self {
            server_private_key: ServerPrivateKeyConverter::new(Arc::clone(&encryption)),
            recovery_private_key: RecoveryPrivateKeyConverter::new(Arc::clone(&encryption)),
            recovery_puk: RecoveryPukConverter::new(Arc::clone(&encryption)),
            temporary_key: TemporaryKeyConverter::new(encryption),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converters(master_key: Option<&[u8]>) -> SecretConverters {
        SecretConverters::new(Arc::new(ContextEncryptionService::new(master_key)))
    }

    fn puk_context(index: u32) -> PukContext<'static> {
        PukContext {
            application_record_id: 1,
            user_id: "u1",
            recovery_code: "AAAAA-BBBBB-CCCCC-DDDDD",
            puk_index: index,
        }
    }

    #[test]
    fn test_server_private_key_bound_to_activation() {
        let c = converters(Some(&[1u8; 16]));
        let activation_id = Uuid::new_v4();

        let stored = c
            .server_private_key
            .to_storage(&[9u8; 32], "u1", activation_id)
            .unwrap();
        let key = c
            .server_private_key
            .from_storage(&stored, "u1", activation_id)
            .unwrap();
        assert_eq!(&key[..], &[9u8; 32]);

        let other = c
            .server_private_key
            .from_storage(&stored, "u1", Uuid::new_v4());
        assert!(other.map(|k| k[..] != [9u8; 32]).unwrap_or(true));
    }

    #[test]
    fn test_puk_hash_plaintext_is_utf8() {
        let c = converters(None);
        let stored = c
            .recovery_puk
            .to_storage("$argon2id$v=19$hash", puk_context(1))
            .unwrap();

        assert_eq!(stored.encryption_mode, EncryptionMode::NoEncryption);
        assert_eq!(stored.payload, b"$argon2id$v=19$hash".to_vec());
        assert_eq!(
            c.recovery_puk.from_storage(&stored, puk_context(1)).unwrap(),
            "$argon2id$v=19$hash"
        );
    }

    #[test]
    fn test_puk_hash_encrypted_is_bound_to_index() {
        let c = converters(Some(&[2u8; 16]));
        let stored = c
            .recovery_puk
            .to_storage("$argon2id$v=19$hash", puk_context(1))
            .unwrap();

        assert_eq!(stored.encryption_mode, EncryptionMode::AesHmac);
        assert_eq!(
            c.recovery_puk.from_storage(&stored, puk_context(1)).unwrap(),
            "$argon2id$v=19$hash"
        );

        let wrong = c.recovery_puk.from_storage(&stored, puk_context(2));
        assert!(wrong.map(|h| h != "$argon2id$v=19$hash").unwrap_or(true));
    }

    #[test]
    fn test_temporary_key_context_without_activation() {
        let c = converters(Some(&[3u8; 16]));
        let stored = c
            .temporary_key
            .to_storage(&[4u8; 32], "key-1", "app-key", None)
            .unwrap();

        let key = c
            .temporary_key
            .from_storage(&stored, "key-1", "app-key", None)
            .unwrap();
        assert_eq!(&key[..], &[4u8; 32]);
    }

    #[test]
    fn test_recovery_private_key_round_trip() {
        let c = converters(Some(&[5u8; 16]));
        let stored = c.recovery_private_key.to_storage(&[6u8; 32], 42).unwrap();
        assert_eq!(&c.recovery_private_key.from_storage(&stored, 42).unwrap()[..], &[6u8; 32]);
    }
}
