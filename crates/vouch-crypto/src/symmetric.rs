//! AES-128-CBC encryption with PKCS#7 padding.

use crate::{constants::*, errors::*, utils::random_bytes};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Encrypt data using AES-128-CBC with PKCS#7 padding
///
/// # Arguments
///
/// * `key` - 16-byte encryption key
/// * `iv` - 16-byte initialization vector (MUST be unpredictable per message)
/// * `plaintext` - Data to encrypt
///
/// # Returns
///
/// Ciphertext, always a non-empty multiple of the block size
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    check_sizes(key, iv)?;
    let cipher = Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt data using AES-128-CBC with PKCS#7 padding
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    check_sizes(key, iv)?;
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::DecryptionFailed(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            ciphertext.len()
        )));
    }
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Encrypt with a fresh random IV and return `IV || ciphertext`
pub fn aes_cbc_encrypt_with_random_iv(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let iv: [u8; AES_BLOCK_SIZE] = random_bytes()?;
    let ciphertext = aes_cbc_encrypt(key, &iv, plaintext)?;

    let mut out = Vec::with_capacity(AES_BLOCK_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn check_sizes(key: &[u8], iv: &[u8]) -> Result<()> {
    if key.len() != AES_KEY_SIZE {
        return Err(CryptoError::InvalidKeySize {
            expected: AES_KEY_SIZE,
            actual: key.len(),
        });
    }
    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::InvalidNonceSize {
            expected: AES_BLOCK_SIZE,
            actual: iv.len(),
        });
    }
    Ok(())
}
