//! XChaCha20-Poly1305 authenticated symmetric encryption
//!
//! Ciphertext format (binary):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::WrappingKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Encrypt `plaintext` under `key` with a random nonce.
///
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub fn symmetric_encrypt(key: &WrappingKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encrypt(format!("symmetric encryption failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt the output of [`symmetric_encrypt`].
///
/// Fails closed: a wrong key, a flipped bit, or a truncated input all yield
/// [`CryptoError::Decrypt`] and no plaintext.
pub fn symmetric_decrypt(key: &WrappingKey, encrypted: &[u8]) -> CryptoResult<Vec<u8>> {
    if encrypted.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Decrypt);
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;

    fn key(fill: u8) -> WrappingKey {
        WrappingKey::from_bytes([fill; KEY_SIZE])
    }

    #[test]
    fn test_roundtrip() {
        let k = key(42);
        let encrypted = symmetric_encrypt(&k, b"private key material").unwrap();
        assert_eq!(symmetric_decrypt(&k, &encrypted).unwrap(), b"private key material");
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = symmetric_encrypt(&key(1), b"secret").unwrap();
        assert!(matches!(
            symmetric_decrypt(&key(2), &encrypted),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let k = key(7);
        let mut encrypted = symmetric_encrypt(&k, b"secret data").unwrap();
        encrypted[NONCE_SIZE + 1] ^= 0xFF;
        assert!(symmetric_decrypt(&k, &encrypted).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let k = key(7);
        assert!(symmetric_decrypt(&k, &[0u8; NONCE_SIZE + TAG_SIZE - 1]).is_err());
    }

    #[test]
    fn test_encrypted_size() {
        let encrypted = symmetric_encrypt(&key(3), &[0u8; 100]).unwrap();
        assert_eq!(encrypted.len(), NONCE_SIZE + 100 + TAG_SIZE);
    }

    #[test]
    fn test_nonces_are_random() {
        let k = key(3);
        let a = symmetric_encrypt(&k, b"same").unwrap();
        let b = symmetric_encrypt(&k, b"same").unwrap();
        assert_ne!(a, b);
    }
}
