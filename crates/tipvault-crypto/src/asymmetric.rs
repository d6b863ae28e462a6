//! Public-key authenticated encryption over age X25519 recipients
//!
//! Public keys travel as `age1…` text, private keys as `AGE-SECRET-KEY-1…`
//! text. Ciphertexts are binary age files: an X25519 stanza carrying a
//! random file key, followed by a ChaCha20-Poly1305 STREAM payload, so a
//! wrong key or a flipped bit fails before any plaintext is released.

use std::fmt;
use std::str::FromStr;

use age::x25519;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};

/// A validated age X25519 public key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(String);

impl PublicKey {
    pub fn parse(encoded: &str) -> CryptoResult<Self> {
        let encoded = encoded.trim();
        x25519::Recipient::from_str(encoded)
            .map_err(|e| CryptoError::Malformed(format!("invalid public key: {e}")))?;
        Ok(Self(encoded.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn recipient(&self) -> CryptoResult<x25519::Recipient> {
        x25519::Recipient::from_str(&self.0)
            .map_err(|e| CryptoError::Malformed(format!("invalid public key: {e}")))
    }
}

impl TryFrom<String> for PublicKey {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.0).finish()
    }
}

/// An unwrapped age X25519 private key. Never serialized directly.
#[derive(Clone)]
pub struct PrivateKey {
    identity: x25519::Identity,
}

impl PrivateKey {
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.identity.to_public().to_string())
    }

    /// Encoded form used as the plaintext of a wrap.
    pub fn to_secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.identity.to_string().expose_secret().as_bytes().to_vec())
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let encoded = std::str::from_utf8(bytes)
            .map_err(|_| CryptoError::Malformed("private key is not UTF-8".into()))?;
        let identity = x25519::Identity::from_str(encoded.trim())
            .map_err(|e| CryptoError::Malformed(format!("invalid private key: {e}")))?;
        Ok(Self { identity })
    }

    /// Constant-time equality of two private keys.
    pub fn same_key_as(&self, other: &PrivateKey) -> bool {
        self.to_secret_bytes()
            .as_slice()
            .ct_eq(other.to_secret_bytes().as_slice())
            .into()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("public", &self.public_key().as_str())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// A freshly generated keypair. The owner must wrap `private_key` before persisting anything.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

pub fn generate_keypair() -> KeyPair {
    let private_key = PrivateKey {
        identity: x25519::Identity::generate(),
    };
    KeyPair {
        public_key: private_key.public_key(),
        private_key,
    }
}

/// Seal `plaintext` so that only the holder of the matching private key can open it.
pub fn asymmetric_encrypt(public_key: &PublicKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let recipient = public_key.recipient()?;
    age::encrypt(&recipient, plaintext)
        .map_err(|e| CryptoError::Encrypt(format!("age encryption failed: {e}")))
}

/// Open a ciphertext produced by [`asymmetric_encrypt`]. Fails closed.
pub fn asymmetric_decrypt(private_key: &PrivateKey, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    age::decrypt(&private_key.identity, ciphertext).map_err(|e| {
        tracing::debug!(error = %e, "age decryption rejected ciphertext");
        CryptoError::Decrypt
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let kp = generate_keypair();
        let sealed = asymmetric_encrypt(&kp.public_key, b"hello").unwrap();
        assert_eq!(asymmetric_decrypt(&kp.private_key, &sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_unrelated_key_fails() {
        let owner = generate_keypair();
        let stranger = generate_keypair();
        let sealed = asymmetric_encrypt(&owner.public_key, b"hello").unwrap();
        assert!(matches!(
            asymmetric_decrypt(&stranger.private_key, &sealed),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let kp = generate_keypair();
        let mut sealed = asymmetric_encrypt(&kp.public_key, b"some longer payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(asymmetric_decrypt(&kp.private_key, &sealed).is_err());
    }

    #[test]
    fn test_garbage_fails() {
        let kp = generate_keypair();
        assert!(asymmetric_decrypt(&kp.private_key, b"definitely not age").is_err());
    }

    #[test]
    fn test_private_key_encoding_roundtrip() {
        let kp = generate_keypair();
        let bytes = kp.private_key.to_secret_bytes();
        let restored = PrivateKey::from_secret_bytes(&bytes).unwrap();
        assert!(restored.same_key_as(&kp.private_key));
        assert_eq!(restored.public_key(), kp.public_key);
    }

    #[test]
    fn test_public_key_validation() {
        let kp = generate_keypair();
        assert!(PublicKey::parse(kp.public_key.as_str()).is_ok());
        assert!(matches!(
            PublicKey::parse("age1notakey"),
            Err(CryptoError::Malformed(_))
        ));
        assert!(serde_json::from_str::<PublicKey>("\"bogus\"").is_err());
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let kp = generate_keypair();
        let rendered = format!("{:?}", kp.private_key);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("AGE-SECRET-KEY"));
    }
}
