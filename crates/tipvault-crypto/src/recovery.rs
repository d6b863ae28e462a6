//! BIP-39 recovery keys
//!
//! When a user first gets a keypair, a 24-word mnemonic is generated. It
//! unwraps the user's private key without the password. The words are shown
//! once; only wraps made with the derived key are stored.

use bip39::Mnemonic;
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::SecretString;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::WrappingKey;
use crate::KEY_SIZE;

const RECOVERY_INFO: &[u8] = b"tipvault-recovery-v1";

/// 256 bits of recovery entropy. Zeroized on drop.
#[derive(Clone)]
pub struct RecoveryKey {
    entropy: [u8; KEY_SIZE],
}

impl RecoveryKey {
    pub fn generate() -> Self {
        let mut entropy = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut entropy);
        Self { entropy }
    }

    /// Parse user-supplied words. Any failure is reported as `Malformed`
    /// without echoing the input.
    pub fn from_mnemonic(words: &str) -> CryptoResult<Self> {
        let normalized = words.split_whitespace().collect::<Vec<_>>().join(" ");
        let mnemonic: Mnemonic = normalized
            .parse()
            .map_err(|_| CryptoError::Malformed("invalid recovery key".into()))?;

        let mut raw = mnemonic.to_entropy();
        let result = Self::from_entropy_slice(&raw);
        raw.zeroize();
        result
    }

    pub fn from_entropy_slice(raw: &[u8]) -> CryptoResult<Self> {
        if raw.len() != KEY_SIZE {
            return Err(CryptoError::Malformed(format!(
                "recovery key has wrong size: {} bytes (expected {KEY_SIZE})",
                raw.len()
            )));
        }
        let mut entropy = [0u8; KEY_SIZE];
        entropy.copy_from_slice(raw);
        Ok(Self { entropy })
    }

    pub fn entropy(&self) -> &[u8; KEY_SIZE] {
        &self.entropy
    }

    /// The 24 words to display. Never persist this.
    pub fn to_mnemonic(&self) -> CryptoResult<SecretString> {
        let mnemonic = Mnemonic::from_entropy(&self.entropy)
            .map_err(|e| CryptoError::Malformed(format!("BIP-39 encoding failed: {e}")))?;
        Ok(SecretString::from(mnemonic.to_string()))
    }

    /// Symmetric key for the private-key backup wrap.
    ///
    /// No Argon2 here: the input already carries 256 bits of entropy.
    pub fn wrapping_key(&self) -> CryptoResult<WrappingKey> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.entropy);
        let mut okm = [0u8; KEY_SIZE];
        hkdf.expand(RECOVERY_INFO, &mut okm)
            .map_err(|e| CryptoError::Kdf(format!("HKDF expand failed: {e}")))?;
        Ok(WrappingKey::from_bytes(okm))
    }
}

impl Drop for RecoveryKey {
    fn drop(&mut self) {
        self.entropy.zeroize();
    }
}

impl std::fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryKey")
            .field("entropy", &"[REDACTED]")
            .finish()
    }
}
