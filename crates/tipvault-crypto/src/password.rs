//! Login password hashing (Argon2id), verified in constant time

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::encoding::{base64_decode, base64_encode};
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::KdfParams;
use crate::{KEY_SIZE, SALT_SIZE};

/// Base64 text of a 256-bit Argon2id login hash.
///
/// Used only to check a login; never as key material. There is no
/// `PartialEq`: comparisons go through [`PasswordHash::ct_matches`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PasswordHash(String);

impl PasswordHash {
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        base64_decode(&self.0)
    }

    /// Constant-time comparison of two stored hashes.
    pub fn ct_matches(&self, other: &PasswordHash) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl std::fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PasswordHash").field(&"[REDACTED]").finish()
    }
}

/// Hash a password for login verification. Deterministic given (password, salt, params).
pub fn hash_password(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> CryptoResult<PasswordHash> {
    let mut out = [0u8; KEY_SIZE];
    params
        .argon2()?
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut out)
        .map_err(|e| CryptoError::Kdf(format!("Argon2id password hash failed: {e}")))?;

    Ok(PasswordHash(base64_encode(&out)))
}

/// Recompute the hash of `password` and compare it against `expected` in constant time.
pub fn verify_password(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
    expected: &PasswordHash,
) -> CryptoResult<bool> {
    let candidate = hash_password(password, salt, params)?;
    Ok(candidate.ct_matches(expected))
}
