//! Key derivation: Argon2id password → wrapping key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::{KEY_SIZE, SALT_SIZE};

/// Domain tag mixed into the KDF salt so the wrapping key never equals the login hash.
const KDF_SALT_DOMAIN: &[u8] = b"tipvault-kdf-v1";

/// A 256-bit symmetric key used to wrap a private key.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct WrappingKey {
    bytes: [u8; KEY_SIZE],
}

impl WrappingKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for WrappingKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters, shared by the login hash and the wrapping KDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and benchmarks. Never use for real passwords.
    pub fn insecure_fast() -> Self {
        Self {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    pub(crate) fn argon2(&self) -> CryptoResult<Argon2<'static>> {
        let params = Params::new(
            self.mem_cost_kib,
            self.time_cost,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Derive a 256-bit wrapping key from a password and the user's salt using Argon2id.
///
/// The salt is first bound to a KDF-only domain, so this output is unrelated
/// to the login hash computed from the same password and salt.
pub fn derive_key(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> CryptoResult<WrappingKey> {
    let kdf_salt = domain_salt(salt);

    let mut key = [0u8; KEY_SIZE];
    params
        .argon2()?
        .hash_password_into(password.expose_secret().as_bytes(), &kdf_salt, &mut key)
        .map_err(|e| CryptoError::Kdf(format!("Argon2id KDF failed: {e}")))?;

    Ok(WrappingKey::from_bytes(key))
}

fn domain_salt(salt: &[u8; SALT_SIZE]) -> [u8; SALT_SIZE] {
    let digest = Sha256::new()
        .chain_update(KDF_SALT_DOMAIN)
        .chain_update(salt)
        .finalize();
    let mut out = [0u8; SALT_SIZE];
    out.copy_from_slice(&digest[..SALT_SIZE]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::hash_password;
    use secrecy::SecretString;

    #[test]
    fn test_kdf_deterministic() {
        let password = SecretString::from("test-passphrase-123");
        let salt = [1u8; SALT_SIZE];
        let params = KdfParams::insecure_fast();

        let key1 = derive_key(&password, &salt, &params).unwrap();
        let key2 = derive_key(&password, &salt, &params).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_passwords() {
        let salt = [1u8; SALT_SIZE];
        let params = KdfParams::insecure_fast();

        let key1 = derive_key(&SecretString::from("password-a"), &salt, &params).unwrap();
        let key2 = derive_key(&SecretString::from("password-b"), &salt, &params).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let password = SecretString::from("same-password");
        let params = KdfParams::insecure_fast();

        let key1 = derive_key(&password, &[1u8; SALT_SIZE], &params).unwrap();
        let key2 = derive_key(&password, &[2u8; SALT_SIZE], &params).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_wrapping_key_differs_from_login_hash() {
        let password = SecretString::from("correct-horse-battery");
        let salt = [7u8; SALT_SIZE];
        let params = KdfParams::insecure_fast();

        let key = derive_key(&password, &salt, &params).unwrap();
        let login = hash_password(&password, &salt, &params).unwrap();

        assert_ne!(
            key.as_bytes().as_slice(),
            login.to_bytes().unwrap().as_slice(),
            "login hash and wrapping key must live in separate domains"
        );
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = WrappingKey::from_bytes([9u8; KEY_SIZE]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains('9'));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = KdfParams {
            mem_cost_kib: 1,
            time_cost: 0,
            parallelism: 0,
        };
        let result = derive_key(&SecretString::from("pw"), &[0u8; SALT_SIZE], &params);
        assert!(matches!(result, Err(CryptoError::Kdf(_))));
    }
}
