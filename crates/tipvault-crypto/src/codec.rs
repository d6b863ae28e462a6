//! Wrapped secrets and the one framing every wrap goes through
//!
//! Both managers store small secrets (private keys, the recovery key, the
//! two-factor seed) as a [`WrappedKey`]. Routing every wrap through these four
//! functions keeps the on-disk framing identical across call sites.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::asymmetric::{asymmetric_decrypt, asymmetric_encrypt, PrivateKey, PublicKey};
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::WrappingKey;
use crate::symmetric::{symmetric_decrypt, symmetric_encrypt};

/// Which key can open a [`WrappedKey`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum KeyReference {
    /// Key derived from the holder's password via the KDF
    Password,
    /// Key derived from the holder's recovery key
    RecoveryKey,
    /// The private half of this public key
    PublicKey(PublicKey),
}

/// A secret encrypted so only the holder of `wrapped_under` can recover it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub wrapped_under: KeyReference,
}

pub fn wrap_under_public_key(holder: &PublicKey, secret: &[u8]) -> CryptoResult<WrappedKey> {
    Ok(WrappedKey {
        ciphertext: asymmetric_encrypt(holder, secret)?,
        wrapped_under: KeyReference::PublicKey(holder.clone()),
    })
}

/// Open a public-key wrap. A wrap addressed to a different public key is
/// rejected without attempting decryption.
pub fn unwrap_under_private_key(
    holder: &PrivateKey,
    wrapped: &WrappedKey,
) -> CryptoResult<Zeroizing<Vec<u8>>> {
    match &wrapped.wrapped_under {
        KeyReference::PublicKey(target) if *target == holder.public_key() => {
            asymmetric_decrypt(holder, &wrapped.ciphertext).map(Zeroizing::new)
        }
        KeyReference::PublicKey(_) => Err(CryptoError::Decrypt),
        other => Err(CryptoError::Malformed(format!(
            "expected a public-key wrap, found {other:?}"
        ))),
    }
}

/// Wrap under a symmetric key. `reference` must be `Password` or `RecoveryKey`.
pub fn wrap_under_symmetric_key(
    key: &WrappingKey,
    reference: KeyReference,
    secret: &[u8],
) -> CryptoResult<WrappedKey> {
    if matches!(reference, KeyReference::PublicKey(_)) {
        return Err(CryptoError::Malformed(
            "symmetric wraps cannot reference a public key".into(),
        ));
    }
    Ok(WrappedKey {
        ciphertext: symmetric_encrypt(key, secret)?,
        wrapped_under: reference,
    })
}

pub fn unwrap_under_symmetric_key(
    key: &WrappingKey,
    wrapped: &WrappedKey,
) -> CryptoResult<Zeroizing<Vec<u8>>> {
    if matches!(wrapped.wrapped_under, KeyReference::PublicKey(_)) {
        return Err(CryptoError::Malformed(
            "expected a symmetric wrap, found a public-key wrap".into(),
        ));
    }
    symmetric_decrypt(key, &wrapped.ciphertext).map(Zeroizing::new)
}


#[cfg(test)]
mod proptest_suite {
    use super::*;
    use crate::asymmetric::generate_keypair;
    use crate::kdf::{derive_key, KdfParams};
    use proptest::prelude::*;
    use secrecy::SecretString;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn password_wrap_roundtrip(
            password in "[ -~]{1,32}",
            salt in any::<[u8; 16]>(),
            secret in proptest::collection::vec(any::<u8>(), 0..=256),
        ) {
            let password = SecretString::from(password);
            let params = KdfParams::insecure_fast();
            let key = derive_key(&password, &salt, &params).unwrap();
            let wrapped = wrap_under_symmetric_key(&key, KeyReference::Password, &secret).unwrap();

            let again = derive_key(&password, &salt, &params).unwrap();
            let opened = unwrap_under_symmetric_key(&again, &wrapped).unwrap();
            prop_assert_eq!(opened.as_slice(), secret.as_slice());
        }

        #[test]
        fn wrong_password_fails_closed(
            password in "[a-z]{4,16}",
            other in "[A-Z]{4,16}",
            secret in proptest::collection::vec(any::<u8>(), 1..=64),
        ) {
            let params = KdfParams::insecure_fast();
            let salt = [9u8; 16];
            let key = derive_key(&SecretString::from(password), &salt, &params).unwrap();
            let wrong = derive_key(&SecretString::from(other), &salt, &params).unwrap();
            let wrapped = wrap_under_symmetric_key(&key, KeyReference::Password, &secret).unwrap();

            prop_assert!(matches!(
                unwrap_under_symmetric_key(&wrong, &wrapped),
                Err(CryptoError::Decrypt)
            ));
        }

        #[test]
        fn wrong_private_key_fails_closed(secret in proptest::collection::vec(any::<u8>(), 0..=128)) {
            let owner = generate_keypair();
            let stranger = generate_keypair();
            let sealed = asymmetric_encrypt(&owner.public_key, &secret).unwrap();

            prop_assert!(asymmetric_decrypt(&stranger.private_key, &sealed).is_err());
            prop_assert_eq!(asymmetric_decrypt(&owner.private_key, &sealed).unwrap(), secret);
        }
    }
}
