//! Two-factor seed confidentiality
//!
//! The TOTP algorithm itself belongs to a [`TwoFactorVerifier`]; this module
//! only decides where the seed lives. A keyed user's seed is wrapped under
//! their own public key. An unkeyed user's seed is kept in clear until the
//! user gains a keypair, at which point `change_password` wraps it.

use secrecy::{ExposeSecret, SecretString};

use tipvault_core::{TipvaultError, TipvaultResult};
use tipvault_crypto::{random_base32, PrivateKey};

use crate::corrupt_key;
use crate::model::{TwoFactorSeed, User};
use crate::user::UserKeyManager;

/// Base32 characters in a fresh seed (160 bits)
pub const SEED_LEN: usize = 32;

/// Checks a submitted code against an unwrapped seed (RFC 6238, 30 s step,
/// one step of drift either way).
pub trait TwoFactorVerifier: Send + Sync {
    fn verify(&self, seed: &str, code: &str) -> bool;
}

impl<'c> UserKeyManager<'c> {
    /// Return the pending or active seed, minting one if the user has none.
    pub fn begin_two_factor_enrollment(
        &self,
        user: &mut User,
        session_key: Option<&PrivateKey>,
    ) -> TipvaultResult<SecretString> {
        if let Some(existing) = self.read_two_factor_seed(user, session_key)? {
            return Ok(existing);
        }

        let seed = SecretString::from(random_base32(SEED_LEN));
        let stored = if user.keys.is_keyed() {
            TwoFactorSeed::Wrapped {
                wrapped: self.wrap_secret_for_self(user, seed.expose_secret().as_bytes())?,
            }
        } else {
            TwoFactorSeed::Clear {
                seed: seed.expose_secret().to_string(),
            }
        };

        user.two_factor.seed = Some(stored);
        user.two_factor.enabled = false;
        tracing::info!(user_id = %user.id, "two-factor enrollment started");
        Ok(seed)
    }

    /// Turn two-factor on once the user proves they hold the seed.
    pub fn complete_two_factor_enrollment(
        &self,
        user: &mut User,
        session_key: Option<&PrivateKey>,
        code: &str,
        verifier: &dyn TwoFactorVerifier,
    ) -> TipvaultResult<()> {
        let seed = self
            .read_two_factor_seed(user, session_key)?
            .ok_or_else(|| TipvaultError::InputValidation("no two-factor enrollment in progress".into()))?;

        if !verifier.verify(seed.expose_secret(), code) {
            tracing::debug!(user_id = %user.id, "two-factor enrollment code rejected");
            return Err(TipvaultError::Authentication);
        }
        user.two_factor.enabled = true;
        tracing::info!(user_id = %user.id, "two-factor enabled");
        Ok(())
    }

    pub fn verify_two_factor(
        &self,
        user: &User,
        session_key: Option<&PrivateKey>,
        code: &str,
        verifier: &dyn TwoFactorVerifier,
    ) -> TipvaultResult<()> {
        if !user.two_factor.enabled {
            return Err(TipvaultError::InputValidation(
                "two-factor is not enabled".into(),
            ));
        }
        let seed = self
            .read_two_factor_seed(user, session_key)?
            .ok_or_else(|| TipvaultError::CorruptKey("two-factor enabled without a seed".into()))?;

        if verifier.verify(seed.expose_secret(), code) {
            Ok(())
        } else {
            tracing::debug!(user_id = %user.id, "two-factor code rejected");
            Err(TipvaultError::Authentication)
        }
    }

    pub fn disable_two_factor(&self, user: &mut User) {
        user.two_factor.enabled = false;
        user.two_factor.seed = None;
        tracing::info!(user_id = %user.id, "two-factor disabled");
    }

    /// A wrapped seed needs the owner's session key; `KeyUnavailable` without it.
    pub fn read_two_factor_seed(
        &self,
        user: &User,
        session_key: Option<&PrivateKey>,
    ) -> TipvaultResult<Option<SecretString>> {
        match &user.two_factor.seed {
            None => Ok(None),
            Some(TwoFactorSeed::Clear { seed }) => Ok(Some(SecretString::from(seed.clone()))),
            Some(TwoFactorSeed::Wrapped { wrapped }) => {
                let key = session_key.ok_or_else(|| {
                    TipvaultError::KeyUnavailable("two-factor seed is wrapped; log in first".into())
                })?;
                let bytes = self.unwrap_secret_for_self(user, key, wrapped)?;
                let seed = std::str::from_utf8(&bytes).map_err(|_| {
                    corrupt_key(
                        "two-factor seed",
                        tipvault_crypto::CryptoError::Malformed("seed is not UTF-8".into()),
                    )
                })?;
                Ok(Some(SecretString::from(seed.to_string())))
            }
        }
    }
}
