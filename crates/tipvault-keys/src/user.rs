//! User key lifecycle: keypair minting, password wrapping, re-keying on
//! password change, recovery-key issuance and redemption.
//!
//! Every mutating operation computes the complete new state first and only
//! then writes it into the `&mut User`, so an error leaves the record as it
//! was. Persisting the record is the caller's job.

use secrecy::SecretString;
use zeroize::Zeroizing;

use tipvault_core::{TipvaultError, TipvaultResult, UserId};
use tipvault_crypto::{
    derive_key, generate_keypair, generate_salt, hash_password, unwrap_under_private_key,
    unwrap_under_symmetric_key, verify_password, wrap_under_public_key, wrap_under_symmetric_key,
    KeyReference, PrivateKey, PublicKey, RecoveryKey, WrappedKey, SALT_SIZE,
};

use crate::context::KeyContext;
use crate::model::{
    LoginCredential, RecoveryWraps, TwoFactorSeed, User, UserKeys, UserRole,
};
use crate::{corrupt_key, crypto_error, unix_now};

/// Secrets released by an operation that (re)keys a user.
///
/// `recovery_key` is present only when a keypair was minted; it must be shown
/// to the user once and never persisted.
#[derive(Debug, Default)]
pub struct PasswordChange {
    pub recovery_key: Option<SecretString>,
    pub private_key: Option<PrivateKey>,
}

#[derive(Debug)]
pub struct CreatedUser {
    pub user: User,
    pub recovery_key: Option<SecretString>,
    pub private_key: Option<PrivateKey>,
}

struct MintedKeys {
    keys: UserKeys,
    private_key: PrivateKey,
    recovery_key: SecretString,
}

pub struct UserKeyManager<'c> {
    pub(crate) ctx: &'c KeyContext,
}

impl<'c> UserKeyManager<'c> {
    pub fn new(ctx: &'c KeyContext) -> Self {
        Self { ctx }
    }

    /// Create a user with a real password. Under an encryption-enabled tenant
    /// the user is keyed immediately and the recovery key is released once.
    pub fn create_user(
        &self,
        username: &str,
        role: UserRole,
        password: &SecretString,
    ) -> TipvaultResult<CreatedUser> {
        let username = validate_username(username)?;
        let salt = generate_salt();
        let hash = hash_password(password, &salt, &self.ctx.kdf).map_err(crypto_error)?;

        let (keys, recovery_key, private_key) = if self.ctx.tenant.encryption {
            let minted = self.mint_keys(password, &salt)?;
            (minted.keys, Some(minted.recovery_key), Some(minted.private_key))
        } else {
            (UserKeys::Unkeyed, None, None)
        };

        let user = User {
            id: UserId::generate(),
            username,
            role,
            credential: LoginCredential { hash, salt },
            password_change_needed: false,
            password_change_date: unix_now(),
            keys,
            two_factor: Default::default(),
            pgp: None,
        };

        tracing::info!(user_id = %user.id, keyed = user.keys.is_keyed(), "created user");
        Ok(CreatedUser {
            user,
            recovery_key,
            private_key,
        })
    }

    /// Create an unkeyed user with a login hash only. Keys are minted at the
    /// first real password set.
    pub fn provision_user(
        &self,
        username: &str,
        role: UserRole,
        password: &SecretString,
        password_change_needed: bool,
    ) -> TipvaultResult<User> {
        let username = validate_username(username)?;
        let salt = generate_salt();
        let hash = hash_password(password, &salt, &self.ctx.kdf).map_err(crypto_error)?;

        let user = User {
            id: UserId::generate(),
            username,
            role,
            credential: LoginCredential { hash, salt },
            password_change_needed,
            password_change_date: 0,
            keys: UserKeys::Unkeyed,
            two_factor: Default::default(),
            pgp: None,
        };
        tracing::info!(user_id = %user.id, "provisioned unkeyed user");
        Ok(user)
    }

    /// Check a login password. Returns the unwrapped private key for a keyed
    /// user, `None` for an unkeyed one.
    pub fn authenticate(
        &self,
        user: &User,
        password: &SecretString,
    ) -> TipvaultResult<Option<PrivateKey>> {
        self.verify_login(user, password)?;
        match &user.keys {
            UserKeys::Unkeyed => Ok(None),
            UserKeys::Keyed { .. } => self.unwrap_with_password(user, password).map(Some),
        }
    }

    pub fn unwrap_private_key(
        &self,
        user: &User,
        password: &SecretString,
    ) -> TipvaultResult<PrivateKey> {
        self.authenticate(user, password)?
            .ok_or_else(|| TipvaultError::KeyUnavailable(format!("user {} has no keypair", user.id)))
    }

    /// Set a new password.
    ///
    /// `old_password` is required unless the one-time change-needed flag is
    /// set. A keyed user's private key comes from the verified old password
    /// or from `session_key`; without either the change fails with
    /// `KeyUnavailable`. An unkeyed user under an encryption-enabled tenant
    /// gets a keypair here, and a clear two-factor seed is wrapped under it.
    pub fn change_password(
        &self,
        user: &mut User,
        old_password: Option<&SecretString>,
        new_password: &SecretString,
        session_key: Option<&PrivateKey>,
    ) -> TipvaultResult<PasswordChange> {
        let old_verified = match old_password {
            Some(old) => {
                self.verify_login(user, old)?;
                Some(old)
            }
            None if user.password_change_needed => {
                tracing::info!(user_id = %user.id, "password set through the one-time change flag");
                None
            }
            None => {
                tracing::debug!(user_id = %user.id, "password change without old password refused");
                return Err(TipvaultError::Authentication);
            }
        };

        self.reject_reuse(user, new_password)?;

        let salt = generate_salt();
        let hash = hash_password(new_password, &salt, &self.ctx.kdf).map_err(crypto_error)?;

        let mut change = PasswordChange::default();
        let mut seed = user.two_factor.seed.clone();

        let keys = match &user.keys {
            UserKeys::Keyed {
                public_key,
                recovery,
                ..
            } => {
                let private_key = match (session_key, old_verified) {
                    (Some(key), _) => {
                        check_session_key(user, key)?;
                        key.clone()
                    }
                    (None, Some(old)) => self.unwrap_with_password(user, old)?,
                    (None, None) => {
                        return Err(TipvaultError::KeyUnavailable(
                            "re-wrapping requires the old password or a live session".into(),
                        ))
                    }
                };
                let wrapped_private_key = self.wrap_for_password(new_password, &salt, &private_key)?;
                change.private_key = Some(private_key);
                UserKeys::Keyed {
                    public_key: public_key.clone(),
                    wrapped_private_key,
                    recovery: recovery.clone(),
                }
            }
            UserKeys::Unkeyed if self.ctx.tenant.encryption => {
                let minted = self.mint_keys(new_password, &salt)?;
                if let Some(TwoFactorSeed::Clear { seed: clear }) = &seed {
                    let public_key = minted.private_key.public_key();
                    let wrapped = wrap_under_public_key(&public_key, clear.as_bytes())
                        .map_err(crypto_error)?;
                    seed = Some(TwoFactorSeed::Wrapped { wrapped });
                    tracing::info!(user_id = %user.id, "two-factor seed migrated to wrapped form");
                }
                change.private_key = Some(minted.private_key);
                change.recovery_key = Some(minted.recovery_key);
                minted.keys
            }
            UserKeys::Unkeyed => UserKeys::Unkeyed,
        };

        let gained_keys = !user.keys.is_keyed() && keys.is_keyed();

        user.credential = LoginCredential { hash, salt };
        user.keys = keys;
        user.two_factor.seed = seed;
        user.password_change_needed = false;
        user.password_change_date = unix_now();

        tracing::info!(user_id = %user.id, gained_keys, "password changed");
        Ok(change)
    }

    /// Unwrap the private key with the recovery key alone.
    ///
    /// Every failure short of corruption is `Authentication`, whether the
    /// words did not parse, the user has no recovery wrap, or the key is wrong.
    pub fn redeem_recovery_key(
        &self,
        user: &User,
        recovery_key: &SecretString,
    ) -> TipvaultResult<PrivateKey> {
        use secrecy::ExposeSecret;

        let (public_key, backup) = match &user.keys {
            UserKeys::Keyed {
                public_key,
                recovery: Some(recovery),
                ..
            } => (public_key, &recovery.backup),
            _ => {
                tracing::debug!(user_id = %user.id, "recovery attempted on user without recovery wrap");
                return Err(TipvaultError::Authentication);
            }
        };

        let key = RecoveryKey::from_mnemonic(recovery_key.expose_secret()).map_err(|_| {
            tracing::debug!(user_id = %user.id, "unparsable recovery key");
            TipvaultError::Authentication
        })?;
        let wrapping_key = key.wrapping_key().map_err(crypto_error)?;
        let secret = unwrap_under_symmetric_key(&wrapping_key, backup).map_err(|_| {
            tracing::warn!(user_id = %user.id, "recovery key rejected");
            TipvaultError::Authentication
        })?;

        decode_private_key(&secret, public_key, "recovery backup")
    }

    /// Redeem the recovery key, then set `new_password` without the old one.
    pub fn reset_password_with_recovery(
        &self,
        user: &mut User,
        recovery_key: &SecretString,
        new_password: &SecretString,
    ) -> TipvaultResult<PasswordChange> {
        let private_key = self.redeem_recovery_key(user, recovery_key)?;
        self.reject_reuse(user, new_password)?;

        let salt = generate_salt();
        let hash = hash_password(new_password, &salt, &self.ctx.kdf).map_err(crypto_error)?;
        let wrapped_private_key = self.wrap_for_password(new_password, &salt, &private_key)?;

        let keys = match &user.keys {
            UserKeys::Keyed {
                public_key,
                recovery,
                ..
            } => UserKeys::Keyed {
                public_key: public_key.clone(),
                wrapped_private_key,
                recovery: recovery.clone(),
            },
            UserKeys::Unkeyed => return Err(TipvaultError::Authentication),
        };

        user.credential = LoginCredential { hash, salt };
        user.keys = keys;
        user.password_change_needed = false;
        user.password_change_date = unix_now();

        tracing::info!(user_id = %user.id, "password reset with recovery key");
        Ok(PasswordChange {
            recovery_key: None,
            private_key: Some(private_key),
        })
    }

    /// Redisplay the recovery key to its logged-in owner.
    pub fn get_recovery_key(
        &self,
        user: &User,
        session_key: &PrivateKey,
    ) -> TipvaultResult<Option<SecretString>> {
        let escrow = match &user.keys {
            UserKeys::Keyed {
                recovery: Some(recovery),
                ..
            } => &recovery.escrow,
            _ => return Ok(None),
        };
        check_session_key(user, session_key)?;

        let entropy = unwrap_under_private_key(session_key, escrow)
            .map_err(|e| corrupt_key("recovery escrow", e))?;
        let key = RecoveryKey::from_entropy_slice(&entropy)
            .map_err(|e| corrupt_key("recovery escrow", e))?;
        key.to_mnemonic().map(Some).map_err(crypto_error)
    }

    /// Seal a small secret (e.g. the two-factor seed) under the user's own public key.
    pub fn wrap_secret_for_self(&self, user: &User, secret: &[u8]) -> TipvaultResult<WrappedKey> {
        let public_key = user.public_key().ok_or_else(|| {
            TipvaultError::KeyUnavailable(format!("user {} has no keypair", user.id))
        })?;
        wrap_under_public_key(public_key, secret).map_err(crypto_error)
    }

    pub fn unwrap_secret_for_self(
        &self,
        user: &User,
        session_key: &PrivateKey,
        wrapped: &WrappedKey,
    ) -> TipvaultResult<Zeroizing<Vec<u8>>> {
        check_session_key(user, session_key)?;
        unwrap_under_private_key(session_key, wrapped).map_err(|e| corrupt_key("self-wrapped secret", e))
    }

    /// Administrative password set. Refused for keyed users, whose wrap would
    /// be orphaned; arms the one-time change flag otherwise.
    pub fn admin_set_password(&self, user: &mut User, password: &SecretString) -> TipvaultResult<()> {
        if user.keys.is_keyed() {
            return Err(TipvaultError::InputValidation(format!(
                "user {} has encryption keys; only the user or a recovery key can change the password",
                user.id
            )));
        }
        let salt = generate_salt();
        let hash = hash_password(password, &salt, &self.ctx.kdf).map_err(crypto_error)?;

        user.credential = LoginCredential { hash, salt };
        user.password_change_needed = true;
        tracing::info!(user_id = %user.id, "administrative password set");
        Ok(())
    }

    /// Re-arm the one-time password-change flag.
    pub fn require_password_change(&self, user: &mut User) {
        user.password_change_needed = true;
    }

    fn verify_login(&self, user: &User, password: &SecretString) -> TipvaultResult<()> {
        let ok = verify_password(
            password,
            &user.credential.salt,
            &self.ctx.kdf,
            &user.credential.hash,
        )
        .map_err(crypto_error)?;
        if ok {
            Ok(())
        } else {
            tracing::debug!(user_id = %user.id, "password verification failed");
            Err(TipvaultError::Authentication)
        }
    }

    fn reject_reuse(&self, user: &User, new_password: &SecretString) -> TipvaultResult<()> {
        let same = verify_password(
            new_password,
            &user.credential.salt,
            &self.ctx.kdf,
            &user.credential.hash,
        )
        .map_err(crypto_error)?;
        if same {
            Err(TipvaultError::PasswordReuse)
        } else {
            Ok(())
        }
    }

    /// Unwrap after the password was verified: any failure here is corruption.
    fn unwrap_with_password(&self, user: &User, password: &SecretString) -> TipvaultResult<PrivateKey> {
        let (public_key, wrapped) = match &user.keys {
            UserKeys::Keyed {
                public_key,
                wrapped_private_key,
                ..
            } => (public_key, wrapped_private_key),
            UserKeys::Unkeyed => {
                return Err(TipvaultError::KeyUnavailable(format!(
                    "user {} has no keypair",
                    user.id
                )))
            }
        };

        let key = derive_key(password, &user.credential.salt, &self.ctx.kdf).map_err(crypto_error)?;
        let secret = unwrap_under_symmetric_key(&key, wrapped)
            .map_err(|e| corrupt_key("password wrap", e))?;
        decode_private_key(&secret, public_key, "password wrap")
    }

    fn wrap_for_password(
        &self,
        password: &SecretString,
        salt: &[u8; SALT_SIZE],
        private_key: &PrivateKey,
    ) -> TipvaultResult<WrappedKey> {
        let key = derive_key(password, salt, &self.ctx.kdf).map_err(crypto_error)?;
        wrap_under_symmetric_key(&key, KeyReference::Password, &private_key.to_secret_bytes())
            .map_err(crypto_error)
    }

    fn mint_keys(&self, password: &SecretString, salt: &[u8; SALT_SIZE]) -> TipvaultResult<MintedKeys> {
        let keypair = generate_keypair();
        let wrapped_private_key = self.wrap_for_password(password, salt, &keypair.private_key)?;

        let recovery = RecoveryKey::generate();
        let backup = wrap_under_symmetric_key(
            &recovery.wrapping_key().map_err(crypto_error)?,
            KeyReference::RecoveryKey,
            &keypair.private_key.to_secret_bytes(),
        )
        .map_err(crypto_error)?;
        let escrow =
            wrap_under_public_key(&keypair.public_key, recovery.entropy()).map_err(crypto_error)?;
        let recovery_key = recovery.to_mnemonic().map_err(crypto_error)?;

        Ok(MintedKeys {
            keys: UserKeys::Keyed {
                public_key: keypair.public_key,
                wrapped_private_key,
                recovery: Some(RecoveryWraps { backup, escrow }),
            },
            private_key: keypair.private_key,
            recovery_key,
        })
    }
}

/// A session key must be the private half of the user's stored public key.
pub(crate) fn check_session_key(user: &User, key: &PrivateKey) -> TipvaultResult<()> {
    match user.public_key() {
        Some(public_key) if *public_key == key.public_key() => Ok(()),
        Some(_) => Err(TipvaultError::KeyUnavailable(format!(
            "session key does not belong to user {}",
            user.id
        ))),
        None => Err(TipvaultError::KeyUnavailable(format!(
            "user {} has no keypair",
            user.id
        ))),
    }
}

fn decode_private_key(secret: &[u8], expected: &PublicKey, what: &str) -> TipvaultResult<PrivateKey> {
    let key = PrivateKey::from_secret_bytes(secret).map_err(|e| corrupt_key(what, e))?;
    if key.public_key() != *expected {
        tracing::error!(what, "unwrapped private key does not match the stored public key");
        return Err(TipvaultError::CorruptKey(format!(
            "{what}: private key does not match public key"
        )));
    }
    Ok(key)
}

fn validate_username(username: &str) -> TipvaultResult<String> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(TipvaultError::InputValidation("username must not be empty".into()));
    }
    Ok(trimmed.to_string())
}
