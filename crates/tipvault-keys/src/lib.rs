//! tipvault-keys: the confidentiality engine
//!
//! - [`user::UserKeyManager`]: password wrapping, password change, recovery
//! - [`tip::TipKeyManager`]: per-submission keypairs and per-receiver fan-out
//! - [`session::SessionKeyCache`]: unwrapped user keys for live sessions
//! - [`service::KeyService`]: async facade running KDF work on a bounded pool
//!
//! Managers never persist anything themselves; callers load and save records
//! through a [`store::KeyStore`].

pub mod context;
mod locks;
pub mod model;
pub mod pgp;
pub mod reconcile;
pub mod service;
pub mod session;
pub mod store;
pub mod tip;
pub mod two_factor;
pub mod user;

pub use context::KeyContext;
pub use model::{
    FileRecord, InternalTip, LoginCredential, RecoveryWraps, SealedField, TipEncryption,
    TwoFactor, TwoFactorSeed, User, UserKeys, UserRole,
};
pub use pgp::{apply_pgp_options, encrypt_for_pgp_receiver, ImportedKey, PgpCollaborator, PgpKeyInfo};
pub use reconcile::{reconcile, FanOutReport};
pub use service::{CreatedAccount, KeyService, Login, PasswordChanged};
pub use session::{SessionKey, SessionKeyCache};
pub use store::{JsonFileStore, KeyStore, MemoryStore};
pub use tip::{CreatedTipKeys, FileMetadata, TipKeyManager};
pub use two_factor::TwoFactorVerifier;
pub use user::{CreatedUser, PasswordChange, UserKeyManager};

use tipvault_core::TipvaultError;
use tipvault_crypto::CryptoError;

/// An authenticated unwrap failed although the caller proved it holds the
/// right secret. Always logged for operators before it propagates.
pub(crate) fn corrupt_key(what: &str, err: CryptoError) -> TipvaultError {
    tracing::error!(what, error = %err, "wrapped key failed authentication after a verified unlock");
    TipvaultError::CorruptKey(format!("{what}: {err}"))
}

/// Failures of primitives that are neither authentication nor corruption.
pub(crate) fn crypto_error(err: CryptoError) -> TipvaultError {
    match err {
        CryptoError::Malformed(msg) => TipvaultError::InputValidation(msg),
        other => TipvaultError::Crypto(other.to_string()),
    }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
