//! External PGP envelope for receivers who opted into it
//!
//! Orthogonal to the native key hierarchy: the collaborator parses keys and
//! encrypts bytes, this module only keeps the per-user record consistent.

use serde::{Deserialize, Serialize};

use tipvault_core::{TipvaultError, TipvaultResult};

use crate::model::User;
use crate::unix_now;

/// What the collaborator reports for a successfully parsed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedKey {
    pub fingerprint: String,
    /// Unix seconds; `None` for keys without expiry
    pub expires_at: Option<u64>,
}

pub trait PgpCollaborator: Send + Sync {
    /// Parse armored key material. Unparsable input is `InputValidation`.
    fn import_key(&self, armored: &str) -> TipvaultResult<ImportedKey>;

    fn encrypt_bytes(&self, fingerprint: &str, plaintext: &[u8]) -> TipvaultResult<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgpKeyInfo {
    pub fingerprint: String,
    pub expires_at: Option<u64>,
    pub armored: String,
}

impl PgpKeyInfo {
    pub fn is_expired_at(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Import a new key, or clear the record when `remove` is set.
pub fn apply_pgp_options(
    user: &mut User,
    pgp: &dyn PgpCollaborator,
    armored: Option<&str>,
    remove: bool,
) -> TipvaultResult<()> {
    if remove {
        if user.pgp.take().is_some() {
            tracing::info!(user_id = %user.id, "PGP key removed");
        }
        return Ok(());
    }

    let Some(armored) = armored.map(str::trim).filter(|a| !a.is_empty()) else {
        return Ok(());
    };

    let imported = pgp.import_key(armored)?;
    let info = PgpKeyInfo {
        fingerprint: imported.fingerprint,
        expires_at: imported.expires_at,
        armored: armored.to_string(),
    };
    if info.is_expired_at(unix_now()) {
        return Err(TipvaultError::InputValidation(format!(
            "PGP key {} has expired",
            info.fingerprint
        )));
    }

    tracing::info!(user_id = %user.id, fingerprint = %info.fingerprint, "PGP key imported");
    user.pgp = Some(info);
    Ok(())
}

/// Encrypt attachment metadata for a receiver's PGP key.
pub fn encrypt_for_pgp_receiver(
    pgp: &dyn PgpCollaborator,
    user: &User,
    plaintext: &[u8],
) -> TipvaultResult<Vec<u8>> {
    let info = user.pgp.as_ref().ok_or_else(|| {
        TipvaultError::InputValidation(format!("user {} has no PGP key", user.id))
    })?;
    if info.is_expired_at(unix_now()) {
        return Err(TipvaultError::InputValidation(format!(
            "PGP key {} has expired",
            info.fingerprint
        )));
    }
    pgp.encrypt_bytes(&info.fingerprint, plaintext)
}
