//! Persisted records: users and submissions
//!
//! Encryption state is an explicit tagged type on each record, so "no
//! keypair yet" is a checked state instead of a set of empty columns.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use tipvault_core::{ReceiverId, TipId, UserId};
use tipvault_crypto::encoding::{base64_bytes, base64_salt};
use tipvault_crypto::{PasswordHash, PublicKey, WrappedKey, SALT_SIZE};

use crate::pgp::PgpKeyInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Receiver,
    Custodian,
}

/// Login verifier. Rotated together with the salt on every password change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginCredential {
    pub hash: PasswordHash,
    #[serde(with = "base64_salt")]
    pub salt: [u8; SALT_SIZE],
}

/// Private-key copies that do not depend on the password
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryWraps {
    /// Private key wrapped under the recovery key
    pub backup: WrappedKey,
    /// Recovery key wrapped under the user's own public key, so a logged-in
    /// user can display it again
    pub escrow: WrappedKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UserKeys {
    /// No real password set under an encryption-enabled tenant yet
    Unkeyed,
    Keyed {
        public_key: PublicKey,
        /// Private key wrapped under the password-derived key
        wrapped_private_key: WrappedKey,
        recovery: Option<RecoveryWraps>,
    },
}

impl UserKeys {
    pub fn public_key(&self) -> Option<&PublicKey> {
        match self {
            UserKeys::Unkeyed => None,
            UserKeys::Keyed { public_key, .. } => Some(public_key),
        }
    }

    pub fn is_keyed(&self) -> bool {
        matches!(self, UserKeys::Keyed { .. })
    }
}

/// The TOTP seed. Stored in clear only while the user has no keypair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum TwoFactorSeed {
    Clear { seed: String },
    Wrapped { wrapped: WrappedKey },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwoFactor {
    pub enabled: bool,
    pub seed: Option<TwoFactorSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub role: UserRole,
    pub credential: LoginCredential,
    /// One-time permission to set a password without the old one
    pub password_change_needed: bool,
    /// Unix seconds of the last password change (0 = never)
    pub password_change_date: u64,
    pub keys: UserKeys,
    #[serde(default)]
    pub two_factor: TwoFactor,
    #[serde(default)]
    pub pgp: Option<PgpKeyInfo>,
}

impl User {
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.keys.public_key()
    }
}

/// A content field of a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum SealedField {
    Clear {
        value: String,
    },
    Sealed {
        #[serde(with = "base64_bytes")]
        ciphertext: Vec<u8>,
    },
}

impl SealedField {
    pub fn is_clear(&self) -> bool {
        matches!(self, SealedField::Clear { .. })
    }
}

/// Encryption state of a submission, fixed at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TipEncryption {
    Unencrypted,
    Encrypted {
        public_key: PublicKey,
        /// Receivers the fan-out must cover
        expected: BTreeSet<ReceiverId>,
        /// Tip private key wrapped once per receiver (the receiver-tip grants)
        grants: BTreeMap<ReceiverId, WrappedKey>,
    },
}

impl TipEncryption {
    pub fn public_key(&self) -> Option<&PublicKey> {
        match self {
            TipEncryption::Unencrypted => None,
            TipEncryption::Encrypted { public_key, .. } => Some(public_key),
        }
    }
}

/// Attachment metadata as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: SealedField,
    pub content_type: SealedField,
    pub size: SealedField,
    /// Uploaded together with the submission (as opposed to later)
    pub submission: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalTip {
    pub id: TipId,
    pub created_at: u64,
    pub updated_at: u64,
    /// Every receiver in scope at creation, keyed or not
    pub receivers: BTreeSet<ReceiverId>,
    pub encryption: TipEncryption,
    pub preview: SealedField,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

impl InternalTip {
    pub fn is_encrypted(&self) -> bool {
        matches!(self.encryption, TipEncryption::Encrypted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tipvault_crypto::{generate_keypair, wrap_under_public_key};

    #[test]
    fn unkeyed_user_serializes_with_state_tag() {
        let keys = UserKeys::Unkeyed;
        let json = serde_json::to_value(&keys).unwrap();
        assert_eq!(json["state"], "unkeyed");
        assert!(keys.public_key().is_none());
    }

    #[test]
    fn keyed_state_roundtrip() {
        let kp = generate_keypair();
        let wrapped = wrap_under_public_key(&kp.public_key, b"x").unwrap();
        let keys = UserKeys::Keyed {
            public_key: kp.public_key.clone(),
            wrapped_private_key: wrapped,
            recovery: None,
        };
        let json = serde_json::to_string(&keys).unwrap();
        let back: UserKeys = serde_json::from_str(&json).unwrap();
        assert_eq!(back.public_key(), Some(&kp.public_key));
        assert!(back.is_keyed());
    }

    #[test]
    fn sealed_field_is_base64_text() {
        let field = SealedField::Sealed {
            ciphertext: vec![0, 1, 2, 255],
        };
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["form"], "sealed");
        assert_eq!(json["ciphertext"], "AAEC/w==");
        assert!(!field.is_clear());
    }
}
