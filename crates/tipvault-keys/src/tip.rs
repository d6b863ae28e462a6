//! Per-submission keypairs and the fan-out of the tip private key
//!
//! Each receiver gets an independent wrap of the tip private key under their
//! own public key. Revoking one receiver removes one wrap and touches
//! nothing else. A receiver added later can only be granted by someone who
//! already holds the tip private key unwrapped.

use std::collections::{BTreeMap, BTreeSet};

use tipvault_core::{ReceiverId, TipId, TipvaultError, TipvaultResult};
use tipvault_crypto::{
    asymmetric_decrypt, asymmetric_encrypt, generate_keypair, unwrap_under_private_key,
    wrap_under_public_key, KeyPair, KeyReference, PrivateKey, PublicKey, WrappedKey,
};

use crate::context::KeyContext;
use crate::model::{FileRecord, InternalTip, SealedField, TipEncryption, User};
use crate::{corrupt_key, crypto_error, unix_now};

/// A fresh tip keypair and exactly one wrap per receiver.
#[derive(Debug)]
pub struct CreatedTipKeys {
    pub keypair: KeyPair,
    pub grants: BTreeMap<ReceiverId, WrappedKey>,
}

/// Attachment metadata in clear
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub content_type: String,
    pub size: u64,
}

pub struct TipKeyManager<'c> {
    ctx: &'c KeyContext,
}

impl<'c> TipKeyManager<'c> {
    pub fn new(ctx: &'c KeyContext) -> Self {
        Self { ctx }
    }

    /// Mint a tip keypair and wrap its private half once per receiver.
    /// Keying by receiver id collapses duplicates to a single wrap.
    pub fn create_tip_keys(
        &self,
        receivers: &BTreeMap<ReceiverId, PublicKey>,
    ) -> TipvaultResult<CreatedTipKeys> {
        let keypair = generate_keypair();
        let secret = keypair.private_key.to_secret_bytes();

        let grants = receivers
            .iter()
            .map(|(id, public_key)| {
                wrap_under_public_key(public_key, &secret)
                    .map(|wrapped| (id.clone(), wrapped))
                    .map_err(crypto_error)
            })
            .collect::<TipvaultResult<BTreeMap<_, _>>>()?;

        Ok(CreatedTipKeys { keypair, grants })
    }

    /// Wrap an already-unwrapped tip private key for one more receiver.
    pub fn add_receiver_after_creation(
        &self,
        tip_private_key: Option<&PrivateKey>,
        new_receiver: &PublicKey,
    ) -> TipvaultResult<WrappedKey> {
        let tip_private_key = tip_private_key.ok_or_else(|| {
            TipvaultError::KeyUnavailable("nobody holds the tip private key in this session".into())
        })?;
        wrap_under_public_key(new_receiver, &tip_private_key.to_secret_bytes()).map_err(crypto_error)
    }

    pub fn encrypt_content(&self, tip_public_key: &PublicKey, plaintext: &[u8]) -> TipvaultResult<Vec<u8>> {
        asymmetric_encrypt(tip_public_key, plaintext).map_err(crypto_error)
    }

    pub fn decrypt_content(&self, tip_private_key: &PrivateKey, ciphertext: &[u8]) -> TipvaultResult<Vec<u8>> {
        asymmetric_decrypt(tip_private_key, ciphertext).map_err(crypto_error)
    }

    /// Remove one receiver's wrap. Returns whether the receiver had access.
    pub fn revoke_receiver_access(&self, tip: &mut InternalTip, receiver: &ReceiverId) -> bool {
        let mut removed = tip.receivers.remove(receiver);
        if let TipEncryption::Encrypted {
            expected, grants, ..
        } = &mut tip.encryption
        {
            removed |= grants.remove(receiver).is_some();
            expected.remove(receiver);
        }
        if removed {
            tip.updated_at = unix_now();
            tracing::info!(tip_id = %tip.id, receiver_id = %receiver, "receiver access revoked");
        }
        removed
    }

    /// Build a submission for `receivers`.
    ///
    /// Under tenant encryption the preview is sealed under a fresh tip key
    /// and every keyed receiver gets a wrap. Receivers without a keypair are
    /// left out of the fan-out and logged.
    pub fn submit(&self, receivers: &[User], preview: &str) -> TipvaultResult<InternalTip> {
        if receivers.is_empty() {
            return Err(TipvaultError::InputValidation(
                "a submission needs at least one receiver".into(),
            ));
        }

        let now = unix_now();
        let ids: BTreeSet<ReceiverId> = receivers.iter().map(|r| r.id.clone()).collect();
        let id = TipId::generate();

        if !self.ctx.tenant.encryption {
            tracing::info!(tip_id = %id, receivers = ids.len(), "created unencrypted submission");
            return Ok(InternalTip {
                id,
                created_at: now,
                updated_at: now,
                receivers: ids,
                encryption: TipEncryption::Unencrypted,
                preview: SealedField::Clear {
                    value: preview.to_string(),
                },
                files: Vec::new(),
            });
        }

        let mut keyed = BTreeMap::new();
        for receiver in receivers {
            match receiver.public_key() {
                Some(public_key) => {
                    keyed.insert(receiver.id.clone(), public_key.clone());
                }
                None => {
                    tracing::warn!(tip_id = %id, receiver_id = %receiver.id, "receiver has no keypair; excluded from fan-out");
                }
            }
        }
        if keyed.is_empty() {
            return Err(TipvaultError::KeyUnavailable(
                "no receiver of this submission has encryption keys".into(),
            ));
        }

        let created = self.create_tip_keys(&keyed)?;
        let public_key = created.keypair.public_key.clone();
        let preview = SealedField::Sealed {
            ciphertext: self.encrypt_content(&public_key, preview.as_bytes())?,
        };

        tracing::info!(tip_id = %id, receivers = ids.len(), grants = created.grants.len(), "created encrypted submission");
        Ok(InternalTip {
            id,
            created_at: now,
            updated_at: now,
            receivers: ids,
            encryption: TipEncryption::Encrypted {
                public_key,
                expected: keyed.into_keys().collect(),
                grants: created.grants,
            },
            preview,
            files: Vec::new(),
        })
    }

    /// Unwrap the tip private key through `receiver`'s grant.
    pub fn open_tip(
        &self,
        session_key: &PrivateKey,
        tip: &InternalTip,
        receiver: &ReceiverId,
    ) -> TipvaultResult<PrivateKey> {
        let (tip_public_key, grants) = match &tip.encryption {
            TipEncryption::Encrypted {
                public_key, grants, ..
            } => (public_key, grants),
            TipEncryption::Unencrypted => {
                return Err(TipvaultError::KeyUnavailable(format!(
                    "tip {} has no keypair",
                    tip.id
                )))
            }
        };

        let grant = grants.get(receiver).ok_or_else(|| {
            TipvaultError::KeyUnavailable(format!(
                "receiver {receiver} holds no key for tip {}",
                tip.id
            ))
        })?;
        if grant.wrapped_under != KeyReference::PublicKey(session_key.public_key()) {
            return Err(TipvaultError::KeyUnavailable(format!(
                "session key does not match the grant of receiver {receiver}"
            )));
        }

        let secret = unwrap_under_private_key(session_key, grant)
            .map_err(|e| corrupt_key("receiver-tip grant", e))?;
        let tip_key = PrivateKey::from_secret_bytes(&secret)
            .map_err(|e| corrupt_key("receiver-tip grant", e))?;
        if tip_key.public_key() != *tip_public_key {
            tracing::error!(tip_id = %tip.id, receiver_id = %receiver, "grant holds a key for another tip");
            return Err(TipvaultError::CorruptKey(format!(
                "grant of receiver {receiver} does not match tip {}",
                tip.id
            )));
        }
        Ok(tip_key)
    }

    /// The preview as `receiver` sees it. A sealed preview needs the
    /// receiver's session key.
    pub fn read_preview(
        &self,
        session_key: Option<&PrivateKey>,
        tip: &InternalTip,
        receiver: &ReceiverId,
    ) -> TipvaultResult<String> {
        if !tip.receivers.contains(receiver) {
            return Err(TipvaultError::NotFound(format!(
                "tip {} for receiver {receiver}",
                tip.id
            )));
        }
        match &tip.preview {
            SealedField::Clear { value } => Ok(value.clone()),
            SealedField::Sealed { .. } => {
                let session_key = session_key.ok_or_else(|| {
                    TipvaultError::KeyUnavailable("reading an encrypted tip requires a live session".into())
                })?;
                let tip_key = self.open_tip(session_key, tip, receiver)?;
                open_field(Some(&tip_key), &tip.preview, "preview")
            }
        }
    }

    /// Grant a receiver access after creation. `tip_private_key` must be the
    /// unwrapped tip key held by the grantor.
    pub fn grant_access(
        &self,
        tip: &mut InternalTip,
        tip_private_key: Option<&PrivateKey>,
        receiver: &User,
    ) -> TipvaultResult<()> {
        if let TipEncryption::Encrypted {
            public_key,
            expected,
            grants,
        } = &mut tip.encryption
        {
            let receiver_key = receiver.public_key().ok_or_else(|| {
                TipvaultError::KeyUnavailable(format!("receiver {} has no keypair", receiver.id))
            })?;
            if let Some(key) = tip_private_key {
                if key.public_key() != *public_key {
                    return Err(TipvaultError::KeyUnavailable(format!(
                        "supplied key does not open tip {}",
                        tip.id
                    )));
                }
            }
            let wrapped = self.add_receiver_after_creation(tip_private_key, receiver_key)?;
            grants.insert(receiver.id.clone(), wrapped);
            expected.insert(receiver.id.clone());
        }

        tip.receivers.insert(receiver.id.clone());
        tip.updated_at = unix_now();
        tracing::info!(tip_id = %tip.id, receiver_id = %receiver.id, "receiver access granted");
        Ok(())
    }

    /// Seal attachment metadata under the tip public key (clear for an
    /// unencrypted tip) and attach it to the tip.
    pub fn seal_file_metadata(
        &self,
        tip: &mut InternalTip,
        metadata: &FileMetadata,
        submission: bool,
    ) -> TipvaultResult<usize> {
        let public_key = tip.encryption.public_key();
        let record = FileRecord {
            name: seal_field(public_key, &metadata.name)?,
            content_type: seal_field(public_key, &metadata.content_type)?,
            size: seal_field(public_key, &metadata.size.to_string())?,
            submission,
        };
        tip.files.push(record);
        tip.updated_at = unix_now();
        Ok(tip.files.len() - 1)
    }

    pub fn open_file_metadata(
        &self,
        tip_private_key: Option<&PrivateKey>,
        record: &FileRecord,
    ) -> TipvaultResult<FileMetadata> {
        let size = open_field(tip_private_key, &record.size, "file size")?;
        Ok(FileMetadata {
            name: open_field(tip_private_key, &record.name, "file name")?,
            content_type: open_field(tip_private_key, &record.content_type, "file type")?,
            size: size
                .parse()
                .map_err(|_| TipvaultError::Storage(format!("file size is not a number: {size}")))?,
        })
    }
}

fn seal_field(public_key: Option<&PublicKey>, value: &str) -> TipvaultResult<SealedField> {
    match public_key {
        Some(public_key) => Ok(SealedField::Sealed {
            ciphertext: asymmetric_encrypt(public_key, value.as_bytes()).map_err(crypto_error)?,
        }),
        None => Ok(SealedField::Clear {
            value: value.to_string(),
        }),
    }
}

/// Open a field with a tip key obtained through a verified grant; a failure
/// here means the stored ciphertext is damaged.
fn open_field(tip_key: Option<&PrivateKey>, field: &SealedField, what: &str) -> TipvaultResult<String> {
    match field {
        SealedField::Clear { value } => Ok(value.clone()),
        SealedField::Sealed { ciphertext } => {
            let key = tip_key.ok_or_else(|| {
                TipvaultError::KeyUnavailable(format!("{what} is sealed; the tip key is required"))
            })?;
            let bytes = asymmetric_decrypt(key, ciphertext).map_err(|e| corrupt_key(what, e))?;
            String::from_utf8(bytes).map_err(|_| {
                tracing::error!(what, "sealed field is not UTF-8");
                TipvaultError::CorruptKey(format!("{what}: not UTF-8"))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserRole;
    use secrecy::SecretString;
    use std::time::Duration;
    use tipvault_core::TenantSettings;
    use tipvault_crypto::KdfParams;

    fn ctx(encryption: bool) -> KeyContext {
        KeyContext::new(
            TenantSettings { encryption },
            KdfParams::insecure_fast(),
            Duration::from_secs(60),
        )
    }

    fn receiver(ctx: &KeyContext, name: &str) -> (User, PrivateKey) {
        let created = ctx
            .user_keys()
            .create_user(name, UserRole::Receiver, &SecretString::from("pw"))
            .unwrap();
        (created.user, created.private_key.unwrap())
    }

    #[test]
    fn duplicate_receivers_collapse() {
        let ctx = ctx(true);
        let kp = generate_keypair();
        let id = ReceiverId::from("r1");
        let mut receivers = BTreeMap::new();
        receivers.insert(id.clone(), kp.public_key.clone());
        receivers.insert(id.clone(), kp.public_key.clone());

        let created = ctx.tip_keys().create_tip_keys(&receivers).unwrap();
        assert_eq!(created.grants.len(), 1);
    }

    #[test]
    fn add_receiver_without_key_is_unavailable() {
        let ctx = ctx(true);
        let kp = generate_keypair();
        assert!(matches!(
            ctx.tip_keys().add_receiver_after_creation(None, &kp.public_key),
            Err(TipvaultError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn unencrypted_submission_stays_clear() {
        let ctx = ctx(false);
        let created = ctx
            .user_keys()
            .create_user("r1", UserRole::Receiver, &SecretString::from("pw"))
            .unwrap();
        assert!(created.private_key.is_none());
        let r1 = created.user;
        let tips = ctx.tip_keys();
        let mut tip = tips.submit(std::slice::from_ref(&r1), "hello").unwrap();

        assert!(!tip.is_encrypted());
        assert_eq!(tips.read_preview(None, &tip, &r1.id).unwrap(), "hello");

        let meta = FileMetadata {
            name: "leak.pdf".into(),
            content_type: "application/pdf".into(),
            size: 1024,
        };
        let idx = tips.seal_file_metadata(&mut tip, &meta, true).unwrap();
        assert!(tip.files[idx].name.is_clear());
        assert_eq!(tips.open_file_metadata(None, &tip.files[idx]).unwrap(), meta);
    }

    #[test]
    fn unkeyed_receivers_are_excluded() {
        let ctx = ctx(true);
        let (keyed, _) = receiver(&ctx, "keyed");
        let unkeyed = ctx
            .user_keys()
            .provision_user("unkeyed", UserRole::Receiver, &SecretString::from("x"), true)
            .unwrap();

        let tip = ctx
            .tip_keys()
            .submit(&[keyed.clone(), unkeyed.clone()], "hello")
            .unwrap();
        assert!(tip.receivers.contains(&unkeyed.id));
        match &tip.encryption {
            TipEncryption::Encrypted {
                expected, grants, ..
            } => {
                assert_eq!(grants.len(), 1);
                assert!(expected.contains(&keyed.id));
                assert!(!expected.contains(&unkeyed.id));
            }
            TipEncryption::Unencrypted => panic!("tip must be encrypted"),
        }

        assert!(matches!(
            ctx.tip_keys().submit(&[unkeyed], "hello"),
            Err(TipvaultError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn encrypted_file_metadata_needs_tip_key() {
        let ctx = ctx(true);
        let (r1, k1) = receiver(&ctx, "r1");
        let tips = ctx.tip_keys();
        let mut tip = tips.submit(std::slice::from_ref(&r1), "hello").unwrap();

        let meta = FileMetadata {
            name: "memo.txt".into(),
            content_type: "text/plain".into(),
            size: 7,
        };
        let idx = tips.seal_file_metadata(&mut tip, &meta, false).unwrap();
        let record = &tip.files[idx];
        assert!(!record.name.is_clear() && !record.size.is_clear());

        assert!(matches!(
            tips.open_file_metadata(None, record),
            Err(TipvaultError::KeyUnavailable(_))
        ));
        let tip_key = tips.open_tip(&k1, &tip, &r1.id).unwrap();
        assert_eq!(tips.open_file_metadata(Some(&tip_key), record).unwrap(), meta);
    }

    #[test]
    fn open_tip_without_grant_or_with_wrong_key() {
        let ctx = ctx(true);
        let (r1, k1) = receiver(&ctx, "r1");
        let (r2, k2) = receiver(&ctx, "r2");
        let tips = ctx.tip_keys();
        let tip = tips.submit(std::slice::from_ref(&r1), "hello").unwrap();

        assert!(matches!(
            tips.open_tip(&k2, &tip, &r2.id),
            Err(TipvaultError::KeyUnavailable(_))
        ));
        assert!(matches!(
            tips.open_tip(&k2, &tip, &r1.id),
            Err(TipvaultError::KeyUnavailable(_))
        ));
        assert!(tips.open_tip(&k1, &tip, &r1.id).is_ok());
    }

    #[test]
    fn damaged_grant_is_corrupt() {
        let ctx = ctx(true);
        let (r1, k1) = receiver(&ctx, "r1");
        let tips = ctx.tip_keys();
        let mut tip = tips.submit(std::slice::from_ref(&r1), "hello").unwrap();
        if let TipEncryption::Encrypted { grants, .. } = &mut tip.encryption {
            let grant = grants.get_mut(&r1.id).unwrap();
            let last = grant.ciphertext.len() - 1;
            grant.ciphertext[last] ^= 0x01;
        }

        assert!(matches!(
            tips.read_preview(Some(&k1), &tip, &r1.id),
            Err(TipvaultError::CorruptKey(_))
        ));
    }

    #[test]
    fn grant_after_creation() {
        let ctx = ctx(true);
        let (r1, k1) = receiver(&ctx, "r1");
        let (r2, k2) = receiver(&ctx, "r2");
        let tips = ctx.tip_keys();
        let mut tip = tips.submit(std::slice::from_ref(&r1), "hello").unwrap();

        assert!(matches!(
            tips.grant_access(&mut tip, None, &r2),
            Err(TipvaultError::KeyUnavailable(_))
        ));
        assert!(!tip.receivers.contains(&r2.id));

        let tip_key = tips.open_tip(&k1, &tip, &r1.id).unwrap();
        tips.grant_access(&mut tip, Some(&tip_key), &r2).unwrap();
        assert_eq!(tips.read_preview(Some(&k2), &tip, &r2.id).unwrap(), "hello");
    }
}
