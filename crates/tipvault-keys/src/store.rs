//! Storage collaborator: load/save of user and submission records
//!
//! Backends:
//!   - **Memory** (tests, embedding): records behind a mutex.
//!   - **JSON file**: loads entirely into memory, every save is flushed
//!     atomically via temp+rename so a reader sees either the old or the
//!     new record set, never a half-written file.
//!
//! A save replaces the whole record; managers build the complete new state
//! first and hand it over in one call.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tipvault_core::{TipId, TipvaultError, TipvaultResult, UserId};

use crate::model::{InternalTip, User};

/// Persistence boundary used by [`crate::KeyService`].
pub trait KeyStore: Send + Sync {
    fn load_user(&self, id: &UserId) -> TipvaultResult<User>;

    fn find_user_by_username(&self, username: &str) -> TipvaultResult<Option<User>>;

    fn save_user(&self, user: &User) -> TipvaultResult<()>;

    fn load_tip(&self, id: &TipId) -> TipvaultResult<InternalTip>;

    fn save_tip(&self, tip: &InternalTip) -> TipvaultResult<()>;

    fn list_tips(&self) -> TipvaultResult<Vec<TipId>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Records {
    #[serde(default)]
    users: BTreeMap<UserId, User>,
    #[serde(default)]
    tips: BTreeMap<TipId, InternalTip>,
}

impl Records {
    fn user(&self, id: &UserId) -> TipvaultResult<User> {
        self.users
            .get(id)
            .cloned()
            .ok_or_else(|| TipvaultError::NotFound(format!("user {id}")))
    }

    fn by_username(&self, username: &str) -> Option<User> {
        self.users
            .values()
            .find(|u| u.username == username)
            .cloned()
    }

    fn tip(&self, id: &TipId) -> TipvaultResult<InternalTip> {
        self.tips
            .get(id)
            .cloned()
            .ok_or_else(|| TipvaultError::NotFound(format!("tip {id}")))
    }

    fn check_username_free(&self, user: &User) -> TipvaultResult<()> {
        match self.by_username(&user.username) {
            Some(existing) if existing.id != user.id => Err(TipvaultError::InputValidation(
                format!("username already in use: {}", user.username),
            )),
            _ => Ok(()),
        }
    }
}

fn lock(records: &Mutex<Records>) -> MutexGuard<'_, Records> {
    records.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process store, dropped with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryStore {
    fn load_user(&self, id: &UserId) -> TipvaultResult<User> {
        lock(&self.records).user(id)
    }

    fn find_user_by_username(&self, username: &str) -> TipvaultResult<Option<User>> {
        Ok(lock(&self.records).by_username(username))
    }

    fn save_user(&self, user: &User) -> TipvaultResult<()> {
        let mut records = lock(&self.records);
        records.check_username_free(user)?;
        records.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    fn load_tip(&self, id: &TipId) -> TipvaultResult<InternalTip> {
        lock(&self.records).tip(id)
    }

    fn save_tip(&self, tip: &InternalTip) -> TipvaultResult<()> {
        lock(&self.records)
            .tips
            .insert(tip.id.clone(), tip.clone());
        Ok(())
    }

    fn list_tips(&self) -> TipvaultResult<Vec<TipId>> {
        Ok(lock(&self.records).tips.keys().cloned().collect())
    }
}

/// Record store persisted to one JSON file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<Records>,
}

impl JsonFileStore {
    /// Load or create a store at the given path.
    /// If the file doesn't exist, starts empty.
    pub fn open(path: &Path) -> TipvaultResult<Self> {
        let records = if path.exists() {
            read_records(path).map_err(storage_error)?
        } else {
            Records::default()
        };

        tracing::debug!(
            path = %path.display(),
            users = records.users.len(),
            tips = records.tips.len(),
            "opened record store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the records, persist the copy, then
    /// publish it in memory. A failed write leaves both untouched.
    fn commit(&self, change: impl FnOnce(&mut Records) -> TipvaultResult<()>) -> TipvaultResult<()> {
        let mut records = lock(&self.records);
        let mut next = records.clone();
        change(&mut next)?;
        write_records(&self.path, &next).map_err(storage_error)?;
        *records = next;
        Ok(())
    }
}

fn read_records(path: &Path) -> anyhow::Result<Records> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading record store: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("parsing record store: {}", path.display()))
}

fn write_records(path: &Path, records: &Records) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store dir: {}", parent.display()))?;
        }
    }

    let json = serde_json::to_string_pretty(records).context("serializing record store")?;

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &json)
        .with_context(|| format!("writing record store temp: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming record store: {}", path.display()))?;
    Ok(())
}

fn storage_error(err: anyhow::Error) -> TipvaultError {
    TipvaultError::Storage(format!("{err:#}"))
}

impl KeyStore for JsonFileStore {
    fn load_user(&self, id: &UserId) -> TipvaultResult<User> {
        lock(&self.records).user(id)
    }

    fn find_user_by_username(&self, username: &str) -> TipvaultResult<Option<User>> {
        Ok(lock(&self.records).by_username(username))
    }

    fn save_user(&self, user: &User) -> TipvaultResult<()> {
        self.commit(|records| {
            records.check_username_free(user)?;
            records.users.insert(user.id.clone(), user.clone());
            Ok(())
        })
    }

    fn load_tip(&self, id: &TipId) -> TipvaultResult<InternalTip> {
        lock(&self.records).tip(id)
    }

    fn save_tip(&self, tip: &InternalTip) -> TipvaultResult<()> {
        self.commit(|records| {
            records.tips.insert(tip.id.clone(), tip.clone());
            Ok(())
        })
    }

    fn list_tips(&self) -> TipvaultResult<Vec<TipId>> {
        Ok(lock(&self.records).tips.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoginCredential, SealedField, TipEncryption, UserKeys, UserRole};
    use std::collections::BTreeSet;
    use tipvault_crypto::PasswordHash;

    fn user(name: &str) -> User {
        User {
            id: UserId::generate(),
            username: name.into(),
            role: UserRole::Receiver,
            credential: LoginCredential {
                hash: PasswordHash::from_encoded("AAAA"),
                salt: [1u8; 16],
            },
            password_change_needed: true,
            password_change_date: 0,
            keys: UserKeys::Unkeyed,
            two_factor: Default::default(),
            pgp: None,
        }
    }

    fn tip() -> InternalTip {
        InternalTip {
            id: TipId::generate(),
            created_at: 1,
            updated_at: 1,
            receivers: BTreeSet::new(),
            encryption: TipEncryption::Unencrypted,
            preview: SealedField::Clear {
                value: "preview".into(),
            },
            files: Vec::new(),
        }
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        let u = user("alice");
        store.save_user(&u).unwrap();

        assert_eq!(store.load_user(&u.id).unwrap().username, "alice");
        assert_eq!(
            store.find_user_by_username("alice").unwrap().unwrap().id,
            u.id
        );
        assert!(store.find_user_by_username("bob").unwrap().is_none());
    }

    #[test]
    fn missing_records_are_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.load_user(&UserId::generate()),
            Err(TipvaultError::NotFound(_))
        ));
        assert!(matches!(
            store.load_tip(&TipId::generate()),
            Err(TipvaultError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_username_rejected() {
        let store = MemoryStore::new();
        store.save_user(&user("alice")).unwrap();
        assert!(matches!(
            store.save_user(&user("alice")),
            Err(TipvaultError::InputValidation(_))
        ));
    }

    #[test]
    fn open_nonexistent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(&dir.path().join("records.json")).unwrap();
        assert!(store.list_tips().unwrap().is_empty());
        assert!(!dir.path().join("records.json").exists());
    }

    #[test]
    fn save_flush_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("records.json");

        let u = user("carol");
        let t = tip();
        {
            let store = JsonFileStore::open(&path).unwrap();
            store.save_user(&u).unwrap();
            store.save_tip(&t).unwrap();
        }

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.load_user(&u.id).unwrap().username, "carol");
        assert_eq!(store.list_tips().unwrap(), vec![t.id.clone()]);
        assert_eq!(store.load_tip(&t.id).unwrap().preview, t.preview);
    }

    #[test]
    fn rejected_save_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.save_user(&user("dave")).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        assert!(store.save_user(&user("dave")).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(TipvaultError::Storage(_))
        ));
    }
}
