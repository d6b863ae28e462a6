//! Async facade over the key managers.
//!
//! Every operation loads records from the [`KeyStore`], runs the manager on
//! a blocking thread and saves the result. Argon2id calls take hundreds of
//! milliseconds by construction, so they never run on the async executor:
//! a semaphore bounds how many run at once (`[workers] kdf_workers`), the
//! rest queue for a permit.
//!
//! Operations that rewrite a stored record hold that record's write lock
//! from load to save, so concurrent updates of one user or tip apply one
//! after the other instead of overwriting each other.

use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::Semaphore;

use tipvault_core::config::TipvaultConfig;
use tipvault_core::{SessionId, TipId, TipvaultError, TipvaultResult, UserId};
use tipvault_crypto::{hash_password, PrivateKey, SALT_SIZE};

use crate::context::KeyContext;
use crate::locks::{RecordGuard, RecordKey, RecordLocks};
use crate::model::{InternalTip, TipEncryption, User, UserRole};
use crate::pgp::{apply_pgp_options, encrypt_for_pgp_receiver, PgpCollaborator};
use crate::reconcile::{reconcile, FanOutReport};
use crate::store::KeyStore;
use crate::tip::FileMetadata;
use crate::two_factor::TwoFactorVerifier;

/// A freshly created account. `recovery_key` must be shown once, then dropped.
#[derive(Debug)]
pub struct CreatedAccount {
    pub user_id: UserId,
    pub recovery_key: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct Login {
    pub user_id: UserId,
    /// Present when the user is keyed; the key lives in the session cache.
    pub session_id: Option<SessionId>,
    pub password_change_needed: bool,
}

#[derive(Debug)]
pub struct PasswordChanged {
    /// Set when this change minted the user's first keypair
    pub recovery_key: Option<SecretString>,
    /// The session holding the user's key after the change
    pub session_id: Option<SessionId>,
}

pub struct KeyService<S: KeyStore + 'static> {
    store: Arc<S>,
    ctx: Arc<KeyContext>,
    kdf_permits: Arc<Semaphore>,
    locks: Arc<RecordLocks>,
    two_factor: Option<Arc<dyn TwoFactorVerifier>>,
    pgp: Option<Arc<dyn PgpCollaborator>>,
}

impl<S: KeyStore + 'static> Clone for KeyService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ctx: self.ctx.clone(),
            kdf_permits: self.kdf_permits.clone(),
            locks: self.locks.clone(),
            two_factor: self.two_factor.clone(),
            pgp: self.pgp.clone(),
        }
    }
}

impl<S: KeyStore + 'static> KeyService<S> {
    pub fn new(store: S, ctx: KeyContext, kdf_workers: usize) -> Self {
        let kdf_workers = kdf_workers.max(1);
        tracing::debug!(kdf_workers, encryption = ctx.tenant.encryption, "key service ready");
        Self {
            store: Arc::new(store),
            ctx: Arc::new(ctx),
            kdf_permits: Arc::new(Semaphore::new(kdf_workers)),
            locks: Arc::default(),
            two_factor: None,
            pgp: None,
        }
    }

    pub fn from_config(store: S, config: &TipvaultConfig) -> Self {
        Self::new(
            store,
            KeyContext::from_config(config),
            config.workers.effective_kdf_workers(),
        )
    }

    pub fn with_two_factor_verifier(mut self, verifier: Arc<dyn TwoFactorVerifier>) -> Self {
        self.two_factor = Some(verifier);
        self
    }

    pub fn with_pgp_collaborator(mut self, pgp: Arc<dyn PgpCollaborator>) -> Self {
        self.pgp = Some(pgp);
        self
    }

    pub fn context(&self) -> &KeyContext {
        &self.ctx
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `job` on the blocking pool once a KDF permit is free.
    async fn run_blocking<T, F>(&self, op: &'static str, job: F) -> TipvaultResult<T>
    where
        F: FnOnce(&S, &KeyContext) -> TipvaultResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .kdf_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TipvaultError::Other(anyhow::anyhow!("KDF worker pool closed")))?;
        let store = self.store.clone();
        let ctx = self.ctx.clone();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job(&store, &ctx)
        })
        .await
        .map_err(|e| TipvaultError::Other(anyhow::anyhow!("{op} worker failed: {e}")))?
    }

    /// [`Self::run_blocking`] while holding `record`'s write lock.
    async fn run_locked<T, F>(&self, record: RecordKey, op: &'static str, job: F) -> TipvaultResult<T>
    where
        F: FnOnce(&S, &KeyContext) -> TipvaultResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.locks.acquire(record).await;
        self.run_blocking(op, move |store, ctx| {
            let _guard = guard;
            job(store, ctx)
        })
        .await
    }

    async fn lock_user(&self, user_id: &UserId) -> RecordGuard {
        self.locks.acquire(RecordKey::User(user_id.clone())).await
    }

    async fn lock_tip(&self, tip_id: &TipId) -> RecordGuard {
        self.locks.acquire(RecordKey::Tip(tip_id.clone())).await
    }

    /// Resolve a session to its cached key, checking it belongs to `owner`.
    fn session_key(
        &self,
        session: Option<&SessionId>,
        owner: &UserId,
    ) -> TipvaultResult<Option<Arc<PrivateKey>>> {
        let Some(session_id) = session else {
            return Ok(None);
        };
        let cached = self.ctx.sessions.get(session_id).ok_or_else(|| {
            TipvaultError::KeyUnavailable("session expired or unknown; log in again".into())
        })?;
        if cached.owner != *owner {
            return Err(TipvaultError::KeyUnavailable(format!(
                "session does not belong to user {owner}"
            )));
        }
        Ok(Some(cached.key))
    }

    fn session_owner(&self, session_id: &SessionId) -> TipvaultResult<(UserId, Arc<PrivateKey>)> {
        let cached = self.ctx.sessions.get(session_id).ok_or_else(|| {
            TipvaultError::KeyUnavailable("session expired or unknown; log in again".into())
        })?;
        Ok((cached.owner, cached.key))
    }

    fn pgp_collaborator(&self) -> TipvaultResult<Arc<dyn PgpCollaborator>> {
        self.pgp
            .clone()
            .ok_or_else(|| TipvaultError::Config("no PGP collaborator is configured".into()))
    }

    // ── Users ────────────────────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        username: &str,
        role: UserRole,
        password: SecretString,
    ) -> TipvaultResult<CreatedAccount> {
        let username = username.to_string();
        self.run_blocking("create_user", move |store, ctx| {
            ensure_username_free(store, &username)?;
            let created = ctx.user_keys().create_user(&username, role, &password)?;
            store.save_user(&created.user)?;
            Ok(CreatedAccount {
                user_id: created.user.id,
                recovery_key: created.recovery_key,
            })
        })
        .await
    }

    pub async fn provision_user(
        &self,
        username: &str,
        role: UserRole,
        password: SecretString,
        password_change_needed: bool,
    ) -> TipvaultResult<UserId> {
        let username = username.to_string();
        self.run_blocking("provision_user", move |store, ctx| {
            ensure_username_free(store, &username)?;
            let user =
                ctx.user_keys()
                    .provision_user(&username, role, &password, password_change_needed)?;
            store.save_user(&user)?;
            Ok(user.id)
        })
        .await
    }

    /// Verify a password (and a two-factor code when enabled) and cache the
    /// user's private key under a new session.
    pub async fn login(
        &self,
        username: &str,
        password: SecretString,
        two_factor_code: Option<String>,
    ) -> TipvaultResult<Login> {
        let username = username.to_string();
        let verifier = self.two_factor.clone();
        let (user, key) = self
            .run_blocking("login", move |store, ctx| {
                let Some(user) = store.find_user_by_username(&username)? else {
                    // same KDF time as a real check
                    hash_password(&password, &[0u8; SALT_SIZE], &ctx.kdf).map_err(|e| {
                        TipvaultError::Config(format!("login KDF is misconfigured: {e}"))
                    })?;
                    tracing::debug!("login for unknown username");
                    return Err(TipvaultError::Authentication);
                };
                let um = ctx.user_keys();
                let key = um.authenticate(&user, &password)?;

                if user.two_factor.enabled {
                    let verifier = verifier.ok_or_else(|| {
                        TipvaultError::Config("two-factor is enabled but no verifier is configured".into())
                    })?;
                    let code = two_factor_code.ok_or(TipvaultError::Authentication)?;
                    um.verify_two_factor(&user, key.as_ref(), &code, verifier.as_ref())?;
                }
                Ok((user, key))
            })
            .await?;

        let session_id = key.map(|key| self.ctx.sessions.open(user.id.clone(), key));
        tracing::info!(user_id = %user.id, keyed = session_id.is_some(), "login");
        Ok(Login {
            user_id: user.id,
            session_id,
            password_change_needed: user.password_change_needed,
        })
    }

    pub fn logout(&self, session_id: &SessionId) -> bool {
        self.ctx.sessions.evict(session_id)
    }

    pub async fn change_password(
        &self,
        user_id: &UserId,
        session: Option<&SessionId>,
        old_password: Option<SecretString>,
        new_password: SecretString,
    ) -> TipvaultResult<PasswordChanged> {
        let session_key = self.session_key(session, user_id)?;
        let id = user_id.clone();
        let (user, change) = self
            .run_locked(RecordKey::User(id.clone()), "change_password", move |store, ctx| {
                let mut user = store.load_user(&id)?;
                let change = ctx.user_keys().change_password(
                    &mut user,
                    old_password.as_ref(),
                    &new_password,
                    session_key.as_deref(),
                )?;
                store.save_user(&user)?;
                Ok((user, change))
            })
            .await?;

        let session_id = match (session, change.private_key) {
            (Some(session_id), _) => Some(session_id.clone()),
            (None, Some(key)) => Some(self.ctx.sessions.open(user.id.clone(), key)),
            (None, None) => None,
        };
        Ok(PasswordChanged {
            recovery_key: change.recovery_key,
            session_id,
        })
    }

    /// Reset a lost password with the recovery key. Existing sessions of the
    /// user are dropped; the returned session holds the recovered key.
    pub async fn recover(
        &self,
        username: &str,
        recovery_key: SecretString,
        new_password: SecretString,
    ) -> TipvaultResult<SessionId> {
        let id = self
            .store
            .find_user_by_username(username)?
            .ok_or(TipvaultError::Authentication)?
            .id;
        let (user_id, key) = self
            .run_locked(RecordKey::User(id.clone()), "recover", move |store, ctx| {
                let mut user = store.load_user(&id)?;
                let change = ctx.user_keys().reset_password_with_recovery(
                    &mut user,
                    &recovery_key,
                    &new_password,
                )?;
                store.save_user(&user)?;
                let key = change.private_key.ok_or_else(|| {
                    TipvaultError::KeyUnavailable("recovery released no key".into())
                })?;
                Ok((user.id, key))
            })
            .await?;

        let dropped = self.ctx.sessions.evict_owner(&user_id);
        tracing::info!(user_id = %user_id, dropped_sessions = dropped, "account recovered");
        Ok(self.ctx.sessions.open(user_id, key))
    }

    /// Redisplay the recovery key of the session owner.
    pub async fn recovery_key(&self, session_id: &SessionId) -> TipvaultResult<Option<SecretString>> {
        let (owner, key) = self.session_owner(session_id)?;
        self.run_blocking("recovery_key", move |store, ctx| {
            let user = store.load_user(&owner)?;
            ctx.user_keys().get_recovery_key(&user, &key)
        })
        .await
    }

    pub async fn admin_set_password(&self, user_id: &UserId, password: SecretString) -> TipvaultResult<()> {
        let id = user_id.clone();
        self.run_locked(RecordKey::User(id.clone()), "admin_set_password", move |store, ctx| {
            let mut user = store.load_user(&id)?;
            ctx.user_keys().admin_set_password(&mut user, &password)?;
            store.save_user(&user)
        })
        .await
    }

    pub async fn require_password_change(&self, user_id: &UserId) -> TipvaultResult<()> {
        let _guard = self.lock_user(user_id).await;
        let mut user = self.store.load_user(user_id)?;
        self.ctx.user_keys().require_password_change(&mut user);
        self.store.save_user(&user)
    }

    // ── Two-factor ───────────────────────────────────────────────────────────

    pub async fn begin_two_factor(
        &self,
        user_id: &UserId,
        session: Option<&SessionId>,
    ) -> TipvaultResult<SecretString> {
        let session_key = self.session_key(session, user_id)?;
        let id = user_id.clone();
        self.run_locked(RecordKey::User(id.clone()), "begin_two_factor", move |store, ctx| {
            let mut user = store.load_user(&id)?;
            let seed = ctx
                .user_keys()
                .begin_two_factor_enrollment(&mut user, session_key.as_deref())?;
            store.save_user(&user)?;
            Ok(seed)
        })
        .await
    }

    pub async fn complete_two_factor(
        &self,
        user_id: &UserId,
        session: Option<&SessionId>,
        code: String,
    ) -> TipvaultResult<()> {
        let verifier = self.two_factor.clone().ok_or_else(|| {
            TipvaultError::Config("no two-factor verifier is configured".into())
        })?;
        let session_key = self.session_key(session, user_id)?;
        let id = user_id.clone();
        self.run_locked(RecordKey::User(id.clone()), "complete_two_factor", move |store, ctx| {
            let mut user = store.load_user(&id)?;
            ctx.user_keys().complete_two_factor_enrollment(
                &mut user,
                session_key.as_deref(),
                &code,
                verifier.as_ref(),
            )?;
            store.save_user(&user)
        })
        .await
    }

    pub async fn disable_two_factor(&self, user_id: &UserId) -> TipvaultResult<()> {
        let _guard = self.lock_user(user_id).await;
        let mut user = self.store.load_user(user_id)?;
        self.ctx.user_keys().disable_two_factor(&mut user);
        self.store.save_user(&user)
    }

    /// Import or remove the user's PGP key through the configured collaborator.
    pub async fn apply_pgp_options(
        &self,
        user_id: &UserId,
        armored: Option<&str>,
        remove: bool,
    ) -> TipvaultResult<()> {
        let pgp = self.pgp_collaborator()?;
        let _guard = self.lock_user(user_id).await;
        let mut user = self.store.load_user(user_id)?;
        apply_pgp_options(&mut user, pgp.as_ref(), armored, remove)?;
        self.store.save_user(&user)
    }

    // ── Submissions ──────────────────────────────────────────────────────────

    pub async fn submit(&self, receivers: Vec<UserId>, preview: String) -> TipvaultResult<TipId> {
        self.run_blocking("submit", move |store, ctx| {
            let receivers = receivers
                .iter()
                .map(|id| store.load_user(id))
                .collect::<TipvaultResult<Vec<User>>>()?;
            let tip = ctx.tip_keys().submit(&receivers, &preview)?;
            store.save_tip(&tip)?;
            Ok(tip.id)
        })
        .await
    }

    pub async fn attach_file(
        &self,
        tip_id: &TipId,
        metadata: FileMetadata,
        submission: bool,
    ) -> TipvaultResult<usize> {
        let id = tip_id.clone();
        self.run_locked(RecordKey::Tip(id.clone()), "attach_file", move |store, ctx| {
            let mut tip = store.load_tip(&id)?;
            let idx = ctx.tip_keys().seal_file_metadata(&mut tip, &metadata, submission)?;
            store.save_tip(&tip)?;
            Ok(idx)
        })
        .await
    }

    pub async fn read_preview(
        &self,
        receiver: &UserId,
        session: Option<&SessionId>,
        tip_id: &TipId,
    ) -> TipvaultResult<String> {
        let session_key = self.session_key(session, receiver)?;
        let receiver = receiver.clone();
        let id = tip_id.clone();
        self.run_blocking("read_preview", move |store, ctx| {
            let tip = store.load_tip(&id)?;
            ctx.tip_keys()
                .read_preview(session_key.as_deref(), &tip, &receiver)
        })
        .await
    }

    pub async fn read_files(
        &self,
        receiver: &UserId,
        session: Option<&SessionId>,
        tip_id: &TipId,
    ) -> TipvaultResult<Vec<FileMetadata>> {
        let session_key = self.session_key(session, receiver)?;
        let receiver = receiver.clone();
        let id = tip_id.clone();
        self.run_blocking("read_files", move |store, ctx| {
            let tip = store.load_tip(&id)?;
            if !tip.receivers.contains(&receiver) {
                return Err(TipvaultError::NotFound(format!("tip {id} for receiver {receiver}")));
            }
            let tips = ctx.tip_keys();
            let tip_key = open_if_encrypted(ctx, &tip, session_key.as_deref(), &receiver)?;
            tip.files
                .iter()
                .map(|record| tips.open_file_metadata(tip_key.as_ref(), record))
                .collect()
        })
        .await
    }

    /// Seal an attachment body for storage: under the tip public key when
    /// the tip is encrypted, unchanged otherwise.
    pub fn seal_file_content(&self, tip_id: &TipId, body: &[u8]) -> TipvaultResult<Vec<u8>> {
        let tip = self.store.load_tip(tip_id)?;
        match &tip.encryption {
            TipEncryption::Encrypted { public_key, .. } => {
                self.ctx.tip_keys().encrypt_content(public_key, body)
            }
            TipEncryption::Unencrypted => Ok(body.to_vec()),
        }
    }

    /// Open a stored attachment body for `receiver`. Receivers with a PGP
    /// key get the body re-encrypted to that key instead of in clear.
    pub async fn download_file(
        &self,
        receiver: &UserId,
        session: Option<&SessionId>,
        tip_id: &TipId,
        stored: Vec<u8>,
    ) -> TipvaultResult<Vec<u8>> {
        let session_key = self.session_key(session, receiver)?;
        let pgp = self.pgp.clone();
        let receiver = receiver.clone();
        let id = tip_id.clone();
        self.run_blocking("download_file", move |store, ctx| {
            let tip = store.load_tip(&id)?;
            if !tip.receivers.contains(&receiver) {
                return Err(TipvaultError::NotFound(format!("tip {id} for receiver {receiver}")));
            }
            let body = match open_if_encrypted(ctx, &tip, session_key.as_deref(), &receiver)? {
                Some(tip_key) => ctx.tip_keys().decrypt_content(&tip_key, &stored)?,
                None => stored,
            };

            let user = store.load_user(&receiver)?;
            if user.pgp.is_none() {
                return Ok(body);
            }
            let pgp = pgp.ok_or_else(|| {
                TipvaultError::Config("receiver has a PGP key but no PGP collaborator is configured".into())
            })?;
            tracing::debug!(tip_id = %id, receiver_id = %receiver, "PGP-encrypting download");
            encrypt_for_pgp_receiver(pgp.as_ref(), &user, &body)
        })
        .await
    }

    /// Grant `receiver` access, using the tip key reachable through the
    /// grantor's own session.
    pub async fn grant(
        &self,
        grantor_session: Option<&SessionId>,
        tip_id: &TipId,
        receiver: &UserId,
    ) -> TipvaultResult<()> {
        let grantor = grantor_session
            .map(|sid| self.session_owner(sid))
            .transpose()?;
        let id = tip_id.clone();
        let receiver = receiver.clone();
        self.run_locked(RecordKey::Tip(id.clone()), "grant", move |store, ctx| {
            let mut tip = store.load_tip(&id)?;
            let new_receiver = store.load_user(&receiver)?;
            let tip_key = match &grantor {
                Some((owner, key)) if tip.is_encrypted() => {
                    Some(ctx.tip_keys().open_tip(key, &tip, owner)?)
                }
                _ => None,
            };
            ctx.tip_keys()
                .grant_access(&mut tip, tip_key.as_ref(), &new_receiver)?;
            store.save_tip(&tip)
        })
        .await
    }

    pub async fn revoke(&self, tip_id: &TipId, receiver: &UserId) -> TipvaultResult<bool> {
        let _guard = self.lock_tip(tip_id).await;
        let mut tip = self.store.load_tip(tip_id)?;
        let removed = self.ctx.tip_keys().revoke_receiver_access(&mut tip, receiver);
        if removed {
            self.store.save_tip(&tip)?;
        }
        Ok(removed)
    }

    pub fn reconcile(&self, tip_id: &TipId) -> TipvaultResult<FanOutReport> {
        Ok(reconcile(&self.store.load_tip(tip_id)?))
    }

    /// Reports for every stored tip whose fan-out is not clean.
    pub fn reconcile_all(&self) -> TipvaultResult<Vec<(TipId, FanOutReport)>> {
        let mut dirty = Vec::new();
        for id in self.store.list_tips()? {
            let report = reconcile(&self.store.load_tip(&id)?);
            if !report.is_clean() {
                dirty.push((id, report));
            }
        }
        Ok(dirty)
    }
}

fn ensure_username_free<S: KeyStore>(store: &S, username: &str) -> TipvaultResult<()> {
    if store.find_user_by_username(username.trim())?.is_some() {
        return Err(TipvaultError::InputValidation(format!(
            "username already in use: {}",
            username.trim()
        )));
    }
    Ok(())
}

fn open_if_encrypted(
    ctx: &KeyContext,
    tip: &InternalTip,
    session_key: Option<&PrivateKey>,
    receiver: &UserId,
) -> TipvaultResult<Option<PrivateKey>> {
    if !tip.is_encrypted() {
        return Ok(None);
    }
    let key = session_key.ok_or_else(|| {
        TipvaultError::KeyUnavailable("reading an encrypted tip requires a live session".into())
    })?;
    ctx.tip_keys().open_tip(key, tip, receiver).map(Some)
}
