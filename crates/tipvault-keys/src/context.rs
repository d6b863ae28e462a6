//! Explicit per-process context handed to every key operation

use std::sync::Arc;
use std::time::Duration;

use tipvault_core::config::TipvaultConfig;
use tipvault_core::TenantSettings;
use tipvault_crypto::KdfParams;

use crate::session::SessionKeyCache;
use crate::tip::TipKeyManager;
use crate::user::UserKeyManager;

/// Tenant switches, KDF cost and the session key cache.
#[derive(Debug, Clone)]
pub struct KeyContext {
    pub tenant: TenantSettings,
    pub kdf: KdfParams,
    pub sessions: Arc<SessionKeyCache>,
}

impl KeyContext {
    pub fn new(tenant: TenantSettings, kdf: KdfParams, session_ttl: Duration) -> Self {
        Self {
            tenant,
            kdf,
            sessions: Arc::new(SessionKeyCache::new(session_ttl)),
        }
    }

    pub fn from_config(config: &TipvaultConfig) -> Self {
        let kdf = KdfParams {
            mem_cost_kib: config.crypto.argon2_mem_cost_kib,
            time_cost: config.crypto.argon2_time_cost,
            parallelism: config.crypto.argon2_parallelism,
        };
        Self::new(
            config.tenant.settings(),
            kdf,
            Duration::from_secs(config.session.ttl_secs),
        )
    }

    pub fn user_keys(&self) -> UserKeyManager<'_> {
        UserKeyManager::new(self)
    }

    pub fn tip_keys(&self) -> TipKeyManager<'_> {
        TipKeyManager::new(self)
    }
}
