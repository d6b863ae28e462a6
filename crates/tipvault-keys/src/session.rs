//! Session key cache: unwrapped user private keys for live sessions.
//!
//! Entries are created on a successful password check and dropped on logout,
//! TTL expiry (at the next lookup or insert) or process exit. Nothing here is ever serialized. A cached key
//! is immutable after insertion, so concurrent requests of one session share
//! it through an `Arc` and the map lock only guards insert/evict.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tipvault_core::{SessionId, UserId};
use tipvault_crypto::PrivateKey;

/// What a live session holds: the owner and their unwrapped key.
#[derive(Debug, Clone)]
pub struct SessionKey {
    pub owner: UserId,
    pub key: Arc<PrivateKey>,
}

struct Entry {
    session: SessionKey,
    inserted_at: Instant,
}

/// Thread-safe session key holder with TTL-based expiry.
pub struct SessionKeyCache {
    entries: RwLock<HashMap<SessionId, Entry>>,
    ttl: Duration,
}

impl SessionKeyCache {
    pub fn new(ttl: Duration) -> Self {
        SessionKeyCache {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cache `key` under `session_id`. Expired sessions are swept on the way.
    pub fn put(&self, session_id: SessionId, owner: UserId, key: PrivateKey) {
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let swept = sweep(&mut map, self.ttl);
        if swept > 0 {
            tracing::debug!(swept, "dropped expired session keys");
        }
        map.insert(
            session_id,
            Entry {
                session: SessionKey {
                    owner,
                    key: Arc::new(key),
                },
                inserted_at: Instant::now(),
            },
        );
    }

    /// Mint a fresh session id and cache `key` under it.
    pub fn open(&self, owner: UserId, key: PrivateKey) -> SessionId {
        let session_id = SessionId::generate();
        self.put(session_id.clone(), owner, key);
        session_id
    }

    /// Absent or expired sessions return `None`; callers treat that as
    /// "re-authentication required". An expired entry is dropped here.
    pub fn get(&self, session_id: &SessionId) -> Option<SessionKey> {
        {
            let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match map.get(session_id) {
                None => return None,
                Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                    return Some(entry.session.clone())
                }
                Some(_) => {}
            }
        }

        let mut map = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // re-checked: the session may have been replaced since the read lock
        let fresh = map
            .get(session_id)
            .map(|entry| entry.inserted_at.elapsed() < self.ttl)?;
        if fresh {
            return map.get(session_id).map(|entry| entry.session.clone());
        }
        map.remove(session_id);
        tracing::debug!("session key expired");
        None
    }

    /// Returns whether a session was present.
    pub fn evict(&self, session_id: &SessionId) -> bool {
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        map.remove(session_id).is_some()
    }

    /// Drop every session of `owner` (e.g. after a password reset).
    pub fn evict_owner(&self, owner: &UserId) -> usize {
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, entry| entry.session.owner != *owner);
        before - map.len()
    }

    /// Evict all entries whose TTL has expired.
    pub fn evict_expired(&self) -> usize {
        let mut map = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        sweep(&mut map, self.ttl)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sweep(map: &mut HashMap<SessionId, Entry>, ttl: Duration) -> usize {
    let before = map.len();
    map.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
    before - map.len()
}

impl std::fmt::Debug for SessionKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeyCache")
            .field("sessions", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tipvault_crypto::generate_keypair;

    #[test]
    fn put_and_get() {
        let cache = SessionKeyCache::new(Duration::from_secs(30));
        let kp = generate_keypair();
        let owner = UserId::generate();
        let sid = SessionId::generate();

        assert!(cache.get(&sid).is_none());
        cache.put(sid.clone(), owner.clone(), kp.private_key.clone());

        let cached = cache.get(&sid).unwrap();
        assert_eq!(cached.owner, owner);
        assert!(cached.key.same_key_as(&kp.private_key));
    }

    #[test]
    fn evict_clears_entry() {
        let cache = SessionKeyCache::new(Duration::from_secs(30));
        let sid = cache.open(UserId::generate(), generate_keypair().private_key);
        assert!(cache.evict(&sid));
        assert!(cache.get(&sid).is_none());
        assert!(!cache.evict(&sid));
    }

    #[test]
    fn ttl_expiry() {
        let cache = SessionKeyCache::new(Duration::from_millis(50));
        let sid = cache.open(UserId::generate(), generate_keypair().private_key);
        assert!(cache.get(&sid).is_some());
        thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&sid).is_none());
        // the lookup itself dropped the key
        assert!(cache.is_empty());
        assert_eq!(cache.evict_expired(), 0);
    }

    #[test]
    fn new_session_sweeps_expired_ones() {
        let cache = SessionKeyCache::new(Duration::from_millis(50));
        cache.open(UserId::generate(), generate_keypair().private_key);
        cache.open(UserId::generate(), generate_keypair().private_key);
        thread::sleep(Duration::from_millis(80));

        let fresh = cache.open(UserId::generate(), generate_keypair().private_key);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&fresh).is_some());
    }

    #[test]
    fn evict_owner_spares_other_users() {
        let cache = SessionKeyCache::new(Duration::from_secs(30));
        let alice = UserId::generate();
        let bob = UserId::generate();
        cache.open(alice.clone(), generate_keypair().private_key);
        cache.open(alice.clone(), generate_keypair().private_key);
        let bob_sid = cache.open(bob, generate_keypair().private_key);

        assert_eq!(cache.evict_owner(&alice), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&bob_sid).is_some());
    }

    #[test]
    fn debug_does_not_print_keys() {
        let cache = SessionKeyCache::new(Duration::from_secs(30));
        cache.open(UserId::generate(), generate_keypair().private_key);
        let rendered = format!("{cache:?}");
        assert!(!rendered.contains("AGE-SECRET-KEY"));
        assert!(rendered.contains("sessions: 1"));
    }
}
