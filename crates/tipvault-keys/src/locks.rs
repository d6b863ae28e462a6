//! Per-record write locks for load → mutate → save sequences.
//!
//! A store save replaces the whole record, so two writers that loaded the
//! same version would silently drop one update. [`crate::KeyService`] takes
//! the record's lock before loading and holds it until the save returns.
//! Idle locks are dropped from the map when their last guard goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

use tipvault_core::{TipId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum RecordKey {
    User(UserId),
    Tip(TipId),
}

#[derive(Debug, Default)]
pub(crate) struct RecordLocks {
    held: Mutex<HashMap<RecordKey, Arc<TokioMutex<()>>>>,
}

/// Exclusive access to one record until dropped.
pub(crate) struct RecordGuard {
    locks: Arc<RecordLocks>,
    key: RecordKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RecordLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<RecordKey, Arc<TokioMutex<()>>>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until no other guard holds `key`.
    pub(crate) async fn acquire(self: &Arc<Self>, key: RecordKey) -> RecordGuard {
        let lock = self.map().entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        RecordGuard {
            locks: Arc::clone(self),
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map().len()
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut held = self.locks.map();
        // only the map's own handle left: nobody holds or waits for it
        if held
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            held.remove(&self.key);
        }
    }
}
