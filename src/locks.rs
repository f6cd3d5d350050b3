//! Per-integration mutual exclusion and cancellation.
//!
//! [`IntegrationLocks`] is the in-process half of the sync lock: acquisition
//! never waits, so a second sync for the same integration fails fast instead
//! of queueing. The database lease taken by
//! [`crate::repositories::IntegrationRepository::try_mark_syncing`] extends
//! the exclusion across server instances.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Set of integration ids currently held by a sync or token refresh.
#[derive(Debug, Clone, Default)]
pub struct IntegrationLocks {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl IntegrationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `integration_id`, or `None` if someone holds it.
    pub fn try_acquire(&self, integration_id: Uuid) -> Option<LockGuard> {
        if lock_set(&self.held).insert(integration_id) {
            Some(LockGuard {
                held: Arc::clone(&self.held),
                integration_id,
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, integration_id: Uuid) -> bool {
        lock_set(&self.held).contains(&integration_id)
    }
}

/// Releases the integration lock when dropped, on every exit path.
#[derive(Debug)]
pub struct LockGuard {
    held: Arc<Mutex<HashSet<Uuid>>>,
    integration_id: Uuid,
}

impl LockGuard {
    pub fn integration_id(&self) -> Uuid {
        self.integration_id
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        lock_set(&self.held).remove(&self.integration_id);
    }
}

// A poisoned set is still consistent: inserts and removes are single calls.
fn lock_set(held: &Mutex<HashSet<Uuid>>) -> MutexGuard<'_, HashSet<Uuid>> {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cancellation tokens for running syncs, keyed by integration id.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a sync that is starting. Replaces any stale entry.
    pub fn register(&self, integration_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.entries().insert(integration_id, token.clone());
        token
    }

    /// Signal the running sync for `integration_id`. Returns false when none
    /// is registered.
    pub fn cancel(&self, integration_id: Uuid) -> bool {
        match self.entries().get(&integration_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, integration_id: Uuid) {
        self.entries().remove(&integration_id);
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_guard_dropped() {
        let locks = IntegrationLocks::new();
        let id = Uuid::new_v4();

        let guard = locks.try_acquire(id).expect("first acquire");
        assert!(locks.try_acquire(id).is_none());
        assert!(locks.is_held(id));

        drop(guard);
        assert!(!locks.is_held(id));
        assert!(locks.try_acquire(id).is_some());
    }

    #[test]
    fn locks_are_per_integration() {
        let locks = IntegrationLocks::new();
        let _a = locks.try_acquire(Uuid::new_v4()).expect("a");
        assert!(locks.try_acquire(Uuid::new_v4()).is_some());
    }

    #[test]
    fn guard_releases_on_panic() {
        let locks = IntegrationLocks::new();
        let id = Uuid::new_v4();
        let cloned = locks.clone();

        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.try_acquire(id).expect("acquire");
            panic!("sync blew up");
        });

        assert!(result.is_err());
        assert!(!locks.is_held(id));
    }

    #[test]
    fn cancel_reaches_registered_token() {
        let registry = CancellationRegistry::new();
        let id = Uuid::new_v4();

        assert!(!registry.cancel(id));
        let token = registry.register(id);
        assert!(registry.cancel(id));
        assert!(token.is_cancelled());

        registry.remove(id);
        assert!(!registry.cancel(id));
    }
}
