//! Non-blocking per-(user, host pool) reservation registry.
//!
//! A reservation marks that one registration for a user is in flight against a
//! host pool. Acquisition is a single atomic insert-if-absent on a [`DashMap`]
//! entry and never waits: a caller that loses must move on to another pool or
//! create a new one. Entries are removed explicitly, or by a [`ReleaseGuard`]
//! when it is dropped.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Key of a reservation.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct LockKey {
    pub user_id: String,
    pub pool_name: String,
}

impl LockKey {
    pub fn new(user_id: impl Into<String>, pool_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            pool_name: pool_name.into(),
        }
    }
}

/// Registry of in-flight (user, host pool) reservations.
///
/// Cloning is cheap and clones share state. The registry lives in process
/// memory only; a restart drops every reservation.
#[derive(Debug, Clone, Default)]
pub struct PoolLockRegistry {
    held: Arc<DashMap<LockKey, ()>>,
}

impl PoolLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `(user_id, pool_name)` if nobody holds it.
    ///
    /// Returns `false` without waiting when the key is already held.
    pub fn try_acquire(&self, user_id: &str, pool_name: &str) -> bool {
        match self.held.entry(LockKey::new(user_id, pool_name)) {
            Entry::Occupied(_) => {
                debug!(user_id, pool_name, "pool reservation already held");
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(());
                debug!(user_id, pool_name, "pool reservation acquired");
                true
            }
        }
    }

    /// Reserves `(user_id, pool_name)` without checking for a holder.
    ///
    /// Only for host pools the caller has just created and nobody else can
    /// know about yet.
    pub fn force_acquire(&self, user_id: &str, pool_name: &str) {
        self.held.insert(LockKey::new(user_id, pool_name), ());
        debug!(user_id, pool_name, "pool reservation acquired for new host pool");
    }

    /// Drops the reservation. Releasing a key that is not held is a no-op.
    pub fn release(&self, user_id: &str, pool_name: &str) {
        if self
            .held
            .remove(&LockKey::new(user_id, pool_name))
            .is_some()
        {
            debug!(user_id, pool_name, "pool reservation released");
        }
    }

    pub fn is_held(&self, user_id: &str, pool_name: &str) -> bool {
        self.held.contains_key(&LockKey::new(user_id, pool_name))
    }

    /// Whether any user holds a reservation on `pool_name`.
    pub fn is_pool_reserved(&self, pool_name: &str) -> bool {
        self.held.iter().any(|entry| entry.key().pool_name == pool_name)
    }

    /// Returns a guard that releases `(user_id, pool_name)` when dropped,
    /// whether or not the key is currently held.
    pub fn release_on_drop(&self, user_id: &str, pool_name: &str) -> ReleaseGuard {
        ReleaseGuard {
            registry: self.clone(),
            key: LockKey::new(user_id, pool_name),
            armed: true,
        }
    }

    /// Number of reservations currently held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Releases a reservation on drop.
#[must_use = "the reservation is released as soon as the guard is dropped"]
pub struct ReleaseGuard {
    registry: PoolLockRegistry,
    key: LockKey,
    armed: bool,
}

impl ReleaseGuard {
    /// Keeps the reservation held past the guard.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.armed {
            self.registry
                .release(&self.key.user_id, &self.key.pool_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_has_single_winner() {
        let registry = PoolLockRegistry::new();
        let winners = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..64 {
            let registry = registry.clone();
            let winners = Arc::clone(&winners);
            handles.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                if registry.try_acquire("alice", "HP-Personal-ALPHA") {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(registry.is_held("alice", "HP-Personal-ALPHA"));
    }

    #[test]
    fn release_then_acquire_succeeds() {
        let registry = PoolLockRegistry::new();
        assert!(registry.try_acquire("alice", "HP-Personal-ALPHA"));
        assert!(!registry.try_acquire("alice", "HP-Personal-ALPHA"));

        registry.release("alice", "HP-Personal-ALPHA");
        assert!(registry.try_acquire("alice", "HP-Personal-ALPHA"));
    }

    #[test]
    fn release_of_unheld_key_is_noop() {
        let registry = PoolLockRegistry::new();
        registry.release("nobody", "HP-Personal-ALPHA");
        registry.release("nobody", "HP-Personal-ALPHA");
        assert!(registry.is_empty());
    }

    #[test]
    fn keys_are_independent() {
        let registry = PoolLockRegistry::new();
        assert!(registry.try_acquire("alice", "HP-Personal-ALPHA"));
        assert!(registry.try_acquire("alice", "HP-Personal-BRAVO"));
        assert!(registry.try_acquire("bob", "HP-Personal-ALPHA"));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn user_and_pool_do_not_collide_through_concatenation() {
        let registry = PoolLockRegistry::new();
        assert!(registry.try_acquire("ab", "c"));
        assert!(registry.try_acquire("a", "bc"));
    }

    #[test]
    fn pool_reservation_visible_across_users() {
        let registry = PoolLockRegistry::new();
        assert!(!registry.is_pool_reserved("HP-Personal-ALPHA"));

        registry.force_acquire("alice", "HP-Personal-ALPHA");
        assert!(registry.is_pool_reserved("HP-Personal-ALPHA"));
        assert!(!registry.is_pool_reserved("HP-Personal-BRAVO"));
        assert!(!registry.try_acquire("alice", "HP-Personal-ALPHA"));

        registry.release("alice", "HP-Personal-ALPHA");
        assert!(!registry.is_pool_reserved("HP-Personal-ALPHA"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let registry = PoolLockRegistry::new();
        assert!(registry.try_acquire("alice", "HP-Personal-ALPHA"));
        {
            let _guard = registry.release_on_drop("alice", "HP-Personal-ALPHA");
            assert!(registry.is_held("alice", "HP-Personal-ALPHA"));
        }
        assert!(!registry.is_held("alice", "HP-Personal-ALPHA"));

        // A guard for a key that was never held is harmless.
        drop(registry.release_on_drop("bob", "HP-Personal-ALPHA"));
        assert!(registry.is_empty());
    }

    #[test]
    fn disarmed_guard_keeps_reservation() {
        let registry = PoolLockRegistry::new();
        assert!(registry.try_acquire("alice", "HP-Personal-ALPHA"));

        registry
            .release_on_drop("alice", "HP-Personal-ALPHA")
            .disarm();

        assert!(registry.is_held("alice", "HP-Personal-ALPHA"));
    }
}
