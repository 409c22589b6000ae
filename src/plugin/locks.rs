//! Per-plugin mutation locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One lock per plugin id, created on demand.
///
/// Acquisition never waits: a second mutation on a busy id is refused so
/// the caller gets an immediate, retryable answer. Locks of unrelated ids
/// never contend.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key`, or `None` if another operation holds it.
    pub fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().ok()?;
            // Entries only referenced by the map are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_refused() {
        let locks = KeyedLocks::new();
        let guard = locks.try_acquire("acme").unwrap();
        assert!(locks.try_acquire("acme").is_none());

        drop(guard);
        assert!(locks.try_acquire("acme").is_some());
    }

    #[test]
    fn test_keys_are_independent() {
        let locks = KeyedLocks::new();
        let _a = locks.try_acquire("a").unwrap();
        assert!(locks.try_acquire("b").is_some());
    }

    #[test]
    fn test_idle_entries_are_pruned() {
        let locks = KeyedLocks::new();
        drop(locks.try_acquire("a"));
        drop(locks.try_acquire("b"));
        let map = locks.locks.lock().unwrap();
        assert!(map.len() <= 1);
        assert!(map.values().all(|lock| Arc::strong_count(lock) == 1));
    }
}
