//! Per-key async locks.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap<K> = StdMutex<HashMap<K, Arc<Mutex<()>>>>;

fn lock_map<K>(map: &LockMap<K>) -> MutexGuard<'_, HashMap<K, Arc<Mutex<()>>>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A map of lazily created per-key mutexes.
///
/// Holders of different keys never contend; holders of the same key are
/// serialized in FIFO order. An entry lives only while someone holds or
/// waits for its key.
pub struct KeyedLocks<K> {
    locks: Arc<LockMap<K>>,
}

/// Exclusive access to one key; released on drop.
pub struct KeyGuard<K: Eq + Hash> {
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    locks: Arc<LockMap<K>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Create an empty lock map.
    pub fn new() -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> KeyGuard<K> {
        let mutex = lock_map(&self.locks).entry(key.clone()).or_default().clone();
        KeyGuard {
            guard: Some(mutex.lock_owned().await),
            key: key.clone(),
            locks: self.locks.clone(),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    /// Whether no key is held or waited on.
    pub fn is_empty(&self) -> bool {
        lock_map(&self.locks).is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = lock_map(&self.locks);
        // Waiters clone the entry under the map lock, so a count of one means
        // only the map refers to it.
        if map.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            map.remove(&self.key);
        }
    }
}
