//! Entity-sharded state
//!
//! Per-entity state (sensor statistics, alert machines, detector histories) is
//! partitioned by entity id into independently locked shards. Two entities on
//! different shards never contend, and there is no global lock.
//!
//! ```text
//!   "rack-01" ─hash─┐     ┌────────────┐
//!   "rack-02" ─hash─┼──→  │ shard 0    │  Mutex<HashMap<K, V>>
//!   "zone-a"  ─hash─┘     ├────────────┤
//!                         │ shard 1    │
//!                         ├────────────┤
//!                         │ ...        │
//!                         └────────────┘
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

/// Stable shard index for a key
///
/// `DefaultHasher::new()` uses fixed keys, so the mapping is the same for the
/// life of the process, which the runtime relies on when routing work.
pub fn shard_index<K: Hash + ?Sized>(key: &K, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Map split across independently locked shards
#[derive(Debug)]
pub struct Sharded<K, V> {
    shards: Vec<Mutex<HashMap<K, V>>>,
}

impl<K: Hash + Eq, V> Sharded<K, V> {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Lock the shard owning `key`
    pub fn lock_for<Q: Hash + ?Sized>(&self, key: &Q) -> MutexGuard<'_, HashMap<K, V>> {
        let idx = shard_index(key, self.shards.len());
        lock(&self.shards[idx])
    }

    /// Run `f` against every shard in turn, one lock at a time
    pub fn for_each_shard<F: FnMut(&mut HashMap<K, V>)>(&self, mut f: F) {
        for shard in &self.shards {
            f(&mut lock(shard));
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| lock(s).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Recover the guard from a poisoned mutex
///
/// A panic in one entity's update must not take every other entity on the
/// same shard down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
