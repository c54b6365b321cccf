//! Sharded per-key exclusion.
//!
//! Flushes of the same block must not overlap. Rather than one lock per block
//! id, keys hash onto a fixed array of async mutexes; unrelated keys that share
//! a shard serialize, which only costs throughput.

use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

/// Default shard count (power of two)
pub const DEFAULT_KEY_SHARDS: usize = 1024;

/// Fixed set of async mutexes addressed by key hash.
pub struct KeyLock<const N: usize = DEFAULT_KEY_SHARDS> {
    shards: Box<[Mutex<()>]>,
}

impl<const N: usize> Default for KeyLock<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> KeyLock<N> {
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "shard count must be a power of two");
        let shards: Vec<Mutex<()>> = (0..N).map(|_| Mutex::new(())).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    /// Shard a key maps to.
    pub fn shard_index<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (N - 1)
    }

    /// Wait for exclusive access to `key`'s shard.
    pub async fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.shards[self.shard_index(key)].lock().await
    }
}
