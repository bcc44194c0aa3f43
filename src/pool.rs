//! Shared worker pool for index builds.
//!
//! Every build routine goes through [`WorkerPool::map_bounded`] or
//! [`WorkerPool::for_each_bounded`]. Work is handed over in batches of at most
//! `queue_capacity` items and the producer blocks until a batch completes, so
//! streaming a large corpus never holds more than one batch in flight.
//!
//! [`ShardedMap`] serializes mutation of shared build structures with one
//! lock per shard, keyed by entity id.

use crate::config::SearchConfig;
use crate::error::Result;
#[cfg(feature = "parallel")]
use crate::error::SearchError;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Bounded-concurrency worker pool.
pub struct WorkerPool {
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
    queue_capacity: usize,
}

impl WorkerPool {
    /// Create a pool with `threads` workers (0 = one per core).
    pub fn new(threads: usize, queue_capacity: usize) -> Result<Self> {
        let queue_capacity = queue_capacity.max(1);

        #[cfg(feature = "parallel")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("traj-build-{}", i))
                .build()
                .map_err(|e| SearchError::ConfigError {
                    message: format!("cannot start worker pool: {}", e),
                })?;
            log::debug!(
                "[WorkerPool] Started {} workers, batch capacity {}",
                pool.current_num_threads(),
                queue_capacity
            );
            Ok(Self {
                pool,
                queue_capacity,
            })
        }

        #[cfg(not(feature = "parallel"))]
        {
            let _ = threads;
            log::debug!(
                "[WorkerPool] Sequential mode, batch capacity {}",
                queue_capacity
            );
            Ok(Self { queue_capacity })
        }
    }

    /// Pool sized from the build fields of `config`.
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Self::new(config.build_threads, config.build_queue_capacity)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Run `f` over every item, at most `queue_capacity` items in flight.
    pub fn for_each_bounded<I, T, F>(&self, items: I, f: F)
    where
        I: IntoIterator<Item = T>,
        T: Send,
        F: Fn(T) + Sync + Send,
    {
        let mut batch = Vec::with_capacity(self.queue_capacity);
        for item in items {
            batch.push(item);
            if batch.len() == self.queue_capacity {
                self.run_batch(std::mem::take(&mut batch), &f);
            }
        }
        if !batch.is_empty() {
            self.run_batch(batch, &f);
        }
    }

    /// Map every item through `f`, preserving input order.
    pub fn map_bounded<I, T, R, F>(&self, items: I, f: F) -> Vec<R>
    where
        I: IntoIterator<Item = T>,
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        let mut out = Vec::new();
        let mut batch = Vec::with_capacity(self.queue_capacity);
        for item in items {
            batch.push(item);
            if batch.len() == self.queue_capacity {
                out.extend(self.map_batch(std::mem::take(&mut batch), &f));
            }
        }
        if !batch.is_empty() {
            out.extend(self.map_batch(batch, &f));
        }
        out
    }

    #[cfg(feature = "parallel")]
    fn run_batch<T: Send, F: Fn(T) + Sync + Send>(&self, batch: Vec<T>, f: &F) {
        self.pool.install(|| batch.into_par_iter().for_each(f));
    }

    #[cfg(not(feature = "parallel"))]
    fn run_batch<T: Send, F: Fn(T) + Sync + Send>(&self, batch: Vec<T>, f: &F) {
        batch.into_iter().for_each(f);
    }

    #[cfg(feature = "parallel")]
    fn map_batch<T: Send, R: Send, F: Fn(T) -> R + Sync + Send>(&self, batch: Vec<T>, f: &F) -> Vec<R> {
        self.pool.install(|| batch.into_par_iter().map(f).collect())
    }

    #[cfg(not(feature = "parallel"))]
    fn map_batch<T: Send, R: Send, F: Fn(T) -> R + Sync + Send>(&self, batch: Vec<T>, f: &F) -> Vec<R> {
        batch.into_iter().map(f).collect()
    }
}

// ============================================================================
// Sharded map
// ============================================================================

const DEFAULT_SHARDS: usize = 64;

/// Hash map split into independently locked shards.
pub struct ShardedMap<K, V> {
    shards: Vec<Mutex<HashMap<K, V>>>,
}

impl<K: Hash + Eq, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl<K: Hash + Eq, V> ShardedMap<K, V> {
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    fn shard_for(&self, key: &K) -> &Mutex<HashMap<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Run `f` on the entry for `key` under its shard lock, inserting the
    /// default value first when absent.
    pub fn update<F>(&self, key: K, f: F)
    where
        V: Default,
        F: FnOnce(&mut V),
    {
        let mut shard = self
            .shard_for(&key)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(shard.entry(key).or_default());
    }

    /// Merge all shards into one map.
    pub fn into_inner(self) -> HashMap<K, V> {
        let mut merged = HashMap::new();
        for shard in self.shards {
            let map = shard
                .into_inner()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            merged.extend(map);
        }
        merged
    }
}
