//! Bounded TTL caches for the worker's hot read paths.
//!
//! The processor touches the same workflow version and run rows for every
//! step of a run; the caches here absorb that. All three caches are
//! capacity-bounded and expire entries by age. Reads are fail-open: a cache
//! never turns a healthy load into an error, and a failed load is simply not
//! cached.
//!
//! The secret cache holds decrypted plaintext, which is why its default TTL
//! is the shortest of the three.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use runloom_types::config::CacheConfig;
use runloom_types::run::WorkflowRun;
use runloom_types::workflow::WorkflowVersion;
use uuid::Uuid;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// A capacity-bounded map whose entries expire `ttl` after insertion.
struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    capacity: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    fn new(capacity: usize, ttl: Duration) -> Self {
        TtlCache {
            entries: DashMap::new(),
            capacity,
            ttl,
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn insert(&self, key: K, value: V) {
        if self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries; if none were expired, drop the oldest.
    fn evict_one(&self) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        if self.entries.len() < before {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.inserted_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

/// Read-through caches shared by all processor invocations in a worker.
pub struct WorkerCache {
    versions: TtlCache<Uuid, WorkflowVersion>,
    runs: TtlCache<Uuid, WorkflowRun>,
    secrets: TtlCache<String, String>,
}

impl WorkerCache {
    pub fn new(config: &CacheConfig) -> Self {
        WorkerCache {
            versions: TtlCache::new(config.version_capacity, config.version_ttl()),
            runs: TtlCache::new(config.run_capacity, config.run_ttl()),
            secrets: TtlCache::new(config.secret_capacity, config.secret_ttl()),
        }
    }

    /// Workflow version by id, loading through `loader` on a miss.
    ///
    /// `None` results are not cached, so a version that appears later is
    /// picked up on the next call.
    pub async fn workflow_version<F, Fut, E>(
        &self,
        id: Uuid,
        loader: F,
    ) -> Result<Option<WorkflowVersion>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<WorkflowVersion>, E>>,
    {
        if let Some(version) = self.versions.get(&id) {
            return Ok(Some(version));
        }
        let loaded = loader().await?;
        if let Some(version) = &loaded {
            self.versions.insert(id, version.clone());
        }
        Ok(loaded)
    }

    /// Workflow run by id, loading through `loader` on a miss.
    pub async fn workflow_run<F, Fut, E>(
        &self,
        id: Uuid,
        loader: F,
    ) -> Result<Option<WorkflowRun>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<WorkflowRun>, E>>,
    {
        if let Some(run) = self.runs.get(&id) {
            return Ok(Some(run));
        }
        let loaded = loader().await?;
        if let Some(run) = &loaded {
            self.runs.insert(id, run.clone());
        }
        Ok(loaded)
    }

    /// A cached decrypted secret, by name.
    pub fn secret(&self, name: &str) -> Option<String> {
        self.secrets.get(&name.to_string())
    }

    pub fn put_secret(&self, name: &str, plaintext: String) {
        self.secrets.insert(name.to_string(), plaintext);
    }

    /// Drop a cached run so the next read sees fresh state.
    pub fn invalidate_run(&self, id: Uuid) {
        self.runs.entries.remove(&id);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
