//! In-process cluster store
//!
//! Default engine behind the `Cluster`/`DMap` traits: one map per qualified
//! table, TTL and max-idle expiry applied lazily on read, LRU-sampled
//! eviction on write when the key or byte budget is exceeded. A real
//! distributed backend replaces this behind the same traits without
//! touching the proxy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use pgscale_common::config::{DMapParams, EvictionPolicy};
use pgscale_common::error::{PgScaleError, Result};

use crate::dmaps::{Cluster, DMap};

const DEFAULT_LRU_SAMPLES: usize = 5;

/// Hit/miss/eviction counters for one map
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct Entry {
    data: Bytes,
    /// Milliseconds since the map's base instant
    inserted_ms: u64,
    last_used_ms: AtomicU64,
}

/// One in-process map with the cluster parameters of its table.
pub struct MemoryDMap {
    name: String,
    params: DMapParams,
    entries: DashMap<String, Entry>,
    in_use_bytes: AtomicU64,
    base: Instant,
    stats: CacheStats,
}

impl MemoryDMap {
    fn new(name: &str, params: DMapParams) -> Self {
        Self {
            name: name.to_string(),
            params,
            entries: DashMap::new(),
            in_use_bytes: AtomicU64::new(0),
            base: Instant::now(),
            stats: CacheStats::default(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    fn is_expired(&self, entry: &Entry, now_ms: u64) -> bool {
        if let Some(ttl) = self.params.ttl_secs {
            if now_ms.saturating_sub(entry.inserted_ms) >= ttl * 1000 {
                return true;
            }
        }
        if let Some(max_idle) = self.params.max_idle_secs {
            let last_used = entry.last_used_ms.load(Ordering::Relaxed);
            if now_ms.saturating_sub(last_used) >= max_idle * 1000 {
                return true;
            }
        }
        false
    }

    fn over_budget(&self) -> bool {
        if let Some(max_keys) = self.params.max_keys {
            if self.entries.len() > max_keys {
                return true;
            }
        }
        if let Some(max_inuse) = self.params.max_inuse_bytes {
            if self.in_use_bytes.load(Ordering::Relaxed) as usize > max_inuse {
                return true;
            }
        }
        false
    }

    /// Sample a handful of entries and drop the least recently used one.
    fn evict_one(&self) -> bool {
        let samples = self.params.lru_samples.unwrap_or(DEFAULT_LRU_SAMPLES);
        let victim = self
            .entries
            .iter()
            .take(samples.max(1))
            .min_by_key(|e| e.value().last_used_ms.load(Ordering::Relaxed))
            .map(|e| e.key().clone());

        match victim {
            Some(key) => {
                if let Some((_, entry)) = self.entries.remove(&key) {
                    self.in_use_bytes
                        .fetch_sub(entry.data.len() as u64, Ordering::Relaxed);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(map = %self.name, key = %key, "Evicted cache entry");
                }
                true
            }
            None => false,
        }
    }

    fn remove_expired(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.in_use_bytes
                .fetch_sub(entry.data.len() as u64, Ordering::Relaxed);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[async_trait]
impl DMap for MemoryDMap {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let now_ms = self.now_ms();

        let expired = match self.entries.get(key) {
            Some(entry) => {
                if self.is_expired(&entry, now_ms) {
                    true
                } else {
                    entry.last_used_ms.store(now_ms, Ordering::Relaxed);
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.data.clone());
                }
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return Err(PgScaleError::KeyNotFound);
            }
        };

        if expired {
            self.remove_expired(key);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        Err(PgScaleError::KeyNotFound)
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let now_ms = self.now_ms();
        let size = value.len() as u64;

        let previous = self.entries.insert(
            key.to_string(),
            Entry {
                data: value,
                inserted_ms: now_ms,
                last_used_ms: AtomicU64::new(now_ms),
            },
        );
        if let Some(previous) = previous {
            self.in_use_bytes
                .fetch_sub(previous.data.len() as u64, Ordering::Relaxed);
        }
        self.in_use_bytes.fetch_add(size, Ordering::Relaxed);

        if self.params.eviction_policy == EvictionPolicy::Lru {
            while self.over_budget() {
                if !self.evict_one() {
                    break;
                }
            }
        }

        Ok(())
    }
}

/// In-process cluster: a factory of `MemoryDMap` instances.
#[derive(Default)]
pub struct MemoryCluster;

#[async_trait]
impl Cluster for MemoryCluster {
    async fn create_dmap(&self, name: &str, params: &DMapParams) -> Result<Arc<dyn DMap>> {
        debug!(name = %name, ?params, "Creating in-process dmap");
        Ok(Arc::new(MemoryDMap::new(name, params.clone())))
    }
}
