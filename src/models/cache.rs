//! Cache entry value type shared by L1 (in-process) and L2 (remote) tiers.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// A cached value plus the bookkeeping the LRU/TTL policy needs.
///
/// `expires_at`/`last_access` are process-local (`Instant`) since cache
/// entries never cross a process boundary even when L2-backed — L2 stores
/// only the raw bytes, not this wrapper.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
    pub last_access: Instant,
    pub size_bytes: usize,
    pub tags: Vec<String>,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: std::time::Duration, size_bytes: usize, tags: Vec<String>) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: now + ttl,
            last_access: now,
            size_bytes,
            tags,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }
}

/// Aggregate hit/miss/eviction counters for both cache tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub evictions: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.l1_hits + self.l2_hits;
        let total = hits + self.l1_misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
