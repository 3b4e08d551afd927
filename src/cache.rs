//! Two-tier cache: an in-process L1 (count+memory bounded) in front of an
//! optional remote L2. L2 is opportunistic — any failure there is logged
//! and treated as a miss, never surfaced as an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::models::{CacheEntry, CacheStats};

const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_MAX_BYTES: usize = 100 * 1024 * 1024;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Remote KV backend for the L2 tier. Implementations are expected to be
/// best-effort: a `Result::Err` is treated as a cache miss by the caller.
#[async_trait]
pub trait L2Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), String>;
}

/// In-process LRU-ish store, evicting oldest-accessed entries once either
/// bound is exceeded.
struct L1Store {
    entries: HashMap<String, CacheEntry<Vec<u8>>>,
    bytes_used: usize,
    max_entries: usize,
    max_bytes: usize,
}

impl L1Store {
    fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            bytes_used: 0,
            max_entries,
            max_bytes,
        }
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() > self.max_entries || self.bytes_used > self.max_bytes {
            let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(removed) = self.entries.remove(&oldest_key) {
                self.bytes_used = self.bytes_used.saturating_sub(removed.size_bytes);
            }
        }
    }

    fn insert(&mut self, key: String, value: Vec<u8>, ttl: Duration, tags: Vec<String>) {
        let size = value.len();
        if let Some(old) = self.entries.remove(&key) {
            self.bytes_used = self.bytes_used.saturating_sub(old.size_bytes);
        }
        self.entries.insert(key, CacheEntry::new(value, ttl, size, tags));
        self.bytes_used += size;
        self.evict_if_needed();
    }

    fn sweep_expired(&mut self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(removed) = self.entries.remove(key) {
                self.bytes_used = self.bytes_used.saturating_sub(removed.size_bytes);
            }
        }
        expired.len()
    }
}

/// Two-tier cache front-end. Cheap to clone (everything behind `Arc`), so
/// a background sweeper task can hold its own handle.
#[derive(Clone)]
pub struct Cache {
    l1: Arc<RwLock<L1Store>>,
    l2: Option<Arc<dyn L2Cache>>,
    stats: Arc<RwLock<CacheStats>>,
    default_ttl: Duration,
}

impl Cache {
    pub fn new(l2: Option<Arc<dyn L2Cache>>) -> Self {
        Self {
            l1: Arc::new(RwLock::new(L1Store::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_BYTES))),
            l2,
            stats: Arc::new(RwLock::new(CacheStats::default())),
            default_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_bounds(mut self, max_entries: usize, max_bytes: usize) -> Self {
        self.l1 = Arc::new(RwLock::new(L1Store::new(max_entries, max_bytes)));
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Look up `key`, checking L1 first. On an L2 hit for a `tier=all`
    /// lookup the value is promoted back into L1 so the next read is
    /// local.
    pub async fn get(&self, key: &str, check_l2: bool) -> Option<Vec<u8>> {
        {
            let mut l1 = self.l1.write().await;
            if let Some(entry) = l1.entries.get_mut(key) {
                if !entry.is_expired() {
                    entry.touch();
                    let value = entry.value.clone();
                    let mut stats = self.stats.write().await;
                    stats.l1_hits += 1;
                    return Some(value);
                }
            }
        }
        self.stats.write().await.l1_misses += 1;

        if check_l2 {
            if let Some(l2) = &self.l2 {
                match l2.get(key).await {
                    Ok(Some(value)) => {
                        self.stats.write().await.l2_hits += 1;
                        self.set(key.to_string(), value.clone(), self.default_ttl, Vec::new())
                            .await;
                        return Some(value);
                    }
                    Ok(None) => {
                        self.stats.write().await.l2_misses += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, "l2 cache get failed, treating as miss");
                        self.stats.write().await.errors += 1;
                    }
                }
            }
        }
        None
    }

    pub async fn set(&self, key: String, value: Vec<u8>, ttl: Duration, tags: Vec<String>) {
        self.l1.write().await.insert(key.clone(), value.clone(), ttl, tags);
        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.set(&key, value, ttl).await {
                warn!(error = %e, "l2 cache set failed");
                self.stats.write().await.errors += 1;
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    /// Background sweep loop: expires lazily-stale entries on an interval
    /// until `cancel` fires. Intended to be spawned once at startup.
    pub async fn run_sweeper(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.l1.write().await.sweep_expired();
                    if removed > 0 {
                        self.stats.write().await.evictions += removed as u64;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(None)
    }
}

pub fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}
