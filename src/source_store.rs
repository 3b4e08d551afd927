//! Load, persist, and mutate the set of known sources across two files:
//! a tiered-groups `sources.yaml` (the human-edited source of truth) and a
//! `source_performance.json` sibling that carries everything this process
//! measured about each URL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{SourceMetadata, SourceState, Tier};
use crate::utils::atomic_write;

/// Tiered-groups document shape: `sources: { <tier>: { urls: [...] } }`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SourcesDocument {
    #[serde(default)]
    sources: serde_yaml::Value,
}

#[derive(Debug, Serialize)]
struct TierGroup {
    urls: Vec<String>,
}

/// One URL normalized out of either list or tiered-dict form.
struct NormalizedSource {
    url: String,
    tier: Option<String>,
}

/// Accepts both shapes the upstream config has used historically: a flat
/// list of URLs/objects, or a dict of tier name → `{urls: [...]}`.
fn normalize_sources(value: &serde_yaml::Value) -> Vec<NormalizedSource> {
    let mut normalized = Vec::new();

    match value {
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                match item {
                    serde_yaml::Value::String(s) => normalized.push(NormalizedSource {
                        url: s.clone(),
                        tier: None,
                    }),
                    serde_yaml::Value::Mapping(m) => {
                        if let Some(url) = m.get("url").and_then(|v| v.as_str()) {
                            let tier = m.get("tier").and_then(|v| v.as_str()).map(str::to_string);
                            normalized.push(NormalizedSource {
                                url: url.to_string(),
                                tier,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        serde_yaml::Value::Mapping(tiers) => {
            for (tier_key, tier_value) in tiers {
                let Some(tier_name) = tier_key.as_str() else {
                    continue;
                };
                let urls: Vec<&serde_yaml::Value> = match tier_value {
                    serde_yaml::Value::Mapping(m) => m
                        .get("urls")
                        .and_then(|v| v.as_sequence())
                        .map(|seq| seq.iter().collect())
                        .unwrap_or_default(),
                    serde_yaml::Value::Sequence(seq) => seq.iter().collect(),
                    _ => Vec::new(),
                };
                for u in urls {
                    match u {
                        serde_yaml::Value::String(s) => normalized.push(NormalizedSource {
                            url: s.clone(),
                            tier: Some(tier_name.to_string()),
                        }),
                        serde_yaml::Value::Mapping(m) => {
                            if let Some(url) = m.get("url").and_then(|v| v.as_str()) {
                                normalized.push(NormalizedSource {
                                    url: url.to_string(),
                                    tier: Some(tier_name.to_string()),
                                });
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        _ => {}
    }

    normalized
}

fn parse_tier(name: Option<&str>) -> Tier {
    match name.map(str::to_lowercase).as_deref() {
        Some("premium") => Tier::Premium,
        Some("reliable") => Tier::Reliable,
        Some("experimental") => Tier::Experimental,
        _ => Tier::Bulk,
    }
}

fn tier_name(tier: Tier) -> &'static str {
    match tier {
        Tier::Premium => "premium",
        Tier::Reliable => "reliable",
        Tier::Bulk => "bulk",
        Tier::Experimental => "experimental",
    }
}

/// Persisted fields mirrored into `source_performance.json`, one entry per
/// URL. A plain struct rather than reusing `SourceMetadata` wholesale keeps
/// the on-disk shape stable even if in-memory fields grow.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PerformanceEntry {
    tier: Tier,
    weight: f64,
    success_count: u64,
    failure_count: u64,
    avg_response_time_s: f64,
    avg_config_count: f64,
    reputation_score: f64,
    state: SourceState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    is_blacklisted: bool,
    blacklist_reason: Option<String>,
    last_check: Option<DateTime<Utc>>,
}

impl From<&SourceMetadata> for PerformanceEntry {
    fn from(m: &SourceMetadata) -> Self {
        Self {
            tier: m.tier,
            weight: m.weight,
            success_count: m.success_count,
            failure_count: m.failure_count,
            avg_response_time_s: m.avg_response_time_s,
            avg_config_count: m.avg_config_count,
            reputation_score: m.reputation_score,
            state: m.state,
            consecutive_failures: m.consecutive_failures,
            consecutive_successes: m.consecutive_successes,
            is_blacklisted: m.is_blacklisted,
            blacklist_reason: m.blacklist_reason.clone(),
            last_check: m.last_check,
        }
    }
}

fn apply_performance(meta: &mut SourceMetadata, perf: &PerformanceEntry) {
    meta.weight = perf.weight;
    meta.success_count = perf.success_count;
    meta.failure_count = perf.failure_count;
    meta.avg_response_time_s = perf.avg_response_time_s;
    meta.avg_config_count = perf.avg_config_count;
    meta.reputation_score = perf.reputation_score;
    meta.state = perf.state;
    meta.consecutive_failures = perf.consecutive_failures;
    meta.consecutive_successes = perf.consecutive_successes;
    meta.is_blacklisted = perf.is_blacklisted;
    meta.blacklist_reason = perf.blacklist_reason.clone();
    meta.last_check = perf.last_check;
}

/// Owns the on-disk source configuration and performance history. Single
/// writer, lock-free-ish reads (an `RwLock` held only for the in-memory
/// map, never across I/O).
pub struct SourceStateStore {
    sources_path: PathBuf,
    performance_path: PathBuf,
    sources: RwLock<HashMap<String, SourceMetadata>>,
}

impl SourceStateStore {
    /// Load `sources.yaml` plus its sibling `source_performance.json`. A
    /// missing or malformed sources file is not fatal: the store just
    /// starts empty, matching the pipeline's "fall back, never crash" rule
    /// for source configuration.
    pub async fn load(sources_path: impl Into<PathBuf>) -> AppResult<Self> {
        let sources_path = sources_path.into();
        let performance_path = sources_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("source_performance.json");

        let mut sources = HashMap::new();

        match tokio::fs::read_to_string(&sources_path).await {
            Ok(raw) => match serde_yaml::from_str::<SourcesDocument>(&raw) {
                Ok(doc) => {
                    for normalized in normalize_sources(&doc.sources) {
                        let tier = parse_tier(normalized.tier.as_deref());
                        sources
                            .entry(normalized.url.clone())
                            .or_insert_with(|| SourceMetadata::new(normalized.url, tier, 1.0));
                    }
                }
                Err(e) => warn!(path = %sources_path.display(), error = %e, "malformed sources file, starting empty"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %sources_path.display(), "no sources file yet");
            }
            Err(e) => {
                warn!(path = %sources_path.display(), error = %e, "could not read sources file");
            }
        }

        if let Ok(raw) = tokio::fs::read_to_string(&performance_path).await {
            if let Ok(perf_map) = serde_json::from_str::<HashMap<String, PerformanceEntry>>(&raw) {
                for (url, perf) in perf_map {
                    if let Some(meta) = sources.get_mut(&url) {
                        apply_performance(meta, &perf);
                    }
                }
            }
        }

        Ok(Self {
            sources_path,
            performance_path,
            sources: RwLock::new(sources),
        })
    }

    pub async fn all(&self) -> Vec<SourceMetadata> {
        self.sources.read().await.values().cloned().collect()
    }

    pub async fn get(&self, url: &str) -> Option<SourceMetadata> {
        self.sources.read().await.get(url).cloned()
    }

    /// Add `url` if it isn't already tracked, then persist both files.
    /// Idempotent: re-adding an existing URL is a no-op that still
    /// succeeds, matching the original manager's dict-API behavior.
    pub async fn add_atomic(&self, url: &str, tier: Tier, weight: f64) -> AppResult<bool> {
        let inserted = {
            let mut sources = self.sources.write().await;
            if sources.contains_key(url) {
                false
            } else {
                sources.insert(
                    url.to_string(),
                    SourceMetadata::new(url.to_string(), tier, weight),
                );
                true
            }
        };
        self.save_sources().await?;
        self.save_performance().await?;
        Ok(inserted)
    }

    pub async fn record_check(
        &self,
        url: &str,
        success: bool,
        response_time_s: f64,
        config_count: u64,
    ) -> AppResult<()> {
        {
            let mut sources = self.sources.write().await;
            let Some(meta) = sources.get_mut(url) else {
                return Err(AppError::ConfigError(format!("unknown source: {url}")));
            };
            meta.record_check(success, response_time_s, config_count);
        }
        self.save_performance().await
    }

    pub async fn blacklist(&self, url: &str, reason: impl Into<String>) -> AppResult<()> {
        {
            let mut sources = self.sources.write().await;
            let Some(meta) = sources.get_mut(url) else {
                return Err(AppError::ConfigError(format!("unknown source: {url}")));
            };
            meta.blacklist(reason.into());
        }
        self.save_performance().await
    }

    pub async fn whitelist(&self, url: &str) -> AppResult<()> {
        {
            let mut sources = self.sources.write().await;
            let Some(meta) = sources.get_mut(url) else {
                return Err(AppError::ConfigError(format!("unknown source: {url}")));
            };
            meta.whitelist();
        }
        self.save_performance().await
    }

    /// Drop sources whose last check is older than `max_age_days`, or that
    /// have never been checked and were added longer ago than that (a
    /// source with no `last_check` is kept — it simply hasn't run yet).
    pub async fn cleanup_older_than(&self, max_age_days: i64) -> AppResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        let removed = {
            let mut sources = self.sources.write().await;
            let stale: Vec<String> = sources
                .iter()
                .filter(|(_, m)| m.last_check.is_some_and(|t| t < cutoff))
                .map(|(url, _)| url.clone())
                .collect();
            for url in &stale {
                sources.remove(url);
            }
            stale.len()
        };
        if removed > 0 {
            self.save_sources().await?;
            self.save_performance().await?;
        }
        Ok(removed)
    }

    pub async fn save_sources(&self) -> AppResult<()> {
        let sources = self.sources.read().await;
        let mut groups: HashMap<&'static str, TierGroup> = HashMap::new();
        for meta in sources.values() {
            groups
                .entry(tier_name(meta.tier))
                .or_insert_with(|| TierGroup { urls: Vec::new() })
                .urls
                .push(meta.url.clone());
        }
        let doc = serde_yaml::to_value(&groups)
            .map_err(|e| AppError::ConfigError(format!("failed to serialize sources: {e}")))?;
        let wrapped = SourcesDocument { sources: doc };
        let yaml = serde_yaml::to_string(&wrapped)
            .map_err(|e| AppError::ConfigError(format!("failed to serialize sources: {e}")))?;
        atomic_write(&self.sources_path, &yaml).await
    }

    pub async fn save_performance(&self) -> AppResult<()> {
        let sources = self.sources.read().await;
        let perf: HashMap<&String, PerformanceEntry> = sources
            .iter()
            .map(|(url, meta)| (url, PerformanceEntry::from(meta)))
            .collect();
        let json = serde_json::to_string_pretty(&perf)
            .map_err(|e| AppError::ConfigError(format!("failed to serialize performance data: {e}")))?;
        atomic_write(&self.performance_path, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_flat_list_of_urls() {
        let value: serde_yaml::Value = serde_yaml::from_str("- https://a.example\n- https://b.example\n").unwrap();
        let out = normalize_sources(&value);
        assert_eq!(out.len(), 2);
        assert!(out[0].tier.is_none());
    }

    #[test]
    fn normalizes_tiered_dict_with_urls_key() {
        let yaml = "premium:\n  urls:\n    - https://a.example\nbulk:\n  urls:\n    - https://b.example\n";
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let out = normalize_sources(&value);
        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|s| s.tier.as_deref() == Some("premium")));
    }

    #[tokio::test]
    async fn add_atomic_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sources.yaml");
        let store = SourceStateStore::load(&path).await.expect("load empty store");

        assert!(store.add_atomic("https://mirror.example/list.txt", Tier::Reliable, 1.0).await.unwrap());
        assert!(!store.add_atomic("https://mirror.example/list.txt", Tier::Reliable, 1.0).await.unwrap());

        let reloaded = SourceStateStore::load(&path).await.expect("reload store");
        let all = reloaded.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tier, Tier::Reliable);
    }

    #[tokio::test]
    async fn record_check_persists_reputation_across_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sources.yaml");
        let store = SourceStateStore::load(&path).await.expect("load empty store");
        store.add_atomic("https://mirror.example/list.txt", Tier::Bulk, 1.0).await.unwrap();
        store
            .record_check("https://mirror.example/list.txt", true, 1.2, 50)
            .await
            .unwrap();

        let reloaded = SourceStateStore::load(&path).await.expect("reload store");
        let meta = reloaded.get("https://mirror.example/list.txt").await.expect("present");
        assert_eq!(meta.success_count, 1);
    }
}
