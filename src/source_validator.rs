//! Probe a source URL once, score how much it's worth trusting, and keep a
//! bounded rolling history of past outcomes per URL.
//!
//! The score here (`SourceHealth::reliability_score`) is a one-shot,
//! probe-time judgment distinct from [`crate::models::SourceMetadata`]'s
//! persisted reputation score: this one answers "is this URL worth adding
//! right now", the other answers "how has this URL performed over time".

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::error::AppResult;
use crate::fetcher::{FetchRequest, Fetcher};
use crate::protocol;

const MAX_HISTORY: usize = 100;
const HISTORY_WINDOW: usize = 10;

/// Probe-time snapshot of one source's reachability and content quality.
#[derive(Debug, Clone)]
pub struct SourceHealth {
    pub url: String,
    pub accessible: bool,
    pub response_time_s: Option<f64>,
    pub content_type: Option<String>,
    pub size_bytes: usize,
    pub estimated_configs: usize,
    pub protocols_found: Vec<String>,
    pub reliability_score: f64,
    pub error: Option<String>,
    pub last_check: DateTime<Utc>,
    pub check_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
}

impl SourceHealth {
    fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            accessible: false,
            response_time_s: None,
            content_type: None,
            size_bytes: 0,
            estimated_configs: 0,
            protocols_found: Vec::new(),
            reliability_score: 0.0,
            error: None,
            last_check: Utc::now(),
            check_count: 0,
            success_count: 0,
            failure_count: 0,
        }
    }
}

/// Count lines that look like a config entry.
fn estimate_configs(content: &str) -> usize {
    content
        .lines()
        .map(str::trim)
        .filter(|line| protocol::is_valid_config(line))
        .count()
}

/// Distinct protocol keys present in `content`, plus `"clash"` when the
/// content looks like a Clash proxy list.
fn detect_protocols(content: &str) -> Vec<String> {
    let mut found: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter_map(protocol::categorize)
        .map(|p| p.key())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    if content.contains("proxies:") || content.contains("proxy-groups:") {
        found.push("clash".to_string());
    }
    found
}

/// Probes sources and tracks a bounded rolling pass/fail history per URL.
pub struct SourceValidator {
    fetcher: Arc<Fetcher>,
    history: RwLock<HashMap<String, VecDeque<bool>>>,
    cache: RwLock<HashMap<String, SourceHealth>>,
}

impl SourceValidator {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            history: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn record_history(&self, url: &str, success: bool) {
        let mut history = self.history.write().await;
        let entry = history.entry(url.to_string()).or_default();
        entry.push_back(success);
        while entry.len() > MAX_HISTORY {
            entry.pop_front();
        }
    }

    async fn recent_success_rate(&self, url: &str) -> Option<f64> {
        let history = self.history.read().await;
        let entry = history.get(url)?;
        let recent: Vec<bool> = entry.iter().rev().take(HISTORY_WINDOW).copied().collect();
        if recent.is_empty() {
            return None;
        }
        let hits = recent.iter().filter(|b| **b).count();
        Some(hits as f64 / recent.len() as f64)
    }

    async fn calculate_reliability(&self, url: &str, health: &SourceHealth) -> f64 {
        let mut score = 0.0;

        if health.accessible {
            score += 0.3;
        }

        if let Some(rt) = health.response_time_s {
            score += if rt < 2.0 {
                0.2
            } else if rt < 5.0 {
                0.15
            } else if rt < 10.0 {
                0.1
            } else if rt < 30.0 {
                0.05
            } else {
                0.0
            };
        }

        if health.estimated_configs > 1000 {
            score += 0.05;
        }
        if health.estimated_configs > 500 {
            score += 0.1;
        }
        if health.estimated_configs > 100 {
            score += 0.15;
        }

        if health.protocols_found.len() >= 3 {
            score += 0.1;
        } else if health.protocols_found.len() >= 2 {
            score += 0.05;
        }

        const VALID_CONTENT_TYPES: &[&str] = &[
            "text/plain",
            "text/yaml",
            "application/yaml",
            "application/json",
            "text/html",
            "application/octet-stream",
        ];
        if let Some(ct) = &health.content_type {
            if VALID_CONTENT_TYPES.iter().any(|v| ct.contains(v)) {
                score += 0.05;
            }
        }

        if let Some(rate) = self.recent_success_rate(url).await {
            score += rate * 0.1;
        }

        let lower = url.to_lowercase();
        if ["official", "verified", "trusted", "main"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            score += 0.05;
        }
        if ["temp", "test", "backup", "old", "dev"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            score -= 0.1;
        }

        score.clamp(0.0, 1.0)
    }

    /// Probe a single URL and return its health snapshot. Network failures
    /// never propagate as an `Err` here — they're recorded on the health
    /// record itself, matching the "per-source failures never abort a run"
    /// contract.
    #[instrument(skip(self, cancel), fields(url))]
    pub async fn validate(
        &self,
        url: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SourceHealth {
        let mut health = SourceHealth::new(url);
        let mut req = FetchRequest::new(url);
        req.timeout = timeout;

        let start = std::time::Instant::now();
        match self.fetcher.fetch(&req, cancel).await {
            Ok(body) => {
                health.accessible = true;
                health.response_time_s = Some(start.elapsed().as_secs_f64());
                health.size_bytes = body.len();
                health.estimated_configs = estimate_configs(&body);
                health.protocols_found = detect_protocols(&body);
                health.success_count = 1;
                self.record_history(url, true).await;
            }
            Err(e) => {
                warn!(url, error = %e, "source validation failed");
                health.error = Some(e.to_string());
                health.response_time_s = Some(start.elapsed().as_secs_f64());
                health.failure_count = 1;
                self.record_history(url, false).await;
            }
        }

        health.reliability_score = self.calculate_reliability(url, &health).await;
        health.check_count = 1;
        health.last_check = Utc::now();

        self.cache
            .write()
            .await
            .insert(url.to_string(), health.clone());
        health
    }

    /// Validate many URLs concurrently, bounded by `max_concurrent`. Takes
    /// `Arc<Self>` so each probe can run as its own task rather than being
    /// serialized behind a single `&self` borrow.
    pub async fn validate_many(
        self: &Arc<Self>,
        urls: &[String],
        timeout: Duration,
        max_concurrent: usize,
        cancel: &CancellationToken,
    ) -> Vec<SourceHealth> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for url in urls {
            let validator = self.clone();
            let semaphore = semaphore.clone();
            let url = url.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                validator.validate(&url, timeout, &cancel).await
            });
        }

        let mut results = Vec::with_capacity(urls.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(health) => results.push(health),
                Err(e) => warn!(error = %e, "validation task panicked"),
            }
        }
        results
    }

    pub async fn recommended(&self, min_reliability: f64, min_configs: usize) -> Vec<String> {
        let cache = self.cache.read().await;
        let mut recommended: Vec<&SourceHealth> = cache
            .values()
            .filter(|h| {
                h.accessible && h.reliability_score >= min_reliability && h.estimated_configs >= min_configs
            })
            .collect();
        recommended.sort_by(|a, b| {
            b.reliability_score
                .partial_cmp(&a.reliability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        recommended.into_iter().map(|h| h.url.clone()).collect()
    }

    pub async fn cleanup_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut cache = self.cache.write().await;
        let stale: Vec<String> = cache
            .iter()
            .filter(|(_, h)| h.last_check < cutoff)
            .map(|(url, _)| url.clone())
            .collect();
        for url in &stale {
            cache.remove(url);
        }
        let mut history = self.history.write().await;
        history.retain(|url, _| cache.contains_key(url));
        stale.len()
    }
}

pub type SourceValidatorResult<T> = AppResult<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_configs_counts_known_schemes_only() {
        let content = "vmess://abc\nnot a config\ntrojan://pw@h:443#x\n";
        assert_eq!(estimate_configs(content), 2);
    }

    #[test]
    fn detect_protocols_flags_clash_documents() {
        let content = "proxies:\n  - name: a\n";
        assert!(detect_protocols(content).contains(&"clash".to_string()));
    }

    #[tokio::test]
    async fn reliability_rewards_accessible_fast_diverse_sources() {
        let fetcher = Arc::new(
            Fetcher::new(50, 50, crate::fetcher::circuit_breaker::CircuitBreakerConfig::default())
                .expect("fetcher builds"),
        );
        let validator = SourceValidator::new(fetcher);
        let mut health = SourceHealth::new("https://official-mirror.example/list.txt");
        health.accessible = true;
        health.response_time_s = Some(1.0);
        health.estimated_configs = 1500;
        health.protocols_found = vec!["vmess".into(), "trojan".into(), "ss".into()];
        let score = validator
            .calculate_reliability("https://official-mirror.example/list.txt", &health)
            .await;
        assert!(score > 0.7, "expected high score, got {score}");
    }

    #[tokio::test]
    async fn reliability_penalizes_dev_and_test_urls() {
        let fetcher = Arc::new(
            Fetcher::new(50, 50, crate::fetcher::circuit_breaker::CircuitBreakerConfig::default())
                .expect("fetcher builds"),
        );
        let validator = SourceValidator::new(fetcher);
        let mut accessible = SourceHealth::new("x");
        accessible.accessible = true;
        let penalized = validator.calculate_reliability("https://dev.example/test-list", &accessible).await;
        let neutral = validator.calculate_reliability("https://mirror.example/list", &accessible).await;
        assert!(penalized < neutral);
    }
}
