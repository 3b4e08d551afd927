//! Candidate source-URL discovery: a static seed list plus an optional
//! bounded code-search step, filtered down to plausible subscription
//! links.
//!
//! Grounded on the original `discover_sources()` routine: a fixed list of
//! search pages, a regex over raw.githubusercontent.com links, and a
//! keyword allow/deny list — reimplemented here as a pluggable search
//! backend so this crate never depends on a specific search API.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

/// Static fallback list, always included regardless of whether a
/// code-search provider is configured.
pub const SEED_SOURCES: &[&str] = &[
    "https://raw.githubusercontent.com/mermeroo/V2RAY-CLASH-BASE64-Subscription.Links/main/main.txt",
    "https://raw.githubusercontent.com/freefq/free/master/v2",
    "https://raw.githubusercontent.com/Pawdroid/Free-servers/main/sub",
    "https://raw.githubusercontent.com/barry-far/V2ray-config/main/All_Configs_Sub.txt",
];

static RAW_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https://raw\.githubusercontent\.com/[^\s"'<>]+?\.(?:txt|ya?ml|json)"#)
        .expect("static raw-url regex is valid")
});

const DENY_KEYWORDS: &[&str] = &["license", "readme", "/rules", "acl4ssr"];
const ALLOW_KEYWORDS: &[&str] = &[
    "sub",
    "mix",
    "subscribe",
    "subscription",
    "clash",
    "v2ray",
    "vmess",
    "vless",
    "trojan",
    "sing",
];

/// A plausible subscription URL passes the deny list and matches at least
/// one allow keyword, case-insensitively.
pub fn is_plausible(url: &str) -> bool {
    let lower = url.to_lowercase();
    if DENY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return false;
    }
    ALLOW_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Extract plausible raw-file URLs out of an HTML/text blob (a search
/// results page body, typically).
pub fn extract_candidates(body: &str) -> Vec<String> {
    RAW_URL_RE
        .find_iter(body)
        .map(|m| m.as_str().to_string())
        .filter(|u| is_plausible(u))
        .collect()
}

/// A pluggable code-search backend (e.g. a GitHub code-search client).
/// Kept as a trait so this crate never bundles a specific search API
/// credential or rate-limit policy.
#[async_trait]
pub trait CodeSearchProvider: Send + Sync {
    /// Returns raw response bodies for whatever queries this provider is
    /// configured with. Implementations own their own backoff; a `None`
    /// quota hint means "no signal available".
    async fn search(&self, remaining_quota_hint: Option<u32>) -> Vec<String>;
}

/// Discovers candidate subscription-source URLs.
pub struct SourceDiscovery {
    search: Option<std::sync::Arc<dyn CodeSearchProvider>>,
    quota_backoff_threshold: u32,
}

impl SourceDiscovery {
    pub fn new() -> Self {
        Self {
            search: None,
            quota_backoff_threshold: 5,
        }
    }

    pub fn with_search_provider(mut self, provider: std::sync::Arc<dyn CodeSearchProvider>) -> Self {
        self.search = Some(provider);
        self
    }

    /// Discover up to `cap` candidate URLs: the seed list always included,
    /// deduplicated against any code-search results.
    pub async fn discover(&self, cap: usize, remaining_quota_hint: Option<u32>) -> Vec<String> {
        let mut ordered: Vec<String> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for url in SEED_SOURCES {
            if seen.insert(url.to_string()) {
                ordered.push(url.to_string());
            }
        }

        if let Some(provider) = &self.search {
            if remaining_quota_hint.is_some_and(|q| q <= self.quota_backoff_threshold) {
                debug!(
                    remaining_quota_hint,
                    "search quota low, skipping code-search discovery this round"
                );
            } else {
                let bodies = provider.search(remaining_quota_hint).await;
                for body in bodies {
                    for candidate in extract_candidates(&body) {
                        if seen.insert(candidate.clone()) {
                            ordered.push(candidate);
                        }
                    }
                }
            }
        }

        if ordered.len() > cap {
            warn!(
                discovered = ordered.len(),
                cap, "truncating discovered sources to configured cap"
            );
            ordered.truncate(cap);
        }
        ordered
    }
}

impl Default for SourceDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plausible_rejects_license_and_readme_links() {
        assert!(!is_plausible(
            "https://raw.githubusercontent.com/x/y/main/LICENSE"
        ));
        assert!(!is_plausible(
            "https://raw.githubusercontent.com/x/y/main/README.md"
        ));
    }

    #[test]
    fn plausible_accepts_subscription_style_links() {
        assert!(is_plausible(
            "https://raw.githubusercontent.com/x/y/main/clash_sub.yaml"
        ));
    }

    #[test]
    fn extract_candidates_filters_non_raw_and_implausible_urls() {
        let body = r#"
            see https://raw.githubusercontent.com/a/b/main/vmess_sub.txt here
            and https://raw.githubusercontent.com/a/b/main/README.md
            and https://example.com/not-raw.txt
        "#;
        let found = extract_candidates(body);
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("vmess_sub.txt"));
    }

    struct StubProvider(Vec<String>);

    #[async_trait]
    impl CodeSearchProvider for StubProvider {
        async fn search(&self, _remaining_quota_hint: Option<u32>) -> Vec<String> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn discover_merges_seed_list_with_search_results_and_dedups() {
        let body = "https://raw.githubusercontent.com/a/b/main/clash_mix.yaml".to_string();
        let discovery = SourceDiscovery::new().with_search_provider(std::sync::Arc::new(
            StubProvider(vec![body.clone(), body.clone()]),
        ));
        let found = discovery.discover(100, Some(50)).await;
        assert!(found.len() > SEED_SOURCES.len());
        assert_eq!(found.iter().filter(|u| *u == &body).count(), 1);
    }

    #[tokio::test]
    async fn discover_respects_cap() {
        let discovery = SourceDiscovery::new();
        let found = discovery.discover(1, None).await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn low_quota_skips_search_but_keeps_seed_list() {
        let discovery = SourceDiscovery::new().with_search_provider(std::sync::Arc::new(
            StubProvider(vec!["https://raw.githubusercontent.com/a/b/main/v2ray.txt".to_string()]),
        ));
        let found = discovery.discover(100, Some(1)).await;
        assert_eq!(found.len(), SEED_SOURCES.len());
    }
}
