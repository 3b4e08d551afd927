//! Filter and deduplicate parsed configs.
//!
//! Filter order matters: cheap substring/set checks run before the
//! regexes, and the semantic-hash membership check — the only one that
//! needs the full authoritative set — runs last.

use std::collections::HashSet;

use regex::Regex;
use tracing::info;

use crate::models::{ConfigResult, SemanticHash};

/// Declarative filter set, normally built once from CLI/config and reused
/// across a whole run.
#[derive(Debug, Default, Clone)]
pub struct DedupFilters {
    pub tls_fragment: Option<String>,
    pub include_protocols: HashSet<String>,
    pub exclude_protocols: HashSet<String>,
    pub include_countries: HashSet<String>,
    pub exclude_countries: HashSet<String>,
    pub include_regexes: Vec<String>,
    pub exclude_regexes: Vec<String>,
}

impl DedupFilters {
    fn compiled_include(&self) -> Vec<Regex> {
        self.include_regexes
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    }

    fn compiled_exclude(&self) -> Vec<Regex> {
        self.exclude_regexes
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    }
}

/// Bloom-accelerated semantic-hash deduplicator. The bloom filter is a
/// pure optimization: a negative is authoritative (hash is new), a
/// positive still gets confirmed against `seen`, so a construction
/// failure (bad capacity/fp-rate) just degrades to hashset-only dedup.
pub struct Deduplicator {
    filters: DedupFilters,
    include_regexes: Vec<Regex>,
    exclude_regexes: Vec<Regex>,
    bloom: Option<bloomfilter::Bloom<u128>>,
    seen: HashSet<u128>,
}

impl Deduplicator {
    pub fn new(filters: DedupFilters, expected_capacity: usize) -> Self {
        let bloom = bloomfilter::Bloom::new_for_fp_rate(expected_capacity.max(1024), 0.01).ok();
        Self {
            include_regexes: filters.compiled_include(),
            exclude_regexes: filters.compiled_exclude(),
            filters,
            bloom,
            seen: HashSet::new(),
        }
    }

    fn passes_filters(&self, result: &ConfigResult) -> bool {
        let text = result.raw_config.to_lowercase();

        if let Some(fragment) = &self.filters.tls_fragment {
            if !fragment.is_empty() && !text.contains(&fragment.to_lowercase()) {
                return false;
            }
        }

        let protocol_upper = result.protocol.key().to_uppercase();
        if !self.filters.include_protocols.is_empty()
            && !self.filters.include_protocols.contains(&protocol_upper)
        {
            return false;
        }
        if self.filters.exclude_protocols.contains(&protocol_upper) {
            return false;
        }

        if let Some(country) = result.country() {
            let country_upper = country.to_uppercase();
            if !self.filters.include_countries.is_empty()
                && !self.filters.include_countries.contains(&country_upper)
            {
                return false;
            }
            if self.filters.exclude_countries.contains(&country_upper) {
                return false;
            }
        }

        if !self.exclude_regexes.is_empty() && self.exclude_regexes.iter().any(|r| r.is_match(&text)) {
            return false;
        }
        if !self.include_regexes.is_empty() && !self.include_regexes.iter().any(|r| r.is_match(&text)) {
            return false;
        }

        true
    }

    /// Whether `hash` has already been seen. Checks the bloom filter first
    /// to skip the (larger) authoritative set on the common not-seen path.
    fn is_duplicate(&mut self, hash: SemanticHash) -> bool {
        if let Some(bloom) = &self.bloom {
            if !bloom.check(&hash.0) {
                bloom_insert(&mut self.bloom, hash.0);
                self.seen.insert(hash.0);
                return false;
            }
        }
        if self.seen.insert(hash.0) {
            bloom_insert(&mut self.bloom, hash.0);
            false
        } else {
            true
        }
    }

    /// Filter and deduplicate, preserving input order among survivors.
    pub fn deduplicate(&mut self, results: Vec<ConfigResult>) -> Vec<ConfigResult> {
        let total = results.len();
        let mut unique = Vec::with_capacity(total);

        for result in results {
            if !self.passes_filters(&result) {
                continue;
            }
            if self.is_duplicate(result.semantic_hash) {
                continue;
            }
            unique.push(result);
        }

        let duplicates = total - unique.len();
        let efficiency = if total > 0 {
            duplicates as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        info!(duplicates, efficiency_pct = efficiency, "deduplication complete");
        unique
    }
}

fn bloom_insert(bloom: &mut Option<bloomfilter::Bloom<u128>>, value: u128) {
    if let Some(b) = bloom {
        b.set(&value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;

    fn result(raw: &str, protocol: Protocol, hash: u128) -> ConfigResult {
        ConfigResult::new(raw, protocol, None, None, "https://s", SemanticHash(hash))
    }

    #[test]
    fn drops_exact_duplicate_hashes() {
        let mut dedup = Deduplicator::new(DedupFilters::default(), 100);
        let results = vec![
            result("vmess://a", Protocol::VMess, 1),
            result("vmess://a-dup", Protocol::VMess, 1),
            result("vmess://b", Protocol::VMess, 2),
        ];
        let out = dedup.deduplicate(results);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn include_protocols_filters_out_others() {
        let filters = DedupFilters {
            include_protocols: ["TROJAN".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let mut dedup = Deduplicator::new(filters, 100);
        let results = vec![
            result("vmess://a", Protocol::VMess, 1),
            result("trojan://b", Protocol::Trojan, 2),
        ];
        let out = dedup.deduplicate(results);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].protocol, Protocol::Trojan);
    }

    #[test]
    fn exclude_regex_drops_matching_raw_config() {
        let filters = DedupFilters {
            exclude_regexes: vec!["blocked".to_string()],
            ..Default::default()
        };
        let mut dedup = Deduplicator::new(filters, 100);
        let results = vec![
            result("vmess://blocked-host", Protocol::VMess, 1),
            result("vmess://ok-host", Protocol::VMess, 2),
        ];
        let out = dedup.deduplicate(results);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn preserves_insertion_order_of_survivors() {
        let mut dedup = Deduplicator::new(DedupFilters::default(), 100);
        let results = vec![
            result("c", Protocol::VMess, 3),
            result("a", Protocol::VMess, 1),
            result("b", Protocol::VMess, 2),
        ];
        let out = dedup.deduplicate(results);
        assert_eq!(out[0].semantic_hash.0, 3);
        assert_eq!(out[1].semantic_hash.0, 1);
        assert_eq!(out[2].semantic_hash.0, 2);
    }
}
