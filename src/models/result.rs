//! The normalized parsed-configuration record that flows from the parser
//! through the tester/scorer and into the formatter.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of proxy protocols this crate understands. `Other` carries
/// the lowercase scheme so best-effort formatters can still emit something.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    VMess,
    VLess,
    Reality,
    Trojan,
    Shadowsocks,
    ShadowsocksR,
    Hysteria,
    Hysteria2,
    Tuic,
    WireGuard,
    Naive,
    Brook,
    Snell,
    ShadowTls,
    Juicity,
    Socks,
    Http,
    Other(String),
}

impl Protocol {
    /// Whether this protocol's transport includes a TLS handshake layer.
    pub fn is_tls_like(&self) -> bool {
        matches!(
            self,
            Protocol::VMess | Protocol::VLess | Protocol::Trojan | Protocol::Reality
        ) || matches!(self, Protocol::Other(s) if s == "xray")
    }

    /// Display name used in CSV/report output (`VMess`, `Trojan`, ...).
    pub fn display_name(&self) -> String {
        match self {
            Protocol::VMess => "VMess".to_string(),
            Protocol::VLess => "VLess".to_string(),
            Protocol::Reality => "Reality".to_string(),
            Protocol::Trojan => "Trojan".to_string(),
            Protocol::Shadowsocks => "Shadowsocks".to_string(),
            Protocol::ShadowsocksR => "ShadowsocksR".to_string(),
            Protocol::Hysteria => "Hysteria".to_string(),
            Protocol::Hysteria2 => "Hysteria2".to_string(),
            Protocol::Tuic => "Tuic".to_string(),
            Protocol::WireGuard => "WireGuard".to_string(),
            Protocol::Naive => "Naive".to_string(),
            Protocol::Brook => "Brook".to_string(),
            Protocol::Snell => "Snell".to_string(),
            Protocol::ShadowTls => "ShadowTls".to_string(),
            Protocol::Juicity => "Juicity".to_string(),
            Protocol::Socks => "Socks".to_string(),
            Protocol::Http => "Http".to_string(),
            Protocol::Other(s) => s.clone(),
        }
    }

    /// Lowercased key used for per-protocol concurrency semaphores and
    /// filter sets.
    pub fn key(&self) -> String {
        self.display_name().to_lowercase()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A 128-bit opaque fingerprint, computed over `{protocol, normalized-host,
/// port, canonicalized-params}` only — never over tags/remarks/fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SemanticHash(pub u128);

impl fmt::Display for SemanticHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Normalized parsed configuration, flowing Parser → Deduplicator →
/// (optional) Tester → Scorer → Formatter. Not persisted across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResult {
    pub raw_config: String,
    pub protocol: Protocol,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub source_url: String,
    pub ping_time_s: Option<f64>,
    pub is_reachable: bool,
    pub handshake_ok: Option<bool>,
    pub app_test_results: HashMap<String, Option<bool>>,
    pub quality_score: Option<f64>,
    pub semantic_hash: SemanticHash,
    pub metadata: HashMap<String, String>,
}

impl ConfigResult {
    pub fn new(
        raw_config: impl Into<String>,
        protocol: Protocol,
        host: Option<String>,
        port: Option<u16>,
        source_url: impl Into<String>,
        semantic_hash: SemanticHash,
    ) -> Self {
        Self {
            raw_config: raw_config.into(),
            protocol,
            host,
            port,
            source_url: source_url.into(),
            ping_time_s: None,
            is_reachable: false,
            handshake_ok: None,
            app_test_results: HashMap::new(),
            quality_score: None,
            semantic_hash,
            metadata: HashMap::new(),
        }
    }

    /// Apply a tester outcome. `max_ping_ms` bounds reachability the way
    /// the connection tester's contract requires.
    pub fn apply_test_outcome(&mut self, ping_time_s: Option<f64>, max_ping_ms: u64) {
        match ping_time_s {
            Some(t) => {
                self.ping_time_s = Some(t);
                self.is_reachable = (t * 1000.0) <= max_ping_ms as f64;
            }
            None => {
                self.ping_time_s = None;
                self.is_reachable = false;
            }
        }
    }

    pub fn country(&self) -> Option<&str> {
        self.metadata.get("country").map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_like_protocols_are_flagged() {
        assert!(Protocol::VMess.is_tls_like());
        assert!(Protocol::Trojan.is_tls_like());
        assert!(!Protocol::Shadowsocks.is_tls_like());
    }

    #[test]
    fn reachability_honors_max_ping_bound() {
        let mut r = ConfigResult::new(
            "vmess://x",
            Protocol::VMess,
            Some("1.2.3.4".into()),
            Some(443),
            "https://s1",
            SemanticHash(1),
        );
        r.apply_test_outcome(Some(0.5), 1000);
        assert!(r.is_reachable);

        r.apply_test_outcome(Some(2.0), 1000);
        assert!(!r.is_reachable);

        r.apply_test_outcome(None, 1000);
        assert!(!r.is_reachable);
        assert!(r.ping_time_s.is_none());
    }

    #[test]
    fn display_name_matches_csv_casing() {
        assert_eq!(Protocol::VMess.display_name(), "VMess");
        assert_eq!(Protocol::Trojan.display_name(), "Trojan");
    }
}
