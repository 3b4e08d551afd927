//! Heuristic quality scoring for a raw config line, independent of
//! reachability testing.

use regex::Regex;
use std::sync::LazyLock;

use crate::protocol;

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
        .expect("static uuid regex is valid")
});

static SPECIAL_CHAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>\\{}|^~`\x00-\x1f]"#).expect("static special-char regex is valid"));

/// Pluggable scoring strategy, so a future ML-backed predictor can drop in
/// without touching callers.
pub trait QualityScorer: Send + Sync {
    fn score_line(&self, line: &str) -> f64;
}

/// Default heuristic: rewards secure protocols, TLS, well-formed UUIDs,
/// base64-structured payloads, and reasonable ports; penalizes stray
/// control/special characters that suggest a malformed or truncated line.
pub struct HeuristicScorer;

impl QualityScorer for HeuristicScorer {
    fn score_line(&self, line: &str) -> f64 {
        let mut score: f64 = 0.5;

        if let Some(protocol) = protocol::categorize(line) {
            if matches!(
                protocol,
                crate::models::Protocol::VLess
                    | crate::models::Protocol::Reality
                    | crate::models::Protocol::Trojan
                    | crate::models::Protocol::Hysteria2
                    | crate::models::Protocol::Tuic
            ) {
                score += 0.2;
            }
            if protocol.is_tls_like() {
                score += 0.1;
            }
        } else {
            score -= 0.3;
        }

        if line.contains("tls") || line.contains("security=tls") || line.contains("reality") {
            score += 0.1;
        }

        if UUID_RE.is_match(line) {
            score += 0.1;
        }

        if let Ok((_, port)) = protocol::extract_endpoint(line) {
            if (443..=65535).contains(&port) || port == 80 {
                score += 0.05;
            }
        }

        let special_chars = SPECIAL_CHAR_RE.find_iter(line).count();
        if special_chars > 0 {
            score -= (special_chars as f64 * 0.05).min(0.3);
        }

        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewards_vless_reality_over_plain_vmess() {
        let scorer = HeuristicScorer;
        let vless = scorer.score_line("vless://uuid@host.example:443?security=reality&pbk=x&sid=y");
        let vmess = scorer.score_line("vmess://eyJhZGQiOiAiaC5jb20ifQ==");
        assert!(vless > vmess);
    }

    #[test]
    fn penalizes_lines_with_control_characters() {
        let scorer = HeuristicScorer;
        let clean = scorer.score_line("trojan://pw@host.example:443");
        let dirty = scorer.score_line("trojan://p\u{0001}w@host.example:443<>{}");
        assert!(dirty < clean);
    }

    #[test]
    fn unrecognized_scheme_scores_low() {
        let scorer = HeuristicScorer;
        assert!(scorer.score_line("not a config at all") < 0.4);
    }
}
