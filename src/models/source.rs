//! Persistent per-source metadata and its orthogonal health FSM.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bound on `SourceMetadata::history`'s ring buffer.
pub const MAX_HISTORY: usize = 100;

/// Source tier, used both for YAML grouping and as a weight hint during
/// selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Premium,
    Reliable,
    Bulk,
    Experimental,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Bulk
    }
}

/// Orthogonal health state machine for a source, independent of
/// [`SourceMetadata`]'s numeric reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    New,
    Probation,
    Trusted,
    Suspended,
}

impl Default for SourceState {
    fn default() -> Self {
        SourceState::New
    }
}

impl SourceState {
    /// Apply one check outcome and return the resulting state.
    ///
    /// `consecutive_failures`/`consecutive_successes` are the streak
    /// counters *after* this check has already been folded in by the
    /// caller; `reputation` is the freshly recomputed rolling score.
    pub fn transition(
        self,
        successful_checks: u32,
        reputation: f64,
        reputation_threshold: f64,
        trusted_checks_threshold: u32,
        consecutive_failures: u32,
        consecutive_successes: u32,
        suspend_after: u32,
        resume_after: u32,
    ) -> SourceState {
        match self {
            SourceState::New if successful_checks >= 2 => SourceState::Probation,
            SourceState::New => SourceState::New,
            SourceState::Suspended if consecutive_successes >= resume_after => {
                SourceState::Probation
            }
            SourceState::Suspended => SourceState::Suspended,
            _ if consecutive_failures >= suspend_after => SourceState::Suspended,
            SourceState::Probation
                if reputation >= reputation_threshold
                    && successful_checks >= trusted_checks_threshold =>
            {
                SourceState::Trusted
            }
            SourceState::Trusted if reputation < reputation_threshold => SourceState::Probation,
            other => other,
        }
    }
}

/// One historical check outcome, stored in `SourceMetadata::history`.
pub type HistoryEntry = bool;

/// Persistent record for one source URL.
///
/// Mutated only by the validator and tester callbacks driven by the
/// orchestrator, and persisted atomically by [`crate::source_store::SourceStateStore`]
/// after every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub url: String,
    pub tier: Tier,
    pub weight: f64,
    pub protocols: HashSet<String>,
    pub update_frequency_s: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_response_time_s: f64,
    pub avg_config_count: f64,
    pub reputation_score: f64,
    pub history: VecDeque<HistoryEntry>,
    pub is_blacklisted: bool,
    pub blacklist_reason: Option<String>,
    #[serde(default)]
    pub state: SourceState,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
}

impl SourceMetadata {
    pub fn new(url: impl Into<String>, tier: Tier, weight: f64) -> Self {
        Self {
            url: url.into(),
            tier,
            weight: weight.clamp(0.0, 1.0),
            protocols: HashSet::new(),
            update_frequency_s: 3600,
            last_check: None,
            success_count: 0,
            failure_count: 0,
            avg_response_time_s: 0.0,
            avg_config_count: 0.0,
            reputation_score: 1.0,
            history: VecDeque::with_capacity(MAX_HISTORY),
            is_blacklisted: false,
            blacklist_reason: None,
            state: SourceState::New,
            consecutive_failures: 0,
            consecutive_successes: 0,
            metadata: std::collections::HashMap::new(),
        }
    }

    /// Fold in one check outcome: response time (seconds), config count
    /// found, and whether the probe succeeded. Mirrors the rolling
    /// reputation formula: base success rate, minus a latency penalty
    /// above 30s, plus a bounded config-count bonus, clamped to [0,1].
    pub fn record_check(&mut self, success: bool, response_time_s: f64, config_count: u64) {
        self.last_check = Some(Utc::now());

        if success {
            self.success_count += 1;
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failure_count += 1;
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
        }

        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(success);

        let total = self.success_count + self.failure_count;
        if total > 0 {
            self.avg_response_time_s = ((self.avg_response_time_s * (total - 1) as f64)
                + response_time_s)
                / total as f64;
            self.avg_config_count = ((self.avg_config_count * (total - 1) as f64)
                + config_count as f64)
                / total as f64;
        }

        self.reputation_score = self.calculate_reputation_score();

        if self.failure_count > 10 && (self.success_count as f64) < 0.2 * self.failure_count as f64
        {
            self.is_blacklisted = true;
            self.blacklist_reason
                .get_or_insert_with(|| "failure rate exceeded threshold".to_string());
        }

        self.state = self.state.transition(
            self.success_count.min(u32::MAX as u64) as u32,
            self.reputation_score,
            0.8,
            5,
            self.consecutive_failures,
            self.consecutive_successes,
            3,
            2,
        );
    }

    fn calculate_reputation_score(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 1.0;
        }
        let mut score = self.success_count as f64 / total as f64;

        if self.avg_response_time_s > 30.0 {
            let penalty = ((self.avg_response_time_s - 30.0) / 100.0).min(0.3);
            score -= penalty;
        }

        let total_configs = self.avg_config_count * total as f64;
        if total_configs > 0.0 {
            score += (total_configs / 1000.0).min(0.2);
        }

        score.clamp(0.0, 1.0)
    }

    pub fn blacklist(&mut self, reason: impl Into<String>) {
        self.is_blacklisted = true;
        self.blacklist_reason = Some(reason.into());
    }

    pub fn whitelist(&mut self) {
        self.is_blacklisted = false;
        self.blacklist_reason = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_source_starts_unblacklisted_with_full_reputation() {
        let s = SourceMetadata::new("https://a.example/sub.txt", Tier::Bulk, 0.5);
        assert!(!s.is_blacklisted);
        assert_eq!(s.reputation_score, 1.0);
        assert_eq!(s.state, SourceState::New);
    }

    #[test]
    fn reputation_monotonically_increases_over_successes() {
        let mut s = SourceMetadata::new("https://a.example", Tier::Bulk, 0.5);
        let mut prev = s.reputation_score;
        for _ in 0..10 {
            s.record_check(true, 0.1, 50);
            assert!(s.reputation_score >= prev);
            prev = s.reputation_score;
        }
    }

    #[test]
    fn blacklists_after_excessive_failures() {
        let mut s = SourceMetadata::new("https://a.example", Tier::Bulk, 0.5);
        for _ in 0..11 {
            s.record_check(false, 1.0, 0);
        }
        assert!(s.is_blacklisted);
    }

    #[test]
    fn latency_penalty_caps_at_point_three() {
        let mut s = SourceMetadata::new("https://a.example", Tier::Bulk, 0.5);
        s.record_check(true, 500.0, 0);
        // success rate 1.0, penalty capped at 0.3 => score >= 0.7
        assert!(s.reputation_score >= 0.7 - f64::EPSILON);
    }

    #[test]
    fn new_transitions_to_probation_after_two_successes() {
        let mut s = SourceMetadata::new("https://a.example", Tier::Bulk, 0.5);
        s.record_check(true, 0.1, 10);
        assert_eq!(s.state, SourceState::New);
        s.record_check(true, 0.1, 10);
        assert_eq!(s.state, SourceState::Probation);
    }

    #[test]
    fn suspends_after_consecutive_failures() {
        let mut s = SourceMetadata::new("https://a.example", Tier::Bulk, 0.5);
        s.record_check(false, 1.0, 0);
        s.record_check(false, 1.0, 0);
        s.record_check(false, 1.0, 0);
        assert_eq!(s.state, SourceState::Suspended);
    }
}
