//! Compact per-run summary appended to the durable `runs.log`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageDurations {
    pub total_s: f64,
    pub discover_s: f64,
    pub validate_s: f64,
    pub fetch_s: f64,
    pub output_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Done,
    Failed,
    Cancelled,
}

/// `{run_id, ts, total_configs, reachable, sources, durations}` — one JSONL
/// line appended to `runs.log` per completed (or truncated) run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub ts: DateTime<Utc>,
    pub total_configs: usize,
    pub reachable: usize,
    pub sources: usize,
    pub durations: StageDurations,
    pub status: RunStatus,
}
