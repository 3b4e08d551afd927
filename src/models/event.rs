//! Run/stage lifecycle events published on the [`crate::event_bus::EventBus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable event type names, part of the external wire contract (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStart,
    RunDone,
    DiscoverStart,
    DiscoverDone,
    ValidateStart,
    ValidateDone,
    FetchStart,
    FetchProgress,
    FetchDone,
    DedupDone,
    OutputWritten,
    ErrorOccurred,
    InvalidHostSkipped,
    TestCompleted,
}

/// `{type, data, timestamp, source}` as specified for run/stage lifecycle
/// notifications; serializes to the external wire format `{type, data, ts}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
    #[serde(default = "Uuid::new_v4")]
    pub run_id: Uuid,
}

impl Event {
    pub fn new(event_type: EventType, data: serde_json::Value, run_id: Uuid) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
            source: None,
            run_id,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Epoch-seconds wire representation used by external subscribers,
    /// per §6's `{type, data, ts}` contract.
    pub fn to_wire_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.event_type,
            "data": self.data,
            "ts": self.timestamp.timestamp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_json_uses_epoch_seconds() {
        let e = Event::new(EventType::RunStart, serde_json::json!({}), Uuid::nil());
        let wire = e.to_wire_json();
        assert!(wire["ts"].is_number());
        assert_eq!(wire["type"], "RUN_START");
    }
}
