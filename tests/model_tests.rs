//! Cross-cutting serialization tests for the domain models: the external
//! wire shapes these types must hold to, as opposed to the per-field
//! behavior already covered by each model's own `#[cfg(test)]` module.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use uuid::Uuid;

mod event_tests {
    use super::*;
    use vpn_merger::models::{Event, EventType};

    #[test]
    fn event_type_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&EventType::DiscoverDone).unwrap();
        assert_eq!(json, "\"DISCOVER_DONE\"");
    }

    #[test]
    fn event_wire_json_has_type_data_ts_shape() {
        let event = Event::new(
            EventType::FetchProgress,
            serde_json::json!({"fetched": 3, "total": 10}),
            Uuid::new_v4(),
        )
        .with_source("fetcher");

        let wire = event.to_wire_json();
        assert_eq!(wire["type"], "FETCH_PROGRESS");
        assert_eq!(wire["data"]["fetched"], 3);
        assert!(wire["ts"].is_i64());
        // `source`/`run_id` are bookkeeping for the in-process bus, not
        // part of the external `{type, data, ts}` wire contract.
        assert!(wire.get("source").is_none());
    }

    #[test]
    fn event_struct_roundtrips_through_json() {
        let run_id = Uuid::new_v4();
        let original = Event::new(EventType::RunStart, serde_json::json!({}), run_id);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.run_id, run_id);
        assert_eq!(parsed.event_type, EventType::RunStart);
    }
}

mod result_tests {
    use super::*;
    use vpn_merger::models::{ConfigResult, Protocol, SemanticHash};

    #[test]
    fn protocol_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Protocol::VLess).unwrap(), "\"vless\"");
        assert_eq!(serde_json::to_string(&Protocol::Hysteria2).unwrap(), "\"hysteria2\"");
    }

    #[test]
    fn config_result_roundtrips_with_optional_fields_absent() {
        let original = ConfigResult::new(
            "trojan://pw@1.2.3.4:443",
            Protocol::Trojan,
            Some("1.2.3.4".to_string()),
            Some(443),
            "https://source.example/sub.txt",
            SemanticHash(42),
        );
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ConfigResult = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.raw_config, original.raw_config);
        assert_eq!(parsed.semantic_hash, original.semantic_hash);
        assert!(parsed.quality_score.is_none());
        assert!(!parsed.is_reachable);
    }

    #[test]
    fn semantic_hash_displays_as_32_char_hex() {
        let hash = SemanticHash(0xdead_beef);
        assert_eq!(format!("{hash}").len(), 32);
        assert!(format!("{hash}").ends_with("deadbeef"));
    }
}

mod source_tests {
    use super::*;
    use vpn_merger::models::{SourceMetadata, SourceState, Tier};

    #[test]
    fn tier_serializes_lowercase_for_yaml_grouping() {
        assert_eq!(serde_json::to_string(&Tier::Experimental).unwrap(), "\"experimental\"");
    }

    #[test]
    fn source_metadata_roundtrips_through_yaml() {
        let mut source = SourceMetadata::new("https://a.example/sub.txt", Tier::Premium, 0.9);
        source.record_check(true, 0.2, 30);
        source.record_check(true, 0.3, 25);

        let yaml = serde_yaml::to_string(&source).unwrap();
        let parsed: SourceMetadata = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed.url, source.url);
        assert_eq!(parsed.success_count, 2);
        assert_eq!(parsed.state, SourceState::New);
    }

    #[test]
    fn missing_state_fields_default_on_deserialize() {
        // Older `sources.yaml` files predating the health FSM won't carry
        // `state`/`consecutive_failures`/`consecutive_successes` at all.
        let yaml = "url: https://a.example/sub.txt\n\
                    tier: bulk\n\
                    weight: 0.5\n\
                    protocols: []\n\
                    update_frequency_s: 3600\n\
                    last_check: null\n\
                    success_count: 5\n\
                    failure_count: 1\n\
                    avg_response_time_s: 0.4\n\
                    avg_config_count: 12.0\n\
                    reputation_score: 0.9\n\
                    history: []\n\
                    is_blacklisted: false\n\
                    blacklist_reason: null\n";
        let parsed: SourceMetadata = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.state, SourceState::New);
        assert_eq!(parsed.consecutive_failures, 0);
        assert_eq!(parsed.consecutive_successes, 0);
    }
}

mod run_tests {
    use super::*;
    use vpn_merger::models::{RunRecord, RunStatus, StageDurations};
    use chrono::Utc;

    #[test]
    fn run_record_roundtrips_as_a_single_json_line() {
        let record = RunRecord {
            run_id: Uuid::new_v4(),
            ts: Utc::now(),
            total_configs: 120,
            reachable: 87,
            sources: 6,
            durations: StageDurations {
                total_s: 12.5,
                discover_s: 0.4,
                validate_s: 1.1,
                fetch_s: 8.0,
                output_s: 0.3,
            },
            status: RunStatus::Done,
        };

        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'), "a runs.log entry must be a single line");

        let parsed: RunRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.run_id, record.run_id);
        assert_eq!(parsed.total_configs, 120);
        assert_eq!(parsed.status, RunStatus::Done);
    }

    #[test]
    fn run_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RunStatus::Cancelled).unwrap(), "\"cancelled\"");
    }
}
