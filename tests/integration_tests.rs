//! End-to-end tests over the parse -> dedup -> score -> test -> output
//! pipeline, without any dependency on live network access or a running
//! broker. Reachability is tested against a local listener we spin up
//! ourselves, so these tests are hermetic and CI-friendly (matching the
//! `SKIP_NETWORK=1`/`CI=1` semantics the real binary honors).
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use vpn_merger::dedup::{DedupFilters, Deduplicator};
use vpn_merger::models::ConfigResult;
use vpn_merger::output::{write_outputs, OutputRequest};
use vpn_merger::protocol;
use vpn_merger::scorer::{HeuristicScorer, QualityScorer};
use vpn_merger::source_store::SourceStateStore;
use vpn_merger::tester::{ConnectionTester, NoopCountryLookup};

/// Parse a block of raw subscription lines the same way `retest` does:
/// categorize, validate, hash, and extract the endpoint, skipping
/// anything that doesn't look like a real config line.
fn parse_lines(source_url: &str, body: &str) -> Vec<ConfigResult> {
    let scorer = HeuristicScorer;
    let mut out = Vec::new();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(proto) = protocol::categorize(line) else {
            continue;
        };
        if !protocol::is_valid_config(line) {
            continue;
        }
        let Ok(hash) = protocol::semantic_hash(line) else {
            continue;
        };
        let (host, port) = match protocol::extract_endpoint(line) {
            Ok((h, p)) => (Some(h), Some(p)),
            Err(_) => (None, None),
        };
        let mut result = ConfigResult::new(line, proto, host, port, source_url, hash);
        result.quality_score = Some(scorer.score_line(line));
        out.push(result);
    }
    out
}

#[tokio::test]
async fn full_pipeline_parses_dedupes_tests_and_writes_outputs() {
    // Start a local listener to stand in for a reachable VPN endpoint.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind local listener");
    let local_addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                break;
            }
        }
    });

    let body = format!(
        "# comment lines and blanks are ignored\n\
         \n\
         vless://11111111-1111-1111-1111-111111111111@{host}:{port}?security=tls&type=tcp#primary\n\
         vless://11111111-1111-1111-1111-111111111111@{host}:{port}?security=tls&type=tcp#duplicate-tag-only\n\
         trojan://password@203.0.113.1:1/?security=tls#unreachable\n\
         not-a-real-config-line\n",
        host = local_addr.ip(),
        port = local_addr.port(),
    );

    let parsed = parse_lines("https://example.invalid/sub.txt", &body);
    // Four plausible lines in the body, one of which is plain garbage.
    assert_eq!(parsed.len(), 3);

    let mut dedup = Deduplicator::new(DedupFilters::default(), 64);
    let deduped = dedup.deduplicate(parsed);
    // The duplicate-tag-only line shares host/port/params with the first
    // and must collapse away; tags are never part of the semantic hash.
    assert_eq!(deduped.len(), 2);

    let tester = ConnectionTester::new(Duration::from_millis(500), Arc::new(NoopCountryLookup));
    let cancel = CancellationToken::new();
    let mut results = deduped;
    for result in &mut results {
        tester.test_result(result, 2000, &cancel).await;
    }

    let reachable = results.iter().filter(|r| r.is_reachable).count();
    assert_eq!(reachable, 1, "only the locally-bound listener should be reachable");

    results.sort_by(|a, b| b.quality_score.partial_cmp(&a.quality_score).unwrap());

    let dir = tempfile::tempdir().expect("tempdir");
    let output_req = OutputRequest::new(dir.path());
    let manifest = write_outputs(
        &results,
        serde_json::json!({"sources_scanned": 1}),
        Instant::now(),
        1,
        &output_req,
    )
    .await
    .expect("write_outputs succeeds");

    assert!(manifest.written.iter().any(|(n, _)| n == "raw"));
    assert!(manifest.written.iter().any(|(n, _)| n == "json_report"));
    assert!(manifest.written.iter().any(|(n, _)| n == "singbox"));

    let raw = tokio::fs::read_to_string(dir.path().join("vpn_subscription_raw.txt"))
        .await
        .expect("raw file readable");
    assert_eq!(raw.lines().count(), 2);

    let report: serde_json::Value = serde_json::from_str(
        &tokio::fs::read_to_string(dir.path().join("vpn_report.json"))
            .await
            .expect("report readable"),
    )
    .expect("report is valid json");
    assert_eq!(report["statistics"]["sources_scanned"], 1);
}

#[tokio::test]
async fn invalid_lines_never_reach_the_output_stage() {
    let body = "just some prose\nhttp://\nvmess:\n";
    let parsed = parse_lines("https://example.invalid/empty.txt", body);
    assert!(parsed.is_empty());
}

#[tokio::test]
async fn source_store_round_trips_through_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sources.yaml");

    {
        let store = SourceStateStore::load(&path).await.expect("load creates an empty store");
        store
            .add_atomic("https://a.example/sub.txt", vpn_merger::models::Tier::Reliable, 0.8)
            .await
            .expect("add succeeds");
        store
            .blacklist("https://a.example/sub.txt", "flaky in CI")
            .await
            .expect("blacklist succeeds");
    }

    // Re-loading from the same path must observe the persisted blacklist.
    let reloaded = SourceStateStore::load(&path).await.expect("reload succeeds");
    let entry = reloaded
        .get("https://a.example/sub.txt")
        .await
        .expect("entry persisted across reload");
    assert!(entry.is_blacklisted);
    assert_eq!(entry.blacklist_reason.as_deref(), Some("flaky in CI"));
}
