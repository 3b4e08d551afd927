//! Prometheus metrics for pipeline observability.
//!
//! This module provides Prometheus-compatible metrics for monitoring pipeline
//! runs. Metrics are exposed via a dedicated HTTP endpoint (default: `/metrics`),
//! and this ambient stack is carried even though the HTTP/API surface itself is
//! out of scope for this crate.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `vpn_configs_parsed_total` - Total configs parsed (with labels: protocol, outcome)
//! - `vpn_sources_fetched_total` - Total source fetches (with labels: outcome)
//! - `vpn_dedup_dropped_total` - Total configs dropped as duplicates
//! - `vpn_circuit_breaker_opens_total` - Times a source's circuit breaker opened
//! - `vpn_circuit_breaker_rejections_total` - Fetches rejected by an open circuit breaker
//!
//! ## Histograms
//! - `vpn_fetch_duration_seconds` - Source fetch duration (with labels: outcome)
//! - `vpn_test_duration_seconds` - Connection test (TCP probe) duration
//! - `vpn_run_duration_seconds` - Full pipeline run duration
//!
//! ## Gauges
//! - `vpn_sources_blacklisted` - Current count of blacklisted sources
//! - `vpn_circuit_breaker_state` - Circuit breaker state (0 = closed, 1 = half-open, 2 = open)
//!
//! # Usage
//!
//! ```rust,ignore
//! use vpn_merger::metrics::{init_metrics, record_config_parsed, record_fetch_duration};
//!
//! // Initialize metrics (call once at startup)
//! init_metrics(addr)?;
//!
//! // Record metrics from pipeline stages
//! record_config_parsed("vmess", "accepted");
//! record_fetch_duration("ok", 0.45);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const CONFIGS_PARSED_TOTAL: &str = "vpn_configs_parsed_total";
    pub const SOURCES_FETCHED_TOTAL: &str = "vpn_sources_fetched_total";
    pub const DEDUP_DROPPED_TOTAL: &str = "vpn_dedup_dropped_total";
    pub const CIRCUIT_BREAKER_OPENS_TOTAL: &str = "vpn_circuit_breaker_opens_total";
    pub const CIRCUIT_BREAKER_REJECTIONS_TOTAL: &str = "vpn_circuit_breaker_rejections_total";
    pub const FETCH_DURATION_SECONDS: &str = "vpn_fetch_duration_seconds";
    pub const TEST_DURATION_SECONDS: &str = "vpn_test_duration_seconds";
    pub const RUN_DURATION_SECONDS: &str = "vpn_run_duration_seconds";
    pub const SOURCES_BLACKLISTED: &str = "vpn_sources_blacklisted";
    pub const CIRCUIT_BREAKER_STATE: &str = "vpn_circuit_breaker_state";
}

/// Initialize the Prometheus metrics exporter.
///
/// This sets up metric descriptions and starts the Prometheus HTTP listener
/// on the specified address (default: 0.0.0.0:9090).
///
/// # Arguments
///
/// * `metrics_addr` - Address for the Prometheus metrics endpoint
///
/// # Returns
///
/// `Ok(())` if initialization succeeds, `Err` with message otherwise.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::CONFIGS_PARSED_TOTAL, "Total number of configs parsed");
    describe_counter!(
        names::SOURCES_FETCHED_TOTAL,
        "Total number of source fetch attempts"
    );
    describe_counter!(
        names::DEDUP_DROPPED_TOTAL,
        "Total number of configs dropped as duplicates"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_OPENS_TOTAL,
        "Total number of times a source circuit breaker opened"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_REJECTIONS_TOTAL,
        "Total number of fetches rejected by an open circuit breaker"
    );

    describe_histogram!(names::FETCH_DURATION_SECONDS, "Source fetch duration in seconds");
    describe_histogram!(
        names::TEST_DURATION_SECONDS,
        "Connection test duration in seconds"
    );
    describe_histogram!(names::RUN_DURATION_SECONDS, "Full pipeline run duration in seconds");

    describe_gauge!(names::SOURCES_BLACKLISTED, "Current count of blacklisted sources");
    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
///
/// This is useful for cases where metrics are optional.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record one config parsed, with its protocol and whether it was accepted.
pub fn record_config_parsed(protocol: &str, outcome: &str) {
    counter!(names::CONFIGS_PARSED_TOTAL, "protocol" => protocol.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a source fetch attempt outcome.
pub fn record_source_fetched(outcome: &str) {
    counter!(names::SOURCES_FETCHED_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Record configs dropped by deduplication in one run.
pub fn record_dedup_dropped(count: u64) {
    counter!(names::DEDUP_DROPPED_TOTAL).increment(count);
}

/// Record circuit breaker opening for a source.
pub fn record_circuit_breaker_open() {
    counter!(names::CIRCUIT_BREAKER_OPENS_TOTAL).increment(1);
}

/// Record circuit breaker rejection.
pub fn record_circuit_breaker_rejection() {
    counter!(names::CIRCUIT_BREAKER_REJECTIONS_TOTAL).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record source fetch duration.
pub fn record_fetch_duration(outcome: &str, duration_secs: f64) {
    histogram!(names::FETCH_DURATION_SECONDS, "outcome" => outcome.to_string()).record(duration_secs);
}

/// Record connection test duration.
pub fn record_test_duration(duration_secs: f64) {
    histogram!(names::TEST_DURATION_SECONDS).record(duration_secs);
}

/// Record a full run's wall-clock duration.
pub fn record_run_duration(duration_secs: f64) {
    histogram!(names::RUN_DURATION_SECONDS).record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

/// Update blacklisted-source count gauge.
pub fn set_sources_blacklisted(count: u64) {
    gauge!(names::SOURCES_BLACKLISTED).set(count as f64);
}

/// Update circuit breaker state gauge.
///
/// States: 0 = closed, 1 = half-open, 2 = open
pub fn set_circuit_breaker_state(state: u8) {
    gauge!(names::CIRCUIT_BREAKER_STATE).set(f64::from(state));
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests verify the functions don't panic.
    // Full metrics testing requires integration tests with a Prometheus scraper.

    #[test]
    fn test_record_config_parsed() {
        record_config_parsed("vmess", "accepted");
    }

    #[test]
    fn test_record_source_fetched() {
        record_source_fetched("ok");
    }

    #[test]
    fn test_record_fetch_duration() {
        record_fetch_duration("ok", 0.1);
    }

    #[test]
    fn test_set_sources_blacklisted() {
        set_sources_blacklisted(3);
    }

    #[test]
    fn test_set_circuit_breaker_state() {
        set_circuit_breaker_state(0); // closed
        set_circuit_breaker_state(1); // half-open
        set_circuit_breaker_state(2); // open
    }
}
