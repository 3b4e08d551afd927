//! TCP-reachability probing with per-protocol concurrency caps, a DNS
//! cache, and a pluggable country-lookup hook.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::ConfigResult;

/// Resolves a host to a country code. The default implementation never
/// resolves anything — country enrichment is opt-in via a real
/// implementation (e.g. backed by a GeoIP database) supplied by the
/// caller.
pub trait CountryLookup: Send + Sync {
    fn lookup(&self, host: &str) -> Option<String>;
}

pub struct NoopCountryLookup;

impl CountryLookup for NoopCountryLookup {
    fn lookup(&self, _host: &str) -> Option<String> {
        None
    }
}

const DEFAULT_PROTOCOL_CAPACITY: usize = 50;

/// Probes TCP reachability for parsed endpoints, bounding concurrency per
/// protocol so one slow protocol's backlog can't starve the others.
pub struct ConnectionTester {
    connect_timeout: Duration,
    dns_cache: RwLock<HashMap<String, IpAddr>>,
    semaphores: DashMap<String, Arc<Semaphore>>,
    protocol_capacity: usize,
    country_lookup: Arc<dyn CountryLookup>,
}

impl ConnectionTester {
    pub fn new(connect_timeout: Duration, country_lookup: Arc<dyn CountryLookup>) -> Self {
        Self {
            connect_timeout,
            dns_cache: RwLock::new(HashMap::new()),
            semaphores: DashMap::new(),
            protocol_capacity: DEFAULT_PROTOCOL_CAPACITY,
            country_lookup,
        }
    }

    pub fn with_protocol_capacity(mut self, capacity: usize) -> Self {
        self.protocol_capacity = capacity.max(1);
        self
    }

    fn semaphore_for(&self, protocol_key: &str) -> Arc<Semaphore> {
        self.semaphores
            .entry(protocol_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.protocol_capacity)))
            .clone()
    }

    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        if let Some(ip) = self.dns_cache.read().await.get(host) {
            return Some(*ip);
        }
        let lookup_target = format!("{host}:0");
        let resolved = tokio::net::lookup_host(&lookup_target)
            .await
            .ok()?
            .next()?
            .ip();
        self.dns_cache
            .write()
            .await
            .insert(host.to_string(), resolved);
        Some(resolved)
    }

    /// Attempt a TCP connect to `host:port`, returning elapsed seconds on
    /// success. Bounded by the protocol's semaphore and `cancel`.
    pub async fn test_connection(
        &self,
        host: &str,
        port: u16,
        protocol_key: &str,
        cancel: &CancellationToken,
    ) -> Option<f64> {
        let semaphore = self.semaphore_for(protocol_key);
        let _permit = tokio::select! {
            permit = semaphore.acquire() => permit.ok()?,
            _ = cancel.cancelled() => return None,
        };

        let target = self.resolve(host).await.unwrap_or_else(|| {
            debug!(host, "dns resolution failed, connecting by name is not supported over raw sockets");
            IpAddr::from([0, 0, 0, 0])
        });
        if target.is_unspecified() {
            return None;
        }

        let start = Instant::now();
        let connect = TcpStream::connect((target, port));
        let outcome = tokio::select! {
            result = tokio::time::timeout(self.connect_timeout, connect) => result,
            _ = cancel.cancelled() => return None,
        };

        match outcome {
            Ok(Ok(_stream)) => Some(start.elapsed().as_secs_f64()),
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "connection test failed");
                None
            }
            Err(_) => {
                debug!(host, port, "connection test timed out");
                None
            }
        }
    }

    /// Test one parsed result in place: runs the TCP probe, applies the
    /// outcome, and fills in `country` metadata when a lookup is wired up.
    pub async fn test_result(
        &self,
        result: &mut ConfigResult,
        max_ping_ms: u64,
        cancel: &CancellationToken,
    ) {
        let (Some(host), Some(port)) = (result.host.clone(), result.port) else {
            result.apply_test_outcome(None, max_ping_ms);
            return;
        };

        let ping = self
            .test_connection(&host, port, &result.protocol.key(), cancel)
            .await;
        result.apply_test_outcome(ping, max_ping_ms);

        if !result.metadata.contains_key("country") {
            if let Some(country) = self.country_lookup.lookup(&host) {
                result.metadata.insert("country".to_string(), country);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Protocol, SemanticHash};

    #[tokio::test]
    async fn unreachable_host_times_out_to_none() {
        let tester = ConnectionTester::new(Duration::from_millis(200), Arc::new(NoopCountryLookup));
        let cancel = CancellationToken::new();
        // TEST-NET-1, reserved for documentation; should not connect.
        let result = tester.test_connection("192.0.2.1", 65000, "vmess", &cancel).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_probe() {
        let tester = ConnectionTester::new(Duration::from_secs(5), Arc::new(NoopCountryLookup));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = tester.test_connection("192.0.2.1", 443, "vmess", &cancel).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_result_marks_unreachable_without_host() {
        let tester = ConnectionTester::new(Duration::from_millis(100), Arc::new(NoopCountryLookup));
        let cancel = CancellationToken::new();
        let mut result = ConfigResult::new(
            "vmess://x",
            Protocol::VMess,
            None,
            None,
            "https://s",
            SemanticHash(1),
        );
        tester.test_result(&mut result, 1000, &cancel).await;
        assert!(!result.is_reachable);
    }
}
