//! Rate-limited, retrying, circuit-broken HTTP GET with proxy support.
//!
//! Callers never see a panic: every failure mode (timeout, non-2xx, body
//! too large, breaker open, cancellation) comes back as a typed
//! [`AppError`] that the orchestrator recovers from locally — the
//! "never throws" contract just means "never panics", not "never errors".

pub mod circuit_breaker;
pub mod rate_limiter;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use url::Url;

use crate::error::{AppError, AppResult};
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use rate_limiter::HostRateLimiter;

/// Default 256 KiB cap used on base64-decode paths (vmess payloads, etc.).
pub const DEFAULT_DECODE_SIZE_CAP: usize = 256 * 1024;
/// Default 2 MiB cap on a fetched source body.
pub const DEFAULT_SOURCE_SIZE_CAP: usize = 2 * 1024 * 1024;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0.0.0 Safari/537.36";
const ACCEPT_HEADER: &str = "text/plain,text/yaml,application/yaml,application/json,*/*";

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub timeout: Duration,
    pub retries: u32,
    pub base_delay: Duration,
    pub proxy: Option<String>,
    pub max_body_bytes: usize,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(12),
            retries: 3,
            base_delay: Duration::from_secs(1),
            proxy: None,
            max_body_bytes: DEFAULT_SOURCE_SIZE_CAP,
        }
    }
}

/// Per-host breakers and token buckets, plus a shared `reqwest::Client`.
pub struct Fetcher {
    client: reqwest::Client,
    limiter: HostRateLimiter,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    breaker_config: CircuitBreakerConfig,
}

impl Fetcher {
    pub fn new(
        rate_per_sec: u32,
        rate_capacity: u32,
        breaker_config: CircuitBreakerConfig,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::ConfigError(format!("failed to build http client: {e}")))?;
        let limiter = HostRateLimiter::new(rate_per_sec, rate_capacity)
            .map_err(|e| AppError::ConfigError(e.to_string()))?;
        Ok(Self {
            client,
            limiter,
            breakers: Arc::new(DashMap::new()),
            breaker_config,
        })
    }

    fn breaker_for(&self, host: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config)))
            .clone()
    }

    /// Fetch `req.url`'s text body, honoring per-host rate limiting and
    /// circuit breaking, retrying idempotent GETs with exponential backoff.
    #[instrument(skip(self, cancel), fields(url = %req.url))]
    pub async fn fetch(&self, req: &FetchRequest, cancel: &CancellationToken) -> AppResult<String> {
        let parsed = Url::parse(&req.url)
            .map_err(|e| AppError::NetworkError(format!("invalid url {}: {e}", req.url)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::NetworkError(format!("url has no host: {}", req.url)))?
            .to_string();

        let breaker = self.breaker_for(&host);
        if !breaker.allow_request().await {
            return Err(AppError::RateLimited(format!(
                "circuit breaker open for host {host}"
            )));
        }

        self.limiter.acquire(&host).await;

        let max_delay = Duration::from_secs(8);
        let mut last_err = AppError::NetworkError("no attempts made".to_string());

        for attempt in 0..=req.retries {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled(format!(
                    "fetch of {} cancelled",
                    req.url
                )));
            }

            match self.try_once(req, &parsed).await {
                Ok(body) => {
                    breaker.record_success().await;
                    return Ok(body);
                }
                Err(e) => {
                    warn!(url = %req.url, attempt, error = %e, "fetch attempt failed");
                    last_err = e;
                }
            }

            if attempt < req.retries {
                let delay = std::cmp::min(req.base_delay * 2u32.pow(attempt), max_delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(AppError::Cancelled(format!(
                            "fetch of {} cancelled during backoff",
                            req.url
                        )));
                    }
                }
            }
        }

        breaker.record_failure().await;
        Err(last_err)
    }

    async fn try_once(&self, req: &FetchRequest, url: &Url) -> AppResult<String> {
        // A proxy is a per-request concern in reqwest's API (it lives on the
        // client, not the request builder), so a proxied fetch gets a
        // dedicated short-lived client instead of reusing `self.client`.
        let response = if let Some(proxy_url) = &req.proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| AppError::ConfigError(format!("invalid proxy: {e}")))?;
            let proxied = reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .proxy(proxy)
                .build()
                .map_err(|e| AppError::ConfigError(format!("failed to build proxy client: {e}")))?;
            proxied
                .get(url.clone())
                .timeout(req.timeout)
                .header("Accept", ACCEPT_HEADER)
                .send()
                .await
                .map_err(|e| AppError::NetworkError(e.to_string()))?
        } else {
            self.client
                .get(url.clone())
                .timeout(req.timeout)
                .header("Accept", ACCEPT_HEADER)
                .send()
                .await
                .map_err(|e| AppError::NetworkError(e.to_string()))?
        };

        if !response.status().is_success() {
            return Err(AppError::NetworkError(format!(
                "http {}",
                response.status()
            )));
        }

        let cap = req.max_body_bytes;
        let mut body = Vec::new();
        let mut stream = response;
        while let Some(chunk) = stream
            .chunk()
            .await
            .map_err(|e| AppError::NetworkError(e.to_string()))?
        {
            body.extend_from_slice(&chunk);
            if body.len() > cap {
                return Err(AppError::NetworkError(format!(
                    "body exceeds size cap of {cap} bytes"
                )));
            }
        }

        String::from_utf8(body).map_err(|e| AppError::ParseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_request_defaults_match_spec() {
        let req = FetchRequest::new("https://example.com/a.txt");
        assert_eq!(req.retries, 3);
        assert_eq!(req.base_delay, Duration::from_secs(1));
        assert_eq!(req.max_body_bytes, DEFAULT_SOURCE_SIZE_CAP);
    }

    #[tokio::test]
    async fn invalid_url_is_a_network_error() {
        let fetcher = Fetcher::new(5, 10, CircuitBreakerConfig::default()).expect("fetcher builds");
        let req = FetchRequest::new("not a url");
        let cancel = CancellationToken::new();
        let result = fetcher.fetch(&req, &cancel).await;
        assert!(matches!(result, Err(AppError::NetworkError(_))));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let fetcher = Fetcher::new(5, 10, CircuitBreakerConfig::default()).expect("fetcher builds");
        let req = FetchRequest::new("https://127.0.0.1.invalid/x.txt");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fetcher.fetch(&req, &cancel).await;
        assert!(matches!(result, Err(AppError::Cancelled(_))));
    }
}
