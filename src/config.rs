//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Recognized keys
//!
//! - `VPN_CONCURRENT_LIMIT`: concurrent fetch/test operations (default: 50)
//! - `SKIP_NETWORK`: when truthy, skip any real network I/O (used by CI)
//! - `CI`: when truthy, shortens timeouts and disables background sweepers
//! - `OUTPUT_DIR`: directory outputs are written to (default: `output`)
//! - `GITHUB_TOKEN`: optional token for the code-search discovery backend
//! - `STREAMLINE_*`: runtime overrides, reloadable without a process restart
//!
//! # Performance Tuning
//!
//! - `FETCH_TIMEOUT_SECS`: per-source fetch timeout (default: 12)
//! - `VALIDATE_TIMEOUT_SECS`: per-source validation probe timeout (default: 10)
//! - `RATE_LIMIT_RPS`: outbound requests per second limit (default: 20)
//! - `RATE_LIMIT_BURST`: burst capacity for the rate limiter (default: 10)

use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("writing outputs to {}", config.output_dir);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Pipeline Configuration
    // =========================================================================
    /// Directory outputs are written to (default: "output")
    pub output_dir: String,

    /// Maximum number of concurrent fetch/test operations (default: 50)
    pub concurrent_limit: usize,

    /// Skip real network I/O entirely (used by CI / offline runs)
    pub skip_network: bool,

    /// True when running under a CI environment (shortens timeouts,
    /// disables background sweepers)
    pub ci: bool,

    /// Optional token for the code-search discovery backend
    pub github_token: Option<String>,

    // =========================================================================
    // Fetch Configuration
    // =========================================================================
    /// Per-source fetch timeout (default: 12 seconds)
    pub fetch_timeout: Duration,

    /// Retries per source fetch (default: 3)
    pub fetch_retries: u32,

    /// Maximum response body size accepted from a single source (default: 10MB)
    pub max_body_bytes: usize,

    // =========================================================================
    // Validation / Testing Configuration
    // =========================================================================
    /// Per-source validation probe timeout (default: 10 seconds)
    pub validate_timeout: Duration,

    /// Concurrency cap for source validation probes (default: 20)
    pub validate_concurrency: usize,

    /// Maximum acceptable ping time before a config is marked unreachable
    /// (default: 5000ms)
    pub max_ping_ms: u64,

    // =========================================================================
    // Circuit Breaker Configuration
    // =========================================================================
    /// Number of consecutive failures before opening the circuit (default: 5)
    pub circuit_breaker_failure_threshold: u32,

    /// Number of consecutive successes in half-open state to close circuit (default: 2)
    pub circuit_breaker_success_threshold: u32,

    /// How long the circuit stays open before transitioning to half-open (default: 30s)
    pub circuit_breaker_open_duration: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Outbound requests per second limit (default: 20)
    /// Set to 0 to disable rate limiting.
    pub rate_limit_rps: u32,

    /// Burst capacity - allows temporary spikes above rps limit (default: 10)
    pub rate_limit_burst: u32,

    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// Maximum number of entries held in the in-process L1 cache
    pub cache_max_entries: usize,

    /// Maximum bytes held in the in-process L1 cache (default: 100MB)
    pub cache_max_bytes: usize,

    /// Interval the cache sweeper runs expired-entry cleanup on (default: 60s)
    pub cache_sweep_interval: Duration,

    // =========================================================================
    // Discovery Configuration
    // =========================================================================
    /// Maximum number of candidate source URLs discovery may return per run
    pub discovery_cap: usize,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,

    /// Maximum size in bytes `runs.log` may grow to before being pruned
    pub runs_log_max_bytes: u64,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any required configuration is invalid
    /// (e.g., non-numeric value, invalid delay ordering).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Pipeline
            output_dir: env::var("OUTPUT_DIR").unwrap_or_else(|_| "output".to_string()),
            concurrent_limit: Self::parse_env("VPN_CONCURRENT_LIMIT", 50)?,
            skip_network: Self::parse_bool_env("SKIP_NETWORK"),
            ci: Self::parse_bool_env("CI"),
            github_token: env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),

            // Fetch
            fetch_timeout: Duration::from_secs(Self::parse_env("FETCH_TIMEOUT_SECS", 12)?),
            fetch_retries: Self::parse_env("FETCH_RETRIES", 3)?,
            max_body_bytes: Self::parse_env("MAX_BODY_BYTES", 10 * 1024 * 1024)?,

            // Validation / testing
            validate_timeout: Duration::from_secs(Self::parse_env("VALIDATE_TIMEOUT_SECS", 10)?),
            validate_concurrency: Self::parse_env("VALIDATE_CONCURRENCY", 20)?,
            max_ping_ms: Self::parse_env("MAX_PING_MS", 5000)?,

            // Circuit breaker
            circuit_breaker_failure_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                5,
            )?,
            circuit_breaker_success_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_SUCCESS_THRESHOLD",
                2,
            )?,
            circuit_breaker_open_duration: Duration::from_secs(Self::parse_env(
                "CIRCUIT_BREAKER_OPEN_DURATION_SECS",
                30,
            )?),

            // Rate limiting
            rate_limit_rps: Self::parse_env("RATE_LIMIT_RPS", 20)?,
            rate_limit_burst: Self::parse_env("RATE_LIMIT_BURST", 10)?,

            // Cache
            cache_max_entries: Self::parse_env("CACHE_MAX_ENTRIES", 1000)?,
            cache_max_bytes: Self::parse_env("CACHE_MAX_BYTES", 100 * 1024 * 1024)?,
            cache_sweep_interval: Duration::from_secs(Self::parse_env(
                "CACHE_SWEEP_INTERVAL_SECS",
                60,
            )?),

            // Discovery
            discovery_cap: Self::parse_env("DISCOVERY_CAP", 200)?,

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
            runs_log_max_bytes: Self::parse_env("RUNS_LOG_MAX_BYTES", 10 * 1024 * 1024)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    fn validate(&self) -> AppResult<()> {
        if self.concurrent_limit == 0 {
            return Err(AppError::ConfigError(
                "VPN_CONCURRENT_LIMIT must be greater than 0".to_string(),
            ));
        }

        if self.validate_concurrency == 0 {
            return Err(AppError::ConfigError(
                "VALIDATE_CONCURRENCY must be greater than 0".to_string(),
            ));
        }

        if self.max_body_bytes == 0 {
            return Err(AppError::ConfigError(
                "MAX_BODY_BYTES must be greater than 0".to_string(),
            ));
        }

        if self.output_dir.trim().is_empty() {
            return Err(AppError::ConfigError(
                "OUTPUT_DIR must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_rps > 0
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr + ToString,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a boolean-ish environment variable ("1", "true", "yes" => true).
    fn parse_bool_env(name: &str) -> bool {
        env::var(name)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: "output".to_string(),
            concurrent_limit: 50,
            skip_network: false,
            ci: false,
            github_token: None,

            fetch_timeout: Duration::from_secs(12),
            fetch_retries: 3,
            max_body_bytes: 10 * 1024 * 1024,

            validate_timeout: Duration::from_secs(10),
            validate_concurrency: 20,
            max_ping_ms: 5000,

            circuit_breaker_failure_threshold: 5,
            circuit_breaker_success_threshold: 2,
            circuit_breaker_open_duration: Duration::from_secs(30),

            rate_limit_rps: 20,
            rate_limit_burst: 10,

            cache_max_entries: 1000,
            cache_max_bytes: 100 * 1024 * 1024,
            cache_sweep_interval: Duration::from_secs(60),

            discovery_cap: 200,

            log_level: "info".to_string(),
            metrics_port: 9090,
            runs_log_max_bytes: 10 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.output_dir, "output");
        assert_eq!(config.concurrent_limit, 50);
        assert_eq!(config.rate_limit_rps, 20);
        assert_eq!(config.max_body_bytes, 10 * 1024 * 1024);
        assert!(config.github_token.is_none());
    }

    #[test]
    fn test_rate_limiting_enabled() {
        let config = Config::default();
        assert!(config.rate_limiting_enabled());

        let config = Config {
            rate_limit_rps: 0,
            ..Config::default()
        };
        assert!(!config.rate_limiting_enabled());
    }

    #[test]
    fn test_metrics_enabled() {
        let config = Config::default();
        assert!(config.metrics_enabled());

        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(!config.metrics_enabled());
    }

    #[test]
    fn test_validate_concurrent_limit_zero() {
        let config = Config {
            concurrent_limit: 0,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("VPN_CONCURRENT_LIMIT")
        );
    }

    #[test]
    fn test_validate_max_body_bytes_zero() {
        let config = Config {
            max_body_bytes: 0,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("MAX_BODY_BYTES"));
    }

    #[test]
    fn test_validate_output_dir_empty() {
        let config = Config {
            output_dir: "   ".to_string(),
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("OUTPUT_DIR"));
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }
}
