//! Per-host circuit breaker: closed → open after consecutive failures,
//! open for a cooldown, then a half-open trial.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            cooldown,
        }
    }
}

struct CircuitBreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

/// One breaker instance, scoped to a single host by the [`BreakerRegistry`].
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitBreakerState>,
    times_opened: AtomicU32,
    requests_rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitBreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                consecutive_failures: 0,
                consecutive_successes: 0,
            }),
            times_opened: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    /// Whether a request may proceed. Transitions Open → HalfOpen once the
    /// cooldown elapses, admitting exactly the first trial request.
    pub async fn allow_request(&self) -> bool {
        {
            let guard = self.state.read().await;
            match guard.state {
                CircuitState::Closed | CircuitState::HalfOpen => return true,
                CircuitState::Open => {
                    let Some(opened_at) = guard.opened_at else {
                        return true;
                    };
                    if opened_at.elapsed() < self.config.cooldown {
                        drop(guard);
                        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                }
            }
        }

        let mut guard = self.state.write().await;
        if guard.state == CircuitState::Open {
            guard.state = CircuitState::HalfOpen;
            guard.consecutive_successes = 0;
        }
        true
    }

    pub async fn record_success(&self) {
        let mut guard = self.state.write().await;
        guard.consecutive_failures = 0;
        match guard.state {
            CircuitState::HalfOpen => {
                guard.consecutive_successes += 1;
                if guard.consecutive_successes >= self.config.success_threshold {
                    guard.state = CircuitState::Closed;
                    guard.opened_at = None;
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut guard = self.state.write().await;
        guard.consecutive_successes = 0;
        guard.consecutive_failures += 1;

        match guard.state {
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
                self.times_opened.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::Closed if guard.consecutive_failures >= self.config.failure_threshold => {
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
                self.times_opened.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(3, 1, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = CircuitBreaker::new(fast_config());
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.allow_request().await);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.allow_request().await);
    }

    #[tokio::test]
    async fn half_opens_after_cooldown_and_closes_on_success() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.allow_request().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.allow_request().await);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let cb = CircuitBreaker::new(fast_config());
        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        cb.record_failure().await;
        // two more failures after reset shouldn't trip a 3-threshold breaker
        assert_eq!(cb.state().await, CircuitState::Closed);
    }
}
