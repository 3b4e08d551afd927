//! Per-host token bucket, built on the same keyed `governor` limiter the
//! HTTP rate-limit middleware in this codebase's lineage uses for per-IP
//! limiting — here keyed by fetch-target host instead of client IP.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use thiserror::Error;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Debug, Error)]
pub enum RateLimiterError {
    #[error("rate must be greater than zero")]
    ZeroRate,
}

/// Token bucket keyed by host: `rate` tokens/second refill, `capacity`
/// maximum burst.
#[derive(Clone)]
pub struct HostRateLimiter {
    limiter: Arc<KeyedLimiter>,
}

impl HostRateLimiter {
    pub fn new(rate_per_sec: u32, capacity: u32) -> Result<Self, RateLimiterError> {
        let rate = NonZeroU32::new(rate_per_sec).ok_or(RateLimiterError::ZeroRate)?;
        let burst = NonZeroU32::new(capacity.max(1)).ok_or(RateLimiterError::ZeroRate)?;
        let quota = Quota::per_second(rate).allow_burst(burst);
        Ok(Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        })
    }

    /// Block until a token is available for `host`. This is the fetcher's
    /// bounded-wait backpressure point (§5 suspension points).
    pub async fn acquire(&self, host: &str) {
        loop {
            match self.limiter.check_key(&host.to_string()) {
                Ok(()) => return,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(DefaultClock::default().now());
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(
            HostRateLimiter::new(0, 10),
            Err(RateLimiterError::ZeroRate)
        ));
    }

    #[tokio::test]
    async fn distinct_hosts_have_independent_buckets() {
        let limiter = HostRateLimiter::new(1, 1).expect("valid quota");
        limiter.acquire("a.example").await;
        // a different host should not be throttled by a.example's bucket
        let start = std::time::Instant::now();
        limiter.acquire("b.example").await;
        assert!(start.elapsed() < std::time::Duration::from_millis(200));
    }
}
