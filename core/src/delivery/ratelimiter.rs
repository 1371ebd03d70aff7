//! Global fractional token-bucket rate limiter shared by every per-device
//! worker (spec §4.D "Global rate limiting", grounded on
//! `sender.py::_acquire_rate_limit`).

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::metrics::MetricsRegistry;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// One bucket shared across all device workers, refilled at
/// `rate_limit_per_second` up to `rate_limit_burst` capacity. Disabled
/// (always grants immediately) when either is non-positive.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            rate,
            burst,
        }
    }

    fn enabled(&self) -> bool {
        self.rate > 0.0 && self.burst > 0.0
    }

    /// Blocks until a token is available, refilling proportionally to wall
    /// clock time elapsed since the last check.
    pub async fn acquire(&self, metrics: &MetricsRegistry) {
        if !self.enabled() {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                let now = Instant::now();
                let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
                bucket.last_refill = now;
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    metrics.gauges.set("rate_limit_tokens", bucket.tokens.floor() as i64);
                    return;
                }
                let wait = (1.0 - bucket.tokens) / self.rate;
                metrics.gauges.set("rate_limit_tokens", bucket.tokens.floor() as i64);
                wait
            };
            metrics.counters.incr("rate_limit_waits:global");
            tokio::time::sleep(Duration::from_secs_f64(wait.max(0.0))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_capacity_is_granted_immediately() {
        let limiter = RateLimiter::new(10.0, 3.0);
        let metrics = MetricsRegistry::new();
        limiter.acquire(&metrics).await;
        limiter.acquire(&metrics).await;
        limiter.acquire(&metrics).await;
        assert_eq!(metrics.counters.get("rate_limit_waits:global"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_refill() {
        let limiter = RateLimiter::new(10.0, 1.0);
        let metrics = MetricsRegistry::new();
        limiter.acquire(&metrics).await;

        let start = tokio::time::Instant::now();
        limiter.acquire(&metrics).await;
        assert!(tokio::time::Instant::now() >= start);
        assert!(metrics.counters.get("rate_limit_waits:global") >= 1);
    }

    #[test]
    fn disabled_when_rate_or_burst_non_positive() {
        let limiter = RateLimiter::new(0.0, 5.0);
        assert!(!limiter.enabled());
    }
}
