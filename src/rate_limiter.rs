//! Per-endpoint token buckets for C1 (§4.1, §5: "the rate-limiter state in C1 is
//! per-endpoint with its own mutex").

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub per_minute: u32,
    pub per_second: u32,
    pub burst: u32,
}

impl BucketConfig {
    const fn new(per_minute: u32, per_second: u32, burst: u32) -> Self {
        Self { per_minute, per_second, burst }
    }
}

/// Conservative default for endpoints not named in the table below.
const UNKNOWN_ENDPOINT: BucketConfig = BucketConfig::new(5, 1, 2);

fn default_bucket_for(endpoint: &str) -> BucketConfig {
    match endpoint {
        "positions" => BucketConfig::new(5, 1, 2),
        "account" => BucketConfig::new(10, 2, 3),
        "balance" => BucketConfig::new(10, 2, 3),
        "order" => BucketConfig::new(60, 10, 15),
        "ticker-price" => BucketConfig::new(40, 5, 10),
        _ => UNKNOWN_ENDPOINT,
    }
}

struct Bucket {
    config: BucketConfig,
    tokens: f64,
    last_refill: Instant,
    minute_window_start: Instant,
    minute_count: u32,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            tokens: config.burst as f64,
            last_refill: now,
            minute_window_start: now,
            minute_count: 0,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.config.per_second as f64)
            .min(self.config.burst as f64);
        self.last_refill = now;

        if now.duration_since(self.minute_window_start) >= Duration::from_secs(60) {
            self.minute_window_start = now;
            self.minute_count = 0;
        }
    }

    /// Returns `Some(wait)` if the caller must wait `wait` before retrying, or `None`
    /// if a token was consumed immediately.
    fn try_acquire(&mut self) -> Option<Duration> {
        self.refill();

        if self.minute_count >= self.config.per_minute {
            return Some(Duration::from_secs(60) - self.minute_window_start.elapsed());
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.minute_count += 1;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.config.per_second as f64))
        }
    }
}

/// One token bucket per named endpoint class, each behind its own mutex slot.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { buckets: Mutex::new(HashMap::new()) }
    }

    /// Awaits until a token is available for `endpoint`, looping on the bucket's
    /// reported wait time (another caller may have raced us).
    pub async fn acquire(&self, endpoint: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets
                    .entry(endpoint.to_string())
                    .or_insert_with(|| Bucket::new(default_bucket_for(endpoint)));
                bucket.try_acquire()
            };

            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay.max(Duration::from_millis(1))).await,
            }
        }
    }

    /// Backoff delay for a retried call, per §4.1: `min(60s, 2^attempt * base)`,
    /// `base` = 1s for rate-limit rejections, 100ms otherwise.
    pub fn backoff_delay(attempt: u32, is_rate_limit: bool) -> Duration {
        let base_ms: u64 = if is_rate_limit { 1000 } else { 100 };
        let capped = base_ms.saturating_mul(1u64 << attempt.min(20)).min(60_000);
        Duration::from_millis(capped)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_consumes_burst_without_waiting() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..2 {
            limiter.acquire("order").await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn backoff_delay_caps_at_sixty_seconds() {
        assert_eq!(RateLimiter::backoff_delay(20, true), Duration::from_secs(60));
    }

    #[test]
    fn backoff_delay_uses_rate_limit_base() {
        assert_eq!(RateLimiter::backoff_delay(0, true), Duration::from_millis(1000));
        assert_eq!(RateLimiter::backoff_delay(0, false), Duration::from_millis(100));
    }

    #[test]
    fn unknown_endpoint_gets_conservative_default() {
        let cfg = default_bucket_for("something-new");
        assert_eq!(cfg.per_minute, 5);
        assert_eq!(cfg.per_second, 1);
        assert_eq!(cfg.burst, 2);
    }
}
