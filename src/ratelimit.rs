//! In-process token-bucket rate limiting.
//!
//! Buckets are keyed strings (`user:{id}`, `ip:{addr}`) inside a single map;
//! contention is per-key because a consume holds the map lock only for the
//! refill-and-take arithmetic. Refill uses a monotonic clock, so wall-clock
//! jumps cannot mint or destroy tokens.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, warn};

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Outcome of a consume attempt. `retry_after` is only set on denial and is
/// the whole-second wait until the bucket can cover the requested cost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after: Option<u64>,
}

/// One bucket family (user or ip scope) with shared capacity parameters.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    per_minute: u32,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            capacity: f64::from(burst),
            refill_rate: f64::from(per_minute) / 60.0,
            per_minute,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit_per_minute(&self) -> u32 {
        self.per_minute
    }

    /// Atomically take `cost` tokens for `key`, or compute how long the
    /// caller must wait. A zero cost is rejected outright rather than being
    /// treated as a free pass.
    pub fn consume(&self, key: &str, cost: u32) -> Decision {
        if cost == 0 {
            warn!(key, "rejecting rate-limit consume with non-positive cost");
            return Decision {
                allowed: false,
                remaining: 0,
                retry_after: None,
            };
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets.entry(key.to_string()).or_insert(TokenBucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;

        let cost = f64::from(cost);
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            debug!(key, remaining = bucket.tokens as u64, "rate limit check passed");
            Decision {
                allowed: true,
                remaining: bucket.tokens as u64,
                retry_after: None,
            }
        } else {
            let wait = (cost - bucket.tokens) / self.refill_rate;
            warn!(key, remaining = bucket.tokens as u64, "rate limit exceeded");
            Decision {
                allowed: false,
                remaining: bucket.tokens as u64,
                retry_after: Some(wait.ceil() as u64),
            }
        }
    }

    /// Current token count for `key` without consuming anything.
    pub fn remaining(&self, key: &str) -> u64 {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets.entry(key.to_string()).or_insert(TokenBucket {
            tokens: self.capacity,
            last_refill: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        ((bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn burst_is_honored_then_denied() {
        let limiter = RateLimiter::new(60, 3);
        for _ in 0..3 {
            assert!(limiter.consume("user:a", 1).allowed);
        }
        let denied = limiter.consume("user:a", 1);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(1));
    }

    #[test]
    fn retry_after_is_ceiling_of_deficit_over_rate() {
        // 30/min = 0.5 tokens/sec; an empty bucket needs ceil(1 / 0.5) = 2s.
        let limiter = RateLimiter::new(30, 1);
        assert!(limiter.consume("ip:1.2.3.4", 1).allowed);
        let denied = limiter.consume("ip:1.2.3.4", 1);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(2));
    }

    #[test]
    fn one_hundred_twenty_first_request_waits_one_second() {
        // The s-curve from the service contract: 60/min with burst 120.
        let limiter = RateLimiter::new(60, 120);
        for _ in 0..120 {
            assert!(limiter.consume("user:s3", 1).allowed);
        }
        let denied = limiter.consume("user:s3", 1);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(1));
    }

    #[test]
    fn zero_cost_is_rejected() {
        let limiter = RateLimiter::new(60, 10);
        let decision = limiter.consume("user:z", 0);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, None);
        // The bucket itself is untouched.
        assert!(limiter.consume("user:z", 1).allowed);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(60, 1);
        assert!(limiter.consume("user:a", 1).allowed);
        assert!(limiter.consume("user:b", 1).allowed);
        assert!(!limiter.consume("user:a", 1).allowed);
    }

    #[test]
    fn oversized_cost_leaves_state_unchanged() {
        let limiter = RateLimiter::new(60, 5);
        let denied = limiter.consume("user:c", 10);
        assert!(!denied.allowed);
        // All five burst tokens must still be spendable.
        for _ in 0..5 {
            assert!(limiter.consume("user:c", 1).allowed);
        }
    }

    #[tokio::test]
    async fn concurrent_consumers_never_overspend() {
        let limiter = Arc::new(RateLimiter::new(60, 50));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut granted = 0u32;
                for _ in 0..10 {
                    if limiter.consume("user:shared", 1).allowed {
                        granted += 1;
                    }
                }
                granted
            }));
        }
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        // 80 attempts against 50 burst tokens: refill during the test can
        // add at most a token, never 30.
        assert!(total >= 50 && total <= 52, "granted {total}");
    }
}
