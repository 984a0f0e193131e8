//! In-memory token-bucket rate limiting for the credential endpoints.
//!
//! Keyed by client source address, so one noisy origin cannot burn the
//! guess budget for everyone behind the relay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
    max_tokens: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(attempts_per_minute: u32) -> Self {
        let max = attempts_per_minute.max(1) as f64;
        RateLimiter {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            max_tokens: max,
            refill_per_sec: max / 60.0,
        }
    }

    /// Take one token for `key`; false means the caller gets a 429.
    pub fn check(&self, key: &str) -> bool {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            // A poisoned limiter fails open; login still has the
            // password and audit trail behind it.
            Err(_) => return true,
        };

        if buckets.len() > 10_000 {
            let horizon = Instant::now();
            buckets.retain(|_, bucket| {
                horizon.duration_since(bucket.last_refill).as_secs() < 600
            });
        }

        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert(TokenBucket {
            tokens: self.max_tokens,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_budget_then_blocks() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.check("user@example.com"));
        assert!(limiter.check("user@example.com"));
        assert!(limiter.check("user@example.com"));
        assert!(!limiter.check("user@example.com"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("a@example.com"));
        assert!(!limiter.check("a@example.com"));
        assert!(limiter.check("b@example.com"));
    }

    #[test]
    fn zero_configures_as_one() {
        let limiter = RateLimiter::new(0);
        assert!(limiter.check("x@example.com"));
        assert!(!limiter.check("x@example.com"));
    }
}
