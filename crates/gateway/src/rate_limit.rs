//! Per-source rate limiting for the HTTP surface (C10, §4.8).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window limiter: at most `limit` calls per source key per 60s.
/// Bounded key count with periodic TTL cleanup to resist enumeration.
pub struct RateLimiter {
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
    limit: u32,
    window: Duration,
    max_keys: usize,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            limit: requests_per_minute,
            window: Duration::from_secs(60),
            max_keys: 10_000,
        }
    }

    /// Returns `Ok(())` if `key` may proceed, or `Err(retry_after_ms)` if not.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if attempts.len() > self.max_keys {
            attempts.retain(|_, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < self.window);
                !timestamps.is_empty()
            });
        }

        let entry = attempts.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() as u32 >= self.limit {
            let oldest = entry.first().copied().unwrap_or(now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(retry_after.as_millis() as u64);
        }

        entry.push(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("b").is_ok());
        assert!(limiter.check("a").is_err());
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let limiter = RateLimiter::new(0);
        assert!(limiter.check("a").is_err());
    }
}
