use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::sync_ext::MutexExt;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// In-memory token buckets keyed by `{bucket, subject}`. Cluster-wide limits
/// are out of scope; when the distributed queue adapter is active it carries
/// its own per-user caps.
pub struct RateLimiter {
    buckets: Mutex<HashMap<(String, String), Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token from `{bucket, subject}`; `capacity` tokens refill over
    /// `window_s` seconds. Returns false when the bucket is empty.
    pub fn allow(&self, bucket: &str, subject: &str, capacity: u32, window_s: f64) -> bool {
        let capacity = f64::from(capacity.max(1));
        let refill_per_s = capacity / window_s.max(0.001);
        let now = Instant::now();

        let mut buckets = self.buckets.lock_unpoisoned();
        let entry = buckets
            .entry((bucket.to_string(), subject.to_string()))
            .or_insert(Bucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.duration_since(entry.last_refill).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * refill_per_s).min(capacity);
        entry.last_refill = now;

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets that have fully refilled; called opportunistically by the
    /// retention sweep so the map cannot grow without bound.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock_unpoisoned();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill).as_secs() < 3600);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_empties_after_capacity_hits() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.allow("login", "1.2.3.4", 5, 60.0));
        }
        assert!(!limiter.allow("login", "1.2.3.4", 5, 60.0));
        // A different subject has its own bucket.
        assert!(limiter.allow("login", "5.6.7.8", 5, 60.0));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new();
        // Capacity 2 over 0.1 s: drain, then wait for refill.
        assert!(limiter.allow("chunk", "up1", 2, 0.1));
        assert!(limiter.allow("chunk", "up1", 2, 0.1));
        assert!(!limiter.allow("chunk", "up1", 2, 0.1));
        std::thread::sleep(std::time::Duration::from_millis(120));
        assert!(limiter.allow("chunk", "up1", 2, 0.1));
    }

    #[test]
    fn buckets_are_isolated_by_name() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("a", "x", 1, 60.0));
        assert!(!limiter.allow("a", "x", 1, 60.0));
        assert!(limiter.allow("b", "x", 1, 60.0));
    }
}
