use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Per-IP token buckets, keyed by (endpoint, ip).
///
/// Buckets refill continuously at the endpoint's configured
/// requests-per-minute rate and hold at most one minute of burst.
/// Unconfigured endpoints are unlimited.
pub struct RateLimiter {
    /// Endpoint name to per-minute cap.
    limits: HashMap<String, u32>,
    buckets: Mutex<HashMap<(String, String), Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(limits: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            limits: limits.into_iter().collect(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false when the caller is over the endpoint's cap.
    pub fn allow(&self, endpoint: &str, ip: &str) -> bool {
        self.allow_at(endpoint, ip, Instant::now())
    }

    fn allow_at(&self, endpoint: &str, ip: &str, now: Instant) -> bool {
        let Some(&per_minute) = self.limits.get(endpoint) else {
            return true;
        };
        if per_minute == 0 {
            return false;
        }
        let rate_per_sec = f64::from(per_minute) / 60.0;
        let capacity = f64::from(per_minute);

        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((endpoint.to_string(), ip.to_string()))
            .or_insert(Bucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * rate_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets idle past `max_idle`; called by the background
    /// sweeper so the map does not grow with every IP ever seen.
    pub fn sweep(&self, max_idle: Duration) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, b| now.saturating_duration_since(b.last_refill) < max_idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_endpoint_is_unlimited() {
        let limiter = RateLimiter::new([]);
        for _ in 0..1000 {
            assert!(limiter.allow("login", "1.2.3.4"));
        }
    }

    #[test]
    fn burst_capped_at_configured_rate() {
        let limiter = RateLimiter::new([("login".to_string(), 5)]);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.allow_at("login", "1.2.3.4", now));
        }
        assert!(!limiter.allow_at("login", "1.2.3.4", now));
    }

    #[test]
    fn ips_limited_independently() {
        let limiter = RateLimiter::new([("login".to_string(), 1)]);
        let now = Instant::now();
        assert!(limiter.allow_at("login", "1.1.1.1", now));
        assert!(!limiter.allow_at("login", "1.1.1.1", now));
        assert!(limiter.allow_at("login", "2.2.2.2", now));
    }

    #[test]
    fn bucket_refills_over_time() {
        let limiter = RateLimiter::new([("login".to_string(), 60)]);
        let start = Instant::now();
        for _ in 0..60 {
            assert!(limiter.allow_at("login", "ip", start));
        }
        assert!(!limiter.allow_at("login", "ip", start));
        // One second refills one token at 60/min.
        assert!(limiter.allow_at("login", "ip", start + Duration::from_secs(1)));
    }

    #[test]
    fn zero_cap_blocks_everything() {
        let limiter = RateLimiter::new([("register".to_string(), 0)]);
        assert!(!limiter.allow("register", "ip"));
    }

    #[test]
    fn sweep_drops_idle_buckets() {
        let limiter = RateLimiter::new([("login".to_string(), 5)]);
        limiter.allow("login", "1.2.3.4");
        assert_eq!(limiter.buckets.lock().len(), 1);
        limiter.sweep(Duration::from_secs(0));
        assert_eq!(limiter.buckets.lock().len(), 0);
    }
}
