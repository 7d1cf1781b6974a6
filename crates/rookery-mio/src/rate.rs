//! Connection-rate throttling for listeners (the jlimit scheme).
//!
//! A sliding window of `max_time` seconds allows `max_points` points per
//! key. Listeners charge one point per accepted connection, keyed by the
//! remote IP, and refuse the connection when the bucket overflows.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Configuration for a rate limiter: `max_points` per `max_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    /// Window length in seconds.
    pub max_time: u64,
    /// Points allowed inside one window.
    pub max_points: u32,
}

impl RateConfig {
    /// A limit of `max_points` points per `max_time` seconds.
    pub fn new(max_time: u64, max_points: u32) -> Self {
        Self {
            max_time,
            max_points,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    window_start: Instant,
    points: u32,
}

/// Sliding-window rate limiter keyed by string (usually a peer IP).
#[derive(Debug)]
pub struct RateLimit {
    config: RateConfig,
    buckets: HashMap<String, Bucket>,
}

impl RateLimit {
    /// A limiter with the given window configuration.
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            buckets: HashMap::new(),
        }
    }

    /// Charge `points` against `key`. Returns `true` when the key is now
    /// over its limit and the action should be refused.
    pub fn check(&mut self, key: &str, points: u32) -> bool {
        self.check_at(key, points, Instant::now())
    }

    fn check_at(&mut self, key: &str, points: u32, now: Instant) -> bool {
        let window = Duration::from_secs(self.config.max_time);
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                window_start: now,
                points: 0,
            });

        if now.duration_since(bucket.window_start) > window {
            bucket.window_start = now;
            bucket.points = 0;
        }

        bucket.points = bucket.points.saturating_add(points);
        bucket.points > self.config.max_points
    }

    /// Drop buckets whose window has long passed. Called opportunistically
    /// by listeners to bound memory.
    pub fn sweep(&mut self) {
        let window = Duration::from_secs(self.config.max_time);
        let now = Instant::now();
        self.buckets
            .retain(|_, b| now.duration_since(b.window_start) <= window * 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit() {
        let mut limit = RateLimit::new(RateConfig::new(60, 3));
        assert!(!limit.check("10.0.0.1", 1));
        assert!(!limit.check("10.0.0.1", 1));
        assert!(!limit.check("10.0.0.1", 1));
        assert!(limit.check("10.0.0.1", 1));
    }

    #[test]
    fn keys_are_independent() {
        let mut limit = RateLimit::new(RateConfig::new(60, 1));
        assert!(!limit.check("10.0.0.1", 1));
        assert!(!limit.check("10.0.0.2", 1));
        assert!(limit.check("10.0.0.1", 1));
    }

    #[test]
    fn window_expiry_resets_the_bucket() {
        let mut limit = RateLimit::new(RateConfig::new(60, 1));
        let start = Instant::now();
        assert!(!limit.check_at("ip", 1, start));
        assert!(limit.check_at("ip", 1, start + Duration::from_secs(10)));
        // a fresh window starts clean
        assert!(!limit.check_at("ip", 1, start + Duration::from_secs(61)));
    }
}
