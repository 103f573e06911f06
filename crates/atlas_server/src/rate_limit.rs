//! Sliding-window request limiter keyed by API key or client address.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Keys tracked before idle ones are evicted.
const MAX_TRACKED_KEYS: usize = 16_384;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit as usize, Duration::from_secs(60))
    }

    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a request for `key`; false when the window is already full.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let Ok(mut hits) = self.hits.lock() else {
            // poisoned: fail open
            return true;
        };

        if hits.len() >= MAX_TRACKED_KEYS && !hits.contains_key(key) {
            let window = self.window;
            hits.retain(|_, q| q.back().is_some_and(|t| now.duration_since(*t) < window));
        }

        let queue = hits.entry(key.to_string()).or_default();
        while queue
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            queue.pop_front();
        }

        if queue.len() >= self.limit {
            return false;
        }
        queue.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_within_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check_at("a", now));
        assert!(limiter.check_at("a", now));
        assert!(!limiter.check_at("a", now));
        // keys are independent
        assert!(limiter.check_at("b", now));
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let start = Instant::now();
        assert!(limiter.check_at("a", start));
        assert!(!limiter.check_at("a", start + Duration::from_secs(30)));
        assert!(limiter.check_at("a", start + Duration::from_secs(61)));
    }
}
