//! Sliding-window request limiter keyed by session and client address.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::RateLimitConfig;

/// Counts admissions per key over a trailing window.
///
/// Each key's window is guarded by its map shard, so prune, compare and append
/// happen atomically for that key without a global lock.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window)
    }

    /// Build the composite key for a request.
    pub fn key(session_id: Option<&str>, client_addr: &str) -> String {
        format!("{}:{}", session_id.unwrap_or("anonymous"), client_addr)
    }

    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    pub fn admit_at(&self, key: &str, now: Instant) -> bool {
        let mut window = self.windows.entry(key.to_string()).or_default();
        prune(&mut window, now, self.window);

        if window.len() < self.max_requests {
            window.push_back(now);
            true
        } else {
            false
        }
    }

    /// Whole seconds until the oldest counted request leaves the window.
    pub fn retry_after_secs(&self, key: &str) -> u64 {
        self.retry_after_secs_at(key, Instant::now())
    }

    pub fn retry_after_secs_at(&self, key: &str, now: Instant) -> u64 {
        let Some(window) = self.windows.get(key) else {
            return 0;
        };
        let Some(oldest) = window.front() else {
            return 0;
        };

        let frees_at = *oldest + self.window;
        let remaining = frees_at.saturating_duration_since(now);
        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        secs.max(1)
    }

    /// Drop keys with no activity inside the window.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            prune(window, now, self.window);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, length: Duration) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(*oldest) >= length {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rejects_request_over_limit_until_oldest_expires() {
        let limiter = RateLimiter::new(3, Duration::from_millis(1000));
        let start = Instant::now();

        assert!(limiter.admit_at("k", start));
        assert!(limiter.admit_at("k", start + Duration::from_millis(100)));
        assert!(limiter.admit_at("k", start + Duration::from_millis(200)));
        assert!(!limiter.admit_at("k", start + Duration::from_millis(300)));

        // Still inside the window of the first admission.
        assert!(!limiter.admit_at("k", start + Duration::from_millis(999)));
        // First admission has left the window.
        assert!(limiter.admit_at("k", start + Duration::from_millis(1000)));
        assert!(!limiter.admit_at("k", start + Duration::from_millis(1050)));
    }

    #[test]
    fn two_per_second_third_call_gets_retry_hint() {
        let limiter = RateLimiter::new(2, Duration::from_millis(1000));
        let start = Instant::now();
        let key = RateLimiter::key(Some("session-1"), "10.0.0.1");

        assert!(limiter.admit_at(&key, start));
        assert!(limiter.admit_at(&key, start + Duration::from_millis(100)));
        assert!(!limiter.admit_at(&key, start + Duration::from_millis(200)));

        let retry = limiter.retry_after_secs_at(&key, start + Duration::from_millis(200));
        assert!(retry > 0);
        assert_eq!(retry, 1);
    }

    #[test]
    fn denied_requests_are_not_counted() {
        let limiter = RateLimiter::new(1, Duration::from_millis(500));
        let start = Instant::now();

        assert!(limiter.admit_at("k", start));
        for i in 1..10 {
            assert!(!limiter.admit_at("k", start + Duration::from_millis(i * 10)));
        }
        assert!(limiter.admit_at("k", start + Duration::from_millis(500)));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let a = RateLimiter::key(None, "1.1.1.1");
        let b = RateLimiter::key(None, "2.2.2.2");
        assert_eq!(a, "anonymous:1.1.1.1");

        assert!(limiter.admit(&a));
        assert!(!limiter.admit(&a));
        assert!(limiter.admit(&b));
    }

    #[test]
    fn unseen_key_has_no_retry_delay() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));
        assert_eq!(limiter.retry_after_secs("never-seen"), 0);
    }

    #[test]
    fn sweep_evicts_idle_keys_only() {
        let limiter = RateLimiter::new(5, Duration::from_millis(1000));
        let start = Instant::now();

        limiter.admit_at("old", start);
        limiter.admit_at("fresh", start + Duration::from_millis(900));
        assert_eq!(limiter.tracked_keys(), 2);

        let evicted = limiter.sweep_at(start + Duration::from_millis(1200));
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert!(limiter.windows.contains_key("fresh"));
    }

    #[test]
    fn concurrent_admissions_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new(50, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..40).filter(|_| limiter.admit("shared")).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
