// In-memory sliding-window rate limiter for context updates, keyed by session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Error returned when a session sends updates too quickly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Rate limit exceeded: max {max} updates per {window:?}")]
pub struct RateLimitError {
    pub max: usize,
    pub window: Duration,
}

/// Thread-safe in-memory rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max: usize,
    window: Duration,
    inner: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
}

impl RateLimiter {
    /// `max == 0` disables limiting.
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Limiter allowing `max` updates per minute.
    pub fn per_minute(max: usize) -> Self {
        Self::new(max, Duration::from_secs(60))
    }

    /// Check if the session is within the limit.
    /// If within limits, records the event and returns Ok(()).
    pub fn check(&self, session_id: &str) -> Result<(), RateLimitError> {
        if self.max == 0 {
            return Ok(());
        }
        let mut map = self.inner.lock().unwrap();
        let now = Instant::now();
        let window = self.window;

        let entries = map.entry(session_id.to_string()).or_default();

        // Remove expired entries
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= self.max {
            return Err(RateLimitError {
                max: self.max,
                window,
            });
        }

        entries.push(now);
        Ok(())
    }

    /// Forget a session (e.g., when its WebSocket closes).
    pub fn release(&self, session_id: &str) {
        let mut map = self.inner.lock().unwrap();
        map.remove(session_id);
    }

    /// Drop sessions whose windows have emptied. Returns the number dropped.
    pub fn purge_expired(&self) -> usize {
        let mut map = self.inner.lock().unwrap();
        let now = Instant::now();
        let window = self.window;
        let before = map.len();
        map.retain(|_, entries| {
            entries.retain(|t| now.duration_since(*t) < window);
            !entries.is_empty()
        });
        before - map.len()
    }

    /// Number of sessions with a tracked window.
    pub fn tracked(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Get the current count for a session (for testing/diagnostics).
    pub fn current_count(&self, session_id: &str) -> usize {
        let mut map = self.inner.lock().unwrap();
        let now = Instant::now();
        let window = self.window;

        if let Some(entries) = map.get_mut(session_id) {
            entries.retain(|t| now.duration_since(*t) < window);
            entries.len()
        } else {
            0
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::per_minute(120)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_allows_within_limit() {
        let limiter = RateLimiter::per_minute(10);
        for _ in 0..10 {
            assert!(limiter.check("s1").is_ok());
        }
    }

    #[test]
    fn test_rate_limiter_denies_over_limit() {
        let limiter = RateLimiter::per_minute(3);
        for _ in 0..3 {
            assert!(limiter.check("s1").is_ok());
        }
        let err = limiter.check("s1").unwrap_err();
        assert_eq!(err.max, 3);
        assert_eq!(err.window, Duration::from_secs(60));
    }

    #[test]
    fn test_rate_limiter_separate_sessions() {
        let limiter = RateLimiter::per_minute(3);
        for _ in 0..3 {
            assert!(limiter.check("s1").is_ok());
        }
        assert!(limiter.check("s1").is_err());

        // Session 2 should still be fine
        assert!(limiter.check("s2").is_ok());
    }

    #[test]
    fn test_rate_limiter_release() {
        let limiter = RateLimiter::per_minute(2);
        limiter.check("s1").unwrap();
        limiter.check("s1").unwrap();
        assert!(limiter.check("s1").is_err());

        limiter.release("s1");
        assert_eq!(limiter.current_count("s1"), 0);
        assert!(limiter.check("s1").is_ok());
    }

    #[test]
    fn test_rate_limiter_window_expires() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30));
        limiter.check("s1").unwrap();
        assert!(limiter.check("s1").is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.check("s1").is_ok());
    }

    #[test]
    fn test_zero_disables_limit() {
        let limiter = RateLimiter::per_minute(0);
        for _ in 0..1000 {
            assert!(limiter.check("s1").is_ok());
        }
        assert_eq!(limiter.current_count("s1"), 0);
    }

    #[test]
    fn test_rate_limit_error_display() {
        let err = RateLimitError {
            max: 10,
            window: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "Rate limit exceeded: max 10 updates per 60s");
    }

    #[test]
    fn test_purge_expired_drops_empty_windows() {
        let limiter = RateLimiter::new(5, Duration::from_millis(20));
        limiter.check("idle").unwrap();
        assert_eq!(limiter.purge_expired(), 0);

        std::thread::sleep(Duration::from_millis(40));
        limiter.check("busy").unwrap();
        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(limiter.current_count("busy"), 1);
    }
}
