//! Fixed-window attempt limiter keyed by caller-chosen strings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::error::AuthError;

#[derive(Debug, Clone, Copy)]
struct AttemptWindow {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Counts attempts per key inside a fixed window that starts at the first
/// attempt and resets once it has passed.
///
/// `check` admits and records an attempt in one step, so a rejected call
/// leaves the count untouched. Callers that only want failures to accumulate
/// call [`clear`](Self::clear) after a success.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, AttemptWindow>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt for `key`, rejecting it when `max_attempts` have
    /// already been admitted inside the current window.
    pub fn check(&self, key: &str, max_attempts: u32, window: Duration) -> Result<(), AuthError> {
        self.check_at(key, max_attempts, window, Utc::now())
    }

    fn check_at(
        &self,
        key: &str,
        max_attempts: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let mut windows = self.windows.lock().unwrap();
        match windows.get_mut(key) {
            Some(attempts) if now < attempts.reset_at => {
                if attempts.count >= max_attempts {
                    let retry_after = (attempts.reset_at - now).num_milliseconds().max(0) as u64;
                    return Err(AuthError::RateLimited {
                        retry_after_ms: Some(retry_after),
                    });
                }
                attempts.count += 1;
            }
            _ => {
                windows.insert(
                    key.to_string(),
                    AttemptWindow {
                        count: 1,
                        reset_at: now + window,
                    },
                );
            }
        }
        Ok(())
    }

    /// Forget the window for `key`, if any.
    pub fn clear(&self, key: &str) {
        self.windows.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        let window = Duration::seconds(60);

        for _ in 0..5 {
            limiter.check_at("refresh-token", 5, window, now).unwrap();
        }
        let result = limiter.check_at("refresh-token", 5, window, now);
        match result {
            Err(AuthError::RateLimited { retry_after_ms }) => {
                assert_eq!(retry_after_ms, Some(60_000));
            }
            other => panic!("expected rate limit error, got {other:?}"),
        }
    }

    #[test]
    fn window_resets_after_it_passes() {
        let limiter = RateLimiter::new();
        let start = Utc::now();
        let window = Duration::seconds(60);

        for _ in 0..5 {
            limiter.check_at("key", 5, window, start).unwrap();
        }
        assert!(limiter.check_at("key", 5, window, start).is_err());

        let later = start + Duration::seconds(61);
        limiter.check_at("key", 5, window, later).unwrap();
        // the fresh window admits a full budget again
        for _ in 0..4 {
            limiter.check_at("key", 5, window, later).unwrap();
        }
        assert!(limiter.check_at("key", 5, window, later).is_err());
    }

    #[test]
    fn window_is_fixed_from_the_first_attempt() {
        let limiter = RateLimiter::new();
        let start = Utc::now();
        let window = Duration::seconds(60);

        limiter.check_at("key", 5, window, start).unwrap();
        // attempts late in the window do not extend it
        for _ in 0..4 {
            limiter
                .check_at("key", 5, window, start + Duration::seconds(59))
                .unwrap();
        }
        assert!(limiter
            .check_at("key", 5, window, start + Duration::seconds(59))
            .is_err());
        assert!(limiter
            .check_at("key", 5, window, start + Duration::seconds(60))
            .is_ok());
    }

    #[test]
    fn keys_are_tracked_independently() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        let window = Duration::seconds(60);

        for _ in 0..5 {
            limiter.check_at("token-a", 5, window, now).unwrap();
        }
        assert!(limiter.check_at("token-a", 5, window, now).is_err());
        assert!(limiter.check_at("token-b", 5, window, now).is_ok());
    }

    #[test]
    fn clear_forgets_recorded_attempts() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        let window = Duration::seconds(60);

        for _ in 0..5 {
            limiter.check_at("key", 5, window, now).unwrap();
        }
        assert!(limiter.check_at("key", 5, window, now).is_err());

        limiter.clear("key");
        assert!(limiter.check_at("key", 5, window, now).is_ok());
    }

    #[test]
    fn public_check_uses_the_real_clock() {
        let limiter = RateLimiter::new();
        limiter.check("key", 1, Duration::seconds(60)).unwrap();
        assert!(limiter.check("key", 1, Duration::seconds(60)).is_err());
    }
}
