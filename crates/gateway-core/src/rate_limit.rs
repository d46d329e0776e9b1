//! Per-key sliding-window rate limiter. Each key keeps an ordered
//! list of request instants within the trailing 60s; admission and pruning
//! happen under the same per-key critical section so the decision is O(window).

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const WINDOW_SECONDS: i64 = 60;
const CLEANER_INTERVAL: Duration = Duration::from_secs(5 * 60);
const STALE_AFTER_SECONDS: i64 = 2 * WINDOW_SECONDS;

/// Outcome of a single `check` call, carrying everything needed to populate
/// the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_ms: u64,
}

struct Window {
    instants: VecDeque<DateTime<Utc>>,
}

pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new() -> std::sync::Arc<Self> {
        let limiter = std::sync::Arc::new(Self {
            windows: Mutex::new(HashMap::new()),
            cleaner: Mutex::new(None),
        });
        limiter.spawn_cleaner();
        limiter
    }

    fn spawn_cleaner(self: &std::sync::Arc<Self>) {
        let limiter = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANER_INTERVAL);
            loop {
                ticker.tick().await;
                limiter.sweep_stale();
            }
        });
        *self.cleaner.lock().unwrap() = Some(handle);
    }

    fn sweep_stale(&self) {
        let now = Utc::now();
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|_, window| {
            window
                .instants
                .back()
                .map(|newest| (now - *newest).num_seconds() < STALE_AFTER_SECONDS)
                .unwrap_or(false)
        });
        debug!(live_windows = windows.len(), "rate limiter sweep complete");
    }

    /// sliding-window admission. `limit` is the caller's requests-per-minute
    /// ceiling (from the API-key record or the pay-per-call default).
    pub fn check(&self, key: &str, limit: u32, now: DateTime<Utc>) -> RateLimitDecision {
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(key.to_string()).or_insert_with(|| Window {
            instants: VecDeque::new(),
        });

        while let Some(oldest) = window.instants.front() {
            if (now - *oldest).num_seconds() >= WINDOW_SECONDS {
                window.instants.pop_front();
            } else {
                break;
            }
        }

        let count = window.instants.len() as u32;
        if count >= limit {
            let oldest = *window.instants.front().expect("count >= limit > 0 implies non-empty");
            let reset_at = oldest + chrono::Duration::seconds(WINDOW_SECONDS);
            let reset_ms = (reset_at - now).num_milliseconds().max(0) as u64;
            return RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_ms,
            };
        }

        window.instants.push_back(now);
        let remaining = limit - count - 1;
        let reset_ms = window
            .instants
            .front()
            .map(|oldest| (*oldest + chrono::Duration::seconds(WINDOW_SECONDS) - now).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        RateLimitDecision {
            allowed: true,
            limit,
            remaining,
            reset_ms,
        }
    }

    #[cfg(test)]
    fn window_count(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.cleaner.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// `Retry-After` header value in whole seconds, ceiling of `reset_ms/1000`.
pub fn retry_after_seconds(reset_ms: u64) -> u64 {
    (reset_ms + 999) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        for _ in 0..5 {
            let decision = limiter.check("key-a", 5, now);
            assert!(decision.allowed);
        }
        let rejected = limiter.check("key-a", 5, now);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.reset_ms <= 60_000);
    }

    #[tokio::test]
    async fn prunes_entries_older_than_window() {
        let limiter = RateLimiter::new();
        let t0 = Utc::now();
        for _ in 0..3 {
            assert!(limiter.check("key-b", 3, t0).allowed);
        }
        assert!(!limiter.check("key-b", 3, t0).allowed);

        let t1 = t0 + chrono::Duration::seconds(61);
        let decision = limiter.check("key-b", 3, t1);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn remaining_counts_down_correctly() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        let first = limiter.check("key-c", 10, now);
        assert_eq!(first.remaining, 9);
        let second = limiter.check("key-c", 10, now);
        assert_eq!(second.remaining, 8);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        for _ in 0..2 {
            limiter.check("key-d", 2, now);
        }
        assert!(!limiter.check("key-d", 2, now).allowed);
        assert!(limiter.check("key-e", 2, now).allowed);
        assert_eq!(limiter.window_count(), 2);
    }

    #[test]
    fn retry_after_rounds_up_to_whole_seconds() {
        assert_eq!(retry_after_seconds(0), 0);
        assert_eq!(retry_after_seconds(1), 1);
        assert_eq!(retry_after_seconds(1000), 1);
        assert_eq!(retry_after_seconds(1001), 2);
        assert_eq!(retry_after_seconds(30_000), 30);
    }
}
