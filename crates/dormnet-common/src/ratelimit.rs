//! Sliding-window rate limiting

use crate::{CommonError, CommonResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Rate limiter
///
/// Remembers the last `limit` admissions per key. A request is admitted while
/// fewer than `limit` admissions are remembered, or once the oldest of them is
/// older than `window`. Keys idle for longer than `window` are evicted lazily.
pub struct RateLimiter<K> {
    limit: usize,
    window: Duration,
    state: Mutex<LimiterState<K>>,
}

struct LimiterState<K> {
    logs: HashMap<K, AccessLog>,
    last_sweep: Instant,
}

struct AccessLog {
    admitted: VecDeque<Instant>,
    last_access: Instant,
}

impl<K: Hash + Eq> RateLimiter<K> {
    /// Create limiter admitting `limit` requests per `window`
    pub fn new(limit: usize, window: Duration) -> CommonResult<Self> {
        if limit == 0 {
            return Err(CommonError::InvalidLimit);
        }
        Ok(Self {
            limit,
            window,
            state: Mutex::new(LimiterState {
                logs: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        })
    }

    /// Create limiter from config
    pub fn from_config(config: &RateLimitConfig) -> CommonResult<Self> {
        Self::new(config.limit, Duration::from_secs(config.window_secs))
    }

    /// Admit a request for `key` now
    pub fn try_acquire(&self, key: K) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    /// Admit a request for `key` at the given instant
    pub fn try_acquire_at(&self, key: K, now: Instant) -> bool {
        let mut state = self.state.lock();

        if now.saturating_duration_since(state.last_sweep) >= self.window {
            let window = self.window;
            state
                .logs
                .retain(|_, log| now.saturating_duration_since(log.last_access) < window);
            state.last_sweep = now;
        }

        let limit = self.limit;
        let log = state.logs.entry(key).or_insert_with(|| AccessLog {
            admitted: VecDeque::with_capacity(limit),
            last_access: now,
        });
        log.last_access = now;

        if log.admitted.len() >= limit {
            let oldest_age = log
                .admitted
                .front()
                .map(|oldest| now.saturating_duration_since(*oldest))
                .unwrap_or_default();
            if oldest_age <= self.window {
                return false;
            }
            log.admitted.pop_front();
        }
        log.admitted.push_back(now);
        true
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().logs.len()
    }
}

/// Rate limit config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions per window
    pub limit: usize,
    /// Window length in seconds
    pub window_secs: u64,
}

impl RateLimitConfig {
    /// Create config
    pub const fn new(limit: usize, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_then_window_elapses() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1)).unwrap();
        let t0 = Instant::now();

        assert!(limiter.try_acquire_at("k", t0));
        assert!(limiter.try_acquire_at("k", t0 + Duration::from_millis(10)));
        assert!(limiter.try_acquire_at("k", t0 + Duration::from_millis(20)));
        assert!(!limiter.try_acquire_at("k", t0 + Duration::from_millis(500)));
        assert!(limiter.try_acquire_at("k", t0 + Duration::from_millis(1_001)));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60)).unwrap();
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(1u32, t0));
        assert!(!limiter.try_acquire_at(1u32, t0));
        assert!(limiter.try_acquire_at(2u32, t0));
    }

    #[test]
    fn test_idle_keys_are_evicted() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1)).unwrap();
        let t0 = Instant::now();
        limiter.try_acquire_at("a", t0);
        limiter.try_acquire_at("b", t0);
        assert_eq!(limiter.tracked_keys(), 2);

        limiter.try_acquire_at("c", t0 + Duration::from_secs(2));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_real_clock() {
        let limiter = RateLimiter::new(3, Duration::from_millis(200)).unwrap();
        for _ in 0..3 {
            assert!(limiter.try_acquire("ip"));
        }
        assert!(!limiter.try_acquire("ip"));
        std::thread::sleep(Duration::from_millis(250));
        assert!(limiter.try_acquire("ip"));
    }

    #[test]
    fn test_zero_limit_rejected() {
        assert!(RateLimiter::<u8>::new(0, Duration::from_secs(1)).is_err());
    }
}
