//! Retry schedules and replay throttling.
//!
//! [`RetryConfig`] drives the reconnect loop and login retries.
//! [`RateLimiter`] paces the redo worker so a client holding thousands of
//! intents does not flood a server that just came back.
//!
//! ```rust,no_run
//! # async fn example() {
//! use registry_client::resilience::{RateLimitConfig, RateLimiter, RetryConfig};
//!
//! let reconnect = RetryConfig::reconnect();
//! assert!(reconnect.delay_for_attempt(3) > reconnect.delay_for_attempt(1));
//!
//! let replay = RateLimiter::new(RateLimitConfig { burst: 50, per_second: 200 });
//! replay.acquire().await;
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Backoff schedule. Attempts are counted from 1.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// `usize::MAX` retries until shutdown.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `1.0` keeps the delay fixed.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Unbounded schedule for the connection worker after a drop.
    ///
    /// ```text
    /// attempt  1      2      3      ...  9+
    /// delay    100ms  200ms  400ms  ...  30s (cap)
    /// ```
    pub fn reconnect() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// Same delay between every attempt. Used for login retries.
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }

    /// Delay to wait after `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let steps = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(steps);
        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }

    pub fn allows_another(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

// =============================================================================
// Replay throttling
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Permits available at once after an idle period.
    pub burst: u32,
    /// Sustained permits per second.
    pub per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 50,
            per_second: 200,
        }
    }
}

/// Token bucket; the redo worker takes one permit per replayed entry.
pub struct RateLimiter {
    bucket: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Zero values are raised to one permit.
    pub fn new(config: RateLimitConfig) -> Self {
        let per_second = NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        Self {
            bucket: GovLimiter::direct(Quota::per_second(per_second).allow_burst(burst)),
            config,
        }
    }

    /// Wait for a permit. Cancel-safe.
    pub async fn acquire(&self) {
        self.bucket.until_ready().await;
    }

    pub fn try_acquire(&self) -> bool {
        self.bucket.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_never_gives_up() {
        let schedule = RetryConfig::reconnect();
        assert!(schedule.allows_another(1_000_000));
        assert_eq!(schedule.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(schedule.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_reconnect_delay_capped() {
        let schedule = RetryConfig::reconnect();
        assert_eq!(schedule.delay_for_attempt(20), Duration::from_secs(30));
        assert_eq!(schedule.delay_for_attempt(usize::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_login_schedule_is_flat_and_bounded() {
        let login = RetryConfig::fixed(3, Duration::from_millis(250));
        for attempt in [0, 1, 2, 40] {
            assert_eq!(login.delay_for_attempt(attempt), Duration::from_millis(250));
        }
        assert!(login.allows_another(2));
        assert!(!login.allows_another(3));
    }

    #[test]
    fn test_fixed_schedule_allows_at_least_one_attempt() {
        assert_eq!(RetryConfig::fixed(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_attempt_zero_uses_initial_delay() {
        let schedule = RetryConfig::default();
        assert_eq!(schedule.delay_for_attempt(0), schedule.initial_delay);
        assert_eq!(schedule.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_replay_burst_then_throttled() {
        let replay = RateLimiter::new(RateLimitConfig { burst: 4, per_second: 1 });
        let granted = (0..10).filter(|_| replay.try_acquire()).count();
        assert_eq!(granted, 4);
    }

    #[tokio::test]
    async fn test_replay_permits_refill() {
        let replay = RateLimiter::new(RateLimitConfig { burst: 1, per_second: 1000 });
        replay.acquire().await;
        let start = std::time::Instant::now();
        replay.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_zero_limits_still_grant_a_permit() {
        let replay = RateLimiter::new(RateLimitConfig { burst: 0, per_second: 0 });
        assert!(replay.try_acquire());
        assert_eq!(replay.config().burst, 0);
    }
}
