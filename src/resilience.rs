// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: bounded backoff, rate limiting, single-flight guards.
//!
//! - [`RetryConfig`]: Bounded exponential backoff with jitter for push retries
//! - [`RateLimiter`]: Token bucket in front of realtime event application
//! - [`SingleFlight`]: One-permit semaphore serializing a table's transactions
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> replica_engine::Result<()> {
//! use replica_engine::resilience::{RateLimiter, RateLimitConfig, SingleFlight};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // waits if over limit
//!
//! let guard = SingleFlight::new("entries");
//! let _permit = guard.acquire(Duration::from_secs(1)).await?;
//! // permit dropped = guard released
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicaError, Result};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use rand::Rng;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded backoff policy for push retries.
///
/// ```text
/// Attempt  Delay (base=100ms, cap=10s)
/// -------  -----
/// 0        100ms + jitter
/// 1        200ms + jitter
/// 2        400ms + jitter
/// ...
/// 7+       10s + jitter (cap)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Transient failures tolerated before a mutation is marked failed.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for the exponential part.
    pub max_delay: Duration,
    /// Upper bound of the uniform random delay added on top.
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(50),
        }
    }
}

impl RetryConfig {
    /// Fast-failing preset for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: Duration::ZERO,
        }
    }

    /// `min(base * 2^attempt, cap)` for a 0-indexed attempt, without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) plus uniform jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter.is_zero() {
            return delay;
        }
        let jitter_ms = self.jitter.as_millis() as u64;
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Whether `attempts` transient failures exhaust the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket settings: `refill_rate` tokens/sec, up to `burst_size` banked.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 500 events/sec with burst of 200.
    fn default() -> Self {
        Self {
            burst_size: 200,
            refill_rate: 500,
        }
    }
}

/// Token bucket rate limiter. Thread-safe and async-aware.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
        }
    }

    /// Wait for one token. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait for `n` tokens, one at a time.
    pub async fn acquire_many(&self, n: usize) {
        for _ in 0..n {
            self.limiter.until_ready().await;
        }
    }
}

// =============================================================================
// Single-flight guard
// =============================================================================

/// At most one holder at a time; every table transaction holds it.
///
/// Waiting is always bounded: [`acquire`](Self::acquire) gives up with
/// `Timeout` rather than queueing forever behind a hung holder. Once
/// [`close`](Self::close)d, acquisition fails with `Shutdown`.
#[derive(Debug)]
pub struct SingleFlight {
    name: String,
    semaphore: Arc<Semaphore>,
}

impl SingleFlight {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `limit` for the guard.
    pub async fn acquire(&self, limit: Duration) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(limit, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(ReplicaError::Shutdown),
            Err(_) => Err(ReplicaError::timeout(
                format!("{} transaction guard", self.name),
                limit,
            )),
        }
    }

    /// Take the guard only if free.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    /// Someone holds the guard right now.
    pub fn is_held(&self) -> bool {
        !self.semaphore.is_closed() && self.semaphore.available_permits() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Refuse all future acquisitions. Current holder is unaffected.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Wait (bounded) for the current holder to finish, then close.
    ///
    /// Returns `false` if the holder was still active at the deadline.
    pub async fn drain(&self, limit: Duration) -> bool {
        let drained = matches!(
            tokio::time::timeout(limit, Arc::clone(&self.semaphore).acquire_owned()).await,
            Ok(Ok(_))
        );
        self.semaphore.close();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_for_attempt_doubles_then_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let config = RetryConfig {
            jitter: Duration::from_millis(20),
            ..RetryConfig::default()
        };
        for _ in 0..100 {
            let d = config.backoff(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(220));
        }
    }

    #[test]
    fn test_is_exhausted() {
        let config = RetryConfig::testing();
        assert!(!config.is_exhausted(2));
        assert!(config.is_exhausted(3));
    }

    #[test]
    fn test_rate_limiter_try_acquire_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 5,
            refill_rate: 1,
        });
        for _ in 0..5 {
            assert!(limiter.try_acquire(), "should acquire within burst");
        }
        assert!(!limiter.try_acquire(), "should fail after burst exhausted");
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire_many_fast_with_high_rate() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 10,
            refill_rate: 10_000,
        });
        let start = std::time::Instant::now();
        limiter.acquire_many(10).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_single_flight_excludes_second_holder() {
        let guard = SingleFlight::new("entries");
        let permit = guard.acquire(Duration::from_millis(50)).await.unwrap();
        assert!(guard.is_held());
        assert!(guard.try_acquire().is_none());

        let err = guard.acquire(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, ReplicaError::Timeout { .. }));

        drop(permit);
        assert!(!guard.is_held());
        assert!(guard.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_single_flight_waiter_gets_released_guard() {
        let guard = Arc::new(SingleFlight::new("entries"));
        let permit = guard.acquire(Duration::from_millis(50)).await.unwrap();

        let waiter = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move { guard.acquire(Duration::from_secs(1)).await.is_ok() })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(permit);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_single_flight_drain_then_closed() {
        let guard = SingleFlight::new("entries");
        assert!(guard.drain(Duration::from_millis(50)).await);
        assert!(guard.is_closed());
        assert!(matches!(
            guard.acquire(Duration::from_millis(10)).await,
            Err(ReplicaError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_single_flight_drain_times_out_on_hung_holder() {
        let guard = SingleFlight::new("entries");
        let _held = guard.acquire(Duration::from_millis(50)).await.unwrap();
        assert!(!guard.drain(Duration::from_millis(30)).await);
        assert!(guard.is_closed());
    }
}
