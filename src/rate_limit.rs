//! Token-bucket rate limiter shared by every caller of a client
//!
//! The bucket holds at most one token (one token = one permitted call start)
//! and refills lazily: each acquisition first credits `elapsed * rate` tokens
//! since the last refill. There is no background timer.
//!
//! The bucket lives behind a single mutex. The critical section is
//! refill-then-take and never spans a sleep; callers that must wait compute
//! the deficit under the lock, release it, sleep, and try again.
//!
//! Time comes from `tokio::time::Instant`, so tests running on a paused
//! runtime clock observe the same refill arithmetic as production.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{RateLimitConfig, RateLimitStrategy};
use crate::error::OperationError;

/// Tolerance for float drift when comparing refilled tokens against 1.0.
const TOKEN_EPSILON: f64 = 1e-9;

/// Lazily refilled token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket of capacity one refilled at `refill_rate` tokens/s.
    pub fn new(refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity: 1.0,
            refill_rate,
            available: 1.0,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Credit tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.available
    }

    /// Take one token, or report how long until one is available.
    ///
    /// A refused take consumes nothing.
    pub fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.available + TOKEN_EPSILON >= 1.0 {
            self.available = (self.available - 1.0).max(0.0);
            return Ok(());
        }
        let deficit = 1.0 - self.available;
        Err(Duration::try_from_secs_f64(deficit / self.refill_rate).unwrap_or(Duration::MAX))
    }

    pub fn reset(&mut self, now: Instant) {
        self.available = self.capacity;
        self.last_refill = now;
    }
}

struct Limiter {
    rate: f64,
    strategy: RateLimitStrategy,
    bucket: Mutex<TokenBucket>,
}

impl Limiter {
    fn bucket(&self) -> MutexGuard<'_, TokenBucket> {
        // the bucket is always left consistent, so a poisoned lock is still usable
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exceeded(&self, available: f64) -> OperationError {
        OperationError::RateLimitExceeded {
            rate: self.rate,
            available,
        }
    }

    /// One pass of the critical section: `Ok(None)` = token taken,
    /// `Ok(Some(wait))` = sleep then retry.
    fn attempt(&self, strategy: RateLimitStrategy) -> Result<Option<Duration>, OperationError> {
        let mut bucket = self.bucket();
        let now = Instant::now();
        match bucket.try_take(now) {
            Ok(()) => Ok(None),
            Err(wait) => match strategy {
                RateLimitStrategy::Error => Err(self.exceeded(bucket.available)),
                RateLimitStrategy::Wait => Ok(Some(wait)),
            },
        }
    }
}

/// Shared rate limiter handle. Cloning shares the same bucket.
///
/// A limiter built without a positive rate is a no-op.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Option<Arc<Limiter>>,
}

impl RateLimiter {
    pub fn new(requests_per_second: Option<f64>, strategy: RateLimitStrategy) -> Self {
        let inner = requests_per_second
            .filter(|rate| rate.is_finite() && *rate > 0.0)
            .map(|rate| {
                Arc::new(Limiter {
                    rate,
                    strategy,
                    bucket: Mutex::new(TokenBucket::new(rate, Instant::now())),
                })
            });
        Self { inner }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_second, config.strategy)
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn rate(&self) -> Option<f64> {
        self.inner.as_ref().map(|l| l.rate)
    }

    pub fn strategy(&self) -> Option<RateLimitStrategy> {
        self.inner.as_ref().map(|l| l.strategy)
    }

    /// Acquire a token, suspending the task under the `wait` strategy.
    pub async fn acquire(&self) -> Result<(), OperationError> {
        let Some(limiter) = &self.inner else {
            return Ok(());
        };
        loop {
            match limiter.attempt(limiter.strategy)? {
                None => return Ok(()),
                Some(wait) => {
                    trace!(wait_ms = wait.as_millis() as u64, "rate limiter waiting for refill");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Blocking counterpart of [`acquire`](Self::acquire) for threaded callers.
    pub fn acquire_blocking(&self) -> Result<(), OperationError> {
        let Some(limiter) = &self.inner else {
            return Ok(());
        };
        loop {
            match limiter.attempt(limiter.strategy)? {
                None => return Ok(()),
                Some(wait) => std::thread::sleep(wait),
            }
        }
    }

    /// Take a token only if one is available right now, whatever the strategy.
    pub fn try_acquire(&self) -> Result<(), OperationError> {
        let Some(limiter) = &self.inner else {
            return Ok(());
        };
        match limiter.attempt(RateLimitStrategy::Error) {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(error = %e, "rate limiter refused token");
                Err(e)
            }
        }
    }

    /// Tokens currently in the bucket; `None` when limiting is disabled.
    pub fn available_tokens(&self) -> Option<f64> {
        self.inner
            .as_ref()
            .map(|l| l.bucket().available(Instant::now()))
    }

    /// Refill the bucket to capacity.
    pub fn reset(&self) {
        if let Some(limiter) = &self.inner {
            limiter.bucket().reset(Instant::now());
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.debug_struct("RateLimiter").field("enabled", &false).finish(),
            Some(l) => f
                .debug_struct("RateLimiter")
                .field("rate", &l.rate)
                .field("strategy", &l.strategy)
                .finish(),
        }
    }
}

impl fmt::Display for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => write!(f, "RateLimiter(disabled)"),
            Some(l) => write!(
                f,
                "RateLimiter(rate_limit={} req/s, available={:.2})",
                l.rate,
                l.bucket().available(Instant::now())
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test(start_paused = true)]
    async fn disabled_limiter_never_blocks() {
        for limiter in [
            RateLimiter::disabled(),
            RateLimiter::new(None, RateLimitStrategy::Error),
            RateLimiter::new(Some(0.0), RateLimitStrategy::Error),
        ] {
            assert!(!limiter.is_enabled());
            let start = Instant::now();
            for _ in 0..100 {
                limiter.acquire().await.unwrap();
            }
            assert_eq!(start.elapsed(), Duration::ZERO);
            assert_eq!(limiter.available_tokens(), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_strategy_spaces_sequential_calls() {
        let limiter = RateLimiter::new(Some(2.0), RateLimitStrategy::Wait);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1490), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1600), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn error_strategy_refuses_without_consuming() {
        let limiter = RateLimiter::new(Some(2.0), RateLimitStrategy::Error);
        limiter.acquire().await.unwrap();

        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, OperationError::RateLimitExceeded { .. }));
        let before = limiter.available_tokens().unwrap();
        // zero elapsed time: the second refusal looks exactly like the first
        assert!(limiter.acquire().await.is_err());
        assert_eq!(limiter.available_tokens().unwrap(), before);

        tokio::time::advance(Duration::from_millis(500)).await;
        limiter.acquire().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_share_one_bucket() {
        let limiter = RateLimiter::new(Some(5.0), RateLimitStrategy::Wait);
        let start = Instant::now();
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let l = limiter.clone();
                tokio::spawn(async move { l.acquire().await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        // first token is free, the other nine need 9 * 200ms of refill
        assert!(start.elapsed() >= Duration::from_millis(1790));
    }

    #[test]
    fn try_acquire_ignores_wait_strategy() {
        let limiter = RateLimiter::new(Some(1.0), RateLimitStrategy::Wait);
        limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_err());
        limiter.reset();
        limiter.try_acquire().unwrap();
    }

    #[test]
    fn blocking_acquire_sleeps_the_thread() {
        let limiter = RateLimiter::new(Some(20.0), RateLimitStrategy::Wait);
        let start = std::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire_blocking().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(95));
    }

    #[test]
    fn display_shows_rate() {
        let limiter = RateLimiter::new(Some(10.0), RateLimitStrategy::Wait);
        assert!(limiter.to_string().starts_with("RateLimiter(rate_limit=10 req/s"));
        assert_eq!(RateLimiter::disabled().to_string(), "RateLimiter(disabled)");
    }

    proptest! {
        // Greedy callers at arbitrary instants never beat ceil(rate * T) + 1 per window.
        #[test]
        fn bucket_never_exceeds_rate_in_any_window(
            rate in 0.5f64..20.0,
            mut offsets_ms in proptest::collection::vec(0u64..5_000, 1..200),
            window_ms in 1u64..3_000,
        ) {
            offsets_ms.sort_unstable();
            let origin = Instant::now();
            let mut bucket = TokenBucket::new(rate, origin);
            let admitted: Vec<u64> = offsets_ms
                .into_iter()
                .filter(|ms| bucket.try_take(origin + Duration::from_millis(*ms)).is_ok())
                .collect();

            let window = window_ms as f64 / 1000.0;
            let bound = (rate * window).ceil() as usize + 1;
            for (i, start) in admitted.iter().enumerate() {
                let in_window = admitted[i..]
                    .iter()
                    .take_while(|t| **t <= start + window_ms)
                    .count();
                prop_assert!(in_window <= bound, "{} admissions in {}ms at {} req/s", in_window, window_ms, rate);
            }
        }
    }
}
