//! Backoff policy: exponential delays with full jitter
//!
//! `wait = base * factor^(attempt - 1) * U[0.5, 1.5)`, optionally capped.
//! `attempt` is 1-based: attempt 1 is the wait before the first retry.

use std::ops::Range;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Range the jitter multiplier is sampled from.
pub const JITTER_RANGE: Range<f64> = 0.5..1.5;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub cap: Option<Duration>,
    pub jitter: bool,
}

impl Backoff {
    pub fn exponential(base: Duration, factor: f64) -> Self {
        Self {
            base,
            factor,
            cap: None,
            jitter: true,
        }
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = Some(cap);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Deterministic part of the delay, before jitter and cap.
    pub fn nominal(&self, attempt: u32) -> f64 {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        self.base.as_secs_f64() * self.factor.powi(exp)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let mut secs = self.nominal(attempt);
        if self.jitter {
            secs *= rng.gen_range(JITTER_RANGE);
        }
        let delay = to_duration(secs);
        match self.cap {
            Some(cap) if delay > cap => cap,
            _ => delay,
        }
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base: config.base_delay,
            factor: config.backoff_factor,
            cap: config.max_backoff,
            jitter: config.jitter,
        }
    }
}

/// Compute the wait before retry number `attempt`.
pub fn compute_wait(
    attempt: u32,
    base: Duration,
    factor: f64,
    cap: Option<Duration>,
    jitter: bool,
) -> Duration {
    Backoff {
        base,
        factor,
        cap,
        jitter,
    }
    .delay_for_attempt(attempt)
}

// Overflowing configurations saturate instead of panicking.
fn to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
