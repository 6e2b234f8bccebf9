//! Configuration for retry, rate limiting and batch execution
//!
//! All values are plain data: built once when a client is constructed and
//! read-only afterwards. They can come from code (builder), from the
//! environment, or from a TOML file.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Statuses retried when nothing else is configured.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Default filename pattern for materialized outputs.
pub const DEFAULT_OUTPUT_PATTERN: &str = "{index}_{name}";

/// Serialize a `Duration` as fractional seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let v = f64::deserialize(d)?;
        Duration::try_from_secs_f64(v).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&d.as_secs_f64()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(d)?
                .map(|v| Duration::try_from_secs_f64(v).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 disables retry)
    pub max_attempts: u32,

    /// Exponential backoff multiplier
    pub backoff_factor: f64,

    /// Delay before the first retry, before jitter
    #[serde(with = "secs")]
    pub base_delay: Duration,

    /// Ceiling applied to every computed wait
    #[serde(with = "secs::option")]
    pub max_backoff: Option<Duration>,

    /// Randomize waits to desynchronize concurrent retriers
    pub jitter: bool,

    /// HTTP statuses treated as transient
    pub retryable_statuses: BTreeSet<u16>,

    /// Deadline for a single attempt; expiry counts as a transport error
    #[serde(with = "secs::option")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_factor: 2.0,
            base_delay: Duration::from_secs(1),
            max_backoff: Some(Duration::from_secs(60)),
            jitter: true,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
            attempt_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryConfig {
    /// A config that attempts every call exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, factor: f64) -> Self {
        self.base_delay = base_delay;
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_backoff(mut self, cap: Option<Duration>) -> Self {
        self.max_backoff = cap;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Total number of calls a permanently retryable failure will see.
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff_factor.is_nan()
            || self.backoff_factor <= 0.0
            || self.backoff_factor.is_infinite()
        {
            return Err(Error::Config(format!(
                "backoff_factor must be > 0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }
}

/// What the rate limiter does when the bucket is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Suspend the caller until a token has been refilled
    #[default]
    Wait,
    /// Fail immediately with `RateLimitExceeded`
    Error,
}

impl FromStr for RateLimitStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "error" => Ok(Self::Error),
            other => Err(Error::Config(format!(
                "unknown rate limit strategy '{other}' (expected 'wait' or 'error')"
            ))),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per second; `None` or `0` disables limiting
    pub requests_per_second: Option<f64>,

    pub strategy: RateLimitStrategy,
}

impl RateLimitConfig {
    pub fn new(requests_per_second: f64, strategy: RateLimitStrategy) -> Self {
        Self {
            requests_per_second: Some(requests_per_second),
            strategy,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.requests_per_second {
            Some(rate) if rate.is_nan() || rate < 0.0 || rate.is_infinite() => Err(Error::Config(
                format!("requests_per_second must be a finite value >= 0, got {rate}"),
            )),
            _ => Ok(()),
        }
    }
}

/// How a batch reacts to a terminal item failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Every item runs to completion independently
    #[default]
    Continue,
    /// Stop admitting new items after the first terminal failure
    FailFast,
}

impl FromStr for ErrorStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "fail_fast" | "fail-fast" => Ok(Self::FailFast),
            other => Err(Error::Config(format!(
                "unknown error strategy '{other}' (expected 'continue' or 'fail_fast')"
            ))),
        }
    }
}

/// Batch execution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Number of concurrent workers
    pub max_workers: usize,

    pub on_error: ErrorStrategy,

    /// Directory successful payloads are written to
    pub output_dir: Option<PathBuf>,

    /// Filename template with `{index}` and `{name}` placeholders
    pub output_pattern: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            on_error: ErrorStrategy::Continue,
            output_dir: None,
            output_pattern: DEFAULT_OUTPUT_PATTERN.to_string(),
        }
    }
}

impl BatchConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_on_error(mut self, strategy: ErrorStrategy) -> Self {
        self.on_error = strategy;
        self
    }

    pub fn with_output(mut self, dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        self.output_dir = Some(dir.into());
        self.output_pattern = pattern.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Complete client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.batch.validate()
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: ClientConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.retry.max_attempts = retries;
        self
    }

    pub fn retry_backoff(mut self, factor: f64) -> Self {
        self.config.retry.backoff_factor = factor;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn retry_on_status(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.config.retry.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.retry.attempt_timeout = Some(timeout);
        self
    }

    pub fn rate_limit(mut self, requests_per_second: f64) -> Self {
        self.config.rate_limit.requests_per_second = Some(requests_per_second);
        self
    }

    pub fn rate_limit_strategy(mut self, strategy: RateLimitStrategy) -> Self {
        self.config.rate_limit.strategy = strategy;
        self
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.batch.max_workers = workers;
        self
    }

    pub fn on_error(mut self, strategy: ErrorStrategy) -> Self {
        self.config.batch.on_error = strategy;
        self
    }

    pub fn output(mut self, dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        self.config.batch.output_dir = Some(dir.into());
        self.config.batch.output_pattern = pattern.into();
        self
    }

    /// Finish building; fails on values the runtime cannot honor.
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Load configuration from `BATCH_*` environment variables on top of the defaults
pub fn from_env() -> Result<ClientConfig> {
    let mut config = ClientConfig::default();

    if let Some(retries) = parse_env::<u32>("BATCH_MAX_RETRIES")? {
        config.retry.max_attempts = retries;
    }
    if let Some(factor) = parse_env::<f64>("BATCH_RETRY_BACKOFF")? {
        config.retry.backoff_factor = factor;
    }
    if let Some(timeout) = parse_env::<f64>("BATCH_TIMEOUT_SECS")? {
        config.retry.attempt_timeout = Some(
            Duration::try_from_secs_f64(timeout)
                .map_err(|e| Error::Config(format!("BATCH_TIMEOUT_SECS: {e}")))?,
        );
    }
    if let Some(rate) = parse_env::<f64>("BATCH_RATE_LIMIT")? {
        config.rate_limit.requests_per_second = Some(rate);
    }
    if let Some(strategy) = parse_env::<RateLimitStrategy>("BATCH_RATE_LIMIT_STRATEGY")? {
        config.rate_limit.strategy = strategy;
    }
    if let Some(workers) = parse_env::<usize>("BATCH_MAX_WORKERS")? {
        config.batch.max_workers = workers;
    }
    if let Some(strategy) = parse_env::<ErrorStrategy>("BATCH_ON_ERROR")? {
        config.batch.on_error = strategy;
    }

    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<ClientConfig> {
    let contents = std::fs::read_to_string(path)?;
    from_toml_str(&contents)
}

pub fn from_toml_str(contents: &str) -> Result<ClientConfig> {
    let config: ClientConfig = toml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}
