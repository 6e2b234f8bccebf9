//! # Resilient batch processing for remote image APIs
//!
//! Building blocks for driving many calls against a flaky, rate-limited
//! remote service:
//!
//! - **Retry executor**: exponential backoff with jitter, status-aware
//!   classification and per-attempt timeouts
//! - **Rate limiter**: a shared token bucket with `wait` or `error` strategies
//! - **Batch orchestrator**: bounded worker pool, order-preserving results,
//!   progress reporting and fail-fast cancellation
//!
//! The remote call itself is an [`Operation`]; plain async closures and
//! tower services both adapt into one.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tower_batch_resilience::{
//!     operation_fn, ConfigBuilder, OperationError, ResilientClient, TracingProgress,
//! };
//!
//! # async fn example() -> tower_batch_resilience::Result<()> {
//! let remove_background = operation_fn(|path: String| async move {
//!     // POST the image, map status codes into OperationError::http(..)
//!     Ok::<_, OperationError>(path.into_bytes())
//! });
//!
//! let config = ConfigBuilder::new()
//!     .max_retries(3)
//!     .rate_limit(2.0)
//!     .max_workers(4)
//!     .output("out", "{index}_{name}")
//!     .build()?;
//! let client = ResilientClient::new(remove_background, config)?;
//!
//! let inputs = vec!["cat.jpg".to_string(), "dog.jpg".to_string()];
//! let report = client.batch(inputs, Some(Arc::new(TracingProgress))).await?;
//! println!("{report}");
//! report.raise_on_failure()?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod operation;
pub mod rate_limit;
pub mod retry;

pub use backoff::{compute_wait, Backoff};
pub use batch::{
    BatchAborted, BatchInput, BatchItem, BatchOrchestrator, BatchProgress, BatchReport,
    BatchStatistics, ItemOutcome, OutputTemplate, Payload, ProgressCallback, ProgressSink,
    TracingProgress,
};
pub use client::ResilientClient;
pub use config::{
    BatchConfig, ClientConfig, ConfigBuilder, ErrorStrategy, RateLimitConfig, RateLimitStrategy,
    RetryConfig,
};
pub use error::{Error, ErrorClass, OperationError, Result, TransportKind};
pub use observability::{init_tracing, try_init_tracing, TracingLayer};
pub use operation::{operation_fn, Operation, OperationFn, Outcome, ServiceOperation};
pub use rate_limit::{RateLimiter, TokenBucket};
pub use retry::{Attempted, RetryExecutor};

pub use tokio_util::sync::CancellationToken;
pub use tower::{Layer, Service, ServiceExt};
