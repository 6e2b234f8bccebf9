//! Client facade bundling one operation with its retry and rate-limit policy

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch::{
    BatchAborted, BatchInput, BatchOrchestrator, BatchReport, Payload, ProgressCallback,
};
use crate::config::{BatchConfig, ClientConfig};
use crate::error::{OperationError, Result};
use crate::operation::{Operation, Outcome};
use crate::rate_limit::RateLimiter;
use crate::retry::{Attempted, RetryExecutor};

/// An operation wrapped in retries and rate limiting.
///
/// The limiter lives as long as the client, so single calls and batches
/// started from the same client draw from one token bucket.
pub struct ResilientClient<O> {
    op: Arc<O>,
    config: ClientConfig,
    orchestrator: BatchOrchestrator,
}

impl<O: Operation> ResilientClient<O> {
    /// Validate `config` and build the client.
    pub fn new(op: O, config: ClientConfig) -> Result<Self> {
        Self::from_arc(Arc::new(op), config)
    }

    pub fn from_arc(op: Arc<O>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let orchestrator = BatchOrchestrator::new(
            RetryExecutor::new(config.retry.clone()),
            RateLimiter::from_config(&config.rate_limit),
        );
        debug!(limiter = %orchestrator.limiter(), "client ready");
        Ok(Self {
            op,
            config,
            orchestrator,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn operation(&self) -> &O {
        &self.op
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        self.orchestrator.limiter()
    }

    /// Acquire a token, then run the operation with retries.
    pub async fn call(&self, input: &O::Input) -> std::result::Result<O::Output, OperationError> {
        self.call_detailed(input, &CancellationToken::new())
            .await
            .into_result()
    }

    /// Like [`call`](Self::call) but reports attempts and honours `cancel`.
    pub async fn call_detailed(
        &self,
        input: &O::Input,
        cancel: &CancellationToken,
    ) -> Attempted<O::Output> {
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OperationError::Cancelled),
            acquired = self.orchestrator.limiter().acquire() => acquired,
        };
        match acquired {
            Ok(()) => self.orchestrator.retry().execute(self.op.as_ref(), input, cancel).await,
            Err(e) => Attempted {
                outcome: Outcome::FatalFailure(e),
                attempts: 0,
            },
        }
    }

    /// Run a batch with the client's [`BatchConfig`].
    pub async fn batch(
        &self,
        inputs: Vec<O::Input>,
        progress: Option<ProgressCallback>,
    ) -> std::result::Result<BatchReport<O::Output>, BatchAborted<O::Output>>
    where
        O: 'static,
        O::Input: BatchInput + 'static,
        O::Output: Payload + 'static,
    {
        self.batch_with(inputs, &self.config.batch, progress).await
    }

    /// Run a batch with per-call overrides of the batch settings.
    pub async fn batch_with(
        &self,
        inputs: Vec<O::Input>,
        config: &BatchConfig,
        progress: Option<ProgressCallback>,
    ) -> std::result::Result<BatchReport<O::Output>, BatchAborted<O::Output>>
    where
        O: 'static,
        O::Input: BatchInput + 'static,
        O::Output: Payload + 'static,
    {
        self.orchestrator
            .run_batch(inputs, self.op.clone(), config, progress)
            .await
    }
}

impl<O> fmt::Debug for ResilientClient<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("config", &self.config)
            .field("limiter", self.orchestrator.limiter())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigBuilder, RateLimitStrategy};
    use crate::error::Error;
    use crate::operation::operation_fn;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn call_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let op = operation_fn(move |name: String| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(OperationError::http(502, "bad gateway"))
                } else {
                    Ok(format!("{name}.png"))
                }
            }
        });
        let config = ConfigBuilder::new()
            .max_retries(2)
            .base_delay(Duration::from_millis(50))
            .build()
            .unwrap();
        let client = ResilientClient::new(op, config).unwrap();

        assert_eq!(client.call(&"cat".to_string()).await.unwrap(), "cat.png");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn single_calls_share_the_bucket() {
        let op = operation_fn(|_: ()| async { Ok::<_, OperationError>(()) });
        let config = ConfigBuilder::new()
            .rate_limit(1.0)
            .rate_limit_strategy(RateLimitStrategy::Error)
            .build()
            .unwrap();
        let client = ResilientClient::new(op, config).unwrap();

        client.call(&()).await.unwrap();
        let denied = client.call_detailed(&(), &CancellationToken::new()).await;
        assert_eq!(denied.attempts, 0);
        assert!(matches!(
            denied.outcome,
            Outcome::FatalFailure(OperationError::RateLimitExceeded { .. })
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let op = operation_fn(|_: ()| async { Ok::<_, OperationError>(()) });
        let mut config = ClientConfig::default();
        config.batch.max_workers = 0;
        assert!(matches!(
            ResilientClient::new(op, config),
            Err(Error::Config(_))
        ));
    }
}
