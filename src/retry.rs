//! Retry executor with exponential backoff
//!
//! Wraps a single [`Operation`] call in the retry loop: the first attempt runs
//! immediately, fatal failures return at once, retryable failures sleep for
//! the backoff delay and try again until the attempt budget is spent.
//!
//! The backoff sleep is a suspension point. It yields to the runtime (or
//! blocks only the calling thread in [`RetryExecutor::execute_blocking`]) and
//! it observes cancellation before going to sleep and right after waking, so
//! a cancelled batch never pays for one more remote call after a long wait.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::config::RetryConfig;
use crate::error::OperationError;
use crate::operation::{Operation, Outcome};

/// Final outcome of a retried call plus the number of calls actually made.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub outcome: Outcome<T>,
    pub attempts: u32,
}

impl<T> Attempted<T> {
    /// True when cancellation was observed before the first call was made.
    pub fn never_started(&self) -> bool {
        self.attempts == 0
    }

    pub fn into_result(self) -> Result<T, OperationError> {
        self.outcome.into_result()
    }
}

/// Runs operations under a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    backoff: Backoff,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        let backoff = Backoff::from(&config);
        Self { config, backoff }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }

    async fn invoke_once<O>(&self, op: &O, input: &O::Input) -> Result<O::Output, OperationError>
    where
        O: Operation + ?Sized,
    {
        match self.config.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, op.invoke(input)).await {
                Ok(result) => result,
                Err(_) => Err(OperationError::timeout(format!(
                    "attempt exceeded {:?}",
                    limit
                ))),
            },
            None => op.invoke(input).await,
        }
    }

    /// Execute `op` with retries, giving up early once `cancel` fires.
    pub async fn execute<O>(
        &self,
        op: &O,
        input: &O::Input,
        cancel: &CancellationToken,
    ) -> Attempted<O::Output>
    where
        O: Operation + ?Sized,
    {
        if cancel.is_cancelled() {
            return Attempted {
                outcome: Outcome::FatalFailure(OperationError::Cancelled),
                attempts: 0,
            };
        }

        let total = self.config.total_attempts();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = self.invoke_once(op, input).await;
            let error = match Outcome::classify(result, &self.config) {
                Outcome::RetryableFailure(error) => error,
                outcome => {
                    match &outcome {
                        Outcome::FatalFailure(error) => {
                            debug!(attempt, error = %error, "non-retryable error")
                        }
                        _ if attempt > 1 => debug!(attempts = attempt, "operation succeeded after retries"),
                        _ => {}
                    }
                    return Attempted {
                        outcome,
                        attempts: attempt,
                    };
                }
            };

            if attempt >= total {
                warn!(
                    attempts = attempt,
                    error = %error,
                    "retry budget exhausted"
                );
                return Attempted {
                    outcome: Outcome::RetryableFailure(error),
                    attempts: attempt,
                };
            }
            if cancel.is_cancelled() {
                debug!(attempt, "cancelled before backoff");
                return Attempted {
                    outcome: Outcome::RetryableFailure(error),
                    attempts: attempt,
                };
            }

            let delay = self.delay_for(attempt);
            warn!(
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = sleep(delay) => {}
            }
            if cancel.is_cancelled() {
                debug!(attempt, "cancelled during backoff");
                return Attempted {
                    outcome: Outcome::RetryableFailure(error),
                    attempts: attempt,
                };
            }
        }
    }

    /// Blocking counterpart of [`execute`](Self::execute) for threaded callers.
    ///
    /// The backoff sleep blocks only the current thread. Per-attempt timeouts
    /// are the closure's responsibility here.
    pub fn execute_blocking<T, F>(&self, cancel: &CancellationToken, mut call: F) -> Attempted<T>
    where
        F: FnMut() -> Result<T, OperationError>,
    {
        if cancel.is_cancelled() {
            return Attempted {
                outcome: Outcome::FatalFailure(OperationError::Cancelled),
                attempts: 0,
            };
        }

        let total = self.config.total_attempts();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let error = match Outcome::classify(call(), &self.config) {
                Outcome::RetryableFailure(error) => error,
                outcome => {
                    return Attempted {
                        outcome,
                        attempts: attempt,
                    }
                }
            };
            if attempt >= total || cancel.is_cancelled() {
                warn!(attempts = attempt, error = %error, "giving up on retryable error");
                return Attempted {
                    outcome: Outcome::RetryableFailure(error),
                    attempts: attempt,
                };
            }
            let delay = self.delay_for(attempt);
            warn!(
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying"
            );
            std::thread::sleep(delay);
            if cancel.is_cancelled() {
                return Attempted {
                    outcome: Outcome::RetryableFailure(error),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportKind;
    use crate::operation::operation_fn;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(max_attempts)
            .with_backoff(Duration::from_millis(10), 2.0)
            .with_jitter(false)
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_retryable_failure_is_attempted_n_plus_one_times() {
        for n in 0..5 {
            let calls = Arc::new(AtomicU32::new(0));
            let c = calls.clone();
            let op = operation_fn(move |_: ()| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(OperationError::http(503, "unavailable"))
                }
            });
            let exec = RetryExecutor::new(fast_config(n));
            let done = exec.execute(&op, &(), &CancellationToken::new()).await;
            assert_eq!(calls.load(Ordering::SeqCst), n + 1);
            assert_eq!(done.attempts, n + 1);
            assert!(matches!(done.outcome, Outcome::RetryableFailure(ref e) if e.status() == Some(503)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_is_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let op = operation_fn(move |_: ()| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(OperationError::http(400, "bad request"))
            }
        });
        let done = RetryExecutor::new(fast_config(10))
            .execute(&op, &(), &CancellationToken::new())
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(done.outcome, Outcome::FatalFailure(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_service_unavailable() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let op = operation_fn(move |_: ()| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(OperationError::http(503, "unavailable"))
                } else {
                    Ok("done")
                }
            }
        });
        let exec = RetryExecutor::new(fast_config(3).with_retryable_statuses([503]));
        let done = exec.execute(&op, &(), &CancellationToken::new()).await;
        assert_eq!(done.attempts, 3);
        assert_eq!(done.into_result().unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_follow_backoff_schedule() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let s = stamps.clone();
        let op = operation_fn(move |_: ()| {
            let s = s.clone();
            async move {
                s.lock().unwrap().push(Instant::now());
                Err::<(), _>(OperationError::connect("refused"))
            }
        });
        let exec = RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(3)
                .with_backoff(Duration::from_millis(100), 2.0)
                .with_jitter(false),
        );
        exec.execute(&op, &(), &CancellationToken::new()).await;

        let stamps = stamps.lock().unwrap();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_backoff_short() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let op = operation_fn(move |_: ()| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(OperationError::http(502, "bad gateway"))
            }
        });
        let exec = RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_backoff(Duration::from_secs(30), 2.0)
                .with_jitter(false),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let done = exec.execute(&op, &(), &cancel).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(done.attempts, 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_call() {
        let op = operation_fn(|_: ()| async { Ok::<_, OperationError>(()) });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let done = RetryExecutor::default().execute(&op, &(), &cancel).await;
        assert!(done.never_started());
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_counts_as_retryable_transport_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let op = operation_fn(move |_: ()| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        });
        let exec = RetryExecutor::new(
            fast_config(1).with_attempt_timeout(Some(Duration::from_secs(1))),
        );
        let done = exec.execute(&op, &(), &CancellationToken::new()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            done.outcome,
            Outcome::RetryableFailure(OperationError::Transport {
                kind: TransportKind::Timeout,
                ..
            })
        ));
    }

    #[test]
    fn test_execute_blocking() {
        let mut count = 0;
        let exec = RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(3)
                .with_backoff(Duration::from_millis(1), 2.0),
        );
        let done = exec.execute_blocking(&CancellationToken::new(), || {
            count += 1;
            if count < 3 {
                Err(OperationError::timeout("slow"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(done.attempts, 3);
        assert_eq!(done.into_result().unwrap(), 42);
    }
}
