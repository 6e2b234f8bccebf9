//! Batch orchestration: bounded fan-out with ordered fan-in
//!
//! `run_batch` seeds a shared queue with every `(index, input)` pair and
//! starts `max_workers` tokio tasks that pull from it. Per item a worker:
//!
//! 1. acquires a rate-limiter token (may suspend),
//! 2. runs the operation under the retry executor,
//! 3. writes the payload to disk when an output directory is configured,
//! 4. records the terminal item and emits a progress snapshot.
//!
//! Workers keep their finished items locally and hand them back when they
//! exit; the orchestrator then places each item at its input index, so the
//! report order never depends on completion order and no lock guards the
//! result slots.
//!
//! Under [`ErrorStrategy::FailFast`] the first terminal failure cancels a
//! shared [`CancellationToken`]. Workers check the token before dequeuing,
//! while waiting on the limiter and around every backoff sleep; in-flight
//! calls are allowed to finish. A token denied by the limiter fails only the
//! denied item and never cancels the batch.

mod output;
mod progress;
mod report;

pub use output::{BatchInput, OutputTemplate, Payload};
pub use progress::{BatchProgress, ProgressCallback, ProgressSink, TracingProgress};
pub use report::{BatchAborted, BatchItem, BatchReport, BatchStatistics, ItemOutcome};

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{BatchConfig, ErrorStrategy};
use crate::error::OperationError;
use crate::operation::{Operation, Outcome};
use crate::rate_limit::RateLimiter;
use crate::retry::{Attempted, RetryExecutor};
use progress::ProgressTracker;

type Queue<I> = Mutex<VecDeque<(usize, I)>>;

/// State shared by every worker of one batch run.
struct Shared<O: Operation> {
    op: Arc<O>,
    retry: RetryExecutor,
    limiter: RateLimiter,
    queue: Queue<O::Input>,
    cancel: CancellationToken,
    tracker: ProgressTracker,
    strategy: ErrorStrategy,
    output_dir: Option<PathBuf>,
    template: OutputTemplate,
    first_failure: Mutex<Option<(usize, OperationError)>>,
}

impl<O: Operation> Shared<O> {
    fn next_item(&self) -> Option<(usize, O::Input)> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Under fail-fast, record the first failure and cancel the batch.
    ///
    /// A token denied by the limiter fails only the denied item.
    fn note_failure(&self, index: usize, error: &OperationError) {
        if self.strategy != ErrorStrategy::FailFast
            || matches!(error, OperationError::RateLimitExceeded { .. })
        {
            return;
        }
        let mut first = self
            .first_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            warn!(index, error = %error, "fail-fast: cancelling remaining items");
            *first = Some((index, error.clone()));
            self.cancel.cancel();
        }
    }
}

/// Drives batches of inputs through rate limiter → retry executor → operation.
#[derive(Debug, Clone, Default)]
pub struct BatchOrchestrator {
    retry: RetryExecutor,
    limiter: RateLimiter,
}

impl BatchOrchestrator {
    pub fn new(retry: RetryExecutor, limiter: RateLimiter) -> Self {
        Self { retry, limiter }
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run `op` over every input.
    ///
    /// Under [`ErrorStrategy::Continue`] this always returns the full report.
    /// Under [`ErrorStrategy::FailFast`] the first terminal failure stops
    /// admission of new items and the call returns [`BatchAborted`] once the
    /// in-flight items have settled.
    pub async fn run_batch<O>(
        &self,
        inputs: Vec<O::Input>,
        op: Arc<O>,
        config: &BatchConfig,
        progress: Option<ProgressCallback>,
    ) -> Result<BatchReport<O::Output>, BatchAborted<O::Output>>
    where
        O: Operation + 'static,
        O::Input: BatchInput + 'static,
        O::Output: Payload + 'static,
    {
        let total = inputs.len();
        if config.max_workers == 0 {
            warn!("max_workers is 0, running with a single worker");
        }
        let workers = config.max_workers.max(1).min(total.max(1));
        let span = info_span!("batch", total, workers, strategy = ?config.on_error);

        let shared = Arc::new(Shared {
            op,
            retry: self.retry.clone(),
            limiter: self.limiter.clone(),
            queue: Mutex::new(inputs.into_iter().enumerate().collect()),
            cancel: CancellationToken::new(),
            tracker: ProgressTracker::new(total, progress),
            strategy: config.on_error,
            output_dir: config.output_dir.clone(),
            template: OutputTemplate::new(config.output_pattern.clone()),
            first_failure: Mutex::new(None),
        });

        async move {
            info!("batch started");
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let shared = shared.clone();
                    tokio::spawn(
                        run_worker(shared).instrument(info_span!("worker", id = worker)),
                    )
                })
                .collect();

            let mut slots: Vec<Option<BatchItem<O::Output>>> = (0..total).map(|_| None).collect();
            for joined in futures::future::join_all(handles).await {
                let finished = match joined {
                    Ok(items) => items,
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(e) => {
                        warn!(error = %e, "worker task did not complete");
                        continue;
                    }
                };
                for item in finished {
                    let index = item.index;
                    slots[index] = Some(item);
                }
            }

            let skipped: Vec<usize> = slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| slot.is_none().then_some(index))
                .collect();
            let items: Vec<_> = slots.into_iter().flatten().collect();
            let report = BatchReport::new(items, skipped, total, shared.tracker.started().elapsed());
            info!(
                successful = report.success_count(),
                failed = report.fail_count(),
                skipped = report.skipped().len(),
                elapsed_s = report.total_elapsed_seconds(),
                "batch finished"
            );

            let first_failure = shared
                .first_failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match first_failure {
                Some((index, error)) => Err(BatchAborted {
                    index,
                    error,
                    report,
                }),
                None => Ok(report),
            }
        }
        .instrument(span)
        .await
    }
}

async fn run_worker<O>(shared: Arc<Shared<O>>) -> Vec<BatchItem<O::Output>>
where
    O: Operation + 'static,
    O::Input: BatchInput,
    O::Output: Payload,
{
    let mut finished = Vec::new();
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let Some((index, input)) = shared.next_item() else {
            break;
        };
        match process_item(&shared, index, &input).await {
            Some(item) => finished.push(item),
            // cancelled before the first call: the item stays unattempted
            None => break,
        }
    }
    debug!(items = finished.len(), "worker exiting");
    finished
}

async fn process_item<O>(
    shared: &Shared<O>,
    index: usize,
    input: &O::Input,
) -> Option<BatchItem<O::Output>>
where
    O: Operation + 'static,
    O::Input: BatchInput,
    O::Output: Payload,
{
    let started_at = Utc::now();
    let clock = Instant::now();

    let acquired = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => return None,
        acquired = shared.limiter.acquire() => acquired,
    };
    let attempted = match acquired {
        Ok(()) => {
            shared
                .retry
                .execute(shared.op.as_ref(), input, &shared.cancel)
                .await
        }
        Err(denied) => Attempted {
            outcome: Outcome::FatalFailure(denied),
            attempts: 0,
        },
    };
    if matches!(attempted.outcome, Outcome::FatalFailure(OperationError::Cancelled)) {
        return None;
    }

    let output_name = output::output_name(input, index);
    let outcome = match attempted.outcome {
        Outcome::Success(payload) => match &shared.output_dir {
            Some(dir) => {
                let path = shared.template.path_in(dir, index, &output_name);
                match output::persist(&payload, &path).await {
                    Ok(()) => ItemOutcome::Succeeded {
                        payload,
                        output_path: Some(path),
                    },
                    Err(e) => ItemOutcome::Failed(e),
                }
            }
            None => ItemOutcome::Succeeded {
                payload,
                output_path: None,
            },
        },
        Outcome::RetryableFailure(e) | Outcome::FatalFailure(e) => ItemOutcome::Failed(e),
    };

    let item = BatchItem {
        index,
        input_name: output::describe_input(input, index),
        output_name,
        outcome,
        attempts: attempted.attempts,
        started_at,
        finished_at: Utc::now(),
        elapsed: clock.elapsed(),
    };

    match item.error() {
        None => debug!(index, attempts = item.attempts, "item succeeded"),
        Some(error) => {
            warn!(index, attempts = item.attempts, error = %error, "item failed");
            shared.note_failure(index, error);
        }
    }
    shared.tracker.record(item.is_success());
    Some(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitStrategy, RetryConfig};
    use crate::operation::operation_fn;
    use std::time::Duration;

    fn echo() -> Arc<impl Operation<Input = String, Output = String>> {
        Arc::new(operation_fn(|s: String| async move {
            Ok::<_, OperationError>(s.to_uppercase())
        }))
    }

    #[tokio::test]
    async fn empty_batch_reports_nothing() {
        let report = BatchOrchestrator::default()
            .run_batch(Vec::new(), echo(), &BatchConfig::default(), None)
            .await
            .unwrap();
        assert!(report.is_empty());
        assert_eq!(report.total_count(), 0);
        assert_eq!(report.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn zero_workers_still_processes_everything() {
        let inputs: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let report = BatchOrchestrator::default()
            .run_batch(inputs, echo(), &BatchConfig::default().with_max_workers(0), None)
            .await
            .unwrap();
        let results: Vec<_> = report.iter().map(|i| i.result().cloned().unwrap()).collect();
        assert_eq!(results, vec!["A", "B", "C"]);
        assert_eq!(report[1].input_name, "b");
        assert!(report.iter().all(|i| i.attempts == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_denial_fails_item_without_a_call() {
        let orchestrator = BatchOrchestrator::new(
            RetryExecutor::new(RetryConfig::no_retry()),
            RateLimiter::new(Some(0.5), RateLimitStrategy::Error),
        );
        let inputs: Vec<String> = vec!["x".into(), "y".into()];
        let report = orchestrator
            .run_batch(inputs, echo(), &BatchConfig::default().with_max_workers(1), None)
            .await
            .unwrap();
        assert!(report[0].is_success());
        let denied = &report[1];
        assert_eq!(denied.attempts, 0);
        assert!(matches!(
            denied.error(),
            Some(OperationError::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_stops_before_limiter_wait() {
        let failing = Arc::new(operation_fn(|name: String| async move {
            if name == "bad" {
                Err(OperationError::validation("unsupported format"))
            } else {
                Ok(name.into_bytes())
            }
        }));
        let orchestrator = BatchOrchestrator::new(
            RetryExecutor::new(RetryConfig::no_retry()),
            RateLimiter::new(Some(0.1), RateLimitStrategy::Wait),
        );
        let config = BatchConfig::default()
            .with_max_workers(2)
            .with_on_error(ErrorStrategy::FailFast);

        let start = Instant::now();
        let aborted = orchestrator
            .run_batch(
                ["bad", "b", "c", "d"].map(String::from).to_vec(),
                failing,
                &config,
                None,
            )
            .await
            .unwrap_err();
        // nobody waits out the 10s refill once the batch is cancelled
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(aborted.index, 0);
        assert_eq!(aborted.failed(), 1);
        assert_eq!(aborted.successful(), 0);
        assert_eq!(aborted.report.skipped(), &[1, 2, 3]);
    }
}
