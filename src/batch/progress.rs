//! Progress snapshots and the sinks that receive them
//!
//! Sinks run synchronously on whichever worker task just finished an item.
//! Invocations are serialized by the tracker's lock, so snapshots arrive
//! with non-decreasing `completed` counts and a sink never runs twice at
//! once. A slow sink slows the pool down; it cannot corrupt its state.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

/// Point-in-time view of a running batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub elapsed_seconds: f64,
    /// `None` until the first item completes
    pub estimated_remaining_seconds: Option<f64>,
}

impl BatchProgress {
    pub fn new(total: usize, successful: usize, failed: usize, elapsed_seconds: f64) -> Self {
        let completed = successful + failed;
        let estimated_remaining_seconds = (completed > 0).then(|| {
            elapsed_seconds / completed as f64 * total.saturating_sub(completed) as f64
        });
        Self {
            total,
            completed,
            successful,
            failed,
            elapsed_seconds,
            estimated_remaining_seconds,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }

    pub fn success_rate(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.successful as f64 / self.completed as f64
    }
}

/// Receiver of progress snapshots.
///
/// Implemented for any `Fn(&BatchProgress) + Send + Sync` closure. Runs on
/// the reporting worker's task, not on a dedicated thread.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: &BatchProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(&BatchProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &BatchProgress) {
        self(progress)
    }
}

/// Shared handle to a progress sink.
pub type ProgressCallback = Arc<dyn ProgressSink>;

/// Logs every snapshot as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_progress(&self, p: &BatchProgress) {
        info!(
            completed = p.completed,
            total = p.total,
            successful = p.successful,
            failed = p.failed,
            elapsed_s = p.elapsed_seconds,
            eta_s = ?p.estimated_remaining_seconds,
            "batch progress"
        );
    }
}

#[derive(Debug, Default)]
struct Counters {
    successful: usize,
    failed: usize,
}

/// Shared counters for one batch run.
pub(crate) struct ProgressTracker {
    total: usize,
    started: Instant,
    counters: Mutex<Counters>,
    sink: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub(crate) fn new(total: usize, sink: Option<ProgressCallback>) -> Self {
        Self {
            total,
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
            sink,
        }
    }

    pub(crate) fn started(&self) -> Instant {
        self.started
    }

    /// Count one terminal item and notify the sink while still holding the lock.
    pub(crate) fn record(&self, success: bool) -> BatchProgress {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if success {
            counters.successful += 1;
        } else {
            counters.failed += 1;
        }
        let snapshot = BatchProgress::new(
            self.total,
            counters.successful,
            counters.failed,
            self.started.elapsed().as_secs_f64(),
        );
        if let Some(sink) = &self.sink {
            sink.on_progress(&snapshot);
        }
        snapshot
    }
}
