//! Per-item results and the final batch report

use std::fmt;
use std::ops::Index;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::output::{OutputTemplate, Payload};
use super::progress::BatchProgress;
use crate::error::{Error, OperationError, Result};

/// Terminal state of one item: a payload or an error, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<T> {
    Succeeded {
        payload: T,
        /// Where the payload was written, when an output directory is configured
        output_path: Option<PathBuf>,
    },
    Failed(OperationError),
}

/// One processed input, at its original position.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem<T> {
    pub index: usize,
    /// Source descriptor of the input (path, or `bytes_input_{index}`)
    pub input_name: String,
    /// Base name used for `{name}` in output templates
    pub output_name: String,
    pub outcome: ItemOutcome<T>,
    /// Calls actually made to the operation
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl<T> BatchItem<T> {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Succeeded { .. })
    }

    pub fn result(&self) -> Option<&T> {
        match &self.outcome {
            ItemOutcome::Succeeded { payload, .. } => Some(payload),
            ItemOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&OperationError> {
        match &self.outcome {
            ItemOutcome::Failed(e) => Some(e),
            ItemOutcome::Succeeded { .. } => None,
        }
    }

    pub fn output_path(&self) -> Option<&Path> {
        match &self.outcome {
            ItemOutcome::Succeeded { output_path, .. } => output_path.as_deref(),
            ItemOutcome::Failed(_) => None,
        }
    }
}

/// Summary numbers for a finished batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatistics {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub success_rate: f64,
    pub total_time_seconds: f64,
    pub average_time_per_item: f64,
}

/// Final, immutable result of a batch run.
///
/// `items` holds every item that reached a terminal outcome, ordered by
/// input index. Items a fail-fast batch never started are listed in
/// `skipped` instead, so `success_count + fail_count == total_count` holds.
#[derive(Debug, Clone)]
pub struct BatchReport<T> {
    items: Vec<BatchItem<T>>,
    skipped: Vec<usize>,
    input_count: usize,
    total_elapsed: Duration,
}

impl<T> BatchReport<T> {
    pub(crate) fn new(
        items: Vec<BatchItem<T>>,
        skipped: Vec<usize>,
        input_count: usize,
        total_elapsed: Duration,
    ) -> Self {
        debug_assert!(items.windows(2).all(|w| w[0].index < w[1].index));
        Self {
            items,
            skipped,
            input_count,
            total_elapsed,
        }
    }

    pub fn items(&self) -> &[BatchItem<T>] {
        &self.items
    }

    pub fn into_items(self) -> Vec<BatchItem<T>> {
        self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BatchItem<T>> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items with a terminal outcome.
    pub fn total_count(&self) -> usize {
        self.items.len()
    }

    /// Inputs submitted to the batch, attempted or not.
    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn success_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_success()).count()
    }

    pub fn fail_count(&self) -> usize {
        self.total_count() - self.success_count()
    }

    /// Input indices never started because the batch was aborted.
    pub fn skipped(&self) -> &[usize] {
        &self.skipped
    }

    pub fn total_elapsed(&self) -> Duration {
        self.total_elapsed
    }

    pub fn total_elapsed_seconds(&self) -> f64 {
        self.total_elapsed.as_secs_f64()
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_count() == 0 {
            return 0.0;
        }
        self.success_count() as f64 / self.total_count() as f64
    }

    pub fn all_successful(&self) -> bool {
        self.fail_count() == 0
    }

    pub fn any_failed(&self) -> bool {
        !self.all_successful()
    }

    pub fn successful(&self) -> impl Iterator<Item = &BatchItem<T>> {
        self.items.iter().filter(|i| i.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BatchItem<T>> {
        self.items.iter().filter(|i| !i.is_success())
    }

    /// Look an item up by its original input index.
    pub fn get(&self, index: usize) -> Option<&BatchItem<T>> {
        self.items
            .binary_search_by_key(&index, |i| i.index)
            .ok()
            .map(|pos| &self.items[pos])
    }

    /// Final progress snapshot.
    pub fn progress(&self) -> BatchProgress {
        let mut p = BatchProgress::new(
            self.input_count,
            self.success_count(),
            self.fail_count(),
            self.total_elapsed_seconds(),
        );
        p.estimated_remaining_seconds = Some(0.0);
        p
    }

    pub fn statistics(&self) -> BatchStatistics {
        let total = self.total_count();
        BatchStatistics {
            total,
            successful: self.success_count(),
            failed: self.fail_count(),
            skipped: self.skipped.len(),
            success_rate: self.success_rate(),
            total_time_seconds: self.total_elapsed_seconds(),
            average_time_per_item: if total > 0 {
                self.total_elapsed_seconds() / total as f64
            } else {
                0.0
            },
        }
    }

    /// Fail with [`Error::BatchPartialFailure`] if any item failed.
    pub fn raise_on_failure(&self) -> Result<()> {
        if self.all_successful() {
            return Ok(());
        }
        Err(Error::BatchPartialFailure {
            successful: self.success_count(),
            failed: self.fail_count(),
            failures: self
                .failed()
                .filter_map(|i| i.error().map(|e| (i.index, e.to_string())))
                .collect(),
        })
    }
}

impl<T: Payload> BatchReport<T> {
    /// Write every successful payload to `dir` using `pattern`.
    ///
    /// Returns the number of files written.
    pub fn save_successful(&self, dir: impl AsRef<Path>, pattern: &str) -> Result<usize> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let template = OutputTemplate::new(pattern);
        let mut saved = 0;
        for item in self.successful() {
            if let Some(payload) = item.result() {
                let path = template.path_in(dir, item.index, &item.output_name);
                std::fs::write(path, payload.bytes())?;
                saved += 1;
            }
        }
        Ok(saved)
    }
}

/// `report[i]` is the item for input index `i`, like [`BatchReport::get`].
///
/// Panics if input `i` has no terminal item (out of range, or skipped by an
/// aborted batch).
impl<T> Index<usize> for BatchReport<T> {
    type Output = BatchItem<T>;

    fn index(&self, index: usize) -> &Self::Output {
        self.get(index)
            .unwrap_or_else(|| panic!("no batch item for input index {index}"))
    }
}

impl<'a, T> IntoIterator for &'a BatchReport<T> {
    type Item = &'a BatchItem<T>;
    type IntoIter = std::slice::Iter<'a, BatchItem<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T> fmt::Display for BatchReport<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BatchReport(total={}, successful={}, failed={}, time={:.2}s)",
            self.total_count(),
            self.success_count(),
            self.fail_count(),
            self.total_elapsed_seconds()
        )
    }
}

/// A fail-fast batch stopped by its first terminal failure.
///
/// Carries that failure and the partial report of everything that finished.
#[derive(Debug)]
pub struct BatchAborted<T> {
    pub index: usize,
    pub error: OperationError,
    pub report: BatchReport<T>,
}

impl<T> BatchAborted<T> {
    pub fn successful(&self) -> usize {
        self.report.success_count()
    }

    pub fn failed(&self) -> usize {
        self.report.fail_count()
    }

    pub fn skipped(&self) -> usize {
        self.report.skipped().len()
    }
}

impl<T> fmt::Display for BatchAborted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch aborted at item {}: {} ({} succeeded, {} failed, {} not attempted)",
            self.index,
            self.error,
            self.successful(),
            self.failed(),
            self.skipped()
        )
    }
}

impl<T: fmt::Debug> std::error::Error for BatchAborted<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<T> From<BatchAborted<T>> for Error {
    fn from(aborted: BatchAborted<T>) -> Self {
        Error::BatchAborted {
            index: aborted.index,
            reason: aborted.error.to_string(),
            successful: aborted.successful(),
            failed: aborted.failed(),
            skipped: aborted.skipped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(index: usize, ok: bool) -> BatchItem<String> {
        let now = Utc::now();
        BatchItem {
            index,
            input_name: format!("in/{index}.jpg"),
            output_name: format!("{index}.jpg"),
            outcome: if ok {
                ItemOutcome::Succeeded {
                    payload: format!("payload-{index}"),
                    output_path: None,
                }
            } else {
                ItemOutcome::Failed(OperationError::http(400, "bad"))
            },
            attempts: 1,
            started_at: now,
            finished_at: now,
            elapsed: Duration::ZERO,
        }
    }

    fn report() -> BatchReport<String> {
        BatchReport::new(
            vec![item(0, true), item(1, false), item(2, true), item(3, true)],
            vec![],
            4,
            Duration::from_secs(2),
        )
    }

    #[test]
    fn derived_counts() {
        let r = report();
        assert_eq!(r.total_count(), 4);
        assert_eq!(r.success_count(), 3);
        assert_eq!(r.fail_count(), 1);
        assert_eq!(r.success_rate(), 0.75);
        assert!(r.any_failed());
        assert_eq!(r.get(2).unwrap().result().unwrap(), "payload-2");
        assert!(r.get(9).is_none());
        assert_eq!(r[1].error().unwrap().status(), Some(400));

        let stats = r.statistics();
        assert_eq!(stats.average_time_per_item, 0.5);
        assert_eq!(r.progress().completed, 4);
    }

    #[test]
    fn raise_on_failure_lists_failed_indices() {
        match report().raise_on_failure() {
            Err(Error::BatchPartialFailure {
                successful,
                failed,
                failures,
            }) => {
                assert_eq!((successful, failed), (3, 1));
                assert_eq!(failures[0].0, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        let clean: BatchReport<String> =
            BatchReport::new(vec![item(0, true)], vec![], 1, Duration::ZERO);
        assert!(clean.raise_on_failure().is_ok());
    }

    #[test]
    fn indexing_follows_input_index_across_gaps() {
        let r = BatchReport::new(
            vec![item(0, true), item(1, true), item(4, false)],
            vec![2, 3],
            5,
            Duration::ZERO,
        );
        assert_eq!(r[4].index, 4);
        assert!(r[4].error().is_some());
        assert_eq!(r.items()[2].index, 4);
        assert!(r.get(3).is_none());
    }

    #[test]
    #[should_panic(expected = "input index 2")]
    fn indexing_a_skipped_input_panics() {
        let r = BatchReport::new(vec![item(0, true)], vec![1, 2], 3, Duration::ZERO);
        let _ = &r[2];
    }

    #[test]
    fn empty_report_has_zero_success_rate() {
        let r: BatchReport<String> = BatchReport::new(vec![], vec![], 0, Duration::ZERO);
        assert_eq!(r.success_rate(), 0.0);
        assert!(r.all_successful());
    }

    #[test]
    fn save_successful_uses_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let saved = report()
            .save_successful(dir.path(), "{index}_result_{name}")
            .unwrap();
        assert_eq!(saved, 3);
        let written = std::fs::read_to_string(dir.path().join("2_result_2.jpg")).unwrap();
        assert_eq!(written, "payload-2");
        assert!(!dir.path().join("1_result_1.jpg").exists());
    }

    #[test]
    fn aborted_converts_to_crate_error() {
        let aborted = BatchAborted {
            index: 1,
            error: OperationError::http(400, "bad"),
            report: BatchReport::new(vec![item(0, true), item(1, false)], vec![2, 3], 4, Duration::ZERO),
        };
        assert_eq!(
            aborted.to_string(),
            "batch aborted at item 1: [400] bad (1 succeeded, 1 failed, 2 not attempted)"
        );
        let err: Error = aborted.into();
        assert!(matches!(err, Error::BatchAborted { skipped: 2, .. }));
    }
}
