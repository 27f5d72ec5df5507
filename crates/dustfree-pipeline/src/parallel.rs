//! Row-partitioned worker dispatch.
//!
//! A channel plane is split into contiguous row ranges ([`WorkItem`]s),
//! one per worker. Each invocation builds a fresh `rayon` pool sized to
//! the number of work items and drops it when every worker has returned.
//!
//! Workers never write into the caller's buffer directly. Each fills a
//! private block of rows and hands it back as its outcome; the dispatcher
//! joins all workers, reports the first failure in worker order, and
//! copies the blocks into the output only when every worker succeeded.

use std::any::Any;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::panic::{AssertUnwindSafe, catch_unwind};

use rayon::prelude::*;

use crate::monitor::{Aborted, Monitor};
use crate::types::PipelineError;

/// A contiguous row range of one channel assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    /// Worker index, also the order in which failures are reported.
    pub index: usize,
    /// Channel the rows belong to.
    pub channel: usize,
    /// First row (inclusive).
    pub first_row: usize,
    /// Last row (exclusive).
    pub end_row: usize,
}

impl WorkItem {
    /// The rows this item covers.
    #[must_use]
    pub const fn rows(&self) -> Range<usize> {
        self.first_row..self.end_row
    }

    /// Number of rows in the item.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end_row - self.first_row
    }

    /// Returns `true` if the item covers no rows.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end_row == self.first_row
    }
}

/// Why a single worker stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerFailure {
    /// The row function rejected its input.
    #[error("{0}")]
    Domain(String),

    /// The worker could not allocate its row block.
    #[error("Out of memory")]
    OutOfMemory,

    /// The row function panicked.
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// The abort signal was observed at a checkpoint.
    #[error("aborted")]
    Aborted,
}

impl From<Aborted> for WorkerFailure {
    fn from(_: Aborted) -> Self {
        Self::Aborted
    }
}

/// Number of workers to use, bounded by the available processors and
/// an optional caller limit. Always at least 1.
#[must_use]
pub fn available_workers(limit: Option<usize>) -> usize {
    let processors = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    limit.map_or(processors, |l| l.min(processors)).max(1)
}

/// Split `rows` into at most `max_workers` balanced loads.
///
/// Loads differ by at most one row, larger loads first, and always sum
/// to `rows`. No load is empty.
#[must_use]
pub fn optimal_row_loads(rows: usize, max_workers: usize) -> Vec<usize> {
    if rows == 0 || max_workers == 0 {
        return Vec::new();
    }
    let n = max_workers.min(rows);
    let base = rows / n;
    let extra = rows % n;
    (0..n).map(|i| base + usize::from(i < extra)).collect()
}

/// Build the work items covering `height` rows of `channel`.
#[must_use]
pub fn work_items(height: usize, channel: usize, max_workers: usize) -> Vec<WorkItem> {
    let mut first_row = 0;
    optimal_row_loads(height, max_workers)
        .into_iter()
        .enumerate()
        .map(|(index, load)| {
            let item = WorkItem {
                index,
                channel,
                first_row,
                end_row: first_row + load,
            };
            first_row += load;
            item
        })
        .collect()
}

/// Fill `output` (one channel plane of `width`-sample rows) by running
/// `process_row(y, row)` for every row across a fresh worker pool.
///
/// Every worker is joined before any failure is reported. On failure
/// `output` is left untouched.
///
/// # Errors
///
/// - [`PipelineError::Worker`] carrying the first failing worker's
///   message, by worker index.
/// - [`PipelineError::Aborted`] if that first failure was an abort.
/// - [`PipelineError::ThreadPool`] if the pool cannot be built.
/// - [`PipelineError::BufferLength`] if `output` is not a whole number
///   of rows.
pub fn dispatch_rows<T, F>(
    output: &mut [T],
    width: usize,
    channel: usize,
    max_workers: usize,
    monitor: &Monitor,
    process_row: F,
) -> Result<(), PipelineError>
where
    T: Copy + Default + Send + Sync,
    F: Fn(usize, &mut [T]) -> Result<(), WorkerFailure> + Sync,
{
    if width == 0 || output.is_empty() {
        return Ok(());
    }
    if output.len() % width != 0 {
        return Err(PipelineError::BufferLength {
            expected: output.len().next_multiple_of(width),
            actual: output.len(),
        });
    }
    let height = output.len() / width;
    let items = work_items(height, channel, max_workers);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(items.len())
        .thread_name(|i| format!("dustfree-worker-{i}"))
        .build()?;
    tracing::debug!(channel, workers = items.len(), rows = height, "dispatching workers");

    let outcomes: Vec<Result<Vec<T>, WorkerFailure>> = pool.install(|| {
        items
            .par_iter()
            .map(|item| run_worker(item, width, monitor, &process_row))
            .collect()
    });
    drop(pool);

    let mut first_failure: Option<(usize, WorkerFailure)> = None;
    for (item, outcome) in items.iter().zip(&outcomes) {
        if let Err(failure) = outcome {
            tracing::warn!(
                worker = item.index,
                channel = item.channel,
                rows = ?item.rows(),
                %failure,
                "worker failed"
            );
            if first_failure.is_none() {
                first_failure = Some((item.index, failure.clone()));
            }
        }
    }
    if let Some((worker, failure)) = first_failure {
        return Err(match failure {
            WorkerFailure::Aborted => PipelineError::Aborted,
            other => PipelineError::Worker {
                worker,
                message: other.to_string(),
            },
        });
    }

    for (item, rows) in items.iter().zip(outcomes.into_iter().flatten()) {
        output[item.first_row * width..item.end_row * width].copy_from_slice(&rows);
    }
    Ok(())
}

fn run_worker<T, F>(
    item: &WorkItem,
    width: usize,
    monitor: &Monitor,
    process_row: &F,
) -> Result<Vec<T>, WorkerFailure>
where
    T: Copy + Default,
    F: Fn(usize, &mut [T]) -> Result<(), WorkerFailure>,
{
    let len = item.len() * width;
    let mut rows = Vec::new();
    rows.try_reserve_exact(len)
        .map_err(|_| WorkerFailure::OutOfMemory)?;
    rows.resize(len, T::default());

    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(), WorkerFailure> {
        for (offset, row) in rows.chunks_exact_mut(width).enumerate() {
            process_row(item.first_row + offset, row)?;
            monitor.advance(width as u64)?;
        }
        Ok(())
    }));

    match outcome {
        Ok(Ok(())) => Ok(rows),
        Ok(Err(failure)) => Err(failure),
        Err(payload) => Err(WorkerFailure::Unknown(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn loads_cover_all_rows() {
        for rows in [1, 7, 64, 513] {
            for workers in [1, 3, 8, 1000] {
                let loads = optimal_row_loads(rows, workers);
                assert_eq!(loads.iter().sum::<usize>(), rows);
                assert!(loads.len() <= workers);
                assert!(loads.iter().all(|&l| l > 0));
                let min = loads.iter().min().unwrap();
                let max = loads.iter().max().unwrap();
                assert!(max - min <= 1, "unbalanced loads {loads:?}");
            }
        }
    }

    #[test]
    fn loads_for_empty_input() {
        assert!(optimal_row_loads(0, 4).is_empty());
        assert!(optimal_row_loads(4, 0).is_empty());
    }

    #[test]
    fn work_items_are_contiguous_and_disjoint() {
        let items = work_items(10, 2, 3);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].rows(), 0..4);
        assert_eq!(items[1].rows(), 4..7);
        assert_eq!(items[2].rows(), 7..10);
        assert!(items.iter().all(|item| item.channel == 2));
        assert!(items.iter().enumerate().all(|(i, item)| item.index == i));
    }

    #[test]
    fn available_workers_respects_limit() {
        assert_eq!(available_workers(Some(1)), 1);
        assert!(available_workers(None) >= 1);
    }

    #[test]
    fn dispatch_fills_every_row() {
        let width = 5;
        let mut output = vec![0.0f32; width * 13];
        let monitor = Monitor::new();
        dispatch_rows(&mut output, width, 0, 4, &monitor, |y, row| {
            for (x, v) in row.iter_mut().enumerate() {
                *v = (y * 10 + x) as f32;
            }
            Ok(())
        })
        .unwrap();
        for y in 0..13 {
            for x in 0..width {
                assert_eq!(output[y * width + x], (y * 10 + x) as f32);
            }
        }
        assert_eq!(monitor.processed(), (width * 13) as u64);
    }

    #[test]
    fn single_failure_is_reported_once_after_all_workers_join() {
        let width = 4;
        let height = 16;
        let mut output = vec![-1.0f32; width * height];
        let rows_visited = AtomicUsize::new(0);
        let result = dispatch_rows(&mut output, width, 0, 4, &Monitor::new(), |y, row| {
            rows_visited.fetch_add(1, Ordering::Relaxed);
            if y == 9 {
                return Err(WorkerFailure::Domain("bad row 9".into()));
            }
            row.fill(1.0);
            Ok(())
        });

        match result {
            Err(PipelineError::Worker { worker, message }) => {
                assert_eq!(worker, 2, "rows 8..12 belong to worker 2");
                assert_eq!(message, "bad row 9");
            }
            other => panic!("expected worker failure, got {other:?}"),
        }
        // The failing worker stops at row 9; every other worker ran to completion.
        assert_eq!(rows_visited.load(Ordering::Relaxed), 12 + 2);
        // Nothing was committed to the output.
        assert!(output.iter().all(|&v| v == -1.0));
    }

    #[test]
    fn first_failure_by_worker_index_wins() {
        let mut output = vec![0.0f64; 8 * 2];
        let result = dispatch_rows(&mut output, 2, 0, 4, &Monitor::new(), |y, _| {
            if y == 1 || y == 6 {
                Err(WorkerFailure::Domain(format!("row {y}")))
            } else {
                Ok(())
            }
        });
        assert!(matches!(
            result,
            Err(PipelineError::Worker { worker: 0, ref message }) if message == "row 1"
        ));
    }

    #[test]
    fn panic_is_captured_as_unknown_error() {
        let mut output = vec![0.0f32; 4 * 4];
        let result = dispatch_rows(&mut output, 4, 0, 2, &Monitor::new(), |y, _| {
            if y == 3 {
                panic!("boom");
            }
            Ok(())
        });
        assert!(matches!(
            result,
            Err(PipelineError::Worker { worker: 1, ref message }) if message == "Unknown error: boom"
        ));
    }

    #[test]
    fn abort_maps_to_aborted_error() {
        let width = 1024;
        let height = 256;
        let mut output = vec![0.0f32; width * height];
        let monitor = Monitor::new();
        monitor.signal().abort();
        let result = dispatch_rows(&mut output, width, 0, 1, &monitor, |_, _| Ok(()));
        assert!(matches!(result, Err(PipelineError::Aborted)));
    }

    #[test]
    fn ragged_output_is_rejected() {
        let mut output = vec![0.0f32; 7];
        let result = dispatch_rows(&mut output, 3, 0, 1, &Monitor::new(), |_, _| Ok(()));
        assert!(matches!(result, Err(PipelineError::BufferLength { .. })));
    }
}
