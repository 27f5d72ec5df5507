//! Progress accounting and cooperative cancellation.
//!
//! Workers report processed samples to a shared [`Monitor`]. The abort
//! flag is only consulted when the running count crosses a multiple of
//! [`CHECK_INTERVAL`], so the per-pixel hot loop never touches it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Number of processed samples between abort checks.
pub const CHECK_INTERVAL: u64 = 65_536;

/// Shareable handle used to request cancellation of a running pipeline.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    /// Create a signal in the not-aborted state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Workers stop at their next checkpoint.
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Progress {
    stage: String,
    processed: u64,
    total: u64,
}

/// Cancellation was requested while a worker was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

/// Shared progress counter plus abort signal for one pipeline run.
#[derive(Debug, Default)]
pub struct Monitor {
    signal: AbortSignal,
    progress: Mutex<Progress>,
}

impl Monitor {
    /// Create a monitor with a fresh abort signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a monitor observing an existing abort signal.
    #[must_use]
    pub fn with_signal(signal: AbortSignal) -> Self {
        Self {
            signal,
            progress: Mutex::default(),
        }
    }

    /// A handle that can abort this monitor's run from elsewhere.
    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Start a new stage expecting `total` samples of work.
    pub fn initialize(&self, stage: &str, total: u64) {
        let mut progress = self.progress.lock();
        progress.stage.clear();
        progress.stage.push_str(stage);
        progress.processed = 0;
        progress.total = total;
        tracing::debug!(stage, total, "stage started");
    }

    /// Record `count` processed samples.
    ///
    /// # Errors
    ///
    /// Returns [`Aborted`] if the count crossed a checkpoint and the
    /// abort signal is set.
    pub fn advance(&self, count: u64) -> Result<(), Aborted> {
        let crossed = {
            let mut progress = self.progress.lock();
            let before = progress.processed;
            progress.processed = before.saturating_add(count);
            let crossed = before / CHECK_INTERVAL != progress.processed / CHECK_INTERVAL;
            if crossed {
                tracing::trace!(
                    stage = %progress.stage,
                    processed = progress.processed,
                    total = progress.total,
                    "progress"
                );
            }
            crossed
        };
        if crossed && self.signal.is_aborted() {
            return Err(Aborted);
        }
        Ok(())
    }

    /// Samples processed in the current stage.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.progress.lock().processed
    }
}
