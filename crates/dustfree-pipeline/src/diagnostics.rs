//! Reconstruction diagnostics: timing and counts for each stage.
//!
//! Collected by [`reconstruct_with_diagnostics`](crate::reconstruct_with_diagnostics)
//! for parameter tuning and profiling. Timestamps come from a caller
//! supplied [`Clock`], so the library itself never reads the system time.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Source of timestamps for stage timing.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// Current time.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// A clock that never advances. Every duration is zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullClock;

impl Clock for NullClock {
    type Instant = ();

    fn now(&self) {}

    fn elapsed(&self, _since: &()) -> Duration {
        Duration::ZERO
    }
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single reconstruction run.
///
/// Stages after background masking are skipped in sky detection test
/// mode and are `None` then. `upsample` is also `None` when no
/// downsampling was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructDiagnostics {
    /// Reduction to working resolution.
    pub downsample: StageDiagnostics,
    /// Star detection and sky mask construction.
    pub star_mask: StageDiagnostics,
    /// Zeroing star pixels of the working image.
    pub mask_background: StageDiagnostics,
    /// First inpainting pass (stars only).
    pub inpaint_stars: Option<StageDiagnostics>,
    /// Dust mask resampling, broadcast and binarization.
    pub dust_mask: Option<StageDiagnostics>,
    /// Second inpainting pass (stars and dust).
    pub inpaint_dust: Option<StageDiagnostics>,
    /// FFT smoothing of both backgrounds.
    pub smoothing: Option<StageDiagnostics>,
    /// Resampling both backgrounds to full resolution.
    pub upsample: Option<StageDiagnostics>,
    /// `original - bg0 + bg1`.
    pub composite: Option<StageDiagnostics>,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: ReconstructSummary,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Working resolution reduction.
    Downsample {
        /// Integer reduction factor (1 = none).
        factor: u32,
        /// Working width in pixels.
        width: usize,
        /// Working height in pixels.
        height: usize,
    },
    /// Sky mask construction.
    StarMask {
        /// Binarization threshold.
        threshold: f64,
        /// Protection disk diameter.
        dilation_diameter: usize,
        /// Samples classified as star (mask 0).
        star_pixel_count: usize,
        /// Samples in the mask.
        total_pixel_count: usize,
    },
    /// Background masking.
    MaskBackground {
        /// Hole samples after masking.
        hole_count: usize,
    },
    /// One inpainting pass.
    Inpaint {
        /// Hole samples filled by this pass.
        hole_count: usize,
        /// Workers per channel.
        workers: usize,
        /// Channels processed.
        channels: usize,
    },
    /// Dust mask preparation.
    DustMask {
        /// The mask was resampled to working resolution.
        resampled: bool,
        /// A single-channel mask was expanded to every channel.
        broadcast: bool,
        /// Samples marked as dust.
        dust_pixel_count: usize,
    },
    /// Background smoothing.
    Smoothing {
        /// Kernel width parameter.
        sigma: f64,
        /// Kernel half-width in pixels.
        radius: usize,
    },
    /// Resampling to full resolution.
    Upsample {
        /// Output width in pixels.
        width: usize,
        /// Output height in pixels.
        height: usize,
    },
    /// Final composite.
    Composite {
        /// Channels written.
        channels: usize,
    },
}

/// High-level summary of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructSummary {
    /// Input width in pixels.
    pub image_width: usize,
    /// Input height in pixels.
    pub image_height: usize,
    /// Input channel count.
    pub channels: usize,
    /// Working width in pixels.
    pub working_width: usize,
    /// Working height in pixels.
    pub working_height: usize,
    /// The run stopped after sky detection.
    pub sky_detection: bool,
}

impl ReconstructDiagnostics {
    /// Stages that ran, in order, with display names.
    #[must_use]
    pub fn stages(&self) -> Vec<(&'static str, &StageDiagnostics)> {
        let mut stages = vec![
            ("Downsample", &self.downsample),
            ("Star Mask", &self.star_mask),
            ("Mask Background", &self.mask_background),
        ];
        let optional = [
            ("Inpaint Stars", &self.inpaint_stars),
            ("Dust Mask", &self.dust_mask),
            ("Inpaint Dust", &self.inpaint_dust),
            ("Smoothing", &self.smoothing),
            ("Upsample", &self.upsample),
            ("Composite", &self.composite),
        ];
        stages.extend(
            optional
                .into_iter()
                .filter_map(|(name, stage)| stage.as_ref().map(|s| (name, s))),
        );
        stages
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Reconstruction Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{}x{}  Working: {}x{}",
            self.summary.image_width,
            self.summary.image_height,
            self.summary.channels,
            self.summary.working_width,
            self.summary.working_height,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        if self.summary.sky_detection {
            lines.push("Mode: sky detection test".to_string());
        }
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for (name, diag) in self.stages() {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
#[must_use]
pub fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Downsample {
            factor,
            width,
            height,
        } => format!("x{factor} -> {width}x{height}"),
        StageMetrics::StarMask {
            threshold,
            dilation_diameter,
            star_pixel_count,
            total_pixel_count,
        } => {
            #[allow(clippy::cast_precision_loss)]
            let coverage = if *total_pixel_count > 0 {
                *star_pixel_count as f64 / *total_pixel_count as f64 * 100.0
            } else {
                0.0
            };
            format!(
                "threshold={threshold:.1e} disk={dilation_diameter}px stars={star_pixel_count} ({coverage:.1}%)",
            )
        }
        StageMetrics::MaskBackground { hole_count } => format!("holes={hole_count}"),
        StageMetrics::Inpaint {
            hole_count,
            workers,
            channels,
        } => format!("holes={hole_count} workers={workers} channels={channels}"),
        StageMetrics::DustMask {
            resampled,
            broadcast,
            dust_pixel_count,
        } => format!("dust={dust_pixel_count} resampled={resampled} broadcast={broadcast}"),
        StageMetrics::Smoothing { sigma, radius } => format!("sigma={sigma:.2} radius={radius}px"),
        StageMetrics::Upsample { width, height } => format!("-> {width}x{height}"),
        StageMetrics::Composite { channels } => format!("channels={channels}"),
    }
}

/// Times stages against a [`Clock`].
pub(crate) struct StageTimer<'a, C: Clock> {
    clock: &'a C,
}

impl<'a, C: Clock> StageTimer<'a, C> {
    pub(crate) const fn new(clock: &'a C) -> Self {
        Self { clock }
    }

    /// Run `stage`, returning its output and duration.
    pub(crate) fn time<R>(&self, stage: impl FnOnce() -> R) -> (R, Duration) {
        let start = self.clock.now();
        let output = stage();
        (output, self.clock.elapsed(&start))
    }
}
