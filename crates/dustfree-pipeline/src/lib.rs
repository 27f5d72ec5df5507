//! dustfree-pipeline: Background-based dust mote removal (sans-IO).
//!
//! Removes dust shadows from astronomical images by swapping the local
//! sky background for one reconstructed without the dust:
//!
//! downsample -> star mask -> masked background -> inpaint (stars) ->
//! dust mask -> inpaint (stars + dust) -> smooth -> upsample ->
//! `original - bg0 + bg1`.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! float images. Decoding, encoding and logging setup live in
//! `dustfree-cli`.

pub mod background;
pub mod convolution;
pub mod diagnostics;
pub mod inpaint;
pub mod monitor;
pub mod morphology;
pub mod parallel;
pub mod resample;
pub mod star_mask;
pub mod types;
pub mod wavelet;

use std::time::Duration;

pub use background::{BackgroundCompositor, Backgrounds};
pub use diagnostics::{Clock, NullClock, ReconstructDiagnostics};
pub use monitor::{AbortSignal, Monitor};
pub use star_mask::StarMaskBuilder;
pub use types::{Dimensions, DustFreeConfig, Image, PipelineError, ReconstructResult, Sample};

use diagnostics::{ReconstructSummary, StageDiagnostics, StageMetrics, StageTimer};

/// Remove dust from `image` in place.
///
/// `dust` marks dust motes (values `>= 0.5`); it may be single-channel
/// or match the image's channel count, and is resampled when its size
/// differs from the working resolution.
///
/// In sky detection test mode the image is left untouched and the
/// star-masked working background is returned instead.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`], [`PipelineError::EmptyImage`],
/// [`PipelineError::MissingDustMask`] or
/// [`PipelineError::MaskChannelMismatch`] before any work starts, and
/// propagates inpainting failures. `image` is only written after every
/// stage has succeeded.
pub fn reconstruct<T: Sample>(
    image: &mut Image<T>,
    dust: Option<&Image<T>>,
    config: &DustFreeConfig,
    monitor: &Monitor,
) -> Result<ReconstructResult<T>, PipelineError> {
    reconstruct_with_diagnostics(image, dust, config, monitor, &NullClock).map(|(result, _)| result)
}

/// [`reconstruct`] on an [`image::DynamicImage`].
///
/// Only 32-bit float RGB and RGBA targets are accepted; integer images
/// are rejected before any work. The dust mask may be in any format and
/// is converted to normalized float samples.
///
/// # Errors
///
/// Returns [`PipelineError::UnsupportedSampleFormat`] for non-float
/// targets, plus everything [`reconstruct`] returns.
pub fn reconstruct_dynamic(
    target: &mut image::DynamicImage,
    dust: Option<&image::DynamicImage>,
    config: &DustFreeConfig,
    monitor: &Monitor,
) -> Result<ReconstructResult<f32>, PipelineError> {
    let mut image = Image::<f32>::try_from(&*target)?;
    let dust = dust.map(float_image_from_dynamic);
    let result = reconstruct(&mut image, dust.as_ref(), config, monitor)?;
    if !result.is_sky_detection() {
        *target = image.into_dynamic()?;
    }
    Ok(result)
}

/// Convert an image of any sample format to normalized float samples.
///
/// Grayscale images stay single-channel; integer samples are scaled to
/// `[0, 1]`.
#[must_use]
pub fn float_image_from_dynamic(source: &image::DynamicImage) -> Image<f32> {
    match source.color().channel_count() {
        1 | 2 => Image::from_luma32f(&source.to_luma32f()),
        4 => Image::from_rgba32f(&source.to_rgba32f()),
        _ => Image::from_rgb32f(&source.to_rgb32f()),
    }
}

/// [`reconstruct`], additionally timing every stage against `clock`.
///
/// # Errors
///
/// Same as [`reconstruct`].
#[allow(clippy::too_many_lines)]
pub fn reconstruct_with_diagnostics<T: Sample, C: Clock>(
    image: &mut Image<T>,
    dust: Option<&Image<T>>,
    config: &DustFreeConfig,
    monitor: &Monitor,
    clock: &C,
) -> Result<(ReconstructResult<T>, ReconstructDiagnostics), PipelineError> {
    config.validate()?;
    if image.is_empty() {
        return Err(PipelineError::EmptyImage);
    }
    let dust = dust.ok_or(PipelineError::MissingDustMask)?;
    if dust.is_empty() {
        return Err(PipelineError::EmptyImage);
    }
    if dust.channels() != 1 && dust.channels() != image.channels() {
        return Err(PipelineError::MaskChannelMismatch {
            mask: dust.channels(),
            image: image.channels(),
        });
    }

    let run_start = clock.now();
    let timer = StageTimer::new(clock);
    let dims = image.dimensions();
    tracing::info!(%dims, ?config, "starting dust removal");

    // 1. Working resolution.
    let factor = config.downsample as usize;
    let (working, elapsed) = timer.time(|| resample::downsample_integer(image, factor));
    let downsample = StageDiagnostics {
        duration: elapsed,
        metrics: StageMetrics::Downsample {
            factor: config.downsample,
            width: working.width(),
            height: working.height(),
        },
    };
    tracing::info!(factor, working = %working.dimensions(), "downsampled");

    // 2. Sky mask.
    let builder = StarMaskBuilder::from_config(config);
    let (sky_mask, elapsed) = timer.time(|| builder.build(&working));
    let star_pixel_count = sky_mask.count_where(|v| v <= T::zero());
    let star_mask = StageDiagnostics {
        duration: elapsed,
        metrics: StageMetrics::StarMask {
            threshold: builder.threshold(),
            dilation_diameter: builder.dilation_diameter(),
            star_pixel_count,
            total_pixel_count: sky_mask.dimensions().sample_count(),
        },
    };
    tracing::info!(star_pixel_count, "star mask built");

    // 3. Star-free sky.
    let (masked, elapsed) = timer.time(|| background::mask_background(&working, &sky_mask));
    let masked = masked?;
    let hole_count = masked.hole_count();
    let mask_background = StageDiagnostics {
        duration: elapsed,
        metrics: StageMetrics::MaskBackground { hole_count },
    };

    let summary = ReconstructSummary {
        image_width: dims.width,
        image_height: dims.height,
        channels: dims.channels,
        working_width: working.width(),
        working_height: working.height(),
        sky_detection: config.test_sky_detection,
    };

    if config.test_sky_detection {
        tracing::info!(hole_count, "sky detection test mode, returning masked background");
        let diagnostics = ReconstructDiagnostics {
            downsample,
            star_mask,
            mask_background,
            inpaint_stars: None,
            dust_mask: None,
            inpaint_dust: None,
            smoothing: None,
            upsample: None,
            composite: None,
            total_duration: clock.elapsed(&run_start),
            summary,
        };
        return Ok((ReconstructResult::SkyDetection(masked), diagnostics));
    }

    let compositor = BackgroundCompositor::new(config);
    let workers = compositor.inpaint_options().workers;

    // 4. First pass: stars only.
    let (star_free, elapsed) = timer.time(|| compositor.inpaint(&masked, monitor));
    let star_free = star_free?;
    let inpaint_stars = inpaint_stage(elapsed, hole_count, workers, dims.channels);
    tracing::info!(hole_count, workers, "inpainted star holes");

    // 5. Dust mask.
    let (prepared, elapsed) = timer.time(|| -> Result<_, PipelineError> {
        let prepared = background::prepare_dust_mask(dust, working.dimensions())?;
        let mut holes = masked;
        background::apply_dust_mask(&mut holes, &prepared)?;
        Ok((prepared, holes))
    });
    let (prepared, holes) = prepared?;
    let dust_pixel_count = prepared.dust_count();
    let dust_mask = StageDiagnostics {
        duration: elapsed,
        metrics: StageMetrics::DustMask {
            resampled: prepared.resampled,
            broadcast: prepared.broadcast,
            dust_pixel_count,
        },
    };
    tracing::info!(dust_pixel_count, resampled = prepared.resampled, "dust mask applied");

    // 6. Second pass: stars and dust.
    let dust_holes = holes.hole_count();
    let (dust_free, elapsed) = timer.time(|| compositor.inpaint(&holes, monitor));
    let dust_free = dust_free?;
    let inpaint_dust = inpaint_stage(elapsed, dust_holes, workers, dims.channels);
    tracing::info!(hole_count = dust_holes, workers, "inpainted star and dust holes");

    // 7. Smoothing.
    let (backgrounds, elapsed) = timer.time(|| Backgrounds {
        star_free: compositor.smooth(&star_free),
        dust_free: compositor.smooth(&dust_free),
    });
    let kernel = compositor.kernel();
    let smoothing = StageDiagnostics {
        duration: elapsed,
        metrics: StageMetrics::Smoothing {
            sigma: kernel.sigma(),
            radius: kernel.radius(),
        },
    };
    tracing::info!(sigma = kernel.sigma(), radius = kernel.radius(), "backgrounds smoothed");

    // 8. Full resolution.
    let (backgrounds, upsample) = if working.dimensions().same_size(&dims) {
        (backgrounds, None)
    } else {
        let (up, elapsed) = timer.time(|| BackgroundCompositor::upsample(backgrounds, dims));
        tracing::info!(%dims, "backgrounds upsampled");
        let stage = StageDiagnostics {
            duration: elapsed,
            metrics: StageMetrics::Upsample {
                width: dims.width,
                height: dims.height,
            },
        };
        (up, Some(stage))
    };

    // 9. Composite and commit.
    let (restored, elapsed) = timer.time(|| background::composite(image, &backgrounds));
    *image = restored?;
    let composite = StageDiagnostics {
        duration: elapsed,
        metrics: StageMetrics::Composite {
            channels: dims.channels,
        },
    };

    let total_duration = clock.elapsed(&run_start);
    tracing::info!(total_ms = diagnostics::duration_ms(total_duration), "dust removal complete");

    let diagnostics = ReconstructDiagnostics {
        downsample,
        star_mask,
        mask_background,
        inpaint_stars: Some(inpaint_stars),
        dust_mask: Some(dust_mask),
        inpaint_dust: Some(inpaint_dust),
        smoothing: Some(smoothing),
        upsample,
        composite: Some(composite),
        total_duration,
        summary,
    };
    Ok((ReconstructResult::Restored, diagnostics))
}

const fn inpaint_stage(
    duration: Duration,
    hole_count: usize,
    workers: usize,
    channels: usize,
) -> StageDiagnostics {
    StageDiagnostics {
        duration,
        metrics: StageMetrics::Inpaint {
            hole_count,
            workers,
            channels,
        },
    }
}
