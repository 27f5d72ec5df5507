//! Background estimation and compositing.
//!
//! Two backgrounds are estimated at working resolution from the same
//! star-free sky:
//!
//! - `bg0`: stars inpainted, dust motes left in place.
//! - `bg1`: stars and dust motes inpainted.
//!
//! Both are smoothed identically and brought back to full resolution.
//! The corrected image is `original - bg0 + bg1`, which swaps the dusty
//! background for the clean one while leaving stars and fine structure
//! untouched.

use crate::convolution::{self, VariableShapeKernel};
use crate::inpaint::{self, InpaintOptions};
use crate::monitor::Monitor;
use crate::parallel;
use crate::resample;
use crate::types::{Dimensions, DustFreeConfig, Image, PipelineError, Sample};

/// Dust mask samples at or above this value mark dust.
pub const DUST_THRESHOLD: f64 = 0.5;

/// The two smoothed backgrounds a run composites with.
#[derive(Debug, Clone, PartialEq)]
pub struct Backgrounds<T> {
    /// Background with stars removed, dust still present.
    pub star_free: Image<T>,
    /// Background with stars and dust removed.
    pub dust_free: Image<T>,
}

/// How a dust mask was reconciled with the working image.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDustMask<T> {
    /// Binary mask, 1 on dust, same shape as the working image.
    pub mask: Image<T>,
    /// The mask was resampled to working resolution.
    pub resampled: bool,
    /// A single-channel mask was expanded to every channel.
    pub broadcast: bool,
}

impl<T: Sample> PreparedDustMask<T> {
    /// Number of dust samples over all channels.
    #[must_use]
    pub fn dust_count(&self) -> usize {
        self.mask.count_where(|v| v > T::zero())
    }
}

/// Zero every star pixel of `working`.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if the mask does not
/// have the working image's shape.
pub fn mask_background<T: Sample>(
    working: &Image<T>,
    sky_mask: &Image<T>,
) -> Result<Image<T>, PipelineError> {
    let mut background = working.clone();
    background.multiply(sky_mask)?;
    Ok(background)
}

/// Bring a dust mask to the working image's shape and binarize it.
///
/// The mask is resampled when its size differs, then a single-channel
/// mask is broadcast to every channel.
///
/// # Errors
///
/// Returns [`PipelineError::MaskChannelMismatch`] if the channel counts
/// still differ.
pub fn prepare_dust_mask<T: Sample>(
    dust: &Image<T>,
    working: Dimensions,
) -> Result<PreparedDustMask<T>, PipelineError> {
    let resampled = !dust.dimensions().same_size(&working);
    let sized = if resampled {
        resample::resample_bspline(dust, working.width, working.height)
    } else {
        dust.clone()
    };
    let broadcast = sized.channels() != working.channels;
    let mut mask = sized.broadcast_channels(working.channels)?;
    mask.binarize(T::from_f64_c(DUST_THRESHOLD));
    Ok(PreparedDustMask {
        mask,
        resampled,
        broadcast,
    })
}

/// Turn every dust pixel of `background` into a hole.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if the shapes differ.
pub fn apply_dust_mask<T: Sample>(
    background: &mut Image<T>,
    dust: &PreparedDustMask<T>,
) -> Result<(), PipelineError> {
    let mut keep = dust.mask.clone();
    keep.invert();
    background.multiply(&keep)
}

/// `original - star_free + dust_free`, sample by sample.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if any shape differs from
/// `original`.
pub fn composite<T: Sample>(
    original: &Image<T>,
    backgrounds: &Backgrounds<T>,
) -> Result<Image<T>, PipelineError> {
    let mut result = original.clone();
    result.subtract(&backgrounds.star_free)?;
    result.add(&backgrounds.dust_free)?;
    Ok(result)
}

/// Runs the inpainting, smoothing and resampling steps for one
/// configuration.
#[derive(Debug, Clone)]
pub struct BackgroundCompositor {
    options: InpaintOptions,
    kernel: VariableShapeKernel,
}

impl BackgroundCompositor {
    /// Compositor for `config`.
    #[must_use]
    pub fn new(config: &DustFreeConfig) -> Self {
        Self {
            options: InpaintOptions {
                jitter: config.ray_jitter,
                workers: parallel::available_workers(config.max_workers),
            },
            kernel: VariableShapeKernel::new(config.smoothing_sigma()),
        }
    }

    /// Inpainting options used for both passes.
    #[must_use]
    pub const fn inpaint_options(&self) -> &InpaintOptions {
        &self.options
    }

    /// Smoothing kernel applied to both backgrounds.
    #[must_use]
    pub const fn kernel(&self) -> &VariableShapeKernel {
        &self.kernel
    }

    /// Fill every hole of `background`.
    ///
    /// # Errors
    ///
    /// Propagates worker failures, see [`inpaint::inpaint`].
    pub fn inpaint<T: Sample>(
        &self,
        background: &Image<T>,
        monitor: &Monitor,
    ) -> Result<Image<T>, PipelineError> {
        inpaint::inpaint(background, &self.options, monitor)
    }

    /// Smooth a background with the configured kernel.
    #[must_use]
    pub fn smooth<T: Sample>(&self, background: &Image<T>) -> Image<T> {
        convolution::fft_convolve(background, &self.kernel)
    }

    /// Resample both backgrounds to `target` size when they differ.
    #[must_use]
    pub fn upsample<T: Sample>(backgrounds: Backgrounds<T>, target: Dimensions) -> Backgrounds<T> {
        if backgrounds.star_free.dimensions().same_size(&target) {
            return backgrounds;
        }
        Backgrounds {
            star_free: resample::resample_bspline(
                &backgrounds.star_free,
                target.width,
                target.height,
            ),
            dust_free: resample::resample_bspline(
                &backgrounds.dust_free,
                target.width,
                target.height,
            ),
        }
    }
}
