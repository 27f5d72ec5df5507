//! Shared types for the dustfree reconstruction pipeline.

use std::fmt;

use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Floating-point sample type a pipeline run can operate on.
///
/// Implemented for `f32` and `f64`, the two sample widths the pipeline
/// accepts. Integer and complex images are rejected before processing.
pub trait Sample: Float + Default + fmt::Debug + Send + Sync + 'static {
    /// Convert from `f64`, rounding to the nearest representable value.
    fn from_f64_c(value: f64) -> Self;

    /// Convert from `f32` without loss.
    fn from_f32_c(value: f32) -> Self;

    /// Widen to `f64`.
    fn to_f64_c(self) -> f64;
}

impl Sample for f32 {
    #[allow(clippy::cast_possible_truncation)]
    fn from_f64_c(value: f64) -> Self {
        value as Self
    }

    fn from_f32_c(value: f32) -> Self {
        value
    }

    fn to_f64_c(self) -> f64 {
        f64::from(self)
    }
}

impl Sample for f64 {
    fn from_f64_c(value: f64) -> Self {
        value
    }

    fn from_f32_c(value: f32) -> Self {
        Self::from(value)
    }

    fn to_f64_c(self) -> f64 {
        self
    }
}

/// Shape of an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Number of channels (1 for grayscale, 3 for RGB).
    pub channels: usize,
}

impl Dimensions {
    /// Number of samples in a single channel plane.
    #[must_use]
    pub const fn plane_len(&self) -> usize {
        self.width * self.height
    }

    /// Total number of samples across all channels.
    #[must_use]
    pub const fn sample_count(&self) -> usize {
        self.plane_len() * self.channels
    }

    /// Whether width and height match, ignoring the channel count.
    #[must_use]
    pub const fn same_size(&self, other: &Self) -> bool {
        self.width == other.width && self.height == other.height
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

/// Planar multi-channel sample buffer.
///
/// Channel `c` occupies the contiguous range
/// `c * width * height .. (c + 1) * width * height`, with rows stored
/// top to bottom inside each plane. Planar storage lets the inpainter
/// hand out disjoint row ranges of a single channel to separate workers.
///
/// A sample `<= 0` is the hole sentinel: the pixel carries no valid data
/// and must be reconstructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Image<T> {
    dimensions: Dimensions,
    data: Vec<T>,
}

impl<T: Sample> Image<T> {
    /// Create an image with every sample set to `value`.
    #[must_use]
    pub fn filled(width: usize, height: usize, channels: usize, value: T) -> Self {
        let dimensions = Dimensions {
            width,
            height,
            channels,
        };
        Self {
            dimensions,
            data: vec![value; dimensions.sample_count()],
        }
    }

    /// Create an image with every sample set to zero.
    #[must_use]
    pub fn zeros(width: usize, height: usize, channels: usize) -> Self {
        Self::filled(width, height, channels, T::zero())
    }

    /// Create an image by evaluating `f(x, y, channel)` for every sample.
    #[must_use]
    pub fn from_fn<F>(width: usize, height: usize, channels: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize) -> T,
    {
        let mut data = Vec::with_capacity(width * height * channels);
        for c in 0..channels {
            for y in 0..height {
                for x in 0..width {
                    data.push(f(x, y, c));
                }
            }
        }
        Self {
            dimensions: Dimensions {
                width,
                height,
                channels,
            },
            data,
        }
    }

    /// Wrap an existing planar sample vector.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BufferLength`] if `data` does not hold
    /// exactly `width * height * channels` samples.
    pub fn from_vec(
        width: usize,
        height: usize,
        channels: usize,
        data: Vec<T>,
    ) -> Result<Self, PipelineError> {
        let dimensions = Dimensions {
            width,
            height,
            channels,
        };
        if data.len() != dimensions.sample_count() {
            return Err(PipelineError::BufferLength {
                expected: dimensions.sample_count(),
                actual: data.len(),
            });
        }
        Ok(Self { dimensions, data })
    }

    /// Image shape.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.dimensions.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.dimensions.height
    }

    /// Number of channels.
    #[must_use]
    pub const fn channels(&self) -> usize {
        self.dimensions.channels
    }

    /// Returns `true` if the image holds no samples.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// All samples in planar order.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Samples of one channel, row-major.
    ///
    /// # Panics
    ///
    /// Panics if `channel >= self.channels()`.
    #[must_use]
    pub fn plane(&self, channel: usize) -> &[T] {
        let len = self.dimensions.plane_len();
        &self.data[channel * len..(channel + 1) * len]
    }

    /// Mutable samples of one channel, row-major.
    ///
    /// # Panics
    ///
    /// Panics if `channel >= self.channels()`.
    pub fn plane_mut(&mut self, channel: usize) -> &mut [T] {
        let len = self.dimensions.plane_len();
        &mut self.data[channel * len..(channel + 1) * len]
    }

    /// Sample at `(x, y)` in `channel`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are out of bounds.
    #[must_use]
    pub fn get(&self, x: usize, y: usize, channel: usize) -> T {
        self.data[self.index(x, y, channel)]
    }

    /// Overwrite the sample at `(x, y)` in `channel`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are out of bounds.
    pub fn set(&mut self, x: usize, y: usize, channel: usize, value: T) {
        let i = self.index(x, y, channel);
        self.data[i] = value;
    }

    const fn index(&self, x: usize, y: usize, channel: usize) -> usize {
        channel * self.dimensions.plane_len() + y * self.dimensions.width + x
    }

    /// Number of samples (over all channels) satisfying `predicate`.
    #[must_use]
    pub fn count_where<F: Fn(T) -> bool>(&self, predicate: F) -> usize {
        self.data.iter().filter(|&&v| predicate(v)).count()
    }

    /// Number of hole samples (`<= 0`).
    #[must_use]
    pub fn hole_count(&self) -> usize {
        self.count_where(|v| v <= T::zero())
    }

    /// Smallest and largest sample over all channels.
    ///
    /// Returns `None` for an empty image.
    #[must_use]
    pub fn min_max(&self) -> Option<(T, T)> {
        let first = *self.data.first()?;
        Some(
            self.data
                .iter()
                .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v))),
        )
    }

    /// Apply `f` to every sample in place.
    pub fn map_in_place<F: Fn(T) -> T>(&mut self, f: F) {
        for v in &mut self.data {
            *v = f(*v);
        }
    }

    /// Combine with `other` sample by sample.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DimensionMismatch`] if the shapes differ.
    pub fn zip_in_place<F: Fn(T, T) -> T>(
        &mut self,
        other: &Self,
        f: F,
    ) -> Result<(), PipelineError> {
        self.ensure_same_shape(other)?;
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a = f(*a, b);
        }
        Ok(())
    }

    /// Multiply by `other` sample by sample.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DimensionMismatch`] if the shapes differ.
    pub fn multiply(&mut self, other: &Self) -> Result<(), PipelineError> {
        self.zip_in_place(other, |a, b| a * b)
    }

    /// Add `other` sample by sample.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DimensionMismatch`] if the shapes differ.
    pub fn add(&mut self, other: &Self) -> Result<(), PipelineError> {
        self.zip_in_place(other, |a, b| a + b)
    }

    /// Subtract `other` sample by sample.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DimensionMismatch`] if the shapes differ.
    pub fn subtract(&mut self, other: &Self) -> Result<(), PipelineError> {
        self.zip_in_place(other, |a, b| a - b)
    }

    /// Replace every sample `v` with `1 - v`.
    pub fn invert(&mut self) {
        self.map_in_place(|v| T::one() - v);
    }

    /// Set samples below `threshold` to 0 and all others to 1.
    pub fn binarize(&mut self, threshold: T) {
        self.map_in_place(|v| if v < threshold { T::zero() } else { T::one() });
    }

    /// Clamp every sample to `[lo, hi]`.
    pub fn truncate(&mut self, lo: T, hi: T) {
        self.map_in_place(|v| v.max(lo).min(hi));
    }

    /// Linearly rescale samples so the global minimum maps to 0 and the
    /// global maximum to 1.
    ///
    /// A constant image has no range to stretch and is left unchanged.
    pub fn normalize(&mut self) {
        let Some((lo, hi)) = self.min_max() else {
            return;
        };
        let range = hi - lo;
        if range <= T::zero() {
            return;
        }
        self.map_in_place(|v| (v - lo) / range);
    }

    /// Expand a single-channel image to `channels` identical planes.
    ///
    /// An image that already has `channels` channels is returned as is.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MaskChannelMismatch`] if the image has
    /// more than one channel and the counts differ.
    pub fn broadcast_channels(self, channels: usize) -> Result<Self, PipelineError> {
        if self.channels() == channels {
            return Ok(self);
        }
        if self.channels() != 1 {
            return Err(PipelineError::MaskChannelMismatch {
                mask: self.channels(),
                image: channels,
            });
        }
        let plane = self.data;
        let mut data = Vec::with_capacity(plane.len() * channels);
        for _ in 0..channels {
            data.extend_from_slice(&plane);
        }
        Ok(Self {
            dimensions: Dimensions {
                channels,
                ..self.dimensions
            },
            data,
        })
    }

    /// Fail unless `other` has exactly the same shape.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DimensionMismatch`] if the shapes differ.
    pub fn ensure_same_shape(&self, other: &Self) -> Result<(), PipelineError> {
        if self.dimensions == other.dimensions {
            Ok(())
        } else {
            Err(PipelineError::DimensionMismatch {
                expected: self.dimensions,
                actual: other.dimensions,
            })
        }
    }
}

impl Image<f32> {
    /// Build a single-channel image from an `image` crate float buffer.
    #[must_use]
    pub fn from_luma32f(buffer: &image::ImageBuffer<image::Luma<f32>, Vec<f32>>) -> Self {
        Self::from_interleaved(
            buffer.width() as usize,
            buffer.height() as usize,
            1,
            buffer.as_raw(),
        )
    }

    /// Build a three-channel image from an `image` crate float buffer.
    #[must_use]
    pub fn from_rgb32f(buffer: &image::Rgb32FImage) -> Self {
        Self::from_interleaved(
            buffer.width() as usize,
            buffer.height() as usize,
            3,
            buffer.as_raw(),
        )
    }

    /// Build a four-channel image from an `image` crate float buffer.
    #[must_use]
    pub fn from_rgba32f(buffer: &image::Rgba32FImage) -> Self {
        Self::from_interleaved(
            buffer.width() as usize,
            buffer.height() as usize,
            4,
            buffer.as_raw(),
        )
    }

    fn from_interleaved(width: usize, height: usize, channels: usize, raw: &[f32]) -> Self {
        Self::from_fn(width, height, channels, |x, y, c| {
            raw[(y * width + x) * channels + c]
        })
    }

    /// Interleave the planes into pixel-major order (`RGBRGB...`).
    #[must_use]
    pub fn to_interleaved(&self) -> Vec<f32> {
        let (w, h, channels) = (self.width(), self.height(), self.channels());
        let mut raw = Vec::with_capacity(self.data.len());
        for y in 0..h {
            for x in 0..w {
                for c in 0..channels {
                    raw.push(self.get(x, y, c));
                }
            }
        }
        raw
    }

    /// Convert into a [`image::DynamicImage`] holding float samples.
    ///
    /// Single-channel images are expanded to RGB, since `DynamicImage`
    /// has no single-channel float variant.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnsupportedSampleFormat`] for channel
    /// counts other than 1, 3 or 4, or dimensions exceeding `u32`.
    pub fn into_dynamic(self) -> Result<image::DynamicImage, PipelineError> {
        let width = u32::try_from(self.width())
            .map_err(|_| PipelineError::UnsupportedSampleFormat("width exceeds u32".into()))?;
        let height = u32::try_from(self.height())
            .map_err(|_| PipelineError::UnsupportedSampleFormat("height exceeds u32".into()))?;
        let too_short = || PipelineError::BufferLength {
            expected: self.dimensions.sample_count(),
            actual: self.data.len(),
        };
        match self.channels() {
            1 => {
                let rgb = self.clone().broadcast_channels(3)?;
                image::Rgb32FImage::from_raw(width, height, rgb.to_interleaved())
                    .map(image::DynamicImage::ImageRgb32F)
                    .ok_or_else(too_short)
            }
            3 => image::Rgb32FImage::from_raw(width, height, self.to_interleaved())
                .map(image::DynamicImage::ImageRgb32F)
                .ok_or_else(too_short),
            4 => image::Rgba32FImage::from_raw(width, height, self.to_interleaved())
                .map(image::DynamicImage::ImageRgba32F)
                .ok_or_else(too_short),
            n => Err(PipelineError::UnsupportedSampleFormat(format!(
                "{n}-channel images cannot be exported"
            ))),
        }
    }
}

impl TryFrom<&image::DynamicImage> for Image<f32> {
    type Error = PipelineError;

    /// Accepts only float-sampled images; integer formats are rejected
    /// rather than silently rescaled.
    fn try_from(value: &image::DynamicImage) -> Result<Self, Self::Error> {
        match value {
            image::DynamicImage::ImageRgb32F(buffer) => Ok(Self::from_rgb32f(buffer)),
            image::DynamicImage::ImageRgba32F(buffer) => Ok(Self::from_rgba32f(buffer)),
            other => Err(PipelineError::UnsupportedSampleFormat(format!(
                "{:?}",
                other.color()
            ))),
        }
    }
}

/// Configuration for a dust removal run.
///
/// Set once before a run and read-only during execution. Defaults match
/// the values a user would start from for a typical flat-less stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DustFreeConfig {
    /// Star detection sensitivity in `[0, 6]`. The binarization
    /// threshold is `10^-sensitivity`, so higher values classify more
    /// pixels as star.
    pub star_detection_sensitivity: f32,

    /// Extra protection radius around detected stars, in `[0, 10]`
    /// pixels. The star mask is dilated with a disk of diameter
    /// `2 * distance + 3`.
    pub star_diffusion_distance: u8,

    /// Background smoothness in `[0, 10]`. The smoothing kernel width is
    /// `1.7^smoothness` pixels at working resolution.
    pub smoothness: f32,

    /// Integer downsampling factor in `[1, 16]` applied before
    /// background estimation. `1` disables resampling.
    pub downsample: u32,

    /// Stop after masking stars and return the masked background for
    /// inspection instead of reconstructing.
    pub test_sky_detection: bool,

    /// Jitter ray sample positions with a per-row seeded generator.
    /// Off by default, which keeps the output deterministic and
    /// independent of the generator.
    pub ray_jitter: bool,

    /// Upper bound on inpainting workers. `None` uses every available
    /// processor.
    pub max_workers: Option<usize>,
}

impl DustFreeConfig {
    /// Default star detection sensitivity.
    pub const DEFAULT_STAR_DETECTION_SENSITIVITY: f32 = 4.0;
    /// Default star diffusion distance in pixels.
    pub const DEFAULT_STAR_DIFFUSION_DISTANCE: u8 = 5;
    /// Default smoothness.
    pub const DEFAULT_SMOOTHNESS: f32 = 2.0;
    /// Default downsampling factor.
    pub const DEFAULT_DOWNSAMPLE: u32 = 2;

    /// Largest accepted star detection sensitivity.
    pub const MAX_STAR_DETECTION_SENSITIVITY: f32 = 6.0;
    /// Largest accepted star diffusion distance.
    pub const MAX_STAR_DIFFUSION_DISTANCE: u8 = 10;
    /// Largest accepted smoothness.
    pub const MAX_SMOOTHNESS: f32 = 10.0;
    /// Largest accepted downsampling factor.
    pub const MAX_DOWNSAMPLE: u32 = 16;

    /// Base of the exponential smoothness-to-kernel-width mapping.
    pub const SMOOTHNESS_BASE: f64 = 1.7;

    /// Check every parameter against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// out-of-range parameter.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=Self::MAX_STAR_DETECTION_SENSITIVITY).contains(&self.star_detection_sensitivity)
        {
            return Err(PipelineError::InvalidConfig(format!(
                "star_detection_sensitivity must be in [0, {}], got {}",
                Self::MAX_STAR_DETECTION_SENSITIVITY,
                self.star_detection_sensitivity
            )));
        }
        if self.star_diffusion_distance > Self::MAX_STAR_DIFFUSION_DISTANCE {
            return Err(PipelineError::InvalidConfig(format!(
                "star_diffusion_distance must be in [0, {}], got {}",
                Self::MAX_STAR_DIFFUSION_DISTANCE,
                self.star_diffusion_distance
            )));
        }
        if !(0.0..=Self::MAX_SMOOTHNESS).contains(&self.smoothness) {
            return Err(PipelineError::InvalidConfig(format!(
                "smoothness must be in [0, {}], got {}",
                Self::MAX_SMOOTHNESS,
                self.smoothness
            )));
        }
        if !(1..=Self::MAX_DOWNSAMPLE).contains(&self.downsample) {
            return Err(PipelineError::InvalidConfig(format!(
                "downsample must be in [1, {}], got {}",
                Self::MAX_DOWNSAMPLE,
                self.downsample
            )));
        }
        if self.max_workers == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "max_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Star mask binarization threshold, `10^-sensitivity`.
    #[must_use]
    pub fn star_threshold(&self) -> f64 {
        10f64.powf(-f64::from(self.star_detection_sensitivity))
    }

    /// Diameter of the disk used to dilate detected stars.
    #[must_use]
    pub fn dilation_diameter(&self) -> usize {
        2 * usize::from(self.star_diffusion_distance) + 3
    }

    /// Width parameter of the background smoothing kernel.
    #[must_use]
    pub fn smoothing_sigma(&self) -> f64 {
        Self::SMOOTHNESS_BASE.powf(f64::from(self.smoothness))
    }
}

impl Default for DustFreeConfig {
    fn default() -> Self {
        Self {
            star_detection_sensitivity: Self::DEFAULT_STAR_DETECTION_SENSITIVITY,
            star_diffusion_distance: Self::DEFAULT_STAR_DIFFUSION_DISTANCE,
            smoothness: Self::DEFAULT_SMOOTHNESS,
            downsample: Self::DEFAULT_DOWNSAMPLE,
            test_sky_detection: false,
            ray_jitter: false,
            max_workers: None,
        }
    }
}

/// What a pipeline run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconstructResult<T> {
    /// The target image was replaced by its dust-corrected version.
    Restored,
    /// Test mode: the working-resolution background with stars zeroed.
    /// The target image is left untouched.
    SkyDetection(Image<T>),
}

impl<T> ReconstructResult<T> {
    /// The test-mode background, if this run produced one.
    #[must_use]
    pub fn into_sky_detection(self) -> Option<Image<T>> {
        match self {
            Self::Restored => None,
            Self::SkyDetection(image) => Some(image),
        }
    }

    /// Returns `true` for the test-mode variant.
    #[must_use]
    pub const fn is_sky_detection(&self) -> bool {
        matches!(self, Self::SkyDetection(_))
    }
}

/// Errors that can occur during a reconstruction run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The target image is not float-sampled.
    #[error("unsupported sample format {0}: only float images can be processed")]
    UnsupportedSampleFormat(String),

    /// No dust mask was supplied.
    #[error("no dust mask selected")]
    MissingDustMask,

    /// The dust mask channel count cannot be reconciled with the image.
    #[error(
        "dust mask has {mask} channels but the image being processed has {image}"
    )]
    MaskChannelMismatch {
        /// Channels in the dust mask.
        mask: usize,
        /// Channels in the working image.
        image: usize,
    },

    /// An inpainting worker failed; carries the first failure by worker index.
    #[error("worker {worker} failed: {message}")]
    Worker {
        /// Index of the failing worker.
        worker: usize,
        /// The worker's error message.
        message: String,
    },

    /// The input image has no pixels.
    #[error("image has no pixels")]
    EmptyImage,

    /// Two buffers that must share a shape do not.
    #[error("buffer shape mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Shape of the reference buffer.
        expected: Dimensions,
        /// Shape of the offending buffer.
        actual: Dimensions,
    },

    /// A sample vector does not match the declared shape.
    #[error("sample buffer holds {actual} samples, expected {expected}")]
    BufferLength {
        /// Samples implied by the shape.
        expected: usize,
        /// Samples actually supplied.
        actual: usize,
    },

    /// A configuration parameter is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The inpainting worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// The run was cancelled through the abort signal.
    #[error("processing aborted")]
    Aborted,
}
