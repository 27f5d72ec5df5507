//! Directional-ray inpainting of hole pixels.
//!
//! Every hole pixel (sample `<= 0` or non-finite) is replaced by a
//! weighted average of the nearest valid sample along each of
//! [`RAY_COUNT`] equally spaced rays. A sample found at radius `j` has
//! weight `1 / j`. Valid pixels are copied through unchanged.
//!
//! Pixels are independent of each other, so rows of each channel are
//! split across workers with [`crate::parallel::dispatch_rows`].

use std::f32::consts::TAU;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::monitor::Monitor;
use crate::parallel;
use crate::types::{Image, PipelineError, Sample};

/// Number of rays cast from each hole pixel.
pub const RAY_COUNT: usize = 32;

/// Radii below this are sampled by even rays only.
const NEAR_FIELD_RADIUS: usize = 64;

/// Radii below this advance by one pixel, above it geometrically.
const UNIT_STEP_LIMIT: usize = 16;

const RADIUS_GROWTH: f32 = 1.1;

/// A candidate is skipped once its weight drops below this fraction of
/// the weight already accumulated for the pixel.
const WEIGHT_CUTOFF: f32 = 0.01;

const JITTER_SCALE: f32 = 6.0;

/// Options shared by every row of an inpainting pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InpaintOptions {
    /// Perturb ray sample positions with a per-row seeded generator.
    pub jitter: bool,
    /// Maximum number of workers per channel.
    pub workers: usize,
}

impl Default for InpaintOptions {
    fn default() -> Self {
        Self {
            jitter: false,
            workers: parallel::available_workers(None),
        }
    }
}

/// Unit direction vectors of the rays.
#[derive(Debug, Clone)]
struct Rays([(f32, f32); RAY_COUNT]);

impl Rays {
    #[allow(clippy::cast_precision_loss)]
    fn new() -> Self {
        Self(std::array::from_fn(|i| {
            let angle = TAU * i as f32 / RAY_COUNT as f32;
            (angle.cos(), angle.sin())
        }))
    }
}

/// Radii visited along each ray, in marching order: `1, 2, ..., 16`,
/// then `j = floor(j * 1.1)` while `j < limit`.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn march_radii(limit: usize) -> Vec<usize> {
    let mut radii = Vec::new();
    let mut j = 1;
    while j < limit {
        radii.push(j);
        j = if j < UNIT_STEP_LIMIT {
            j + 1
        } else {
            (j as f32 * RADIUS_GROWTH) as usize
        };
    }
    radii
}

/// Round `v` to the nearest pixel index and clamp it to `[0, len)`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_index(v: f32, len: usize) -> usize {
    let rounded = (v + 0.5).floor();
    if rounded <= 0.0 {
        0
    } else {
        (rounded as usize).min(len - 1)
    }
}

/// Inpaint every channel of `source`, returning a new image.
///
/// # Errors
///
/// Propagates the first worker failure of any channel, see
/// [`parallel::dispatch_rows`].
pub fn inpaint<T: Sample>(
    source: &Image<T>,
    options: &InpaintOptions,
    monitor: &Monitor,
) -> Result<Image<T>, PipelineError> {
    let mut output = Image::zeros(source.width(), source.height(), source.channels());
    for channel in 0..source.channels() {
        inpaint_channel(source, channel, output.plane_mut(channel), options, monitor)?;
    }
    Ok(output)
}

/// Inpaint one channel of `source` into `destination`.
///
/// `destination` must be a plane of `source`'s size. It is only written
/// when every worker succeeds.
///
/// # Errors
///
/// Propagates the first worker failure, see [`parallel::dispatch_rows`].
pub fn inpaint_channel<T: Sample>(
    source: &Image<T>,
    channel: usize,
    destination: &mut [T],
    options: &InpaintOptions,
    monitor: &Monitor,
) -> Result<(), PipelineError> {
    let dims = source.dimensions();
    if destination.len() != dims.plane_len() {
        return Err(PipelineError::BufferLength {
            expected: dims.plane_len(),
            actual: destination.len(),
        });
    }
    let plane = source.plane(channel);
    let rays = Rays::new();
    let radii = march_radii(dims.width.max(dims.height));
    monitor.initialize("inpainting", dims.plane_len() as u64);

    parallel::dispatch_rows(
        destination,
        dims.width,
        channel,
        options.workers,
        monitor,
        |y, row| {
            let ctx = RowContext {
                plane,
                width: dims.width,
                height: dims.height,
                channel,
                y,
                rays: &rays,
                radii: &radii,
            };
            ctx.fill(row, options.jitter);
            Ok(())
        },
    )
}

struct RowContext<'a, T> {
    plane: &'a [T],
    width: usize,
    height: usize,
    channel: usize,
    y: usize,
    rays: &'a Rays,
    radii: &'a [usize],
}

impl<T: Sample> RowContext<'_, T> {
    fn fill(&self, out: &mut [T], jitter: bool) {
        let seed = (self.height * self.channel + self.y) as u64;
        let mut rng = jitter.then(|| ChaCha8Rng::seed_from_u64(seed));
        let row = &self.plane[self.y * self.width..(self.y + 1) * self.width];

        for (x, (slot, &sample)) in out.iter_mut().zip(row).enumerate() {
            *slot = if is_valid(sample) {
                sample
            } else {
                self.reconstruct(x, rng.as_mut())
            };
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::suboptimal_flops)]
    fn reconstruct(&self, x: usize, mut rng: Option<&mut ChaCha8Rng>) -> T {
        let cutoff = T::from_f32_c(WEIGHT_CUTOFF);
        let mut sum = T::zero();
        let mut norm = T::zero();
        let (px, py) = (x as f32, self.y as f32);

        for (i, &(dx, dy)) in self.rays.0.iter().enumerate() {
            for &j in self.radii {
                if j < NEAR_FIELD_RADIUS && i % 2 != 0 {
                    continue;
                }
                let weight = T::one() / T::from_f32_c(j as f32);
                if weight < norm * cutoff {
                    // Weights only shrink along the ray.
                    break;
                }
                let (jx, jy) = rng.as_deref_mut().map_or((0.0, 0.0), |rng| {
                    let spread = j as f32 * JITTER_SCALE / RAY_COUNT as f32;
                    (
                        rng.random_range(-0.5f32..0.5) * spread,
                        rng.random_range(-0.5f32..0.5) * spread,
                    )
                });
                let ix = clamp_index(px + dx * j as f32 + jx, self.width);
                let iy = clamp_index(py + dy * j as f32 + jy, self.height);
                let candidate = self.plane[iy * self.width + ix];
                if is_valid(candidate) {
                    sum = sum + candidate * weight;
                    norm = norm + weight;
                    break;
                }
            }
        }

        if norm > T::zero() { sum / norm } else { T::zero() }
    }
}

/// A sample is usable when it is finite and positive; everything else,
/// NaN included, is a hole.
fn is_valid<T: Sample>(sample: T) -> bool {
    sample.is_finite() && sample > T::zero()
}
