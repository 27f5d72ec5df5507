//! Sky mask construction.
//!
//! Stars are isolated with a wavelet band-pass (dropping the finest
//! layer, which is mostly noise, and the residual, which is the smooth
//! background), cleaned with a median filter, thresholded, grown by a
//! protection radius and inverted. The result is 1 on sky background and
//! 0 on and around stars.

use crate::morphology::{self, MorphOp, StructuringElement};
use crate::types::{DustFreeConfig, Image, Sample};
use crate::wavelet::MultiscaleTransform;

/// Detail layers in the star detection transform.
pub const DETECTION_LAYERS: usize = 4;

/// Side of the box median applied to the band-passed image.
const MEDIAN_SIZE: usize = 3;

/// Builds binary sky masks from a working-resolution image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StarMaskBuilder {
    sensitivity: f32,
    diffusion: u8,
}

impl StarMaskBuilder {
    /// Builder with explicit sensitivity and diffusion distance.
    #[must_use]
    pub const fn new(sensitivity: f32, diffusion: u8) -> Self {
        Self {
            sensitivity,
            diffusion,
        }
    }

    /// Builder using the star parameters of `config`.
    #[must_use]
    pub const fn from_config(config: &DustFreeConfig) -> Self {
        Self::new(
            config.star_detection_sensitivity,
            config.star_diffusion_distance,
        )
    }

    /// Binarization threshold, `10^-sensitivity`.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        10f64.powf(-f64::from(self.sensitivity))
    }

    /// Diameter of the protection disk, `2 * diffusion + 3`.
    #[must_use]
    pub fn dilation_diameter(&self) -> usize {
        2 * usize::from(self.diffusion) + 3
    }

    /// Band-passed, clamped and normalized star signal before thresholding.
    #[must_use]
    pub fn star_signal<T: Sample>(&self, working: &Image<T>) -> Image<T> {
        let (w, h) = (working.width(), working.height());
        let mut signal = Image::zeros(w, h, working.channels());
        for c in 0..working.channels() {
            let mut transform =
                MultiscaleTransform::decompose(working.plane(c), w, h, DETECTION_LAYERS);
            transform.disable_layer(0);
            transform.disable_layer(DETECTION_LAYERS);
            signal
                .plane_mut(c)
                .copy_from_slice(&transform.reconstruct::<T>());
        }
        signal.truncate(T::zero(), T::one());
        signal.normalize();
        signal
    }

    /// Build the sky mask: 1 on background, 0 on protected star pixels.
    #[must_use]
    pub fn build<T: Sample>(&self, working: &Image<T>) -> Image<T> {
        let signal = self.star_signal(working);
        let mut mask = morphology::apply(
            &signal,
            StructuringElement::Box { size: MEDIAN_SIZE },
            MorphOp::Median,
        );
        mask.binarize(T::from_f64_c(self.threshold()));
        let mut mask = morphology::apply(
            &mask,
            StructuringElement::Circular {
                diameter: self.dilation_diameter(),
            },
            MorphOp::Dilation,
        );
        mask.invert();
        tracing::debug!(
            star_pixels = mask.count_where(|v| v < T::one()),
            threshold = self.threshold(),
            diameter = self.dilation_diameter(),
            "sky mask built"
        );
        mask
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn star_field(width: usize, height: usize, stars: &[(f64, f64)]) -> Image<f64> {
        Image::from_fn(width, height, 1, |x, y, _| {
            let mut v = 0.125;
            for &(sx, sy) in stars {
                let d2 = (x as f64 - sx).powi(2) + (y as f64 - sy).powi(2);
                v += 0.75 * (-d2 / (2.0 * 1.5 * 1.5)).exp();
            }
            v
        })
    }

    fn textured(width: usize, height: usize) -> Image<f32> {
        Image::from_fn(width, height, 1, |x, y, _| {
            let h = (x * 7919 + y * 104_729) % 1009;
            0.2 + 0.3 * h as f32 / 1009.0
        })
    }

    #[test]
    fn derived_parameters_follow_config() {
        let builder = StarMaskBuilder::from_config(&DustFreeConfig::default());
        assert!((builder.threshold() - 1e-4).abs() < 1e-15);
        assert_eq!(builder.dilation_diameter(), 13);
    }

    #[test]
    fn mask_is_binary() {
        let builder = StarMaskBuilder::from_config(&DustFreeConfig::default());
        let mask = builder.build(&textured(40, 30));
        assert!(mask.as_slice().iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn star_is_masked_and_far_sky_is_kept() {
        let image = star_field(64, 64, &[(32.0, 32.0)]);
        let mask = StarMaskBuilder::new(4.0, 2).build(&image);
        assert_eq!(mask.get(32, 32, 0), 0.0);
        assert_eq!(mask.get(1, 1, 0), 1.0);
        assert_eq!(mask.get(62, 62, 0), 1.0);
    }

    #[test]
    fn flat_image_has_no_stars() {
        let image = Image::<f64>::filled(32, 32, 2, 0.5);
        let mask = StarMaskBuilder::from_config(&DustFreeConfig::default()).build(&image);
        assert!(mask.as_slice().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn higher_sensitivity_never_masks_fewer_pixels() {
        let image = textured(48, 48);
        let mut previous = 0;
        for sensitivity in [0.0, 1.0, 2.0, 4.0, 6.0] {
            let mask = StarMaskBuilder::new(sensitivity, 1).build(&image);
            let stars = mask.count_where(|v| v == 0.0);
            assert!(
                stars >= previous,
                "sensitivity {sensitivity}: {stars} < {previous}"
            );
            previous = stars;
        }
    }

    #[test]
    fn diffusion_grows_protected_area() {
        let image = star_field(96, 96, &[(48.0, 48.0)]);
        let tight = StarMaskBuilder::new(2.0, 0).build(&image);
        let wide = StarMaskBuilder::new(2.0, 10).build(&image);
        let tight_stars = tight.count_where(|v| v == 0.0);
        let wide_stars = wide.count_where(|v| v == 0.0);
        assert!(tight_stars > 0);
        assert!(wide_stars > tight_stars);
    }

    #[test]
    fn channels_are_masked_independently() {
        let star = star_field(48, 48, &[(24.0, 24.0)]);
        let image = Image::from_fn(48, 48, 2, |x, y, c| {
            if c == 0 { star.get(x, y, 0) } else { 0.125 }
        });
        let mask = StarMaskBuilder::new(4.0, 1).build(&image);
        assert_eq!(mask.get(24, 24, 0), 0.0);
        assert_eq!(mask.get(24, 24, 1), 1.0);
    }
}
