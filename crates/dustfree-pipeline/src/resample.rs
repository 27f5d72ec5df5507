//! Resolution changes between full and working resolution.
//!
//! Reduction uses block averaging by an integer factor. Arbitrary
//! resizing (the dust mask to working resolution, the backgrounds back
//! to full resolution) uses separable cubic B-spline interpolation with
//! clamped edges.

use rayon::prelude::*;

use crate::types::{Image, Sample};

/// Working dimensions after reducing `width x height` by `factor`,
/// rounding up so partial edge blocks are kept.
#[must_use]
pub const fn reduced_size(width: usize, height: usize, factor: usize) -> (usize, usize) {
    if factor <= 1 {
        return (width, height);
    }
    (width.div_ceil(factor), height.div_ceil(factor))
}

/// Reduce `image` by an integer `factor`, averaging each `factor x factor`
/// block. Edge blocks average only the pixels they cover.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downsample_integer<T: Sample>(image: &Image<T>, factor: usize) -> Image<T> {
    if factor <= 1 {
        return image.clone();
    }
    let (w, h) = (image.width(), image.height());
    let (rw, rh) = reduced_size(w, h, factor);
    let mut output = Image::zeros(rw, rh, image.channels());
    if rw == 0 {
        return output;
    }
    for c in 0..image.channels() {
        let src = image.plane(c);
        output
            .plane_mut(c)
            .par_chunks_mut(rw)
            .enumerate()
            .for_each(|(ry, row)| {
                let ys = ry * factor..((ry + 1) * factor).min(h);
                for (rx, out) in row.iter_mut().enumerate() {
                    let xs = rx * factor..((rx + 1) * factor).min(w);
                    let count = ys.len() * xs.len();
                    let sum: f64 = ys
                        .clone()
                        .flat_map(|y| xs.clone().map(move |x| y * w + x))
                        .map(|i| src[i].to_f64_c())
                        .sum();
                    *out = T::from_f64_c(sum / count as f64);
                }
            });
    }
    output
}

/// Cubic B-spline basis evaluated at distance `d`.
fn bspline(d: f64) -> f64 {
    let d = d.abs();
    if d < 1.0 {
        (3.0 * d).mul_add(d * d, 4.0 - 6.0 * d * d) / 6.0
    } else if d < 2.0 {
        let t = 2.0 - d;
        t * t * t / 6.0
    } else {
        0.0
    }
}

/// Precomputed taps mapping each output coordinate to four source samples.
#[derive(Debug, Clone)]
struct AxisTaps {
    indices: Vec<[usize; 4]>,
    weights: Vec<[f64; 4]>,
}

impl AxisTaps {
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss
    )]
    fn new(source: usize, target: usize) -> Self {
        let scale = source as f64 / target as f64;
        let last = source as isize - 1;
        let mut indices = Vec::with_capacity(target);
        let mut weights = Vec::with_capacity(target);
        for i in 0..target {
            let center = (i as f64 + 0.5).mul_add(scale, -0.5);
            let base = center.floor() as isize;
            let mut idx = [0; 4];
            let mut wts = [0.0; 4];
            for k in 0..4 {
                let s = base - 1 + k as isize;
                idx[k] = s.clamp(0, last) as usize;
                wts[k] = bspline(center - s as f64);
            }
            let sum: f64 = wts.iter().sum();
            if sum > 0.0 {
                for w in &mut wts {
                    *w /= sum;
                }
            }
            indices.push(idx);
            weights.push(wts);
        }
        Self { indices, weights }
    }

    fn apply(&self, i: usize, sample: impl Fn(usize) -> f64) -> f64 {
        self.indices[i]
            .iter()
            .zip(&self.weights[i])
            .map(|(&s, w)| w * sample(s))
            .sum()
    }
}

/// Resize `image` to `width x height` with cubic B-spline interpolation.
///
/// Resizing to the current size returns a copy.
#[must_use]
pub fn resample_bspline<T: Sample>(image: &Image<T>, width: usize, height: usize) -> Image<T> {
    let (sw, sh) = (image.width(), image.height());
    if (sw, sh) == (width, height) {
        return image.clone();
    }
    let mut output = Image::zeros(width, height, image.channels());
    if sw == 0 || sh == 0 || width == 0 || height == 0 {
        return output;
    }
    let horizontal = AxisTaps::new(sw, width);
    let vertical = AxisTaps::new(sh, height);

    for c in 0..image.channels() {
        let src = image.plane(c);
        let mut rows = vec![0.0f64; width * sh];
        rows.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            let line = &src[y * sw..(y + 1) * sw];
            for (x, out) in row.iter_mut().enumerate() {
                *out = horizontal.apply(x, |s| line[s].to_f64_c());
            }
        });
        output
            .plane_mut(c)
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    *out = T::from_f64_c(vertical.apply(y, |s| rows[s * width + x]));
                }
            });
    }
    output
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn reduced_size_rounds_up() {
        assert_eq!(reduced_size(100, 51, 2), (50, 26));
        assert_eq!(reduced_size(7, 7, 16), (1, 1));
        assert_eq!(reduced_size(9, 4, 1), (9, 4));
    }

    #[test]
    fn downsample_averages_blocks() {
        let image = Image::<f32>::from_fn(4, 2, 1, |x, _, _| x as f32);
        let reduced = downsample_integer(&image, 2);
        assert_eq!(reduced.width(), 2);
        assert_eq!(reduced.height(), 1);
        assert_eq!(reduced.as_slice(), &[0.5, 2.5]);
    }

    #[test]
    fn downsample_partial_edge_block() {
        let image = Image::<f64>::from_fn(3, 1, 1, |x, _, _| x as f64);
        let reduced = downsample_integer(&image, 2);
        assert_eq!(reduced.as_slice(), &[0.5, 2.0]);
    }

    #[test]
    fn bspline_weights_partition_unity() {
        for frac in [0.0, 0.25, 0.5, 0.9] {
            let sum: f64 = (-2..=2).map(|k| bspline(frac - f64::from(k))).sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn resample_preserves_constant() {
        let image = Image::<f32>::filled(10, 7, 3, 0.25);
        let big = resample_bspline(&image, 23, 15);
        assert_eq!(big.dimensions().channels, 3);
        assert!(big.as_slice().iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn resample_same_size_is_copy() {
        let image = Image::<f32>::from_fn(5, 5, 1, |x, y, _| (x * y) as f32);
        assert_eq!(resample_bspline(&image, 5, 5), image);
    }

    #[test]
    fn resample_stays_within_input_range() {
        let image = Image::<f64>::from_fn(8, 8, 1, |x, _, _| if x < 4 { 0.0 } else { 1.0 });
        let big = resample_bspline(&image, 32, 32);
        let (lo, hi) = big.min_max().unwrap();
        assert!(lo >= -1e-12 && hi <= 1.0 + 1e-12, "{lo} {hi}");
        assert!(big.get(0, 0, 0) < 0.05);
        assert!(big.get(31, 31, 0) > 0.95);
    }

    #[test]
    fn downsample_then_upsample_restores_smooth_field() {
        let image = Image::<f64>::from_fn(64, 48, 1, |x, y, _| {
            0.5 + 0.1 * (x as f64 / 64.0) + 0.05 * (y as f64 / 48.0)
        });
        let small = downsample_integer(&image, 4);
        let back = resample_bspline(&small, 64, 48);
        // Away from the clamped border a B-spline reproduces a linear ramp.
        for y in 12..36 {
            for x in 12..52 {
                assert!((back.get(x, y, 0) - image.get(x, y, 0)).abs() < 2e-3);
            }
        }
    }
}
