//! Multiscale linear decomposition (a trous B3-spline wavelet).
//!
//! A plane is split into `n` detail layers plus one residual layer.
//! Layer 0 holds the finest structures (noise, single pixels), layer `n`
//! the smooth large-scale component. Summing every layer gives back the
//! input; disabling layers before [`MultiscaleTransform::reconstruct`]
//! acts as a band-pass filter.

use rayon::prelude::*;

use crate::convolution::mirror;
use crate::types::Sample;

/// B3-spline scaling function taps.
const B3: [f64; 5] = [1.0 / 16.0, 1.0 / 4.0, 3.0 / 8.0, 1.0 / 4.0, 1.0 / 16.0];

/// Layered decomposition of a single-channel plane.
#[derive(Debug, Clone)]
pub struct MultiscaleTransform {
    width: usize,
    height: usize,
    layers: Vec<Vec<f64>>,
    enabled: Vec<bool>,
}

impl MultiscaleTransform {
    /// Decompose `plane` into `detail_layers` detail layers and a residual.
    #[must_use]
    pub fn decompose<T: Sample>(
        plane: &[T],
        width: usize,
        height: usize,
        detail_layers: usize,
    ) -> Self {
        let mut current: Vec<f64> = plane.iter().map(|v| v.to_f64_c()).collect();
        let mut layers = Vec::with_capacity(detail_layers + 1);
        for level in 0..detail_layers {
            let smoothed = smooth_a_trous(&current, width, height, 1 << level);
            let detail = current.iter().zip(&smoothed).map(|(a, b)| a - b).collect();
            layers.push(detail);
            current = smoothed;
        }
        layers.push(current);
        let enabled = vec![true; layers.len()];
        Self {
            width,
            height,
            layers,
            enabled,
        }
    }

    /// Total number of layers, detail layers plus the residual.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Samples of layer `index`, if it exists.
    #[must_use]
    pub fn layer(&self, index: usize) -> Option<&[f64]> {
        self.layers.get(index).map(Vec::as_slice)
    }

    /// Exclude layer `index` from reconstruction. Out-of-range indices are ignored.
    pub fn disable_layer(&mut self, index: usize) {
        if let Some(flag) = self.enabled.get_mut(index) {
            *flag = false;
        }
    }

    /// Whether layer `index` takes part in reconstruction.
    #[must_use]
    pub fn is_enabled(&self, index: usize) -> bool {
        self.enabled.get(index).copied().unwrap_or(false)
    }

    /// Sum the enabled layers back into a plane.
    #[must_use]
    pub fn reconstruct<T: Sample>(&self) -> Vec<T> {
        let mut sum = vec![0.0; self.width * self.height];
        for (layer, _) in self
            .layers
            .iter()
            .zip(&self.enabled)
            .filter(|(_, enabled)| **enabled)
        {
            for (acc, v) in sum.iter_mut().zip(layer) {
                *acc += v;
            }
        }
        sum.into_iter().map(T::from_f64_c).collect()
    }
}

/// Separable B3-spline smoothing with holes of `step` pixels between taps.
#[allow(clippy::cast_possible_wrap)]
fn smooth_a_trous(input: &[f64], width: usize, height: usize, step: usize) -> Vec<f64> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let step = step as isize;
    let mut horizontal = vec![0.0; input.len()];
    horizontal
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let src = &input[y * width..(y + 1) * width];
            for (x, out) in row.iter_mut().enumerate() {
                *out = B3
                    .iter()
                    .enumerate()
                    .map(|(k, tap)| {
                        let offset = (k as isize - 2) * step;
                        tap * src[mirror(x as isize + offset, width)]
                    })
                    .sum();
            }
        });

    let mut output = vec![0.0; input.len()];
    output
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                *out = B3
                    .iter()
                    .enumerate()
                    .map(|(k, tap)| {
                        let offset = (k as isize - 2) * step;
                        tap * horizontal[mirror(y as isize + offset, height) * width + x]
                    })
                    .sum();
            }
        });
    output
}
