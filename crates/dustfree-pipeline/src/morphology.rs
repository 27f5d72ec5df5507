//! Morphological filters over single-channel planes.
//!
//! A [`StructuringElement`] defines the neighbourhood; [`MorphOp`] picks
//! the operator applied to it. Neighbourhoods are clipped at the image
//! border, so edge pixels see fewer samples rather than padded ones.
//! Rows are processed in parallel.

use rayon::prelude::*;

use crate::types::{Image, Sample};

/// Shape of the neighbourhood a morphological operator reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuringElement {
    /// Square of side `size` (odd sizes center exactly).
    Box {
        /// Side length in pixels.
        size: usize,
    },
    /// Disk of the given diameter.
    Circular {
        /// Diameter in pixels.
        diameter: usize,
    },
}

impl StructuringElement {
    /// Pixel offsets `(dx, dy)` covered by the element, relative to its center.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
    pub fn offsets(&self) -> Vec<(isize, isize)> {
        match *self {
            Self::Box { size } => {
                let r = (size / 2) as isize;
                (-r..=r)
                    .flat_map(|dy| (-r..=r).map(move |dx| (dx, dy)))
                    .collect()
            }
            Self::Circular { diameter } => {
                let r = (diameter / 2) as isize;
                let radius = diameter as f64 / 2.0;
                let radius_sq = radius * radius;
                (-r..=r)
                    .flat_map(|dy| (-r..=r).map(move |dx| (dx, dy)))
                    .filter(|&(dx, dy)| ((dx * dx + dy * dy) as f64) <= radius_sq)
                    .collect()
            }
        }
    }
}

/// Operator applied over the structuring element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorphOp {
    /// Median of the neighbourhood.
    Median,
    /// Maximum of the neighbourhood.
    Dilation,
}

/// Apply `op` over `element` to every channel of `image`.
#[must_use]
pub fn apply<T: Sample>(image: &Image<T>, element: StructuringElement, op: MorphOp) -> Image<T> {
    let (w, h, channels) = (image.width(), image.height(), image.channels());
    let offsets = element.offsets();
    let mut output = Image::zeros(w, h, channels);
    for c in 0..channels {
        filter_plane(image.plane(c), output.plane_mut(c), w, h, &offsets, op);
    }
    output
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn filter_plane<T: Sample>(
    input: &[T],
    output: &mut [T],
    width: usize,
    height: usize,
    offsets: &[(isize, isize)],
    op: MorphOp,
) {
    if width == 0 {
        return;
    }
    output
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let mut window = Vec::with_capacity(offsets.len());
            for (x, out) in row.iter_mut().enumerate() {
                window.clear();
                for &(dx, dy) in offsets {
                    let nx = x as isize + dx;
                    let ny = y as isize + dy;
                    if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                        continue;
                    }
                    window.push(input[ny as usize * width + nx as usize]);
                }
                *out = match op {
                    MorphOp::Median => median(&mut window),
                    MorphOp::Dilation => window
                        .iter()
                        .copied()
                        .fold(T::neg_infinity(), T::max),
                };
            }
        });
}

/// Median of `values`, averaging the two middle elements for even counts.
fn median<T: Sample>(values: &mut [T]) -> T {
    let n = values.len();
    if n == 0 {
        return T::zero();
    }
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / (T::one() + T::one())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn box_offsets() {
        let offsets = StructuringElement::Box { size: 3 }.offsets();
        assert_eq!(offsets.len(), 9);
        assert!(offsets.contains(&(-1, -1)));
        assert!(offsets.contains(&(1, 1)));
    }

    #[test]
    fn small_disk_is_full_square() {
        // Corners of a 3x3 block lie at distance sqrt(2) < 1.5.
        let offsets = StructuringElement::Circular { diameter: 3 }.offsets();
        assert_eq!(offsets.len(), 9);
    }

    #[test]
    fn disk_excludes_corners() {
        let offsets = StructuringElement::Circular { diameter: 7 }.offsets();
        assert!(offsets.contains(&(3, 0)));
        assert!(offsets.contains(&(0, -3)));
        assert!(!offsets.contains(&(3, 3)));
        assert!(offsets.contains(&(2, 2)));
    }

    #[test]
    fn median_removes_isolated_pixel() {
        let mut image = Image::<f32>::zeros(7, 7, 1);
        image.set(3, 3, 0, 1.0);
        let filtered = apply(&image, StructuringElement::Box { size: 3 }, MorphOp::Median);
        assert!(filtered.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn median_keeps_solid_block() {
        let image = Image::<f32>::from_fn(9, 9, 1, |x, y, _| {
            if (2..7).contains(&x) && (2..7).contains(&y) { 1.0 } else { 0.0 }
        });
        let filtered = apply(&image, StructuringElement::Box { size: 3 }, MorphOp::Median);
        assert_eq!(filtered.get(4, 4, 0), 1.0);
        assert_eq!(filtered.get(0, 0, 0), 0.0);
    }

    #[test]
    fn median_even_count_averages_middles() {
        let mut values = [4.0f64, 1.0, 3.0, 2.0];
        assert!((median(&mut values) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn dilation_grows_point_into_disk() {
        let mut image = Image::<f64>::zeros(15, 15, 1);
        image.set(7, 7, 0, 1.0);
        let element = StructuringElement::Circular { diameter: 7 };
        let dilated = apply(&image, element, MorphOp::Dilation);
        assert_eq!(dilated.count_where(|v| v > 0.5), element.offsets().len());
        assert_eq!(dilated.get(10, 7, 0), 1.0);
        assert_eq!(dilated.get(10, 10, 0), 0.0);
    }

    #[test]
    fn filters_are_per_channel() {
        let mut image = Image::<f32>::zeros(5, 5, 2);
        image.set(2, 2, 1, 1.0);
        let dilated = apply(&image, StructuringElement::Box { size: 3 }, MorphOp::Dilation);
        assert!(dilated.plane(0).iter().all(|&v| v == 0.0));
        assert_eq!(dilated.plane(1).iter().filter(|&&v| v == 1.0).count(), 9);
    }
}
