//! Separable blending weights for overlap-add reconstruction.
//!
//! Each window's prediction is multiplied by a smooth bump that is highest
//! at the window centre and tapers towards its faces, so overlapping
//! windows cross-fade instead of producing seams.

use std::f64::consts::TAU;

use ndarray::{Array3, ArrayView3};

/// Shape parameter of the generalized Hamming curve.
///
/// 0.54 is the classic Hamming window; 0.75 keeps the edges at half the
/// peak so every voxel of a window contributes.
pub const HAMMING_ALPHA: f64 = 0.75;

/// Symmetric generalized Hamming window of length `m`.
///
/// `w(n) = alpha - (1 - alpha) * cos(2 * pi * n / (m - 1))`. A length-1
/// window is `[1.0]`.
#[must_use]
pub fn general_hamming(m: usize, alpha: f64) -> Vec<f64> {
    match m {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            #[allow(clippy::cast_precision_loss)]
            let denom = (m - 1) as f64;
            (0..m)
                .map(|n| {
                    #[allow(clippy::cast_precision_loss)]
                    let phase = TAU * n as f64 / denom;
                    (1.0 - alpha).mul_add(-phase.cos(), alpha)
                })
                .collect()
        }
    }
}

/// Peak-normalized 3-D blending weights shaped like one window.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendKernel {
    weights: Array3<f32>,
}

impl BlendKernel {
    /// Build the kernel for a window of extent `size`.
    ///
    /// The outer product of one Hamming curve per axis, divided by its
    /// maximum so the peak is exactly 1.
    #[must_use]
    pub fn new(size: [usize; 3]) -> Self {
        let [wz, wx, wy] = size.map(|m| general_hamming(m, HAMMING_ALPHA));
        let raw = Array3::from_shape_fn((size[0], size[1], size[2]), |(z, x, y)| {
            wz[z] * wx[x] * wy[y]
        });
        let peak = raw.iter().copied().fold(0.0_f64, f64::max);
        #[allow(clippy::cast_possible_truncation)]
        let weights = raw.mapv(|v| if peak > 0.0 { (v / peak) as f32 } else { 0.0 });
        Self { weights }
    }

    /// Kernel extent.
    #[must_use]
    pub fn size(&self) -> [usize; 3] {
        let (z, x, y) = self.weights.dim();
        [z, x, y]
    }

    /// Weight volume.
    #[must_use]
    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.weights.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_endpoints_and_centre() {
        let w = general_hamming(5, HAMMING_ALPHA);
        assert!((w[0] - 0.5).abs() < 1e-12);
        assert!((w[4] - 0.5).abs() < 1e-12);
        assert!((w[2] - 1.0).abs() < 1e-12);
        assert!((w[1] - w[3]).abs() < 1e-12);
    }

    #[test]
    fn hamming_degenerate_lengths() {
        assert!(general_hamming(0, HAMMING_ALPHA).is_empty());
        assert_eq!(general_hamming(1, HAMMING_ALPHA), vec![1.0]);
    }

    #[test]
    fn kernel_peak_is_one() {
        for size in [[4, 4, 4], [5, 5, 5], [8, 3, 6]] {
            let kernel = BlendKernel::new(size);
            let peak = kernel.view().iter().copied().fold(0.0_f32, f32::max);
            assert!((peak - 1.0).abs() < 1e-6, "{size:?}");
        }
    }

    #[test]
    fn kernel_is_strictly_positive() {
        let kernel = BlendKernel::new([16, 16, 16]);
        let min = kernel.view().iter().copied().fold(f32::INFINITY, f32::min);
        assert!(min > 0.0);
        assert!(min >= 0.125 - 1e-6);
    }

    #[test]
    fn kernel_is_symmetric() {
        let kernel = BlendKernel::new([6, 7, 6]);
        let w = kernel.view();
        assert!((w[[0, 0, 0]] - w[[5, 6, 5]]).abs() < 1e-6);
        assert!((w[[1, 2, 3]] - w[[4, 4, 2]]).abs() < 1e-6);
    }

    #[test]
    fn kernel_shape_matches_window() {
        assert_eq!(BlendKernel::new([3, 1, 2]).size(), [3, 1, 2]);
    }

    #[test]
    fn two_voxel_axis_is_flat() {
        let kernel = BlendKernel::new([2, 2, 2]);
        assert!(kernel.view().iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }
}
