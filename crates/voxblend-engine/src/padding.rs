//! Virtual reflect padding around the source volume.
//!
//! Windows must tile the padded volume exactly and every original voxel
//! needs at least half a window of context on each side, so each axis is
//! padded asymmetrically. The padded volume is never materialized: padded
//! coordinates are mapped back into the source with [`reflect_index`].

use serde::{Deserialize, Serialize};

use crate::types::WindowSpec;

/// Padding applied to one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisPadding {
    /// Voxels added before the first original voxel.
    pub before: usize,
    /// Voxels added after the last original voxel.
    pub after: usize,
}

impl AxisPadding {
    /// Plan the padding of one axis.
    ///
    /// `stride` must be non-zero.
    ///
    /// The window grid is first aligned to cover `original`, then the
    /// half-window minimum is enforced on both sides, and finally `after`
    /// is extended until the padded extent lies on the stride grid again.
    #[must_use]
    pub fn plan(original: usize, size: usize, stride: usize) -> Self {
        let target = if original <= size {
            size
        } else {
            size + (original - size).div_ceil(stride) * stride
        };
        let total = target - original;
        let half = size / 2;

        let before = half.max(total / 2);
        let mut after = total.saturating_sub(before).max(half);

        let excess = (original + before + after).saturating_sub(size);
        after += (stride - excess % stride) % stride;

        Self { before, after }
    }

    /// Total voxels added on this axis.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.before + self.after
    }
}

/// Reflect padding for a `(Z, X, Y)` volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaddingPlan {
    original: [usize; 3],
    axes: [AxisPadding; 3],
}

impl PaddingPlan {
    /// Plan padding for a volume of extent `original` under `window`.
    ///
    /// `window` must already be validated.
    #[must_use]
    pub fn new(original: [usize; 3], window: &WindowSpec) -> Self {
        let stride = window.stride();
        let axes = [0, 1, 2].map(|axis| {
            AxisPadding::plan(original[axis], window.size[axis], stride[axis])
        });
        Self { original, axes }
    }

    /// Extent of the unpadded volume.
    #[must_use]
    pub const fn original_shape(&self) -> [usize; 3] {
        self.original
    }

    /// Per-axis padding.
    #[must_use]
    pub const fn axes(&self) -> &[AxisPadding; 3] {
        &self.axes
    }

    /// Padding before the first original voxel, per axis.
    #[must_use]
    pub const fn before(&self) -> [usize; 3] {
        [
            self.axes[0].before,
            self.axes[1].before,
            self.axes[2].before,
        ]
    }

    /// Extent of the (virtual) padded volume.
    #[must_use]
    pub const fn padded_shape(&self) -> [usize; 3] {
        [
            self.original[0] + self.axes[0].total(),
            self.original[1] + self.axes[1].total(),
            self.original[2] + self.axes[2].total(),
        ]
    }

    /// Source coordinate that supplies padded coordinate `padded` on `axis`.
    #[must_use]
    pub fn source_index(&self, axis: usize, padded: usize) -> usize {
        let before = self.axes[axis].before;
        let distance = padded.abs_diff(before);
        reflect_index(distance, self.original[axis])
    }

    /// Original coordinate of `padded` on `axis`, or `None` when it lies
    /// in the padding.
    #[must_use]
    pub fn to_original(&self, axis: usize, padded: usize) -> Option<usize> {
        padded
            .checked_sub(self.axes[axis].before)
            .filter(|&index| index < self.original[axis])
    }
}

/// Fold a distance from the first voxel into `0..n` by mirroring without
/// repeating the edge voxel (numpy `reflect` mode).
///
/// Reflection is symmetric, so a coordinate `k` voxels before the start
/// maps to the same voxel as one `k` voxels after it. Pads longer than the
/// axis keep mirroring back and forth. A single-voxel axis always maps to 0.
#[must_use]
pub const fn reflect_index(distance: usize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let m = distance % period;
    if m >= n { period - m } else { m }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covered(original: usize, size: usize, stride: usize) -> bool {
        let pad = AxisPadding::plan(original, size, stride);
        let padded = original + pad.total();
        let mut hit = vec![false; padded];
        let mut origin = 0;
        while origin + size <= padded {
            hit[origin..origin + size].iter_mut().for_each(|h| *h = true);
            origin += stride;
        }
        hit[pad.before..pad.before + original].iter().all(|&h| h)
    }

    #[test]
    fn scenario_hundred_cube_window_64_overlap_16() {
        let plan = PaddingPlan::new([100; 3], &WindowSpec::isotropic(64, 16));
        for axis in plan.axes() {
            assert!(axis.before >= 32);
            assert!(axis.after >= 32);
        }
        let padded = plan.padded_shape();
        assert_eq!(padded, [208; 3]);
        assert_eq!((padded[0] - 64) % 48, 0);
    }

    #[test]
    fn aligned_extent_still_gets_half_window() {
        // 64 + 2 * 32 is already on the grid for window 64 / stride 32.
        let pad = AxisPadding::plan(128, 64, 32);
        assert!(pad.before >= 32);
        assert!(pad.after >= 32);
        assert_eq!((128 + pad.total() - 64) % 32, 0);
    }

    #[test]
    fn extent_smaller_than_window() {
        let pad = AxisPadding::plan(10, 64, 32);
        assert_eq!(pad.before, 32);
        assert!(pad.after >= 32);
        assert_eq!((10 + pad.total() - 64) % 32, 0);
    }

    #[test]
    fn half_window_clamp_keeps_grid_alignment() {
        // Without realignment the last 8 voxels would be uncovered.
        let pad = AxisPadding::plan(88, 64, 48);
        assert_eq!((88 + pad.total() - 64) % 48, 0);
        assert!(covered(88, 64, 48));
    }

    #[test]
    fn padding_invariants_hold_across_extents() {
        for size in [1, 2, 3, 5, 8, 16, 17] {
            for overlap in 0..size {
                let stride = size - overlap;
                for original in 1..60 {
                    let pad = AxisPadding::plan(original, size, stride);
                    assert!(pad.before >= size / 2, "{original} {size} {stride}");
                    assert!(pad.after >= size / 2, "{original} {size} {stride}");
                    let excess = original + pad.total() - size;
                    assert_eq!(excess % stride, 0, "{original} {size} {stride}");
                    assert!(covered(original, size, stride), "{original} {size} {stride}");
                }
            }
        }
    }

    #[test]
    fn reflect_matches_numpy_reflect() {
        // np.pad(np.arange(4), 6, mode="reflect")
        let expected = [0, 1, 2, 3, 2, 1, 0, 1, 2, 3, 2, 1, 0, 1, 2, 3];
        let before = 6;
        let plan = PaddingPlan {
            original: [4, 1, 1],
            axes: [
                AxisPadding { before, after: 6 },
                AxisPadding { before: 0, after: 0 },
                AxisPadding { before: 0, after: 0 },
            ],
        };
        let mapped: Vec<usize> = (0..16).map(|p| plan.source_index(0, p)).collect();
        assert_eq!(mapped, expected);
    }

    #[test]
    fn reflect_single_voxel_axis_replicates() {
        assert_eq!(reflect_index(0, 1), 0);
        assert_eq!(reflect_index(17, 1), 0);
    }

    #[test]
    fn to_original_excludes_padding() {
        let plan = PaddingPlan::new([10, 10, 10], &WindowSpec::isotropic(8, 4));
        let before = plan.before()[0];
        assert_eq!(plan.to_original(0, before - 1), None);
        assert_eq!(plan.to_original(0, before), Some(0));
        assert_eq!(plan.to_original(0, before + 9), Some(9));
        assert_eq!(plan.to_original(0, before + 10), None);
    }
}
