//! Enumeration of window origins over the padded volume.

use serde::{Deserialize, Serialize};

use crate::types::WindowSpec;

/// One window position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Origin in padded coordinates, `(Z, X, Y)`.
    pub origin: [usize; 3],
    /// Grid position of the window along each axis.
    pub index: [usize; 3],
    /// Position of the window in plan order.
    pub ordinal: usize,
}

/// Window origins along each axis of a padded volume.
///
/// Origins are `0, stride, 2 * stride, ...` up to the last origin whose
/// window still fits. Iteration order is z outermost, then x, then y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPlan {
    padded: [usize; 3],
    size: [usize; 3],
    stride: [usize; 3],
    counts: [usize; 3],
}

impl WindowPlan {
    /// Plan windows over a padded volume.
    ///
    /// `window` must already be validated.
    #[must_use]
    pub fn new(padded: [usize; 3], window: &WindowSpec) -> Self {
        let size = window.size;
        let stride = window.stride();
        let counts = [0, 1, 2].map(|axis| {
            if padded[axis] < size[axis] {
                0
            } else {
                (padded[axis] - size[axis]) / stride[axis] + 1
            }
        });
        Self {
            padded,
            size,
            stride,
            counts,
        }
    }

    /// Extent of the padded volume.
    #[must_use]
    pub const fn padded_shape(&self) -> [usize; 3] {
        self.padded
    }

    /// Window extent.
    #[must_use]
    pub const fn window_size(&self) -> [usize; 3] {
        self.size
    }

    /// Step between origins.
    #[must_use]
    pub const fn stride(&self) -> [usize; 3] {
        self.stride
    }

    /// Number of windows along each axis.
    #[must_use]
    pub const fn counts(&self) -> [usize; 3] {
        self.counts
    }

    /// Total number of windows.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.counts[0] * self.counts[1] * self.counts[2]
    }

    /// Whether the plan holds no windows.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Origins along one axis.
    pub fn origins(&self, axis: usize) -> impl Iterator<Item = usize> + use<> {
        let stride = self.stride[axis];
        (0..self.counts[axis]).map(move |i| i * stride)
    }

    /// Whether `window` is the last one of its z-row.
    #[must_use]
    pub const fn ends_row(&self, window: &Window) -> bool {
        window.index[1] + 1 == self.counts[1] && window.index[2] + 1 == self.counts[2]
    }

    /// All windows in plan order.
    pub fn iter(&self) -> impl Iterator<Item = Window> + '_ {
        let [_, nx, ny] = self.counts;
        (0..self.len()).map(move |ordinal| {
            let index = [ordinal / (nx * ny), (ordinal / ny) % nx, ordinal % ny];
            Window {
                origin: [0, 1, 2].map(|axis| index[axis] * self.stride[axis]),
                index,
                ordinal,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::padding::PaddingPlan;

    #[test]
    fn counts_match_padded_extent() {
        let plan = WindowPlan::new([208; 3], &WindowSpec::isotropic(64, 16));
        assert_eq!(plan.counts(), [4; 3]);
        assert_eq!(plan.len(), 64);
        assert_eq!(plan.origins(0).collect::<Vec<_>>(), vec![0, 48, 96, 144]);
    }

    #[test]
    fn last_window_ends_at_padded_edge() {
        for original in [1, 7, 33, 100, 129] {
            let window = WindowSpec::new([16, 12, 9], [4, 6, 0]);
            let padding = PaddingPlan::new([original; 3], &window);
            let plan = WindowPlan::new(padding.padded_shape(), &window);
            for axis in 0..3 {
                let last = plan.origins(axis).last().unwrap_or_default();
                assert_eq!(last + window.size[axis], plan.padded_shape()[axis]);
            }
        }
    }

    #[test]
    fn iteration_order_is_z_then_x_then_y() {
        let plan = WindowPlan::new([6, 6, 6], &WindowSpec::isotropic(4, 2));
        let origins: Vec<[usize; 3]> = plan.iter().map(|w| w.origin).collect();
        assert_eq!(origins.len(), 8);
        assert_eq!(origins[0], [0, 0, 0]);
        assert_eq!(origins[1], [0, 0, 2]);
        assert_eq!(origins[2], [0, 2, 0]);
        assert_eq!(origins[4], [2, 0, 0]);
        assert!(plan.iter().enumerate().all(|(i, w)| w.ordinal == i));
    }

    #[test]
    fn row_ends_are_detected() {
        let plan = WindowPlan::new([6, 6, 6], &WindowSpec::isotropic(4, 2));
        let ends: Vec<usize> = plan
            .iter()
            .filter(|w| plan.ends_row(w))
            .map(|w| w.ordinal)
            .collect();
        assert_eq!(ends, vec![3, 7]);
    }

    #[test]
    fn every_padded_voxel_is_covered() {
        let window = WindowSpec::new([8, 6, 5], [3, 2, 1]);
        let padding = PaddingPlan::new([19, 11, 4], &window);
        let plan = WindowPlan::new(padding.padded_shape(), &window);
        let [pz, px, py] = plan.padded_shape();
        let mut hits = vec![0u32; pz * px * py];
        for w in plan.iter() {
            for z in w.origin[0]..w.origin[0] + 8 {
                for x in w.origin[1]..w.origin[1] + 6 {
                    for y in w.origin[2]..w.origin[2] + 5 {
                        hits[(z * px + x) * py + y] += 1;
                    }
                }
            }
        }
        assert!(hits.iter().all(|&h| h > 0));
    }

    #[test]
    fn volume_smaller_than_window_has_no_windows() {
        let plan = WindowPlan::new([3, 8, 8], &WindowSpec::isotropic(4, 2));
        assert!(plan.is_empty());
    }
}
