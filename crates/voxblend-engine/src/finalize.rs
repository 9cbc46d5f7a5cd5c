//! Slab-wise normalization of the accumulator into the output arrays.

use std::ops::Range;

use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis, Zip};

use crate::accumulate::Accumulator;
use crate::observer::RunObserver;
use crate::padding::PaddingPlan;
use crate::store::{ChunkedArray, ChunkedStore, StoreError};
use crate::types::{EngineError, FOREGROUND, InferenceConfig, LABELS, PROBABILITIES, Stage};

/// Lower bound on the divisor when normalizing by the weight sum.
pub const NORMALIZE_EPSILON: f32 = 1e-8;

/// Divide every class lane of `sum` by its weight, in place.
///
/// Voxels with zero weight become all-zero; their count is returned.
/// With a complete window plan every voxel has positive weight, so a
/// non-zero count indicates a planning bug.
pub fn normalize(sum: &mut Array4<f32>, weights: ArrayView3<'_, f32>) -> u64 {
    let mut zero_weight = 0;
    Zip::from(sum.lanes_mut(Axis(3)))
        .and(&weights)
        .for_each(|mut lane, &w| {
            if w > 0.0 {
                let divisor = w.max(NORMALIZE_EPSILON);
                lane.mapv_inplace(|v| v / divisor);
            } else {
                lane.fill(0.0);
                zero_weight += 1;
            }
        });
    zero_weight
}

/// Index of the highest class score per voxel; ties go to the lowest
/// index.
#[must_use]
pub fn argmax_labels(probs: ArrayView4<'_, f32>) -> Array3<u8> {
    probs.map_axis(Axis(3), |lane| {
        let (best, _) = lane
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, &v)| {
                if v > best_v { (i, v) } else { (best, best_v) }
            });
        u8::try_from(best).unwrap_or(u8::MAX)
    })
}

/// Padded z-ranges of the finalization slabs, clipped to the original
/// extent.
///
/// Slabs are `height` voxels tall in padded space; slabs lying entirely
/// in the padding are skipped.
#[must_use]
pub fn slab_ranges(padding: &PaddingPlan, height: usize) -> Vec<Range<usize>> {
    let start = padding.before()[0];
    let end = start + padding.original_shape()[0];
    let padded = padding.padded_shape()[0];
    (0..padded)
        .step_by(height.max(1))
        .filter_map(|slab| {
            let lo = slab.max(start);
            let hi = (slab + height).min(end);
            (lo < hi).then_some(lo..hi)
        })
        .collect()
}

/// Output arrays being filled by the finalizer.
#[derive(Debug)]
pub struct OutputArrays {
    labels: Option<ChunkedArray<u8>>,
    probabilities: Option<ChunkedArray<f32>>,
    foreground: Option<ChunkedArray<f32>>,
    foreground_channel: usize,
}

impl OutputArrays {
    /// Create the selected outputs in `store`, marked incomplete.
    ///
    /// Existing arrays of the same names are replaced and unselected
    /// outputs from earlier runs are removed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if an array cannot be created or removed.
    pub fn create(
        store: &ChunkedStore,
        shape: [usize; 3],
        config: &InferenceConfig,
    ) -> Result<Self, StoreError> {
        let [wz, wx, wy] = config.window.size;
        let window = [wz, wx, wy];
        let selected = config.outputs;

        let labels = if selected.labels {
            Some(store.create_array(LABELS, &shape, &window)?)
        } else {
            store.remove_array(LABELS)?;
            None
        };
        let probabilities = if selected.probabilities {
            let c = config.n_classes;
            Some(store.create_array(
                PROBABILITIES,
                &[shape[0], shape[1], shape[2], c],
                &[wz, wx, wy, c],
            )?)
        } else {
            store.remove_array(PROBABILITIES)?;
            None
        };
        let foreground = if selected.foreground {
            Some(store.create_array(FOREGROUND, &shape, &window)?)
        } else {
            store.remove_array(FOREGROUND)?;
            None
        };

        Ok(Self {
            labels,
            probabilities,
            foreground,
            foreground_channel: config.foreground_channel,
        })
    }

    /// Write normalized probabilities `(Z, X, Y, C)` starting at original
    /// z coordinate `z`.
    fn write_slab(&mut self, z: usize, probs: ArrayView4<'_, f32>) -> Result<(), StoreError> {
        if let Some(labels) = &mut self.labels {
            let argmax = argmax_labels(probs);
            labels.write_region(&[z, 0, 0], argmax.view().into_dyn())?;
        }
        if let Some(probabilities) = &mut self.probabilities {
            probabilities.write_region(&[z, 0, 0, 0], probs.into_dyn())?;
        }
        if let Some(foreground) = &mut self.foreground {
            let channel = probs.index_axis(Axis(3), self.foreground_channel);
            foreground.write_region(&[z, 0, 0], channel.into_dyn())?;
        }
        Ok(())
    }

    /// Flush every output and flag it complete.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if a chunk or metadata file cannot be
    /// written.
    pub fn mark_complete(&mut self) -> Result<(), StoreError> {
        if let Some(labels) = &mut self.labels {
            labels.set_complete(true)?;
        }
        if let Some(probabilities) = &mut self.probabilities {
            probabilities.set_complete(true)?;
        }
        if let Some(foreground) = &mut self.foreground {
            foreground.set_complete(true)?;
        }
        Ok(())
    }
}

/// Totals from one finalization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FinalizeSummary {
    /// Slabs written.
    pub slabs: usize,
    /// Voxels whose weight sum was zero.
    pub zero_weight_voxels: u64,
}

/// Normalize the accumulator slab by slab into `outputs`.
///
/// Each slab is cropped to the original extent before normalization, so
/// peak memory is one slab of `sum`.
///
/// # Errors
///
/// Returns [`EngineError::Store`] tagged [`Stage::Finalize`] on any read
/// or write failure.
pub fn finalize<O: RunObserver + ?Sized>(
    accumulator: &Accumulator,
    outputs: &mut OutputArrays,
    padding: &PaddingPlan,
    slab_height: usize,
    observer: &mut O,
) -> Result<FinalizeSummary, EngineError> {
    let [z0, bx, by] = padding.before();
    let [_, nx, ny] = padding.original_shape();
    let slabs = slab_ranges(padding, slab_height);
    observer.finalize_started(slabs.len());

    let mut summary = FinalizeSummary::default();
    for (done, slab) in slabs.iter().enumerate() {
        let (mut sum, weights) = accumulator
            .read_block(slab.clone(), bx..bx + nx, by..by + ny)
            .map_err(EngineError::store(Stage::Finalize))?;
        let zero_weight = normalize(&mut sum, weights.view());
        if zero_weight > 0 {
            tracing::warn!(
                z = slab.start - z0,
                voxels = zero_weight,
                "voxels received no window weight; writing zero probabilities"
            );
        }
        summary.zero_weight_voxels += zero_weight;

        outputs
            .write_slab(slab.start - z0, sum.view())
            .map_err(EngineError::store(Stage::Finalize))?;
        summary.slabs += 1;

        tracing::debug!(
            z_start = slab.start - z0,
            z_end = slab.end - z0,
            "slab finalized"
        );
        observer.slab_finalized(done + 1, slabs.len());
    }
    Ok(summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::{Array3, Array4, array};

    use super::*;
    use crate::types::WindowSpec;

    #[test]
    fn normalize_divides_by_weight() {
        let mut sum = Array4::from_elem((1, 1, 2, 2), 3.0_f32);
        let weights = array![[[1.5_f32, 6.0]]];
        let zero = normalize(&mut sum, weights.view());
        assert_eq!(zero, 0);
        assert!((sum[[0, 0, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((sum[[0, 0, 1, 1]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn normalize_zero_weight_writes_zero() {
        let mut sum = Array4::from_elem((1, 1, 2, 3), 5.0_f32);
        let weights = array![[[0.0_f32, 1.0]]];
        let zero = normalize(&mut sum, weights.view());
        assert_eq!(zero, 1);
        assert!(sum.index_axis(Axis(2), 0).iter().all(|&v| v == 0.0));
        assert!(sum.index_axis(Axis(2), 1).iter().all(|&v| (v - 5.0).abs() < 1e-6));
        assert!(sum.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn normalize_tiny_weight_stays_finite() {
        let mut sum = Array4::from_elem((1, 1, 1, 1), 1e-20_f32);
        let weights = Array3::from_elem((1, 1, 1), 1e-30_f32);
        normalize(&mut sum, weights.view());
        assert!(sum[[0, 0, 0, 0]].is_finite());
    }

    #[test]
    fn argmax_prefers_lowest_index_on_tie() {
        let probs = Array4::from_shape_vec(
            (1, 1, 3, 3),
            vec![0.2, 0.4, 0.4, 0.5, 0.5, 0.0, 0.1, 0.2, 0.7],
        )
        .unwrap();
        let labels = argmax_labels(probs.view());
        assert_eq!(labels.into_raw_vec_and_offset().0, vec![1, 0, 2]);
    }

    #[test]
    fn slabs_cover_original_extent_once() {
        let window = WindowSpec::isotropic(8, 3);
        let padding = PaddingPlan::new([23, 4, 4], &window);
        let slabs = slab_ranges(&padding, window.stride()[0]);
        let before = padding.before()[0];
        assert_eq!(slabs.first().unwrap().start, before);
        assert_eq!(slabs.last().unwrap().end, before + 23);
        for pair in slabs.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert!(slabs.iter().all(|s| s.len() <= 5));
    }
}
