//! Out-of-core overlap-add accumulator.
//!
//! Two arrays sized to the padded volume and chunked to the window size:
//! `sum` holds the kernel-weighted class scores and `wsum` the summed
//! kernel weights. Both only ever grow, so the order in which windows are
//! added does not change the result.

use std::ops::Range;

use ndarray::{Array2, Array3, Array4, ArrayView4, Axis, Ix4};

use crate::kernel::BlendKernel;
use crate::store::{ChunkedArray, ChunkedStore, StoreError};

/// Store name of the weighted class sum.
pub const SUM: &str = "sum";

/// Store name of the weight sum.
pub const WEIGHT_SUM: &str = "wsum";

/// Weighted class sums and weight sums for a padded volume.
#[derive(Debug)]
pub struct Accumulator {
    sum: ChunkedArray<f32>,
    weights: ChunkedArray<f32>,
    n_classes: usize,
}

impl Accumulator {
    /// Create zeroed accumulator arrays in `store`, replacing any left
    /// over from an earlier run.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the arrays cannot be created.
    pub fn create(
        store: &ChunkedStore,
        padded: [usize; 3],
        window: [usize; 3],
        n_classes: usize,
        cache_chunks: usize,
    ) -> Result<Self, StoreError> {
        let [pz, px, py] = padded;
        let [wz, wx, wy] = window;
        let sum = store
            .create_array(SUM, &[pz, px, py, n_classes], &[wz, wx, wy, n_classes])?
            .with_cache_capacity(cache_chunks);
        let weights = store
            .create_array(WEIGHT_SUM, &[pz, px, py, 1], &[wz, wx, wy, 1])?
            .with_cache_capacity(cache_chunks);
        Ok(Self {
            sum,
            weights,
            n_classes,
        })
    }

    /// Number of classes per voxel.
    #[must_use]
    pub const fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Add one window's prediction, shaped `(Zw, Xw, Yw, C)`, at `origin`.
    ///
    /// The prediction is multiplied by the kernel before it is added to
    /// `sum`, and the kernel itself is added to `wsum`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the read-modify-write fails.
    pub fn add_window(
        &mut self,
        origin: [usize; 3],
        prediction: ArrayView4<'_, f32>,
        kernel: &BlendKernel,
    ) -> Result<(), StoreError> {
        let kernel = kernel.view().insert_axis(Axis(3));
        let weighted = &prediction * &kernel;
        let at = [origin[0], origin[1], origin[2], 0];
        self.sum.add_region(&at, weighted.view().into_dyn())?;
        self.weights.add_region(&at, kernel.into_dyn())
    }

    /// Read a block of `sum` as `(Z, X, Y, C)` and `wsum` as `(Z, X, Y)`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the block is out of bounds or unreadable.
    pub fn read_block(
        &self,
        z: Range<usize>,
        x: Range<usize>,
        y: Range<usize>,
    ) -> Result<(Array4<f32>, Array3<f32>), StoreError> {
        let origin = [z.start, x.start, y.start, 0];
        let extent = [z.len(), x.len(), y.len()];
        let sum = self
            .sum
            .read_region(&origin, &[extent[0], extent[1], extent[2], self.n_classes])?
            .into_dimensionality::<Ix4>()
            .map_err(|e| StoreError::Layout(e.to_string()))?;
        let weights = self
            .weights
            .read_region(&origin, &[extent[0], extent[1], extent[2], 1])?
            .into_dimensionality::<Ix4>()
            .map_err(|e| StoreError::Layout(e.to_string()))?
            .index_axis_move(Axis(3), 0);
        Ok((sum, weights))
    }

    /// Read one class channel of a single z-plane together with its
    /// weights, both as `(X, Y)`.
    ///
    /// # Errors
    ///
    /// Same as [`read_block`](Self::read_block).
    pub fn read_plane(
        &self,
        z: usize,
        x: Range<usize>,
        y: Range<usize>,
        channel: usize,
    ) -> Result<(Array2<f32>, Array2<f32>), StoreError> {
        let (sum, weights) = self.read_block(z..z + 1, x, y)?;
        let plane = sum
            .index_axis_move(Axis(0), 0)
            .index_axis_move(Axis(2), channel);
        Ok((plane, weights.index_axis_move(Axis(0), 0)))
    }

    /// Persist all cached chunks.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if a chunk cannot be written.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.sum.flush()?;
        self.weights.flush()
    }

    /// Delete both arrays from the store.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if a directory cannot be removed.
    pub fn discard(self) -> Result<(), StoreError> {
        let sum = self.sum.remove();
        let weights = self.weights.remove();
        sum.and(weights)
    }
}
