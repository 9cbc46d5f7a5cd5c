//! The classifier contract and a reference implementation.

use ndarray::{Array5, ArrayView5, Axis};

/// Error type returned by classifiers.
pub type ModelError = Box<dyn std::error::Error + Send + Sync>;

/// A fixed-input-size voxel classifier.
///
/// `predict` receives one patch shaped `(1, Zw, Xw, Yw, 1)` and must
/// return per-class scores shaped `(1, Zw, Xw, Yw, C)`. Scores are
/// treated as probabilities; they are not checked to sum to one.
///
/// Returning an error aborts the run, which is also how callers cancel
/// a long prediction.
pub trait VoxelClassifier {
    /// Classify one patch.
    ///
    /// # Errors
    ///
    /// Any error the model wants to surface; it is reported with the
    /// window origin.
    fn predict(&mut self, patch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError>;
}

impl<M: VoxelClassifier + ?Sized> VoxelClassifier for &mut M {
    fn predict(&mut self, patch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
        (**self).predict(patch)
    }
}

impl<M: VoxelClassifier + ?Sized> VoxelClassifier for Box<M> {
    fn predict(&mut self, patch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
        (**self).predict(patch)
    }
}

/// Two-class model that thresholds intensity through a logistic curve.
///
/// Channel 1 is `sigmoid(steepness * (v - threshold))` and channel 0 its
/// complement. Useful for smoke runs without a trained network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntensityThreshold {
    /// Intensity at which both classes are equally likely.
    pub threshold: f32,
    /// Slope of the logistic curve.
    pub steepness: f32,
}

impl IntensityThreshold {
    /// Create a threshold model.
    #[must_use]
    pub const fn new(threshold: f32, steepness: f32) -> Self {
        Self {
            threshold,
            steepness,
        }
    }

    fn foreground(&self, value: f32) -> f32 {
        1.0 / (1.0 + (-self.steepness * (value - self.threshold)).exp())
    }
}

impl Default for IntensityThreshold {
    fn default() -> Self {
        Self::new(0.5, 10.0)
    }
}

impl VoxelClassifier for IntensityThreshold {
    fn predict(&mut self, patch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
        let &[batch, z, x, y, channels] = patch.shape() else {
            return Err(format!("expected a 5-D patch, got shape {:?}", patch.shape()).into());
        };
        if batch != 1 || channels != 1 {
            return Err(format!(
                "expected a (1, Z, X, Y, 1) patch, got shape {:?}",
                patch.shape()
            )
            .into());
        }
        let intensity = patch.index_axis(Axis(4), 0);
        Ok(Array5::from_shape_fn((1, z, x, y, 2), |(b, zi, xi, yi, c)| {
            let p = self.foreground(intensity[[b, zi, xi, yi]]);
            if c == 1 { p } else { 1.0 - p }
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::Array5;

    use super::*;

    #[test]
    fn threshold_model_splits_intensity() {
        let mut model = IntensityThreshold::new(0.5, 20.0);
        let mut patch = Array5::<f32>::zeros((1, 2, 2, 2, 1));
        patch[[0, 1, 1, 1, 0]] = 1.0;
        let out = model.predict(patch.view()).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 2, 2]);
        assert!(out[[0, 0, 0, 0, 0]] > 0.99);
        assert!(out[[0, 1, 1, 1, 1]] > 0.99);
        for z in 0..2 {
            let total = out[[0, z, 0, 0, 0]] + out[[0, z, 0, 0, 1]];
            assert!((total - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn threshold_model_rejects_multichannel_patch() {
        let mut model = IntensityThreshold::default();
        let patch = Array5::<f32>::zeros((1, 2, 2, 2, 3));
        assert!(model.predict(patch.view()).is_err());
    }

    #[test]
    fn boxed_model_delegates() {
        let mut model: Box<dyn VoxelClassifier> = Box::new(IntensityThreshold::default());
        let patch = Array5::<f32>::zeros((1, 1, 1, 1, 1));
        assert_eq!(model.predict(patch.view()).unwrap().shape(), &[1, 1, 1, 1, 2]);
    }
}
