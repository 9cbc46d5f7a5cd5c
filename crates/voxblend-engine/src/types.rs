//! Shared types for the voxblend inference engine.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::ModelError;
use crate::store::{ChunkedArray, ChunkedStore, DEFAULT_CACHE_CHUNKS, StoreError};

/// Default window extent along every axis.
pub const DEFAULT_WINDOW_SIZE: usize = 64;

/// Default number of classes produced by the model.
pub const DEFAULT_N_CLASSES: usize = 2;

/// Default channel treated as foreground.
pub const DEFAULT_FOREGROUND_CHANNEL: usize = 1;

/// Largest class count representable in the `u8` label volume.
pub const MAX_CLASSES: usize = 256;

/// Name of the argmax label array in the output store.
pub const LABELS: &str = "labels";

/// Name of the per-class probability array in the output store.
pub const PROBABILITIES: &str = "probabilities";

/// Name of the foreground probability array in the output store.
pub const FOREGROUND: &str = "foreground";

/// Window extent and overlap per axis, in `(Z, X, Y)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Window extent per axis.
    pub size: [usize; 3],
    /// Overlap between neighbouring windows per axis.
    ///
    /// Must be strictly less than `size` on every axis.
    pub overlap: [usize; 3],
}

impl WindowSpec {
    /// Create a window with explicit per-axis size and overlap.
    #[must_use]
    pub const fn new(size: [usize; 3], overlap: [usize; 3]) -> Self {
        Self { size, overlap }
    }

    /// Create a cubic window.
    #[must_use]
    pub const fn isotropic(size: usize, overlap: usize) -> Self {
        Self {
            size: [size; 3],
            overlap: [overlap; 3],
        }
    }

    /// Create a window whose overlap is half its extent on every axis.
    #[must_use]
    pub const fn with_default_overlap(size: [usize; 3]) -> Self {
        Self {
            size,
            overlap: [size[0] / 2, size[1] / 2, size[2] / 2],
        }
    }

    /// Step between consecutive window origins per axis.
    ///
    /// Zero on an axis whose overlap is not smaller than the size;
    /// [`validate`](Self::validate) rejects such windows.
    #[must_use]
    pub const fn stride(&self) -> [usize; 3] {
        [
            self.size[0].saturating_sub(self.overlap[0]),
            self.size[1].saturating_sub(self.overlap[1]),
            self.size[2].saturating_sub(self.overlap[2]),
        ]
    }

    /// Number of voxels in one window.
    #[must_use]
    pub const fn voxels(&self) -> usize {
        self.size[0] * self.size[1] * self.size[2]
    }

    /// Check that every axis has a non-zero size and a positive stride.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] naming the offending axis.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (axis, (&size, &overlap)) in self.size.iter().zip(&self.overlap).enumerate() {
            if size == 0 {
                return Err(EngineError::InvalidConfig(format!(
                    "window size on axis {axis} must be non-zero"
                )));
            }
            if overlap >= size {
                return Err(EngineError::InvalidConfig(format!(
                    "overlap {overlap} on axis {axis} must be smaller than the window size {size}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for WindowSpec {
    fn default() -> Self {
        Self::with_default_overlap([DEFAULT_WINDOW_SIZE; 3])
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [sz, sx, sy] = self.size;
        let [oz, ox, oy] = self.overlap;
        write!(f, "{sz}x{sx}x{sy} (overlap {oz}x{ox}x{oy})")
    }
}

/// Which arrays the finalizer writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSelection {
    /// Argmax class labels (`u8`, original shape).
    pub labels: bool,
    /// Normalized per-class probabilities (`f32`, original shape x classes).
    pub probabilities: bool,
    /// Normalized probability of the foreground channel (`f32`, original shape).
    pub foreground: bool,
}

impl OutputSelection {
    /// Whether at least one output is selected.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.labels || self.probabilities || self.foreground
    }

    /// Store names of the selected outputs.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        [
            (self.labels, LABELS),
            (self.probabilities, PROBABILITIES),
            (self.foreground, FOREGROUND),
        ]
        .into_iter()
        .filter_map(|(selected, name)| selected.then_some(name))
        .collect()
    }
}

impl Default for OutputSelection {
    fn default() -> Self {
        Self {
            labels: true,
            probabilities: false,
            foreground: false,
        }
    }
}

/// Configuration for one inference run.
///
/// Every knob the engine honours lives here; there is no global state.
/// Missing fields take their defaults when deserialized, so a partial
/// JSON object is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Window geometry.
    pub window: WindowSpec,

    /// Number of classes the model produces per voxel.
    ///
    /// Between 1 and [`MAX_CLASSES`].
    pub n_classes: usize,

    /// Class channel treated as foreground for previews and the
    /// `foreground` output.
    pub foreground_channel: usize,

    /// Which arrays to write.
    pub outputs: OutputSelection,

    /// Emit a preview after every `n`-th z-row of windows.
    ///
    /// `None` disables previews.
    pub preview_interval: Option<usize>,

    /// Number of chunks each accumulator array keeps in its write-back
    /// cache before spilling to disk.
    pub cache_chunks: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            window: WindowSpec::default(),
            n_classes: DEFAULT_N_CLASSES,
            foreground_channel: DEFAULT_FOREGROUND_CHANNEL,
            outputs: OutputSelection::default(),
            preview_interval: None,
            cache_chunks: DEFAULT_CACHE_CHUNKS,
        }
    }
}

impl InferenceConfig {
    /// Check the configuration before any I/O happens.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for an invalid window, a
    /// class count outside `1..=256`, a foreground channel outside the
    /// class range, an empty output selection, a zero preview interval
    /// or a zero cache size.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.window.validate()?;
        if self.n_classes == 0 || self.n_classes > MAX_CLASSES {
            return Err(EngineError::InvalidConfig(format!(
                "class count must be between 1 and {MAX_CLASSES}, got {}",
                self.n_classes
            )));
        }
        if self.foreground_channel >= self.n_classes {
            return Err(EngineError::InvalidConfig(format!(
                "foreground channel {} is out of range for {} classes",
                self.foreground_channel, self.n_classes
            )));
        }
        if !self.outputs.any() {
            return Err(EngineError::InvalidConfig(
                "at least one output must be selected".into(),
            ));
        }
        if self.preview_interval == Some(0) {
            return Err(EngineError::InvalidConfig(
                "preview interval must be at least 1".into(),
            ));
        }
        if self.cache_chunks == 0 {
            return Err(EngineError::InvalidConfig(
                "cache must hold at least one chunk".into(),
            ));
        }
        Ok(())
    }
}

/// Processing stage, carried by errors and log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Configuration, planning and store setup.
    Prepare,
    /// Reading source patches or accumulator planes.
    Read,
    /// Invoking the model.
    Infer,
    /// Adding weighted predictions into the accumulator.
    Accumulate,
    /// Normalizing and writing outputs.
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prepare => "prepare",
            Self::Read => "read",
            Self::Infer => "infer",
            Self::Accumulate => "accumulate",
            Self::Finalize => "finalize",
        })
    }
}

/// Errors raised by an inference run.
///
/// Nothing is retried: the first error aborts the run, and outputs
/// created before it stay marked incomplete.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The configuration is unusable. Raised before any I/O.
    #[error("invalid inference configuration: {0}")]
    InvalidConfig(String),

    /// The source volume is not 3-D after squeezing a trailing
    /// singleton channel axis, or has an empty axis.
    #[error(
        "read failed: source must have shape (Z, X, Y) or (Z, X, Y, 1) with non-empty axes, got {shape:?}"
    )]
    Shape {
        /// Shape found in the source metadata.
        shape: Vec<usize>,
    },

    /// A store operation outside the window loop failed.
    #[error("{stage} failed: {source}")]
    Store {
        /// Stage in progress.
        stage: Stage,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// A store operation for a specific window failed.
    #[error("{stage} failed at window {window:?}: {source}")]
    WindowStore {
        /// Stage in progress.
        stage: Stage,
        /// Window origin in padded coordinates.
        window: [usize; 3],
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// The model returned an error.
    #[error("infer failed at window {window:?}: {source}")]
    Model {
        /// Window origin in padded coordinates.
        window: [usize; 3],
        /// Error reported by the model.
        #[source]
        source: ModelError,
    },

    /// The model returned a prediction of the wrong shape.
    #[error("infer failed at window {window:?}: model returned shape {found:?}, expected {expected:?}")]
    PredictionShape {
        /// Window origin in padded coordinates.
        window: [usize; 3],
        /// Expected `(1, Zw, Xw, Yw, C)` shape.
        expected: [usize; 5],
        /// Shape actually returned.
        found: Vec<usize>,
    },
}

impl EngineError {
    /// Stage the error was raised in.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::InvalidConfig(_) => Stage::Prepare,
            Self::Shape { .. } => Stage::Read,
            Self::Store { stage, .. } | Self::WindowStore { stage, .. } => *stage,
            Self::Model { .. } | Self::PredictionShape { .. } => Stage::Infer,
        }
    }

    /// Window origin the error relates to, when known.
    #[must_use]
    pub const fn window(&self) -> Option<[usize; 3]> {
        match self {
            Self::WindowStore { window, .. }
            | Self::Model { window, .. }
            | Self::PredictionShape { window, .. } => Some(*window),
            _ => None,
        }
    }

    pub(crate) fn store(stage: Stage) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { stage, source }
    }

    pub(crate) fn window_store(stage: Stage, window: [usize; 3]) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::WindowStore {
            stage,
            window,
            source,
        }
    }
}

/// Description of the arrays a successful run leaves behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputVolumeSet {
    /// Store directory holding the arrays.
    pub store: PathBuf,
    /// Original `(Z, X, Y)` extent of every output.
    pub shape: [usize; 3],
    /// Class count of the `probabilities` array.
    pub n_classes: usize,
    /// Arrays that were written.
    pub outputs: OutputSelection,
}

impl OutputVolumeSet {
    fn store(&self) -> Result<ChunkedStore, StoreError> {
        ChunkedStore::open(&self.store)
    }

    /// Open the `labels` array.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the array is missing or unreadable.
    pub fn open_labels(&self) -> Result<ChunkedArray<u8>, StoreError> {
        self.store()?.open_array(LABELS)
    }

    /// Open the `probabilities` array.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the array is missing or unreadable.
    pub fn open_probabilities(&self) -> Result<ChunkedArray<f32>, StoreError> {
        self.store()?.open_array(PROBABILITIES)
    }

    /// Open the `foreground` array.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the array is missing or unreadable.
    pub fn open_foreground(&self) -> Result<ChunkedArray<f32>, StoreError> {
        self.store()?.open_array(FOREGROUND)
    }
}
