//! voxblend-engine: sliding-window inference over out-of-core 3D volumes.
//!
//! Applies a fixed-input-size voxel classifier to volumes far larger than
//! memory and reconstructs a seamless full-extent result:
//! reflect padding -> window plan -> per-window model call ->
//! kernel-weighted overlap-add into a chunked accumulator ->
//! slab-wise normalization into label / probability arrays.
//!
//! The engine is single-threaded and sequential. All state lives in the
//! [`InferenceConfig`] and the on-disk [`store`]; there are no globals.
//!
//! ```no_run
//! # use std::path::Path;
//! # use voxblend_engine::{EngineError, InferenceConfig, IntensityThreshold, WindowSpec};
//! # fn run() -> Result<(), EngineError> {
//! let config = InferenceConfig {
//!     window: WindowSpec::isotropic(64, 16),
//!     ..InferenceConfig::default()
//! };
//! let mut model = IntensityThreshold::default();
//! let outcome = voxblend_engine::predict_volume(
//!     &mut model,
//!     Path::new("volume.vox"),
//!     Path::new("prediction.vox"),
//!     &config,
//! )?;
//! println!("{}", outcome.diagnostics.report());
//! # Ok(())
//! # }
//! ```

pub mod accumulate;
pub mod diagnostics;
pub mod finalize;
pub mod kernel;
pub mod model;
pub mod observer;
pub mod padding;
pub mod run;
pub mod source;
pub mod store;
pub mod types;
pub mod window;

pub use diagnostics::{Clock, RunDiagnostics, SystemClock};
pub use kernel::BlendKernel;
pub use model::{IntensityThreshold, ModelError, VoxelClassifier};
pub use observer::{NoopObserver, PreviewSlice, RunObserver};
pub use padding::PaddingPlan;
pub use run::{RunOutcome, predict_volume, predict_volume_with};
pub use source::SourceVolume;
pub use store::{ChunkedArray, ChunkedStore, DataType, Element, StoreError};
pub use types::{
    EngineError, InferenceConfig, OutputSelection, OutputVolumeSet, Stage, WindowSpec,
};
pub use window::{Window, WindowPlan};
