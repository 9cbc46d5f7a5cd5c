//! One complete inference run: plan, window loop, finalization.

use std::path::Path;

use ndarray::{Axis, Zip};
use tracing::{debug, info, warn};

use crate::accumulate::Accumulator;
use crate::diagnostics::{
    Clock, RunDiagnostics, RunSummary, StageDiagnostics, StageMetrics, SystemClock,
};
use crate::finalize::{self, NORMALIZE_EPSILON, OutputArrays};
use crate::kernel::BlendKernel;
use crate::model::VoxelClassifier;
use crate::observer::{NoopObserver, PreviewSlice, RunObserver};
use crate::padding::PaddingPlan;
use crate::source::SourceVolume;
use crate::store::ChunkedStore;
use crate::types::{EngineError, InferenceConfig, OutputVolumeSet, Stage};
use crate::window::{Window, WindowPlan};

/// Outputs and diagnostics of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Arrays written to the output store.
    pub outputs: OutputVolumeSet,
    /// Timing and counts per stage.
    pub diagnostics: RunDiagnostics,
}

/// Classify every voxel of the source array at `source` and write the
/// selected outputs into the store directory `output`.
///
/// # Errors
///
/// See [`predict_volume_with`].
pub fn predict_volume<M>(
    model: &mut M,
    source: &Path,
    output: &Path,
    config: &InferenceConfig,
) -> Result<RunOutcome, EngineError>
where
    M: VoxelClassifier + ?Sized,
{
    predict_volume_with(
        model,
        source,
        output,
        config,
        &mut NoopObserver,
        &SystemClock::default(),
    )
}

/// [`predict_volume`] with a progress observer and an explicit clock.
///
/// # Steps
///
/// 1. Validate the configuration (before any I/O)
/// 2. Open the source and plan padding, windows and blend kernel
/// 3. Create the outputs (marked incomplete) and a fresh accumulator
/// 4. For each window: read the padded patch, call the model, add the
///    weighted prediction into the accumulator
/// 5. Normalize slab by slab into the outputs
/// 6. Mark the outputs complete and delete the accumulator (a cleanup
///    failure is logged, not returned)
///
/// # Errors
///
/// Returns [`EngineError::InvalidConfig`] for a bad configuration,
/// [`EngineError::Shape`] for a source that is not 3-D,
/// [`EngineError::Model`] / [`EngineError::PredictionShape`] when the
/// model fails, and store errors tagged with the stage (and window) in
/// progress. After a failure the accumulator is deleted and the outputs
/// stay marked incomplete.
pub fn predict_volume_with<M, O, C>(
    model: &mut M,
    source: &Path,
    output: &Path,
    config: &InferenceConfig,
    observer: &mut O,
    clock: &C,
) -> Result<RunOutcome, EngineError>
where
    M: VoxelClassifier + ?Sized,
    O: RunObserver + ?Sized,
    C: Clock + ?Sized,
{
    let start = clock.now();

    // 1-2. Validate and plan.
    config.validate()?;
    let source = SourceVolume::open(source)?;
    let shape = source.shape();
    let padding = PaddingPlan::new(shape, &config.window);
    let plan = WindowPlan::new(padding.padded_shape(), &config.window);
    let kernel = BlendKernel::new(config.window.size);
    info!(
        source = ?shape,
        padded = ?padding.padded_shape(),
        window = %config.window,
        windows = plan.len(),
        "planned inference"
    );

    // 3. Outputs and accumulator.
    let store = ChunkedStore::create(output).map_err(EngineError::store(Stage::Prepare))?;
    let mut outputs =
        OutputArrays::create(&store, shape, config).map_err(EngineError::store(Stage::Prepare))?;
    let mut accumulator = Accumulator::create(
        &store,
        padding.padded_shape(),
        config.window.size,
        config.n_classes,
        config.cache_chunks,
    )
    .map_err(EngineError::store(Stage::Prepare))?;
    let planned = clock.now();
    observer.run_started(&plan, &padding);

    // 4. Window loop.
    let mut ctx = WindowLoop {
        model,
        source: &source,
        padding: &padding,
        plan: &plan,
        kernel: &kernel,
        config,
    };
    let loop_stats = match ctx.run(&mut accumulator, observer) {
        Ok(stats) => stats,
        Err(err) => return Err(abandon(accumulator, err)),
    };
    if let Err(err) = accumulator.flush() {
        return Err(abandon(accumulator, EngineError::store(Stage::Accumulate)(err)));
    }
    let inferred = clock.now();
    info!(windows = loop_stats.windows, "inference finished");

    // 5. Finalize.
    let slab_height = config.window.stride()[0];
    let finalized =
        match finalize::finalize(&accumulator, &mut outputs, &padding, slab_height, observer) {
            Ok(summary) => summary,
            Err(err) => return Err(abandon(accumulator, err)),
        };

    // 6. Publish, then delete the accumulator.
    if let Err(err) = outputs.mark_complete() {
        return Err(abandon(accumulator, EngineError::store(Stage::Finalize)(err)));
    }
    if let Err(cleanup) = accumulator.discard() {
        warn!(error = %cleanup, "failed to delete accumulator after finalize");
    }
    let end = clock.now();
    info!(
        slabs = finalized.slabs,
        outputs = ?config.outputs.names(),
        "outputs complete"
    );

    let before = padding.before();
    let axes = padding.axes();
    let diagnostics = RunDiagnostics {
        plan: StageDiagnostics {
            duration: planned.saturating_sub(start),
            metrics: StageMetrics::Plan {
                source_shape: shape,
                padded_shape: padding.padded_shape(),
                padding: [0, 1, 2].map(|a| [before[a], axes[a].after]),
                window_counts: plan.counts(),
            },
        },
        inference: StageDiagnostics {
            duration: inferred.saturating_sub(planned),
            metrics: StageMetrics::Inference {
                windows: loop_stats.windows,
                voxels_predicted: loop_stats.voxels,
                previews: loop_stats.previews,
            },
        },
        finalize: StageDiagnostics {
            duration: end.saturating_sub(inferred),
            metrics: StageMetrics::Finalize {
                slabs: finalized.slabs,
                zero_weight_voxels: finalized.zero_weight_voxels,
                outputs: config
                    .outputs
                    .names()
                    .into_iter()
                    .map(String::from)
                    .collect(),
            },
        },
        total_duration: end.saturating_sub(start),
        summary: RunSummary {
            source_shape: shape,
            voxel_count: shape.iter().map(|&n| n as u64).product(),
            n_classes: config.n_classes,
            window_count: loop_stats.windows,
        },
    };

    Ok(RunOutcome {
        outputs: OutputVolumeSet {
            store: output.to_path_buf(),
            shape,
            n_classes: config.n_classes,
            outputs: config.outputs,
        },
        diagnostics,
    })
}

/// Delete the accumulator after a failure, keeping the original error.
fn abandon(accumulator: Accumulator, err: EngineError) -> EngineError {
    if let Err(cleanup) = accumulator.discard() {
        warn!(error = %cleanup, "failed to delete accumulator after error");
    }
    err
}

#[derive(Debug, Default)]
struct LoopStats {
    windows: usize,
    voxels: u64,
    previews: usize,
}

/// Borrowed state shared by every window of one run.
struct WindowLoop<'a, M: ?Sized> {
    model: &'a mut M,
    source: &'a SourceVolume,
    padding: &'a PaddingPlan,
    plan: &'a WindowPlan,
    kernel: &'a BlendKernel,
    config: &'a InferenceConfig,
}

impl<M: VoxelClassifier + ?Sized> WindowLoop<'_, M> {
    fn run<O: RunObserver + ?Sized>(
        &mut self,
        accumulator: &mut Accumulator,
        observer: &mut O,
    ) -> Result<LoopStats, EngineError> {
        let total = self.plan.len();
        let window_voxels = self.config.window.voxels() as u64;
        let mut stats = LoopStats::default();
        let mut row = 0;

        for window in self.plan.iter() {
            self.process(&window, accumulator)?;
            stats.windows += 1;
            stats.voxels += window_voxels;
            observer.window_finished(stats.windows, total, &window);

            if self.plan.ends_row(&window) {
                row += 1;
                let due = self
                    .config
                    .preview_interval
                    .is_some_and(|interval| row % interval == 0);
                if due && let Some(slice) = self.preview(window.origin[0], accumulator)? {
                    observer.preview(&slice);
                    stats.previews += 1;
                }
            }
        }
        Ok(stats)
    }

    fn process(&mut self, window: &Window, accumulator: &mut Accumulator) -> Result<(), EngineError> {
        let origin = window.origin;
        let [zw, xw, yw] = self.config.window.size;

        let patch = self
            .source
            .read_padded(self.padding, origin, self.config.window.size)
            .map_err(EngineError::window_store(Stage::Read, origin))?;
        let input = patch.insert_axis(Axis(0)).insert_axis(Axis(4));

        let prediction = self
            .model
            .predict(input.view())
            .map_err(|source| EngineError::Model {
                window: origin,
                source,
            })?;
        let expected = [1, zw, xw, yw, self.config.n_classes];
        if prediction.shape() != expected {
            return Err(EngineError::PredictionShape {
                window: origin,
                expected,
                found: prediction.shape().to_vec(),
            });
        }

        accumulator
            .add_window(
                origin,
                prediction.index_axis_move(Axis(0), 0).view(),
                self.kernel,
            )
            .map_err(EngineError::window_store(Stage::Accumulate, origin))?;
        debug!(window = ?origin, ordinal = window.ordinal, "window accumulated");
        Ok(())
    }

    /// Mid-slice of the z-row starting at `row_z`, or `None` when that
    /// slice lies in the padding.
    fn preview(&self, row_z: usize, accumulator: &Accumulator) -> Result<Option<PreviewSlice>, EngineError> {
        let mid = row_z + self.config.window.size[0] / 2;
        let Some(z) = self.padding.to_original(0, mid) else {
            return Ok(None);
        };
        let [_, bx, by] = self.padding.before();
        let [_, nx, ny] = self.padding.original_shape();

        let (sum, weights) = accumulator
            .read_plane(mid, bx..bx + nx, by..by + ny, self.config.foreground_channel)
            .map_err(EngineError::store(Stage::Read))?;
        let prediction = Zip::from(&sum).and(&weights).map_collect(|&s, &w| {
            if w > 0.0 {
                s / w.max(NORMALIZE_EPSILON)
            } else {
                0.0
            }
        });
        let input = self
            .source
            .read_slice(z)
            .map_err(EngineError::store(Stage::Read))?;
        debug!(z, "preview slice ready");
        Ok(Some(PreviewSlice {
            z,
            input,
            prediction,
        }))
    }
}
