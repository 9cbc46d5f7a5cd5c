//! Progress and preview hooks for long runs.
//!
//! Observers see the run but cannot change it; the numerical result is
//! the same with or without one.

use ndarray::Array2;

use crate::padding::PaddingPlan;
use crate::window::{Window, WindowPlan};

/// A reconstructed slice next to the matching input slice.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewSlice {
    /// Original z coordinate of the slice.
    pub z: usize,
    /// Input intensities, `(X, Y)`.
    pub input: Array2<f32>,
    /// Foreground probability reconstructed so far, `(X, Y)`.
    pub prediction: Array2<f32>,
}

/// Receives progress events from a run.
///
/// Every hook defaults to doing nothing.
pub trait RunObserver {
    /// Planning finished; windows are about to be processed.
    fn run_started(&mut self, _plan: &WindowPlan, _padding: &PaddingPlan) {}

    /// `done` of `total` windows have been accumulated.
    fn window_finished(&mut self, _done: usize, _total: usize, _window: &Window) {}

    /// A preview slice is available.
    fn preview(&mut self, _slice: &PreviewSlice) {}

    /// Finalization is starting over `slabs` slabs.
    fn finalize_started(&mut self, _slabs: usize) {}

    /// `done` of `total` slabs have been written.
    fn slab_finalized(&mut self, _done: usize, _total: usize) {}
}

impl<O: RunObserver + ?Sized> RunObserver for &mut O {
    fn run_started(&mut self, plan: &WindowPlan, padding: &PaddingPlan) {
        (**self).run_started(plan, padding);
    }

    fn window_finished(&mut self, done: usize, total: usize, window: &Window) {
        (**self).window_finished(done, total, window);
    }

    fn preview(&mut self, slice: &PreviewSlice) {
        (**self).preview(slice);
    }

    fn finalize_started(&mut self, slabs: usize) {
        (**self).finalize_started(slabs);
    }

    fn slab_finalized(&mut self, done: usize, total: usize) {
        (**self).slab_finalized(done, total);
    }
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}
