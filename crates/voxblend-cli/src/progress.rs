//! Terminal progress reporting and preview file output.

use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use voxblend_engine::{PaddingPlan, PreviewSlice, RunObserver, Window, WindowPlan};
use voxblend_export::{ExportError, encode_preview_png, preview_file_name};

const TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// [`RunObserver`] that drives an `indicatif` bar and writes preview PNGs.
pub struct ProgressObserver {
    bar: ProgressBar,
    preview_dir: Option<PathBuf>,
    previews: Vec<PathBuf>,
}

impl ProgressObserver {
    /// Observer drawing to stderr. Previews are written into
    /// `preview_dir` when one is given and dropped otherwise.
    pub fn new(preview_dir: Option<PathBuf>) -> Self {
        Self::with_bar(ProgressBar::new(0), preview_dir)
    }

    /// Observer that tracks progress without drawing.
    #[cfg(test)]
    pub fn hidden(preview_dir: Option<PathBuf>) -> Self {
        Self::with_bar(ProgressBar::hidden(), preview_dir)
    }

    fn with_bar(bar: ProgressBar, preview_dir: Option<PathBuf>) -> Self {
        if let Ok(style) = ProgressStyle::with_template(TEMPLATE) {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self {
            bar,
            preview_dir,
            previews: Vec::new(),
        }
    }

    /// Preview files written so far.
    pub fn previews(&self) -> &[PathBuf] {
        &self.previews
    }

    /// Remove the bar from the terminal.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    #[cfg(test)]
    fn position(&self) -> (u64, Option<u64>) {
        (self.bar.position(), self.bar.length())
    }
}

impl RunObserver for ProgressObserver {
    fn run_started(&mut self, plan: &WindowPlan, _padding: &PaddingPlan) {
        self.bar.set_length(to_u64(plan.len()));
        self.bar.set_position(0);
        self.bar.set_message("windows");
    }

    fn window_finished(&mut self, done: usize, _total: usize, _window: &Window) {
        self.bar.set_position(to_u64(done));
    }

    fn preview(&mut self, slice: &PreviewSlice) {
        let Some(dir) = &self.preview_dir else {
            return;
        };
        match write_preview(dir, slice) {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "preview written");
                self.previews.push(path);
            }
            Err(e) => tracing::warn!(z = slice.z, "preview skipped: {e}"),
        }
    }

    fn finalize_started(&mut self, slabs: usize) {
        self.bar.set_length(to_u64(slabs));
        self.bar.set_position(0);
        self.bar.set_message("slabs");
    }

    fn slab_finalized(&mut self, done: usize, _total: usize) {
        self.bar.set_position(to_u64(done));
    }
}

/// Encode `slice` and write it into `dir`, returning the file path.
fn write_preview(dir: &Path, slice: &PreviewSlice) -> Result<PathBuf, ExportError> {
    let bytes = encode_preview_png(slice)?;
    let path = dir.join(preview_file_name(slice.z));
    fs::write(&path, bytes).map_err(|source| ExportError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}
