//! Timing and counts for the plan, inference and finalize stages.
//!
//! [`predict_volume`](crate::predict_volume) returns a [`RunDiagnostics`]
//! next to its outputs. Stage boundaries are timestamped through a
//! [`Clock`], so tests can substitute a clock that advances in fixed
//! steps. In JSON every duration is a number of seconds.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Monotonic time source.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed point.
    fn now(&self) -> Duration;
}

/// [`Clock`] backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// `Duration` as a JSON number of seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {secs}s: {e}")))
    }
}

/// Diagnostics collected from a single inference run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Stage 1: validation, padding and window planning, store setup.
    pub plan: StageDiagnostics,
    /// Stage 2: patch reads, model calls and accumulation.
    pub inference: StageDiagnostics,
    /// Stage 3: normalization and output writes.
    pub finalize: StageDiagnostics,
    /// Wall-clock duration of the whole run (seconds).
    #[serde(with = "seconds")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: RunSummary,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "seconds")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Planning metrics.
    Plan {
        /// Source extent `(Z, X, Y)`.
        source_shape: [usize; 3],
        /// Padded extent.
        padded_shape: [usize; 3],
        /// `(before, after)` padding per axis.
        padding: [[usize; 2]; 3],
        /// Window counts per axis.
        window_counts: [usize; 3],
    },
    /// Window loop metrics.
    Inference {
        /// Windows accumulated.
        windows: usize,
        /// Voxels passed to the model.
        voxels_predicted: u64,
        /// Preview slices emitted.
        previews: usize,
    },
    /// Finalization metrics.
    Finalize {
        /// Slabs written.
        slabs: usize,
        /// Voxels whose weight sum was zero.
        zero_weight_voxels: u64,
        /// Names of the arrays written.
        outputs: Vec<String>,
    },
}

/// High-level summary of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Source extent `(Z, X, Y)`.
    pub source_shape: [usize; 3],
    /// Voxels in the source.
    pub voxel_count: u64,
    /// Classes per voxel.
    pub n_classes: usize,
    /// Windows accumulated.
    pub window_count: usize,
}

impl RunDiagnostics {
    /// Render a plain-text table with one row per stage.
    #[must_use]
    pub fn report(&self) -> String {
        use std::fmt::Write;

        let summary = &self.summary;
        let total = millis(self.total_duration);
        let mut out = String::new();
        let _ = writeln!(
            out,
            "voxblend run: {} volume, {} voxels, {} classes",
            format_shape(summary.source_shape),
            summary.voxel_count,
            summary.n_classes,
        );
        let _ = writeln!(out, "{}", "=".repeat(60));
        let _ = writeln!(
            out,
            "{:<12} {:>12} {:>8}  {}",
            "Stage", "Time", "Share", "Details"
        );
        let _ = writeln!(out, "{}", "-".repeat(80));
        for (name, stage) in [
            ("Plan", &self.plan),
            ("Inference", &self.inference),
            ("Finalize", &self.finalize),
        ] {
            let ms = millis(stage.duration);
            let _ = writeln!(
                out,
                "{name:<12} {ms:>10.3}ms {:>7.1}%  {}",
                share(ms, total),
                format_metrics(&stage.metrics),
            );
        }
        let _ = writeln!(out, "{}", "-".repeat(80));
        let _ = write!(
            out,
            "{:<12} {total:>10.3}ms  ({} windows)",
            "Total", summary.window_count
        );
        out
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// `part` as a percentage of `whole`; zero when `whole` is zero.
fn share(part: f64, whole: f64) -> f64 {
    if whole > 0.0 { part / whole * 100.0 } else { 0.0 }
}

fn format_shape([z, x, y]: [usize; 3]) -> String {
    format!("{z}x{x}x{y}")
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Plan {
            source_shape,
            padded_shape,
            window_counts,
            ..
        } => format!(
            "{} -> padded {} ({} windows)",
            format_shape(*source_shape),
            format_shape(*padded_shape),
            format_shape(*window_counts),
        ),
        StageMetrics::Inference {
            windows,
            voxels_predicted,
            previews,
        } => format!("{windows} windows, {voxels_predicted} voxels, {previews} previews"),
        StageMetrics::Finalize {
            slabs,
            zero_weight_voxels,
            outputs,
        } => format!(
            "{slabs} slabs -> {} (zero-weight voxels: {zero_weight_voxels})",
            outputs.join(", "),
        ),
    }
}
