//! voxblend: sliding-window inference over chunked 3-D volumes.
//!
//! Classifies every voxel of a chunked source array with the built-in
//! intensity threshold model, blending overlapping windows, then prints
//! per-stage diagnostics. Results can be exported to BigTIFF and
//! inspected from the same binary.
//!
//! # Usage
//!
//! ```text
//! voxblend predict [OPTIONS] <SOURCE> <OUTPUT>
//! voxblend export <ARRAY> <OUTPUT_TIFF>
//! voxblend info [--json] <PATH>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod progress;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use voxblend_engine::store::{ArrayMetadata, DEFAULT_CACHE_CHUNKS, METADATA_FILE};
use voxblend_engine::types::{DEFAULT_FOREGROUND_CHANNEL, DEFAULT_N_CLASSES, DEFAULT_WINDOW_SIZE};
use voxblend_engine::{
    ChunkedStore, EngineError, InferenceConfig, IntensityThreshold, OutputSelection, StoreError,
    SystemClock, WindowSpec, predict_volume_with,
};
use voxblend_export::{ExportError, export_array};

use crate::progress::ProgressObserver;

/// Sliding-window inference with overlap-add blending.
#[derive(Parser)]
#[command(name = "voxblend", version)]
struct Cli {
    /// Log more (-v debug, -vv trace). `RUST_LOG` sets the base filter.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run inference over a source array and write the selected outputs.
    Predict(PredictArgs),

    /// Export a chunked array to BigTIFF (one file per channel for 4-D).
    Export {
        /// Array directory.
        array: PathBuf,
        /// Output `.tiff` path.
        output: PathBuf,
    },

    /// Print the metadata of an array, or of every array in a store.
    Info {
        /// Array or store directory.
        path: PathBuf,
        /// Print JSON instead of a human-readable listing.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct PredictArgs {
    /// Source array directory (3-D, or 4-D with a single trailing channel).
    source: PathBuf,

    /// Output store directory.
    output: PathBuf,

    /// Window size: one value for a cube or `z,x,y`.
    #[arg(long, value_delimiter = ',')]
    window: Option<Vec<usize>>,

    /// Window overlap: one value or `z,x,y`. Defaults to half the window.
    #[arg(long, value_delimiter = ',')]
    overlap: Option<Vec<usize>>,

    /// Number of classes the model produces.
    #[arg(long, default_value_t = DEFAULT_N_CLASSES)]
    classes: usize,

    /// Class channel used for previews and the foreground output.
    #[arg(long, default_value_t = DEFAULT_FOREGROUND_CHANNEL)]
    foreground_channel: usize,

    /// Do not write the label volume.
    #[arg(long)]
    no_labels: bool,

    /// Write normalized per-class probabilities.
    #[arg(long)]
    probabilities: bool,

    /// Write the normalized foreground probability.
    #[arg(long)]
    foreground: bool,

    /// Chunks each accumulator array caches in memory.
    #[arg(long, default_value_t = DEFAULT_CACHE_CHUNKS, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    cache_chunks: usize,

    /// Emit a preview after every N-th z-row of windows.
    #[arg(long, requires = "preview_dir", value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    preview_interval: Option<usize>,

    /// Directory receiving preview PNGs (every z-row unless
    /// `--preview-interval` is given).
    #[arg(long)]
    preview_dir: Option<PathBuf>,

    /// Export every written output to BigTIFF in this directory.
    #[arg(long)]
    export_tiff: Option<PathBuf>,

    /// Intensity at which the threshold model is undecided.
    #[arg(long, default_value_t = 0.5)]
    threshold: f32,

    /// Slope of the threshold model's logistic curve.
    #[arg(long, default_value_t = 10.0)]
    steepness: f32,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Full inference config as a JSON string.
    ///
    /// When provided, all other inference parameter flags are ignored.
    /// The JSON must be a valid `InferenceConfig` serialization; missing
    /// fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,
}

/// Errors reported by the binary.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),

    #[error("error parsing --config-json: {0}")]
    ConfigJson(#[source] serde_json::Error),

    #[error("error serializing output: {0}")]
    Json(#[source] serde_json::Error),

    #[error("cannot create {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Expand one value to all three axes, or take exactly three.
fn axes(values: &[usize], flag: &str) -> Result<[usize; 3], CliError> {
    match *values {
        [v] => Ok([v; 3]),
        [z, x, y] => Ok([z, x, y]),
        _ => Err(CliError::Usage(format!(
            "--{flag} takes 1 or 3 comma-separated values, got {}",
            values.len()
        ))),
    }
}

/// Build an [`InferenceConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored. Otherwise, a config is
/// assembled from the individual flags.
fn config_from_args(args: &PredictArgs) -> Result<InferenceConfig, CliError> {
    if let Some(ref json) = args.config_json {
        return serde_json::from_str(json).map_err(CliError::ConfigJson);
    }

    let size = match &args.window {
        Some(values) => axes(values, "window")?,
        None => [DEFAULT_WINDOW_SIZE; 3],
    };
    let window = match &args.overlap {
        Some(values) => WindowSpec::new(size, axes(values, "overlap")?),
        None => WindowSpec::with_default_overlap(size),
    };

    Ok(InferenceConfig {
        window,
        n_classes: args.classes,
        foreground_channel: args.foreground_channel,
        outputs: OutputSelection {
            labels: !args.no_labels,
            probabilities: args.probabilities,
            foreground: args.foreground,
        },
        preview_interval: args
            .preview_interval
            .or_else(|| args.preview_dir.as_ref().map(|_| 1)),
        cache_chunks: args.cache_chunks,
    })
}

fn create_dir(path: &Path) -> Result<(), CliError> {
    fs::create_dir_all(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn cmd_predict(args: &PredictArgs) -> Result<(), CliError> {
    let config = config_from_args(args)?;
    if let Some(dir) = &args.preview_dir {
        create_dir(dir)?;
        if config.preview_interval.is_none() {
            tracing::warn!("--preview-dir given but the config disables previews");
        }
    }
    eprintln!("Source: {}", args.source.display());
    eprintln!("Config: {config:#?}");
    eprintln!();

    let mut model = IntensityThreshold::new(args.threshold, args.steepness);
    let mut observer = ProgressObserver::new(args.preview_dir.clone());
    let result = predict_volume_with(
        &mut model,
        &args.source,
        &args.output,
        &config,
        &mut observer,
        &SystemClock::default(),
    );
    observer.finish();
    let outcome = result?;

    if args.json {
        let json = serde_json::to_string_pretty(&outcome.diagnostics).map_err(CliError::Json)?;
        println!("{json}");
    } else {
        println!("{}", outcome.diagnostics.report());
    }
    if !observer.previews().is_empty() {
        eprintln!("{} preview(s) written", observer.previews().len());
    }

    if let Some(dir) = &args.export_tiff {
        create_dir(dir)?;
        let store = ChunkedStore::open(&outcome.outputs.store)?;
        for name in outcome.outputs.outputs.names() {
            let target = dir.join(format!("{name}.tiff"));
            for path in export_array(&store.array_path(name), &target)? {
                eprintln!("TIFF written to {}", path.display());
            }
        }
    }
    Ok(())
}

fn cmd_export(array: &Path, output: &Path) -> Result<(), CliError> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir(parent)?;
    }
    for path in export_array(array, output)? {
        eprintln!("TIFF written to {}", path.display());
    }
    Ok(())
}

/// Metadata of the array at `path`, or of every array in the store at
/// `path`, keyed by array name.
fn collect_metadata(path: &Path) -> Result<BTreeMap<String, ArrayMetadata>, CliError> {
    let mut arrays = BTreeMap::new();
    if path.join(METADATA_FILE).is_file() {
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        arrays.insert(name, ArrayMetadata::read(path)?);
        return Ok(arrays);
    }
    let store = ChunkedStore::open(path)?;
    for name in store.array_names()? {
        let meta = ArrayMetadata::read(&store.array_path(&name))?;
        arrays.insert(name, meta);
    }
    Ok(arrays)
}

fn format_metadata(arrays: &BTreeMap<String, ArrayMetadata>) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for (name, meta) in arrays {
        let _ = writeln!(out, "{name}");
        let _ = writeln!(out, "  dtype:    {}", meta.dtype);
        let _ = writeln!(out, "  shape:    {:?}", meta.shape);
        let _ = writeln!(out, "  chunks:   {:?}", meta.chunks);
        let _ = writeln!(out, "  grid:     {:?}", meta.chunk_grid());
        let _ = writeln!(out, "  complete: {}", meta.complete);
    }
    out
}

fn cmd_info(path: &Path, json: bool) -> Result<(), CliError> {
    let arrays = collect_metadata(path)?;
    if json {
        let text = serde_json::to_string_pretty(&arrays).map_err(CliError::Json)?;
        println!("{text}");
    } else if arrays.is_empty() {
        println!("{}: empty store", path.display());
    } else {
        print!("{}", format_metadata(&arrays));
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let filter = match verbose {
        0 => filter,
        1 => filter.add_directive(LevelFilter::DEBUG.into()),
        _ => filter.add_directive(LevelFilter::TRACE.into()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match &cli.command {
        Command::Predict(args) => cmd_predict(args),
        Command::Export { array, output } => cmd_export(array, output),
        Command::Info { path, json } => cmd_info(path, *json),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
