//! voxblend-export: writers for inference results.
//!
//! Streams chunked volumes into multi-page BigTIFF files and renders
//! diagnostic preview slices as PNG. Nothing here modifies the store it
//! reads from.

use std::io;
use std::path::PathBuf;

use voxblend_engine::StoreError;

pub mod bigtiff;
pub mod preview;

pub use bigtiff::{channel_path, export_array, write_volume};
pub use preview::{encode_preview_png, preview_file_name, render_preview};

/// Errors raised while exporting.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The source array could not be opened.
    #[error("export failed: {0}")]
    Store(#[from] StoreError),

    /// A slice could not be read from the source array.
    #[error("export failed reading slice {z}: {source}")]
    Read {
        /// Slice index.
        z: usize,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// The TIFF stream could not be started.
    #[error("export failed: cannot start TIFF stream: {0}")]
    Encoder(#[source] tiff::TiffError),

    /// A page could not be encoded or written.
    #[error("export failed writing slice {z}: {source}")]
    Page {
        /// Slice index.
        z: usize,
        /// Underlying encoder error.
        #[source]
        source: tiff::TiffError,
    },

    /// An output file could not be created or flushed.
    #[error("export failed: I/O error on {}: {source}", .path.display())]
    Io {
        /// Output file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The array is neither 3-D nor 4-D.
    #[error("export failed: expected a 3-D or 4-D array, got shape {shape:?}")]
    Shape {
        /// Array shape.
        shape: Vec<usize>,
    },

    /// The requested channel does not exist (or a channel was required).
    #[error("export failed: channel {channel:?} is not valid for an array with {channels} channel(s)")]
    Channel {
        /// Requested channel.
        channel: Option<usize>,
        /// Channels available.
        channels: usize,
    },

    /// A slice is too large for the output format.
    #[error("export failed: slice of {rows}x{columns} exceeds format limits")]
    Dimension {
        /// Slice rows (X).
        rows: usize,
        /// Slice columns (Y).
        columns: usize,
    },

    /// PNG encoding failed.
    #[error("export failed: PNG encoding failed: {0}")]
    Png(#[from] image::ImageError),
}
