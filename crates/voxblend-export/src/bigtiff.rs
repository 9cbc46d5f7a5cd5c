//! Multi-page BigTIFF export of chunked volumes.
//!
//! Pages are written in ascending z, one `(X rows, Y columns)` slice at a
//! time, so only one slice is ever held in memory. Four-dimensional
//! arrays are exported one channel per file.

use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use tiff::encoder::{TiffEncoder, TiffValue, colortype};
use voxblend_engine::store::ArrayMetadata;
use voxblend_engine::{ChunkedArray, DataType, Element};

use crate::ExportError;

/// An element type with a single-channel TIFF representation.
pub trait TiffPixel: Element {
    /// Matching TIFF color type.
    type Color: colortype::ColorType<Inner = Self>;
}

impl TiffPixel for u8 {
    type Color = colortype::Gray8;
}

impl TiffPixel for u16 {
    type Color = colortype::Gray16;
}

impl TiffPixel for f32 {
    type Color = colortype::Gray32Float;
}

/// Stream one channel of `array` into `writer` as a multi-page BigTIFF.
///
/// `channel` selects the last-axis index of a 4-D array and must be
/// `None` for a 3-D array. Returns the number of pages written.
///
/// # Errors
///
/// Returns [`ExportError::Shape`] for arrays that are not 3-D or 4-D,
/// [`ExportError::Channel`] for a missing or out-of-range channel,
/// [`ExportError::Dimension`] if a slice exceeds TIFF limits, and
/// read/encode errors tagged with the failing slice.
pub fn write_volume<T, W>(
    array: &ChunkedArray<T>,
    channel: Option<usize>,
    writer: W,
) -> Result<usize, ExportError>
where
    T: TiffPixel,
    [T]: TiffValue,
    W: Write + Seek,
{
    let shape = array.shape().to_vec();
    let (depth, rows, columns) = match (shape.as_slice(), channel) {
        (&[z, x, y], None) => (z, x, y),
        (&[z, x, y, channels], Some(c)) if c < channels => (z, x, y),
        (&[_, _, _, channels], c) => {
            return Err(ExportError::Channel {
                channel: c,
                channels,
            });
        }
        (&[_, _, _], Some(c)) => {
            return Err(ExportError::Channel {
                channel: Some(c),
                channels: 1,
            });
        }
        _ => return Err(ExportError::Shape { shape }),
    };
    let width = u32::try_from(columns).map_err(|_| ExportError::Dimension { rows, columns })?;
    let height = u32::try_from(rows).map_err(|_| ExportError::Dimension { rows, columns })?;

    let mut encoder = TiffEncoder::new_big(writer).map_err(ExportError::Encoder)?;
    for z in 0..depth {
        let (origin, extent) = match channel {
            Some(c) => (vec![z, 0, 0, c], vec![1, rows, columns, 1]),
            None => (vec![z, 0, 0], vec![1, rows, columns]),
        };
        let slice = array
            .read_region(&origin, &extent)
            .map_err(|source| ExportError::Read { z, source })?;
        let (data, _) = slice.into_raw_vec_and_offset();
        encoder
            .write_image::<T::Color>(width, height, &data)
            .map_err(|source| ExportError::Page { z, source })?;
        tracing::trace!(z, "page written");
    }
    Ok(depth)
}

/// Path of the per-channel file derived from `output`.
///
/// `out/labels.tiff` becomes `out/labels_channel_2.tiff`.
#[must_use]
pub fn channel_path(output: &Path, channel: usize) -> PathBuf {
    let stem = output
        .file_stem()
        .map_or_else(|| "export".to_owned(), |s| s.to_string_lossy().into_owned());
    output.with_file_name(format!("{stem}_channel_{channel}.tiff"))
}

/// Export the chunked array stored at `array_dir` to BigTIFF.
///
/// A 3-D array is written to `output`; a 4-D array is written as one
/// file per channel next to it (see [`channel_path`]). Returns the files
/// written.
///
/// A failure leaves a partial TIFF behind but never touches the array.
///
/// # Errors
///
/// Returns [`ExportError::Store`] if the array cannot be opened,
/// [`ExportError::Io`] if an output file cannot be created, and the
/// errors of [`write_volume`].
pub fn export_array(array_dir: &Path, output: &Path) -> Result<Vec<PathBuf>, ExportError> {
    let meta = ArrayMetadata::read(array_dir)?;
    if !meta.complete {
        tracing::warn!(
            array = %array_dir.display(),
            "exporting an array that is not marked complete"
        );
    }
    match meta.dtype {
        DataType::U8 => export_typed::<u8>(array_dir, output, &meta),
        DataType::U16 => export_typed::<u16>(array_dir, output, &meta),
        DataType::F32 => export_typed::<f32>(array_dir, output, &meta),
    }
}

fn export_typed<T>(array_dir: &Path, output: &Path, meta: &ArrayMetadata) -> Result<Vec<PathBuf>, ExportError>
where
    T: TiffPixel,
    [T]: TiffValue,
{
    let array = ChunkedArray::<T>::open(array_dir)?;
    let targets: Vec<(Option<usize>, PathBuf)> = match meta.shape.as_slice() {
        &[_, _, _] => vec![(None, output.to_path_buf())],
        &[_, _, _, channels] => (0..channels)
            .map(|c| (Some(c), channel_path(output, c)))
            .collect(),
        _ => {
            return Err(ExportError::Shape {
                shape: meta.shape.clone(),
            });
        }
    };

    let mut written = Vec::with_capacity(targets.len());
    for (channel, path) in targets {
        let file = File::create(&path).map_err(|source| ExportError::Io {
            path: path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        let pages = write_volume(&array, channel, &mut writer)?;
        writer.flush().map_err(|source| ExportError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::info!(path = %path.display(), pages, "BigTIFF written");
        written.push(path);
    }
    Ok(written)
}
