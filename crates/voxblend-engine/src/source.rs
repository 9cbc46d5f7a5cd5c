//! Read access to the source volume, including reads through the
//! virtual padding.

use std::path::Path;

use ndarray::{Array2, Array3, Axis, Ix3};

use crate::padding::PaddingPlan;
use crate::store::{ArrayMetadata, ChunkedArray, DataType, Element, StoreError};
use crate::types::{EngineError, Stage};

/// A chunked source volume of any supported element type.
///
/// Values are widened to `f32` on read.
#[derive(Debug)]
pub enum SourceVolume {
    /// 8-bit source.
    U8(ChunkedArray<u8>),
    /// 16-bit source.
    U16(ChunkedArray<u16>),
    /// Float source.
    F32(ChunkedArray<f32>),
}

impl SourceVolume {
    /// Open a source array, accepting `(Z, X, Y)` or `(Z, X, Y, 1)`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Shape`] for any other shape (or an empty
    /// axis) and [`EngineError::Store`] if the array cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let meta = ArrayMetadata::read(path).map_err(EngineError::store(Stage::Read))?;
        squeeze_shape(&meta.shape)?;
        let volume = match meta.dtype {
            DataType::U8 => ChunkedArray::open(path).map(Self::U8),
            DataType::U16 => ChunkedArray::open(path).map(Self::U16),
            DataType::F32 => ChunkedArray::open(path).map(Self::F32),
        };
        volume.map_err(EngineError::store(Stage::Read))
    }

    /// Element type of the stored data.
    #[must_use]
    pub const fn dtype(&self) -> DataType {
        match self {
            Self::U8(_) => DataType::U8,
            Self::U16(_) => DataType::U16,
            Self::F32(_) => DataType::F32,
        }
    }

    fn raw_shape(&self) -> &[usize] {
        match self {
            Self::U8(a) => a.shape(),
            Self::U16(a) => a.shape(),
            Self::F32(a) => a.shape(),
        }
    }

    /// Extent of the volume after squeezing the channel axis.
    #[must_use]
    pub fn shape(&self) -> [usize; 3] {
        let s = self.raw_shape();
        [s[0], s[1], s[2]]
    }

    /// Read a region of the unpadded volume as `f32`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the region is out of bounds or a chunk
    /// cannot be read.
    pub fn read_region(&self, origin: [usize; 3], shape: [usize; 3]) -> Result<Array3<f32>, StoreError> {
        match self {
            Self::U8(a) => read_f32(a, origin, shape),
            Self::U16(a) => read_f32(a, origin, shape),
            Self::F32(a) => read_f32(a, origin, shape),
        }
    }

    /// Read one window of the padded volume.
    ///
    /// Only the bounding box of source voxels the reflect map touches is
    /// read; the mirrored patch is then gathered from it in memory.
    ///
    /// # Errors
    ///
    /// Same as [`read_region`](Self::read_region).
    pub fn read_padded(
        &self,
        padding: &PaddingPlan,
        origin: [usize; 3],
        size: [usize; 3],
    ) -> Result<Array3<f32>, StoreError> {
        let indices: [Vec<usize>; 3] = [0, 1, 2].map(|axis| {
            (origin[axis]..origin[axis] + size[axis])
                .map(|p| padding.source_index(axis, p))
                .collect()
        });
        let lo = indices
            .each_ref()
            .map(|idx| idx.iter().copied().min().unwrap_or(0));
        let hi = indices
            .each_ref()
            .map(|idx| idx.iter().copied().max().map_or(0, |m| m + 1));
        let extent = [0, 1, 2].map(|axis| hi[axis] - lo[axis]);

        let mut patch = self.read_region(lo, extent)?;
        for (axis, idx) in indices.iter().enumerate() {
            let local: Vec<usize> = idx.iter().map(|&i| i - lo[axis]).collect();
            let identity = local.len() == extent[axis] && local.iter().enumerate().all(|(k, &i)| k == i);
            if !identity {
                patch = patch.select(Axis(axis), &local);
            }
        }
        Ok(patch)
    }

    /// Read one z-slice of the unpadded volume as `(X, Y)`.
    ///
    /// # Errors
    ///
    /// Same as [`read_region`](Self::read_region).
    pub fn read_slice(&self, z: usize) -> Result<Array2<f32>, StoreError> {
        let [_, nx, ny] = self.shape();
        Ok(self.read_region([z, 0, 0], [1, nx, ny])?.index_axis_move(Axis(0), 0))
    }
}

/// Accept `(Z, X, Y)` or `(Z, X, Y, 1)` with non-empty axes.
fn squeeze_shape(shape: &[usize]) -> Result<[usize; 3], EngineError> {
    let squeezed = match shape {
        &[z, x, y] | &[z, x, y, 1] => [z, x, y],
        _ => {
            return Err(EngineError::Shape {
                shape: shape.to_vec(),
            });
        }
    };
    if squeezed.contains(&0) {
        return Err(EngineError::Shape {
            shape: shape.to_vec(),
        });
    }
    Ok(squeezed)
}

fn read_f32<T: Element>(
    array: &ChunkedArray<T>,
    origin: [usize; 3],
    shape: [usize; 3],
) -> Result<Array3<f32>, StoreError> {
    let mut origin = origin.to_vec();
    let mut shape = shape.to_vec();
    if array.ndim() == 4 {
        origin.push(0);
        shape.push(1);
    }
    let mut data = array.read_region(&origin, &shape)?.mapv(T::to_f32);
    if data.ndim() == 4 {
        data = data.index_axis_move(Axis(3), 0);
    }
    data.into_dimensionality::<Ix3>()
        .map_err(|e| StoreError::Layout(e.to_string()))
}
