//! Chunked, disk-backed N-dimensional arrays.
//!
//! An array lives in its own directory: a JSON metadata file
//! ([`METADATA_FILE`]) describing shape, chunk shape and element type,
//! plus one raw little-endian file per chunk named by its grid index
//! (`"2.0.1"`). Chunks that were never written read back as zeros, and
//! edge chunks are always stored at full chunk size.
//!
//! Region reads and writes touch only the chunks that intersect the
//! region, so arrays far larger than memory can be processed piecewise.
//! Writes go through a bounded write-back cache; call
//! [`ChunkedArray::flush`] (or [`ChunkedArray::close`]) to persist them.
//!
//! # Atomicity
//!
//! Nothing here is transactional. A region update that spans several
//! chunks is applied chunk by chunk, and a failure part-way leaves the
//! earlier chunks updated. Two overlapping updates are only well defined
//! when issued sequentially through the same handle.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::ops::{AddAssign, Range};
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn, Slice, Zip};
use serde::{Deserialize, Serialize};

/// Name of the per-array metadata file.
pub const METADATA_FILE: &str = ".voxarray";

/// Name of the marker file identifying a store directory.
pub const STORE_FILE: &str = ".voxstore";

/// Default number of chunks held in the write-back cache before it is
/// flushed to disk.
pub const DEFAULT_CACHE_CHUNKS: usize = 32;

/// Element type of a chunked array, as recorded in its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// 32-bit IEEE float.
    F32,
}

impl DataType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::F32 => 4,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8 => f.write_str("u8"),
            Self::U16 => f.write_str("u16"),
            Self::F32 => f.write_str("f32"),
        }
    }
}

/// A scalar type that can be stored in a [`ChunkedArray`].
///
/// Chunk files are little-endian on every host. On little-endian targets
/// the codec is a plain byte cast.
pub trait Element:
    bytemuck::Pod + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    /// The on-disk type tag for this element.
    const DTYPE: DataType;

    /// Decode little-endian bytes. Trailing bytes that do not form a
    /// whole element are ignored.
    fn decode_le(bytes: &[u8]) -> Vec<Self>;

    /// Encode values as little-endian bytes.
    fn encode_le(values: &[Self]) -> Vec<u8>;

    /// Widen to `f32` for model input.
    fn to_f32(self) -> f32;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DataType = $dtype;

            fn decode_le(bytes: &[u8]) -> Vec<Self> {
                let whole = bytes.len() - bytes.len() % std::mem::size_of::<$ty>();
                let mut values: Vec<Self> = bytemuck::pod_collect_to_vec(&bytes[..whole]);
                if cfg!(target_endian = "big") {
                    for value in &mut values {
                        *value = <$ty>::from_le_bytes(bytemuck::cast(*value));
                    }
                }
                values
            }

            fn encode_le(values: &[Self]) -> Vec<u8> {
                if cfg!(target_endian = "little") {
                    bytemuck::cast_slice(values).to_vec()
                } else {
                    values.iter().flat_map(|v| v.to_le_bytes()).collect()
                }
            }

            fn to_f32(self) -> f32 {
                f32::from(self)
            }
        }
    };
}

impl_element!(u8, DataType::U8);
impl_element!(u16, DataType::U16);
impl_element!(f32, DataType::F32);

/// Errors raised by the chunked store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem access failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// File or directory being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The metadata file could not be parsed or written.
    #[error("invalid array metadata in {}: {source}", .path.display())]
    Metadata {
        /// Metadata file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The array holds a different element type than requested.
    #[error("array at {} stores {found}, expected {expected}", .path.display())]
    DataType {
        /// Array directory.
        path: PathBuf,
        /// Requested element type.
        expected: DataType,
        /// Element type recorded in metadata.
        found: DataType,
    },

    /// Shape/chunk description is unusable.
    #[error("invalid array layout: {0}")]
    Layout(String),

    /// A region does not fit inside the array.
    #[error("region at {origin:?} with shape {shape:?} exceeds array bounds {bounds:?}")]
    OutOfBounds {
        /// Region origin.
        origin: Vec<usize>,
        /// Region shape.
        shape: Vec<usize>,
        /// Array shape.
        bounds: Vec<usize>,
    },

    /// A chunk file has the wrong size.
    #[error("chunk {} holds {found} bytes, expected {expected}", .path.display())]
    CorruptChunk {
        /// Chunk file path.
        path: PathBuf,
        /// Expected byte length.
        expected: usize,
        /// Actual byte length.
        found: usize,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Persistent description of a chunked array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMetadata {
    /// Array extent per axis.
    pub shape: Vec<usize>,
    /// Chunk extent per axis.
    pub chunks: Vec<usize>,
    /// Element type.
    pub dtype: DataType,
    /// Whether the producer finished writing the array.
    ///
    /// Output arrays are created with `complete = false` and flipped
    /// only after the whole array has been written successfully.
    #[serde(default)]
    pub complete: bool,
}

impl ArrayMetadata {
    /// Read the metadata of the array stored in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be read and
    /// [`StoreError::Metadata`] if it is not valid metadata JSON.
    pub fn read(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(METADATA_FILE);
        let text = fs::read_to_string(&path).map_err(io_error(&path))?;
        let meta: Self =
            serde_json::from_str(&text).map_err(|source| StoreError::Metadata {
                path: path.clone(),
                source,
            })?;
        meta.validate()?;
        Ok(meta)
    }

    fn write(&self, dir: &Path) -> Result<(), StoreError> {
        let path = dir.join(METADATA_FILE);
        let text = serde_json::to_string_pretty(self).map_err(|source| StoreError::Metadata {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, text).map_err(io_error(&path))
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.shape.is_empty() {
            return Err(StoreError::Layout("array must have at least one axis".into()));
        }
        if self.shape.len() != self.chunks.len() {
            return Err(StoreError::Layout(format!(
                "shape {:?} and chunks {:?} have different ranks",
                self.shape, self.chunks
            )));
        }
        if self.chunks.contains(&0) {
            return Err(StoreError::Layout(format!(
                "chunk extents must be non-zero, got {:?}",
                self.chunks
            )));
        }
        Ok(())
    }

    /// Number of elements in one chunk.
    #[must_use]
    pub fn chunk_len(&self) -> usize {
        self.chunks.iter().product()
    }

    /// Number of chunks along each axis.
    #[must_use]
    pub fn chunk_grid(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.chunks)
            .map(|(&s, &c)| s.div_ceil(c))
            .collect()
    }
}

/// One cached chunk.
struct CachedChunk<T> {
    data: Vec<T>,
    dirty: bool,
}

/// Intersection of a region with one chunk.
struct ChunkOverlap {
    /// Chunk grid index.
    index: Vec<usize>,
    /// Overlap in chunk-local coordinates.
    in_chunk: Vec<Range<usize>>,
    /// Overlap in region-local coordinates.
    in_region: Vec<Range<usize>>,
    /// Whether the overlap covers the whole chunk.
    full: bool,
}

/// A disk-backed N-dimensional array with region access.
pub struct ChunkedArray<T: Element> {
    path: PathBuf,
    meta: ArrayMetadata,
    cache: HashMap<Vec<usize>, CachedChunk<T>>,
    cache_capacity: usize,
}

impl<T: Element> fmt::Debug for ChunkedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedArray")
            .field("path", &self.path)
            .field("meta", &self.meta)
            .field("cached_chunks", &self.cache.len())
            .finish()
    }
}

impl<T: Element> ChunkedArray<T> {
    /// Create a new zero-filled array at `path`, replacing any array
    /// already stored there.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Layout`] if `shape` and `chunks` differ in
    /// rank or a chunk extent is zero, and [`StoreError::Io`] if the
    /// directory cannot be (re)created.
    pub fn create(
        path: impl AsRef<Path>,
        shape: &[usize],
        chunks: &[usize],
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let meta = ArrayMetadata {
            shape: shape.to_vec(),
            chunks: chunks.to_vec(),
            dtype: T::DTYPE,
            complete: false,
        };
        meta.validate()?;

        if path.exists() {
            fs::remove_dir_all(&path).map_err(io_error(&path))?;
        }
        fs::create_dir_all(&path).map_err(io_error(&path))?;
        meta.write(&path)?;

        Ok(Self {
            path,
            meta,
            cache: HashMap::new(),
            cache_capacity: DEFAULT_CACHE_CHUNKS,
        })
    }

    /// Open an existing array.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DataType`] if the array holds a different
    /// element type, or the errors of [`ArrayMetadata::read`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let meta = ArrayMetadata::read(&path)?;
        if meta.dtype != T::DTYPE {
            return Err(StoreError::DataType {
                path,
                expected: T::DTYPE,
                found: meta.dtype,
            });
        }
        Ok(Self {
            path,
            meta,
            cache: HashMap::new(),
            cache_capacity: DEFAULT_CACHE_CHUNKS,
        })
    }

    /// Write an in-memory array into a new chunked array at `path`.
    ///
    /// The result is flushed and marked complete.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create) and [`write_region`](Self::write_region).
    pub fn from_array(
        path: impl AsRef<Path>,
        data: ArrayViewD<'_, T>,
        chunks: &[usize],
    ) -> Result<Self, StoreError> {
        let mut array = Self::create(path, data.shape(), chunks)?;
        let origin = vec![0; data.ndim()];
        array.write_region(&origin, data)?;
        array.set_complete(true)?;
        Ok(array)
    }

    /// Set how many chunks the write-back cache may hold (minimum 1).
    #[must_use]
    pub fn with_cache_capacity(mut self, chunks: usize) -> Self {
        self.cache_capacity = chunks.max(1);
        self
    }

    /// Directory holding the array.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Array extent per axis.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    /// Chunk extent per axis.
    #[must_use]
    pub fn chunks(&self) -> &[usize] {
        &self.meta.chunks
    }

    /// Number of axes.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.meta.shape.len()
    }

    /// Full metadata record.
    #[must_use]
    pub const fn metadata(&self) -> &ArrayMetadata {
        &self.meta
    }

    /// Whether the array has been marked complete by its producer.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.meta.complete
    }

    /// Record the completion flag in the metadata file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the metadata cannot be written.
    pub fn set_complete(&mut self, complete: bool) -> Result<(), StoreError> {
        if complete {
            self.flush()?;
        }
        self.meta.complete = complete;
        self.meta.write(&self.path)
    }

    /// Read a rectangular region into memory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OutOfBounds`] if the region leaves the
    /// array, or an I/O / corruption error from the chunk files.
    pub fn read_region(&self, origin: &[usize], shape: &[usize]) -> Result<ArrayD<T>, StoreError> {
        self.check_bounds(origin, shape)?;
        let mut out = ArrayD::<T>::default(IxDyn(shape));

        for overlap in self.overlaps(origin, shape) {
            let mut dst = out.slice_each_axis_mut(|ax| {
                Slice::from(overlap.in_region[ax.axis.index()].clone())
            });
            if let Some(cached) = self.cache.get(&overlap.index) {
                let chunk = self.chunk_view(&cached.data)?;
                dst.assign(&chunk.slice_each_axis(|ax| {
                    Slice::from(overlap.in_chunk[ax.axis.index()].clone())
                }));
            } else if let Some(data) = self.read_chunk_file(&overlap.index)? {
                let chunk = self.chunk_view(&data)?;
                dst.assign(&chunk.slice_each_axis(|ax| {
                    Slice::from(overlap.in_chunk[ax.axis.index()].clone())
                }));
            }
        }

        Ok(out)
    }

    /// Read the whole array into memory.
    ///
    /// # Errors
    ///
    /// Same as [`read_region`](Self::read_region).
    pub fn read_all(&self) -> Result<ArrayD<T>, StoreError> {
        let origin = vec![0; self.ndim()];
        let shape = self.meta.shape.clone();
        self.read_region(&origin, &shape)
    }

    /// Overwrite a region with `data`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OutOfBounds`] if the region leaves the
    /// array, or an I/O error when the cache spills to disk.
    pub fn write_region(&mut self, origin: &[usize], data: ArrayViewD<'_, T>) -> Result<(), StoreError> {
        self.update_region(origin, data, true, |dst, src| *dst = src)
    }

    /// Add `data` element-wise into a region (read-modify-write).
    ///
    /// # Errors
    ///
    /// Same as [`write_region`](Self::write_region).
    pub fn add_region(&mut self, origin: &[usize], data: ArrayViewD<'_, T>) -> Result<(), StoreError>
    where
        T: AddAssign,
    {
        self.update_region(origin, data, false, |dst, src| *dst += src)
    }

    /// Persist every dirty cached chunk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if a chunk file cannot be written.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        for (index, chunk) in &mut self.cache {
            if chunk.dirty {
                let path = self.path.join(chunk_file_name(index));
                fs::write(&path, T::encode_le(&chunk.data)).map_err(io_error(&path))?;
                chunk.dirty = false;
            }
        }
        Ok(())
    }

    /// Flush and release the array.
    ///
    /// # Errors
    ///
    /// Same as [`flush`](Self::flush).
    pub fn close(mut self) -> Result<(), StoreError> {
        self.flush()
    }

    /// Delete the array from disk, discarding unflushed writes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be removed.
    pub fn remove(mut self) -> Result<(), StoreError> {
        self.cache.clear();
        let path = std::mem::take(&mut self.path);
        drop(self);
        fs::remove_dir_all(&path).map_err(io_error(&path))
    }

    fn update_region<F>(
        &mut self,
        origin: &[usize],
        data: ArrayViewD<'_, T>,
        overwrite: bool,
        mut op: F,
    ) -> Result<(), StoreError>
    where
        F: FnMut(&mut T, T),
    {
        self.check_bounds(origin, data.shape())?;

        for overlap in self.overlaps(origin, data.shape()) {
            let mut chunk = match self.cache.remove(&overlap.index) {
                Some(cached) => cached.data,
                None if overwrite && overlap.full => vec![T::default(); self.meta.chunk_len()],
                None => self
                    .read_chunk_file(&overlap.index)?
                    .unwrap_or_else(|| vec![T::default(); self.meta.chunk_len()]),
            };

            {
                let mut view = ArrayViewMutD::from_shape(IxDyn(&self.meta.chunks), &mut chunk)
                    .map_err(|e| StoreError::Layout(e.to_string()))?;
                let mut dst = view.slice_each_axis_mut(|ax| {
                    Slice::from(overlap.in_chunk[ax.axis.index()].clone())
                });
                let src = data.slice_each_axis(|ax| {
                    Slice::from(overlap.in_region[ax.axis.index()].clone())
                });
                Zip::from(&mut dst).and(&src).for_each(|d, &s| op(d, s));
            }

            self.cache.insert(
                overlap.index,
                CachedChunk {
                    data: chunk,
                    dirty: true,
                },
            );
        }

        if self.cache.len() > self.cache_capacity {
            tracing::trace!(
                path = %self.path.display(),
                chunks = self.cache.len(),
                "spilling chunk cache"
            );
            self.flush()?;
            self.cache.clear();
        }
        Ok(())
    }

    fn check_bounds(&self, origin: &[usize], shape: &[usize]) -> Result<(), StoreError> {
        let fits = origin.len() == self.ndim()
            && shape.len() == self.ndim()
            && origin
                .iter()
                .zip(shape)
                .zip(&self.meta.shape)
                .all(|((&o, &s), &bound)| o.checked_add(s).is_some_and(|end| end <= bound));
        if fits {
            Ok(())
        } else {
            Err(StoreError::OutOfBounds {
                origin: origin.to_vec(),
                shape: shape.to_vec(),
                bounds: self.meta.shape.clone(),
            })
        }
    }

    /// Chunks intersecting a (bounds-checked) region.
    fn overlaps(&self, origin: &[usize], shape: &[usize]) -> Vec<ChunkOverlap> {
        if shape.contains(&0) {
            return Vec::new();
        }
        let chunks = &self.meta.chunks;
        let first: Vec<usize> = origin.iter().zip(chunks).map(|(&o, &c)| o / c).collect();
        let last: Vec<usize> = origin
            .iter()
            .zip(shape)
            .zip(chunks)
            .map(|((&o, &s), &c)| (o + s - 1) / c)
            .collect();

        grid_indices(&first, &last)
            .into_iter()
            .map(|index| {
                let mut in_chunk = Vec::with_capacity(index.len());
                let mut in_region = Vec::with_capacity(index.len());
                let mut full = true;
                for axis in 0..index.len() {
                    let chunk_start = index[axis] * chunks[axis];
                    let chunk_end = chunk_start + chunks[axis];
                    let start = origin[axis].max(chunk_start);
                    let end = (origin[axis] + shape[axis]).min(chunk_end);
                    full &= start == chunk_start && end == chunk_end;
                    in_chunk.push(start - chunk_start..end - chunk_start);
                    in_region.push(start - origin[axis]..end - origin[axis]);
                }
                ChunkOverlap {
                    index,
                    in_chunk,
                    in_region,
                    full,
                }
            })
            .collect()
    }

    fn chunk_view<'a>(&self, data: &'a [T]) -> Result<ArrayViewD<'a, T>, StoreError> {
        ArrayViewD::from_shape(IxDyn(&self.meta.chunks), data)
            .map_err(|e| StoreError::Layout(e.to_string()))
    }

    fn read_chunk_file(&self, index: &[usize]) -> Result<Option<Vec<T>>, StoreError> {
        let path = self.path.join(chunk_file_name(index));
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let expected = self.meta.chunk_len() * T::DTYPE.size();
        if bytes.len() != expected {
            return Err(StoreError::CorruptChunk {
                path,
                expected,
                found: bytes.len(),
            });
        }
        Ok(Some(T::decode_le(&bytes)))
    }
}

impl<T: Element> Drop for ChunkedArray<T> {
    fn drop(&mut self) {
        if self.cache.values().any(|c| c.dirty)
            && let Err(err) = self.flush()
        {
            tracing::warn!(path = %self.path.display(), %err, "failed to flush chunked array on drop");
        }
    }
}

fn chunk_file_name(index: &[usize]) -> String {
    index
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// All grid indices between `first` and `last` inclusive, last axis fastest.
fn grid_indices(first: &[usize], last: &[usize]) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut current = first.to_vec();
    loop {
        out.push(current.clone());
        let mut axis = current.len();
        loop {
            if axis == 0 {
                return out;
            }
            axis -= 1;
            if current[axis] < last[axis] {
                current[axis] += 1;
                break;
            }
            current[axis] = first[axis];
        }
    }
}

/// A directory of named chunked arrays.
#[derive(Debug, Clone)]
pub struct ChunkedStore {
    root: PathBuf,
}

impl ChunkedStore {
    /// Create (or reuse) a store directory at `root`.
    ///
    /// Existing arrays in the directory are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory or marker file cannot
    /// be written.
    pub fn create(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(io_error(&root))?;
        let marker = root.join(STORE_FILE);
        if !marker.is_file() {
            fs::write(&marker, "{}\n").map_err(io_error(&marker))?;
        }
        Ok(Self { root })
    }

    /// Open an existing store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Layout`] if `root` is not a store directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        if !root.join(STORE_FILE).is_file() {
            return Err(StoreError::Layout(format!(
                "{} is not a chunked store",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Store directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the array called `name`.
    #[must_use]
    pub fn array_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Whether an array called `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.array_path(name).join(METADATA_FILE).is_file()
    }

    /// Create (or replace) the array called `name`.
    ///
    /// # Errors
    ///
    /// Same as [`ChunkedArray::create`].
    pub fn create_array<T: Element>(
        &self,
        name: &str,
        shape: &[usize],
        chunks: &[usize],
    ) -> Result<ChunkedArray<T>, StoreError> {
        ChunkedArray::create(self.array_path(name), shape, chunks)
    }

    /// Open the array called `name`.
    ///
    /// # Errors
    ///
    /// Same as [`ChunkedArray::open`].
    pub fn open_array<T: Element>(&self, name: &str) -> Result<ChunkedArray<T>, StoreError> {
        ChunkedArray::open(self.array_path(name))
    }

    /// Delete the array called `name` if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be removed.
    pub fn remove_array(&self, name: &str) -> Result<(), StoreError> {
        let path = self.array_path(name);
        if path.exists() {
            fs::remove_dir_all(&path).map_err(io_error(&path))?;
        }
        Ok(())
    }

    /// Names of all arrays in the store, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be listed.
    pub fn array_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_error(&self.root))? {
            let entry = entry.map_err(io_error(&self.root))?;
            if entry.path().join(METADATA_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::{Array3, ArrayD, IxDyn};

    use super::*;

    #[test]
    fn codec_is_little_endian_and_ignores_partial_elements() {
        let values = [1.5f32, -2.0];
        let mut bytes = vec![0u8];
        bytes.extend(f32::encode_le(&values));
        bytes.push(0xff);
        assert_eq!(&bytes[1..5], &1.5f32.to_le_bytes());

        // Misaligned start and a dangling trailing byte.
        assert_eq!(f32::decode_le(&bytes[1..]), values);
        assert_eq!(u16::decode_le(&[0x34, 0x12, 0x78]), vec![0x1234]);
    }

    fn ramp(shape: &[usize]) -> ArrayD<f32> {
        let len: usize = shape.iter().product();
        #[allow(clippy::cast_precision_loss)]
        ArrayD::from_shape_vec(IxDyn(shape), (0..len).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn create_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let array = ChunkedArray::<f32>::create(dir.path().join("a"), &[5, 6, 7], &[2, 3, 4]).unwrap();
        assert_eq!(array.shape(), &[5, 6, 7]);
        assert!(!array.is_complete());

        let meta = ArrayMetadata::read(&dir.path().join("a")).unwrap();
        assert_eq!(meta.dtype, DataType::F32);
        assert_eq!(meta.chunk_grid(), vec![3, 2, 2]);
    }

    #[test]
    fn create_rejects_mismatched_rank() {
        let dir = tempfile::tempdir().unwrap();
        let result = ChunkedArray::<u8>::create(dir.path().join("a"), &[4, 4], &[2, 2, 2]);
        assert!(matches!(result, Err(StoreError::Layout(_))));
    }

    #[test]
    fn create_rejects_zero_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let result = ChunkedArray::<u8>::create(dir.path().join("a"), &[4, 4], &[2, 0]);
        assert!(matches!(result, Err(StoreError::Layout(_))));
    }

    #[test]
    fn unwritten_array_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let array = ChunkedArray::<f32>::create(dir.path().join("a"), &[4, 4, 4], &[2, 2, 2]).unwrap();
        let region = array.read_region(&[1, 1, 1], &[3, 3, 3]).unwrap();
        assert!(region.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn region_round_trip_across_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let data = ramp(&[5, 4, 3]);
        {
            let mut array = ChunkedArray::<f32>::create(&path, &[9, 9, 9], &[2, 3, 4]).unwrap();
            array.write_region(&[3, 2, 5], data.view()).unwrap();
            array.close().unwrap();
        }

        let array = ChunkedArray::<f32>::open(&path).unwrap();
        let back = array.read_region(&[3, 2, 5], &[5, 4, 3]).unwrap();
        assert_eq!(back, data);

        // Surrounding voxels stay zero.
        let wider = array.read_region(&[2, 1, 4], &[7, 6, 5]).unwrap();
        assert_eq!(wider.iter().filter(|&&v| v != 0.0).count(), 59);
    }

    #[test]
    fn reads_see_unflushed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = ChunkedArray::<u8>::create(dir.path().join("a"), &[4, 4], &[2, 2]).unwrap();
        let data = ArrayD::from_elem(IxDyn(&[2, 3]), 7u8);
        array.write_region(&[1, 0], data.view()).unwrap();
        let back = array.read_region(&[1, 0], &[2, 3]).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn add_region_accumulates_overlaps() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = ChunkedArray::<f32>::create(dir.path().join("a"), &[6, 6, 6], &[4, 4, 4]).unwrap();
        let ones = ArrayD::from_elem(IxDyn(&[4, 4, 4]), 1.0f32);
        array.add_region(&[0, 0, 0], ones.view()).unwrap();
        array.add_region(&[2, 2, 2], ones.view()).unwrap();

        let all = array.read_all().unwrap();
        assert!((all[[3, 3, 3]] - 2.0).abs() < f32::EPSILON);
        assert!((all[[0, 0, 0]] - 1.0).abs() < f32::EPSILON);
        assert!((all[[5, 5, 5]] - 1.0).abs() < f32::EPSILON);
        assert!(all[[0, 5, 0]].abs() < f32::EPSILON);
    }

    #[test]
    fn cache_spill_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let mut array = ChunkedArray::<f32>::create(&path, &[8, 8, 8], &[2, 2, 2])
            .unwrap()
            .with_cache_capacity(1);
        let data = ramp(&[8, 8, 8]);
        array.add_region(&[0, 0, 0], data.view()).unwrap();
        array.add_region(&[0, 0, 0], data.view()).unwrap();
        drop(array);

        let array = ChunkedArray::<f32>::open(&path).unwrap();
        assert_eq!(array.read_all().unwrap(), data.mapv(|v| v * 2.0));
    }

    #[test]
    fn out_of_bounds_region_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = ChunkedArray::<u8>::create(dir.path().join("a"), &[4, 4], &[2, 2]).unwrap();
        let data = ArrayD::from_elem(IxDyn(&[2, 2]), 1u8);
        assert!(matches!(
            array.write_region(&[3, 0], data.view()),
            Err(StoreError::OutOfBounds { .. })
        ));
        assert!(matches!(
            array.read_region(&[0, 0, 0], &[1, 1, 1]),
            Err(StoreError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn open_with_wrong_type_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        ChunkedArray::<u8>::create(&path, &[2, 2], &[2, 2]).unwrap();
        let result = ChunkedArray::<f32>::open(&path);
        assert!(matches!(
            result,
            Err(StoreError::DataType {
                expected: DataType::F32,
                found: DataType::U8,
                ..
            })
        ));
    }

    #[test]
    fn truncated_chunk_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let mut array = ChunkedArray::<u16>::create(&path, &[2, 2], &[2, 2]).unwrap();
        array
            .write_region(&[0, 0], ArrayD::from_elem(IxDyn(&[2, 2]), 3u16).view())
            .unwrap();
        array.close().unwrap();
        fs::write(path.join("0.0"), [0u8; 3]).unwrap();

        let array = ChunkedArray::<u16>::open(&path).unwrap();
        assert!(matches!(
            array.read_all(),
            Err(StoreError::CorruptChunk {
                expected: 8,
                found: 3,
                ..
            })
        ));
    }

    #[test]
    fn completion_flag_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let mut array = ChunkedArray::<u8>::create(&path, &[2], &[2]).unwrap();
        array.set_complete(true).unwrap();
        drop(array);
        assert!(ChunkedArray::<u8>::open(&path).unwrap().is_complete());
    }

    #[test]
    fn from_array_is_complete_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array3::from_shape_fn((3, 4, 5), |(z, x, y)| {
            u16::try_from(z * 100 + x * 10 + y).unwrap()
        });
        let array =
            ChunkedArray::from_array(dir.path().join("a"), data.view().into_dyn(), &[2, 2, 2]).unwrap();
        assert!(array.is_complete());
        assert_eq!(array.read_all().unwrap(), data.into_dyn());
    }

    #[test]
    fn remove_deletes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let mut array = ChunkedArray::<f32>::create(&path, &[2, 2], &[1, 1]).unwrap();
        array
            .add_region(&[0, 0], ArrayD::from_elem(IxDyn(&[2, 2]), 1.0).view())
            .unwrap();
        array.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn store_manages_named_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkedStore::create(dir.path().join("out")).unwrap();
        store.create_array::<u8>("labels", &[2, 2], &[2, 2]).unwrap();
        store.create_array::<f32>("sum", &[2, 2], &[2, 2]).unwrap();
        assert!(store.contains("labels"));
        assert_eq!(store.array_names().unwrap(), vec!["labels", "sum"]);

        store.remove_array("sum").unwrap();
        assert!(!store.contains("sum"));
        assert!(ChunkedStore::open(store.root()).is_ok());
    }

    #[test]
    fn open_rejects_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ChunkedStore::open(dir.path()),
            Err(StoreError::Layout(_))
        ));
    }

    #[test]
    fn grid_indices_enumerate_last_axis_fastest() {
        assert_eq!(
            grid_indices(&[0, 1], &[1, 2]),
            vec![vec![0, 1], vec![0, 2], vec![1, 1], vec![1, 2]]
        );
    }
}
