use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::ModelLoadError;

/// A typed, validated region of the mapped model file.
///
/// `offset` is in bytes from the start of the file, `count` in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub offset: usize,
    pub count: usize,
}

impl Span {
    fn byte_range<T>(&self) -> Range<usize> {
        self.offset..self.offset + self.count * std::mem::size_of::<T>()
    }
}

/// Sequential reader over a memory mapped model file.
///
/// Every read is bounds checked and reported as [`ModelLoadError::Truncated`]
/// instead of reading past the end of the mapping.
#[derive(Debug)]
pub(crate) struct MemoryMapper {
    mmap: Mmap,
    offset: usize,
    path: PathBuf,
}

impl MemoryMapper {
    pub fn open(path: &Path) -> Result<Self, ModelLoadError> {
        let io_error = |source| ModelLoadError::Io { path: path.to_path_buf(), source };

        let file = File::open(path).map_err(io_error)?;
        // SAFETY: the mapping is read-only and model files are not expected to change while loaded.
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file) }.map_err(io_error)?;

        Ok(Self { mmap, offset: 0, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    fn ensure_available(&self, bytes: usize) -> Result<(), ModelLoadError> {
        let end = self.offset.checked_add(bytes).ok_or_else(|| self.invalid("size overflows address space"))?;
        if end > self.mmap.len() {
            return Err(ModelLoadError::Truncated {
                path: self.path.clone(),
                expected: end as u64,
                actual: self.mmap.len() as u64,
            });
        }
        Ok(())
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&[u8], ModelLoadError> {
        self.ensure_available(count)?;
        let result = &self.mmap[self.offset..self.offset + count];
        self.offset += count;
        Ok(result)
    }

    pub fn skip(&mut self, bytes: usize) -> Result<(), ModelLoadError> {
        self.ensure_available(bytes)?;
        self.offset += bytes;
        Ok(())
    }

    /// Moves the cursor to the next multiple of `alignment`.
    pub fn align_to(&mut self, alignment: usize) -> Result<(), ModelLoadError> {
        let padding = self.offset.next_multiple_of(alignment) - self.offset;
        self.skip(padding)
    }

    /// Reserves `count` f32 values at the cursor and returns their span.
    pub fn take_f32(&mut self, count: usize) -> Result<Span, ModelLoadError> {
        let offset = self.offset;
        let bytes = self.get_bytes(count * std::mem::size_of::<f32>())?;
        if bytemuck::try_cast_slice::<u8, f32>(bytes).is_err() {
            return Err(self.invalid(&format!("f32 block at offset {offset} is not 4-byte aligned")));
        }
        Ok(Span { offset, count })
    }

    /// Reserves `count` i8 values at the cursor and returns their span.
    pub fn take_i8(&mut self, count: usize) -> Result<Span, ModelLoadError> {
        let offset = self.offset;
        self.skip(count)?;
        Ok(Span { offset, count })
    }

    /// Resolves a span that was produced by this mapper.
    pub fn f32s(&self, span: Span) -> &[f32] {
        bytemuck::cast_slice(&self.mmap[span.byte_range::<f32>()])
    }

    pub fn i8s(&self, span: Span) -> &[i8] {
        bytemuck::cast_slice(&self.mmap[span.byte_range::<i8>()])
    }

    pub fn invalid(&self, reason: &str) -> ModelLoadError {
        ModelLoadError::InvalidHeader { path: self.path.clone(), reason: reason.to_string() }
    }

    /// Freezes the mapping: no more reads, only span lookups.
    pub fn into_store(self) -> WeightStore {
        WeightStore { mmap: self.mmap }
    }
}

/// Read-only weight storage shared by every session of a model.
///
/// Spans are validated (bounds and alignment) by [`MemoryMapper`] before the
/// store is created, so lookups cannot fail.
pub(crate) struct WeightStore {
    mmap: Mmap,
}

impl WeightStore {
    pub fn f32s(&self, span: Span) -> &[f32] {
        bytemuck::cast_slice(&self.mmap[span.byte_range::<f32>()])
    }

    pub fn i8s(&self, span: Span) -> &[i8] {
        bytemuck::cast_slice(&self.mmap[span.byte_range::<i8>()])
    }

    pub fn mapped_bytes(&self) -> usize {
        self.mmap.len()
    }
}

impl std::fmt::Debug for WeightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightStore").field("mapped_bytes", &self.mmap.len()).finish()
    }
}

/// Allocates a zeroed vector, reporting allocation failure instead of aborting.
pub(crate) fn try_zeroed<T: Clone + Default>(len: usize) -> Result<Vec<T>, std::collections::TryReserveError> {
    let mut values = Vec::new();
    values.try_reserve_exact(len)?;
    values.resize(len, T::default());
    Ok(values)
}
