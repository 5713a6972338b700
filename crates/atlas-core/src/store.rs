//! Memory-mapped embedding storage
//!
//! Zero-copy access to rows of an .aemb file through the OS page cache.
//! Float sections are reinterpreted with `bytemuck::try_cast_slice`, which
//! checks alignment instead of assuming it.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::atom::{AtomId, TenantId};
use crate::format::{read_u64, EmbeddingHeader, EmbeddingRow, FormatError, OPEN_INTERVAL};
use crate::geometry::{Coord, MAX_AXES};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index out of bounds: {index} >= {count}")]
    IndexOutOfBounds { index: usize, count: usize },

    #[error("Alignment error: byte slice not aligned to f32 (4 bytes)")]
    AlignmentError,
}

/// Memory-mapped reader over an .aemb file
pub struct EmbeddingStore {
    mmap: Mmap,
    pub header: EmbeddingHeader,
}

impl EmbeddingStore {
    /// Open an .aemb file for reading
    ///
    /// The file must not be truncated or modified while mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let header = EmbeddingHeader::from_bytes(&mmap)?;

        let expected = header.file_size();
        if mmap.len() < expected {
            return Err(FormatError::Truncated {
                expected,
                actual: mmap.len(),
            }
            .into());
        }
        Ok(Self { mmap, header })
    }

    pub fn len(&self) -> usize {
        self.header.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.count == 0
    }

    pub fn dim(&self) -> usize {
        self.header.dimensions as usize
    }

    pub fn axes(&self) -> usize {
        self.header.axes as usize
    }

    pub fn row(&self, index: usize) -> Result<EmbeddingRow<'_>, StoreError> {
        if index >= self.len() {
            return Err(StoreError::IndexOutOfBounds {
                index,
                count: self.len(),
            });
        }
        let start = self.header.offset(index);
        let bytes = &self.mmap[start..start + self.header.row_size()];

        let coords: &[f32] =
            bytemuck::try_cast_slice(&bytes[40..56]).map_err(|_| StoreError::AlignmentError)?;
        let mut values = [0.0f32; MAX_AXES];
        values.copy_from_slice(coords);
        let vector: &[f32] =
            bytemuck::try_cast_slice(&bytes[56..]).map_err(|_| StoreError::AlignmentError)?;

        let valid_to = read_u64(bytes, 24);
        Ok(EmbeddingRow {
            atom: AtomId(read_u64(bytes, 0)),
            tenant: TenantId(read_u64(bytes, 8)),
            valid_from: read_u64(bytes, 16),
            valid_to: (valid_to != OPEN_INTERVAL).then_some(valid_to),
            key: read_u64(bytes, 32),
            coord: Coord::from_array(self.axes(), values),
            vector,
        })
    }

    pub fn memory_bytes(&self) -> usize {
        self.mmap.len()
    }

    pub fn iter(&self) -> RowIter<'_> {
        RowIter {
            store: self,
            index: 0,
        }
    }
}

/// Iterator over rows in the store
pub struct RowIter<'a> {
    store: &'a EmbeddingStore,
    index: usize,
}

impl<'a> Iterator for RowIter<'a> {
    type Item = Result<EmbeddingRow<'a>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.store.len() {
            return None;
        }
        let row = self.store.row(self.index);
        self.index += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.store.len() - self.index;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for RowIter<'a> {}
