//! .aemb embedding file format
//!
//! One file per namespace in a snapshot.
//!
//! # File Structure
//!
//! ```text
//! Offset   Size      Type        Description
//! ──────────────────────────────────────────────────────────
//! 0x00     8         [u8; 8]     Magic: "ATLSEMB1"
//! 0x08     4         u32 LE      N: Number of rows
//! 0x0C     4         u32 LE      D: Source dimensions
//! 0x10     4         u32 LE      A: Projected axes
//! 0x14     4         u32 LE      Namespace id
//! 0x18     4         u32 LE      Landmark set version
//! 0x1C     4         u32 LE      Reserved (0)
//! 0x20     N*R       rows        R = 56 + 4*D
//! ```
//!
//! Row layout:
//!
//! ```text
//! 0        8         u64 LE      AtomId
//! 8        8         u64 LE      TenantId
//! 16       8         u64 LE      valid_from (µs)
//! 24       8         u64 LE      valid_to (µs, u64::MAX = open)
//! 32       8         u64 LE      Hilbert key
//! 40       16        [f32; 4]    Coordinate (unused axes zero)
//! 56       4*D       [f32]       Raw vector
//! ```
//!
//! Every row is a multiple of 4 bytes and the header is 32 bytes, so the
//! float sections stay 4-byte aligned inside a page-aligned mapping.

use std::fs::File;
use std::io::{self, BufWriter, Seek, Write};
use std::path::Path;

use thiserror::Error;

use crate::atom::{AtomId, TenantId};
use crate::geometry::{Coord, MAX_AXES, MIN_AXES};

/// Magic bytes identifying an .aemb file
pub const MAGIC: [u8; 8] = *b"ATLSEMB1";

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Fixed part of a row before the raw vector
pub const ROW_PREFIX: usize = 56;

/// Sentinel for an open `valid_to`
pub const OPEN_INTERVAL: u64 = u64::MAX;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic bytes: expected ATLSEMB1")]
    InvalidMagic,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Axis count {0} outside supported range")]
    InvalidAxes(usize),

    #[error("File truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed .aemb header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingHeader {
    pub count: u32,
    pub dimensions: u32,
    pub axes: u32,
    pub namespace: u32,
    pub landmark_version: u32,
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

impl EmbeddingHeader {
    /// Parse header from the first 32 bytes of a file
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0..8] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }
        let header = Self {
            count: read_u32(bytes, 8),
            dimensions: read_u32(bytes, 12),
            axes: read_u32(bytes, 16),
            namespace: read_u32(bytes, 20),
            landmark_version: read_u32(bytes, 24),
        };
        if !(MIN_AXES..=MAX_AXES).contains(&(header.axes as usize)) {
            return Err(FormatError::InvalidAxes(header.axes as usize));
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dimensions.to_le_bytes());
        buf[16..20].copy_from_slice(&self.axes.to_le_bytes());
        buf[20..24].copy_from_slice(&self.namespace.to_le_bytes());
        buf[24..28].copy_from_slice(&self.landmark_version.to_le_bytes());
        buf
    }

    #[inline(always)]
    pub fn row_size(&self) -> usize {
        ROW_PREFIX + self.dimensions as usize * std::mem::size_of::<f32>()
    }

    /// Byte offset of a row by index
    #[inline(always)]
    pub fn offset(&self, index: usize) -> usize {
        HEADER_SIZE + index * self.row_size()
    }

    pub fn file_size(&self) -> usize {
        self.offset(self.count as usize)
    }
}

/// One embedding version as written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRow<'a> {
    pub atom: AtomId,
    pub tenant: TenantId,
    pub valid_from: u64,
    pub valid_to: Option<u64>,
    pub key: u64,
    pub coord: Coord,
    pub vector: &'a [f32],
}

/// Writer for creating .aemb files
pub struct EmbeddingWriter {
    writer: BufWriter<File>,
    header: EmbeddingHeader,
}

impl EmbeddingWriter {
    pub fn new<P: AsRef<Path>>(
        path: P,
        dimensions: usize,
        axes: usize,
        namespace: u32,
        landmark_version: u32,
    ) -> Result<Self, FormatError> {
        if !(MIN_AXES..=MAX_AXES).contains(&axes) {
            return Err(FormatError::InvalidAxes(axes));
        }
        let header = EmbeddingHeader {
            count: 0,
            dimensions: dimensions as u32,
            axes: axes as u32,
            namespace,
            landmark_version,
        };
        let mut writer = BufWriter::new(File::create(path)?);
        // Placeholder, count is patched in finish()
        writer.write_all(&header.to_bytes())?;
        Ok(Self { writer, header })
    }

    pub fn write_row(&mut self, row: &EmbeddingRow<'_>) -> Result<(), FormatError> {
        let dims = self.header.dimensions as usize;
        if row.vector.len() != dims {
            return Err(FormatError::DimensionMismatch {
                expected: dims,
                actual: row.vector.len(),
            });
        }
        if row.coord.axes() != self.header.axes as usize {
            return Err(FormatError::InvalidAxes(row.coord.axes()));
        }
        self.writer.write_all(&row.atom.0.to_le_bytes())?;
        self.writer.write_all(&row.tenant.0.to_le_bytes())?;
        self.writer.write_all(&row.valid_from.to_le_bytes())?;
        self.writer
            .write_all(&row.valid_to.unwrap_or(OPEN_INTERVAL).to_le_bytes())?;
        self.writer.write_all(&row.key.to_le_bytes())?;
        for axis in 0..MAX_AXES {
            let v = if axis < row.coord.axes() {
                row.coord.get(axis)
            } else {
                0.0
            };
            self.writer.write_all(&v.to_le_bytes())?;
        }
        for &val in row.vector {
            self.writer.write_all(&val.to_le_bytes())?;
        }
        self.header.count += 1;
        Ok(())
    }

    /// Finalize the file, patching the row count into the header
    pub fn finish(mut self) -> Result<u32, FormatError> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(io::SeekFrom::Start(8))?;
        file.write_all(&self.header.count.to_le_bytes())?;
        file.sync_all()?;
        Ok(self.header.count)
    }
}
