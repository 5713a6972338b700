//! Spatial tree serialization using bincode
//!
//! Saves and loads the packed arena to/from disk. Decoding only checks the
//! envelope; structural checks are left to [`SpatialTree::verify`].

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bincode::Options;
use serde::{Deserialize, Serialize};

use super::node::{IndexEntry, Node};
use super::tree::SpatialTree;
use super::{IndexError, TreeParams};
use crate::geometry::{MAX_AXES, MIN_AXES};

const TREE_MAGIC: [u8; 8] = *b"ATLSTREE";
const TREE_FORMAT_VERSION: u32 = 1;

/// Serializable spatial tree.
#[derive(Serialize, Deserialize)]
pub struct SpatialTreeData {
    pub magic: [u8; 8],
    pub format_version: u32,
    pub axes: usize,
    pub params: TreeParams,
    pub nodes: Vec<Node>,
    pub entries: Vec<IndexEntry>,
    pub root: Option<u32>,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

impl SpatialTreeData {
    fn check_envelope(&self) -> Result<(), IndexError> {
        if self.magic != TREE_MAGIC {
            return Err(IndexError::corrupt(0, "bad tree magic"));
        }
        if self.format_version != TREE_FORMAT_VERSION {
            return Err(IndexError::corrupt(
                0,
                format!("unsupported tree format version {}", self.format_version),
            ));
        }
        if !(MIN_AXES..=MAX_AXES).contains(&self.axes) {
            return Err(IndexError::corrupt(0, format!("axis count {}", self.axes)));
        }
        if let Some(i) = self.nodes.iter().position(|n| n.bounds.axes() != self.axes) {
            return Err(IndexError::corrupt(i, "node axis count differs from tree"));
        }
        if self.entries.iter().any(|e| e.coord.axes() != self.axes) {
            return Err(IndexError::corrupt(0, "entry axis count differs from tree"));
        }
        self.params.validate()
    }
}

impl SpatialTree {
    /// Export serializable data
    pub fn to_data(&self) -> SpatialTreeData {
        SpatialTreeData {
            magic: TREE_MAGIC,
            format_version: TREE_FORMAT_VERSION,
            axes: self.axes,
            params: self.params,
            nodes: self.nodes.clone(),
            entries: self.entries.clone(),
            root: self.root,
        }
    }

    /// Import from serialized data
    pub fn from_data(data: SpatialTreeData) -> Result<Self, IndexError> {
        data.check_envelope()?;
        Ok(Self::from_parts(
            data.axes,
            data.params,
            data.nodes,
            data.entries,
            data.root,
        ))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
        Ok(codec().serialize(&self.to_data())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        let data: SpatialTreeData = codec()
            .with_limit(bytes.len() as u64)
            .deserialize(bytes)?;
        Self::from_data(data)
    }

    /// Save tree to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), IndexError> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&self.to_bytes()?)?;
        writer.flush()?;
        Ok(())
    }

    /// Load tree from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, IndexError> {
        let mut bytes = Vec::new();
        BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}
