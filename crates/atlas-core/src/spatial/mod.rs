//! Spatial index over projected coordinates
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     SpatialIndex                         │
//! │                                                          │
//! │   ArcSwap<IndexView> ──► IndexView                       │
//! │                          ├── Arc<SpatialTree> (packed)   │
//! │                          └── Arc<Overlay> (merged runs │
//! │                                           of upserts)    │
//! │                                                          │
//! │   writers: Mutex<op log> ─► push run ─► publish new view │
//! │   rebuild: effective entries ─► bulk load ─► verify ─►   │
//! │            replay ops newer than base seq ─► publish     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The tree is immutable once built. Readers load the current view and never
//! observe a partially applied mutation.

mod index;
mod node;
mod serialize;
mod tree;

pub use index::{IndexView, Overlay, RebuildPlan, SpatialIndex};
pub use node::{Candidate, IndexEntry, Node, NodeKind};
pub use serialize::SpatialTreeData;
pub use tree::SpatialTree;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Index corruption at node {node}: {reason}")]
    Corruption { node: usize, reason: String },

    #[error("Axis mismatch: index has {expected} axes, got {actual}")]
    AxisMismatch { expected: usize, actual: usize },

    #[error("Non-finite coordinate")]
    NonFiniteCoordinate,

    #[error("Invalid query radius {0}")]
    InvalidRadius(f32),

    #[error("Stale rebuild plan: built from generation {plan}, index is at {current}")]
    StalePlan { plan: u64, current: u64 },

    #[error("Invalid tree parameters: {0}")]
    InvalidParams(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl IndexError {
    pub(crate) fn corrupt(node: usize, reason: impl Into<String>) -> Self {
        Self::Corruption {
            node,
            reason: reason.into(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Packing parameters of the bulk-loaded tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeParams {
    /// Maximum entries per leaf.
    pub leaf_capacity: usize,
    /// Maximum children per branch.
    pub fanout: usize,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            leaf_capacity: 32,
            fanout: 16,
        }
    }
}

impl TreeParams {
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.leaf_capacity == 0 {
            return Err(IndexError::InvalidParams(
                "leaf_capacity must be at least 1".to_string(),
            ));
        }
        if self.fanout < 2 {
            return Err(IndexError::InvalidParams(
                "fanout must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}
