//! Atlas Core – atom types, landmark projection, Hilbert keys and the spatial index
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │      SpatialIndex (packed Hilbert R-tree + ArcSwap view)    │
//! │        RadiusQuery · RangeQuery · online Rebuild            │
//! ├─────────────────────────────────────────────────────────────┤
//! │   VectorProjector (farthest-point landmarks + MDS solve)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Atom values · content hashes · SIMD distance kernels      │
//! ├─────────────────────────────────────────────────────────────┤
//! │          EmbeddingStore (mmap zero-copy .aemb)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod atom;
pub mod format;
pub mod geometry;
pub mod hilbert;
pub mod landmark;
pub mod linalg;
pub mod projection;
pub mod simd;
pub mod spatial;
pub mod store;

pub use atom::{AtomError, AtomId, AtomValue, ContentHash, Modality, NamespaceId, TenantId};
pub use format::{EmbeddingHeader, EmbeddingRow, EmbeddingWriter, FormatError};
pub use geometry::{Aabb, Coord};
pub use landmark::{LandmarkSet, LandmarkSetRecord, SolverParams};
pub use projection::{project, ProjectionError, ProjectorConfig, VectorProjector};
pub use simd::{cosine_similarity, dot_product, l2_distance, Metric};
pub use spatial::{Candidate, IndexEntry, IndexError, SpatialIndex, SpatialTree, TreeParams};
pub use store::{EmbeddingStore, StoreError};
