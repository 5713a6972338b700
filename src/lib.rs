//! Atlas-DB: content-addressed atoms with landmark-projected approximate
//! nearest-neighbor search
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Atlas (engine)                        │
//! │     ingest · attach · search · relate · collect · snapshot  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  HybridSearchEngine                         │
//! │   project query ─► adaptive radius filter ─► exact rerank   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        SpatialIndex (packed Hilbert R-tree, ArcSwap)        │
//! │        VectorProjector · LandmarkSet (atlas-core)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod engine;

pub use atlas_core::{
    Aabb, AtomError, AtomId, ContentHash, Coord, LandmarkSet, Metric, Modality, NamespaceId,
    ProjectionError, TenantId,
};
pub use engine::{
    Atlas, AttachResponse, EngineConfig, EngineError, EngineResult, Fault, IngestResponse,
    ReleaseResponse, SearchHit, SearchRequest, SearchResponse,
};
