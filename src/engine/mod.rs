//! The storage and search engine built on `atlas-core`
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!  ingest/attach ─►            Atlas             ◄─ search / as_of
//!                 └──┬──────────┬──────────┬─────┘
//!                    │          │          │
//!             AtomStore   EmbeddingRegistry  RelationStore
//!           (hash index,   (namespace epochs:  (versioned edges)
//!            CAS refcounts) landmarks + index)
//!                    │          │          │
//!                    └──── VersionedOverlay ┘
//!                                │
//!                  FaultChannel · Metrics · Snapshots
//! ```

pub mod atlas;
pub mod atoms;
pub mod clock;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod faults;
pub mod maintenance;
pub mod metrics;
pub mod model;
pub mod relations;
pub mod search;
pub mod snapshot;
pub mod versioning;

pub use atlas::Atlas;
pub use atoms::{AtomSnapshot, AtomStore, AtomVersion, InsertOutcome, ReleaseOutcome};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{EngineConfig, IndexConfig, SearchConfig};
pub use embeddings::{EmbeddingId, EmbeddingVersion, Namespace};
pub use error::{EngineError, EngineResult};
pub use faults::{Fault, FaultChannel};
pub use maintenance::{
    CancelToken, CollectReport, JobHandle, MigrationReport, PurgeReport, RebuildReport,
};
pub use metrics::Metrics;
pub use model::{
    AttachResponse, IngestResponse, NamespaceStats, ReleaseResponse, SearchHit, SearchRequest,
    SearchResponse, Stats,
};
pub use relations::{AtomRelation, RelationId, RelationSpec};
pub use search::{brute_force, HybridSearchEngine};
pub use snapshot::{restore_snapshot, restore_snapshot_with_clock, SnapshotManifest, SnapshotResult};
pub use versioning::{History, Interval, VersionedOverlay};
