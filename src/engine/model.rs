use std::time::Duration;

use atlas_core::{AtomId, NamespaceId, TenantId};
use serde::{Deserialize, Serialize};

use super::clock::Timestamp;
use super::embeddings::EmbeddingId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub atom_id: AtomId,
    pub was_duplicate: bool,
    pub ref_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub atom_id: AtomId,
    pub ref_count: u64,
    /// More releases than inserts; the count was clamped at zero.
    pub underflow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachResponse {
    pub embedding_id: EmbeddingId,
    pub atom_id: AtomId,
    pub namespace: NamespaceId,
    pub coordinate: Vec<f32>,
    pub linear_key: u64,
    pub landmark_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub namespace: NamespaceId,
    pub vector: Vec<f32>,
    pub k: usize,
    pub tenant: TenantId,
    /// Answer against the logical state at this timestamp.
    #[serde(default)]
    pub as_of: Option<Timestamp>,
    /// Overrides the configured default deadline.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl SearchRequest {
    pub fn new(namespace: NamespaceId, vector: Vec<f32>, k: usize, tenant: TenantId) -> Self {
        Self {
            namespace,
            vector,
            k,
            tenant,
            as_of: None,
            timeout: None,
        }
    }

    pub fn as_of(mut self, ts: Timestamp) -> Self {
        self.as_of = Some(ts);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub atom_id: AtomId,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// At most `k` hits, by descending score then ascending AtomId.
    pub hits: Vec<SearchHit>,
    pub candidates_examined: usize,
    pub expansions: usize,
    pub final_radius: f32,
    /// Fewer than the target number of candidates were gathered.
    pub low_recall_warning: bool,
    pub timed_out: bool,
    /// Answered by a linear scan because the index is corrupt.
    pub degraded: bool,
    pub historical: bool,
    pub landmark_version: u32,
    pub query_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceStats {
    pub namespace: NamespaceId,
    pub dim: usize,
    pub axes: usize,
    pub landmark_version: u32,
    pub embeddings: usize,
    pub index_entries: usize,
    pub pending_overlay: usize,
    pub generation: u64,
    pub corrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub atoms: usize,
    pub relations: usize,
    pub namespaces: Vec<NamespaceStats>,
    pub pending_faults: usize,
    pub now: Timestamp,
}
