//! Two-phase search
//!
//! Filter: project the query with the namespace's current landmark set and
//! run radius queries, growing the radius geometrically until the candidate
//! target `M` is met, the whole index is inside the radius, the expansion
//! budget runs out or the deadline passes. Rerank: score every candidate
//! exactly against its stored vector and keep the best `k`.
//!
//! Point-in-time queries skip the spatial phase and scan the embedding
//! records that were valid at the requested timestamp.

use std::cell::Cell;
use std::cmp::Ordering;
use std::time::Instant;

use atlas_core::{project, AtomId, Candidate, IndexEntry, ProjectionError, TenantId};
use rayon::prelude::*;

use super::atoms::AtomStore;
use super::clock::{Clock, Timestamp};
use super::config::SearchConfig;
use super::embeddings::Namespace;
use super::error::{EngineError, EngineResult};
use super::faults::{Fault, FaultChannel};
use super::model::{SearchHit, SearchRequest, SearchResponse};

pub struct HybridSearchEngine {
    config: SearchConfig,
}

struct FilterOutcome {
    candidates: Vec<Candidate>,
    expansions: usize,
    radius: f32,
    low_recall: bool,
    timed_out: bool,
    degraded: bool,
}

impl HybridSearchEngine {
    pub fn new(config: SearchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn search(
        &self,
        ns: &Namespace,
        atoms: &AtomStore,
        faults: &FaultChannel,
        clock: &dyn Clock,
        req: &SearchRequest,
    ) -> EngineResult<SearchResponse> {
        let start = Instant::now();
        if req.k == 0 {
            return Err(EngineError::InvalidRequest("k must be at least 1".to_string()));
        }
        if req.vector.len() != ns.dim() {
            return Err(ProjectionError::DimensionMismatch {
                expected: ns.dim(),
                actual: req.vector.len(),
            }
            .into());
        }
        if let Some(ts) = req.as_of {
            return self.search_as_of(ns, atoms, req, ts, start);
        }

        let epoch = ns.epoch();
        let coord = project(&req.vector, &epoch.landmarks)?;
        // A timeout past the representable range means no deadline.
        let deadline = start.checked_add(req.timeout.unwrap_or(self.config.default_timeout));
        let filter = self.filter(ns, faults, clock, &coord, req.tenant, req.k, deadline)?;

        let hits = self.rerank(ns, atoms, req, &filter.candidates);
        if filter.low_recall {
            tracing::debug!(
                "{} search k={} gathered {} candidates after {} expansions (timed out: {})",
                ns.id(),
                req.k,
                filter.candidates.len(),
                filter.expansions,
                filter.timed_out
            );
        }
        Ok(SearchResponse {
            hits,
            candidates_examined: filter.candidates.len(),
            expansions: filter.expansions,
            final_radius: filter.radius,
            low_recall_warning: filter.low_recall,
            timed_out: filter.timed_out,
            degraded: filter.degraded,
            historical: false,
            landmark_version: epoch.landmarks.version(),
            query_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn filter(
        &self,
        ns: &Namespace,
        faults: &FaultChannel,
        clock: &dyn Clock,
        center: &atlas_core::Coord,
        tenant: TenantId,
        k: usize,
        deadline: Option<Instant>,
    ) -> EngineResult<FilterOutcome> {
        let index = ns.index();
        let target = self.config.candidate_target(k);
        let total = index.len();
        let mut radius = (index.frame().diagonal() * self.config.initial_radius_fraction)
            .max(f32::MIN_POSITIVE);
        let mut out = FilterOutcome {
            candidates: Vec::new(),
            expansions: 0,
            radius,
            low_recall: false,
            timed_out: false,
            degraded: index.is_corrupted(),
        };

        loop {
            // Entries inside the radius before the tenant filter.
            let in_radius = Cell::new(0usize);
            let accept = |e: &IndexEntry| {
                in_radius.set(in_radius.get() + 1);
                e.tenant == tenant
            };
            out.candidates = if out.degraded {
                index.scan_radius(center, radius, accept)?
            } else {
                match index.radius_query(center, radius, accept) {
                    Ok(found) => found,
                    Err(err) if err.is_corruption() => {
                        if ns.report_corruption_once() {
                            faults.report(Fault::IndexCorruption {
                                namespace: ns.id(),
                                detail: err.to_string(),
                                at: clock.now(),
                            });
                        }
                        out.degraded = true;
                        in_radius.set(0);
                        index.scan_radius(center, radius, accept)?
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            out.radius = radius;

            if out.candidates.len() >= target || in_radius.get() >= total {
                break;
            }
            if out.expansions >= self.config.max_expansions {
                out.low_recall = true;
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                out.timed_out = true;
                out.low_recall = true;
                break;
            }
            radius *= self.config.expansion_factor;
            out.expansions += 1;
        }
        Ok(out)
    }

    fn rerank(
        &self,
        ns: &Namespace,
        atoms: &AtomStore,
        req: &SearchRequest,
        candidates: &[Candidate],
    ) -> Vec<SearchHit> {
        let metric = self.config.metric;
        let mut hits: Vec<SearchHit> = candidates
            .par_iter()
            .filter(|c| atoms.is_live(c.atom))
            .filter_map(|c| {
                let rec = ns.record(c.atom)?;
                (rec.tenant == req.tenant).then(|| SearchHit {
                    atom_id: c.atom,
                    score: metric.similarity(&req.vector, &rec.vector),
                })
            })
            .collect();
        rank(&mut hits, req.k);
        hits
    }

    /// Exact scan over the records valid at `ts`.
    fn search_as_of(
        &self,
        ns: &Namespace,
        atoms: &AtomStore,
        req: &SearchRequest,
        ts: Timestamp,
        start: Instant,
    ) -> EngineResult<SearchResponse> {
        let metric = self.config.metric;
        let records = ns.records_as_of(ts);
        let examined = records.len();
        let mut hits: Vec<SearchHit> = records
            .par_iter()
            .filter(|(atom, interval)| {
                interval.value.tenant == req.tenant
                    && atoms.as_of(*atom, ts).map_or(false, |v| v.is_present())
            })
            .map(|(atom, interval)| SearchHit {
                atom_id: *atom,
                score: metric.similarity(&req.vector, &interval.value.vector),
            })
            .collect();
        rank(&mut hits, req.k);

        Ok(SearchResponse {
            hits,
            candidates_examined: examined,
            expansions: 0,
            final_radius: 0.0,
            low_recall_warning: false,
            timed_out: false,
            degraded: false,
            historical: true,
            landmark_version: ns
                .landmarks_as_of(ts)
                .map_or_else(|| ns.landmark_version(), |set| set.version()),
            query_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

/// Descending score, ties by ascending AtomId, truncated to `k`.
fn rank(hits: &mut Vec<SearchHit>, k: usize) {
    hits.sort_by(|a, b| match b.score.total_cmp(&a.score) {
        Ordering::Equal => a.atom_id.cmp(&b.atom_id),
        other => other,
    });
    hits.truncate(k);
}

/// Exact top-k by linear scan over the current records, for measuring recall.
pub fn brute_force(
    ns: &Namespace,
    atoms: &AtomStore,
    metric: atlas_core::Metric,
    vector: &[f32],
    k: usize,
    tenant: TenantId,
) -> Vec<AtomId> {
    let mut hits: Vec<SearchHit> = ns
        .current_records()
        .par_iter()
        .filter(|(atom, rec)| rec.tenant == tenant && atoms.is_live(*atom))
        .map(|(atom, rec)| SearchHit {
            atom_id: *atom,
            score: metric.similarity(vector, &rec.vector),
        })
        .collect();
    rank(&mut hits, k);
    hits.into_iter().map(|h| h.atom_id).collect()
}
