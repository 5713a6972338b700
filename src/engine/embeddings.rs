//! Namespaces and embedding records
//!
//! A namespace pairs a versioned [`LandmarkSet`] with the spatial index of the
//! coordinates projected through it. Both live in one [`NamespaceEpoch`]
//! behind an `ArcSwap`, so a query always projects with the landmark version
//! its index was built from.
//!
//! ```text
//!   attach ──► gate.read ──► project ──► records.update(atom) { index.insert; record }
//!   detach ──► gate.read ──► records.update(atom) { index.delete; close }
//!   migrate ─► bulk re-project (no lock) ──► gate.write ──► catch up ──► swap epoch
//! ```
//!
//! Embedding records are append-only: attaching again or migrating opens a
//! new interval rather than rewriting the old one.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use atlas_core::spatial::RebuildPlan;
use atlas_core::{
    project, AtomId, Coord, LandmarkSet, NamespaceId, ProjectionError, SpatialIndex, TenantId,
    TreeParams, VectorProjector,
};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::atoms::AtomStore;
use super::clock::{Clock, Timestamp};
use super::error::{EngineError, EngineResult};
use super::maintenance::{CancelToken, MigrationReport};
use super::versioning::{History, Interval, VersionedOverlay};

const MIGRATION_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingId(pub u64);

impl fmt::Display for EmbeddingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "emb:{}", self.0)
    }
}

/// One version of an atom's embedding in a namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVersion {
    pub embedding_id: EmbeddingId,
    pub tenant: TenantId,
    pub landmark_version: u32,
    pub coord: Coord,
    pub key: u64,
    pub vector: Arc<[f32]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachOutcome {
    pub embedding_id: EmbeddingId,
    pub coord: Coord,
    pub key: u64,
    pub landmark_version: u32,
    /// An earlier embedding of the same atom was superseded.
    pub replaced: bool,
}

/// Landmark set and the index built from it.
pub struct NamespaceEpoch {
    pub landmarks: Arc<LandmarkSet>,
    pub index: Arc<SpatialIndex>,
}

struct MigrationCheckpoint {
    target: Arc<LandmarkSet>,
    index: Arc<SpatialIndex>,
    cursor: Option<AtomId>,
    /// Source embedding each atom was re-projected from.
    projected: HashMap<AtomId, EmbeddingId>,
}

pub struct Namespace {
    id: NamespaceId,
    dim: usize,
    axes: usize,
    params: TreeParams,
    epoch: ArcSwap<NamespaceEpoch>,
    /// Every landmark version with the time it became active, oldest first.
    versions: RwLock<Vec<(Timestamp, Arc<LandmarkSet>)>>,
    records: VersionedOverlay<AtomId, EmbeddingVersion>,
    ids: Arc<AtomicU64>,
    /// Attach/detach hold it shared; migration cutover holds it exclusively.
    gate: RwLock<()>,
    corruption_reported: AtomicBool,
    maintenance_scheduled: AtomicBool,
    rebuild_plan: Mutex<Option<RebuildPlan>>,
    migration: Mutex<Option<MigrationCheckpoint>>,
    migration_lock: Mutex<()>,
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("id", &self.id)
            .field("dim", &self.dim)
            .field("axes", &self.axes)
            .finish_non_exhaustive()
    }
}

impl Namespace {
    fn new(
        landmarks: LandmarkSet,
        params: TreeParams,
        ids: Arc<AtomicU64>,
        active_from: Timestamp,
    ) -> EngineResult<Self> {
        let landmarks = Arc::new(landmarks);
        let index = Arc::new(SpatialIndex::new(*landmarks.frame(), params)?);
        Ok(Self {
            id: landmarks.namespace(),
            dim: landmarks.source_dim(),
            axes: landmarks.axes(),
            params,
            epoch: ArcSwap::from_pointee(NamespaceEpoch {
                landmarks: landmarks.clone(),
                index,
            }),
            versions: RwLock::new(vec![(active_from, landmarks)]),
            records: VersionedOverlay::new(),
            ids,
            gate: RwLock::new(()),
            corruption_reported: AtomicBool::new(false),
            maintenance_scheduled: AtomicBool::new(false),
            rebuild_plan: Mutex::new(None),
            migration: Mutex::new(None),
            migration_lock: Mutex::new(()),
        })
    }

    pub fn id(&self) -> NamespaceId {
        self.id
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn axes(&self) -> usize {
        self.axes
    }

    pub fn epoch(&self) -> Arc<NamespaceEpoch> {
        self.epoch.load_full()
    }

    pub fn landmarks(&self) -> Arc<LandmarkSet> {
        self.epoch.load().landmarks.clone()
    }

    pub fn index(&self) -> Arc<SpatialIndex> {
        self.epoch.load().index.clone()
    }

    pub fn landmark_version(&self) -> u32 {
        self.epoch.load().landmarks.version()
    }

    /// Landmark set that was active at `ts`.
    pub fn landmarks_as_of(&self, ts: Timestamp) -> Option<Arc<LandmarkSet>> {
        self.versions
            .read()
            .iter()
            .rev()
            .find(|(from, _)| *from <= ts)
            .map(|(_, set)| set.clone())
    }

    pub fn landmark_versions(&self) -> Vec<(Timestamp, Arc<LandmarkSet>)> {
        self.versions.read().clone()
    }

    pub fn record(&self, atom: AtomId) -> Option<EmbeddingVersion> {
        self.records.current(&atom)
    }

    pub fn record_as_of(&self, atom: AtomId, ts: Timestamp) -> Option<EmbeddingVersion> {
        self.records.as_of(&atom, ts)
    }

    pub fn history(&self, atom: AtomId) -> Option<History<EmbeddingVersion>> {
        self.records.history(&atom)
    }

    pub fn records_as_of(&self, ts: Timestamp) -> Vec<(AtomId, Interval<EmbeddingVersion>)> {
        self.records.all_as_of(ts)
    }

    pub fn current_records(&self) -> Vec<(AtomId, EmbeddingVersion)> {
        self.records.current_all()
    }

    pub fn embedding_count(&self) -> usize {
        self.records.current_count()
    }

    fn next_embedding_id(&self) -> EmbeddingId {
        EmbeddingId(self.ids.fetch_add(1, Ordering::AcqRel))
    }

    /// Projects `vector` and indexes it as the current embedding of `atom`.
    pub fn attach(
        &self,
        atoms: &AtomStore,
        clock: &dyn Clock,
        atom: AtomId,
        vector: &[f32],
    ) -> EngineResult<AttachOutcome> {
        if vector.len() != self.dim {
            return Err(ProjectionError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            }
            .into());
        }
        let tenant = atoms
            .get(atom)
            .map(|a| a.tenant)
            .ok_or(EngineError::UnknownAtom(atom))?;

        let _gate = self.gate.read();
        let epoch = self.epoch();
        let coord = project(vector, &epoch.landmarks)?;
        let key = epoch.index.key_for(&coord);
        let embedding_id = self.next_embedding_id();
        let vector: Arc<[f32]> = Arc::from(vector);

        self.records.update(atom, clock, |history, ts| {
            // Re-checked under the record lock so Collect cannot miss this entry.
            if !atoms.is_live(atom) {
                return Err(EngineError::UnknownAtom(atom));
            }
            epoch.index.insert(atom, tenant, coord)?;
            let replaced = history.current().is_some();
            history.record(
                ts,
                EmbeddingVersion {
                    embedding_id,
                    tenant,
                    landmark_version: epoch.landmarks.version(),
                    coord,
                    key,
                    vector,
                },
            );
            Ok(AttachOutcome {
                embedding_id,
                coord,
                key,
                landmark_version: epoch.landmarks.version(),
                replaced,
            })
        })
    }

    /// Removes the current embedding of `atom`. Returns whether one existed.
    pub fn detach(&self, clock: &dyn Clock, atom: AtomId) -> bool {
        if !self.records.contains_key(&atom) {
            return false;
        }
        let _gate = self.gate.read();
        let index = self.index();
        self.records.update(atom, clock, |history, ts| {
            if history.current().is_none() {
                return false;
            }
            index.delete(atom);
            history.close(ts)
        })
    }

    pub(crate) fn report_corruption_once(&self) -> bool {
        !self.corruption_reported.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_corruption_report(&self) {
        self.corruption_reported.store(false, Ordering::Release);
    }

    /// Claims the right to schedule background maintenance.
    pub(crate) fn try_schedule_maintenance(&self) -> bool {
        !self.maintenance_scheduled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn maintenance_done(&self) {
        self.maintenance_scheduled.store(false, Ordering::Release);
    }

    pub(crate) fn take_rebuild_plan(&self) -> Option<RebuildPlan> {
        self.rebuild_plan.lock().take()
    }

    pub(crate) fn store_rebuild_plan(&self, plan: RebuildPlan) {
        *self.rebuild_plan.lock() = Some(plan);
    }

    pub fn has_migration_checkpoint(&self) -> bool {
        self.migration.lock().is_some()
    }

    /// Fits landmark version `current + 1` on `samples` and re-projects every
    /// current record through it.
    ///
    /// The bulk pass runs without blocking attach or detach. The cutover takes
    /// the gate exclusively, re-projects whatever changed meanwhile, appends
    /// the new record versions, rebuilds the new index and swaps the epoch.
    /// A cancelled run leaves a checkpoint; calling again with the same
    /// samples fits the same landmark set and resumes from it.
    pub fn migrate(
        &self,
        projector: &VectorProjector,
        samples: &[Vec<f32>],
        clock: &dyn Clock,
        token: &CancelToken,
    ) -> EngineResult<MigrationReport> {
        let _running = self.migration_lock.lock();
        let from = self.landmarks();
        let target = projector.fit(self.id, from.version() + 1, samples, self.axes)?;
        if target.source_dim() != self.dim {
            return Err(ProjectionError::DimensionMismatch {
                expected: self.dim,
                actual: target.source_dim(),
            }
            .into());
        }

        let mut checkpoint = match self.migration.lock().take() {
            Some(cp) if cp.target.fingerprint() == target.fingerprint() => {
                tracing::info!(
                    "resuming {} migration to v{} after {:?}",
                    self.id,
                    target.version(),
                    cp.cursor
                );
                cp
            }
            _ => MigrationCheckpoint {
                index: Arc::new(SpatialIndex::new(*target.frame(), self.params)?),
                target: Arc::new(target),
                cursor: None,
                projected: HashMap::new(),
            },
        };
        let resumed = checkpoint.cursor.is_some();

        let pending: Vec<(AtomId, EmbeddingVersion)> = self
            .current_records()
            .into_iter()
            .filter(|(atom, _)| checkpoint.cursor.map_or(true, |c| *atom > c))
            .collect();
        let mut reprojected = checkpoint.projected.len();
        for chunk in pending.chunks(MIGRATION_CHUNK) {
            if token.is_cancelled() {
                tracing::info!(
                    "{} migration cancelled at {:?} ({} re-projected)",
                    self.id,
                    checkpoint.cursor,
                    reprojected
                );
                *self.migration.lock() = Some(checkpoint);
                return Err(EngineError::Cancelled("migration".to_string()));
            }
            if let Err(err) = reproject_chunk(&mut checkpoint, chunk) {
                *self.migration.lock() = Some(checkpoint);
                return Err(err);
            }
            reprojected += chunk.len();
        }

        let _gate = self.gate.write();
        let current = self.current_records();
        let mut caught_up = 0usize;
        let stale: Vec<(AtomId, EmbeddingVersion)> = current
            .iter()
            .filter(|(atom, rec)| checkpoint.projected.get(atom) != Some(&rec.embedding_id))
            .cloned()
            .collect();
        if !stale.is_empty() {
            caught_up += stale.len();
            reproject_chunk(&mut checkpoint, &stale)?;
        }
        let live: HashMap<AtomId, EmbeddingId> = current
            .iter()
            .map(|(atom, rec)| (*atom, rec.embedding_id))
            .collect();
        let gone: Vec<AtomId> = checkpoint
            .projected
            .keys()
            .filter(|atom| !live.contains_key(atom))
            .copied()
            .collect();
        for atom in gone {
            checkpoint.index.delete(atom);
            checkpoint.projected.remove(&atom);
            caught_up += 1;
        }
        checkpoint.index.rebuild()?;

        let target = checkpoint.target.clone();
        let index = checkpoint.index.clone();
        let mut activated = 0;
        for (atom, rec) in &current {
            let Some(entry) = index.get(*atom) else {
                continue;
            };
            let embedding_id = self.next_embedding_id();
            let ts = self.records.update(*atom, clock, |history, ts| {
                history.record(
                    ts,
                    EmbeddingVersion {
                        embedding_id,
                        tenant: rec.tenant,
                        landmark_version: target.version(),
                        coord: entry.coord,
                        key: entry.key,
                        vector: rec.vector.clone(),
                    },
                );
                ts
            });
            activated = activated.max(ts);
        }
        if activated == 0 {
            activated = clock.now();
        }
        self.epoch.store(Arc::new(NamespaceEpoch {
            landmarks: target.clone(),
            index,
        }));
        self.versions.write().push((activated, target.clone()));
        self.rebuild_plan.lock().take();
        self.clear_corruption_report();

        tracing::info!(
            "migrated {} from v{} to v{}: {} records, {} caught up",
            self.id,
            from.version(),
            target.version(),
            current.len(),
            caught_up
        );
        Ok(MigrationReport {
            namespace: self.id,
            from_version: from.version(),
            to_version: target.version(),
            reprojected: reprojected + caught_up,
            caught_up,
            resumed,
        })
    }

    /// Purges embedding history and landmark versions superseded before
    /// `horizon`. Returns `(intervals, versions)` dropped.
    pub(crate) fn purge_before(&self, horizon: Timestamp) -> (usize, usize) {
        let intervals = self.records.purge_before(horizon);
        let mut versions = self.versions.write();
        let keep_from = versions
            .iter()
            .rposition(|(from, _)| *from <= horizon)
            .unwrap_or(0);
        let dropped = keep_from;
        versions.drain(..keep_from);
        (intervals, dropped)
    }

    pub(crate) fn restore_record(&self, atom: AtomId, valid_from: Timestamp, rec: EmbeddingVersion) {
        self.records.restore(
            atom,
            History::from_intervals(vec![Interval {
                valid_from,
                valid_to: None,
                value: rec,
            }]),
        );
    }
}

fn reproject_chunk(
    checkpoint: &mut MigrationCheckpoint,
    chunk: &[(AtomId, EmbeddingVersion)],
) -> EngineResult<()> {
    let target = checkpoint.target.clone();
    let coords: Vec<Coord> = chunk
        .par_iter()
        .map(|(_, rec)| project(&rec.vector, &target))
        .collect::<Result<_, _>>()?;
    for ((atom, rec), coord) in chunk.iter().zip(coords) {
        checkpoint.index.insert(*atom, rec.tenant, coord)?;
        checkpoint.projected.insert(*atom, rec.embedding_id);
        checkpoint.cursor = Some(checkpoint.cursor.map_or(*atom, |c| c.max(*atom)));
    }
    Ok(())
}

/// All namespaces of an engine.
pub struct EmbeddingRegistry {
    namespaces: RwLock<BTreeMap<NamespaceId, Arc<Namespace>>>,
    ids: Arc<AtomicU64>,
    params: TreeParams,
}

impl EmbeddingRegistry {
    pub fn new(params: TreeParams) -> Self {
        Self {
            namespaces: RwLock::new(BTreeMap::new()),
            ids: Arc::new(AtomicU64::new(1)),
            params,
        }
    }

    /// Fits landmark version 1 for a new namespace.
    pub fn bootstrap(
        &self,
        projector: &VectorProjector,
        namespace: NamespaceId,
        samples: &[Vec<f32>],
        axes: usize,
        clock: &dyn Clock,
    ) -> EngineResult<Arc<Namespace>> {
        if self.namespaces.read().contains_key(&namespace) {
            return Err(EngineError::NamespaceExists(namespace));
        }
        let landmarks = projector.fit(namespace, 1, samples, axes)?;
        let ns = Arc::new(Namespace::new(
            landmarks,
            self.params,
            self.ids.clone(),
            clock.now(),
        )?);

        let mut namespaces = self.namespaces.write();
        if namespaces.contains_key(&namespace) {
            return Err(EngineError::NamespaceExists(namespace));
        }
        namespaces.insert(namespace, ns.clone());
        tracing::info!(
            "bootstrapped {}: dim {}, {} axes, {} anchors",
            namespace,
            ns.dim(),
            axes,
            ns.landmarks().landmarks().len()
        );
        Ok(ns)
    }

    /// Re-creates a namespace from persisted landmark versions, oldest first.
    pub(crate) fn restore(
        &self,
        versions: Vec<(Timestamp, LandmarkSet)>,
    ) -> EngineResult<Arc<Namespace>> {
        let mut versions = versions.into_iter();
        let (from, first) = versions.next().ok_or_else(|| {
            EngineError::InvalidRequest("namespace without landmark versions".to_string())
        })?;
        let ns = Namespace::new(first, self.params, self.ids.clone(), from)?;
        for (from, set) in versions {
            let set = Arc::new(set);
            let index = Arc::new(SpatialIndex::new(*set.frame(), self.params)?);
            ns.epoch.store(Arc::new(NamespaceEpoch {
                landmarks: set.clone(),
                index,
            }));
            ns.versions.write().push((from, set));
        }
        let ns = Arc::new(ns);
        self.namespaces.write().insert(ns.id(), ns.clone());
        Ok(ns)
    }

    pub fn get(&self, namespace: NamespaceId) -> EngineResult<Arc<Namespace>> {
        self.namespaces
            .read()
            .get(&namespace)
            .cloned()
            .ok_or(EngineError::UnknownNamespace(namespace))
    }

    pub fn all(&self) -> Vec<Arc<Namespace>> {
        self.namespaces.read().values().cloned().collect()
    }

    pub fn next_embedding_id(&self) -> u64 {
        self.ids.load(Ordering::Acquire)
    }

    pub(crate) fn advance_embedding_ids(&self, next: u64) {
        self.ids.fetch_max(next, Ordering::AcqRel);
    }
}
