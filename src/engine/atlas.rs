//! Engine facade
//!
//! `Atlas` owns the stores, the two rayon pools and the fault channel, and
//! exposes the ingest, embedding, search, relation and maintenance
//! operations. Queries run on the query pool; Collect, Rebuild, Migration and
//! automatic index maintenance run on the background pool.

use std::path::Path;
use std::sync::{Arc, Weak};

use atlas_core::{
    Aabb, AtomId, ContentHash, IndexEntry, Modality, NamespaceId, TenantId, VectorProjector,
};
use parking_lot::Mutex;

use super::atoms::{AtomSnapshot, AtomStore, AtomVersion};
use super::clock::{Clock, SystemClock, Timestamp};
use super::config::EngineConfig;
use super::embeddings::{EmbeddingRegistry, EmbeddingVersion, Namespace};
use super::error::{EngineError, EngineResult};
use super::faults::{Fault, FaultChannel};
use super::maintenance::{
    self, CancelToken, CollectReport, JobHandle, MigrationReport, PurgeReport, RebuildReport,
};
use super::metrics::Metrics;
use super::model::{
    AttachResponse, IngestResponse, NamespaceStats, ReleaseResponse, SearchRequest,
    SearchResponse, Stats,
};
use super::relations::{AtomRelation, RelationId, RelationSpec, RelationStore};
use super::search::{brute_force, HybridSearchEngine};
use super::snapshot::{self, SnapshotResult};

pub struct Atlas {
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) faults: Arc<FaultChannel>,
    pub(crate) atoms: AtomStore,
    pub(crate) registry: EmbeddingRegistry,
    pub(crate) relations: RelationStore,
    metrics: Metrics,
    search: HybridSearchEngine,
    projector: VectorProjector,
    query_pool: rayon::ThreadPool,
    background_pool: rayon::ThreadPool,
    collect_cursor: Mutex<Option<AtomId>>,
    this: Weak<Atlas>,
}

impl std::fmt::Debug for Atlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atlas").finish_non_exhaustive()
    }
}

impl Atlas {
    pub fn open(config: EngineConfig) -> EngineResult<Arc<Self>> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> EngineResult<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.snapshots_dir)?;
        std::fs::create_dir_all(&config.tmp_dir)?;

        let query_pool = build_pool("atlas-query", config.query_threads)?;
        let background_pool = build_pool("atlas-bg", config.background_threads)?;
        let faults = Arc::new(FaultChannel::new(config.fault_channel_capacity));
        tracing::info!(
            "atlas opened at {:?}: {} query threads, {} background threads, metric {}",
            config.data_dir,
            config.query_threads,
            config.background_threads,
            config.search.metric.as_str()
        );

        Ok(Arc::new_cyclic(|this| Self {
            atoms: AtomStore::new(clock.clone(), faults.clone()),
            registry: EmbeddingRegistry::new(config.index.tree_params()),
            relations: RelationStore::new(),
            metrics: Metrics::default(),
            search: HybridSearchEngine::new(config.search),
            projector: VectorProjector::new(config.projector),
            query_pool,
            background_pool,
            collect_cursor: Mutex::new(None),
            this: this.clone(),
            faults,
            clock,
            config,
        }))
    }

    /// Opens an engine over a snapshot directory.
    pub fn restore(config: EngineConfig, snapshot_dir: &Path) -> anyhow::Result<Arc<Self>> {
        snapshot::restore_snapshot(config, snapshot_dir)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // ── atoms ───────────────────────────────────────────────

    pub fn ingest_atom(
        &self,
        value: &[u8],
        modality: &str,
        tenant: TenantId,
    ) -> EngineResult<IngestResponse> {
        self.ingest(value, None, modality, tenant)
    }

    /// Ingest with a caller-computed content hash, which must match.
    pub fn ingest_atom_with_hash(
        &self,
        value: &[u8],
        hash: ContentHash,
        modality: &str,
        tenant: TenantId,
    ) -> EngineResult<IngestResponse> {
        self.ingest(value, Some(hash), modality, tenant)
    }

    fn ingest(
        &self,
        value: &[u8],
        hash: Option<ContentHash>,
        modality: &str,
        tenant: TenantId,
    ) -> EngineResult<IngestResponse> {
        let out = self
            .atoms
            .insert(value, hash, Modality::new(modality), tenant)?;
        Metrics::incr(&self.metrics.ingest_total);
        if out.was_duplicate {
            Metrics::incr(&self.metrics.duplicate_total);
        }
        Ok(IngestResponse {
            atom_id: out.atom,
            was_duplicate: out.was_duplicate,
            ref_count: out.ref_count,
        })
    }

    pub fn release(&self, atom: AtomId) -> EngineResult<ReleaseResponse> {
        let out = self.atoms.release(atom)?;
        Metrics::incr(&self.metrics.release_total);
        Ok(ReleaseResponse {
            atom_id: atom,
            ref_count: out.ref_count,
            underflow: out.underflow,
        })
    }

    pub fn atom(&self, atom: AtomId) -> Option<AtomSnapshot> {
        self.atoms.get(atom)
    }

    pub fn atom_as_of(&self, atom: AtomId, ts: Timestamp) -> Option<AtomVersion> {
        self.atoms.as_of(atom, ts)
    }

    pub fn lookup(&self, tenant: TenantId, hash: &ContentHash) -> Option<AtomId> {
        self.atoms.lookup(tenant, hash)
    }

    // ── namespaces & embeddings ─────────────────────────────

    pub fn bootstrap_namespace(
        &self,
        namespace: NamespaceId,
        samples: &[Vec<f32>],
        axes: usize,
    ) -> EngineResult<Arc<Namespace>> {
        self.background_pool.install(|| {
            self.registry
                .bootstrap(&self.projector, namespace, samples, axes, self.clock.as_ref())
        })
    }

    pub fn namespace(&self, namespace: NamespaceId) -> EngineResult<Arc<Namespace>> {
        self.registry.get(namespace)
    }

    pub fn namespaces(&self) -> Vec<Arc<Namespace>> {
        self.registry.all()
    }

    /// Fits a new landmark version and re-projects the namespace inline.
    pub fn migrate_namespace(
        &self,
        namespace: NamespaceId,
        samples: &[Vec<f32>],
    ) -> EngineResult<MigrationReport> {
        let ns = self.registry.get(namespace)?;
        self.run_migration(&ns, samples, &CancelToken::new())
    }

    pub fn spawn_migration(
        &self,
        namespace: NamespaceId,
        samples: Vec<Vec<f32>>,
    ) -> EngineResult<JobHandle<MigrationReport>> {
        let ns = self.registry.get(namespace)?;
        let this = self.handle()?;
        Ok(JobHandle::spawn(&self.background_pool, move |token| {
            this.run_migration(&ns, &samples, token)
        }))
    }

    fn run_migration(
        &self,
        ns: &Namespace,
        samples: &[Vec<f32>],
        token: &CancelToken,
    ) -> EngineResult<MigrationReport> {
        let report = self.background_pool.install(|| {
            ns.migrate(&self.projector, samples, self.clock.as_ref(), token)
        })?;
        Metrics::incr(&self.metrics.migration_total);
        Ok(report)
    }

    pub fn attach_embedding(
        &self,
        atom: AtomId,
        namespace: NamespaceId,
        vector: &[f32],
    ) -> EngineResult<AttachResponse> {
        let ns = self.registry.get(namespace)?;
        let out = ns.attach(&self.atoms, self.clock.as_ref(), atom, vector)?;
        Metrics::incr(&self.metrics.attach_total);
        self.maybe_reorganize(&ns);
        Ok(AttachResponse {
            embedding_id: out.embedding_id,
            atom_id: atom,
            namespace,
            coordinate: out.coord.as_slice().to_vec(),
            linear_key: out.key,
            landmark_version: out.landmark_version,
        })
    }

    pub fn detach_embedding(&self, atom: AtomId, namespace: NamespaceId) -> EngineResult<bool> {
        let ns = self.registry.get(namespace)?;
        let removed = ns.detach(self.clock.as_ref(), atom);
        if removed {
            Metrics::incr(&self.metrics.detach_total);
            self.maybe_reorganize(&ns);
        }
        Ok(removed)
    }

    pub fn embedding(&self, atom: AtomId, namespace: NamespaceId) -> EngineResult<Option<EmbeddingVersion>> {
        Ok(self.registry.get(namespace)?.record(atom))
    }

    pub fn embedding_as_of(
        &self,
        atom: AtomId,
        namespace: NamespaceId,
        ts: Timestamp,
    ) -> EngineResult<Option<EmbeddingVersion>> {
        Ok(self.registry.get(namespace)?.record_as_of(atom, ts))
    }

    // ── search ──────────────────────────────────────────────

    pub fn search(&self, req: &SearchRequest) -> EngineResult<SearchResponse> {
        let ns = self.registry.get(req.namespace)?;
        let resp = self.query_pool.install(|| {
            self.search
                .search(&ns, &self.atoms, &self.faults, self.clock.as_ref(), req)
        })?;
        self.record_search(&ns, &resp);
        Ok(resp)
    }

    /// Runs independent queries on the query pool. Results are in request order.
    pub fn search_batch(&self, reqs: &[SearchRequest]) -> Vec<EngineResult<SearchResponse>> {
        use rayon::prelude::*;

        self.query_pool.install(|| {
            reqs.par_iter()
                .map(|req| -> EngineResult<SearchResponse> {
                    let ns = self.registry.get(req.namespace)?;
                    let resp = self.search.search(
                        &ns,
                        &self.atoms,
                        &self.faults,
                        self.clock.as_ref(),
                        req,
                    )?;
                    self.record_search(&ns, &resp);
                    Ok(resp)
                })
                .collect()
        })
    }

    /// Exact top-k by linear scan, the baseline approximate search is
    /// measured against.
    pub fn search_exact(&self, req: &SearchRequest) -> EngineResult<Vec<AtomId>> {
        let ns = self.registry.get(req.namespace)?;
        if req.vector.len() != ns.dim() {
            return Err(atlas_core::ProjectionError::DimensionMismatch {
                expected: ns.dim(),
                actual: req.vector.len(),
            }
            .into());
        }
        Ok(self.query_pool.install(|| {
            brute_force(
                &ns,
                &self.atoms,
                self.search.config().metric,
                &req.vector,
                req.k,
                req.tenant,
            )
        }))
    }

    fn record_search(&self, ns: &Arc<Namespace>, resp: &SearchResponse) {
        Metrics::incr(&self.metrics.search_total);
        if resp.historical {
            Metrics::incr(&self.metrics.historical_search_total);
        }
        if resp.low_recall_warning {
            Metrics::incr(&self.metrics.low_recall_total);
        }
        if resp.timed_out {
            Metrics::incr(&self.metrics.timeout_total);
            tracing::warn!(
                "{} search timed out after {} expansions; returning {} hits",
                ns.id(),
                resp.expansions,
                resp.hits.len()
            );
        }
        if resp.degraded {
            Metrics::incr(&self.metrics.degraded_search_total);
            self.schedule_rebuild(ns);
        }
    }

    /// AtomIds whose coordinates fall inside `region`, ascending.
    pub fn range_query(
        &self,
        namespace: NamespaceId,
        region: &Aabb,
        tenant: TenantId,
    ) -> EngineResult<Vec<AtomId>> {
        let ns = self.registry.get(namespace)?;
        let index = ns.index();
        let filter = |e: &IndexEntry| e.tenant == tenant;
        if index.is_corrupted() {
            return Ok(index.scan_range(region, filter));
        }
        match index.range_query(region, filter) {
            Ok(ids) => Ok(ids),
            Err(err) if err.is_corruption() => {
                self.report_corruption(&ns, err.to_string());
                Ok(index.scan_range(region, filter))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Every indexed entry of a tenant in linear-key order.
    pub fn scan_linear(&self, namespace: NamespaceId, tenant: TenantId) -> EngineResult<Vec<IndexEntry>> {
        let ns = self.registry.get(namespace)?;
        Ok(ns
            .index()
            .load()
            .key_ordered()
            .into_iter()
            .filter(|e| e.tenant == tenant)
            .collect())
    }

    // ── relations ───────────────────────────────────────────

    pub fn relate(&self, spec: RelationSpec) -> EngineResult<AtomRelation> {
        self.relations.relate(&self.atoms, self.clock.as_ref(), spec)
    }

    pub fn unrelate(&self, id: RelationId) -> EngineResult<Timestamp> {
        self.relations.unrelate(self.clock.as_ref(), id)
    }

    pub fn relations_from(&self, source: AtomId) -> Vec<AtomRelation> {
        self.relations.relations_from(source)
    }

    pub fn relations_to(&self, target: AtomId) -> Vec<AtomRelation> {
        self.relations.relations_to(target)
    }

    pub fn relations_as_of(&self, source: AtomId, ts: Timestamp) -> Vec<AtomRelation> {
        self.relations.relations_as_of(source, ts)
    }

    // ── maintenance ─────────────────────────────────────────

    pub fn collect(&self) -> EngineResult<CollectReport> {
        self.run_collect(&CancelToken::new())
    }

    pub fn spawn_collect(&self) -> EngineResult<JobHandle<CollectReport>> {
        let this = self.handle()?;
        Ok(JobHandle::spawn(&self.background_pool, move |token| {
            this.run_collect(token)
        }))
    }

    fn run_collect(&self, token: &CancelToken) -> EngineResult<CollectReport> {
        let report = maintenance::collect(
            &self.atoms,
            &self.registry.all(),
            &self.relations,
            self.clock.as_ref(),
            &self.collect_cursor,
            token,
        )?;
        Metrics::incr(&self.metrics.collect_total);
        Metrics::add(&self.metrics.collected_atoms_total, report.collected as u64);
        Ok(report)
    }

    pub fn rebuild_index(&self, namespace: NamespaceId) -> EngineResult<RebuildReport> {
        let ns = self.registry.get(namespace)?;
        self.run_rebuild(&ns, &CancelToken::new())
    }

    pub fn spawn_rebuild(&self, namespace: NamespaceId) -> EngineResult<JobHandle<RebuildReport>> {
        let ns = self.registry.get(namespace)?;
        let this = self.handle()?;
        Ok(JobHandle::spawn(&self.background_pool, move |token| {
            this.run_rebuild(&ns, token)
        }))
    }

    fn run_rebuild(&self, ns: &Namespace, token: &CancelToken) -> EngineResult<RebuildReport> {
        let report = maintenance::rebuild(ns, token)?;
        Metrics::incr(&self.metrics.rebuild_total);
        Ok(report)
    }

    /// Folds pending overlay mutations into a fresh tree, if there are any.
    pub fn reorganize(&self, namespace: NamespaceId) -> EngineResult<RebuildReport> {
        let ns = self.registry.get(namespace)?;
        let report = maintenance::reorganize(&ns, &CancelToken::new())?;
        if !report.skipped {
            Metrics::incr(&self.metrics.rebuild_total);
        }
        Ok(report)
    }

    pub fn purge_history(&self, horizon: Timestamp) -> PurgeReport {
        let report = maintenance::purge_history(
            &self.atoms,
            &self.registry.all(),
            &self.relations,
            horizon,
        );
        Metrics::incr(&self.metrics.purge_total);
        report
    }

    /// Purges history older than the configured retention window.
    pub fn purge_expired(&self) -> Option<PurgeReport> {
        let retention = self.config.history_retention?;
        let horizon = self
            .clock
            .now()
            .saturating_sub(retention.as_micros().min(u64::MAX as u128) as u64);
        Some(self.purge_history(horizon))
    }

    pub fn verify_index(&self, namespace: NamespaceId) -> EngineResult<()> {
        let ns = self.registry.get(namespace)?;
        if let Err(err) = ns.index().verify() {
            if err.is_corruption() {
                self.report_corruption(&ns, err.to_string());
                self.schedule_rebuild(&ns);
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn report_corruption(&self, ns: &Namespace, detail: String) {
        if ns.report_corruption_once() {
            self.faults.report(Fault::IndexCorruption {
                namespace: ns.id(),
                detail,
                at: self.clock.now(),
            });
        }
    }

    fn maybe_reorganize(&self, ns: &Arc<Namespace>) {
        if ns.index().pending() >= self.config.index.overlay_capacity {
            self.schedule(ns, "reorganize", |ns| {
                maintenance::reorganize(ns, &CancelToken::new())
            });
        }
    }

    fn schedule_rebuild(&self, ns: &Arc<Namespace>) {
        self.schedule(ns, "rebuild", |ns| maintenance::rebuild(ns, &CancelToken::new()));
    }

    /// Runs one maintenance job per namespace at a time on the background pool.
    fn schedule<F>(&self, ns: &Arc<Namespace>, job: &'static str, run: F)
    where
        F: FnOnce(&Namespace) -> EngineResult<RebuildReport> + Send + 'static,
    {
        if !ns.try_schedule_maintenance() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            ns.maintenance_done();
            return;
        };
        let id = ns.id();
        let ns = ns.clone();
        self.background_pool.spawn(move || {
            match run(&ns) {
                Ok(report) if !report.skipped => {
                    Metrics::incr(&this.metrics.rebuild_total);
                }
                Ok(_) => {}
                Err(err) => tracing::error!("background {job} of {} failed: {err}", ns.id()),
            }
            ns.maintenance_done();
        });
        tracing::debug!("scheduled background {job} of {id}");
    }

    fn handle(&self) -> EngineResult<Arc<Self>> {
        self.this
            .upgrade()
            .ok_or_else(|| EngineError::Cancelled("engine is shutting down".to_string()))
    }

    // ── snapshots, faults, stats ────────────────────────────

    /// Materializes the state at `as_of` (or now) into the snapshots directory.
    pub fn snapshot(&self, as_of: Option<Timestamp>) -> anyhow::Result<SnapshotResult> {
        let result = snapshot::create_snapshot(self, as_of)?;
        Metrics::incr(&self.metrics.snapshot_total);
        Ok(result)
    }

    pub fn drain_faults(&self) -> Vec<Fault> {
        self.faults.drain()
    }

    pub fn stats(&self) -> Stats {
        let namespaces = self
            .registry
            .all()
            .iter()
            .map(|ns| {
                let index = ns.index();
                NamespaceStats {
                    namespace: ns.id(),
                    dim: ns.dim(),
                    axes: ns.axes(),
                    landmark_version: ns.landmark_version(),
                    embeddings: ns.embedding_count(),
                    index_entries: index.len(),
                    pending_overlay: index.pending(),
                    generation: index.generation(),
                    corrupted: index.is_corrupted(),
                }
            })
            .collect();
        Stats {
            atoms: self.atoms.len(),
            relations: self.relations.current_count(),
            namespaces,
            pending_faults: self.faults.pending(),
            now: self.clock.now(),
        }
    }

    /// Prometheus text exposition of the engine counters.
    pub fn render_metrics(&self) -> String {
        let stats = self.stats();
        let m = &self.metrics;
        let mut out = format!(
            concat!(
                "# TYPE atlas_ingest_total counter\n",
                "atlas_ingest_total {}\n",
                "# TYPE atlas_duplicate_total counter\n",
                "atlas_duplicate_total {}\n",
                "# TYPE atlas_release_total counter\n",
                "atlas_release_total {}\n",
                "# TYPE atlas_refcount_underflow_total counter\n",
                "atlas_refcount_underflow_total {}\n",
                "# TYPE atlas_attach_total counter\n",
                "atlas_attach_total {}\n",
                "# TYPE atlas_detach_total counter\n",
                "atlas_detach_total {}\n",
                "# TYPE atlas_search_total counter\n",
                "atlas_search_total {}\n",
                "# TYPE atlas_historical_search_total counter\n",
                "atlas_historical_search_total {}\n",
                "# TYPE atlas_low_recall_total counter\n",
                "atlas_low_recall_total {}\n",
                "# TYPE atlas_search_timeout_total counter\n",
                "atlas_search_timeout_total {}\n",
                "# TYPE atlas_degraded_search_total counter\n",
                "atlas_degraded_search_total {}\n",
                "# TYPE atlas_index_corruption_total counter\n",
                "atlas_index_corruption_total {}\n",
                "# TYPE atlas_collect_total counter\n",
                "atlas_collect_total {}\n",
                "# TYPE atlas_collected_atoms_total counter\n",
                "atlas_collected_atoms_total {}\n",
                "# TYPE atlas_rebuild_total counter\n",
                "atlas_rebuild_total {}\n",
                "# TYPE atlas_migration_total counter\n",
                "atlas_migration_total {}\n",
                "# TYPE atlas_purge_total counter\n",
                "atlas_purge_total {}\n",
                "# TYPE atlas_snapshot_total counter\n",
                "atlas_snapshot_total {}\n",
                "# TYPE atlas_faults_dropped_total counter\n",
                "atlas_faults_dropped_total {}\n",
                "# TYPE atlas_atoms gauge\n",
                "atlas_atoms {}\n",
                "# TYPE atlas_relations gauge\n",
                "atlas_relations {}\n",
            ),
            Metrics::get(&m.ingest_total),
            Metrics::get(&m.duplicate_total),
            Metrics::get(&m.release_total),
            Metrics::get(&self.faults.underflow_total),
            Metrics::get(&m.attach_total),
            Metrics::get(&m.detach_total),
            Metrics::get(&m.search_total),
            Metrics::get(&m.historical_search_total),
            Metrics::get(&m.low_recall_total),
            Metrics::get(&m.timeout_total),
            Metrics::get(&m.degraded_search_total),
            Metrics::get(&self.faults.corruption_total),
            Metrics::get(&m.collect_total),
            Metrics::get(&m.collected_atoms_total),
            Metrics::get(&m.rebuild_total),
            Metrics::get(&m.migration_total),
            Metrics::get(&m.purge_total),
            Metrics::get(&m.snapshot_total),
            Metrics::get(&self.faults.dropped_total),
            stats.atoms,
            stats.relations,
        );
        out.push_str("# TYPE atlas_index_entries gauge\n");
        for ns in &stats.namespaces {
            out.push_str(&format!(
                "atlas_index_entries{{namespace=\"{}\"}} {}\n",
                ns.namespace.0, ns.index_entries
            ));
        }
        out.push_str("# TYPE atlas_index_pending gauge\n");
        for ns in &stats.namespaces {
            out.push_str(&format!(
                "atlas_index_pending{{namespace=\"{}\"}} {}\n",
                ns.namespace.0, ns.pending_overlay
            ));
        }
        out.push_str("# TYPE atlas_landmark_version gauge\n");
        for ns in &stats.namespaces {
            out.push_str(&format!(
                "atlas_landmark_version{{namespace=\"{}\"}} {}\n",
                ns.namespace.0, ns.landmark_version
            ));
        }
        out
    }
}

fn build_pool(prefix: &'static str, threads: usize) -> EngineResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |idx| format!("{prefix}-{idx}"))
        .build()
        .map_err(|e| EngineError::InvalidRequest(format!("failed to build {prefix} pool: {e}")))
}
