//! Background maintenance jobs
//!
//! Collect, Rebuild, Reorganize, Migration and history purges run either
//! inline or on the background pool. Spawned jobs hand back a [`JobHandle`];
//! cancelling one is cooperative. Each job checks its token between units of
//! work and leaves a checkpoint behind, so the next run resumes instead of
//! starting over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atlas_core::{AtomId, NamespaceId};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::atoms::AtomStore;
use super::clock::{Clock, Timestamp};
use super::embeddings::Namespace;
use super::error::{EngineError, EngineResult};
use super::relations::RelationStore;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self, job: &str) -> EngineResult<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled(job.to_string()));
        }
        Ok(())
    }
}

/// Handle to a job running on the background pool.
pub struct JobHandle<T> {
    token: CancelToken,
    rx: Receiver<EngineResult<T>>,
}

impl<T: Send + 'static> JobHandle<T> {
    pub(crate) fn spawn<F>(pool: &rayon::ThreadPool, job: F) -> Self
    where
        F: FnOnce(&CancelToken) -> EngineResult<T> + Send + 'static,
    {
        let token = CancelToken::new();
        let (tx, rx) = bounded(1);
        let worker_token = token.clone();
        pool.spawn(move || {
            let result = job(&worker_token);
            // The receiver may already be gone.
            let _ = tx.send(result);
        });
        Self { token, rx }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Result if the job has finished, without blocking.
    pub fn try_wait(&self) -> Option<EngineResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(Err(EngineError::Cancelled("job worker exited".to_string())))
            }
        }
    }

    /// Blocks until the job finishes.
    pub fn wait(self) -> EngineResult<T> {
        self.rx
            .recv()
            .map_err(|_| EngineError::Cancelled("job worker exited".to_string()))?
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectReport {
    pub examined: usize,
    pub collected: usize,
    /// Atoms referenced again between listing and tombstoning.
    pub revived: usize,
    pub index_entries_removed: usize,
    pub relations_closed: usize,
    /// The run picked up from a cancelled predecessor's cursor.
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub namespace: NamespaceId,
    pub entries: usize,
    pub replayed: usize,
    pub generation: u64,
    pub resumed: bool,
    /// Nothing to reorganize.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub namespace: NamespaceId,
    pub from_version: u32,
    pub to_version: u32,
    pub reprojected: usize,
    /// Records attached or replaced while the bulk pass ran.
    pub caught_up: usize,
    pub resumed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub horizon: Timestamp,
    pub atom_intervals: usize,
    pub embedding_intervals: usize,
    pub relation_intervals: usize,
    pub landmark_versions: usize,
}

/// Removes atoms whose reference count is zero.
///
/// Per atom: claim it with a tombstone, remove its index entries in every
/// namespace, close relations touching it, then drop the record. On
/// cancellation the cursor stays in `checkpoint`.
pub(crate) fn collect(
    atoms: &AtomStore,
    namespaces: &[Arc<Namespace>],
    relations: &RelationStore,
    clock: &dyn Clock,
    checkpoint: &Mutex<Option<AtomId>>,
    token: &CancelToken,
) -> EngineResult<CollectReport> {
    let start = *checkpoint.lock();
    let mut report = CollectReport {
        resumed: start.is_some(),
        ..CollectReport::default()
    };

    for atom in atoms.collectable_after(start) {
        if token.is_cancelled() {
            tracing::info!(
                "collect cancelled after {} atoms; resuming after {:?}",
                report.collected,
                *checkpoint.lock()
            );
            return Err(EngineError::Cancelled("collect".to_string()));
        }
        report.examined += 1;
        if !atoms.try_tombstone(atom) {
            report.revived += 1;
            *checkpoint.lock() = Some(atom);
            continue;
        }
        for ns in namespaces {
            if ns.detach(clock, atom) {
                report.index_entries_removed += 1;
            }
        }
        report.relations_closed += relations.close_touching(atom, clock);
        atoms.finish_collect(atom);
        report.collected += 1;
        *checkpoint.lock() = Some(atom);
    }

    *checkpoint.lock() = None;
    if report.collected > 0 {
        tracing::info!(
            "collected {} atoms ({} index entries, {} relations)",
            report.collected,
            report.index_entries_removed,
            report.relations_closed
        );
    }
    Ok(report)
}

/// Rebuilds one namespace index online. A plan left behind by a cancelled
/// run is published if the index has not been rebuilt since.
pub(crate) fn rebuild(ns: &Namespace, token: &CancelToken) -> EngineResult<RebuildReport> {
    let index = ns.index();
    let stored = ns.take_rebuild_plan();
    let resumed = stored
        .as_ref()
        .map_or(false, |plan| plan.generation == index.generation());
    let plan = match stored {
        Some(plan) if resumed => plan,
        _ => {
            token.check("rebuild")?;
            index.prepare_rebuild()?
        }
    };
    if token.is_cancelled() {
        ns.store_rebuild_plan(plan);
        return Err(EngineError::Cancelled("rebuild".to_string()));
    }

    let entries = plan.tree.len();
    let replayed = match index.publish_rebuild(plan) {
        Err(atlas_core::IndexError::StalePlan { .. }) => index.rebuild()?,
        other => other?,
    };
    ns.clear_corruption_report();
    tracing::info!(
        "rebuilt {} index: {} entries, {} replayed, generation {}",
        ns.id(),
        entries,
        replayed,
        index.generation()
    );
    Ok(RebuildReport {
        namespace: ns.id(),
        entries,
        replayed,
        generation: index.generation(),
        resumed,
        skipped: false,
    })
}

/// Rebuild only when there are pending overlay mutations or the tree is
/// flagged corrupt.
pub(crate) fn reorganize(ns: &Namespace, token: &CancelToken) -> EngineResult<RebuildReport> {
    let index = ns.index();
    if index.pending() == 0 && !index.is_corrupted() {
        return Ok(RebuildReport {
            namespace: ns.id(),
            entries: index.len(),
            replayed: 0,
            generation: index.generation(),
            resumed: false,
            skipped: true,
        });
    }
    rebuild(ns, token)
}

pub(crate) fn purge_history(
    atoms: &AtomStore,
    namespaces: &[Arc<Namespace>],
    relations: &RelationStore,
    horizon: Timestamp,
) -> PurgeReport {
    let mut report = PurgeReport {
        horizon,
        atom_intervals: atoms.purge_history(horizon),
        relation_intervals: relations.purge_before(horizon),
        ..PurgeReport::default()
    };
    for ns in namespaces {
        let (intervals, versions) = ns.purge_before(horizon);
        report.embedding_intervals += intervals;
        report.landmark_versions += versions;
    }
    tracing::info!(
        "purged history before {}: {} atom, {} embedding, {} relation intervals",
        horizon,
        report.atom_intervals,
        report.embedding_intervals,
        report.relation_intervals
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap()
    }

    #[test]
    fn test_job_handle_returns_result() {
        let handle = JobHandle::spawn(&pool(), |_| Ok(42u32));
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_job_handle_cancel() {
        let pool = pool();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let handle = JobHandle::spawn(&pool, move |token| {
            gate_rx.recv().ok();
            token.check("test")?;
            Ok(())
        });
        handle.cancel();
        gate_tx.send(()).unwrap();
        assert!(matches!(handle.wait(), Err(EngineError::Cancelled(_))));
    }

    #[test]
    fn test_try_wait_before_finish() {
        let pool = pool();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let handle = JobHandle::spawn(&pool, move |_| {
            gate_rx.recv().ok();
            Ok(1u8)
        });
        assert!(handle.try_wait().is_none());
        gate_tx.send(()).unwrap();
        assert_eq!(handle.wait().unwrap(), 1);
    }
}
