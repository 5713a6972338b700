use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub ingest_total: AtomicU64,
    pub duplicate_total: AtomicU64,
    pub release_total: AtomicU64,
    pub attach_total: AtomicU64,
    pub detach_total: AtomicU64,
    pub search_total: AtomicU64,
    pub historical_search_total: AtomicU64,
    pub low_recall_total: AtomicU64,
    pub timeout_total: AtomicU64,
    pub degraded_search_total: AtomicU64,
    pub collect_total: AtomicU64,
    pub collected_atoms_total: AtomicU64,
    pub rebuild_total: AtomicU64,
    pub migration_total: AtomicU64,
    pub purge_total: AtomicU64,
    pub snapshot_total: AtomicU64,
}

impl Metrics {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
