//! Content-addressed atom storage
//!
//! `(tenant, content hash) -> AtomId` lives in one concurrent map, records in
//! another. Reference counts are lock-free: every change is a compare-and-swap
//! loop on an `AtomicU64`. A count of zero only makes an atom eligible for
//! collection. Collection first swings the count from `0` to [`TOMBSTONE`];
//! any concurrent insert that finds a tombstone creates a fresh record
//! instead of reviving the dying one.
//!
//! AtomIds come from a monotonic counter and are never reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use atlas_core::{AtomError, AtomId, AtomValue, ContentHash, Modality, TenantId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::clock::{Clock, Timestamp};
use super::error::{EngineError, EngineResult};
use super::faults::{Fault, FaultChannel};
use super::versioning::{History, Interval, VersionedOverlay};

/// Reference count of an atom that is being (or has been) collected.
pub const TOMBSTONE: u64 = u64::MAX;

pub struct AtomRecord {
    pub id: AtomId,
    pub hash: ContentHash,
    pub value: AtomValue,
    pub modality: Modality,
    pub tenant: TenantId,
    pub created_at: Timestamp,
    ref_count: AtomicU64,
}

impl AtomRecord {
    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_tombstoned(&self) -> bool {
        self.ref_count() == TOMBSTONE
    }

    /// Increments unless tombstoned. Returns the new count.
    fn try_acquire(&self) -> Option<u64> {
        let mut cur = self.ref_count.load(Ordering::Acquire);
        loop {
            if cur == TOMBSTONE || cur == TOMBSTONE - 1 {
                return None;
            }
            match self.ref_count.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(cur + 1),
                Err(actual) => cur = actual,
            }
        }
    }

    fn snapshot(&self) -> AtomSnapshot {
        AtomSnapshot {
            id: self.id,
            hash: self.hash,
            value: self.value,
            modality: self.modality.clone(),
            tenant: self.tenant,
            created_at: self.created_at,
            ref_count: self.ref_count(),
        }
    }
}

/// Point-in-time copy of an atom record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomSnapshot {
    pub id: AtomId,
    pub hash: ContentHash,
    pub value: AtomValue,
    pub modality: Modality,
    pub tenant: TenantId,
    pub created_at: Timestamp,
    pub ref_count: u64,
}

/// Versioned state of an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomVersion {
    pub ref_count: u64,
}

impl AtomVersion {
    pub fn is_present(&self) -> bool {
        self.ref_count > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub atom: AtomId,
    pub was_duplicate: bool,
    pub ref_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub ref_count: u64,
    /// The release had no matching insert and was clamped at zero.
    pub underflow: bool,
}

pub struct AtomStore {
    next_id: AtomicU64,
    by_hash: DashMap<(TenantId, ContentHash), AtomId>,
    records: DashMap<AtomId, Arc<AtomRecord>>,
    /// Collected records, kept while their history is still readable.
    retired: DashMap<AtomId, Arc<AtomRecord>>,
    history: VersionedOverlay<AtomId, AtomVersion>,
    clock: Arc<dyn Clock>,
    faults: Arc<FaultChannel>,
}

impl AtomStore {
    pub fn new(clock: Arc<dyn Clock>, faults: Arc<FaultChannel>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_hash: DashMap::new(),
            records: DashMap::new(),
            retired: DashMap::new(),
            history: VersionedOverlay::new(),
            clock,
            faults,
        }
    }

    /// Deduplicating insert. A supplied hash must match the value's SHA-256.
    pub fn insert(
        &self,
        value: &[u8],
        supplied_hash: Option<ContentHash>,
        modality: Modality,
        tenant: TenantId,
    ) -> Result<InsertOutcome, AtomError> {
        let value = AtomValue::new(value)?;
        let hash = value.verify_hash(supplied_hash)?;

        let outcome = match self.by_hash.entry((tenant, hash)) {
            Entry::Occupied(mut slot) => {
                let existing = self.records.get(slot.get()).map(|r| r.clone());
                match existing.and_then(|r| r.try_acquire().map(|n| (r.id, n))) {
                    Some((atom, ref_count)) => InsertOutcome {
                        atom,
                        was_duplicate: true,
                        ref_count,
                    },
                    None => {
                        let atom = self.create(hash, value, modality, tenant);
                        slot.insert(atom);
                        InsertOutcome {
                            atom,
                            was_duplicate: false,
                            ref_count: 1,
                        }
                    }
                }
            }
            Entry::Vacant(slot) => {
                let atom = self.create(hash, value, modality, tenant);
                slot.insert(atom);
                InsertOutcome {
                    atom,
                    was_duplicate: false,
                    ref_count: 1,
                }
            }
        };
        self.record_count(outcome.atom);
        Ok(outcome)
    }

    fn create(
        &self,
        hash: ContentHash,
        value: AtomValue,
        modality: Modality,
        tenant: TenantId,
    ) -> AtomId {
        let id = AtomId(self.next_id.fetch_add(1, Ordering::AcqRel));
        let record = AtomRecord {
            id,
            hash,
            value,
            modality,
            tenant,
            created_at: self.clock.now(),
            ref_count: AtomicU64::new(1),
        };
        self.records.insert(id, Arc::new(record));
        id
    }

    /// Records the count as it is *now*, under the history lock, so the last
    /// writer always leaves the history agreeing with the atomic.
    fn record_count(&self, atom: AtomId) {
        let Some(record) = self.records.get(&atom).map(|r| r.clone()) else {
            return;
        };
        self.history.update(atom, self.clock.as_ref(), |h, ts| {
            let ref_count = record.ref_count();
            if ref_count != TOMBSTONE {
                h.record(ts, AtomVersion { ref_count });
            }
        });
    }

    /// Decrements the reference count. Releasing an atom already at zero is
    /// clamped, logged and reported as a fault.
    pub fn release(&self, atom: AtomId) -> EngineResult<ReleaseOutcome> {
        let record = self
            .records
            .get(&atom)
            .map(|r| r.clone())
            .ok_or(EngineError::UnknownAtom(atom))?;

        let mut cur = record.ref_count.load(Ordering::Acquire);
        let outcome = loop {
            if cur == TOMBSTONE {
                return Err(EngineError::UnknownAtom(atom));
            }
            if cur == 0 {
                break ReleaseOutcome {
                    ref_count: 0,
                    underflow: true,
                };
            }
            match record.ref_count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    break ReleaseOutcome {
                        ref_count: cur - 1,
                        underflow: false,
                    }
                }
                Err(actual) => cur = actual,
            }
        };

        if outcome.underflow {
            self.faults.report(Fault::ReferenceCountUnderflow {
                atom,
                at: self.clock.now(),
            });
        } else {
            if outcome.ref_count == 0 {
                tracing::debug!("{atom} reached zero references; eligible for collection");
            }
            self.record_count(atom);
        }
        Ok(outcome)
    }

    pub fn get(&self, atom: AtomId) -> Option<AtomSnapshot> {
        self.records
            .get(&atom)
            .map(|r| r.snapshot())
            .filter(|s| s.ref_count != TOMBSTONE)
    }

    /// Atom record regardless of whether it has since been collected.
    pub fn get_any(&self, atom: AtomId) -> Option<AtomSnapshot> {
        self.records
            .get(&atom)
            .or_else(|| self.retired.get(&atom))
            .map(|r| r.snapshot())
    }

    pub fn lookup(&self, tenant: TenantId, hash: &ContentHash) -> Option<AtomId> {
        self.by_hash.get(&(tenant, *hash)).map(|id| *id)
    }

    /// Present in the store and not being collected.
    pub fn is_live(&self, atom: AtomId) -> bool {
        self.records
            .get(&atom)
            .map_or(false, |r| !r.is_tombstoned())
    }

    pub fn as_of(&self, atom: AtomId, ts: Timestamp) -> Option<AtomVersion> {
        self.history.as_of(&atom, ts)
    }

    pub fn history(&self, atom: AtomId) -> Option<History<AtomVersion>> {
        self.history.history(&atom)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Atoms at zero references with ids greater than `after`, ascending.
    pub fn collectable_after(&self, after: Option<AtomId>) -> Vec<AtomId> {
        let mut ids: Vec<AtomId> = self
            .records
            .iter()
            .filter(|r| r.ref_count() == 0 && after.map_or(true, |a| r.id > a))
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Claims a zero-count atom for collection. Fails if it was revived.
    pub fn try_tombstone(&self, atom: AtomId) -> bool {
        self.records.get(&atom).map_or(false, |r| {
            r.ref_count
                .compare_exchange(0, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Removes a tombstoned atom: hash index entry first, then the record.
    pub fn finish_collect(&self, atom: AtomId) {
        let Some(record) = self.records.get(&atom).map(|r| r.clone()) else {
            return;
        };
        if !record.is_tombstoned() {
            return;
        }
        self.by_hash
            .remove_if(&(record.tenant, record.hash), |_, id| *id == atom);
        self.records.remove(&atom);
        self.history.close(atom, self.clock.as_ref());
        self.retired.insert(atom, record);
    }

    /// Purges atom history and forgets retired atoms whose history is gone.
    pub fn purge_history(&self, horizon: Timestamp) -> usize {
        let dropped = self.history.purge_before(horizon);
        self.retired.retain(|id, _| self.history.contains_key(id));
        dropped
    }

    /// Live records ordered by id.
    pub fn snapshot_all(&self) -> Vec<AtomSnapshot> {
        let mut out: Vec<AtomSnapshot> = self
            .records
            .iter()
            .map(|r| r.snapshot())
            .filter(|s| s.ref_count != TOMBSTONE)
            .collect();
        out.sort_unstable_by_key(|s| s.id);
        out
    }

    /// Atoms recorded at `ts`, including zero-count ones not yet collected,
    /// with the interval that held then. Ordered by id.
    pub fn snapshot_as_of(&self, ts: Timestamp) -> Vec<(AtomSnapshot, Interval<AtomVersion>)> {
        self.history
            .all_as_of(ts)
            .into_iter()
            .filter_map(|(id, interval)| {
                self.get_any(id).map(|mut snap| {
                    snap.ref_count = interval.value.ref_count;
                    (snap, interval)
                })
            })
            .collect()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    pub(crate) fn advance_next_id(&self, next: u64) {
        self.next_id.fetch_max(next, Ordering::AcqRel);
    }

    /// Reinstalls a persisted atom whose current count started at `valid_from`.
    pub fn restore(&self, snap: AtomSnapshot, valid_from: Timestamp) {
        let record = Arc::new(AtomRecord {
            id: snap.id,
            hash: snap.hash,
            value: snap.value,
            modality: snap.modality,
            tenant: snap.tenant,
            created_at: snap.created_at,
            ref_count: AtomicU64::new(snap.ref_count),
        });
        self.by_hash.insert((snap.tenant, snap.hash), snap.id);
        self.records.insert(snap.id, record);
        self.history.restore(
            snap.id,
            History::from_intervals(vec![Interval {
                valid_from,
                valid_to: None,
                value: AtomVersion {
                    ref_count: snap.ref_count,
                },
            }]),
        );
        self.next_id.fetch_max(snap.id.0 + 1, Ordering::AcqRel);
    }
}
