//! Versioned edges between atoms

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use atlas_core::{AtomId, Coord};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::atoms::AtomStore;
use super::clock::{Clock, Timestamp};
use super::error::{EngineError, EngineResult};
use super::versioning::{History, Interval, VersionedOverlay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationId(pub u64);

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel:{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomRelation {
    pub id: RelationId,
    pub source: AtomId,
    pub target: AtomId,
    pub kind: String,
    pub weight: f32,
    pub importance: f32,
    pub confidence: f32,
    pub coord: Option<Coord>,
    /// Position among the source's outgoing relations.
    pub sequence: u64,
}

/// Input to [`RelationStore::relate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub source: AtomId,
    pub target: AtomId,
    pub kind: String,
    pub weight: f32,
    pub importance: f32,
    pub confidence: f32,
    pub coord: Option<Coord>,
    /// Defaults to one past the source's highest sequence.
    pub sequence: Option<u64>,
}

impl RelationSpec {
    pub fn new(source: AtomId, target: AtomId, kind: impl Into<String>) -> Self {
        Self {
            source,
            target,
            kind: kind.into(),
            weight: 1.0,
            importance: 1.0,
            confidence: 1.0,
            coord: None,
            sequence: None,
        }
    }

    pub fn weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn coord(mut self, coord: Coord) -> Self {
        self.coord = Some(coord);
        self
    }

    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    fn validate(&self) -> EngineResult<()> {
        if self.kind.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "relation kind must not be empty".to_string(),
            ));
        }
        let finite = [self.weight, self.importance, self.confidence]
            .iter()
            .all(|v| v.is_finite())
            && self.coord.map_or(true, |c| c.is_finite());
        if !finite {
            return Err(EngineError::InvalidRequest(
                "relation values must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct RelationStore {
    next_id: AtomicU64,
    history: VersionedOverlay<RelationId, AtomRelation>,
    by_source: DashMap<AtomId, BTreeSet<RelationId>>,
    by_target: DashMap<AtomId, BTreeSet<RelationId>>,
    next_sequence: DashMap<AtomId, u64>,
}

impl Default for RelationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RelationStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            history: VersionedOverlay::new(),
            by_source: DashMap::new(),
            by_target: DashMap::new(),
            next_sequence: DashMap::new(),
        }
    }

    /// Records a relation between two live atoms.
    pub fn relate(
        &self,
        atoms: &AtomStore,
        clock: &dyn Clock,
        spec: RelationSpec,
    ) -> EngineResult<AtomRelation> {
        spec.validate()?;
        for atom in [spec.source, spec.target] {
            if !atoms.is_live(atom) {
                return Err(EngineError::UnknownAtom(atom));
            }
        }

        let sequence = {
            let mut next = self.next_sequence.entry(spec.source).or_insert(0);
            let sequence = spec.sequence.unwrap_or(*next);
            *next = (*next).max(sequence.saturating_add(1));
            sequence
        };
        let relation = AtomRelation {
            id: RelationId(self.next_id.fetch_add(1, Ordering::AcqRel)),
            source: spec.source,
            target: spec.target,
            kind: spec.kind.trim().to_string(),
            weight: spec.weight,
            importance: spec.importance,
            confidence: spec.confidence,
            coord: spec.coord,
            sequence,
        };
        self.history.record(relation.id, clock, relation.clone());
        self.link(&relation);

        // Collect tombstones before it scans the link maps, so a relation
        // linked before this check is always seen by it.
        for atom in [relation.source, relation.target] {
            if !atoms.is_live(atom) {
                self.history.close(relation.id, clock);
                return Err(EngineError::UnknownAtom(atom));
            }
        }
        tracing::debug!(
            "{} {} -[{}]-> {}",
            relation.id,
            relation.source,
            relation.kind,
            relation.target
        );
        Ok(relation)
    }

    fn link(&self, relation: &AtomRelation) {
        self.by_source
            .entry(relation.source)
            .or_default()
            .insert(relation.id);
        self.by_target
            .entry(relation.target)
            .or_default()
            .insert(relation.id);
    }

    pub fn unrelate(&self, clock: &dyn Clock, id: RelationId) -> EngineResult<Timestamp> {
        self.history
            .close(id, clock)
            .ok_or(EngineError::UnknownRelation(id))
    }

    pub fn get(&self, id: RelationId) -> Option<AtomRelation> {
        self.history.current(&id)
    }

    pub fn history(&self, id: RelationId) -> Option<History<AtomRelation>> {
        self.history.history(&id)
    }

    /// Current outgoing relations, by sequence then id.
    pub fn relations_from(&self, source: AtomId) -> Vec<AtomRelation> {
        self.collect_linked(&self.by_source, source, |id| self.history.current(id))
    }

    pub fn relations_to(&self, target: AtomId) -> Vec<AtomRelation> {
        self.collect_linked(&self.by_target, target, |id| self.history.current(id))
    }

    /// Outgoing relations valid at `ts`.
    pub fn relations_as_of(&self, source: AtomId, ts: Timestamp) -> Vec<AtomRelation> {
        self.collect_linked(&self.by_source, source, |id| self.history.as_of(id, ts))
    }

    fn collect_linked<F>(
        &self,
        links: &DashMap<AtomId, BTreeSet<RelationId>>,
        atom: AtomId,
        resolve: F,
    ) -> Vec<AtomRelation>
    where
        F: Fn(&RelationId) -> Option<AtomRelation>,
    {
        let ids: Vec<RelationId> = links
            .get(&atom)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let mut out: Vec<AtomRelation> = ids.iter().filter_map(resolve).collect();
        out.sort_by(|a, b| a.sequence.cmp(&b.sequence).then(a.id.cmp(&b.id)));
        out
    }

    /// Closes every current relation with `atom` at either end.
    pub fn close_touching(&self, atom: AtomId, clock: &dyn Clock) -> usize {
        let mut ids: BTreeSet<RelationId> = BTreeSet::new();
        for links in [&self.by_source, &self.by_target] {
            if let Some(set) = links.get(&atom) {
                ids.extend(set.iter().copied());
            }
        }
        ids.into_iter()
            .filter(|id| self.history.close(*id, clock).is_some())
            .count()
    }

    pub fn current_count(&self) -> usize {
        self.history.current_count()
    }

    /// Relations valid at `ts` with their intervals, ordered by id.
    pub fn all_as_of(&self, ts: Timestamp) -> Vec<(RelationId, Interval<AtomRelation>)> {
        self.history.all_as_of(ts)
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    pub(crate) fn advance_next_id(&self, next: u64) {
        self.next_id.fetch_max(next, Ordering::AcqRel);
    }

    pub(crate) fn restore(&self, relation: AtomRelation, valid_from: Timestamp) {
        self.link(&relation);
        self.next_sequence
            .entry(relation.source)
            .and_modify(|n| *n = (*n).max(relation.sequence.saturating_add(1)))
            .or_insert(relation.sequence.saturating_add(1));
        self.next_id
            .fetch_max(relation.id.0.saturating_add(1), Ordering::AcqRel);
        self.history.restore(
            relation.id,
            History::from_intervals(vec![Interval {
                valid_from,
                valid_to: None,
                value: relation,
            }]),
        );
    }

    /// Purges closed intervals ending at or before `horizon` and unlinks
    /// relations with no history left.
    pub fn purge_before(&self, horizon: Timestamp) -> usize {
        let dropped = self.history.purge_before(horizon);
        for links in [&self.by_source, &self.by_target] {
            links.retain(|_, set| {
                set.retain(|id| self.history.contains_key(id));
                !set.is_empty()
            });
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::ManualClock;
    use crate::engine::faults::FaultChannel;
    use atlas_core::{Modality, TenantId};
    use std::sync::Arc;

    fn setup() -> (Arc<ManualClock>, AtomStore, RelationStore) {
        let clock = Arc::new(ManualClock::new(10));
        let atoms = AtomStore::new(clock.clone(), Arc::new(FaultChannel::new(4)));
        (clock, atoms, RelationStore::new())
    }

    fn atom(atoms: &AtomStore, value: &str) -> AtomId {
        atoms
            .insert(value.as_bytes(), None, Modality::new("text"), TenantId(1))
            .unwrap()
            .atom
    }

    #[test]
    fn test_relate_assigns_sequences() {
        let (clock, atoms, store) = setup();
        let a = atom(&atoms, "a");
        let b = atom(&atoms, "b");
        let c = atom(&atoms, "c");

        let first = store
            .relate(&atoms, clock.as_ref(), RelationSpec::new(a, b, "next"))
            .unwrap();
        let second = store
            .relate(&atoms, clock.as_ref(), RelationSpec::new(a, c, "next").weight(0.5))
            .unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);

        let out = store.relations_from(a);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].target, b);
        assert_eq!(out[1].weight, 0.5);
        assert_eq!(store.relations_to(c).len(), 1);
    }

    #[test]
    fn test_sequence_saturates_at_max() {
        let (clock, atoms, store) = setup();
        let a = atom(&atoms, "a");
        let b = atom(&atoms, "b");
        let last = store
            .relate(
                &atoms,
                clock.as_ref(),
                RelationSpec::new(a, b, "next").sequence(u64::MAX),
            )
            .unwrap();
        assert_eq!(last.sequence, u64::MAX);
        let after = store
            .relate(&atoms, clock.as_ref(), RelationSpec::new(a, b, "next"))
            .unwrap();
        assert_eq!(after.sequence, u64::MAX);

        let restored = RelationStore::new();
        restored.restore(last.clone(), clock.now());
        restored.restore(
            AtomRelation {
                id: RelationId(u64::MAX),
                ..last
            },
            clock.now(),
        );
        assert_eq!(restored.next_id(), u64::MAX);
        assert_eq!(restored.relations_from(a).len(), 2);
    }

    #[test]
    fn test_relate_validates() {
        let (clock, atoms, store) = setup();
        let a = atom(&atoms, "a");
        assert!(matches!(
            store.relate(&atoms, clock.as_ref(), RelationSpec::new(a, AtomId(77), "x")),
            Err(EngineError::UnknownAtom(AtomId(77)))
        ));
        assert!(matches!(
            store.relate(&atoms, clock.as_ref(), RelationSpec::new(a, a, "x").weight(f32::NAN)),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            store.relate(&atoms, clock.as_ref(), RelationSpec::new(a, a, " ")),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_unrelate_and_as_of() {
        let (clock, atoms, store) = setup();
        let a = atom(&atoms, "a");
        let b = atom(&atoms, "b");
        let rel = store
            .relate(&atoms, clock.as_ref(), RelationSpec::new(a, b, "cites"))
            .unwrap();
        let before = clock.now();
        store.unrelate(clock.as_ref(), rel.id).unwrap();

        assert!(store.relations_from(a).is_empty());
        assert_eq!(store.relations_as_of(a, before), vec![rel.clone()]);
        assert!(matches!(
            store.unrelate(clock.as_ref(), rel.id),
            Err(EngineError::UnknownRelation(_))
        ));
    }

    #[test]
    fn test_close_touching() {
        let (clock, atoms, store) = setup();
        let a = atom(&atoms, "a");
        let b = atom(&atoms, "b");
        let c = atom(&atoms, "c");
        store
            .relate(&atoms, clock.as_ref(), RelationSpec::new(a, b, "x"))
            .unwrap();
        store
            .relate(&atoms, clock.as_ref(), RelationSpec::new(c, a, "y"))
            .unwrap();
        store
            .relate(&atoms, clock.as_ref(), RelationSpec::new(b, c, "z"))
            .unwrap();

        assert_eq!(store.close_touching(a, clock.as_ref()), 2);
        assert_eq!(store.current_count(), 1);
        assert_eq!(store.relations_from(b).len(), 1);
    }
}
