//! Concurrent spatial index
//!
//! Readers load an `Arc<IndexView>` and query it without locks. Writers take
//! a short mutex, derive a new overlay from the current one and publish a
//! new view. The packed tree is never mutated after it is built.
//!
//! The overlay is a stack of immutable runs merged like a binary counter, so
//! a write copies the run list plus whatever runs it merges (amortized
//! `O(log n)` entries) rather than the whole overlay. The operation log used
//! for rebuild replay lives behind the writer mutex and never reaches readers.
//!
//! Rebuild is split in two so it can run on a background thread and resume:
//!
//! 1. [`SpatialIndex::prepare_rebuild`] bulk-loads the effective entry set of
//!    the current view into a new tree and verifies it. No lock is held.
//! 2. [`SpatialIndex::publish_rebuild`] takes the writer lock, replays every
//!    logged operation newer than the plan's base sequence onto an empty
//!    overlay over the new tree, and swaps the view in.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::node::{Candidate, IndexEntry};
use super::tree::SpatialTree;
use super::{IndexError, TreeParams};
use crate::atom::{AtomId, TenantId};
use crate::geometry::{Aabb, Coord, MAX_AXES, MIN_AXES};
use crate::hilbert::hilbert_key;

#[derive(Debug, Clone)]
enum OverlayOp {
    Upsert(IndexEntry),
    Remove(AtomId),
}

/// Newest state per atom within one run. `None` records a removal.
type Run = BTreeMap<AtomId, Option<IndexEntry>>;

/// Mutations applied since the packed tree was built.
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    /// Sequence number the packed tree already reflects.
    base_seq: u64,
    /// Sequence number of the last applied operation.
    seq: u64,
    /// Oldest first. Each run is more than twice the size of the next.
    runs: Vec<Arc<Run>>,
    /// Atoms whose newest state is an upsert.
    upserts: usize,
    /// Tree entries hidden by a later upsert or remove.
    masked: usize,
    pending: usize,
}

impl Overlay {
    fn fresh(seq: u64) -> Self {
        Self {
            base_seq: seq,
            seq,
            ..Self::default()
        }
    }

    /// Newest recorded state of `atom`, if the overlay has touched it.
    fn lookup(&self, atom: AtomId) -> Option<Option<IndexEntry>> {
        self.runs.iter().rev().find_map(|run| run.get(&atom).copied())
    }

    /// Whether the overlay overrides the tree's entry for `atom`.
    fn hides(&self, atom: AtomId) -> bool {
        self.masked > 0 && self.runs.iter().any(|run| run.contains_key(&atom))
    }

    fn apply(&mut self, tree: &SpatialTree, seq: u64, op: &OverlayOp) -> bool {
        self.seq = seq;
        self.pending += 1;
        let (atom, next) = match op {
            OverlayOp::Upsert(entry) => (entry.atom, Some(*entry)),
            OverlayOp::Remove(atom) => (*atom, None),
        };
        let previous = self.lookup(atom);
        let in_tree = tree.contains(atom);
        let was_live = match previous {
            Some(state) => state.is_some(),
            None => in_tree,
        };
        if next.is_none() && !was_live {
            return false;
        }
        if matches!(previous, Some(Some(_))) {
            self.upserts -= 1;
        }
        if next.is_some() {
            self.upserts += 1;
        }
        if in_tree && previous.is_none() {
            self.masked += 1;
        }
        self.push(atom, next);
        next.is_some() || was_live
    }

    fn push(&mut self, atom: AtomId, state: Option<IndexEntry>) {
        let mut run = Run::new();
        run.insert(atom, state);
        while let Some(older) = self.runs.pop() {
            if older.len() > 2 * run.len() {
                self.runs.push(older);
                break;
            }
            let mut merged = Run::clone(&older);
            merged.extend(run);
            run = merged;
        }
        self.runs.push(Arc::new(run));
    }

    /// Visits every atom whose newest state is an upsert.
    fn for_each_upsert(&self, mut visit: impl FnMut(&IndexEntry)) {
        match self.runs.as_slice() {
            [] => {}
            [only] => only.values().flatten().for_each(visit),
            runs => {
                let mut seen = HashSet::with_capacity(self.upserts + self.masked);
                for run in runs.iter().rev() {
                    for (atom, state) in run.iter() {
                        if seen.insert(*atom) {
                            if let Some(entry) = state {
                                visit(entry);
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Operations not yet folded into the packed tree.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

/// An immutable published state of the index.
#[derive(Debug)]
pub struct IndexView {
    pub generation: u64,
    pub tree: Arc<SpatialTree>,
    pub overlay: Arc<Overlay>,
}

impl IndexView {
    pub fn len(&self) -> usize {
        self.tree.len().saturating_sub(self.overlay.masked) + self.overlay.upserts
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, atom: AtomId) -> Option<IndexEntry> {
        match self.overlay.lookup(atom) {
            Some(state) => state,
            None => self.tree.get(atom).copied(),
        }
    }

    /// Every live entry, in linear-key order (ties by AtomId).
    pub fn key_ordered(&self) -> Vec<IndexEntry> {
        let overlay = &self.overlay;
        let mut extra: Vec<IndexEntry> = Vec::with_capacity(overlay.upserts);
        overlay.for_each_upsert(|e| extra.push(*e));
        extra.sort_unstable_by(|a, b| a.key.cmp(&b.key).then(a.atom.cmp(&b.atom)));

        let mut out = Vec::with_capacity(self.len());
        let mut base = self
            .tree
            .entries()
            .iter()
            .filter(|e| !overlay.hides(e.atom))
            .peekable();
        let mut extra = extra.into_iter().peekable();
        loop {
            let take_base = match (base.peek(), extra.peek()) {
                (Some(a), Some(b)) => (a.key, a.atom) <= (b.key, b.atom),
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let next = if take_base { base.next().copied() } else { extra.next() };
            if let Some(e) = next {
                out.push(e);
            }
        }
        out
    }

    fn overlay_radius<F>(&self, center: &Coord, radius: f32, filter: &F, out: &mut Vec<Candidate>)
    where
        F: Fn(&IndexEntry) -> bool,
    {
        let r2 = radius * radius;
        self.overlay.for_each_upsert(|e| {
            let d2 = e.coord.distance_squared(center);
            if d2 <= r2 && filter(e) {
                out.push(Candidate {
                    atom: e.atom,
                    tenant: e.tenant,
                    distance: d2.sqrt(),
                });
            }
        });
    }
}

/// A verified tree built off to the side, waiting to be published.
#[derive(Debug, Clone)]
pub struct RebuildPlan {
    pub generation: u64,
    pub base_seq: u64,
    pub tree: Arc<SpatialTree>,
}

/// Bounding-volume index over the projected coordinates of one namespace.
pub struct SpatialIndex {
    axes: usize,
    frame: Aabb,
    params: TreeParams,
    view: ArcSwap<IndexView>,
    /// Writer lock. Holds every operation not yet folded into the tree.
    log: Mutex<Vec<(u64, OverlayOp)>>,
    corrupted: AtomicBool,
}

impl SpatialIndex {
    pub fn new(frame: Aabb, params: TreeParams) -> Result<Self, IndexError> {
        params.validate()?;
        let axes = frame.axes();
        if !(MIN_AXES..=MAX_AXES).contains(&axes) {
            return Err(IndexError::AxisMismatch {
                expected: MIN_AXES,
                actual: axes,
            });
        }
        let view = IndexView {
            generation: 0,
            tree: Arc::new(SpatialTree::empty(axes, params)),
            overlay: Arc::new(Overlay::fresh(0)),
        };
        Ok(Self {
            axes,
            frame,
            params,
            view: ArcSwap::from_pointee(view),
            log: Mutex::new(Vec::new()),
            corrupted: AtomicBool::new(false),
        })
    }

    /// Creates an index over a previously built or loaded tree.
    pub fn with_tree(frame: Aabb, tree: SpatialTree) -> Result<Self, IndexError> {
        let index = Self::new(frame, tree.params())?;
        index.install_tree(tree)?;
        Ok(index)
    }

    pub fn axes(&self) -> usize {
        self.axes
    }

    pub fn frame(&self) -> &Aabb {
        &self.frame
    }

    pub fn params(&self) -> TreeParams {
        self.params
    }

    /// Linear key of `coord` in this index's frame.
    pub fn key_for(&self, coord: &Coord) -> u64 {
        hilbert_key(coord, &self.frame)
    }

    /// Current published view.
    pub fn load(&self) -> Arc<IndexView> {
        self.view.load_full()
    }

    pub fn len(&self) -> usize {
        self.view.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> usize {
        self.view.load().overlay.pending()
    }

    pub fn generation(&self) -> u64 {
        self.view.load().generation
    }

    pub fn contains(&self, atom: AtomId) -> bool {
        self.view.load().get(atom).is_some()
    }

    pub fn get(&self, atom: AtomId) -> Option<IndexEntry> {
        self.view.load().get(atom)
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    pub fn mark_corrupted(&self) {
        self.corrupted.store(true, Ordering::Release);
    }

    /// Adds or moves `atom`. Returns the operation's sequence number.
    pub fn insert(&self, atom: AtomId, tenant: TenantId, coord: Coord) -> Result<u64, IndexError> {
        if coord.axes() != self.axes {
            return Err(IndexError::AxisMismatch {
                expected: self.axes,
                actual: coord.axes(),
            });
        }
        if !coord.is_finite() {
            return Err(IndexError::NonFiniteCoordinate);
        }
        let entry = IndexEntry {
            atom,
            tenant,
            coord,
            key: self.key_for(&coord),
        };
        let (seq, _) = self.mutate(OverlayOp::Upsert(entry));
        Ok(seq)
    }

    /// Removes `atom`. Returns whether it was present.
    pub fn delete(&self, atom: AtomId) -> bool {
        self.mutate(OverlayOp::Remove(atom)).1
    }

    fn mutate(&self, op: OverlayOp) -> (u64, bool) {
        let mut log = self.log.lock();
        let current = self.view.load_full();
        let mut overlay = (*current.overlay).clone();
        let seq = overlay.seq + 1;
        let changed = overlay.apply(&current.tree, seq, &op);
        log.push((seq, op));
        self.view.store(Arc::new(IndexView {
            generation: current.generation,
            tree: current.tree.clone(),
            overlay: Arc::new(overlay),
        }));
        (seq, changed)
    }

    /// Live entries within `radius` of `center`, sorted by distance then AtomId.
    ///
    /// Fails with [`IndexError::Corruption`] once the tree is known to be
    /// damaged; callers fall back to [`SpatialIndex::scan_radius`].
    pub fn radius_query<F>(
        &self,
        center: &Coord,
        radius: f32,
        filter: F,
    ) -> Result<Vec<Candidate>, IndexError>
    where
        F: Fn(&IndexEntry) -> bool,
    {
        super::tree::squared_radius(radius)?;
        if self.is_corrupted() {
            return Err(IndexError::corrupt(0, "index flagged corrupt"));
        }
        let view = self.view.load();
        let overlay = &view.overlay;
        let mut out = view
            .tree
            .radius_query(center, radius, |e| !overlay.hides(e.atom) && filter(e))
            .map_err(|e| self.note_corruption(e))?;
        view.overlay_radius(center, radius, &filter, &mut out);
        out.sort_by(Candidate::order);
        Ok(out)
    }

    /// Brute-force equivalent of [`SpatialIndex::radius_query`] that never
    /// touches the node structure.
    pub fn scan_radius<F>(
        &self,
        center: &Coord,
        radius: f32,
        filter: F,
    ) -> Result<Vec<Candidate>, IndexError>
    where
        F: Fn(&IndexEntry) -> bool,
    {
        let view = self.view.load();
        let overlay = &view.overlay;
        let mut out = view
            .tree
            .scan_radius(center, radius, |e| !overlay.hides(e.atom) && filter(e))?;
        view.overlay_radius(center, radius, &filter, &mut out);
        out.sort_by(Candidate::order);
        Ok(out)
    }

    /// Live AtomIds inside `region`, ascending.
    pub fn range_query<F>(&self, region: &Aabb, filter: F) -> Result<Vec<AtomId>, IndexError>
    where
        F: Fn(&IndexEntry) -> bool,
    {
        if self.is_corrupted() {
            return Err(IndexError::corrupt(0, "index flagged corrupt"));
        }
        let view = self.view.load();
        let overlay = &view.overlay;
        let mut ids: Vec<AtomId> = view
            .tree
            .range_query(region, |e| !overlay.hides(e.atom) && filter(e))
            .map_err(|e| self.note_corruption(e))?
            .into_iter()
            .map(|e| e.atom)
            .collect();
        overlay.for_each_upsert(|e| {
            if region.contains_point(&e.coord) && filter(e) {
                ids.push(e.atom);
            }
        });
        ids.sort_unstable();
        Ok(ids)
    }

    /// Brute-force equivalent of [`SpatialIndex::range_query`].
    pub fn scan_range<F>(&self, region: &Aabb, filter: F) -> Vec<AtomId>
    where
        F: Fn(&IndexEntry) -> bool,
    {
        let view = self.view.load();
        let mut ids: Vec<AtomId> = view
            .key_ordered()
            .into_iter()
            .filter(|e| region.contains_point(&e.coord) && filter(e))
            .map(|e| e.atom)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn note_corruption(&self, err: IndexError) -> IndexError {
        if err.is_corruption() && !self.corrupted.swap(true, Ordering::AcqRel) {
            tracing::error!("spatial index corruption detected: {}", err);
        }
        err
    }

    /// Checks the published tree and the overlay against it.
    pub fn verify(&self) -> Result<(), IndexError> {
        let view = self.view.load();
        view.tree.verify().map_err(|e| self.note_corruption(e))?;
        let overlay = &view.overlay;
        let mut touched = HashSet::new();
        for run in &overlay.runs {
            touched.extend(run.keys().copied());
        }
        let masked = touched.iter().filter(|a| view.tree.contains(**a)).count();
        let mut upserts = 0usize;
        let mut misplaced = None;
        overlay.for_each_upsert(|e| {
            upserts += 1;
            if e.coord.axes() != self.axes || !e.coord.is_finite() {
                misplaced = Some(e.atom);
            }
        });
        if let Some(atom) = misplaced {
            return Err(self.note_corruption(IndexError::corrupt(
                0,
                format!("overlay holds a malformed entry for {}", atom),
            )));
        }
        if masked != overlay.masked || upserts != overlay.upserts {
            return Err(self.note_corruption(IndexError::corrupt(
                0,
                format!(
                    "overlay counts {} upserts and {} masked, runs hold {} and {}",
                    overlay.upserts, overlay.masked, upserts, masked
                ),
            )));
        }
        Ok(())
    }

    /// Builds and verifies a replacement tree from the current view.
    ///
    /// Entries that cannot be indexed (wrong axis count, non-finite
    /// coordinates) are dropped with a warning.
    pub fn prepare_rebuild(&self) -> Result<RebuildPlan, IndexError> {
        let view = self.view.load_full();
        let mut dropped = 0usize;
        let entries: Vec<IndexEntry> = view
            .key_ordered()
            .into_iter()
            .filter(|e| {
                let ok = e.coord.axes() == self.axes && e.coord.is_finite();
                if !ok {
                    dropped += 1;
                }
                ok
            })
            .map(|mut e| {
                e.key = self.key_for(&e.coord);
                e
            })
            .collect();
        if dropped > 0 {
            tracing::warn!("rebuild dropped {} malformed entries", dropped);
        }
        let tree = SpatialTree::bulk_load(self.axes, self.params, entries)?;
        tree.verify()?;
        Ok(RebuildPlan {
            generation: view.generation,
            base_seq: view.overlay.seq,
            tree: Arc::new(tree),
        })
    }

    /// Swaps a prepared tree in. Returns the number of replayed operations.
    pub fn publish_rebuild(&self, plan: RebuildPlan) -> Result<usize, IndexError> {
        let mut log = self.log.lock();
        let current = self.view.load_full();
        if current.generation != plan.generation {
            return Err(IndexError::StalePlan {
                plan: plan.generation,
                current: current.generation,
            });
        }
        log.retain(|(seq, _)| *seq > plan.base_seq);
        let mut overlay = Overlay::fresh(plan.base_seq);
        for (seq, op) in log.iter() {
            overlay.apply(&plan.tree, *seq, op);
        }
        let replayed = log.len();
        overlay.seq = overlay.seq.max(current.overlay.seq);
        self.view.store(Arc::new(IndexView {
            generation: current.generation + 1,
            tree: plan.tree,
            overlay: Arc::new(overlay),
        }));
        self.corrupted.store(false, Ordering::Release);
        Ok(replayed)
    }

    /// Prepares and publishes in one call, retrying once if a concurrent
    /// rebuild won the race.
    pub fn rebuild(&self) -> Result<usize, IndexError> {
        match self.publish_rebuild(self.prepare_rebuild()?) {
            Err(IndexError::StalePlan { .. }) => self.publish_rebuild(self.prepare_rebuild()?),
            other => other,
        }
    }

    /// Replaces the published tree as-is and discards the overlay.
    ///
    /// The tree is not verified; call [`SpatialIndex::verify`] afterwards when
    /// it comes from an untrusted source.
    pub fn install_tree(&self, tree: SpatialTree) -> Result<(), IndexError> {
        if tree.axes() != self.axes {
            return Err(IndexError::AxisMismatch {
                expected: self.axes,
                actual: tree.axes(),
            });
        }
        let mut log = self.log.lock();
        log.clear();
        let current = self.view.load_full();
        let seq = current.overlay.seq;
        self.view.store(Arc::new(IndexView {
            generation: current.generation + 1,
            tree: Arc::new(tree),
            overlay: Arc::new(Overlay::fresh(seq)),
        }));
        self.corrupted.store(false, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.view.load();
        f.debug_struct("SpatialIndex")
            .field("axes", &self.axes)
            .field("generation", &view.generation)
            .field("len", &view.len())
            .field("pending", &view.overlay.pending())
            .field("corrupted", &self.is_corrupted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::thread;

    fn frame() -> Aabb {
        Aabb::from_bounds(&[0.0, 0.0, 0.0], &[100.0, 100.0, 100.0]).unwrap()
    }

    fn small_params() -> TreeParams {
        TreeParams {
            leaf_capacity: 8,
            fanout: 4,
        }
    }

    fn coord(rng: &mut StdRng) -> Coord {
        Coord::from_slice(&[
            rng.gen_range(0.0..100.0),
            rng.gen_range(0.0..100.0),
            rng.gen_range(0.0..100.0),
        ])
        .unwrap()
    }

    fn populated(n: usize, seed: u64) -> (SpatialIndex, Vec<Coord>) {
        let index = SpatialIndex::new(frame(), small_params()).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let coords: Vec<Coord> = (0..n).map(|_| coord(&mut rng)).collect();
        for (i, c) in coords.iter().enumerate() {
            index.insert(AtomId(i as u64), TenantId(1), *c).unwrap();
        }
        (index, coords)
    }

    fn brute(coords: &[Coord], center: &Coord, radius: f32) -> Vec<AtomId> {
        let mut ids: Vec<AtomId> = coords
            .iter()
            .enumerate()
            .filter(|(_, c)| c.distance(center) <= radius)
            .map(|(i, _)| AtomId(i as u64))
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_overlay_only_queries() {
        let (index, coords) = populated(300, 1);
        assert_eq!(index.len(), 300);
        assert_eq!(index.pending(), 300);
        let center = Coord::from_slice(&[50.0, 50.0, 50.0]).unwrap();
        let mut got: Vec<AtomId> = index
            .radius_query(&center, 25.0, |_| true)
            .unwrap()
            .into_iter()
            .map(|c| c.atom)
            .collect();
        got.sort();
        assert_eq!(got, brute(&coords, &center, 25.0));
    }

    #[test]
    fn test_rebuild_folds_overlay() {
        let (index, coords) = populated(500, 2);
        let replayed = index.rebuild().unwrap();
        assert_eq!(replayed, 0);
        assert_eq!(index.pending(), 0);
        assert_eq!(index.len(), 500);
        index.verify().unwrap();

        let center = Coord::from_slice(&[20.0, 70.0, 40.0]).unwrap();
        let mut got: Vec<AtomId> = index
            .radius_query(&center, 30.0, |_| true)
            .unwrap()
            .into_iter()
            .map(|c| c.atom)
            .collect();
        got.sort();
        assert_eq!(got, brute(&coords, &center, 30.0));
    }

    #[test]
    fn test_delete_masks_tree_entry() {
        let (index, coords) = populated(100, 3);
        index.rebuild().unwrap();
        assert!(index.delete(AtomId(7)));
        assert!(!index.delete(AtomId(7)));
        assert!(!index.contains(AtomId(7)));
        assert_eq!(index.len(), 99);
        let hits = index.radius_query(&coords[7], 0.0, |_| true).unwrap();
        assert!(hits.iter().all(|c| c.atom != AtomId(7)));

        index.insert(AtomId(7), TenantId(1), coords[7]).unwrap();
        assert!(index.contains(AtomId(7)));
        assert_eq!(index.len(), 100);
    }

    #[test]
    fn test_reinsert_moves_entry() {
        let (index, _) = populated(50, 4);
        index.rebuild().unwrap();
        let moved = Coord::from_slice(&[99.0, 99.0, 99.0]).unwrap();
        index.insert(AtomId(3), TenantId(1), moved).unwrap();
        assert_eq!(index.len(), 50);
        let hits = index.radius_query(&moved, 0.01, |_| true).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].atom, AtomId(3));
    }

    #[test]
    fn test_publish_replays_concurrent_writes() {
        let (index, _) = populated(200, 5);
        let plan = index.prepare_rebuild().unwrap();
        let c = Coord::from_slice(&[1.0, 2.0, 3.0]).unwrap();
        index.insert(AtomId(1000), TenantId(2), c).unwrap();
        index.delete(AtomId(0));
        let replayed = index.publish_rebuild(plan).unwrap();
        assert_eq!(replayed, 2);
        assert!(index.contains(AtomId(1000)));
        assert!(!index.contains(AtomId(0)));
        assert_eq!(index.len(), 200);
        index.verify().unwrap();
    }

    #[test]
    fn test_overlay_runs_stay_logarithmic() {
        let index = SpatialIndex::new(frame(), small_params()).unwrap();
        let mut rng = StdRng::seed_from_u64(12);
        let mut live: BTreeMap<AtomId, Coord> = BTreeMap::new();
        for step in 0..4096u64 {
            if step == 2048 {
                index.rebuild().unwrap();
            }
            let atom = AtomId(rng.gen_range(0..1500));
            if step % 5 == 4 {
                assert_eq!(index.delete(atom), live.remove(&atom).is_some(), "step {step}");
            } else {
                let c = coord(&mut rng);
                index.insert(atom, TenantId(1), c).unwrap();
                live.insert(atom, c);
            }
        }

        let view = index.load();
        assert_eq!(view.overlay.pending(), 2048);
        assert!(view.overlay.run_count() <= 11, "{} runs", view.overlay.run_count());
        assert_eq!(index.len(), live.len());
        index.verify().unwrap();

        let center = Coord::from_slice(&[30.0, 60.0, 45.0]).unwrap();
        let mut got: Vec<AtomId> = index
            .radius_query(&center, 35.0, |_| true)
            .unwrap()
            .into_iter()
            .map(|c| c.atom)
            .collect();
        got.sort();
        let expected: Vec<AtomId> = live
            .iter()
            .filter(|(_, c)| c.distance(&center) <= 35.0)
            .map(|(a, _)| *a)
            .collect();
        assert_eq!(got, expected);

        let mut ordered: Vec<AtomId> = view.key_ordered().into_iter().map(|e| e.atom).collect();
        ordered.sort();
        assert_eq!(ordered, live.keys().copied().collect::<Vec<_>>());

        // Published views are never touched by later writes.
        index.insert(AtomId(9_999), TenantId(1), center).unwrap();
        assert!(view.get(AtomId(9_999)).is_none());
        assert!(index.contains(AtomId(9_999)));
    }

    #[test]
    fn test_stale_plan_rejected() {
        let (index, _) = populated(50, 6);
        let plan = index.prepare_rebuild().unwrap();
        index.rebuild().unwrap();
        assert!(matches!(
            index.publish_rebuild(plan),
            Err(IndexError::StalePlan { .. })
        ));
    }

    #[test]
    fn test_key_ordered_merges_overlay() {
        let (index, _) = populated(120, 7);
        index.rebuild().unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        for i in 0..30u64 {
            index.insert(AtomId(500 + i), TenantId(1), coord(&mut rng)).unwrap();
        }
        let ordered = index.load().key_ordered();
        assert_eq!(ordered.len(), 150);
        assert!(ordered
            .windows(2)
            .all(|w| (w[0].key, w[0].atom) < (w[1].key, w[1].atom)));
    }

    #[test]
    fn test_readers_see_consistent_views_during_rebuild() {
        let (index, _) = populated(400, 8);
        let index = Arc::new(index);
        let center = Coord::from_slice(&[50.0, 50.0, 50.0]).unwrap();

        let writer = {
            let index = index.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(10);
                for i in 0..200u64 {
                    index
                        .insert(AtomId(10_000 + i), TenantId(1), coord(&mut rng))
                        .unwrap();
                }
            })
        };
        let rebuilder = {
            let index = index.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    index.rebuild().unwrap();
                }
            })
        };
        for _ in 0..50 {
            let hits = index.radius_query(&center, 500.0, |_| true).unwrap();
            assert!(hits.len() >= 400);
        }
        writer.join().unwrap();
        rebuilder.join().unwrap();
        assert_eq!(index.len(), 600);
        index.rebuild().unwrap();
        index.verify().unwrap();
        assert_eq!(index.len(), 600);
    }

    #[test]
    fn test_corrupt_tree_flags_and_scan_still_answers() {
        let (index, coords) = populated(300, 9);
        index.rebuild().unwrap();
        let mut data = index.load().tree.to_data();
        data.nodes[0].bounds.max[0] = 1.0e6;
        index
            .install_tree(SpatialTree::from_data(data).unwrap())
            .unwrap();

        let center = Coord::from_slice(&[50.0, 50.0, 50.0]).unwrap();
        let err = index.radius_query(&center, 500.0, |_| true).unwrap_err();
        assert!(err.is_corruption());
        assert!(index.is_corrupted());

        let scanned = index.scan_radius(&center, 500.0, |_| true).unwrap();
        assert_eq!(scanned.len(), coords.len());

        index.rebuild().unwrap();
        assert!(!index.is_corrupted());
        assert_eq!(index.radius_query(&center, 500.0, |_| true).unwrap().len(), 300);
    }

    #[test]
    fn test_tenant_filter_and_tie_break() {
        let index = SpatialIndex::new(frame(), small_params()).unwrap();
        let c = Coord::from_slice(&[10.0, 10.0, 10.0]).unwrap();
        for id in [5u64, 2, 9] {
            index.insert(AtomId(id), TenantId(1), c).unwrap();
        }
        index.insert(AtomId(1), TenantId(2), c).unwrap();
        let hits = index
            .radius_query(&c, 1.0, |e| e.tenant == TenantId(1))
            .unwrap();
        let ids: Vec<u64> = hits.iter().map(|h| h.atom.0).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn test_range_query() {
        let (index, coords) = populated(200, 11);
        index.rebuild().unwrap();
        let region = Aabb::from_bounds(&[0.0, 0.0, 0.0], &[50.0, 50.0, 50.0]).unwrap();
        let expected: Vec<AtomId> = coords
            .iter()
            .enumerate()
            .filter(|(_, c)| region.contains_point(c))
            .map(|(i, _)| AtomId(i as u64))
            .collect();
        assert_eq!(index.range_query(&region, |_| true).unwrap(), expected);
        assert_eq!(index.scan_range(&region, |_| true), expected);
    }
}
