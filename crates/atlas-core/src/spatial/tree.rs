//! Packed Hilbert R-tree
//!
//! Entries are sorted by linear key (ties by AtomId) and cut into leaves of
//! `leaf_capacity`; leaves are grouped `fanout` at a time into branches until
//! a single root remains. The whole tree is one `Vec<Node>` arena plus one
//! `Vec<IndexEntry>` in key order, so a sequential scan of `entries()` walks
//! the Hilbert curve.

use std::collections::HashMap;

use rayon::prelude::*;

use super::node::{Candidate, IndexEntry, Node, NodeKind};
use super::{IndexError, TreeParams};
use crate::atom::AtomId;
use crate::geometry::{Aabb, Coord};

#[derive(Debug, Clone)]
pub struct SpatialTree {
    pub(crate) axes: usize,
    pub(crate) params: TreeParams,
    pub(crate) nodes: Vec<Node>,
    pub(crate) entries: Vec<IndexEntry>,
    pub(crate) root: Option<u32>,
    positions: HashMap<AtomId, u32>,
}

impl SpatialTree {
    pub fn empty(axes: usize, params: TreeParams) -> Self {
        Self {
            axes,
            params,
            nodes: Vec::new(),
            entries: Vec::new(),
            root: None,
            positions: HashMap::new(),
        }
    }

    /// Bulk-loads a tree from entries whose keys are already computed.
    ///
    /// Duplicate AtomIds keep the last occurrence.
    pub fn bulk_load(
        axes: usize,
        params: TreeParams,
        entries: Vec<IndexEntry>,
    ) -> Result<Self, IndexError> {
        params.validate()?;
        let mut dedup: HashMap<AtomId, IndexEntry> = HashMap::with_capacity(entries.len());
        for e in entries {
            if e.coord.axes() != axes {
                return Err(IndexError::AxisMismatch {
                    expected: axes,
                    actual: e.coord.axes(),
                });
            }
            if !e.coord.is_finite() {
                return Err(IndexError::NonFiniteCoordinate);
            }
            dedup.insert(e.atom, e);
        }
        let mut entries: Vec<IndexEntry> = dedup.into_values().collect();
        entries.par_sort_unstable_by(|a, b| a.key.cmp(&b.key).then(a.atom.cmp(&b.atom)));
        Ok(Self::pack_sorted(axes, params, entries))
    }

    fn pack_sorted(axes: usize, params: TreeParams, entries: Vec<IndexEntry>) -> Self {
        if entries.is_empty() {
            return Self::empty(axes, params);
        }

        let mut nodes = Vec::with_capacity(entries.len() / params.leaf_capacity + 1);
        for (chunk_idx, chunk) in entries.chunks(params.leaf_capacity).enumerate() {
            let mut bounds = Aabb::empty(axes);
            for e in chunk {
                bounds.extend(&e.coord);
            }
            let first = (chunk_idx * params.leaf_capacity) as u32;
            nodes.push(Node::leaf(bounds, first, chunk.len() as u32));
        }

        let mut level_start = 0usize;
        let mut level_end = nodes.len();
        while level_end - level_start > 1 {
            let mut first = level_start;
            while first < level_end {
                let count = params.fanout.min(level_end - first);
                let mut bounds = Aabb::empty(axes);
                for child in &nodes[first..first + count] {
                    bounds.union(&child.bounds);
                }
                nodes.push(Node::branch(bounds, first as u32, count as u32));
                first += count;
            }
            level_start = level_end;
            level_end = nodes.len();
        }

        let positions = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.atom, i as u32))
            .collect();
        let root = Some((nodes.len() - 1) as u32);
        Self {
            axes,
            params,
            nodes,
            entries,
            root,
            positions,
        }
    }

    /// Reassembles a tree from decoded parts without checking it.
    pub(crate) fn from_parts(
        axes: usize,
        params: TreeParams,
        nodes: Vec<Node>,
        entries: Vec<IndexEntry>,
        root: Option<u32>,
    ) -> Self {
        let positions = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.atom, i as u32))
            .collect();
        Self {
            axes,
            params,
            nodes,
            entries,
            root,
            positions,
        }
    }

    pub fn axes(&self) -> usize {
        self.axes
    }

    pub fn params(&self) -> TreeParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Entries in linear-key order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn contains(&self, atom: AtomId) -> bool {
        self.positions.contains_key(&atom)
    }

    pub fn get(&self, atom: AtomId) -> Option<&IndexEntry> {
        self.positions
            .get(&atom)
            .and_then(|&i| self.entries.get(i as usize))
    }

    pub fn bounds(&self) -> Option<Aabb> {
        self.root
            .and_then(|r| self.nodes.get(r as usize))
            .map(|n| n.bounds)
    }

    /// Entries within `radius` of `center` that pass `filter`.
    ///
    /// Traversal checks the invariants of every node it touches and reports
    /// [`IndexError::Corruption`] instead of returning a partial answer.
    pub fn radius_query<F>(
        &self,
        center: &Coord,
        radius: f32,
        filter: F,
    ) -> Result<Vec<Candidate>, IndexError>
    where
        F: Fn(&IndexEntry) -> bool,
    {
        self.check_axes(center.axes())?;
        let r2 = squared_radius(radius)?;
        let mut out = Vec::new();
        self.walk(
            |bounds| bounds.min_distance_squared(center) <= r2,
            |e| {
                let d2 = e.coord.distance_squared(center);
                if d2 <= r2 && filter(e) {
                    out.push(Candidate {
                        atom: e.atom,
                        tenant: e.tenant,
                        distance: d2.sqrt(),
                    });
                }
            },
        )?;
        Ok(out)
    }

    /// Entries inside `region` that pass `filter`.
    pub fn range_query<F>(&self, region: &Aabb, filter: F) -> Result<Vec<IndexEntry>, IndexError>
    where
        F: Fn(&IndexEntry) -> bool,
    {
        self.check_axes(region.axes())?;
        let mut out = Vec::new();
        self.walk(
            |bounds| bounds.intersects(region),
            |e| {
                if region.contains_point(&e.coord) && filter(e) {
                    out.push(*e);
                }
            },
        )?;
        Ok(out)
    }

    /// Linear scan over the entry array, ignoring the node structure.
    ///
    /// Used when the node structure cannot be trusted.
    pub fn scan_radius<F>(
        &self,
        center: &Coord,
        radius: f32,
        filter: F,
    ) -> Result<Vec<Candidate>, IndexError>
    where
        F: Fn(&IndexEntry) -> bool,
    {
        let r2 = squared_radius(radius)?;
        Ok(self
            .entries
            .iter()
            .filter(|e| e.coord.axes() == center.axes())
            .filter_map(|e| {
                let d2 = e.coord.distance_squared(center);
                (d2 <= r2 && filter(e)).then(|| Candidate {
                    atom: e.atom,
                    tenant: e.tenant,
                    distance: d2.sqrt(),
                })
            })
            .collect())
    }

    fn check_axes(&self, actual: usize) -> Result<(), IndexError> {
        if actual != self.axes {
            return Err(IndexError::AxisMismatch {
                expected: self.axes,
                actual,
            });
        }
        Ok(())
    }

    fn walk<P, V>(&self, mut descend: P, mut visit: V) -> Result<(), IndexError>
    where
        P: FnMut(&Aabb) -> bool,
        V: FnMut(&IndexEntry),
    {
        let Some(root) = self.root else {
            return Ok(());
        };
        let root = root as usize;
        if root >= self.nodes.len() {
            return Err(IndexError::corrupt(root, "root out of range"));
        }

        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if !descend(&node.bounds) {
                continue;
            }
            match node.kind {
                NodeKind::Branch {
                    first_child,
                    child_count,
                } => {
                    let (first, end) = self.child_range(idx, first_child, child_count)?;
                    for child in first..end {
                        if !node.bounds.contains_box(&self.nodes[child].bounds) {
                            return Err(IndexError::corrupt(
                                child,
                                "child bounds escape parent",
                            ));
                        }
                        stack.push(child);
                    }
                }
                NodeKind::Leaf {
                    first_entry,
                    entry_count,
                } => {
                    let (first, end) = self.entry_range(idx, first_entry, entry_count)?;
                    for e in &self.entries[first..end] {
                        if !node.bounds.contains_point(&e.coord) {
                            return Err(IndexError::corrupt(idx, "entry outside leaf bounds"));
                        }
                        visit(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn child_range(
        &self,
        idx: usize,
        first_child: u32,
        child_count: u32,
    ) -> Result<(usize, usize), IndexError> {
        let first = first_child as usize;
        let end = first + child_count as usize;
        if child_count == 0 {
            return Err(IndexError::corrupt(idx, "branch without children"));
        }
        // Children always precede their parent in the arena.
        if end > idx {
            return Err(IndexError::corrupt(idx, "child range not below parent"));
        }
        Ok((first, end))
    }

    fn entry_range(
        &self,
        idx: usize,
        first_entry: u32,
        entry_count: u32,
    ) -> Result<(usize, usize), IndexError> {
        let first = first_entry as usize;
        let end = first + entry_count as usize;
        if entry_count == 0 || end > self.entries.len() {
            return Err(IndexError::corrupt(idx, "entry range out of bounds"));
        }
        Ok((first, end))
    }

    /// Full structural check.
    pub fn verify(&self) -> Result<(), IndexError> {
        match self.root {
            None => {
                if !self.nodes.is_empty() || !self.entries.is_empty() {
                    return Err(IndexError::corrupt(0, "rootless tree with content"));
                }
                return Ok(());
            }
            Some(r) if self.nodes.is_empty() || r as usize != self.nodes.len() - 1 => {
                return Err(IndexError::corrupt(r as usize, "root is not the last node"));
            }
            Some(_) => {}
        }

        for (i, e) in self.entries.iter().enumerate() {
            if e.coord.axes() != self.axes || !e.coord.is_finite() {
                return Err(IndexError::corrupt(0, format!("entry {} malformed", i)));
            }
        }
        for pair in self.entries.windows(2) {
            let ordered = (pair[0].key, pair[0].atom) < (pair[1].key, pair[1].atom);
            if !ordered {
                return Err(IndexError::corrupt(
                    0,
                    format!("entries out of key order at {}", pair[1].atom),
                ));
            }
        }

        let mut node_seen = vec![false; self.nodes.len()];
        let mut entry_seen = vec![false; self.entries.len()];
        let mut stack = vec![self.nodes.len() - 1];
        while let Some(idx) = stack.pop() {
            if std::mem::replace(&mut node_seen[idx], true) {
                return Err(IndexError::corrupt(idx, "node reachable twice"));
            }
            let node = &self.nodes[idx];
            if node.bounds.axes() != self.axes || node.bounds.is_empty() {
                return Err(IndexError::corrupt(idx, "malformed bounds"));
            }
            match node.kind {
                NodeKind::Branch {
                    first_child,
                    child_count,
                } => {
                    if child_count as usize > self.params.fanout {
                        return Err(IndexError::corrupt(idx, "fanout exceeded"));
                    }
                    let (first, end) = self.child_range(idx, first_child, child_count)?;
                    for child in first..end {
                        if !node.bounds.contains_box(&self.nodes[child].bounds) {
                            return Err(IndexError::corrupt(
                                child,
                                "child bounds escape parent",
                            ));
                        }
                        stack.push(child);
                    }
                }
                NodeKind::Leaf {
                    first_entry,
                    entry_count,
                } => {
                    if entry_count as usize > self.params.leaf_capacity {
                        return Err(IndexError::corrupt(idx, "leaf capacity exceeded"));
                    }
                    let (first, end) = self.entry_range(idx, first_entry, entry_count)?;
                    for (offset, e) in self.entries[first..end].iter().enumerate() {
                        if std::mem::replace(&mut entry_seen[first + offset], true) {
                            return Err(IndexError::corrupt(idx, "entry shared by leaves"));
                        }
                        if !node.bounds.contains_point(&e.coord) {
                            return Err(IndexError::corrupt(idx, "entry outside leaf bounds"));
                        }
                    }
                }
            }
        }

        if let Some(orphan) = node_seen.iter().position(|s| !s) {
            return Err(IndexError::corrupt(orphan, "unreachable node"));
        }
        if let Some(orphan) = entry_seen.iter().position(|s| !s) {
            return Err(IndexError::corrupt(0, format!("entry {} unreachable", orphan)));
        }
        if self.positions.len() != self.entries.len() {
            return Err(IndexError::corrupt(0, "duplicate atom in entries"));
        }
        Ok(())
    }
}

/// Squared radius for distance comparisons. Negative and NaN radii are rejected.
pub(crate) fn squared_radius(radius: f32) -> Result<f32, IndexError> {
    if !(radius >= 0.0) {
        return Err(IndexError::InvalidRadius(radius));
    }
    Ok(radius * radius)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::TenantId;
    use crate::hilbert::hilbert_key;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_entries(n: usize, seed: u64) -> (Aabb, Vec<IndexEntry>) {
        let frame = Aabb::from_bounds(&[0.0, 0.0, 0.0], &[100.0, 100.0, 100.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let entries = (0..n)
            .map(|i| {
                let c = Coord::from_slice(&[
                    rng.gen_range(0.0..100.0),
                    rng.gen_range(0.0..100.0),
                    rng.gen_range(0.0..100.0),
                ])
                .unwrap();
                IndexEntry {
                    atom: AtomId(i as u64 + 1),
                    tenant: TenantId((i % 3) as u64),
                    coord: c,
                    key: hilbert_key(&c, &frame),
                }
            })
            .collect();
        (frame, entries)
    }

    fn params() -> TreeParams {
        TreeParams {
            leaf_capacity: 8,
            fanout: 4,
        }
    }

    #[test]
    fn test_bulk_load_verifies() {
        let (_, entries) = random_entries(1000, 1);
        let tree = SpatialTree::bulk_load(3, params(), entries).unwrap();
        assert_eq!(tree.len(), 1000);
        tree.verify().unwrap();
        assert!(tree.node_count() > 1000 / 8);
    }

    #[test]
    fn test_empty_tree() {
        let tree = SpatialTree::bulk_load(3, params(), Vec::new()).unwrap();
        tree.verify().unwrap();
        let c = Coord::from_slice(&[1.0, 1.0, 1.0]).unwrap();
        assert!(tree.radius_query(&c, 10.0, |_| true).unwrap().is_empty());
    }

    #[test]
    fn test_negative_or_nan_radius_is_rejected() {
        let (_, entries) = random_entries(100, 4);
        let tree = SpatialTree::bulk_load(3, params(), entries).unwrap();
        let center = Coord::from_slice(&[50.0, 50.0, 50.0]).unwrap();
        for radius in [-1.0f32, f32::NAN, f32::NEG_INFINITY] {
            assert!(matches!(
                tree.radius_query(&center, radius, |_| true),
                Err(IndexError::InvalidRadius(_))
            ));
            assert!(matches!(
                tree.scan_radius(&center, radius, |_| true),
                Err(IndexError::InvalidRadius(_))
            ));
        }
        assert_eq!(
            tree.radius_query(&center, f32::INFINITY, |_| true).unwrap().len(),
            100
        );
    }

    #[test]
    fn test_radius_query_matches_scan() {
        let (_, entries) = random_entries(2000, 2);
        let tree = SpatialTree::bulk_load(3, params(), entries).unwrap();
        let center = Coord::from_slice(&[40.0, 60.0, 50.0]).unwrap();
        for radius in [1.0f32, 5.0, 20.0, 200.0] {
            let mut a = tree.radius_query(&center, radius, |_| true).unwrap();
            let mut b = tree.scan_radius(&center, radius, |_| true).unwrap();
            a.sort_by(Candidate::order);
            b.sort_by(Candidate::order);
            assert_eq!(a, b, "radius {}", radius);
        }
    }

    #[test]
    fn test_range_query_filter() {
        let (_, entries) = random_entries(500, 3);
        let tree = SpatialTree::bulk_load(3, params(), entries.clone()).unwrap();
        let region = Aabb::from_bounds(&[10.0, 10.0, 10.0], &[50.0, 50.0, 50.0]).unwrap();
        let hits = tree
            .range_query(&region, |e| e.tenant == TenantId(1))
            .unwrap();
        let expected = entries
            .iter()
            .filter(|e| region.contains_point(&e.coord) && e.tenant == TenantId(1))
            .count();
        assert_eq!(hits.len(), expected);
    }

    #[test]
    fn test_entries_are_in_key_order() {
        let (_, entries) = random_entries(300, 4);
        let tree = SpatialTree::bulk_load(3, params(), entries).unwrap();
        assert!(tree.entries().windows(2).all(|w| w[0].key <= w[1].key));
    }

    #[test]
    fn test_verify_detects_escaped_child() {
        let (_, entries) = random_entries(200, 5);
        let mut tree = SpatialTree::bulk_load(3, params(), entries).unwrap();
        tree.nodes[0].bounds.max[0] = 1.0e6;
        assert!(tree.verify().unwrap_err().is_corruption());
        let center = Coord::from_slice(&[50.0, 50.0, 50.0]).unwrap();
        assert!(tree.radius_query(&center, 500.0, |_| true).is_err());
    }

    #[test]
    fn test_verify_detects_cycle() {
        let (_, entries) = random_entries(200, 6);
        let mut tree = SpatialTree::bulk_load(3, params(), entries).unwrap();
        let root = tree.nodes.len() - 1;
        tree.nodes[root].kind = NodeKind::Branch {
            first_child: root as u32,
            child_count: 1,
        };
        assert!(tree.verify().unwrap_err().is_corruption());
    }

    #[test]
    fn test_axis_mismatch_rejected() {
        let (_, entries) = random_entries(10, 7);
        let tree = SpatialTree::bulk_load(3, params(), entries).unwrap();
        let c = Coord::from_slice(&[1.0, 1.0]).unwrap();
        assert!(matches!(
            tree.radius_query(&c, 1.0, |_| true),
            Err(IndexError::AxisMismatch { .. })
        ));
    }
}
