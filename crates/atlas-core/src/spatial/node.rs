//! Arena node and entry types of the spatial tree

use serde::{Deserialize, Serialize};

use crate::atom::{AtomId, TenantId};
use crate::geometry::{Aabb, Coord};

/// A non-owning reference from the index to an embedding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub atom: AtomId,
    pub tenant: TenantId,
    pub coord: Coord,
    /// Hilbert key of `coord` within the namespace frame.
    pub key: u64,
}

/// Node payload. Children and entries are contiguous ranges in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Branch { first_child: u32, child_count: u32 },
    Leaf { first_entry: u32, entry_count: u32 },
}

/// A node of the packed tree, addressed by its index in the arena.
///
/// Nodes are written bottom-up, so every child index is strictly smaller
/// than its parent's index. Traversal relies on that ordering to reject
/// cycles in a damaged arena.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub bounds: Aabb,
    pub kind: NodeKind,
}

impl Node {
    pub fn leaf(bounds: Aabb, first_entry: u32, entry_count: u32) -> Self {
        Self {
            bounds,
            kind: NodeKind::Leaf {
                first_entry,
                entry_count,
            },
        }
    }

    pub fn branch(bounds: Aabb, first_child: u32, child_count: u32) -> Self {
        Self {
            bounds,
            kind: NodeKind::Branch {
                first_child,
                child_count,
            },
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }
}

/// A filter-phase hit: the entry and its projected distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub atom: AtomId,
    pub tenant: TenantId,
    pub distance: f32,
}

impl Candidate {
    /// Ascending distance, then ascending AtomId.
    pub fn order(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
        a.distance.total_cmp(&b.distance).then(a.atom.cmp(&b.atom))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_tie_break_by_atom() {
        let mut hits = vec![
            Candidate {
                atom: AtomId(9),
                tenant: TenantId(1),
                distance: 1.0,
            },
            Candidate {
                atom: AtomId(3),
                tenant: TenantId(1),
                distance: 1.0,
            },
            Candidate {
                atom: AtomId(5),
                tenant: TenantId(1),
                distance: 0.5,
            },
        ];
        hits.sort_by(Candidate::order);
        let ids: Vec<u64> = hits.iter().map(|c| c.atom.0).collect();
        assert_eq!(ids, vec![5, 3, 9]);
    }

    #[test]
    fn test_node_kind() {
        let b = Aabb::empty(3);
        assert!(Node::leaf(b, 0, 4).is_leaf());
        assert!(!Node::branch(b, 0, 2).is_leaf());
    }
}
