// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The unification-based pointer graph.
//!
//! Every IR value of interest maps to a node; nodes carry labeled successor
//! edges (`Deref` for the pointed-to cell, `Field(k)` for structural
//! offsets). Unification keeps the graph congruence-closed: whenever two
//! nodes merge, equally-labeled successors merge too, so after constraint
//! saturation two values alias iff their nodes share a root.

use std::collections::HashMap;

use crate::ir::ValueId;
use crate::util::bit_vec::Idx;

/// Field tags beyond this collapse into a single tag; the analysis degrades
/// to field-insensitivity for very wide structs.
pub const MAX_FIELD_TAG: u32 = 8;

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DyckNodeId(pub u32);

impl Idx for DyckNodeId {
    #[inline]
    fn new(idx: usize) -> Self {
        assert!(idx <= u32::MAX as usize);
        DyckNodeId(idx as u32)
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for DyckNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "d{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DyckLabel {
    Deref,
    Field(u32),
}

impl DyckLabel {
    /// Field labels share a bounded tag space.
    pub fn field(k: u32) -> DyckLabel {
        DyckLabel::Field(k.min(MAX_FIELD_TAG))
    }
}

pub struct DyckGraph {
    parent: Vec<u32>,
    rank: Vec<u32>,
    /// Labeled successor edges; meaningful on class roots only.
    succs: Vec<Vec<(DyckLabel, DyckNodeId)>>,
    /// IR values collapsed into each class; meaningful on class roots only.
    members: Vec<Vec<ValueId>>,
    value_map: HashMap<ValueId, DyckNodeId>,
}

impl Default for DyckGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DyckGraph {
    /// Creates the graph with the reserved universal node at index 0.
    pub fn new() -> Self {
        let mut graph = DyckGraph {
            parent: Vec::new(),
            rank: Vec::new(),
            succs: Vec::new(),
            members: Vec::new(),
            value_map: HashMap::new(),
        };
        graph.fresh_node();
        graph
    }

    /// The sentinel class absorbing the effects of unmodeled externals.
    #[inline]
    pub fn universal(&self) -> DyckNodeId {
        DyckNodeId(0)
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.parent.len()
    }

    /// Creates an anonymous node (an abstract memory object).
    pub fn fresh_node(&mut self) -> DyckNodeId {
        let id = DyckNodeId::new(self.parent.len());
        self.parent.push(id.0);
        self.rank.push(0);
        self.succs.push(Vec::new());
        self.members.push(Vec::new());
        id
    }

    /// Returns the node for `v`, creating it on first use.
    pub fn make_node(&mut self, v: ValueId) -> DyckNodeId {
        if let Some(id) = self.value_map.get(&v) {
            return *id;
        }
        let id = self.fresh_node();
        self.members[id.index()].push(v);
        self.value_map.insert(v, id);
        id
    }

    pub fn node_of(&self, v: ValueId) -> Option<DyckNodeId> {
        self.value_map.get(&v).copied()
    }

    /// Root lookup without path mutation; usable on the frozen graph.
    pub fn find(&self, id: DyckNodeId) -> DyckNodeId {
        let mut cur = id.0;
        while self.parent[cur as usize] != cur {
            cur = self.parent[cur as usize];
        }
        DyckNodeId(cur)
    }

    /// Root lookup with path compression; build-time only.
    pub fn find_compress(&mut self, id: DyckNodeId) -> DyckNodeId {
        let root = self.find(id);
        let mut cur = id.0;
        while self.parent[cur as usize] != root.0 {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root.0;
            cur = next;
        }
        root
    }

    /// Merges the classes of `a` and `b` and restores congruence closure:
    /// for each label present on both roots the targets are merged as well.
    pub fn unite(&mut self, a: DyckNodeId, b: DyckNodeId) -> DyckNodeId {
        let mut pending = vec![(a, b)];
        while let Some((x, y)) = pending.pop() {
            let rx = self.find_compress(x);
            let ry = self.find_compress(y);
            if rx == ry {
                continue;
            }
            let (winner, loser) = if self.rank[rx.index()] >= self.rank[ry.index()] {
                (rx, ry)
            } else {
                (ry, rx)
            };
            if self.rank[winner.index()] == self.rank[loser.index()] {
                self.rank[winner.index()] += 1;
            }
            self.parent[loser.index()] = winner.0;

            let loser_members = std::mem::take(&mut self.members[loser.index()]);
            self.members[winner.index()].extend(loser_members);

            let loser_succs = std::mem::take(&mut self.succs[loser.index()]);
            for (label, target) in loser_succs {
                let pos = self.succs[winner.index()]
                    .iter()
                    .position(|(lab, _)| *lab == label);
                match pos {
                    Some(p) => {
                        let existing = self.succs[winner.index()][p].1;
                        pending.push((existing, target));
                    }
                    None => self.succs[winner.index()].push((label, target)),
                }
            }
        }
        self.find_compress(a)
    }

    /// The `label` successor of `id`'s class, as a root.
    pub fn succ(&self, id: DyckNodeId, label: DyckLabel) -> Option<DyckNodeId> {
        let root = self.find(id);
        self.succs[root.index()]
            .iter()
            .find(|(lab, _)| *lab == label)
            .map(|(_, target)| self.find(*target))
    }

    /// Adds a labeled edge; when the label is already present the two targets
    /// are unified instead.
    pub fn set_succ(&mut self, id: DyckNodeId, label: DyckLabel, target: DyckNodeId) {
        let root = self.find_compress(id);
        let pos = self.succs[root.index()]
            .iter()
            .position(|(lab, _)| *lab == label);
        match pos {
            Some(p) => {
                let existing = self.succs[root.index()][p].1;
                self.unite(existing, target);
            }
            None => self.succs[root.index()].push((label, target)),
        }
    }

    /// The cell a pointer class points to, created on demand.
    pub fn pointee(&mut self, id: DyckNodeId) -> DyckNodeId {
        if let Some(p) = self.succ(id, DyckLabel::Deref) {
            return p;
        }
        let cell = self.fresh_node();
        self.set_succ(id, DyckLabel::Deref, cell);
        self.find(cell)
    }

    #[inline]
    pub fn is_universal_class(&self, id: DyckNodeId) -> bool {
        self.find(id) == self.find(self.universal())
    }

    /// True when both values were seen and share a class.
    pub fn same_class(&self, a: ValueId, b: ValueId) -> bool {
        match (self.node_of(a), self.node_of(b)) {
            (Some(na), Some(nb)) => self.find(na) == self.find(nb),
            _ => false,
        }
    }

    /// IR values collapsed into the class of `id`.
    pub fn class_members(&self, id: DyckNodeId) -> &[ValueId] {
        &self.members[self.find(id).index()]
    }

    /// Compresses every parent chain. Called once before the graph freezes
    /// so read-only `find` is a single hop afterwards.
    pub fn finalize(&mut self) {
        for i in 0..self.parent.len() {
            self.find_compress(DyckNodeId::new(i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Module, TypeInfo};

    fn values(n: usize) -> (Module, Vec<ValueId>) {
        let mut m = Module::new("t");
        let f = m.define_function("f", &[], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb = b.block();
        let vals = (0..n).map(|_| b.alloca(bb)).collect();
        (m, vals)
    }

    #[test]
    fn find_is_idempotent() {
        let (_m, vals) = values(4);
        let mut g = DyckGraph::new();
        let nodes: Vec<_> = vals.iter().map(|v| g.make_node(*v)).collect();
        g.unite(nodes[0], nodes[1]);
        g.unite(nodes[1], nodes[2]);
        for n in &nodes {
            assert_eq!(g.find(g.find(*n)), g.find(*n));
        }
        assert_eq!(g.find(nodes[0]), g.find(nodes[2]));
        assert_ne!(g.find(nodes[0]), g.find(nodes[3]));
    }

    #[test]
    fn make_node_is_idempotent() {
        let (_m, vals) = values(1);
        let mut g = DyckGraph::new();
        let a = g.make_node(vals[0]);
        let b = g.make_node(vals[0]);
        assert_eq!(a, b);
        assert_eq!(g.class_members(a), &[vals[0]]);
    }

    #[test]
    fn union_merges_labeled_targets() {
        let (_m, vals) = values(2);
        let mut g = DyckGraph::new();
        let p = g.make_node(vals[0]);
        let q = g.make_node(vals[1]);
        let cp = g.pointee(p);
        let cq = g.pointee(q);
        assert_ne!(g.find(cp), g.find(cq));

        // Merging the pointers must merge their cells.
        g.unite(p, q);
        assert_eq!(g.find(cp), g.find(cq));
        assert_eq!(g.succ(p, DyckLabel::Deref), Some(g.find(cp)));
    }

    #[test]
    fn congruence_closes_recursively() {
        let mut g = DyckGraph::new();
        // Two chains a -> b -> c and x -> y -> z through deref edges.
        let chain = |g: &mut DyckGraph| {
            let a = g.fresh_node();
            let b = g.pointee(a);
            let c = g.pointee(b);
            (a, b, c)
        };
        let (a, _b, c) = chain(&mut g);
        let (x, _y, z) = chain(&mut g);
        g.unite(a, x);
        // The second-level cells merged through the first level.
        assert_eq!(g.find(c), g.find(z));
    }

    #[test]
    fn wide_fields_collapse() {
        assert_eq!(DyckLabel::field(3), DyckLabel::Field(3));
        assert_eq!(DyckLabel::field(100), DyckLabel::Field(MAX_FIELD_TAG));
        assert_eq!(DyckLabel::field(200), DyckLabel::field(100));
    }

    #[test]
    fn set_succ_on_existing_label_unites() {
        let mut g = DyckGraph::new();
        let p = g.fresh_node();
        let t1 = g.fresh_node();
        let t2 = g.fresh_node();
        g.set_succ(p, DyckLabel::field(0), t1);
        g.set_succ(p, DyckLabel::field(0), t2);
        assert_eq!(g.find(t1), g.find(t2));
    }
}
