// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Backbone extraction over the condensation DAG.
//!
//! The backbone is a sparse vertex subset such that every path longer than
//! `epsilon` hops passes a backbone vertex within its first (and last)
//! `epsilon` hops. Discovery makes that a hard guarantee: scanning in
//! reverse topological order, a vertex is promoted whenever some path of
//! `epsilon` hops leaves it without meeting the backbone; a symmetric pass
//! covers the incoming direction. Anchors are promoted up front and a small
//! random fraction `p` on top, which only tightens coverage.
//!
//! Gate sets then reduce an arbitrary reachability query to (a) a bounded
//! local search and (b) backbone-to-backbone reachability, which the path
//! tree answers exactly.

use std::collections::{HashMap, VecDeque};

use log::info;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use crate::reach::graph::Graph;
use crate::util::bit_vec::BitVec;

pub const DEFAULT_EPSILON: usize = 10;
pub const DEFAULT_PROMOTION_PROBABILITY: f64 = 0.02;

pub struct Backbone {
    pub epsilon: usize,
    is_backbone: Vec<bool>,
    /// Condensation vertex -> backbone-graph vertex.
    index_of: HashMap<u32, u32>,
    /// Backbone-graph vertex -> condensation vertex.
    vertices: Vec<u32>,
    /// Edges between backbone vertices whose connecting path avoids other
    /// backbone vertices. Preserves reachability among backbone vertices.
    pub graph: Graph,
    /// Per condensation vertex: backbone-graph vertices first met going
    /// forward / backward.
    out_gates: Vec<Vec<u32>>,
    in_gates: Vec<Vec<u32>>,
}

impl Backbone {
    pub fn discover(dag: &Graph, anchors: &[u32], epsilon: usize, p: f64, seed: u64) -> Backbone {
        let n = dag.num_vertices();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut is_backbone = vec![false; n];
        for a in anchors {
            is_backbone[*a as usize] = true;
        }
        for v in 0..n {
            if p > 0.0 && rng.gen_bool(p.min(1.0)) {
                is_backbone[v] = true;
            }
        }

        // Forward coverage: reverse topological order is ascending vertex id
        // in the condensation numbering.
        for v in 0..n as u32 {
            if !is_backbone[v as usize] && escapes(dag, v, epsilon, &is_backbone, true) {
                is_backbone[v as usize] = true;
            }
        }
        // Backward coverage, processed sources-first.
        for v in (0..n as u32).rev() {
            if !is_backbone[v as usize] && escapes(dag, v, epsilon, &is_backbone, false) {
                is_backbone[v as usize] = true;
            }
        }

        let vertices: Vec<u32> = (0..n as u32).filter(|v| is_backbone[*v as usize]).collect();
        let index_of: HashMap<u32, u32> = vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (*v, i as u32))
            .collect();

        // Backbone edges: from each backbone vertex, walk forward through
        // non-backbone territory until the next backbone vertices.
        let mut graph = Graph::with_vertices(vertices.len());
        for (i, v) in vertices.iter().enumerate() {
            for target in frontier(dag, *v, &is_backbone, usize::MAX, true) {
                graph.add_edge(i as u32, index_of[&target], 0);
            }
        }

        let mut out_gates = Vec::with_capacity(n);
        let mut in_gates = Vec::with_capacity(n);
        for v in 0..n as u32 {
            let fwd = frontier(dag, v, &is_backbone, usize::MAX, true)
                .into_iter()
                .map(|b| index_of[&b])
                .collect();
            let bwd = frontier(dag, v, &is_backbone, usize::MAX, false)
                .into_iter()
                .map(|b| index_of[&b])
                .collect();
            out_gates.push(fwd);
            in_gates.push(bwd);
        }

        info!(
            "backbone: {} of {} vertices, {} edges",
            vertices.len(),
            n,
            graph.num_edges()
        );
        Backbone {
            epsilon,
            is_backbone,
            index_of,
            vertices,
            graph,
            out_gates,
            in_gates,
        }
    }

    #[inline]
    pub fn is_backbone(&self, v: u32) -> bool {
        self.is_backbone[v as usize]
    }

    pub fn size(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_size(&self) -> usize {
        self.graph.num_edges()
    }

    pub fn backbone_vertex(&self, index: u32) -> u32 {
        self.vertices[index as usize]
    }

    pub fn backbone_index(&self, v: u32) -> Option<u32> {
        self.index_of.get(&v).copied()
    }

    /// Backbone-graph vertices guarding `v`'s outgoing paths. For a
    /// backbone vertex that is `v` itself.
    pub fn out_gates(&self, v: u32) -> &[u32] {
        &self.out_gates[v as usize]
    }

    pub fn in_gates(&self, v: u32) -> &[u32] {
        &self.in_gates[v as usize]
    }

    /// Bounded BFS on the condensation; catches pairs whose connecting path
    /// never meets the backbone, which coverage limits to `epsilon` hops.
    pub fn local_reach(&self, dag: &Graph, s: u32, t: u32, limit: usize) -> bool {
        if s == t {
            return true;
        }
        let mut visited = BitVec::with_capacity(dag.num_vertices());
        let mut queue = VecDeque::new();
        visited.insert(s);
        queue.push_back((s, 0usize));
        while let Some((v, depth)) = queue.pop_front() {
            if depth >= limit {
                continue;
            }
            for (w, _) in dag.out_edges(v) {
                if *w == t {
                    return true;
                }
                if visited.insert(*w) {
                    queue.push_back((*w, depth + 1));
                }
            }
        }
        false
    }

    /// Writes the backbone graph in the persisted text format.
    pub fn output_backbone(&self, path: &std::path::Path) -> std::io::Result<()> {
        std::fs::write(path, self.graph.to_text())
    }
}

/// True when some path of exactly `epsilon` hops leaves `v` without touching
/// a backbone vertex. `forward` selects the edge direction.
fn escapes(dag: &Graph, v: u32, epsilon: usize, is_backbone: &[bool], forward: bool) -> bool {
    let mut visited = BitVec::with_capacity(dag.num_vertices());
    let mut queue = VecDeque::new();
    visited.insert(v);
    queue.push_back((v, 0usize));
    while let Some((u, depth)) = queue.pop_front() {
        if depth == epsilon {
            return true;
        }
        let edges = if forward {
            dag.out_edges(u)
        } else {
            dag.in_edges(u)
        };
        for (w, _) in edges {
            if !is_backbone[*w as usize] && visited.insert(*w) {
                queue.push_back((*w, depth + 1));
            }
        }
    }
    false
}

/// The first backbone vertices met from `v`, walking through non-backbone
/// vertices only.
fn frontier(dag: &Graph, v: u32, is_backbone: &[bool], limit: usize, forward: bool) -> Vec<u32> {
    let mut result = Vec::new();
    let mut visited = BitVec::with_capacity(dag.num_vertices());
    let mut queue = VecDeque::new();
    visited.insert(v);
    queue.push_back((v, 0usize));
    if is_backbone[v as usize] {
        return vec![v];
    }
    while let Some((u, depth)) = queue.pop_front() {
        if depth >= limit {
            continue;
        }
        let edges = if forward {
            dag.out_edges(u)
        } else {
            dag.in_edges(u)
        };
        for (w, _) in edges {
            if !visited.insert(*w) {
                continue;
            }
            if is_backbone[*w as usize] {
                result.push(*w);
            } else {
                queue.push_back((*w, depth + 1));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A chain 9 -> 8 -> ... -> 0 in reverse-topo numbering.
    fn chain(n: u32) -> Graph {
        let mut g = Graph::with_vertices(n as usize);
        for v in (1..n).rev() {
            g.add_edge(v, v - 1, 0);
        }
        g
    }

    #[test]
    fn coverage_promotion_bounds_free_paths() {
        let g = chain(30);
        let bb = Backbone::discover(&g, &[], 4, 0.0, 1);
        // No vertex may start an epsilon-long backbone-free path.
        for v in 0..30u32 {
            if !bb.is_backbone(v) {
                assert!(!escapes(&g, v, 4, &(0..30).map(|u| bb.is_backbone(u)).collect::<Vec<_>>(), true));
            }
        }
        assert!(bb.size() > 0);
    }

    #[test]
    fn gates_guard_every_vertex() {
        let g = chain(20);
        let bb = Backbone::discover(&g, &[], 3, 0.0, 5);
        for v in 1..20u32 {
            // Anything that reaches far must pass a gate.
            if !bb.out_gates(v).is_empty() {
                for gate in bb.out_gates(v) {
                    assert!(bb.is_backbone(bb.backbone_vertex(*gate)));
                }
            }
        }
    }

    #[test]
    fn backbone_graph_preserves_reachability() {
        let g = chain(25);
        let bb = Backbone::discover(&g, &[24, 0], 5, 0.0, 9);
        let first = bb.backbone_index(24).unwrap();
        let last = bb.backbone_index(0).unwrap();
        // Walk the backbone graph from 24's component to 0's.
        let mut visited = vec![false; bb.size()];
        let mut queue = VecDeque::from([first]);
        visited[first as usize] = true;
        while let Some(v) = queue.pop_front() {
            for (w, _) in bb.graph.out_edges(v) {
                if !visited[*w as usize] {
                    visited[*w as usize] = true;
                    queue.push_back(*w);
                }
            }
        }
        assert!(visited[last as usize]);
    }

    #[test]
    fn local_reach_is_depth_bounded() {
        let g = chain(10);
        let bb = Backbone::discover(&g, &[], 3, 0.0, 2);
        assert!(bb.local_reach(&g, 9, 7, 4));
        assert!(!bb.local_reach(&g, 9, 0, 4));
        assert!(bb.local_reach(&g, 5, 5, 0));
    }
}
