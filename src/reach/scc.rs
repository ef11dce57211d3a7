// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Strongly connected component merging for the indexing graph.
//!
//! Tarjan's algorithm, iterative so million-vertex graphs cannot blow the
//! call stack. Components are numbered in the order Tarjan finalizes them,
//! which is reverse topological: every condensation edge points from a
//! higher component id to a lower one. Later stages lean on that property.

use crate::reach::graph::Graph;

pub struct SccResult {
    /// Original vertex -> component id.
    pub scc_of: Vec<u32>,
    pub num_sccs: usize,
    /// The condensation DAG over component ids.
    pub condensation: Graph,
}

impl SccResult {
    #[inline]
    pub fn rep(&self, v: u32) -> u32 {
        self.scc_of[v as usize]
    }
}

/// Merges strongly connected components and builds the condensation.
pub fn merge_scc(graph: &Graph) -> SccResult {
    let n = graph.num_vertices();
    const UNVISITED: u32 = u32::MAX;

    let mut index = vec![UNVISITED; n];
    let mut lowlink = vec![0u32; n];
    let mut on_stack = vec![false; n];
    let mut scc_of = vec![0u32; n];
    let mut stack: Vec<u32> = Vec::new();
    let mut next_index = 0u32;
    let mut num_sccs = 0usize;

    // (vertex, next out-edge cursor)
    let mut call_stack: Vec<(u32, usize)> = Vec::new();

    for root in 0..n as u32 {
        if index[root as usize] != UNVISITED {
            continue;
        }
        call_stack.push((root, 0));
        index[root as usize] = next_index;
        lowlink[root as usize] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root as usize] = true;

        while let Some(&mut (v, ref mut cursor)) = call_stack.last_mut() {
            if *cursor < graph.out_edges(v).len() {
                let (w, _) = graph.out_edges(v)[*cursor];
                *cursor += 1;
                if index[w as usize] == UNVISITED {
                    index[w as usize] = next_index;
                    lowlink[w as usize] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w as usize] = true;
                    call_stack.push((w, 0));
                } else if on_stack[w as usize] {
                    lowlink[v as usize] = lowlink[v as usize].min(index[w as usize]);
                }
            } else {
                call_stack.pop();
                if let Some(&mut (parent, _)) = call_stack.last_mut() {
                    lowlink[parent as usize] = lowlink[parent as usize].min(lowlink[v as usize]);
                }
                if lowlink[v as usize] == index[v as usize] {
                    // v roots a component; pop it off.
                    loop {
                        let w = stack.pop().unwrap();
                        on_stack[w as usize] = false;
                        scc_of[w as usize] = num_sccs as u32;
                        if w == v {
                            break;
                        }
                    }
                    num_sccs += 1;
                }
            }
        }
    }

    let mut condensation = Graph::with_vertices(num_sccs);
    for v in 0..n as u32 {
        for (w, _) in graph.out_edges(v) {
            let cv = scc_of[v as usize];
            let cw = scc_of[*w as usize];
            if cv != cw {
                condensation.add_edge(cv, cw, 0);
            }
        }
    }

    SccResult {
        scc_of,
        num_sccs,
        condensation,
    }
}

/// Longest-path levels over a condensation DAG. Sources sit at level 0 and
/// every edge strictly increases the level, so `level(t) <= level(s)` for
/// distinct components refutes reachability.
pub fn topo_levels(condensation: &Graph) -> Vec<u32> {
    let n = condensation.num_vertices();
    let mut level = vec![0u32; n];
    // Condensation edges always point to smaller ids; scanning from the
    // highest id visits every vertex after all its predecessors.
    for v in (0..n as u32).rev() {
        for (w, _) in condensation.out_edges(v) {
            level[*w as usize] = level[*w as usize].max(level[v as usize] + 1);
        }
    }
    level
}
