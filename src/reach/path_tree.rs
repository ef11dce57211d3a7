// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Path-tree labels for exact DAG reachability on the backbone.
//!
//! Every vertex carries three integers: a spanning-tree interval (top,
//! middle) = (pre, post) and a longest-path level (bottom). Interval
//! containment proves reachability through tree edges alone; a level
//! comparison refutes it outright. Everything in between is decided by the
//! out-uncover lists: for each vertex, the non-tree edge targets that leave
//! its subtree. Any path leaving the subtree must cross one of them, so the
//! recursion over uncover lists is exact.

use crate::reach::graph::Graph;
use crate::reach::scc::topo_levels;
use crate::util::bit_vec::BitVec;

pub struct PathTree {
    /// (top, middle, bottom) = (pre, post, level) per vertex.
    labels: Vec<(u32, u32, u32)>,
    /// Targets of edges that escape the vertex's subtree, deduplicated.
    out_uncover: Vec<Vec<u32>>,
}

impl PathTree {
    /// Builds labels over a DAG numbered in reverse topological order
    /// (condensation numbering: edges point to smaller ids).
    pub fn build(dag: &Graph) -> PathTree {
        let n = dag.num_vertices();
        let levels = topo_levels(dag);

        // Spanning forest: scanning sources-first, each vertex attaches to
        // the first predecessor that entered the forest before it.
        let mut parent = vec![u32::MAX; n];
        let mut children: Vec<Vec<u32>> = vec![Vec::new(); n];
        for v in (0..n as u32).rev() {
            if let Some((p, _)) = dag.in_edges(v).first() {
                parent[v as usize] = *p;
                children[*p as usize].push(v);
            }
        }

        // Pre/post intervals over the forest.
        let mut pre = vec![0u32; n];
        let mut post = vec![0u32; n];
        let mut counter = 1u32;
        let mut stack: Vec<(u32, usize)> = Vec::new();
        for root in (0..n as u32).rev() {
            if parent[root as usize] != u32::MAX {
                continue;
            }
            pre[root as usize] = counter;
            counter += 1;
            stack.push((root, 0));
            while let Some(top) = stack.last_mut() {
                let (v, cursor) = (top.0, top.1);
                if cursor < children[v as usize].len() {
                    top.1 += 1;
                    let c = children[v as usize][cursor];
                    pre[c as usize] = counter;
                    counter += 1;
                    stack.push((c, 0));
                } else {
                    post[v as usize] = counter;
                    counter += 1;
                    stack.pop();
                }
            }
        }

        let labels: Vec<(u32, u32, u32)> = (0..n)
            .map(|v| (pre[v], post[v], levels[v]))
            .collect();

        // Uncover lists, children merged before their parent (ascending
        // post order). A target stays when it lies outside the subtree.
        let mut order: Vec<u32> = (0..n as u32).collect();
        order.sort_by_key(|v| post[*v as usize]);
        let mut out_uncover: Vec<Vec<u32>> = vec![Vec::new(); n];
        let in_subtree = |v: u32, w: u32| {
            pre[v as usize] <= pre[w as usize] && post[w as usize] <= post[v as usize]
        };
        for v in order {
            let mut uncover: Vec<u32> = Vec::new();
            for (w, _) in dag.out_edges(v) {
                if parent[*w as usize] != v && !in_subtree(v, *w) {
                    uncover.push(*w);
                }
            }
            for c in &children[v as usize] {
                for w in &out_uncover[*c as usize] {
                    if !in_subtree(v, *w) {
                        uncover.push(*w);
                    }
                }
            }
            uncover.sort_unstable();
            uncover.dedup();
            out_uncover[v as usize] = uncover;
        }

        PathTree {
            labels,
            out_uncover,
        }
    }

    pub fn labels(&self, v: u32) -> (u32, u32, u32) {
        self.labels[v as usize]
    }

    pub fn out_uncover(&self, v: u32) -> &[u32] {
        &self.out_uncover[v as usize]
    }

    #[inline]
    fn tree_contains(&self, s: u32, t: u32) -> bool {
        let (s_pre, s_post, _) = self.labels[s as usize];
        let (t_pre, t_post, _) = self.labels[t as usize];
        s_pre <= t_pre && t_post <= s_post
    }

    /// Exact reachability. Interval containment answers positively, levels
    /// refute, and otherwise the query hops across uncovered edge targets.
    pub fn reach(&self, s: u32, t: u32) -> bool {
        if s == t || self.tree_contains(s, t) {
            return true;
        }
        let mut visited = BitVec::with_capacity(self.labels.len());
        self.reach_rec(s, t, &mut visited)
    }

    fn reach_rec(&self, s: u32, t: u32, visited: &mut BitVec<u32>) -> bool {
        if s == t || self.tree_contains(s, t) {
            return true;
        }
        let (_, _, s_level) = self.labels[s as usize];
        let (_, _, t_level) = self.labels[t as usize];
        if t_level <= s_level {
            return false;
        }
        if !visited.insert(s) {
            return false;
        }
        for w in &self.out_uncover[s as usize] {
            if self.reach_rec(*w, t, visited) {
                return true;
            }
        }
        // Uncover hops from inside the subtree are already merged into s's
        // list, so nothing else can leave the subtree.
        false
    }

    /// Index footprint in megabytes, for reporting.
    pub fn index_size_mb(&self) -> f64 {
        let label_words = self.labels.len() * 3;
        let uncover_words: usize = self.out_uncover.iter().map(|u| u.len() + 1).sum();
        ((label_words + uncover_words) * std::mem::size_of::<u32>()) as f64 / 1024.0 / 1024.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reach::scc::merge_scc;
    use rand::rngs::StdRng;
    use rand::Rng;
    use rand::SeedableRng;

    fn exact_reach(g: &Graph, s: u32, t: u32) -> bool {
        let mut visited = BitVec::with_capacity(g.num_vertices());
        let mut stack = vec![s];
        visited.insert(s);
        while let Some(v) = stack.pop() {
            if v == t {
                return true;
            }
            for (w, _) in g.out_edges(v) {
                if visited.insert(*w) {
                    stack.push(*w);
                }
            }
        }
        false
    }

    #[test]
    fn diamond_with_cross_edges() {
        // 5 -> 4 -> 2 -> 0, 5 -> 3 -> 1 -> 0, 4 -> 1
        let mut g = Graph::with_vertices(6);
        g.add_edge(5, 4, 0);
        g.add_edge(4, 2, 0);
        g.add_edge(2, 0, 0);
        g.add_edge(5, 3, 0);
        g.add_edge(3, 1, 0);
        g.add_edge(1, 0, 0);
        g.add_edge(4, 1, 0);
        let pt = PathTree::build(&g);
        for s in 0..6 {
            for t in 0..6 {
                assert_eq!(
                    pt.reach(s, t),
                    exact_reach(&g, s, t),
                    "mismatch for {} -> {}",
                    s,
                    t
                );
            }
        }
    }

    #[test]
    fn random_dags_agree_with_dfs() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..20 {
            let n = 40u32;
            let mut g = Graph::with_vertices(n as usize);
            for v in 0..n {
                for w in 0..v {
                    if rng.gen_bool(0.08) {
                        // Keep the reverse-topo invariant: edges to lower ids.
                        g.add_edge(v, w, 0);
                    }
                }
            }
            let pt = PathTree::build(&g);
            for _ in 0..200 {
                let s = rng.gen_range(0..n);
                let t = rng.gen_range(0..n);
                assert_eq!(pt.reach(s, t), exact_reach(&g, s, t));
            }
        }
    }

    #[test]
    fn works_after_condensation() {
        let mut g = Graph::new();
        g.add_edge(0, 1, 0);
        g.add_edge(1, 0, 0);
        g.add_edge(1, 2, 0);
        g.add_edge(2, 3, 0);
        let scc = merge_scc(&g);
        let pt = PathTree::build(&scc.condensation);
        assert!(pt.reach(scc.rep(0), scc.rep(3)));
        assert!(!pt.reach(scc.rep(3), scc.rep(0)));
    }
}
