// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! GRAIL interval labels over the condensation DAG.
//!
//! Each dimension assigns post-order numbers from one randomized DFS and a
//! `low` value: the smallest post-order number reachable from the vertex.
//! If `s` reaches `t` then `[low(t), post(t)]` nests inside
//! `[low(s), post(s)]` in every dimension, so a failed containment test in
//! any dimension refutes reachability. Containment itself proves nothing;
//! callers fall through to an exact check.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::reach::graph::Graph;

pub const DEFAULT_GRAIL_DIM: usize = 2;

pub struct Grail {
    dim: usize,
    /// labels[d][v] = (low, post), 1-based post numbers.
    labels: Vec<Vec<(u32, u32)>>,
}

impl Grail {
    /// Builds `dim` randomized labelings of a condensation DAG (edges must
    /// point from higher to lower vertex ids, as produced by `merge_scc`).
    pub fn build(dag: &Graph, dim: usize, seed: u64) -> Grail {
        let mut labels = Vec::with_capacity(dim);
        for d in 0..dim {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(d as u64));
            labels.push(Self::build_dimension(dag, &mut rng));
        }
        Grail { dim, labels }
    }

    fn build_dimension(dag: &Graph, rng: &mut StdRng) -> Vec<(u32, u32)> {
        let n = dag.num_vertices();
        let mut post = vec![0u32; n];
        let mut visited = vec![false; n];
        let mut counter = 1u32;

        // Roots are vertices with no incoming edges; shuffle both the root
        // order and every child order for this dimension.
        let mut roots: Vec<u32> = (0..n as u32)
            .filter(|v| dag.in_edges(*v).is_empty())
            .collect();
        roots.shuffle(rng);

        // (vertex, children in randomized order, cursor)
        let mut stack: Vec<(u32, Vec<u32>, usize)> = Vec::new();
        for root in roots {
            if visited[root as usize] {
                continue;
            }
            visited[root as usize] = true;
            stack.push((root, Self::shuffled_children(dag, root, rng), 0));
            while let Some(top) = stack.last_mut() {
                if top.2 < top.1.len() {
                    let child = top.1[top.2];
                    top.2 += 1;
                    if !visited[child as usize] {
                        visited[child as usize] = true;
                        let children = Self::shuffled_children(dag, child, rng);
                        stack.push((child, children, 0));
                    }
                } else {
                    post[top.0 as usize] = counter;
                    counter += 1;
                    stack.pop();
                }
            }
        }

        // low(v) = min over v's post and every successor's low. Successors
        // have smaller ids in the condensation numbering, so one ascending
        // scan suffices.
        let mut labels: Vec<(u32, u32)> = post.iter().map(|p| (*p, *p)).collect();
        for v in 0..n as u32 {
            let mut low = labels[v as usize].0;
            for (w, _) in dag.out_edges(v) {
                low = low.min(labels[*w as usize].0);
            }
            labels[v as usize].0 = low;
        }
        labels
    }

    fn shuffled_children(dag: &Graph, v: u32, rng: &mut StdRng) -> Vec<u32> {
        let mut children: Vec<u32> = dag.out_edges(v).iter().map(|(w, _)| *w).collect();
        children.shuffle(rng);
        children
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The necessary condition: containment in every dimension. A `false`
    /// answer is definitive unreachability.
    pub fn contains(&self, s: u32, t: u32) -> bool {
        for d in 0..self.dim {
            let (s_low, s_post) = self.labels[d][s as usize];
            let (t_low, t_post) = self.labels[d][t as usize];
            if t_low < s_low || t_post > s_post {
                return false;
            }
        }
        true
    }

    /// Index footprint in megabytes, for reporting.
    pub fn index_size_mb(&self) -> f64 {
        let entries: usize = self.labels.iter().map(|l| l.len()).sum();
        (entries * 2 * std::mem::size_of::<u32>()) as f64 / 1024.0 / 1024.0
    }
}
