// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The parallel tabulation solver.
//!
//! Vertices are partitioned into contiguous chunks, one worker per chunk.
//! Each worker owns a visited set indexed by its thread id and commits each
//! source's reach set under the results mutex in one piece, so readers never
//! observe a partially written row. The cancellation token is polled at
//! every dequeue; cancelled workers contribute what they have finished.

use std::sync::Mutex;

use log::warn;

use crate::reach::graph::Graph;
use crate::reach::tabulation::Tabulation;
use crate::util::bit_vec::BitVec;
use crate::util::CancellationToken;

/// Workers default to `min(hardware_concurrency - 1, 10)`, with at least one.
pub fn default_workers() -> usize {
    let hw = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    hw.saturating_sub(1).clamp(1, 10)
}

pub struct ParallelTabulation<'g> {
    graph: &'g Graph,
    num_threads: usize,
    cancel: CancellationToken,
}

impl<'g> ParallelTabulation<'g> {
    pub fn new(graph: &'g Graph, cancel: CancellationToken) -> Self {
        Self::with_threads(graph, default_workers(), cancel)
    }

    pub fn with_threads(graph: &'g Graph, num_threads: usize, cancel: CancellationToken) -> Self {
        ParallelTabulation {
            graph,
            num_threads: num_threads.max(1),
            cancel,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn method(&self) -> &'static str {
        "ParallelTabulate"
    }

    /// Single-pair query; delegates to the sequential solver.
    pub fn reach(&self, s: u32, t: u32) -> bool {
        Tabulation::new(self.graph).reach_via_summaries(s, t)
    }

    /// Reach sets for every source vertex. Row `i` is `None` when the
    /// computation was cancelled before source `i` finished.
    pub fn closure_sets(&self) -> Vec<Option<BitVec<u32>>> {
        let n = self.graph.num_vertices();
        let results: Mutex<Vec<Option<BitVec<u32>>>> = Mutex::new(vec![None; n]);

        if self.num_threads <= 1 || n == 0 {
            self.process_vertex_range(0, n, &results);
        } else {
            let per_thread = n / self.num_threads;
            let remainder = n % self.num_threads;
            std::thread::scope(|scope| {
                let mut start = 0usize;
                for i in 0..self.num_threads {
                    let chunk = per_thread + usize::from(i < remainder);
                    if chunk == 0 {
                        continue;
                    }
                    let end = start + chunk;
                    let results_ref = &results;
                    scope.spawn(move || {
                        self.process_vertex_range(start, end, results_ref);
                    });
                    start = end;
                }
            });
        }

        results.into_inner().unwrap()
    }

    /// Transitive closure size in megabytes.
    pub fn tc(&self) -> f64 {
        let sets = self.closure_sets();
        let mut cancelled = 0usize;
        let mut total_bits = 0usize;
        for row in &sets {
            match row {
                Some(set) => total_bits += set.count(),
                None => cancelled += 1,
            }
        }
        if cancelled > 0 {
            warn!("parallel closure cancelled with {} sources unfinished", cancelled);
        }
        (total_bits * std::mem::size_of::<u32>()) as f64 / 1024.0 / 1024.0
    }

    fn process_vertex_range(
        &self,
        start: usize,
        end: usize,
        results: &Mutex<Vec<Option<BitVec<u32>>>>,
    ) {
        let tab = Tabulation::new(self.graph);
        for source in start..end {
            if self.cancel.is_cancelled() {
                break;
            }
            let mut visited = BitVec::with_capacity(self.graph.num_vertices());
            tab.traverse(source as u32, &mut visited);
            // Commit the whole row at once.
            let mut rows = results.lock().unwrap();
            rows[source] = Some(visited);
        }
    }
}
