// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The online tabulation solver for matched call/return reachability.
//!
//! `reach` runs directly on the labeled graph with an explicit stack of open
//! call sites: direct edges are always taken, `+k` pushes, `-k` is taken
//! only when it closes the innermost open site. The visited set is keyed by
//! (vertex, stack hash); stacks are persistent lists so the hash of every
//! prefix rides along for free. Pathological graphs can realize
//! combinatorially many stacks, so the search carries a state budget; once
//! it trips, the solver summarizes a private copy of the graph and answers
//! from that instead, which is exact and polynomial.
//!
//! `traverse` is the closure-oriented variant used once summary edges exist:
//! with balanced shortcuts in place, a matched path never needs to take a
//! close edge, so skipping negatives is exact and cheap.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};

use rpds::List;

use crate::reach::graph::Graph;
use crate::util::bit_vec::BitVec;
use crate::util::CancellationToken;

/// Open call sites deeper than this stop being tracked; hitting the bound
/// routes the query to the summarized fallback.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 128;

/// Explored (vertex, stack) states per query before the query falls back.
pub const DEFAULT_MAX_STATES: usize = 1 << 20;

pub struct Tabulation<'g> {
    graph: &'g Graph,
    max_call_depth: usize,
    max_states: usize,
    /// Lazily built summarized copy backing the fallback path.
    summarized: RefCell<Option<Graph>>,
}

/// A persistent stack of open call sites. Each element carries the hash of
/// the stack up to and including itself.
type CallStack = List<(i32, u64)>;

fn stack_hash(stack: &CallStack) -> u64 {
    stack.first().map(|(_, h)| *h).unwrap_or(0)
}

fn stack_push(stack: &CallStack, k: i32) -> CallStack {
    let mixed = stack_hash(stack)
        .wrapping_mul(0x100000001b3)
        .wrapping_add(k as u64);
    stack.push_front((k, mixed))
}

/// Matched reachability over a graph whose summary edges are in place:
/// follow direct, summary and open edges, skip closes.
fn summary_bfs(graph: &Graph, s: u32, t: u32) -> bool {
    if s == t {
        return true;
    }
    let mut visited = BitVec::with_capacity(graph.num_vertices());
    let mut queue = VecDeque::new();
    visited.insert(s);
    queue.push_back(s);
    while let Some(v) = queue.pop_front() {
        for (w, label) in graph.out_edges(v) {
            if *label < 0 {
                continue;
            }
            if *w == t {
                return true;
            }
            if visited.insert(*w) {
                queue.push_back(*w);
            }
        }
    }
    false
}

impl<'g> Tabulation<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Tabulation {
            graph,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_states: DEFAULT_MAX_STATES,
            summarized: RefCell::new(None),
        }
    }

    pub fn with_limits(graph: &'g Graph, max_call_depth: usize, max_states: usize) -> Self {
        Tabulation {
            graph,
            max_call_depth,
            max_states,
            summarized: RefCell::new(None),
        }
    }

    /// Matched reachability from `s` to `t`, deterministic in vertex order.
    pub fn reach(&self, s: u32, t: u32) -> bool {
        if s == t {
            return true;
        }
        let mut visited: HashSet<(u32, u64)> = HashSet::new();
        let mut stack: Vec<(u32, CallStack)> = vec![(s, List::new())];
        visited.insert((s, 0));

        while let Some((v, calls)) = stack.pop() {
            for (w, label) in self.graph.out_edges(v) {
                let next = if *label == 0 {
                    Some(calls.clone())
                } else if *label > 0 {
                    if calls.len() >= self.max_call_depth {
                        return self.reach_fallback(s, t);
                    }
                    Some(stack_push(&calls, *label))
                } else {
                    match calls.first() {
                        Some((top, _)) if *top == -*label => Some(calls.drop_first().unwrap()),
                        _ => None,
                    }
                };
                if let Some(next_calls) = next {
                    if *w == t {
                        return true;
                    }
                    if visited.len() >= self.max_states {
                        return self.reach_fallback(s, t);
                    }
                    if visited.insert((*w, stack_hash(&next_calls))) {
                        stack.push((*w, next_calls));
                    }
                }
            }
        }
        false
    }

    /// The exact answer via a summarized private copy of the graph.
    fn reach_fallback(&self, s: u32, t: u32) -> bool {
        if self.summarized.borrow().is_none() {
            let mut copy = self.graph.clone();
            // Not driven by a cancellation token; summarization of an
            // already-loaded graph is the cheap part.
            copy.build_summary_edges(&CancellationToken::new())
                .expect("summarization without a cancel source cannot fail");
            *self.summarized.borrow_mut() = Some(copy);
        }
        let borrowed = self.summarized.borrow();
        summary_bfs(borrowed.as_ref().unwrap(), s, t)
    }

    /// Everything reachable from `s` along matched paths, assuming summary
    /// edges have been added: direct and open edges are followed, closes
    /// are skipped.
    pub fn traverse(&self, s: u32, visited: &mut BitVec<u32>) {
        let mut queue = VecDeque::new();
        visited.insert(s);
        queue.push_back(s);
        while let Some(v) = queue.pop_front() {
            for (w, label) in self.graph.out_edges(v) {
                if *label >= 0 && visited.insert(*w) {
                    queue.push_back(*w);
                }
            }
        }
    }

    /// Same traversal with a target short-circuit.
    pub fn reach_via_summaries(&self, s: u32, t: u32) -> bool {
        summary_bfs(self.graph, s, t)
    }

    /// Full transitive closure under the matched discipline. Returns the
    /// closure size in megabytes; the per-source sets are discarded.
    pub fn tc(&self, cancel: &CancellationToken) -> f64 {
        let mut total_bits = 0usize;
        for s in 0..self.graph.num_vertices() as u32 {
            if cancel.is_cancelled() {
                break;
            }
            let mut visited = BitVec::with_capacity(self.graph.num_vertices());
            self.traverse(s, &mut visited);
            total_bits += visited.count();
        }
        (total_bits * std::mem::size_of::<u32>()) as f64 / 1024.0 / 1024.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// p -(+7)-> q -(0)-> r -(-7)-> result, plus a stray -9 edge.
    fn call_shaped() -> Graph {
        let mut g = Graph::new();
        g.add_edge(0, 1, 7);
        g.add_edge(1, 2, 0);
        g.add_edge(2, 3, -7);
        g.add_edge(2, 4, -9);
        g
    }

    #[test]
    fn matched_path_is_accepted() {
        let g = call_shaped();
        let tab = Tabulation::new(&g);
        assert!(tab.reach(0, 3));
        assert!(tab.reach(0, 2));
        assert!(tab.reach(2, 2));
    }

    #[test]
    fn mismatched_close_is_rejected() {
        let g = call_shaped();
        let tab = Tabulation::new(&g);
        assert!(!tab.reach(0, 4), "-9 cannot close +7");
        // From inside the callee with an empty stack, both close edges
        // stay unavailable.
        assert!(!tab.reach(1, 4));
        assert!(!tab.reach(1, 3));
    }

    #[test]
    fn open_calls_may_remain_pending() {
        let mut g = Graph::new();
        g.add_edge(0, 1, 3);
        g.add_edge(1, 2, 5);
        let tab = Tabulation::new(&g);
        assert!(tab.reach(0, 2));
    }

    #[test]
    fn revisits_with_different_stacks() {
        // Two call sites into the same entry; each return must match its
        // own site: 0 -(+1)-> 2, 1 -(+2)-> 2, 2 -(-1)-> 3, 2 -(-2)-> 4.
        let mut g = Graph::new();
        g.add_edge(0, 2, 1);
        g.add_edge(1, 2, 2);
        g.add_edge(2, 3, -1);
        g.add_edge(2, 4, -2);
        let tab = Tabulation::new(&g);
        assert!(tab.reach(0, 3));
        assert!(!tab.reach(0, 4));
        assert!(tab.reach(1, 4));
        assert!(!tab.reach(1, 3));
    }

    #[test]
    fn summaries_make_skipping_closes_exact() {
        let mut g = call_shaped();
        g.build_summary_edges(&CancellationToken::new()).unwrap();
        let tab = Tabulation::new(&g);
        assert!(tab.reach_via_summaries(0, 3));
        assert!(!tab.reach_via_summaries(1, 3));
        assert!(!tab.reach_via_summaries(3, 0));

        let mut visited = BitVec::with_capacity(g.num_vertices());
        tab.traverse(0, &mut visited);
        assert!(visited.contains(3));
        assert!(!visited.contains(4));
    }

    #[test]
    fn recursion_falls_back_and_stays_exact() {
        // A recursive call cycle: 0 -(+1)-> 1 -(+2)-> 0, 1 -(0)-> 2, and a
        // matched return 2 -(-1)-> 3 for the outermost call.
        let mut g = Graph::new();
        g.add_edge(0, 1, 1);
        g.add_edge(1, 0, 2);
        g.add_edge(1, 2, 0);
        g.add_edge(2, 3, -1);
        let tab = Tabulation::with_limits(&g, 4, 64);
        assert!(tab.reach(0, 2));
        assert!(tab.reach(0, 3));
        assert!(!tab.reach(2, 0));
        assert!(!tab.reach(3, 0));
    }

    #[test]
    fn tight_budget_still_answers_exactly() {
        let g = call_shaped();
        let tab = Tabulation::with_limits(&g, 1, 2);
        assert!(tab.reach(0, 3));
        assert!(!tab.reach(0, 4));
        assert!(!tab.reach(1, 3));
    }
}
