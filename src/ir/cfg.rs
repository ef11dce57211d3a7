// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Intraprocedural control flow: block reachability, back edges and
//! acyclic distance maps.
//!
//! The value flow builder asks one question over and over: can this store
//! reach that load? The per-function closure computed here makes that a
//! bit test.

use std::collections::{BTreeSet, HashSet};

use crate::ir::{BlockId, FuncId, InstId, Module};
use crate::util::bit_vec::{BitVec, Idx};

pub const INF: u64 = u64::MAX;

pub struct Cfg {
    func: FuncId,
    succs: Vec<Vec<BlockId>>,
    /// Per block, the set of blocks reachable through one or more edges.
    reach: Vec<BitVec<u32>>,
}

impl Cfg {
    pub fn new(module: &Module, func: FuncId) -> Self {
        let blocks = &module.func(func).blocks;
        let succs: Vec<Vec<BlockId>> = blocks.iter().map(|b| b.succs.clone()).collect();

        let mut reach = Vec::with_capacity(blocks.len());
        for start in 0..blocks.len() {
            let mut visited = BitVec::with_capacity(blocks.len());
            let mut stack: Vec<BlockId> = succs[start].clone();
            while let Some(b) = stack.pop() {
                if visited.insert(b.0) {
                    stack.extend(succs[b.index()].iter().copied());
                }
            }
            reach.push(visited);
        }
        Cfg { func, succs, reach }
    }

    pub fn func(&self) -> FuncId {
        self.func
    }

    /// True when `to` is reachable from `from` through one or more edges.
    #[inline]
    pub fn block_reaches(&self, from: BlockId, to: BlockId) -> bool {
        self.reach[from.index()].contains(to.0)
    }

    /// True when control can flow from `from` to `to`. Within one block the
    /// instruction order decides; across blocks the closure does.
    pub fn reachable(&self, module: &Module, from: InstId, to: InstId) -> bool {
        let fi = module.inst(from);
        let ti = module.inst(to);
        debug_assert_eq!(fi.func, self.func);
        debug_assert_eq!(ti.func, self.func);
        if fi.block == ti.block {
            fi.index_in_block < ti.index_in_block || self.block_reaches(fi.block, fi.block)
        } else {
            self.block_reaches(fi.block, ti.block)
        }
    }
}

/// Finds all back edges of `func` by a DFS that tracks the blocks currently
/// on the visit stack.
pub fn find_backedges(module: &Module, func: FuncId) -> HashSet<(BlockId, BlockId)> {
    let blocks = &module.func(func).blocks;
    let mut res = HashSet::new();
    if blocks.is_empty() {
        return res;
    }

    let entry = BlockId(0);
    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();
    // (block, index of the next successor to look at)
    let mut visit_stack: Vec<(BlockId, usize)> = Vec::new();

    visited.insert(entry);
    in_stack.insert(entry);
    visit_stack.push((entry, 0));

    while let Some(top) = visit_stack.last_mut() {
        let (parent, cursor) = (top.0, top.1);
        let parent_succs = &blocks[parent.index()].succs;

        let mut found_new = None;
        let mut next = cursor;
        while next < parent_succs.len() {
            let succ = parent_succs[next];
            next += 1;
            if visited.insert(succ) {
                found_new = Some(succ);
                break;
            }
            // Successor is on the visit stack: a back edge.
            if in_stack.contains(&succ) {
                res.insert((parent, succ));
            }
        }
        top.1 = next;

        match found_new {
            Some(succ) => {
                in_stack.insert(succ);
                visit_stack.push((succ, 0));
            }
            None => {
                let (done, _) = visit_stack.pop().unwrap();
                in_stack.remove(&done);
            }
        }
    }
    res
}

/// Unit-weight shortest distances from `source` on the CFG with back edges
/// removed. Unreachable blocks map to [`INF`].
pub fn distance_map(module: &Module, func: FuncId, source: BlockId) -> Vec<u64> {
    let backedges = find_backedges(module, func);
    let blocks = &module.func(func).blocks;

    let mut distance = vec![INF; blocks.len()];
    distance[source.index()] = 0;

    // (distance, block) ordered set; this is dijkstra on an acyclic CFG.
    let mut frontier: BTreeSet<(u64, BlockId)> = BTreeSet::new();
    frontier.insert((0, source));

    while let Some((dist, block)) = frontier.pop_first() {
        for &succ in &blocks[block.index()].succs {
            if backedges.contains(&(block, succ)) {
                continue;
            }
            let candidate = dist + 1;
            if distance[succ.index()] > candidate {
                if distance[succ.index()] != INF {
                    frontier.remove(&(distance[succ.index()], succ));
                }
                distance[succ.index()] = candidate;
                frontier.insert((candidate, succ));
            }
        }
    }
    distance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::TypeInfo;

    /// entry -> left -> join, entry -> right -> join, join -> left (back edge)
    fn diamond_with_loop() -> (Module, FuncId) {
        let mut m = Module::new("t");
        let f = m.define_function("f", &[], TypeInfo::void());
        let mut b = m.build_function(f);
        let entry = b.block();
        let left = b.block();
        let right = b.block();
        let join = b.block();
        b.br(entry, left);
        b.br(entry, right);
        b.br(left, join);
        b.br(right, join);
        b.br(join, left);
        b.ret(join, None);
        (m, f)
    }

    #[test]
    fn block_reachability() {
        let (m, f) = diamond_with_loop();
        let cfg = Cfg::new(&m, f);
        assert!(cfg.block_reaches(BlockId(0), BlockId(3)));
        assert!(cfg.block_reaches(BlockId(3), BlockId(1)));
        assert!(!cfg.block_reaches(BlockId(1), BlockId(2)));
        // left sits on a cycle through join.
        assert!(cfg.block_reaches(BlockId(1), BlockId(1)));
    }

    #[test]
    fn instruction_order_within_block() {
        let mut m = Module::new("t");
        let f = m.define_function("f", &[], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb = b.block();
        let a = b.alloca(bb);
        let p = b.bitcast(bb, a);
        b.ret(bb, None);
        let cfg = Cfg::new(&m, f);
        let ia = m.inst_of_value(a).unwrap();
        let ip = m.inst_of_value(p).unwrap();
        assert!(cfg.reachable(&m, ia, ip));
        assert!(!cfg.reachable(&m, ip, ia));
    }

    #[test]
    fn backedges_and_distances() {
        let (m, f) = diamond_with_loop();
        let backedges = find_backedges(&m, f);
        assert_eq!(backedges.len(), 1);
        assert!(
            backedges.contains(&(BlockId(3), BlockId(1)))
                || backedges.contains(&(BlockId(3), BlockId(2)))
        );

        let dist = distance_map(&m, f, BlockId(0));
        assert_eq!(dist[0], 0);
        assert_eq!(dist[3], 2);
        assert!(dist[1] == 1 && dist[2] == 1);
    }
}
