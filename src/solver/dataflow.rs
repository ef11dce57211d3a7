// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! A gen/kill bit-vector dataflow solver over function CFGs, with the two
//! classic instances: reaching definitions and reachable blocks.

use std::collections::VecDeque;

use crate::ir::{BlockId, FuncId, InstId, Module, Opcode};
use crate::util::bit_vec::{BitVec, Idx};

/// Per-block transfer functions `out = gen | (in - kill)` with union
/// confluence, iterated to the least fixpoint.
pub struct BitVectorProblem {
    pub gen: Vec<BitVec<u32>>,
    pub kill: Vec<BitVec<u32>>,
    pub entry: Vec<BitVec<u32>>,
}

pub struct BitVectorSolution {
    pub in_sets: Vec<BitVec<u32>>,
    pub out_sets: Vec<BitVec<u32>>,
}

pub fn solve_forward(
    module: &Module,
    func: FuncId,
    problem: &BitVectorProblem,
) -> BitVectorSolution {
    let blocks = &module.func(func).blocks;
    let n = blocks.len();
    let mut in_sets: Vec<BitVec<u32>> = problem.entry.clone();
    let mut out_sets: Vec<BitVec<u32>> = vec![BitVec::new(); n];

    let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); n];
    for (b, block) in blocks.iter().enumerate() {
        for succ in &block.succs {
            preds[succ.index()].push(BlockId::new(b));
        }
    }

    let mut worklist: VecDeque<usize> = (0..n).collect();
    while let Some(b) = worklist.pop_front() {
        let mut input = problem.entry[b].clone();
        for p in &preds[b] {
            input.union(&out_sets[p.index()]);
        }
        in_sets[b] = input.clone();

        let mut output = input;
        output.subtract(&problem.kill[b]);
        output.union(&problem.gen[b]);
        if output != out_sets[b] {
            out_sets[b] = output;
            for succ in &blocks[b].succs {
                if !worklist.contains(&succ.index()) {
                    worklist.push_back(succ.index());
                }
            }
        }
    }
    BitVectorSolution { in_sets, out_sets }
}

/// Reaching definitions: facts are store instructions, a store kills every
/// other store whose pointer shares its alias class.
pub struct ReachingDefinitions {
    /// The universe: store instructions of the function, in program order.
    pub defs: Vec<InstId>,
    pub solution: BitVectorSolution,
}

impl ReachingDefinitions {
    pub fn run(
        module: &Module,
        func: FuncId,
        alias: &crate::alias::AliasAnalysis,
    ) -> ReachingDefinitions {
        let blocks = &module.func(func).blocks;
        let mut defs: Vec<InstId> = Vec::new();
        for inst_id in module.inst_ids(func) {
            if matches!(module.inst(inst_id).opcode, Opcode::Store) {
                defs.push(inst_id);
            }
        }
        let def_index = |inst: InstId| defs.iter().position(|d| *d == inst).unwrap() as u32;

        let n = blocks.len();
        let mut gen = vec![BitVec::new(); n];
        let mut kill = vec![BitVec::new(); n];
        for (b, block) in blocks.iter().enumerate() {
            for inst_id in &block.insts {
                let inst = module.inst(*inst_id);
                if !matches!(inst.opcode, Opcode::Store) {
                    continue;
                }
                let me = def_index(*inst_id);
                let my_class = alias.class_of(inst.operands[1]);
                // Later stores in the same block overwrite earlier ones.
                for other in &defs {
                    if *other == *inst_id {
                        continue;
                    }
                    let other_ptr = module.inst(*other).operands[1];
                    if my_class.is_some() && alias.class_of(other_ptr) == my_class {
                        kill[b].insert(def_index(*other));
                        gen[b].remove(def_index(*other));
                    }
                }
                gen[b].insert(me);
                kill[b].remove(me);
            }
        }

        let problem = BitVectorProblem {
            gen,
            kill,
            entry: vec![BitVec::new(); n],
        };
        let solution = solve_forward(module, func, &problem);
        ReachingDefinitions { defs, solution }
    }

    /// The stores that may reach the beginning of `block`.
    pub fn reaching_in(&self, block: BlockId) -> Vec<InstId> {
        self.solution.in_sets[block.index()]
            .iter()
            .map(|i| self.defs[i as usize])
            .collect()
    }
}

/// Forward may-reachability of blocks from the entry block. The single
/// "reached" fact is seeded at the entry and flows along edges untouched.
pub fn reachable_blocks(module: &Module, func: FuncId) -> BitVec<u32> {
    let blocks = &module.func(func).blocks;
    let n = blocks.len();
    if n == 0 {
        return BitVec::new();
    }
    let mut problem = BitVectorProblem {
        gen: vec![BitVec::new(); n],
        kill: vec![BitVec::new(); n],
        entry: vec![BitVec::new(); n],
    };
    problem.entry[0].insert(0u32);
    let solution = solve_forward(module, func, &problem);

    let mut result = BitVec::with_capacity(n);
    for b in 0..n {
        if !solution.in_sets[b].is_empty() {
            result.insert(b as u32);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::call_graph::build_call_graph;
    use crate::ir::TypeInfo;
    use crate::util::stats::AnalysisStats;
    use std::sync::Arc;

    #[test]
    fn later_store_kills_earlier_one() {
        let mut m = Module::new("t");
        let f = m.define_function(
            "f",
            &[TypeInfo::pointer(), TypeInfo::pointer()],
            TypeInfo::void(),
        );
        let mut b = m.build_function(f);
        let bb0 = b.block();
        let bb1 = b.block();
        b.br(bb0, bb1);
        let p = b.alloca(bb0);
        let s1 = b.store(bb0, b.param(0), p);
        let s2 = b.store(bb0, b.param(1), p);
        b.ret(bb1, None);

        let stats = Arc::new(AnalysisStats::new());
        let cg = build_call_graph(&m, &stats);
        let alias = crate::alias::AliasAnalysis::build(&m, &cg, stats).unwrap();
        let rd = ReachingDefinitions::run(&m, f, &alias);

        let reaching = rd.reaching_in(BlockId(1));
        let i1 = m.inst_of_value(s1).unwrap();
        let i2 = m.inst_of_value(s2).unwrap();
        assert!(reaching.contains(&i2));
        assert!(!reaching.contains(&i1), "the second store kills the first");
    }

    #[test]
    fn unreachable_block_detected() {
        let mut m = Module::new("t");
        let f = m.define_function("f", &[], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb0 = b.block();
        let bb1 = b.block();
        let dead = b.block();
        b.br(bb0, bb1);
        b.br(dead, bb1);
        b.ret(bb1, None);

        let reachable = reachable_blocks(&m, f);
        assert!(reachable.contains(0));
        assert!(reachable.contains(1));
        assert!(!reachable.contains(2));
    }
}
