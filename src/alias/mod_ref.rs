// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Per-function may-mod and may-ref sets over Dyck classes.
//!
//! A function refs the classes its loads dereference and mods the classes
//! its stores write, plus everything its reachable callees ref/mod. Built
//! after the Dyck graph freezes, so class roots are stable.

use std::collections::HashMap;

use crate::alias::dyck_graph::{DyckGraph, DyckNodeId};
use crate::graph::call_graph::CallGraph;
use crate::ir::{FuncId, Module, Opcode};
use crate::util::bit_vec::BitVec;

#[derive(Default)]
pub struct ModRefAnalysis {
    mods: HashMap<FuncId, BitVec<u32>>,
    refs: HashMap<FuncId, BitVec<u32>>,
}

impl ModRefAnalysis {
    pub fn build(module: &Module, graph: &DyckGraph, call_graph: &CallGraph) -> Self {
        let mut analysis = ModRefAnalysis::default();

        // Local sets from the function's own loads and stores.
        for f in module.func_ids() {
            if module.func(f).is_declaration {
                continue;
            }
            let mut mods = BitVec::new();
            let mut refs = BitVec::new();
            for inst_id in module.inst_ids(f) {
                let inst = module.inst(inst_id);
                match inst.opcode {
                    Opcode::Load => {
                        if let Some(node) = graph.node_of(inst.operands[0]) {
                            refs.insert(graph.find(node).0);
                        }
                    }
                    Opcode::Store => {
                        if let Some(node) = graph.node_of(inst.operands[1]) {
                            mods.insert(graph.find(node).0);
                        }
                    }
                    _ => {}
                }
            }
            analysis.mods.insert(f, mods);
            analysis.refs.insert(f, refs);
        }

        // Close over callees. The call graph may be cyclic; iterate until
        // the sets stop growing.
        let funcs: Vec<FuncId> = analysis.mods.keys().copied().collect();
        loop {
            let mut changed = false;
            for f in &funcs {
                for callee in call_graph.callees_of(*f) {
                    if callee == *f {
                        continue;
                    }
                    if let Some(callee_mods) = analysis.mods.get(&callee).cloned() {
                        changed |= analysis.mods.get_mut(f).unwrap().union(&callee_mods);
                    }
                    if let Some(callee_refs) = analysis.refs.get(&callee).cloned() {
                        changed |= analysis.refs.get_mut(f).unwrap().union(&callee_refs);
                    }
                }
            }
            if !changed {
                break;
            }
        }
        analysis
    }

    pub fn may_mod(&self, f: FuncId, node: DyckNodeId) -> bool {
        self.mods.get(&f).map_or(false, |s| s.contains(node.0))
    }

    pub fn may_ref(&self, f: FuncId, node: DyckNodeId) -> bool {
        self.refs.get(&f).map_or(false, |s| s.contains(node.0))
    }

    /// True when the function has any memory effect beyond its formals.
    pub fn has_mod_refs(&self, f: FuncId) -> bool {
        self.mods.get(&f).map_or(false, |s| !s.is_empty())
            || self.refs.get(&f).map_or(false, |s| !s.is_empty())
    }

    pub fn mod_nodes(&self, f: FuncId) -> Vec<DyckNodeId> {
        self.mods
            .get(&f)
            .map(|s| s.iter().map(DyckNodeId).collect())
            .unwrap_or_default()
    }

    pub fn ref_nodes(&self, f: FuncId) -> Vec<DyckNodeId> {
        self.refs
            .get(&f)
            .map(|s| s.iter().map(DyckNodeId).collect())
            .unwrap_or_default()
    }
}
