// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The module-wide value flow graph.
//!
//! Nodes stand for IR values; a directed edge means the source value may
//! flow into the target. Edge labels are signed call-site ids: `0` for
//! intraprocedural flow, `+k` into the callee of call site `k`, `-k` back
//! out of it. Matched-parenthesis reachability over these labels is what the
//! offline index answers.

use std::collections::HashMap;

use log::info;

use crate::alias::dyck_graph::DyckNodeId;
use crate::alias::AliasAnalysis;
use crate::graph::call_graph::CallGraph;
use crate::ir::cfg::Cfg;
use crate::ir::{BaseCallSite, FuncId, GepKind, InstId, Module, Opcode, ValueId};
use crate::util::bit_vec::Idx;

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VfgNodeId(pub u32);

impl Idx for VfgNodeId {
    #[inline]
    fn new(idx: usize) -> Self {
        assert!(idx <= u32::MAX as usize);
        VfgNodeId(idx as u32)
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for VfgNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug)]
pub struct VfgNode {
    pub value: ValueId,
    /// Outgoing `(target, label)` edges.
    pub out: Vec<(VfgNodeId, i32)>,
    /// Incoming `(source, label)` edges.
    pub inc: Vec<(VfgNodeId, i32)>,
}

/// One positive id per (call instruction, concrete callee) pair. An indirect
/// call with three resolved targets occupies three ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CallSiteInfo {
    pub inst: InstId,
    pub callee: FuncId,
}

#[derive(Default)]
pub struct Vfg {
    nodes: Vec<VfgNode>,
    value_map: HashMap<ValueId, VfgNodeId>,
    call_sites: Vec<CallSiteInfo>,
}

impl Vfg {
    pub fn new() -> Self {
        Vfg::default()
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn num_call_sites(&self) -> usize {
        self.call_sites.len()
    }

    pub fn node(&self, id: VfgNodeId) -> &VfgNode {
        &self.nodes[id.index()]
    }

    pub fn node_of(&self, v: ValueId) -> Option<VfgNodeId> {
        self.value_map.get(&v).copied()
    }

    pub fn value_of(&self, id: VfgNodeId) -> ValueId {
        self.nodes[id.index()].value
    }

    /// The call site a positive label refers to.
    pub fn call_site(&self, label: i32) -> Option<&CallSiteInfo> {
        assert!(label != 0, "label 0 is not a call site");
        self.call_sites.get((label.unsigned_abs() as usize) - 1)
    }

    pub fn get_or_create_node(&mut self, v: ValueId) -> VfgNodeId {
        if let Some(id) = self.value_map.get(&v) {
            return *id;
        }
        let id = VfgNodeId::new(self.nodes.len());
        self.nodes.push(VfgNode {
            value: v,
            out: Vec::new(),
            inc: Vec::new(),
        });
        self.value_map.insert(v, id);
        id
    }

    /// Adds an edge unless the identical (target, label) pair exists.
    pub fn add_edge(&mut self, from: VfgNodeId, to: VfgNodeId, label: i32) {
        if self.nodes[from.index()].out.contains(&(to, label)) {
            return;
        }
        self.nodes[from.index()].out.push((to, label));
        self.nodes[to.index()].inc.push((from, label));
    }

    pub fn add_value_edge(&mut self, from: ValueId, to: ValueId, label: i32) {
        let f = self.get_or_create_node(from);
        let t = self.get_or_create_node(to);
        self.add_edge(f, t, label);
    }

    /// Outgoing `(value, label)` flow of `v`; empty when `v` has no node.
    pub fn succs(&self, v: ValueId) -> Vec<(ValueId, i32)> {
        match self.node_of(v) {
            Some(id) => self
                .node(id)
                .out
                .iter()
                .map(|(t, l)| (self.value_of(*t), *l))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn preds(&self, v: ValueId) -> Vec<(ValueId, i32)> {
        match self.node_of(v) {
            Some(id) => self
                .node(id)
                .inc
                .iter()
                .map(|(s, l)| (self.value_of(*s), *l))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has_edge(&self, from: ValueId, to: ValueId) -> bool {
        match (self.node_of(from), self.node_of(to)) {
            (Some(f), Some(t)) => self.node(f).out.iter().any(|(target, _)| *target == t),
            _ => false,
        }
    }

    /// The label of some edge `from -> to`, if one exists.
    pub fn edge_label(&self, from: ValueId, to: ValueId) -> Option<i32> {
        let f = self.node_of(from)?;
        let t = self.node_of(to)?;
        self.node(f)
            .out
            .iter()
            .find(|(target, _)| *target == t)
            .map(|(_, l)| *l)
    }

    /// Serializes edges in the persisted text format: one edge per line,
    /// `<from>-><to>[label="o<k>"]` for label `+k` or `0`, `c<k>` for `-k`,
    /// preceded by `<id>[label="..."]` node lines.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (i, node) in self.nodes.iter().enumerate() {
            out.push_str(&format!("{}[label=\"{:?}\"]\n", i, node.value));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            for (target, label) in &node.out {
                let (sign, id) = if *label < 0 { ('c', -*label) } else { ('o', *label) };
                out.push_str(&format!(
                    "{}->{}[label=\"{}{}\"]\n",
                    i,
                    target.index(),
                    sign,
                    id
                ));
            }
        }
        out
    }

    /// Converts into the dense labeled graph the reachability index consumes.
    /// Vertex `i` of the result is node `i` of the VFG.
    pub fn to_reach_graph(&self) -> crate::reach::graph::Graph {
        let mut g = crate::reach::graph::Graph::with_vertices(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            for (target, label) in &node.out {
                g.add_edge(i as u32, target.0, *label);
            }
        }
        g
    }
}

/// Builds the VFG for a whole module from the frozen alias results.
pub struct VfgBuilder<'a> {
    module: &'a Module,
    alias: &'a AliasAnalysis,
    call_graph: &'a CallGraph,
    cfgs: HashMap<FuncId, Cfg>,
    vfg: Vfg,
}

impl<'a> VfgBuilder<'a> {
    pub fn new(module: &'a Module, alias: &'a AliasAnalysis, call_graph: &'a CallGraph) -> Self {
        let mut cfgs = HashMap::new();
        for f in module.func_ids() {
            if !module.func(f).is_declaration {
                cfgs.insert(f, Cfg::new(module, f));
            }
        }
        VfgBuilder {
            module,
            alias,
            call_graph,
            cfgs,
            vfg: Vfg::new(),
        }
    }

    pub fn build(mut self) -> Vfg {
        for f in self.module.func_ids() {
            if !self.module.func(f).is_declaration {
                self.build_direct_flow(f);
                self.build_load_store_flow(f);
            }
        }
        for f in self.module.func_ids() {
            if !self.module.func(f).is_declaration {
                self.connect_calls(f);
            }
        }
        info!(
            "VFG: {} nodes, {} call sites",
            self.vfg.num_nodes(),
            self.vfg.num_call_sites()
        );
        self.vfg
    }

    /// Direct value flow through casts, phis, selects and zero GEPs.
    fn build_direct_flow(&mut self, f: FuncId) {
        for inst_id in self.module.inst_ids(f) {
            let inst = self.module.inst(inst_id);
            match inst.opcode {
                Opcode::Cast(_) => {
                    self.vfg.add_value_edge(inst.operands[0], inst.value, 0);
                }
                Opcode::Phi => {
                    for incoming in &inst.operands {
                        self.vfg.add_value_edge(*incoming, inst.value, 0);
                    }
                }
                Opcode::Select => {
                    self.vfg.add_value_edge(inst.operands[1], inst.value, 0);
                    self.vfg.add_value_edge(inst.operands[2], inst.value, 0);
                }
                Opcode::Gep(GepKind::ZeroOffsets) => {
                    self.vfg.add_value_edge(inst.operands[0], inst.value, 0);
                }
                Opcode::Load => {
                    self.vfg.get_or_create_node(inst.value);
                    self.vfg.get_or_create_node(inst.operands[0]);
                }
                Opcode::Store => {
                    self.vfg.get_or_create_node(inst.operands[0]);
                    self.vfg.get_or_create_node(inst.operands[1]);
                }
                _ => {}
            }
        }
    }

    /// Indirect flow from stores to loads of the same class, restricted to
    /// store/load pairs where the store can reach the load in the CFG.
    fn build_load_store_flow(&mut self, f: FuncId) {
        let mut loads: HashMap<DyckNodeId, Vec<InstId>> = HashMap::new();
        let mut stores: HashMap<DyckNodeId, Vec<InstId>> = HashMap::new();
        for inst_id in self.module.inst_ids(f) {
            let inst = self.module.inst(inst_id);
            match inst.opcode {
                Opcode::Load => {
                    if let Some(class) = self.alias.class_of(inst.operands[0]) {
                        loads.entry(class).or_default().push(inst_id);
                    }
                }
                Opcode::Store => {
                    if let Some(class) = self.alias.class_of(inst.operands[1]) {
                        stores.entry(class).or_default().push(inst_id);
                    }
                }
                _ => {}
            }
        }

        let cfg = &self.cfgs[&f];
        for (class, class_loads) in &loads {
            let Some(class_stores) = stores.get(class) else {
                continue;
            };
            for load in class_loads {
                for store in class_stores {
                    if cfg.reachable(self.module, *store, *load) {
                        let stored = self.module.inst(*store).operands[0];
                        let loaded = self.module.inst(*load).value;
                        self.vfg.add_value_edge(stored, loaded, 0);
                    }
                }
            }
        }
    }

    fn connect_calls(&mut self, f: FuncId) {
        for (inst_id, _) in self.module.call_sites(f) {
            let callsite = BaseCallSite {
                caller: f,
                inst: inst_id,
            };
            let mut targets: Vec<FuncId> =
                self.call_graph.get_callees(&callsite).into_iter().collect();
            targets.sort();
            for target in targets {
                // Bodiless callees are opaque: no edges.
                if self.module.func(target).is_declaration {
                    continue;
                }
                self.connect_one(f, inst_id, target);
            }
        }
    }

    fn connect_one(&mut self, caller: FuncId, call: InstId, callee: FuncId) {
        let k = self.vfg.call_sites.len() as i32 + 1;
        self.vfg.call_sites.push(CallSiteInfo { inst: call, callee });

        // Direct inputs: actual -> formal for overlapping indices.
        let params = self.module.func(callee).params.clone();
        let args = self.module.inst(call).operands.clone();
        for (arg, param) in args.iter().zip(params.iter()) {
            self.vfg.add_value_edge(*arg, *param, k);
        }

        // Direct outputs: returned value -> call result.
        let call_inst = self.module.inst(call);
        if !call_inst.ty.is_void {
            let result = call_inst.value;
            for ret in self.module.ret_values(callee) {
                self.vfg.add_value_edge(ret, result, -k);
            }
        }

        // Indirect inputs and outputs through the callee's mod/ref classes.
        if !self.alias.mod_ref().has_mod_refs(callee) {
            return;
        }
        for class in self.alias.mod_ref().ref_nodes(callee) {
            let (caller_vals, callee_vals) =
                self.split_class_values(class, caller, callee, call, true);
            for cv in &caller_vals {
                for ev in &callee_vals {
                    self.vfg.add_value_edge(*cv, *ev, k);
                }
            }
        }
        for class in self.alias.mod_ref().mod_nodes(callee) {
            let (caller_vals, callee_vals) =
                self.split_class_values(class, caller, callee, call, false);
            for ev in &callee_vals {
                for cv in &caller_vals {
                    self.vfg.add_value_edge(*ev, *cv, -k);
                }
            }
        }
    }

    /// Partitions a Dyck class into caller-side and callee-side values.
    /// Caller values are CFG-filtered: for refs their definition must reach
    /// the call, for mods the call must reach their definition.
    fn split_class_values(
        &self,
        class: DyckNodeId,
        caller: FuncId,
        callee: FuncId,
        call: InstId,
        forward: bool,
    ) -> (Vec<ValueId>, Vec<ValueId>) {
        let mut caller_vals = Vec::new();
        let mut callee_vals = Vec::new();
        let cfg = &self.cfgs[&caller];
        for v in self.alias.graph().class_members(class) {
            match self.module.func_of_value(*v) {
                Some(owner) if owner == callee => callee_vals.push(*v),
                Some(owner) if owner == caller => match self.module.inst_of_value(*v) {
                    Some(def) => {
                        let ok = if forward {
                            cfg.reachable(self.module, def, call)
                        } else {
                            cfg.reachable(self.module, call, def)
                        };
                        if ok {
                            caller_vals.push(*v);
                        }
                    }
                    // Arguments are visible throughout the caller.
                    None => caller_vals.push(*v),
                },
                _ => {}
            }
        }
        (caller_vals, callee_vals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::call_graph::build_call_graph;
    use crate::ir::TypeInfo;
    use crate::util::stats::AnalysisStats;
    use std::sync::Arc;

    pub(crate) fn analyze(module: &Module) -> (CallGraph, AliasAnalysis, Vfg) {
        let stats = Arc::new(AnalysisStats::new());
        let cg = build_call_graph(module, &stats);
        let alias = AliasAnalysis::build(module, &cg, stats).unwrap();
        let vfg = VfgBuilder::new(module, &alias, &cg).build();
        (cg, alias, vfg)
    }

    #[test]
    fn store_load_match_produces_flow() {
        // p = alloca; q = cast p; *q = one; x = *p  =>  edge one -> x
        let mut m = Module::new("t");
        let f = m.define_function("f", &[TypeInfo::pointer()], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb = b.block();
        let one = b.param(0);
        let p = b.alloca(bb);
        let q = b.bitcast(bb, p);
        b.store(bb, one, q);
        let x = b.load(bb, p, TypeInfo::pointer());
        b.ret(bb, None);

        let (_cg, _alias, vfg) = analyze(&m);
        assert!(vfg.has_edge(one, x));
        assert_eq!(vfg.edge_label(one, x), Some(0));
    }

    #[test]
    fn store_after_load_does_not_flow() {
        let mut m = Module::new("t");
        let f = m.define_function("f", &[TypeInfo::pointer()], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb = b.block();
        let v = b.param(0);
        let p = b.alloca(bb);
        let x = b.load(bb, p, TypeInfo::pointer());
        b.store(bb, v, p);
        b.ret(bb, None);

        let (_cg, _alias, vfg) = analyze(&m);
        assert!(!vfg.has_edge(v, x));
    }

    #[test]
    fn call_and_return_edges_share_id() {
        let mut m = Module::new("t");
        let id = m.define_function("id", &[TypeInfo::pointer()], TypeInfo::pointer());
        let mut b = m.build_function(id);
        let bb = b.block();
        let q = b.param(0);
        b.ret(bb, Some(q));

        let caller = m.define_function("caller", &[TypeInfo::pointer()], TypeInfo::pointer());
        let mut b = m.build_function(caller);
        let bb = b.block();
        let p = b.param(0);
        let r = b.call(bb, id, &[p], TypeInfo::pointer());
        b.ret(bb, Some(r));

        let (_cg, _alias, vfg) = analyze(&m);
        let k = vfg.edge_label(p, q).expect("argument edge must exist");
        assert!(k > 0);
        assert_eq!(vfg.edge_label(q, r), Some(-k));
        let site = vfg.call_site(k).unwrap();
        assert_eq!(site.callee, id);
    }

    #[test]
    fn bodiless_callee_gets_no_edges() {
        let mut m = Module::new("t");
        let ext = m.declare_function("ext", &[TypeInfo::pointer()], TypeInfo::pointer(), false);
        let f = m.define_function("f", &[TypeInfo::pointer()], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb = b.block();
        let p = b.param(0);
        let _r = b.call(bb, ext, &[p], TypeInfo::pointer());
        b.ret(bb, None);

        let (_cg, _alias, vfg) = analyze(&m);
        assert_eq!(vfg.num_call_sites(), 0);
        assert!(vfg.succs(p).iter().all(|(_, l)| *l == 0));
    }

    #[test]
    fn text_round_trip_preserves_edges() {
        let mut m = Module::new("t");
        let id = m.define_function("id", &[TypeInfo::pointer()], TypeInfo::pointer());
        let mut b = m.build_function(id);
        let bb = b.block();
        let q = b.param(0);
        b.ret(bb, Some(q));

        let caller = m.define_function("caller", &[TypeInfo::pointer()], TypeInfo::pointer());
        let mut b = m.build_function(caller);
        let bb = b.block();
        let p = b.param(0);
        let r = b.call(bb, id, &[p], TypeInfo::pointer());
        b.ret(bb, Some(r));

        let (_cg, _alias, vfg) = analyze(&m);
        let text = vfg.to_text();
        let g = crate::reach::graph::Graph::from_text(&text).unwrap();
        let direct = vfg.to_reach_graph();
        assert_eq!(g.num_vertices(), direct.num_vertices());
        assert_eq!(g.num_edges(), direct.num_edges());
    }
}
