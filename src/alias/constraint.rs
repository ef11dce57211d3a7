// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Translation of IR into pointer constraints and their saturation into the
//! Dyck graph.
//!
//! Collection walks global initializers first, then every function body,
//! emitting one constraint per pointer-relevant instruction. Saturation
//! drains the worklist once; the union-find's congruence closure performs
//! the transitive work that would otherwise require re-queuing.

use std::collections::{HashSet, VecDeque};

use lazy_static::lazy_static;
use log::debug;

use crate::alias::dyck_graph::{DyckGraph, DyckLabel};
use crate::graph::call_graph::CallGraph;
use crate::ir::{BaseCallSite, Callee, CastKind, FuncId, GepKind, InstId, Module, Opcode, ValueId};
use crate::util::stats::AnalysisStats;

lazy_static! {
    /// External functions whose return is a fresh heap object rather than an
    /// unknown pointer.
    static ref ALLOCATION_FUNCS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.extend([
            "malloc", "calloc", "realloc", "valloc", "aligned_alloc",
            "strdup", "strndup", "_Znwm", "_Znam",
        ]);
        s
    };
}

pub fn is_allocation_fn(name: &str) -> bool {
    ALLOCATION_FUNCS.contains(name)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Constraint {
    /// The value receives the address of a fresh abstract object.
    Alloc(ValueId),
    /// `dst = src`
    Copy { dst: ValueId, src: ValueId },
    /// `dst = *src`
    Load { dst: ValueId, src: ValueId },
    /// `*ptr = val`
    Store { val: ValueId, ptr: ValueId },
    /// `dst = &base->field`
    Field { dst: ValueId, base: ValueId, field: u32 },
    /// The value escapes to an unmodeled external.
    Universal(ValueId),
}

pub struct ConstraintCollector<'a> {
    module: &'a Module,
    call_graph: &'a CallGraph,
    stats: &'a AnalysisStats,
    constraints: VecDeque<Constraint>,
    /// Returns of allocation-like external calls; these may be null.
    pub alloc_returns: HashSet<ValueId>,
}

impl<'a> ConstraintCollector<'a> {
    pub fn new(module: &'a Module, call_graph: &'a CallGraph, stats: &'a AnalysisStats) -> Self {
        ConstraintCollector {
            module,
            call_graph,
            stats,
            constraints: VecDeque::new(),
            alloc_returns: HashSet::new(),
        }
    }

    pub fn collect(mut self) -> (VecDeque<Constraint>, HashSet<ValueId>) {
        for global in self.module.globals() {
            for target in &global.init_refs {
                self.constraints.push_back(Constraint::Store {
                    val: *target,
                    ptr: global.value,
                });
            }
        }
        for f in self.module.func_ids() {
            if !self.module.func(f).is_declaration {
                self.visit_function(f);
            }
        }
        (self.constraints, self.alloc_returns)
    }

    fn visit_function(&mut self, f: FuncId) {
        for inst_id in self.module.inst_ids(f) {
            self.visit_inst(f, inst_id);
        }
    }

    fn visit_inst(&mut self, f: FuncId, inst_id: InstId) {
        let inst = self.module.inst(inst_id);
        let result = inst.value;
        match inst.opcode {
            Opcode::Alloca => {
                self.constraints.push_back(Constraint::Alloc(result));
            }
            Opcode::Load => {
                if inst.ty.is_pointer {
                    self.constraints.push_back(Constraint::Load {
                        dst: result,
                        src: inst.operands[0],
                    });
                }
            }
            Opcode::Store => {
                if self.module.value_is_pointer(inst.operands[0]) {
                    self.constraints.push_back(Constraint::Store {
                        val: inst.operands[0],
                        ptr: inst.operands[1],
                    });
                }
            }
            Opcode::Gep(kind) => {
                let base = inst.operands[0];
                match kind {
                    GepKind::Field(k) => {
                        self.constraints.push_back(Constraint::Field {
                            dst: result,
                            base,
                            field: k,
                        });
                    }
                    // Zero offsets name the base itself; other shapes fall
                    // back to field-insensitive copying.
                    _ => self.push_copy(result, base),
                }
            }
            Opcode::Cast(_) => self.push_copy(result, inst.operands[0]),
            Opcode::Phi => {
                for incoming in &inst.operands {
                    self.push_copy(result, *incoming);
                }
            }
            Opcode::Select => {
                self.push_copy(result, inst.operands[1]);
                self.push_copy(result, inst.operands[2]);
            }
            Opcode::Call(callee) => self.visit_call(f, inst_id, callee),
            Opcode::Ret | Opcode::Binary | Opcode::Cmp | Opcode::Other => {}
        }
    }

    fn push_copy(&mut self, dst: ValueId, src: ValueId) {
        self.constraints.push_back(Constraint::Copy { dst, src });
    }

    fn visit_call(&mut self, caller: FuncId, inst_id: InstId, callee: Callee) {
        let inst = self.module.inst(inst_id);
        let result = inst.value;
        let callsite = BaseCallSite {
            caller,
            inst: inst_id,
        };

        if let Callee::Direct(target) = callee {
            let func = self.module.func(target);
            if func.is_declaration {
                let name = func.name.clone();
                self.visit_external_call(inst_id, &name);
                return;
            }
        }

        // Both direct and resolved indirect callees couple the same way.
        let targets = self.call_graph.get_callees(&callsite);
        if targets.is_empty() {
            // An indirect call with no compatible address-taken target; its
            // effects stay local and are already counted by the resolver.
            debug!("call {:?} resolved to no callee", inst_id);
            return;
        }
        for target in targets {
            let func = self.module.func(target);
            if func.is_declaration {
                let name = func.name.clone();
                self.visit_external_call(inst_id, &name);
                continue;
            }
            for (i, param) in func.params.iter().enumerate() {
                if let Some(arg) = inst.operands.get(i) {
                    self.push_copy(*param, *arg);
                }
            }
            if !inst.ty.is_void {
                for ret in self.module.ret_values(target) {
                    self.push_copy(result, ret);
                }
            }
        }
    }

    /// External calls without a body: allocation-like functions return a
    /// fresh object; anything else taints its pointer arguments and return
    /// through the universal node.
    fn visit_external_call(&mut self, inst_id: InstId, name: &str) {
        let inst = self.module.inst(inst_id);
        if is_allocation_fn(name) {
            self.constraints.push_back(Constraint::Alloc(inst.value));
            self.alloc_returns.insert(inst.value);
            return;
        }
        AnalysisStats::bump(&self.stats.model_missing);
        if inst.ty.is_pointer {
            self.constraints.push_back(Constraint::Universal(inst.value));
        }
        for arg in &inst.operands {
            if self.module.value_is_pointer(*arg) {
                self.constraints.push_back(Constraint::Universal(*arg));
            }
        }
    }
}

/// Applies every constraint to the graph. With unification semantics a
/// single drain reaches the fixed point; the recursive work happens inside
/// `unite`'s congruence closure.
pub fn saturate(graph: &mut DyckGraph, mut worklist: VecDeque<Constraint>) {
    while let Some(c) = worklist.pop_front() {
        match c {
            Constraint::Alloc(p) => {
                let node = graph.make_node(p);
                graph.pointee(node);
            }
            Constraint::Copy { dst, src } => {
                let d = graph.make_node(dst);
                let s = graph.make_node(src);
                graph.unite(d, s);
            }
            Constraint::Load { dst, src } => {
                let d = graph.make_node(dst);
                let s = graph.make_node(src);
                let cell = graph.pointee(s);
                graph.unite(d, cell);
            }
            Constraint::Store { val, ptr } => {
                let v = graph.make_node(val);
                let p = graph.make_node(ptr);
                let cell = graph.pointee(p);
                graph.unite(cell, v);
            }
            Constraint::Field { dst, base, field } => {
                let d = graph.make_node(dst);
                let b = graph.make_node(base);
                graph.set_succ(b, DyckLabel::field(field), d);
            }
            Constraint::Universal(v) => {
                let node = graph.make_node(v);
                let universal = graph.universal();
                graph.unite(node, universal);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::call_graph::build_call_graph;
    use crate::ir::TypeInfo;

    fn saturated(module: &Module) -> (DyckGraph, HashSet<ValueId>) {
        let stats = AnalysisStats::new();
        let cg = build_call_graph(module, &stats);
        let (constraints, alloc_returns) =
            ConstraintCollector::new(module, &cg, &stats).collect();
        let mut graph = DyckGraph::new();
        saturate(&mut graph, constraints);
        graph.finalize();
        (graph, alloc_returns)
    }

    #[test]
    fn distinct_allocas_do_not_alias() {
        let mut m = Module::new("t");
        let f = m.define_function("f", &[], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb0 = b.block();
        let bb1 = b.block();
        b.br(bb0, bb1);
        let a = b.alloca(bb0);
        let c = b.alloca(bb1);
        b.ret(bb1, None);

        let (graph, _) = saturated(&m);
        assert!(!graph.same_class(a, c));
    }

    #[test]
    fn copy_chain_collapses() {
        let mut m = Module::new("t");
        let f = m.define_function("f", &[], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb = b.block();
        let a = b.alloca(bb);
        let p = b.bitcast(bb, a);
        let q = b.gep_zero(bb, p);
        b.ret(bb, None);

        let (graph, _) = saturated(&m);
        assert!(graph.same_class(a, p));
        assert!(graph.same_class(p, q));
    }

    #[test]
    fn store_then_load_aliases_cells() {
        // p = &a; q = p; *q = s; x = *p  =>  x aliases s
        let mut m = Module::new("t");
        let f = m.define_function("f", &[TypeInfo::pointer()], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb = b.block();
        let s = b.param(0);
        let p = b.alloca(bb);
        let q = b.bitcast(bb, p);
        b.store(bb, s, q);
        let x = b.load(bb, p, TypeInfo::pointer());
        b.ret(bb, None);

        let (graph, _) = saturated(&m);
        assert!(graph.same_class(x, s));
    }

    #[test]
    fn unknown_external_taints_universal() {
        let mut m = Module::new("t");
        let ext = m.declare_function("mystery", &[TypeInfo::pointer()], TypeInfo::pointer(), false);
        let f = m.define_function("f", &[], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb = b.block();
        let a = b.alloca(bb);
        let r = b.call(bb, ext, &[a], TypeInfo::pointer());
        b.ret(bb, None);

        let (graph, _) = saturated(&m);
        let ra = graph.node_of(a).unwrap();
        let rr = graph.node_of(r).unwrap();
        assert!(graph.is_universal_class(ra));
        assert!(graph.is_universal_class(rr));
    }

    #[test]
    fn malloc_returns_fresh_object() {
        let mut m = Module::new("t");
        let malloc = m.declare_function("malloc", &[TypeInfo::scalar()], TypeInfo::pointer(), false);
        let f = m.define_function("f", &[], TypeInfo::void());
        let c8 = m.const_int(8);
        let mut b = m.build_function(f);
        let bb = b.block();
        let n = b.binary(bb, c8, c8);
        let r = b.call(bb, malloc, &[n], TypeInfo::pointer());
        let r2 = b.call(bb, malloc, &[n], TypeInfo::pointer());
        b.ret(bb, None);

        let (graph, alloc_returns) = saturated(&m);
        assert!(alloc_returns.contains(&r));
        assert!(!graph.is_universal_class(graph.node_of(r).unwrap()));
        assert!(!graph.same_class(r, r2));
    }

    #[test]
    fn call_couples_args_and_returns() {
        let mut m = Module::new("t");
        let id = m.define_function("id", &[TypeInfo::pointer()], TypeInfo::pointer());
        let mut b = m.build_function(id);
        let bb = b.block();
        let p = b.param(0);
        b.ret(bb, Some(p));

        let caller = m.define_function("caller", &[], TypeInfo::void());
        let mut b = m.build_function(caller);
        let bb = b.block();
        let a = b.alloca(bb);
        let r = b.call(bb, id, &[a], TypeInfo::pointer());
        b.ret(bb, None);

        let (graph, _) = saturated(&m);
        assert!(graph.same_class(a, p));
        assert!(graph.same_class(a, r));
    }
}
