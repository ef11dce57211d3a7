// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! A conservative, rule-based must-alias decider.
//!
//! The over-approximating Dyck engine can only say "may"; this
//! under-approximation proves equality for syntactic patterns: identity
//! after stripping no-op casts and zero GEPs, pointer/integer round-trips,
//! trivial PHIs and selects, shared null literals, and same-base GEPs with
//! equal constant offsets. Rule hits seed a per-function union-find which is
//! then closed under "same pure opcode, operand-wise must-aliased operands."

use std::collections::{HashMap, HashSet};

use crate::ir::{CastKind, FuncId, GepKind, Module, Opcode, ValueId, ValueKind};

/// Follows value-preserving definitions to a canonical representative.
pub fn strip_value(module: &Module, v: ValueId) -> ValueId {
    let mut visited = HashSet::new();
    strip_rec(module, v, &mut visited)
}

fn strip_rec(module: &Module, v: ValueId, visited: &mut HashSet<ValueId>) -> ValueId {
    if !visited.insert(v) {
        return v;
    }
    let inst_id = match module.inst_of_value(v) {
        Some(i) => i,
        None => return v,
    };
    let inst = module.inst(inst_id);
    match inst.opcode {
        Opcode::Cast(kind) if kind.is_noop() => strip_rec(module, inst.operands[0], visited),
        Opcode::Gep(GepKind::ZeroOffsets) => strip_rec(module, inst.operands[0], visited),
        Opcode::Cast(CastKind::IntToPtr) => {
            // inttoptr(ptrtoint x) is x again.
            let inner = inst.operands[0];
            match module.inst_of_value(inner).map(|i| module.inst(i)) {
                Some(inner_inst) if inner_inst.opcode == Opcode::Cast(CastKind::PtrToInt) => {
                    strip_rec(module, inner_inst.operands[0], visited)
                }
                _ => v,
            }
        }
        Opcode::Phi => {
            let mut stripped = inst
                .operands
                .iter()
                .map(|op| strip_rec(module, *op, visited));
            match stripped.next() {
                Some(first) if stripped.all(|s| s == first) => first,
                _ => v,
            }
        }
        Opcode::Select => {
            let t = strip_rec(module, inst.operands[1], visited);
            let f = strip_rec(module, inst.operands[2], visited);
            if t == f {
                t
            } else {
                v
            }
        }
        _ => v,
    }
}

/// Opcodes that compute a value purely from their operands; only these take
/// part in the congruence closure. Loads, calls and allocas are excluded:
/// equal operands do not make their results equal.
fn is_closable(opcode: &Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Gep(_) | Opcode::Cast(_) | Opcode::Select | Opcode::Binary | Opcode::Cmp
    )
}

pub struct MustAliasAnalysis {
    classes: HashMap<FuncId, UnionFind>,
}

impl MustAliasAnalysis {
    pub fn build(module: &Module) -> Self {
        let mut classes = HashMap::new();
        for f in module.func_ids() {
            if !module.func(f).is_declaration {
                classes.insert(f, build_function_classes(module, f));
            }
        }
        MustAliasAnalysis { classes }
    }

    /// True when the rule set proves `a` and `b` name the same location.
    pub fn must_alias(&self, module: &Module, a: ValueId, b: ValueId) -> bool {
        if a == b {
            return true;
        }
        if strip_value(module, a) == strip_value(module, b) {
            return true;
        }
        if both_null_same_space(module, a, b) {
            return true;
        }
        match (module.func_of_value(a), module.func_of_value(b)) {
            (Some(fa), Some(fb)) if fa == fb => match self.classes.get(&fa) {
                Some(uf) => uf.same(a, b),
                None => false,
            },
            _ => false,
        }
    }
}

fn both_null_same_space(module: &Module, a: ValueId, b: ValueId) -> bool {
    match (&module.value(a).kind, &module.value(b).kind) {
        (
            ValueKind::NullPtr { addr_space: s1 },
            ValueKind::NullPtr { addr_space: s2 },
        ) => s1 == s2,
        _ => false,
    }
}

fn build_function_classes(module: &Module, f: FuncId) -> UnionFind {
    let mut uf = UnionFind::default();

    // Rule seeds: every value meets its stripped representative.
    let mut function_values: Vec<ValueId> = module.func(f).params.clone();
    let mut nulls: HashMap<u32, ValueId> = HashMap::new();
    for inst_id in module.inst_ids(f) {
        let inst = module.inst(inst_id);
        function_values.push(inst.value);
        for op in &inst.operands {
            function_values.push(*op);
            if let ValueKind::NullPtr { addr_space } = module.value(*op).kind {
                match nulls.get(&addr_space) {
                    Some(first) => uf.union(*first, *op),
                    None => {
                        nulls.insert(addr_space, *op);
                    }
                }
            }
        }
    }
    for v in &function_values {
        let stripped = strip_value(module, *v);
        uf.union(*v, stripped);
    }

    // Closure: same pure opcode over must-aliased operands.
    loop {
        let mut changed = false;
        let mut groups: HashMap<(Opcode, Vec<ValueId>), ValueId> = HashMap::new();
        for inst_id in module.inst_ids(f) {
            let inst = module.inst(inst_id);
            if !is_closable(&inst.opcode) {
                continue;
            }
            let key = (
                inst.opcode,
                inst.operands.iter().map(|op| uf.find(*op)).collect(),
            );
            match groups.get(&key) {
                Some(other) => {
                    if uf.find(*other) != uf.find(inst.value) {
                        uf.union(*other, inst.value);
                        changed = true;
                    }
                }
                None => {
                    groups.insert(key, inst.value);
                }
            }
        }
        if !changed {
            break;
        }
    }
    uf
}

/// A tiny union-find over value ids, map-backed because the value space is
/// sparse per function.
#[derive(Default)]
pub struct UnionFind {
    parent: HashMap<ValueId, ValueId>,
}

impl UnionFind {
    pub fn find(&self, v: ValueId) -> ValueId {
        let mut cur = v;
        while let Some(p) = self.parent.get(&cur) {
            if *p == cur {
                break;
            }
            cur = *p;
        }
        cur
    }

    pub fn union(&mut self, a: ValueId, b: ValueId) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }

    pub fn same(&self, a: ValueId, b: ValueId) -> bool {
        self.find(a) == self.find(b)
    }
}
