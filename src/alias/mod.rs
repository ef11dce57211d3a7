// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The alias analysis facade: constraint seeding, saturation, mod/ref and
//! must-alias, behind a three-valued query API.

use std::sync::Arc;

use log::info;

use crate::alias::constraint::{saturate, ConstraintCollector};
use crate::alias::dyck_graph::{DyckGraph, DyckNodeId};
use crate::alias::mod_ref::ModRefAnalysis;
use crate::alias::must_alias::{strip_value, MustAliasAnalysis};
use crate::error::AnalysisResult;
use crate::graph::call_graph::CallGraph;
use crate::ir::{Module, Opcode, ValueId, ValueKind};
use crate::util::stats::AnalysisStats;

pub mod constraint;
pub mod dyck_graph;
pub mod mod_ref;
pub mod must_alias;

/// The public three-valued answer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AliasResult {
    NoAlias,
    MayAlias,
    MustAlias,
}

/// The engine-internal answer; `Universal` marks queries that touched the
/// sentinel class and collapses to `MayAlias` at the public boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum AliasKind {
    No,
    May,
    Must,
    Universal,
}

pub struct AliasAnalysis {
    graph: DyckGraph,
    mod_ref: ModRefAnalysis,
    must: MustAliasAnalysis,
    alloc_returns: std::collections::HashSet<ValueId>,
    stats: Arc<AnalysisStats>,
}

impl AliasAnalysis {
    /// Builds the whole alias stage. The returned analysis is frozen; every
    /// query path is `&self`.
    pub fn build(
        module: &Module,
        call_graph: &CallGraph,
        stats: Arc<AnalysisStats>,
    ) -> AnalysisResult<AliasAnalysis> {
        info!("Building alias analysis for module {}", module.name);
        let (constraints, alloc_returns) =
            ConstraintCollector::new(module, call_graph, &stats).collect();
        info!("Collected {} pointer constraints", constraints.len());

        let mut graph = DyckGraph::new();
        saturate(&mut graph, constraints);
        graph.finalize();

        let mod_ref = ModRefAnalysis::build(module, &graph, call_graph);
        let must = MustAliasAnalysis::build(module);
        Ok(AliasAnalysis {
            graph,
            mod_ref,
            must,
            alloc_returns,
            stats,
        })
    }

    #[inline]
    pub fn graph(&self) -> &DyckGraph {
        &self.graph
    }

    #[inline]
    pub fn mod_ref(&self) -> &ModRefAnalysis {
        &self.mod_ref
    }

    pub fn stats(&self) -> &AnalysisStats {
        &self.stats
    }

    fn classify(&self, module: &Module, a: ValueId, b: ValueId) -> AliasKind {
        if self.must.must_alias(module, a, b) {
            return AliasKind::Must;
        }
        match (self.graph.node_of(a), self.graph.node_of(b)) {
            (Some(na), Some(nb)) => {
                if self.graph.is_universal_class(na) || self.graph.is_universal_class(nb) {
                    AliasKind::Universal
                } else if self.graph.find(na) == self.graph.find(nb) {
                    AliasKind::May
                } else {
                    AliasKind::No
                }
            }
            // Values the constraint pass never saw have no tracked cell.
            _ => AliasKind::No,
        }
    }

    /// Three-valued may-alias. Symmetric by construction.
    pub fn may_alias(&self, module: &Module, a: ValueId, b: ValueId) -> AliasResult {
        match self.classify(module, a, b) {
            AliasKind::Must => AliasResult::MustAlias,
            AliasKind::May => AliasResult::MayAlias,
            AliasKind::Universal => {
                AnalysisStats::bump(&self.stats.universal_queries);
                AliasResult::MayAlias
            }
            AliasKind::No => AliasResult::NoAlias,
        }
    }

    /// Whether `v` can be null at run time. Stack, global and function
    /// addresses whose class holds no null literal answer false; everything
    /// else stays conservatively true.
    pub fn may_null(&self, module: &Module, v: ValueId) -> bool {
        if module.value_is_null(v) || self.alloc_returns.contains(&v) {
            return true;
        }
        if let Some(node) = self.graph.node_of(v) {
            if self.graph.is_universal_class(node) {
                return true;
            }
            if self
                .graph
                .class_members(node)
                .iter()
                .any(|m| module.value_is_null(*m))
            {
                return true;
            }
        }
        let stripped = strip_value(module, v);
        match &module.value(stripped).kind {
            ValueKind::Global(_) | ValueKind::Function(_) => false,
            ValueKind::Inst(i) => !matches!(module.inst(*i).opcode, Opcode::Alloca),
            _ => true,
        }
    }

    /// The values collapsed into `v`'s class.
    pub fn points_to_set(&self, v: ValueId) -> Vec<ValueId> {
        match self.graph.node_of(v) {
            Some(node) => self.graph.class_members(node).to_vec(),
            None => Vec::new(),
        }
    }

    /// The Dyck class root for `v`, if the constraint pass saw it.
    pub fn class_of(&self, v: ValueId) -> Option<DyckNodeId> {
        self.graph.node_of(v).map(|n| self.graph.find(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::call_graph::build_call_graph;
    use crate::ir::TypeInfo;

    fn build(module: &Module) -> AliasAnalysis {
        let stats = Arc::new(AnalysisStats::new());
        let cg = build_call_graph(module, &stats);
        AliasAnalysis::build(module, &cg, stats).unwrap()
    }

    #[test]
    fn two_allocas_no_alias_and_symmetry() {
        let mut m = Module::new("t");
        let f = m.define_function("f", &[], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb0 = b.block();
        let bb1 = b.block();
        b.br(bb0, bb1);
        let a = b.alloca(bb0);
        let c = b.alloca(bb1);
        b.ret(bb1, None);

        let alias = build(&m);
        assert_eq!(alias.may_alias(&m, a, c), AliasResult::NoAlias);
        assert_eq!(alias.may_alias(&m, c, a), AliasResult::NoAlias);
        assert_eq!(alias.may_alias(&m, a, a), AliasResult::MustAlias);
    }

    #[test]
    fn unified_values_may_alias() {
        let mut m = Module::new("t");
        let f = m.define_function("f", &[TypeInfo::scalar()], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb = b.block();
        let cond = b.param(0);
        let a = b.alloca(bb);
        let c = b.alloca(bb);
        let sel = b.select(bb, cond, a, c, TypeInfo::pointer());
        b.ret(bb, None);

        let alias = build(&m);
        // The select merges both allocas into one class.
        assert_eq!(alias.may_alias(&m, a, c), AliasResult::MayAlias);
        assert_eq!(alias.may_alias(&m, sel, a), AliasResult::MayAlias);
        let pts = alias.points_to_set(a);
        assert!(pts.contains(&a) && pts.contains(&c) && pts.contains(&sel));
    }

    #[test]
    fn may_null_discriminates() {
        let mut m = Module::new("t");
        let null = m.null_ptr(0);
        let malloc = m.declare_function("malloc", &[TypeInfo::scalar()], TypeInfo::pointer(), false);
        let f = m.define_function("f", &[TypeInfo::pointer()], TypeInfo::void());
        let size = m.const_int(8);
        let mut b = m.build_function(f);
        let bb = b.block();
        let p = b.param(0);
        let a = b.alloca(bb);
        let c = b.bitcast(bb, a);
        let h = b.call(bb, malloc, &[size], TypeInfo::pointer());
        b.ret(bb, None);

        let alias = build(&m);
        assert!(alias.may_null(&m, null));
        assert!(alias.may_null(&m, h), "allocation may fail and return null");
        assert!(alias.may_null(&m, p), "unknown incoming pointer stays conservative");
        assert!(!alias.may_null(&m, a));
        assert!(!alias.may_null(&m, c), "cast of a stack slot is still non-null");
    }

    #[test]
    fn universal_collapses_to_may_and_counts() {
        let mut m = Module::new("t");
        let ext = m.declare_function("mystery", &[TypeInfo::pointer()], TypeInfo::pointer(), false);
        let f = m.define_function("f", &[], TypeInfo::void());
        let mut b = m.build_function(f);
        let bb = b.block();
        let a = b.alloca(bb);
        let r = b.call(bb, ext, &[a], TypeInfo::pointer());
        let other = b.alloca(bb);
        b.ret(bb, None);
        let _ = other;

        let alias = build(&m);
        assert_eq!(alias.may_alias(&m, r, a), AliasResult::MayAlias);
        assert!(alias.stats().snapshot().universal_queries > 0);
        assert!(alias.stats().snapshot().model_missing > 0);
    }
}
