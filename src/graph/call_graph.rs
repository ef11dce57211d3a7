// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use petgraph::graph::{DefaultIx, EdgeIndex, NodeIndex};
use petgraph::Direction;
use petgraph::Graph;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::ir::{BaseCallSite, Callee, FuncId, Module};
use crate::util::chunked_queue::{ChunkedQueue, IterCopied};
use crate::util::stats::AnalysisStats;

/// Unique identifiers for call graph nodes.
pub type CGNodeId = NodeIndex<DefaultIx>;
/// Unique identifiers for call graph edges.
pub type CGEdgeId = EdgeIndex<DefaultIx>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    /// The callee is named by the instruction.
    Direct,
    /// The callee is a function pointer; targets were enumerated from the
    /// address-taken set.
    Indirect,
}

#[derive(Debug)]
pub struct CallGraphNode {
    pub(crate) func: FuncId,
}

#[derive(Debug)]
pub struct CallGraphEdge {
    pub(crate) callsite: BaseCallSite,
}

pub struct CallGraph {
    /// The graph structure capturing call relationships.
    pub graph: Graph<CallGraphNode, CallGraphEdge>,
    /// A map from functions to their corresponding call graph nodes.
    pub func_nodes: HashMap<FuncId, CGNodeId>,
    /// A map from call sites to call graph edges.
    pub callsite_to_edges: HashMap<BaseCallSite, HashSet<CGEdgeId>>,
    /// Record the type of each call.
    callsite_to_type: HashMap<BaseCallSite, CallType>,
    /// A queue of reachable functions, in discovery order.
    reach_funcs: ChunkedQueue<FuncId>,
}

impl Default for CallGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CallGraph {
    pub fn new() -> Self {
        CallGraph {
            graph: Graph::new(),
            func_nodes: HashMap::new(),
            callsite_to_edges: HashMap::new(),
            callsite_to_type: HashMap::new(),
            reach_funcs: ChunkedQueue::new(),
        }
    }

    /// Add a new node to the call graph.
    pub fn add_node(&mut self, func: FuncId) {
        if let Entry::Vacant(e) = self.func_nodes.entry(func) {
            let node_id = self.graph.add_node(CallGraphNode { func });
            e.insert(node_id);
            self.reach_funcs.push(func);
        }
    }

    fn get_or_insert_node(&mut self, func: FuncId) -> CGNodeId {
        match self.func_nodes.entry(func) {
            Entry::Occupied(o) => o.get().to_owned(),
            Entry::Vacant(v) => {
                let node_id = self.graph.add_node(CallGraphNode { func });
                self.reach_funcs.push(func);
                *v.insert(node_id)
            }
        }
    }

    pub fn set_callsite_type(&mut self, callsite: BaseCallSite, call_type: CallType) {
        self.callsite_to_type.insert(callsite, call_type);
    }

    pub fn get_callsite_type(&self, callsite: &BaseCallSite) -> Option<&CallType> {
        self.callsite_to_type.get(callsite)
    }

    /// All callees recorded for a call site.
    pub fn get_callees(&self, callsite: &BaseCallSite) -> HashSet<FuncId> {
        if let Some(edges) = self.callsite_to_edges.get(callsite) {
            edges
                .iter()
                .filter_map(|edge_id| match self.graph.edge_endpoints(*edge_id) {
                    Some((_, target)) => Some(self.graph.node_weight(target).unwrap().func),
                    None => None,
                })
                .collect()
        } else {
            HashSet::new()
        }
    }

    /// Returns true if an edge to the callee already exists for the callsite.
    pub fn has_edge(&self, callsite: &BaseCallSite, callee_id: FuncId) -> bool {
        self.get_callees(callsite).contains(&callee_id)
    }

    /// Adds a call from `caller_id` to `callee_id` at `callsite`.
    /// Returns false if the edge already existed, and true otherwise.
    pub fn add_edge(&mut self, callsite: BaseCallSite, caller_id: FuncId, callee_id: FuncId) -> bool {
        let caller_node = self.get_or_insert_node(caller_id);
        let callee_node = self.get_or_insert_node(callee_id);

        let callees = self.get_callees(&callsite);
        if !callees.contains(&callee_id) {
            let edge_id = self
                .graph
                .add_edge(caller_node, callee_node, CallGraphEdge { callsite });
            self.callsite_to_edges
                .entry(callsite)
                .or_default()
                .insert(edge_id);
            true
        } else {
            false
        }
    }

    /// Distinct callees of a function, regardless of call site.
    pub fn callees_of(&self, func: FuncId) -> HashSet<FuncId> {
        match self.func_nodes.get(&func) {
            Some(node) => self
                .graph
                .neighbors_directed(*node, Direction::Outgoing)
                .map(|n| self.graph.node_weight(n).unwrap().func)
                .collect(),
            None => HashSet::new(),
        }
    }

    /// Distinct callers of a function.
    pub fn callers_of(&self, func: FuncId) -> HashSet<FuncId> {
        match self.func_nodes.get(&func) {
            Some(node) => self
                .graph
                .neighbors_directed(*node, Direction::Incoming)
                .map(|n| self.graph.node_weight(n).unwrap().func)
                .collect(),
            None => HashSet::new(),
        }
    }

    /// Return a cursor over the reachable functions queue. The cursor keeps
    /// yielding functions discovered after its creation.
    pub fn reach_funcs_iter(&self) -> IterCopied {
        self.reach_funcs.iter_copied()
    }

    pub fn reach_funcs(&self) -> &ChunkedQueue<FuncId> {
        &self.reach_funcs
    }

    /// Strongly connected components of the call graph, with a map from each
    /// function to its component index. Component lists come out of Tarjan's
    /// algorithm in reverse topological order (callees before callers).
    pub fn condensation(&self) -> (Vec<Vec<FuncId>>, HashMap<FuncId, usize>) {
        let sccs = petgraph::algo::tarjan_scc(&self.graph);
        let mut groups = Vec::with_capacity(sccs.len());
        let mut scc_of = HashMap::new();
        for (i, comp) in sccs.into_iter().enumerate() {
            let funcs: Vec<FuncId> = comp
                .into_iter()
                .map(|n| self.graph.node_weight(n).unwrap().func)
                .collect();
            for f in &funcs {
                scc_of.insert(*f, i);
            }
            groups.push(funcs);
        }
        (groups, scc_of)
    }

    /// Produce a dot file representation of the call graph
    /// for displaying with Graphviz.
    pub fn to_dot(&self, module: &Module, dot_path: &std::path::Path) {
        let mut out = String::from("digraph call_graph {\n");
        for node in self.graph.node_indices() {
            let func = self.graph.node_weight(node).unwrap().func;
            out.push_str(&format!(
                "    n{}[label=\"{}\"];\n",
                node.index(),
                module.func(func).name
            ));
        }
        for edge in self.graph.edge_indices() {
            let (src, dst) = self.graph.edge_endpoints(edge).unwrap();
            let callsite = self.graph.edge_weight(edge).unwrap().callsite;
            out.push_str(&format!(
                "    n{} -> n{}[label=\"{:?}\"];\n",
                src.index(),
                dst.index(),
                callsite.inst
            ));
        }
        out.push_str("}\n");
        match std::fs::write(dot_path, out) {
            Ok(_) => (),
            Err(e) => panic!("Failed to write dot file output: {:?}", e),
        };
    }
}

/// Address-taken functions compatible with a call of `nargs` actuals.
/// Variadic candidates accept any call with at least their declared arity.
pub fn address_taken_targets(module: &Module, nargs: usize) -> Vec<FuncId> {
    module
        .address_taken_funcs()
        .into_iter()
        .filter(|f| {
            let func = module.func(*f);
            if func.is_variadic {
                func.arity() <= nargs
            } else {
                func.arity() == nargs
            }
        })
        .collect()
}

/// Builds the module call graph: direct edges from call instructions,
/// indirect edges from the address-taken resolution.
pub fn build_call_graph(module: &Module, stats: &AnalysisStats) -> CallGraph {
    let mut cg = CallGraph::new();
    for f in module.func_ids() {
        if module.func(f).is_declaration {
            continue;
        }
        cg.add_node(f);
        for (inst, callee) in module.call_sites(f) {
            let callsite = BaseCallSite { caller: f, inst };
            match callee {
                Callee::Direct(target) => {
                    cg.set_callsite_type(callsite, CallType::Direct);
                    cg.add_edge(callsite, f, target);
                }
                Callee::Indirect(_) => {
                    cg.set_callsite_type(callsite, CallType::Indirect);
                    let nargs = module.inst(inst).operands.len();
                    let targets = address_taken_targets(module, nargs);
                    if targets.is_empty() {
                        AnalysisStats::bump(&stats.indirect_unresolved);
                    } else {
                        AnalysisStats::bump(&stats.indirect_resolved);
                    }
                    for target in targets {
                        cg.add_edge(callsite, f, target);
                    }
                }
            }
        }
    }
    cg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::TypeInfo;

    fn call_module() -> (Module, FuncId, FuncId, FuncId) {
        let mut m = Module::new("t");
        let callee = m.define_function("callee", &[TypeInfo::pointer()], TypeInfo::void());
        let mut b = m.build_function(callee);
        let bb = b.block();
        b.ret(bb, None);

        let other = m.define_function("other", &[TypeInfo::pointer()], TypeInfo::void());
        let mut b = m.build_function(other);
        let bb = b.block();
        b.ret(bb, None);

        let main = m.define_function("main", &[], TypeInfo::void());
        let fv = m.func_value(callee);
        let mut b = m.build_function(main);
        let bb = b.block();
        let a = b.alloca(bb);
        b.call(bb, other, &[a], TypeInfo::void());
        b.call_indirect(bb, fv, &[a], TypeInfo::void());
        b.ret(bb, None);
        (m, main, callee, other)
    }

    #[test]
    fn direct_and_indirect_edges() {
        let (m, main, callee, other) = call_module();
        let stats = AnalysisStats::new();
        let cg = build_call_graph(&m, &stats);

        let callees = cg.callees_of(main);
        assert!(callees.contains(&other));
        // The indirect call resolves to the address-taken function with
        // matching arity only.
        assert!(callees.contains(&callee));
        assert_eq!(stats.snapshot().indirect_resolved, 1);

        assert_eq!(cg.callers_of(callee), [main].into_iter().collect());
    }

    #[test]
    fn one_edge_per_callsite_callee_pair() {
        let (m, main, _, other) = call_module();
        let stats = AnalysisStats::new();
        let mut cg = build_call_graph(&m, &stats);
        let callsite = m
            .call_sites(main)
            .into_iter()
            .find(|(i, _)| matches!(m.inst(*i).opcode, crate::ir::Opcode::Call(Callee::Direct(_))))
            .map(|(i, _)| BaseCallSite { caller: main, inst: i })
            .unwrap();
        assert!(!cg.add_edge(callsite, main, other), "duplicate edge must be rejected");
        assert_eq!(cg.get_callees(&callsite).len(), 1);
    }

    #[test]
    fn condensation_groups_recursion() {
        let mut m = Module::new("t");
        let a = m.define_function("a", &[], TypeInfo::void());
        let b_f = m.define_function("b", &[], TypeInfo::void());
        let mut b = m.build_function(a);
        let bb = b.block();
        b.call(bb, b_f, &[], TypeInfo::void());
        b.ret(bb, None);
        let mut b = m.build_function(b_f);
        let bb = b.block();
        b.call(bb, a, &[], TypeInfo::void());
        b.ret(bb, None);

        let stats = AnalysisStats::new();
        let cg = build_call_graph(&m, &stats);
        let (groups, scc_of) = cg.condensation();
        assert_eq!(scc_of[&a], scc_of[&b_f]);
        assert!(groups[scc_of[&a]].len() == 2);
    }
}
