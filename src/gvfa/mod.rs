// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Global value-flow analysis: source-to-sink slicing over the VFG.
//!
//! Two operating modes trade memory for detail. *Optimized* keeps one
//! 32-bit reachability word per node; *comprehensive* keeps the concrete
//! source set per node and the concrete sink set for the backward
//! direction. Before the forward pass the source set is closed under
//! aliasing and call-boundary coupling. An online mode answers each query
//! with an ad hoc slice instead of precomputed maps and accumulates its
//! query time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use log::info;

use crate::alias::AliasAnalysis;
use crate::gvfa::checker::{SinkMap, SourceMap, VulnerabilityChecker};
use crate::ir::{Module, ValueId, ValueKind};
use crate::util::stats::AnalysisStats;
use crate::util::CancellationToken;
use crate::vfg::Vfg;

pub mod checker;
pub mod taint_config;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AnalysisMode {
    /// One 32-bit word per node.
    Optimized,
    /// Concrete source/sink sets per node.
    Comprehensive,
}

pub struct GlobalValueFlowAnalysis<'a> {
    module: &'a Module,
    vfg: &'a Vfg,
    alias: &'a AliasAnalysis,
    checker: VulnerabilityChecker,
    mode: AnalysisMode,
    online: bool,
    cancel: CancellationToken,

    /// Flattened, alias-extended sources and their masks.
    sources: Vec<(ValueId, u32)>,
    sinks: SinkMap,
    sink_identities: HashSet<ValueId>,
    /// PIPE-style auxiliary flow, keyed by source endpoint.
    aux_edges: HashMap<ValueId, Vec<ValueId>>,

    reach_map: HashMap<ValueId, u32>,
    all_reach: HashMap<ValueId, HashSet<ValueId>>,
    backward_map: HashMap<ValueId, u32>,
    all_backward: HashMap<ValueId, HashSet<ValueId>>,

    online_micros: Mutex<u64>,
}

impl<'a> GlobalValueFlowAnalysis<'a> {
    pub fn new(
        module: &'a Module,
        vfg: &'a Vfg,
        alias: &'a AliasAnalysis,
        checker: VulnerabilityChecker,
        mode: AnalysisMode,
        online: bool,
        cancel: CancellationToken,
    ) -> Self {
        GlobalValueFlowAnalysis {
            module,
            vfg,
            alias,
            checker,
            mode,
            online,
            cancel,
            sources: Vec::new(),
            sinks: SinkMap::new(),
            sink_identities: HashSet::new(),
            aux_edges: HashMap::new(),
            reach_map: HashMap::new(),
            all_reach: HashMap::new(),
            backward_map: HashMap::new(),
            all_backward: HashMap::new(),
            online_micros: Mutex::new(0),
        }
    }

    /// Collects sources and sinks from the checker and runs both slicing
    /// directions. Online mode skips the precomputation entirely.
    pub fn run(&mut self) {
        let raw_sources = self.checker.get_sources(self.module, self.alias);
        self.sinks = self.checker.get_sinks(self.module);
        self.sink_identities = self
            .sinks
            .values()
            .flat_map(|users| users.iter().copied())
            .collect();
        for (from, to) in self.checker.pipe_edges(self.module) {
            self.aux_edges.entry(from).or_default().push(to);
        }

        self.sources = self.extend_sources(raw_sources);
        info!(
            "gvfa: {} sources, {} guarded values, {} sinks",
            self.sources.len(),
            self.sinks.len(),
            self.sink_identities.len()
        );
        if self.online {
            return;
        }

        let sources = self.sources.clone();
        for (v, mask) in &sources {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.mode {
                AnalysisMode::Optimized => self.forward_reachability(*v, *mask),
                AnalysisMode::Comprehensive => self.detailed_forward_reachability(*v, *v),
            }
        }

        let sinks: Vec<(ValueId, Vec<ValueId>)> = self
            .sinks
            .iter()
            .map(|(k, users)| (*k, users.iter().copied().collect()))
            .collect();
        for (guarded, users) in sinks {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.mode {
                AnalysisMode::Optimized => self.backward_reachability(guarded),
                AnalysisMode::Comprehensive => {
                    for user in users {
                        self.detailed_backward_reachability(guarded, user);
                    }
                }
            }
        }
    }

    // ---- source extension ----

    /// Closes the source set under aliasing and call-boundary coupling:
    /// class members share taint, a tainted formal taints the matching
    /// actuals, a tainted call result taints the callee's returned values.
    fn extend_sources(&self, raw: SourceMap) -> Vec<(ValueId, u32)> {
        let mut covered: HashMap<ValueId, u32> = HashMap::new();
        let mut queue: VecDeque<(ValueId, u32)> = VecDeque::new();
        for ((v, _label), mask) in raw {
            queue.push_back((v, mask));
        }

        while let Some((v, mask)) = queue.pop_front() {
            let entry = covered.entry(v).or_insert(0);
            let uncovered = mask & !*entry;
            if uncovered == 0 {
                continue;
            }
            *entry |= uncovered;

            for member in self.alias.points_to_set(v) {
                if member != v {
                    queue.push_back((member, uncovered));
                }
            }
            match self.module.value(v).kind {
                ValueKind::Argument { .. } => {
                    for (caller_val, label) in self.vfg.preds(v) {
                        // Only call edges feed a formal parameter.
                        if label > 0 {
                            queue.push_back((caller_val, uncovered));
                        }
                    }
                }
                ValueKind::Inst(_) => {
                    for (ret_val, label) in self.vfg.preds(v) {
                        if label < 0 {
                            queue.push_back((ret_val, uncovered));
                        }
                    }
                }
                _ => {}
            }
        }
        covered.into_iter().collect()
    }

    // ---- counting helpers ----

    fn count(&mut self, v: ValueId, mask: u32) -> u32 {
        match self.reach_map.get(&v) {
            Some(bits) => mask & !(mask & bits),
            None => {
                self.reach_map.insert(v, 0);
                mask
            }
        }
    }

    fn count_const(&self, v: ValueId, mask: u32) -> u32 {
        match self.reach_map.get(&v) {
            Some(bits) => mask & !(mask & bits),
            None => mask,
        }
    }

    fn all_count(&mut self, v: ValueId, src: ValueId) -> bool {
        let entry = self.all_reach.entry(v).or_default();
        !entry.insert(src)
    }

    fn all_backward_count(&mut self, v: ValueId, sink: ValueId) -> bool {
        let entry = self.all_backward.entry(v).or_default();
        !entry.insert(sink)
    }

    // ---- slicing passes ----

    fn transfer_targets(&self, v: ValueId) -> Vec<ValueId> {
        let mut targets: Vec<ValueId> = self
            .vfg
            .succs(v)
            .into_iter()
            .map(|(succ, _)| succ)
            .collect();
        if let Some(aux) = self.aux_edges.get(&v) {
            targets.extend(aux.iter().copied());
        }
        targets
            .into_iter()
            .filter(|t| self.checker.is_valid_transfer(self.module, v, *t))
            .collect()
    }

    fn forward_reachability(&mut self, v: ValueId, mask: u32) {
        let mut queue = VecDeque::new();
        queue.push_back((v, mask));
        while let Some((cur, cur_mask)) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                return;
            }
            let uncovered = self.count(cur, cur_mask);
            if uncovered == 0 {
                continue;
            }
            *self.reach_map.get_mut(&cur).unwrap() |= uncovered;
            for succ in self.transfer_targets(cur) {
                if self.count_const(succ, uncovered) != 0 {
                    queue.push_back((succ, uncovered));
                }
            }
        }
    }

    fn detailed_forward_reachability(&mut self, v: ValueId, src: ValueId) {
        let mut queue = VecDeque::new();
        queue.push_back(v);
        while let Some(cur) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.all_count(cur, src) && cur != v {
                continue;
            }
            for succ in self.transfer_targets(cur) {
                if !self
                    .all_reach
                    .get(&succ)
                    .map_or(false, |set| set.contains(&src))
                {
                    queue.push_back(succ);
                }
            }
        }
    }

    fn backward_reachability(&mut self, v: ValueId) {
        let mut queue = VecDeque::new();
        queue.push_back(v);
        while let Some(cur) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                return;
            }
            *self.backward_map.entry(cur).or_insert(0) += 1;
            for (pred, _) in self.vfg.preds(cur) {
                if !self.backward_map.contains_key(&pred)
                    && self.checker.is_valid_transfer(self.module, pred, cur)
                {
                    queue.push_back(pred);
                }
            }
        }
    }

    fn detailed_backward_reachability(&mut self, v: ValueId, sink: ValueId) {
        let mut queue = VecDeque::new();
        queue.push_back(v);
        while let Some(cur) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.all_backward_count(cur, sink) && cur != v {
                continue;
            }
            for (pred, _) in self.vfg.preds(cur) {
                if self.checker.is_valid_transfer(self.module, pred, cur)
                    && !self
                        .all_backward
                        .get(&pred)
                        .map_or(false, |set| set.contains(&sink))
                {
                    queue.push_back(pred);
                }
            }
        }
    }

    // ---- queries ----

    /// Bits of `mask` whose sources reach `v`.
    pub fn reachable(&self, v: ValueId, mask: u32) -> u32 {
        if self.online {
            return if self.online_slicing(v) { mask } else { 0 };
        }
        match self.mode {
            AnalysisMode::Optimized => mask & !self.count_const(v, mask),
            AnalysisMode::Comprehensive => {
                let mut bits = 0u32;
                if let Some(srcs) = self.all_reach.get(&v) {
                    for (source, source_mask) in &self.sources {
                        if srcs.contains(source) {
                            bits |= source_mask;
                        }
                    }
                }
                bits & mask
            }
        }
    }

    /// Comprehensive mode: does this specific source reach `v`?
    pub fn src_reachable(&self, v: ValueId, src: ValueId) -> bool {
        self.all_reach
            .get(&v)
            .map_or(false, |set| set.contains(&src))
    }

    /// Can `v` flow into any sink?
    pub fn backward_reachable(&self, v: ValueId) -> bool {
        if self.sinks.is_empty() {
            return true;
        }
        if self.online {
            return self.online_slicing(v);
        }
        match self.mode {
            AnalysisMode::Optimized => self.backward_map.contains_key(&v),
            AnalysisMode::Comprehensive => self
                .all_backward
                .get(&v)
                .map_or(false, |set| !set.is_empty()),
        }
    }

    /// Can `v` flow into every sink? Comprehensive mode only; optimized
    /// mode cannot distinguish sinks and answers conservatively.
    pub fn backward_reachable_all_sinks(&self, v: ValueId) -> bool {
        match self.mode {
            AnalysisMode::Comprehensive => match self.all_backward.get(&v) {
                Some(set) => set.len() == self.sink_identities.len(),
                None => false,
            },
            AnalysisMode::Optimized => self.backward_reachable(v),
        }
    }

    /// Microseconds spent in online queries so far.
    pub fn online_query_micros(&self) -> u64 {
        *self.online_micros.lock().unwrap()
    }

    /// Ad hoc per-query slice: forward from `v` until a sink value is hit.
    fn online_slicing(&self, v: ValueId) -> bool {
        let start = Instant::now();
        AnalysisStats::bump(&self.alias.stats().online_queries);

        let mut visited: HashSet<ValueId> = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(v);
        let mut found = false;
        'search: while let Some(cur) = queue.pop_front() {
            if !visited.insert(cur) {
                continue;
            }
            if self.sink_identities.contains(&cur) || self.sinks.contains_key(&cur) {
                found = true;
                break 'search;
            }
            for succ in self.transfer_targets(cur) {
                if !visited.contains(&succ) {
                    queue.push_back(succ);
                }
            }
        }

        let elapsed = start.elapsed().as_micros() as u64;
        *self.online_micros.lock().unwrap() += elapsed;
        found
    }

    /// The matched-parenthesis query, independent of the offline index:
    /// a breadth-first walk carrying an explicit call stack.
    pub fn cfl_reachable(&self, from: ValueId, to: ValueId) -> bool {
        self.cfl_query(from, to, true)
    }

    /// Walks predecessor edges from `from` looking for `to`; return edges
    /// act as opens on the way back.
    pub fn cfl_backward_reachable(&self, from: ValueId, to: ValueId) -> bool {
        self.cfl_query(from, to, false)
    }

    fn cfl_query(&self, from: ValueId, to: ValueId, forward: bool) -> bool {
        let mut visited: HashSet<ValueId> = HashSet::new();
        let mut queue: VecDeque<(ValueId, Vec<i32>)> = VecDeque::new();
        queue.push_back((from, Vec::new()));

        while let Some((cur, stack)) = queue.pop_front() {
            if cur == to {
                return true;
            }
            if !visited.insert(cur) {
                continue;
            }
            let edges = if forward {
                self.vfg.succs(cur)
            } else {
                self.vfg.preds(cur)
            };
            for (next, raw_label) in edges {
                // Backward traversal flips open and close roles.
                let label = if forward { raw_label } else { -raw_label };
                let mut next_stack = stack.clone();
                if label > 0 {
                    next_stack.push(label);
                } else if label < 0 {
                    match next_stack.last() {
                        Some(top) if *top == -label => {
                            next_stack.pop();
                        }
                        _ => continue,
                    }
                }
                if !visited.contains(&next) {
                    queue.push_back((next, next_stack));
                }
            }
        }
        false
    }

    pub fn sources(&self) -> &[(ValueId, u32)] {
        &self.sources
    }

    pub fn sinks(&self) -> &SinkMap {
        &self.sinks
    }
}
