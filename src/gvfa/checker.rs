// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Vulnerability checkers feeding the global value-flow analysis.
//!
//! A checker contributes three things: the source values with their bit
//! masks, the sink map, and a transfer veto for flows through known
//! sanitizers. Checkers are a closed variant plus an escape hatch holding
//! plain function references.

use std::collections::{HashMap, HashSet};

use crate::alias::AliasAnalysis;
use crate::gvfa::taint_config::{Loc, TaintConfig, TaintEntry, TaintKind};
use crate::ir::{Callee, FuncId, Module, Opcode, ValueId, ValueKind};

/// (value, label) -> bit mask. Up to 32 distinct source roots share an
/// entry point; roots beyond that wrap around.
pub type SourceMap = HashMap<(ValueId, i32), u32>;
/// Guarded value -> the sink values using it.
pub type SinkMap = HashMap<ValueId, HashSet<ValueId>>;

pub enum VulnerabilityChecker {
    /// Possibly-null producers flowing into dereferences.
    NullPointer,
    /// Spec-file driven taint tracking.
    Taint(TaintConfig),
    Custom {
        get_sources: fn(&Module) -> SourceMap,
        get_sinks: fn(&Module) -> SinkMap,
        is_valid_transfer: fn(&Module, ValueId, ValueId) -> bool,
    },
}

impl VulnerabilityChecker {
    pub fn get_sources(&self, module: &Module, alias: &AliasAnalysis) -> SourceMap {
        match self {
            VulnerabilityChecker::NullPointer => null_sources(module, alias),
            VulnerabilityChecker::Taint(config) => taint_sources(module, config),
            VulnerabilityChecker::Custom { get_sources, .. } => get_sources(module),
        }
    }

    pub fn get_sinks(&self, module: &Module) -> SinkMap {
        match self {
            VulnerabilityChecker::NullPointer => null_sinks(module),
            VulnerabilityChecker::Taint(config) => taint_sinks(module, config),
            VulnerabilityChecker::Custom { get_sinks, .. } => get_sinks(module),
        }
    }

    /// False vetoes the flow `from -> to`.
    pub fn is_valid_transfer(&self, module: &Module, from: ValueId, to: ValueId) -> bool {
        match self {
            VulnerabilityChecker::NullPointer => true,
            VulnerabilityChecker::Taint(config) => match module.func_of_value(to) {
                Some(owner) => !config.ignores.contains(&module.func(owner).name),
                None => true,
            },
            VulnerabilityChecker::Custom {
                is_valid_transfer, ..
            } => is_valid_transfer(module, from, to),
        }
    }

    /// Extra flow edges contributed by PIPE directives: external functions
    /// that forward data between their operands.
    pub fn pipe_edges(&self, module: &Module) -> Vec<(ValueId, ValueId)> {
        match self {
            VulnerabilityChecker::Taint(config) => pipe_edges(module, config),
            _ => Vec::new(),
        }
    }
}

fn direct_callee_name<'m>(module: &'m Module, callee: &Callee) -> Option<&'m str> {
    match callee {
        Callee::Direct(f) => Some(module.func(*f).name.as_str()),
        Callee::Indirect(_) => None,
    }
}

fn next_mask(counter: &mut u32) -> u32 {
    let bit = 1u32 << (*counter % 32);
    *counter += 1;
    bit
}

fn null_sources(module: &Module, alias: &AliasAnalysis) -> SourceMap {
    let mut sources = SourceMap::new();
    let mut counter = 0u32;
    let mut seen: HashSet<ValueId> = HashSet::new();
    for f in module.func_ids() {
        if module.func(f).is_declaration {
            continue;
        }
        for inst_id in module.inst_ids(f) {
            let inst = module.inst(inst_id);
            for op in &inst.operands {
                if module.value_is_null(*op) && seen.insert(*op) {
                    let mask = next_mask(&mut counter);
                    sources.insert((*op, 0), mask);
                }
            }
            if let Opcode::Call(Callee::Direct(target)) = inst.opcode {
                // Allocation-like externals may hand back null.
                if module.func(target).is_declaration
                    && inst.ty.is_pointer
                    && alias.may_null(module, inst.value)
                    && seen.insert(inst.value)
                {
                    let mask = next_mask(&mut counter);
                    sources.insert((inst.value, 0), mask);
                }
            }
        }
    }
    sources
}

fn null_sinks(module: &Module) -> SinkMap {
    let mut sinks = SinkMap::new();
    for f in module.func_ids() {
        if module.func(f).is_declaration {
            continue;
        }
        for inst_id in module.inst_ids(f) {
            let inst = module.inst(inst_id);
            let ptr = match inst.opcode {
                Opcode::Load => inst.operands[0],
                Opcode::Store => inst.operands[1],
                _ => continue,
            };
            sinks.entry(ptr).or_default().insert(inst.value);
        }
    }
    sinks
}

/// The values a (loc, call) pair names. `AfterArg` fans out across the
/// remaining actuals.
fn loc_values(module: &Module, call: &crate::ir::Instruction, loc: Loc) -> Vec<ValueId> {
    match loc {
        Loc::Ret => {
            if call.ty.is_void {
                Vec::new()
            } else {
                vec![call.value]
            }
        }
        Loc::Arg(i) => call.operands.get(i as usize).copied().into_iter().collect(),
        Loc::AfterArg(i) => call.operands.iter().skip(i as usize).copied().collect(),
    }
}

fn entry_is_source(entry: &TaintEntry) -> bool {
    // Access modes (V/D/R) collapse under the field-insensitive memory
    // model; only the taint type matters here.
    entry.kind == TaintKind::Tainted
}

fn taint_sources(module: &Module, config: &TaintConfig) -> SourceMap {
    let mut sources = SourceMap::new();
    let mut counter = 0u32;
    for f in module.func_ids() {
        if module.func(f).is_declaration {
            continue;
        }
        for (inst_id, callee) in module.call_sites(f) {
            let inst = module.inst(inst_id);
            let Some(name) = direct_callee_name(module, &callee) else {
                continue;
            };
            let Some(entries) = config.sources.get(name) else {
                continue;
            };
            for entry in entries {
                if !entry_is_source(entry) {
                    continue;
                }
                for v in loc_values(module, inst, entry.loc) {
                    let mask = next_mask(&mut counter);
                    *sources.entry((v, 0)).or_insert(0) |= mask;
                }
            }
        }
    }
    sources
}

fn taint_sinks(module: &Module, config: &TaintConfig) -> SinkMap {
    let mut sinks = SinkMap::new();
    for f in module.func_ids() {
        if module.func(f).is_declaration {
            continue;
        }
        for (inst_id, callee) in module.call_sites(f) {
            let inst = module.inst(inst_id);
            let Some(name) = direct_callee_name(module, &callee) else {
                continue;
            };
            let Some(entries) = config.sinks.get(name) else {
                continue;
            };
            for entry in entries {
                for v in loc_values(module, inst, entry.loc) {
                    sinks.entry(v).or_default().insert(inst.value);
                }
            }
        }
    }
    sinks
}

fn pipe_edges(module: &Module, config: &TaintConfig) -> Vec<(ValueId, ValueId)> {
    let mut edges = Vec::new();
    for f in module.func_ids() {
        if module.func(f).is_declaration {
            continue;
        }
        for (inst_id, callee) in module.call_sites(f) {
            let inst = module.inst(inst_id);
            let Some(name) = direct_callee_name(module, &callee) else {
                continue;
            };
            let Some(specs) = config.pipes.get(name) else {
                continue;
            };
            for spec in specs {
                for from in loc_values(module, inst, spec.from.0) {
                    for to in loc_values(module, inst, spec.to.0) {
                        if from != to {
                            edges.push((from, to));
                        }
                    }
                }
            }
        }
    }
    edges
}

/// Convenience for tests and custom checkers: which function owns a value.
pub fn owner_name(module: &Module, v: ValueId) -> Option<String> {
    match module.value(v).kind {
        ValueKind::Function(f) => Some(module.func(f).name.clone()),
        _ => module
            .func_of_value(v)
            .map(|f: FuncId| module.func(f).name.clone()),
    }
}
