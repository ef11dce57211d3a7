// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The module-analysis driver.
//!
//! Builds a module (a synthetic one sized by `--num-functions` and
//! `--max-pointers`), runs the full pipeline of call graph, alias analysis,
//! value flow graph, reachability index and global value-flow analysis, and
//! drives a per-function dataflow pass through the parallel scheduler.
//!
//! Exit codes: 0 success, 1 input error, 2 build error.

use std::collections::HashMap;
use std::io::BufWriter;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{info, warn};

use ruvfa::alias::AliasAnalysis;
use ruvfa::error::AnalysisError;
use ruvfa::graph::call_graph::build_call_graph;
use ruvfa::gvfa::checker::VulnerabilityChecker;
use ruvfa::gvfa::taint_config::TaintConfig;
use ruvfa::gvfa::GlobalValueFlowAnalysis;
use ruvfa::ir::{FuncId, Module, TypeInfo};
use ruvfa::reach::index::{BuildOptions, ReachIndex};
use ruvfa::sched::pipeline::{PipelineScheduler, SchedulerOptions};
use ruvfa::sched::thread_pool::ThreadPool;
use ruvfa::solver::dataflow::ReachingDefinitions;
use ruvfa::util::config::AnalysisConfig;
use ruvfa::util::mem_watcher::MemoryWatcher;
use ruvfa::util::options::{AnalysisOptions, CheckerKind};
use ruvfa::util::stats::AnalysisStats;
use ruvfa::util::CancellationToken;

fn main() {
    if std::env::var("VFA_LOG").is_ok() {
        let e = env_logger::Env::new()
            .filter("VFA_LOG")
            .write_style("VFA_LOG_STYLE");
        env_logger::init_from_env(e);
    }

    // Options may arrive via the VFA_FLAGS environment variable, with the
    // command line taking precedence.
    let mut options = AnalysisOptions::default();
    let env_flags = std::env::var("VFA_FLAGS").unwrap_or_default();
    let env_args: Vec<String> = serde_json::from_str(&env_flags).unwrap_or_default();
    options.parse_from_args(&env_args);
    let args: Vec<String> = std::env::args().skip(1).collect();
    options.parse_from_args(&args);
    info!("VFA Options: {:?}", options);

    std::process::exit(match run(&options) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("vfa: {}", e);
            match e {
                AnalysisError::InputInvalid(_) => 1,
                _ => 2,
            }
        }
    });
}

fn run(options: &AnalysisOptions) -> Result<(), AnalysisError> {
    let cancel = CancellationToken::new();
    if let Some(secs) = options.timeout_secs {
        cancel.cancel_after_secs(secs);
    }

    if let Some(conf) = &options.conf {
        let config = AnalysisConfig::from_file(Path::new(conf))?;
        info!("loaded {} configuration entries", config.len());
    }
    let checker = match options.checker {
        CheckerKind::NullPointer => VulnerabilityChecker::NullPointer,
        CheckerKind::Taint => {
            let spec_path = options.taint_spec.as_ref().ok_or_else(|| {
                AnalysisError::InputInvalid("the taint checker needs --taint-spec".to_string())
            })?;
            VulnerabilityChecker::Taint(TaintConfig::from_file(Path::new(spec_path))?)
        }
    };

    let mut mem_watcher = MemoryWatcher::new();
    mem_watcher.start();
    let start = Instant::now();

    let module = Arc::new(synthetic_module(options.num_functions, options.max_pointers));
    let stats = Arc::new(AnalysisStats::new());

    let call_graph = build_call_graph(&module, &stats);
    let alias = Arc::new(AliasAnalysis::build(&module, &call_graph, stats.clone())?);
    let vfg = ruvfa::vfg::VfgBuilder::new(&module, &alias, &call_graph).build();

    if let Some(path) = &options.vfg_output {
        std::fs::write(path, vfg.to_text())
            .map_err(|e| AnalysisError::InputInvalid(format!("{}: {}", path, e)))?;
    }
    if let Some(path) = &options.call_graph_output {
        call_graph.to_dot(&module, Path::new(path));
    }

    let index = ReachIndex::build(
        vfg.to_reach_graph(),
        &BuildOptions {
            method: options.indexing,
            ..Default::default()
        },
        &cancel,
        stats.clone(),
    )?;
    info!(
        "reachability index over {} vertices complete: {}",
        index.num_vertices(),
        index.is_complete()
    );

    let mut gvfa = GlobalValueFlowAnalysis::new(
        module.as_ref(),
        &vfg,
        alias.as_ref(),
        checker,
        options.mode,
        options.online_query,
        cancel.clone(),
    );
    gvfa.run();
    let flagged = gvfa
        .sources()
        .iter()
        .filter(|(v, _)| gvfa.backward_reachable(*v))
        .count();
    println!(
        "{} of {} sources may reach a sink",
        flagged,
        gvfa.sources().len()
    );

    // Per-function dataflow pass under the scheduler.
    let pool = ThreadPool::new(options.nworkers);
    let scheduler = PipelineScheduler::new(
        &module,
        &call_graph,
        &pool,
        SchedulerOptions {
            kind: options.schedule,
            show_progress: true,
            ..Default::default()
        },
    );
    let def_counts: Arc<Mutex<HashMap<FuncId, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let module_cb = module.clone();
    let alias_cb = alias.clone();
    let counts_cb = def_counts.clone();
    let run_result = scheduler.run(
        Arc::new(move |f| {
            let rd = ReachingDefinitions::run(&module_cb, f, &alias_cb);
            counts_cb.lock().unwrap().insert(f, rd.defs.len());
        }),
        Some(Arc::new(|f| {
            log::debug!("released per-function state of {:?}", f);
        })),
    );
    if let Err(e) = run_result {
        warn!("scheduler stopped early: {}", e);
    }
    let total_defs: usize = def_counts.lock().unwrap().values().sum();
    println!("{} stores analyzed across the module", total_defs);

    let elapsed = start.elapsed();
    mem_watcher.stop();
    if options.dump_stats {
        let mut writer = BufWriter::new(std::io::stdout());
        stats.dump(&mut writer, elapsed);
    }
    if let Some(path) = &options.stats_json_output {
        let mut file = std::fs::File::create(path)
            .map_err(|e| AnalysisError::InputInvalid(format!("{}: {}", path, e)))?;
        stats
            .dump_json(&mut file)
            .map_err(|e| AnalysisError::InputInvalid(e.to_string()))?;
    }
    Ok(())
}

/// A deterministic module shaped like a small program: a chain of functions
/// passing pointers down, stores and loads over shared cells, a taintable
/// external source and a guarded external sink.
fn synthetic_module(num_functions: usize, max_pointers: usize) -> Module {
    let mut m = Module::new("synthetic");
    let getenv = m.declare_function("getenv", &[TypeInfo::pointer()], TypeInfo::pointer(), false);
    let strcpy = m.declare_function(
        "strcpy",
        &[TypeInfo::pointer(), TypeInfo::pointer()],
        TypeInfo::pointer(),
        false,
    );

    let n = num_functions.max(2);
    let mut funcs: Vec<FuncId> = Vec::new();
    for i in 0..n {
        funcs.push(m.define_function(
            &format!("level{}", i),
            &[TypeInfo::pointer()],
            TypeInfo::pointer(),
        ));
    }

    for i in 0..n {
        let f = funcs[i];
        let callee = if i + 1 < n { Some(funcs[i + 1]) } else { None };
        let mut b = m.build_function(f);
        let bb = b.block();
        let p = b.param(0);
        let mut cursor = p;
        for _ in 0..max_pointers.max(1) {
            let cell = b.alloca(bb);
            b.store(bb, cursor, cell);
            cursor = b.load(bb, cell, TypeInfo::pointer());
        }
        let result = match callee {
            Some(next) => b.call(bb, next, &[cursor], TypeInfo::pointer()),
            None => cursor,
        };
        b.ret(bb, Some(result));
    }

    let main = m.define_function("main", &[], TypeInfo::scalar());
    let name = m.add_global("env_name");
    let name_val = m.global_value(name);
    let zero = m.const_int(0);
    let mut b = m.build_function(main);
    let bb = b.block();
    let tainted = b.call(bb, getenv, &[name_val], TypeInfo::pointer());
    let piped = b.call(bb, funcs[0], &[tainted], TypeInfo::pointer());
    let dst = b.alloca(bb);
    b.call(bb, strcpy, &[dst, piped], TypeInfo::pointer());
    b.ret(bb, Some(zero));
    m
}
