// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Indexing benchmark for context-sensitive reachability.
//!
//! Loads a labeled graph in the persisted text format, builds the offline
//! index with the selected method, then times index queries against the
//! online tabulation algorithms over generated or replayed query sets.
//!
//! Exit codes: 0 success, 1 input error, 2 build error, 3 query mismatch.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use ruvfa::reach::graph::Graph;
use ruvfa::reach::index::{BuildOptions, ReachIndex};
use ruvfa::reach::parallel::ParallelTabulation;
use ruvfa::reach::tabulation::Tabulation;
use ruvfa::util::options::CsrOptions;
use ruvfa::util::stats::AnalysisStats;
use ruvfa::util::CancellationToken;

fn main() {
    if std::env::var("VFA_LOG").is_ok() {
        let e = env_logger::Env::new()
            .filter("VFA_LOG")
            .write_style("VFA_LOG_STYLE");
        env_logger::init_from_env(e);
    }
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = CsrOptions::parse_from_args(&args);
    std::process::exit(run(&options));
}

fn run(options: &CsrOptions) -> i32 {
    let text = match std::fs::read_to_string(&options.graph_file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("csr: cannot read {}: {}", options.graph_file, e);
            return 1;
        }
    };
    let raw = match Graph::from_text(&text) {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("csr: {}", e);
            return 1;
        }
    };
    raw.check();
    let orig_vertices = raw.num_vertices();
    let orig_edges = raw.num_edges();

    let cancel = CancellationToken::new();
    // One global budget for the whole benchmark run.
    cancel.cancel_after_secs(6 * 3600);

    let build_start = Instant::now();
    let index = match ReachIndex::build(
        raw.clone(),
        &BuildOptions {
            method: options.indexing,
            grail_dim: options.grail_dim,
            epsilon: options.epsilon,
            ..Default::default()
        },
        &cancel,
        Arc::new(AnalysisStats::new()),
    ) {
        Ok(index) => index,
        Err(e) => {
            eprintln!("csr: index construction failed: {}", e);
            return 2;
        }
    };
    let build_time = build_start.elapsed();
    println!("# Vertices: {}", orig_vertices);
    println!("# Edges: {}", orig_edges);
    println!("# Summary Edges: {}", index.graph().summary_edge_size());
    println!(
        "Index construction: {}",
        humantime::format_duration(build_time)
    );

    // The sequential solver on the raw graph is the ground truth.
    let truth_graph = raw.clone();
    let truth = Tabulation::new(&truth_graph);

    let (reachable_pairs, unreachable_pairs) = match prepare_queries(options, &index) {
        Ok(queries) => queries,
        Err(e) => {
            eprintln!("csr: {}", e);
            return 1;
        }
    };

    let mut mismatches = 0usize;
    for (pairs, expected) in [(&reachable_pairs, true), (&unreachable_pairs, false)] {
        let start = Instant::now();
        for (s, t) in pairs {
            if index.reach(*s, *t) != expected {
                eprintln!("### Wrong: [{}] to [{}] reach != {}", s, t, expected);
                mismatches += 1;
            }
        }
        let elapsed = start.elapsed();
        println!(
            "Index: {} {} queries in {:?}",
            pairs.len(),
            if expected { "reachable" } else { "unreachable" },
            elapsed
        );
    }

    if options.tabulation {
        let start = Instant::now();
        for (s, t) in reachable_pairs.iter().chain(unreachable_pairs.iter()) {
            let expected = index.reach(*s, *t);
            if truth.reach(*s, *t) != expected {
                eprintln!("### Tabulation disagrees on [{}] to [{}]", s, t);
                mismatches += 1;
            }
        }
        println!("Tabulation cross-check in {:?}", start.elapsed());
    }

    if options.parallel {
        let mut summarized = raw.clone();
        if summarized.build_summary_edges(&cancel).is_err() {
            eprintln!("csr: summary construction failed");
            return 2;
        }
        let par = if options.threads > 0 {
            ParallelTabulation::with_threads(&summarized, options.threads, cancel.clone())
        } else {
            ParallelTabulation::new(&summarized, cancel.clone())
        };
        println!(
            "Algorithm: {} with {} threads",
            par.method(),
            par.num_threads()
        );
        let start = Instant::now();
        for (s, t) in reachable_pairs.iter().chain(unreachable_pairs.iter()) {
            let expected = index.reach(*s, *t);
            if par.reach(*s, *t) != expected {
                eprintln!("### Parallel tabulation disagrees on [{}] to [{}]", s, t);
                mismatches += 1;
            }
        }
        println!("Parallel tabulation queries in {:?}", start.elapsed());

        if options.transitive_closure {
            let start = Instant::now();
            let size = par.tc();
            println!(
                "Parallel transitive closure: {:.2} mb in {:?}",
                size,
                start.elapsed()
            );
        }
    }

    if options.transitive_closure {
        let mut summarized = raw.clone();
        if summarized.build_summary_edges(&cancel).is_err() {
            eprintln!("csr: summary construction failed");
            return 2;
        }
        let start = Instant::now();
        let size = Tabulation::new(&summarized).tc(&cancel);
        println!(
            "Transitive closure: {:.2} mb in {:?}",
            size,
            start.elapsed()
        );
    }

    if mismatches > 0 {
        eprintln!("csr: {} query mismatches", mismatches);
        return 3;
    }
    0
}

type QueryPairs = (Vec<(u32, u32)>, Vec<(u32, u32)>);

fn prepare_queries(options: &CsrOptions, index: &ReachIndex) -> anyhow::Result<QueryPairs> {
    if let Some(path) = &options.read_query {
        return read_queries(path);
    }

    let n = index.num_vertices() as u32;
    if n == 0 {
        return Ok((Vec::new(), Vec::new()));
    }
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut reachable = Vec::new();
    let mut unreachable = Vec::new();
    // Random sampling can starve on skewed graphs; bound the attempts and
    // take what we have.
    let mut attempts = 0usize;
    let budget = options.query_num.saturating_mul(10_000).max(10_000);
    while (reachable.len() < options.query_num || unreachable.len() < options.query_num)
        && attempts < budget
    {
        attempts += 1;
        let s = rng.gen_range(0..n);
        let t = rng.gen_range(0..n);
        if index.reach(s, t) {
            if reachable.len() < options.query_num {
                reachable.push((s, t));
            }
        } else if unreachable.len() < options.query_num {
            unreachable.push((s, t));
        }
    }

    if let Some(path) = &options.gen_query {
        let mut file =
            std::fs::File::create(path).with_context(|| format!("cannot create {}", path))?;
        for (s, t) in &reachable {
            writeln!(file, "{} {}", s, t)?;
        }
        // -1 -1 separates reachable from unreachable pairs.
        writeln!(file, "-1 -1")?;
        for (s, t) in &unreachable {
            writeln!(file, "{} {}", s, t)?;
        }
    }
    Ok((reachable, unreachable))
}

fn read_queries(path: &str) -> anyhow::Result<QueryPairs> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path))?;
    let mut reachable = Vec::new();
    let mut unreachable = Vec::new();
    let mut in_unreachable = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "-1 -1" {
            in_unreachable = true;
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let s = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .with_context(|| format!("bad query line `{}`", trimmed))?;
        let t = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .with_context(|| format!("bad query line `{}`", trimmed))?;
        if in_unreachable {
            unreachable.push((s, t));
        } else {
            reachable.push((s, t));
        }
    }
    Ok((reachable, unreachable))
}
