// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Analysis options.

use clap::error::ErrorKind;
use clap::{Arg, Command};
use itertools::Itertools;

use crate::gvfa::AnalysisMode;
use crate::reach::index::IndexingMethod;
use crate::sched::pipeline::ScheduleKind;

const VFA_USAGE: &str = r#"vfa [OPTIONS] [-- [EXTRA OPTIONS]]"#;

/// Creates the clap::Command metadata for argument parsing.
fn make_options_parser() -> Command<'static> {
    let parser = Command::new("vfa")
        .no_binary_name(true)
        .override_usage(VFA_USAGE)
        .arg(Arg::new("nworkers")
            .long("nworkers")
            .takes_value(true)
            .value_parser(clap::value_parser!(usize))
            .help("Worker threads for the scheduler; 0 runs on the main thread only."))
        .arg(Arg::new("num-functions")
            .long("num-functions")
            .takes_value(true)
            .value_parser(clap::value_parser!(usize))
            .help("Number of functions in the generated comparison module."))
        .arg(Arg::new("max-pointers")
            .long("max-pointers")
            .takes_value(true)
            .value_parser(clap::value_parser!(usize))
            .help("Pointer values per generated function."))
        .arg(Arg::new("entry-func-name")
            .long("entry-func")
            .takes_value(true)
            .help("The name of the entry function the analysis starts from."))
        .arg(Arg::new("checker")
            .long("checker")
            .takes_value(true)
            .value_parser(["null", "taint"])
            .help("The embedded vulnerability checker to run."))
        .arg(Arg::new("taint-spec")
            .long("taint-spec")
            .takes_value(true)
            .help("Taint specification file for the taint checker."))
        .arg(Arg::new("conf")
            .long("conf")
            .takes_value(true)
            .help("Analyzer key=value configuration file."))
        .arg(Arg::new("mode")
            .long("mode")
            .takes_value(true)
            .value_parser(["optimized", "comprehensive"])
            .help("Reachability bookkeeping mode of the value-flow analysis."))
        .arg(Arg::new("schedule")
            .long("schedule")
            .takes_value(true)
            .value_parser(["local", "bottom-up", "top-down"])
            .help("Scheduling discipline over the call graph."))
        .arg(Arg::new("indexing")
            .long("indexing")
            .takes_value(true)
            .value_parser(["pathtree", "grail", "pathtree+grail"])
            .help("Offline reachability index construction method."))
        .arg(Arg::new("online-query")
            .long("online-query")
            .takes_value(false)
            .help("Answer value-flow queries with ad hoc slicing instead of the index."))
        .arg(Arg::new("timeout")
            .long("timeout")
            .takes_value(true)
            .value_parser(clap::value_parser!(u64))
            .help("Wall-clock budget in seconds for the whole analysis."))
        .arg(Arg::new("dump-stats")
            .long("dump-stats")
            .takes_value(false)
            .help("Dump the statistics of the analysis results."))
        .arg(Arg::new("stats-json-output")
            .long("dump-stats-json")
            .takes_value(true)
            .help("Dump the statistics as JSON to the output file."))
        .arg(Arg::new("call-graph-output")
            .long("dump-call-graph")
            .takes_value(true)
            .help("Dump the call graph in DOT format to the output file."))
        .arg(Arg::new("vfg-output")
            .long("dump-vfg")
            .takes_value(true)
            .help("Dump the value flow graph in the persisted text format."));
    parser
}

#[derive(Clone, Debug)]
pub struct AnalysisOptions {
    pub nworkers: usize,
    pub num_functions: usize,
    pub max_pointers: usize,
    pub entry_func: String,
    pub checker: CheckerKind,
    pub taint_spec: Option<String>,
    pub conf: Option<String>,
    pub mode: AnalysisMode,
    pub schedule: ScheduleKind,
    pub indexing: IndexingMethod,
    pub online_query: bool,
    pub timeout_secs: Option<u64>,

    pub dump_stats: bool,
    pub stats_json_output: Option<String>,
    pub call_graph_output: Option<String>,
    pub vfg_output: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckerKind {
    NullPointer,
    Taint,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            nworkers: 0,
            num_functions: 8,
            max_pointers: 32,
            entry_func: String::new(),
            checker: CheckerKind::NullPointer,
            taint_spec: None,
            conf: None,
            mode: AnalysisMode::Optimized,
            schedule: ScheduleKind::BottomUp,
            indexing: IndexingMethod::PathTreeAndGrail,
            online_query: false,
            timeout_secs: None,
            dump_stats: true,
            stats_json_output: None,
            call_graph_output: None,
            vfg_output: None,
        }
    }
}

impl AnalysisOptions {
    /// Parses options from a list of strings. Any content beyond the
    /// leftmost `--` token is returned for the caller (excluding the token).
    pub fn parse_from_args(&mut self, args: &[String]) -> Vec<String> {
        let mut own_args_end = args.len();
        let mut extra_args_start = args.len();
        if let Some((p, _)) = args.iter().find_position(|s| s.as_str() == "--") {
            own_args_end = p;
            extra_args_start = p + 1;
        }
        let own_args = &args[0..own_args_end];

        let matches = match make_options_parser().try_get_matches_from(own_args.iter()) {
            Ok(matches) => matches,
            Err(e) => match e.kind() {
                ErrorKind::DisplayHelp => {
                    eprintln!("{e}");
                    std::process::exit(0);
                }
                _ => e.exit(),
            },
        };

        // Options absent from this argument list keep their current value,
        // so environment-supplied flags survive a later command-line parse.
        if let Some(n) = matches.get_one::<usize>("nworkers") {
            self.nworkers = *n;
        }
        if let Some(n) = matches.get_one::<usize>("num-functions") {
            self.num_functions = *n;
        }
        if let Some(n) = matches.get_one::<usize>("max-pointers") {
            self.max_pointers = *n;
        }
        if let Some(s) = matches.get_one::<String>("entry-func-name") {
            self.entry_func = s.clone();
        }
        if let Some(s) = matches.get_one::<String>("checker") {
            self.checker = match s.as_str() {
                "taint" => CheckerKind::Taint,
                _ => CheckerKind::NullPointer,
            };
        }
        if let Some(s) = matches.get_one::<String>("taint-spec") {
            self.taint_spec = Some(s.clone());
        }
        if let Some(s) = matches.get_one::<String>("conf") {
            self.conf = Some(s.clone());
        }
        if let Some(s) = matches.get_one::<String>("mode") {
            self.mode = match s.as_str() {
                "comprehensive" => AnalysisMode::Comprehensive,
                _ => AnalysisMode::Optimized,
            };
        }
        if let Some(s) = matches.get_one::<String>("schedule") {
            self.schedule = match s.as_str() {
                "local" => ScheduleKind::Local,
                "top-down" => ScheduleKind::TopDown,
                _ => ScheduleKind::BottomUp,
            };
        }
        if let Some(s) = matches.get_one::<String>("indexing") {
            self.indexing = IndexingMethod::parse(s).expect("clap validated the value");
        }
        if matches.contains_id("online-query") {
            self.online_query = true;
        }
        if let Some(t) = matches.get_one::<u64>("timeout") {
            self.timeout_secs = Some(*t);
        }
        if matches.contains_id("dump-stats") {
            self.dump_stats = true;
        }
        if let Some(s) = matches.get_one::<String>("stats-json-output") {
            self.stats_json_output = Some(s.clone());
        }
        if let Some(s) = matches.get_one::<String>("call-graph-output") {
            self.call_graph_output = Some(s.clone());
        }
        if let Some(s) = matches.get_one::<String>("vfg-output") {
            self.vfg_output = Some(s.clone());
        }

        args[extra_args_start..].to_vec()
    }
}

const CSR_USAGE: &str =
    r#"csr [-h] [-t] [-r] [-p] [-m pathtree|grail|pathtree+grail] [-n num] [-q file] [-g file] graph_file"#;

fn make_csr_parser() -> Command<'static> {
    Command::new("csr")
        .no_binary_name(true)
        .override_usage(CSR_USAGE)
        .arg(Arg::new("query-num")
            .short('n')
            .takes_value(true)
            .value_parser(clap::value_parser!(usize))
            .default_value("100")
            .help("Reachable and unreachable queries to generate, each."))
        .arg(Arg::new("grail-dim")
            .short('d')
            .takes_value(true)
            .value_parser(clap::value_parser!(usize))
            .default_value("2")
            .help("The number of GRAIL dimensions."))
        .arg(Arg::new("gen-query")
            .short('g')
            .takes_value(true)
            .help("Save the randomly generated queries into the file."))
        .arg(Arg::new("read-query")
            .short('q')
            .takes_value(true)
            .help("Read queries from the file."))
        .arg(Arg::new("epsilon")
            .short('e')
            .takes_value(true)
            .value_parser(clap::value_parser!(usize))
            .default_value("10")
            .help("The backbone coverage bound."))
        .arg(Arg::new("transitive-closure")
            .short('t')
            .takes_value(false)
            .help("Evaluate the whole transitive closure."))
        .arg(Arg::new("tabulation")
            .short('r')
            .takes_value(false)
            .help("Evaluate the sequential tabulation algorithm."))
        .arg(Arg::new("parallel")
            .short('p')
            .takes_value(false)
            .help("Evaluate the parallel tabulation algorithm."))
        .arg(Arg::new("threads")
            .short('j')
            .takes_value(true)
            .value_parser(clap::value_parser!(usize))
            .default_value("0")
            .help("Threads for parallel tabulation; 0 auto-detects."))
        .arg(Arg::new("indexing")
            .short('m')
            .takes_value(true)
            .value_parser(["pathtree", "grail", "pathtree+grail"])
            .default_value("grail")
            .help("The indexing approach to evaluate."))
        .arg(Arg::new("GRAPH")
            .required(true)
            .help("The graph file to be indexed."))
}

#[derive(Clone, Debug)]
pub struct CsrOptions {
    pub query_num: usize,
    pub grail_dim: usize,
    pub gen_query: Option<String>,
    pub read_query: Option<String>,
    pub epsilon: usize,
    pub transitive_closure: bool,
    pub tabulation: bool,
    pub parallel: bool,
    pub threads: usize,
    pub indexing: IndexingMethod,
    pub graph_file: String,
}

impl CsrOptions {
    pub fn parse_from_args(args: &[String]) -> CsrOptions {
        let matches = match make_csr_parser().try_get_matches_from(args.iter()) {
            Ok(matches) => matches,
            Err(e) => e.exit(),
        };
        let opts = CsrOptions {
            query_num: *matches.get_one::<usize>("query-num").unwrap(),
            grail_dim: *matches.get_one::<usize>("grail-dim").unwrap(),
            gen_query: matches.get_one::<String>("gen-query").cloned(),
            read_query: matches.get_one::<String>("read-query").cloned(),
            epsilon: *matches.get_one::<usize>("epsilon").unwrap(),
            transitive_closure: matches.contains_id("transitive-closure"),
            tabulation: matches.contains_id("tabulation"),
            parallel: matches.contains_id("parallel"),
            threads: *matches.get_one::<usize>("threads").unwrap(),
            indexing: IndexingMethod::parse(matches.get_one::<String>("indexing").unwrap())
                .expect("clap validated the value"),
            graph_file: matches.get_one::<String>("GRAPH").unwrap().clone(),
        };
        assert!(
            !(opts.gen_query.is_some() && opts.read_query.is_some()),
            "Do not use -g and -q together!"
        );
        opts
    }
}
