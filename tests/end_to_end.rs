// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.
//
// End-to-end scenarios across the whole pipeline: IR -> alias -> VFG ->
// reachability index -> value-flow analysis.

use std::sync::Arc;

use ruvfa::alias::{AliasAnalysis, AliasResult};
use ruvfa::graph::call_graph::{build_call_graph, CallGraph};
use ruvfa::gvfa::checker::VulnerabilityChecker;
use ruvfa::gvfa::taint_config::TaintConfig;
use ruvfa::gvfa::{AnalysisMode, GlobalValueFlowAnalysis};
use ruvfa::ir::{Module, TypeInfo, ValueId};
use ruvfa::reach::index::{BuildOptions, ReachIndex};
use ruvfa::reach::tabulation::Tabulation;
use ruvfa::util::stats::AnalysisStats;
use ruvfa::util::CancellationToken;
use ruvfa::vfg::{Vfg, VfgBuilder};

fn analyze(module: &Module) -> (CallGraph, AliasAnalysis, Vfg) {
    let stats = Arc::new(AnalysisStats::new());
    let cg = build_call_graph(module, &stats);
    let alias = AliasAnalysis::build(module, &cg, stats).unwrap();
    let vfg = VfgBuilder::new(module, &alias, &cg).build();
    (cg, alias, vfg)
}

fn build_index(vfg: &Vfg) -> ReachIndex {
    ReachIndex::build(
        vfg.to_reach_graph(),
        &BuildOptions::default(),
        &CancellationToken::new(),
        Arc::new(AnalysisStats::new()),
    )
    .unwrap()
}

fn vfg_vertex(vfg: &Vfg, v: ValueId) -> u32 {
    vfg.node_of(v).expect("value must be in the VFG").0
}

#[test]
fn unrelated_allocas_stay_apart() {
    let mut m = Module::new("t");
    let f = m.define_function("f", &[], TypeInfo::void());
    let mut b = m.build_function(f);
    let bb0 = b.block();
    let bb1 = b.block();
    b.br(bb0, bb1);
    let a = b.alloca(bb0);
    let c = b.alloca(bb1);
    b.ret(bb1, None);

    let (_cg, alias, vfg) = analyze(&m);
    assert_eq!(alias.may_alias(&m, a, c), AliasResult::NoAlias);
    assert_eq!(alias.may_alias(&m, c, a), AliasResult::NoAlias);

    // No flow between them either.
    if let (Some(na), Some(nc)) = (vfg.node_of(a), vfg.node_of(c)) {
        let index = build_index(&vfg);
        assert!(!index.reach(na.0, nc.0));
        assert!(!index.reach(nc.0, na.0));
    }
}

#[test]
fn store_load_flow_is_indexed() {
    // p = &a (alloca); q = p; *q = one; x = *p
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

    let index = build_index(&vfg);
    assert!(index.reach(vfg_vertex(&vfg, one), vfg_vertex(&vfg, x)));
    assert!(!index.reach(vfg_vertex(&vfg, x), vfg_vertex(&vfg, one)));
}

#[test]
fn call_site_labels_match_up() {
    // foo(q) returns q; caller passes p at one call site.
    let mut m = Module::new("t");
    let foo = m.define_function("foo", &[TypeInfo::pointer()], TypeInfo::pointer());
    let mut b = m.build_function(foo);
    let bb = b.block();
    let q = b.param(0);
    b.ret(bb, Some(q));

    let caller = m.define_function("caller", &[TypeInfo::pointer()], TypeInfo::pointer());
    let mut b = m.build_function(caller);
    let bb = b.block();
    let p = b.param(0);
    let result = b.call(bb, foo, &[p], TypeInfo::pointer());
    b.ret(bb, Some(result));

    let (_cg, _alias, vfg) = analyze(&m);
    let k = vfg.edge_label(p, q).expect("argument edge");
    assert!(k > 0);
    assert_eq!(vfg.edge_label(q, result), Some(-k));

    // Online tabulation accepts p -> result with the stack passing
    // through [k] and back to [].
    let graph = vfg.to_reach_graph();
    let tab = Tabulation::new(&graph);
    assert!(tab.reach(vfg_vertex(&vfg, p), vfg_vertex(&vfg, result)));

    // And the offline index agrees.
    let index = build_index(&vfg);
    assert!(index.reach(vfg_vertex(&vfg, p), vfg_vertex(&vfg, result)));
}

#[test]
fn getenv_to_strcpy_taint_is_reported() {
    let mut m = Module::new("t");
    let getenv = m.declare_function("getenv", &[TypeInfo::pointer()], TypeInfo::pointer(), false);
    let strcpy = m.declare_function(
        "strcpy",
        &[TypeInfo::pointer(), TypeInfo::pointer()],
        TypeInfo::pointer(),
        false,
    );
    let main = m.define_function("main", &[TypeInfo::pointer()], TypeInfo::void());
    let mut b = m.build_function(main);
    let bb = b.block();
    let name = b.param(0);
    let env = b.call(bb, getenv, &[name], TypeInfo::pointer());
    let cleaned = b.bitcast(bb, env);
    let dst = b.alloca(bb);
    b.call(bb, strcpy, &[dst, cleaned], TypeInfo::pointer());
    b.ret(bb, None);

    let (_cg, alias, vfg) = analyze(&m);
    let config =
        TaintConfig::from_str_contents("SOURCE getenv Ret V T\nSINK strcpy Arg1 V T\n").unwrap();
    let mut gvfa = GlobalValueFlowAnalysis::new(
        &m,
        &vfg,
        &alias,
        VulnerabilityChecker::Taint(config),
        AnalysisMode::Comprehensive,
        false,
        CancellationToken::new(),
    );
    gvfa.run();

    assert!(gvfa.src_reachable(cleaned, env));
    assert!(gvfa.backward_reachable(env));
    assert!(gvfa.backward_reachable_all_sinks(env));
}

#[test]
fn sanitizer_veto_blocks_taint() {
    // The tainted value only reaches the sink through `sanitize`.
    let mut m = Module::new("t");
    let getenv = m.declare_function("getenv", &[TypeInfo::pointer()], TypeInfo::pointer(), false);
    let strcpy = m.declare_function(
        "strcpy",
        &[TypeInfo::pointer(), TypeInfo::pointer()],
        TypeInfo::pointer(),
        false,
    );
    let sanitize = m.define_function("sanitize", &[TypeInfo::pointer()], TypeInfo::pointer());
    let mut b = m.build_function(sanitize);
    let bb = b.block();
    let sp = b.param(0);
    b.ret(bb, Some(sp));

    let main = m.define_function("main", &[TypeInfo::pointer()], TypeInfo::void());
    let mut b = m.build_function(main);
    let bb = b.block();
    let name = b.param(0);
    let env = b.call(bb, getenv, &[name], TypeInfo::pointer());
    let clean = b.call(bb, sanitize, &[env], TypeInfo::pointer());
    let dst = b.alloca(bb);
    b.call(bb, strcpy, &[dst, clean], TypeInfo::pointer());
    b.ret(bb, None);

    let (_cg, alias, vfg) = analyze(&m);
    let config = TaintConfig::from_str_contents(
        "SOURCE getenv Ret V T\nSINK strcpy Arg1 V T\nIGNORE sanitize\n",
    )
    .unwrap();
    let mut gvfa = GlobalValueFlowAnalysis::new(
        &m,
        &vfg,
        &alias,
        VulnerabilityChecker::Taint(config),
        AnalysisMode::Comprehensive,
        false,
        CancellationToken::new(),
    );
    gvfa.run();

    assert!(
        !gvfa.src_reachable(clean, env),
        "flow through the sanitizer must be vetoed"
    );
}

#[test]
fn alias_extension_widens_sources() {
    // A source value's alias class members inherit its reachability.
    let mut m = Module::new("t");
    let getenv = m.declare_function("getenv", &[TypeInfo::pointer()], TypeInfo::pointer(), false);
    let main = m.define_function("main", &[TypeInfo::pointer()], TypeInfo::void());
    let mut b = m.build_function(main);
    let bb = b.block();
    let name = b.param(0);
    let env = b.call(bb, getenv, &[name], TypeInfo::pointer());
    let copy = b.bitcast(bb, env);
    b.ret(bb, None);

    let (_cg, alias, vfg) = analyze(&m);
    let config = TaintConfig::from_str_contents("SOURCE getenv Ret V T\n").unwrap();
    let mut gvfa = GlobalValueFlowAnalysis::new(
        &m,
        &vfg,
        &alias,
        VulnerabilityChecker::Taint(config),
        AnalysisMode::Optimized,
        false,
        CancellationToken::new(),
    );
    gvfa.run();

    // The copy aliases the source, so its mask is at least the source's.
    let env_bits = gvfa.reachable(env, u32::MAX);
    let copy_bits = gvfa.reachable(copy, u32::MAX);
    assert_ne!(env_bits, 0);
    assert_eq!(copy_bits & env_bits, env_bits);
}

#[test]
fn empty_module_is_a_no_op() {
    let m = Module::new("empty");
    let (cg, alias, vfg) = analyze(&m);
    assert!(cg.func_nodes.is_empty());
    assert_eq!(vfg.num_nodes(), 0);
    // Queries against values the analysis never saw degrade gracefully.
    assert_eq!(alias.points_to_set(ValueId(0)), Vec::new());

    let index = build_index(&vfg);
    assert!(index.is_complete());
}

#[test]
fn variadic_call_with_fewer_actuals() {
    let mut m = Module::new("t");
    let varfn = m.define_variadic_function(
        "varfn",
        &[TypeInfo::pointer(), TypeInfo::pointer(), TypeInfo::pointer()],
        TypeInfo::void(),
    );
    let mut b = m.build_function(varfn);
    let bb = b.block();
    b.ret(bb, None);

    let main = m.define_function("main", &[TypeInfo::pointer()], TypeInfo::void());
    let mut b = m.build_function(main);
    let bb = b.block();
    let p = b.param(0);
    // One actual against three formals: only the overlap gets edges.
    b.call(bb, varfn, &[p], TypeInfo::void());
    b.ret(bb, None);

    let (_cg, _alias, vfg) = analyze(&m);
    let formal0 = m.func(varfn).params[0];
    let formal1 = m.func(varfn).params[1];
    assert!(vfg.has_edge(p, formal0));
    assert!(!vfg.has_edge(p, formal1));
}

#[test]
fn optimized_and_comprehensive_modes_agree() {
    let mut m = Module::new("t");
    let getenv = m.declare_function("getenv", &[TypeInfo::pointer()], TypeInfo::pointer(), false);
    let sinkfn = m.declare_function("use", &[TypeInfo::pointer()], TypeInfo::void(), false);
    let main = m.define_function("main", &[TypeInfo::pointer()], TypeInfo::void());
    let mut b = m.build_function(main);
    let bb = b.block();
    let name = b.param(0);
    let env = b.call(bb, getenv, &[name], TypeInfo::pointer());
    let c1 = b.bitcast(bb, env);
    let c2 = b.gep_zero(bb, c1);
    let lone = b.alloca(bb);
    b.call(bb, sinkfn, &[c2], TypeInfo::void());
    b.ret(bb, None);

    let (_cg, alias, vfg) = analyze(&m);
    let config =
        TaintConfig::from_str_contents("SOURCE getenv Ret V T\nSINK use Arg0 V T\n").unwrap();

    let mut opt = GlobalValueFlowAnalysis::new(
        &m,
        &vfg,
        &alias,
        VulnerabilityChecker::Taint(config.clone()),
        AnalysisMode::Optimized,
        false,
        CancellationToken::new(),
    );
    opt.run();
    let mut comp = GlobalValueFlowAnalysis::new(
        &m,
        &vfg,
        &alias,
        VulnerabilityChecker::Taint(config),
        AnalysisMode::Comprehensive,
        false,
        CancellationToken::new(),
    );
    comp.run();

    for v in [env, c1, c2, lone, name] {
        let opt_hit = opt.reachable(v, u32::MAX) != 0;
        let comp_hit = comp
            .sources()
            .iter()
            .any(|(src, _)| comp.src_reachable(v, *src));
        assert_eq!(opt_hit, comp_hit, "modes disagree on {:?}", v);
    }
}
