// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.
//
// Randomized cross-validation of the offline index against the online
// tabulation solver, including the serialize/reload round trip.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use ruvfa::reach::graph::Graph;
use ruvfa::reach::index::{BuildOptions, IndexingMethod, ReachIndex};
use ruvfa::reach::parallel::ParallelTabulation;
use ruvfa::reach::tabulation::Tabulation;
use ruvfa::util::bit_vec::BitVec;
use ruvfa::util::stats::AnalysisStats;
use ruvfa::util::CancellationToken;

/// A random graph shaped like a call structure: layered direct edges, plus
/// matched +k/-k pairs bracketing random "callee" regions.
fn random_call_graph(rng: &mut StdRng, n: u32, call_sites: i32) -> Graph {
    let mut g = Graph::with_vertices(n as usize);
    // Random direct edges, dense enough to contain cycles.
    for _ in 0..3 * n {
        let a = rng.gen_range(0..n);
        let b = rng.gen_range(0..n);
        if a != b {
            g.add_edge(a, b, 0);
        }
    }
    for k in 1..=call_sites {
        let caller = rng.gen_range(0..n);
        let entry = rng.gen_range(0..n);
        let exit = rng.gen_range(0..n);
        let result = rng.gen_range(0..n);
        g.add_edge(caller, entry, k);
        g.add_edge(exit, result, -k);
    }
    g
}

fn build(graph: Graph, method: IndexingMethod) -> ReachIndex {
    ReachIndex::build(
        graph,
        &BuildOptions {
            method,
            epsilon: 4,
            ..Default::default()
        },
        &CancellationToken::new(),
        Arc::new(AnalysisStats::new()),
    )
    .unwrap()
}

#[test]
fn indexed_answers_match_sequential_tabulation() {
    let mut rng = StdRng::seed_from_u64(17);
    for round in 0..8 {
        let n = 24;
        let graph = random_call_graph(&mut rng, n, 5);
        let truth_graph = graph.clone();
        let truth = Tabulation::new(&truth_graph);

        for method in [
            IndexingMethod::Grail,
            IndexingMethod::PathTree,
            IndexingMethod::PathTreeAndGrail,
        ] {
            let index = build(graph.clone(), method);
            for _ in 0..200 {
                let s = rng.gen_range(0..n);
                let t = rng.gen_range(0..n);
                assert_eq!(
                    index.reach(s, t),
                    truth.reach(s, t),
                    "round {} method {:?}: {} -> {}",
                    round,
                    method,
                    s,
                    t
                );
            }
        }
    }
}

#[test]
fn serialize_reload_rebuild_answers_identically() {
    let mut rng = StdRng::seed_from_u64(23);
    let n = 30;
    let graph = random_call_graph(&mut rng, n, 6);

    let index = build(graph.clone(), IndexingMethod::PathTreeAndGrail);
    let reloaded = Graph::from_text(&graph.to_text()).unwrap();
    let index2 = build(reloaded, IndexingMethod::PathTreeAndGrail);

    let mut queries = Vec::new();
    for _ in 0..1000 {
        queries.push((rng.gen_range(0..n), rng.gen_range(0..n)));
    }
    for (s, t) in queries {
        assert_eq!(index.reach(s, t), index2.reach(s, t), "{} -> {}", s, t);
    }
}

#[test]
fn parallel_closure_equals_sequential_closure() {
    let mut rng = StdRng::seed_from_u64(31);
    let mut graph = random_call_graph(&mut rng, 20, 4);
    graph.build_summary_edges(&CancellationToken::new()).unwrap();

    let seq = Tabulation::new(&graph);
    let par = ParallelTabulation::with_threads(&graph, 4, CancellationToken::new());
    let rows = par.closure_sets();
    for s in 0..graph.num_vertices() as u32 {
        let mut expected = BitVec::with_capacity(graph.num_vertices());
        seq.traverse(s, &mut expected);
        assert_eq!(rows[s as usize].as_ref().unwrap(), &expected, "source {}", s);
    }
}
