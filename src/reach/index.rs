// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The offline context-sensitive reachability index.
//!
//! Build pipeline: summary edges on the labeled graph, the two-copy
//! indexing graph, SCC condensation, then the configured label families
//! (GRAIL intervals and/or the backbone plus path tree). A query runs a
//! four-level filter: representative equality, GRAIL refutation, the
//! backbone decision, and finally online tabulation over the summarized
//! graph. The index is immutable once built; an incomplete build leaves a
//! flag behind and every query degrades to the conservative answer.

use std::sync::Arc;

use log::info;

use crate::error::AnalysisResult;
use crate::reach::backbone::{Backbone, DEFAULT_EPSILON, DEFAULT_PROMOTION_PROBABILITY};
use crate::reach::grail::{Grail, DEFAULT_GRAIL_DIM};
use crate::reach::graph::Graph;
use crate::reach::path_tree::PathTree;
use crate::reach::scc::{merge_scc, SccResult};
use crate::reach::tabulation::Tabulation;
use crate::util::stats::AnalysisStats;
use crate::util::CancellationToken;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IndexingMethod {
    Grail,
    PathTree,
    PathTreeAndGrail,
}

impl IndexingMethod {
    pub fn parse(text: &str) -> Option<IndexingMethod> {
        match text {
            "grail" => Some(IndexingMethod::Grail),
            "pathtree" => Some(IndexingMethod::PathTree),
            "pathtree+grail" => Some(IndexingMethod::PathTreeAndGrail),
            _ => None,
        }
    }

    fn wants_grail(self) -> bool {
        matches!(self, IndexingMethod::Grail | IndexingMethod::PathTreeAndGrail)
    }

    fn wants_pathtree(self) -> bool {
        matches!(self, IndexingMethod::PathTree | IndexingMethod::PathTreeAndGrail)
    }
}

#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub method: IndexingMethod,
    pub grail_dim: usize,
    pub epsilon: usize,
    pub promotion_probability: f64,
    pub seed: u64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            method: IndexingMethod::PathTreeAndGrail,
            grail_dim: DEFAULT_GRAIL_DIM,
            epsilon: DEFAULT_EPSILON,
            promotion_probability: DEFAULT_PROMOTION_PROBABILITY,
            seed: 1,
        }
    }
}

struct BackboneIndex {
    backbone: Backbone,
    /// Path tree over the backbone graph's condensation.
    path_tree: PathTree,
    /// Backbone-graph vertex -> path-tree vertex.
    scc_of: Vec<u32>,
}

pub struct ReachIndex {
    /// The summarized original graph, kept for the online fallback.
    graph: Graph,
    orig_vertices: usize,
    scc: SccResult,
    grail: Option<Grail>,
    backbone: Option<BackboneIndex>,
    complete: bool,
    stats: Arc<AnalysisStats>,
}

impl ReachIndex {
    /// Builds the index, consuming the labeled graph. Cancellation aborts
    /// the build; the returned index then answers conservatively.
    pub fn build(
        mut graph: Graph,
        opts: &BuildOptions,
        cancel: &CancellationToken,
        stats: Arc<AnalysisStats>,
    ) -> AnalysisResult<ReachIndex> {
        let orig_vertices = graph.num_vertices();
        graph.build_summary_edges(cancel)?;

        let ig = graph.to_indexing_graph();
        let scc = merge_scc(&ig);
        info!(
            "indexing graph: {} vertices, condensation {}",
            ig.num_vertices(),
            scc.num_sccs
        );

        let grail = if opts.method.wants_grail() {
            Some(Grail::build(&scc.condensation, opts.grail_dim, opts.seed))
        } else {
            None
        };

        let backbone = if opts.method.wants_pathtree() {
            let anchors = Self::anchor_set(&graph, &scc, orig_vertices);
            let bb = Backbone::discover(
                &scc.condensation,
                &anchors,
                opts.epsilon,
                opts.promotion_probability,
                opts.seed,
            );
            let bb_scc = merge_scc(&bb.graph);
            let path_tree = PathTree::build(&bb_scc.condensation);
            Some(BackboneIndex {
                backbone: bb,
                path_tree,
                scc_of: bb_scc.scc_of,
            })
        } else {
            None
        };

        Ok(ReachIndex {
            graph,
            orig_vertices,
            scc,
            grail,
            backbone,
            complete: true,
            stats,
        })
    }

    /// A placeholder index for aborted builds: remembers the graph and
    /// answers every query conservatively.
    pub fn incomplete(graph: Graph, stats: Arc<AnalysisStats>) -> ReachIndex {
        let orig_vertices = graph.num_vertices();
        let empty = Graph::new();
        let scc = merge_scc(&empty);
        ReachIndex {
            graph,
            orig_vertices,
            scc,
            grail: None,
            backbone: None,
            complete: false,
            stats,
        }
    }

    /// Anchors for backbone discovery: every condensation vertex touching a
    /// call or return edge of the original graph, in both copies.
    fn anchor_set(graph: &Graph, scc: &SccResult, orig_vertices: usize) -> Vec<u32> {
        let n = orig_vertices as u32;
        let mut anchors = Vec::new();
        for v in 0..n {
            for (w, l) in graph.out_edges(v) {
                if *l != 0 {
                    anchors.push(scc.rep(v));
                    anchors.push(scc.rep(v + n));
                    anchors.push(scc.rep(*w));
                    anchors.push(scc.rep(*w + n));
                }
            }
        }
        anchors.sort_unstable();
        anchors.dedup();
        anchors
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn num_vertices(&self) -> usize {
        self.orig_vertices
    }

    /// The condensation representative of `v` on the source side.
    pub fn rep(&self, v: u32) -> u32 {
        self.scc.rep(v)
    }

    /// Matched reachability from `s` to `t` over the original vertex ids.
    pub fn reach(&self, s: u32, t: u32) -> bool {
        if !self.complete {
            AnalysisStats::bump(&self.stats.incomplete_index_queries);
            return true;
        }
        if s == t {
            return true;
        }
        let n = self.orig_vertices as u32;
        let src = self.scc.rep(s);
        let trg = self.scc.rep(t + n);

        // Level 1: same component.
        if src == trg {
            return true;
        }
        // Level 2: GRAIL refutation.
        if let Some(grail) = &self.grail {
            if !grail.contains(src, trg) {
                return false;
            }
        }
        // Level 3: backbone decision.
        if let Some(bb) = &self.backbone {
            return self.backbone_reach(bb, src, trg);
        }
        // Level 4: online tabulation over the summarized graph.
        Tabulation::new(&self.graph).reach_via_summaries(s, t)
    }

    fn backbone_reach(&self, bb: &BackboneIndex, src: u32, trg: u32) -> bool {
        // Short paths never meet the backbone; coverage bounds them.
        if bb
            .backbone
            .local_reach(&self.scc.condensation, src, trg, bb.backbone.epsilon)
        {
            return true;
        }
        for g1 in bb.backbone.out_gates(src) {
            let p1 = bb.scc_of[*g1 as usize];
            for g2 in bb.backbone.in_gates(trg) {
                let p2 = bb.scc_of[*g2 as usize];
                if bb.path_tree.reach(p1, p2) {
                    return true;
                }
            }
        }
        false
    }
}
