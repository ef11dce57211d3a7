// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The dense labeled multigraph the reachability machinery runs on.
//!
//! Vertices are plain `u32` indices. Labels follow the VFG convention:
//! `0` direct flow, `+k` opens call site `k`, `-k` closes it. Summary edges
//! produced by the matched-parenthesis closure are stored as additional
//! label-0 edges and remembered separately so later stages can reuse them.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{info, warn};
use nom::bytes::complete::tag;
use nom::character::complete::{digit1, one_of};
use nom::combinator::map_res;
use nom::sequence::tuple;
use nom::IResult;

use crate::error::{AnalysisError, AnalysisResult};
use crate::util::bit_vec::BitVec;
use crate::util::CancellationToken;

#[derive(Clone, Debug, Default)]
pub struct Graph {
    out: Vec<Vec<(u32, i32)>>,
    inc: Vec<Vec<(u32, i32)>>,
    num_edges: usize,
    summaries: Vec<(u32, u32)>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn with_vertices(n: usize) -> Self {
        Graph {
            out: vec![Vec::new(); n],
            inc: vec![Vec::new(); n],
            num_edges: 0,
            summaries: Vec::new(),
        }
    }

    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.out.len()
    }

    #[inline]
    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    #[inline]
    pub fn summary_edge_size(&self) -> usize {
        self.summaries.len()
    }

    pub fn summaries(&self) -> &[(u32, u32)] {
        &self.summaries
    }

    pub fn ensure_vertex(&mut self, v: u32) {
        let needed = v as usize + 1;
        if self.out.len() < needed {
            self.out.resize(needed, Vec::new());
            self.inc.resize(needed, Vec::new());
        }
    }

    /// Adds an edge unless the identical (endpoint, label) pair exists.
    /// Returns true when the edge is new.
    pub fn add_edge(&mut self, from: u32, to: u32, label: i32) -> bool {
        self.ensure_vertex(from.max(to));
        if self.out[from as usize].contains(&(to, label)) {
            return false;
        }
        self.out[from as usize].push((to, label));
        self.inc[to as usize].push((from, label));
        self.num_edges += 1;
        true
    }

    #[inline]
    pub fn out_edges(&self, v: u32) -> &[(u32, i32)] {
        &self.out[v as usize]
    }

    #[inline]
    pub fn in_edges(&self, v: u32) -> &[(u32, i32)] {
        &self.inc[v as usize]
    }

    /// The label of some edge `from -> to`, if present.
    pub fn label(&self, from: u32, to: u32) -> Option<i32> {
        self.out[from as usize]
            .iter()
            .find(|(t, _)| *t == to)
            .map(|(_, l)| *l)
    }

    /// Sanity-checks label pairing: every opened call site should close
    /// somewhere. Unpaired labels are tolerated (bodiless callees drop their
    /// edges) but logged.
    pub fn check(&self) {
        let mut opens = HashSet::new();
        let mut closes = HashSet::new();
        for v in 0..self.num_vertices() as u32 {
            for (_, l) in self.out_edges(v) {
                if *l > 0 {
                    opens.insert(*l);
                } else if *l < 0 {
                    closes.insert(-*l);
                }
            }
        }
        for k in opens.difference(&closes) {
            warn!("call site {} opens but never closes", k);
        }
    }

    /// The matched-parenthesis closure: adds a summary edge `u -> d` for
    /// every witnessed path `u -(+k)-> e ~~> r -(-k)-> d` whose middle part
    /// is balanced. Newly added summaries feed later passes until the set is
    /// stable. Returns the number of summaries on success; cancellation
    /// aborts the whole build.
    pub fn build_summary_edges(&mut self, cancel: &CancellationToken) -> AnalysisResult<usize> {
        // entry vertex -> (call source, call site id)
        let mut call_edges: HashMap<u32, Vec<(u32, i32)>> = HashMap::new();
        for v in 0..self.num_vertices() as u32 {
            for (t, l) in self.out_edges(v) {
                if *l > 0 {
                    call_edges.entry(*t).or_default().push((v, *l));
                }
            }
        }

        loop {
            let mut added = 0usize;
            let entries: Vec<u32> = call_edges.keys().copied().collect();
            for entry in entries {
                if cancel.is_cancelled() {
                    return Err(AnalysisError::BuildIncomplete(
                        "summary-edge closure cancelled".to_string(),
                    ));
                }
                // Balanced reachability from the entry: label-0 edges only,
                // which at this point includes earlier summaries.
                let mut visited = BitVec::with_capacity(self.num_vertices());
                let mut queue = VecDeque::new();
                visited.insert(entry);
                queue.push_back(entry);
                let mut closings: Vec<(u32, u32, i32)> = Vec::new();
                while let Some(v) = queue.pop_front() {
                    for (t, l) in self.out_edges(v) {
                        if *l == 0 {
                            if visited.insert(*t) {
                                queue.push_back(*t);
                            }
                        } else if *l < 0 {
                            closings.push((v, *t, -*l));
                        }
                    }
                }
                for (_, exit_target, k) in &closings {
                    for (caller, site) in &call_edges[&entry] {
                        if site == k && !self.out[*caller as usize].contains(&(*exit_target, 0)) {
                            self.out[*caller as usize].push((*exit_target, 0));
                            self.inc[*exit_target as usize].push((*caller, 0));
                            self.num_edges += 1;
                            self.summaries.push((*caller, *exit_target));
                            added += 1;
                        }
                    }
                }
            }
            if added == 0 {
                break;
            }
        }
        info!("{} summary edges", self.summary_edge_size());
        Ok(self.summary_edge_size())
    }

    /// Doubles the vertex set for indexing. Copy A (vertices `0..n`) keeps
    /// only balanced edges; copy B (vertices `n..2n`) keeps balanced and
    /// open edges; an epsilon edge links `v` to `v + n`. A matched path
    /// `s ~> t` (opens may stay pending, closes always match) exists exactly
    /// when `sA` reaches `tB`.
    pub fn to_indexing_graph(&self) -> Graph {
        let n = self.num_vertices() as u32;
        let mut ig = Graph::with_vertices(2 * n as usize);
        for v in 0..n {
            ig.add_edge(v, v + n, 0);
            for (t, l) in self.out_edges(v) {
                if *l == 0 {
                    ig.add_edge(v, *t, 0);
                    ig.add_edge(v + n, *t + n, 0);
                } else if *l > 0 {
                    ig.add_edge(v + n, *t + n, 0);
                }
            }
        }
        ig
    }

    /// Serializes to the persisted text format.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for v in 0..self.num_vertices() {
            text.push_str(&format!("{}[label=\"{}\"]\n", v, v));
        }
        for v in 0..self.num_vertices() as u32 {
            for (t, l) in self.out_edges(v) {
                let (sign, id) = if *l < 0 { ('c', -*l) } else { ('o', *l) };
                text.push_str(&format!("{}->{}[label=\"{}{}\"]\n", v, t, sign, id));
            }
        }
        text
    }

    /// Parses the persisted text format. Node lines declare vertices; edge
    /// lines carry `o<k>` (open, or `o0` for direct flow) or `c<k>` (close)
    /// labels.
    pub fn from_text(text: &str) -> AnalysisResult<Graph> {
        let mut graph = Graph::new();
        for (lineno, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.contains("->") {
                match edge_line(trimmed) {
                    Ok((_, (from, to, label))) => {
                        graph.add_edge(from, to, label);
                    }
                    Err(_) => {
                        return Err(AnalysisError::InputInvalid(format!(
                            "malformed edge at line {}: `{}`",
                            lineno + 1,
                            trimmed
                        )));
                    }
                }
            } else {
                match node_line(trimmed) {
                    Ok((_, v)) => graph.ensure_vertex(v),
                    Err(_) => {
                        return Err(AnalysisError::InputInvalid(format!(
                            "malformed node at line {}: `{}`",
                            lineno + 1,
                            trimmed
                        )));
                    }
                }
            }
        }
        Ok(graph)
    }
}

fn number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |s: &str| s.parse::<u32>())(input)
}

fn edge_line(input: &str) -> IResult<&str, (u32, u32, i32)> {
    let (rest, (from, _, to, _, sign, id, _)) = tuple((
        number,
        tag("->"),
        number,
        tag("[label=\""),
        one_of("oc"),
        number,
        tag("\"]"),
    ))(input)?;
    let label = match sign {
        'o' => id as i32,
        _ => -(id as i32),
    };
    Ok((rest, (from, to, label)))
}

fn node_line(input: &str) -> IResult<&str, u32> {
    let (rest, (v, _)) = tuple((number, tag("[")))(input)?;
    Ok((rest, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// caller -(+1)-> entry -(0)-> exit -(-1)-> result
    fn matched_graph() -> Graph {
        let mut g = Graph::new();
        g.add_edge(0, 1, 1);
        g.add_edge(1, 2, 0);
        g.add_edge(2, 3, -1);
        g
    }

    #[test]
    fn summary_edge_spans_matched_pair() {
        let mut g = matched_graph();
        let n = g.build_summary_edges(&CancellationToken::new()).unwrap();
        assert_eq!(n, 1);
        assert_eq!(g.summaries(), &[(0, 3)]);
        assert_eq!(g.label(0, 3), Some(0));
    }

    #[test]
    fn nested_calls_summarize_inside_out() {
        // 0 -(+1)-> 1 -(+2)-> 2 -(0)-> 3 -(-2)-> 4 -(-1)-> 5
        let mut g = Graph::new();
        g.add_edge(0, 1, 1);
        g.add_edge(1, 2, 2);
        g.add_edge(2, 3, 0);
        g.add_edge(3, 4, -2);
        g.add_edge(4, 5, -1);
        let n = g.build_summary_edges(&CancellationToken::new()).unwrap();
        assert_eq!(n, 2);
        // Inner summary 1 -> 4 enables the outer summary 0 -> 5.
        assert!(g.label(1, 4) == Some(0));
        assert!(g.label(0, 5) == Some(0));
    }

    #[test]
    fn mismatched_sites_do_not_summarize() {
        let mut g = Graph::new();
        g.add_edge(0, 1, 1);
        g.add_edge(1, 2, 0);
        g.add_edge(2, 3, -2);
        let n = g.build_summary_edges(&CancellationToken::new()).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn cancellation_aborts_the_build() {
        let mut g = matched_graph();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            g.build_summary_edges(&cancel),
            Err(AnalysisError::BuildIncomplete(_))
        ));
    }

    #[test]
    fn indexing_graph_separates_copies() {
        let mut g = matched_graph();
        g.build_summary_edges(&CancellationToken::new()).unwrap();
        let ig = g.to_indexing_graph();
        assert_eq!(ig.num_vertices(), 8);
        // The open edge only exists in copy B.
        assert_eq!(ig.label(0, 1), None);
        assert_eq!(ig.label(4, 5), Some(0));
        // The summary exists in both copies.
        assert_eq!(ig.label(0, 3), Some(0));
        assert_eq!(ig.label(4, 7), Some(0));
        // Epsilon edges bridge the copies.
        assert_eq!(ig.label(2, 6), Some(0));
    }

    #[test]
    fn text_round_trip() {
        let mut g = matched_graph();
        g.add_edge(3, 0, 0);
        let text = g.to_text();
        let parsed = Graph::from_text(&text).unwrap();
        assert_eq!(parsed.num_vertices(), g.num_vertices());
        assert_eq!(parsed.num_edges(), g.num_edges());
        assert_eq!(parsed.label(0, 1), Some(1));
        assert_eq!(parsed.label(2, 3), Some(-1));
        assert_eq!(parsed.label(3, 0), Some(0));
    }

    #[test]
    fn malformed_text_is_rejected() {
        assert!(Graph::from_text("1->2[label=\"x3\"]").is_err());
        assert!(Graph::from_text("not a line").is_err());
    }
}
