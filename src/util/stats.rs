// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Per-module counters for conservative fallbacks and query traffic.
//!
//! Queries never fail; whenever an engine degrades to a conservative answer
//! it records the event here. The counters are shared across threads and
//! snapshot into a serializable summary for dumping.

use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::info;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct AnalysisStats {
    /// External calls without an alias model; the universal node absorbed
    /// their effects.
    pub model_missing: AtomicUsize,
    /// Alias queries that touched the universal class and were collapsed to
    /// a MayAlias answer.
    pub universal_queries: AtomicUsize,
    /// Reachability queries answered by an incomplete index in fallback mode.
    pub incomplete_index_queries: AtomicUsize,
    /// Indirect call sites resolved by address-taken matching.
    pub indirect_resolved: AtomicUsize,
    /// Indirect call sites with no compatible address-taken target.
    pub indirect_unresolved: AtomicUsize,
    /// Queries served by the ad hoc online slicer.
    pub online_queries: AtomicUsize,
    /// Must-alias requests that degraded to a may answer.
    pub imprecise_must_queries: AtomicUsize,
}

/// A point-in-time copy of [`AnalysisStats`] suitable for serialization.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSummary {
    pub model_missing: usize,
    pub universal_queries: usize,
    pub incomplete_index_queries: usize,
    pub indirect_resolved: usize,
    pub indirect_unresolved: usize,
    pub online_queries: usize,
    pub imprecise_must_queries: usize,
}

impl AnalysisStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSummary {
        StatsSummary {
            model_missing: self.model_missing.load(Ordering::Relaxed),
            universal_queries: self.universal_queries.load(Ordering::Relaxed),
            incomplete_index_queries: self.incomplete_index_queries.load(Ordering::Relaxed),
            indirect_resolved: self.indirect_resolved.load(Ordering::Relaxed),
            indirect_unresolved: self.indirect_unresolved.load(Ordering::Relaxed),
            online_queries: self.online_queries.load(Ordering::Relaxed),
            imprecise_must_queries: self.imprecise_must_queries.load(Ordering::Relaxed),
        }
    }

    /// Dumps a human-readable block to the given writer.
    pub fn dump<W: Write>(&self, writer: &mut BufWriter<W>, analysis_time: Duration) {
        info!("Dumping analysis statistics...");
        let s = self.snapshot();
        writer
            .write_all("##########################################################\n".as_bytes())
            .expect("Unable to write data");
        writer
            .write_all(
                format!(
                    "Analysis time: {}\n",
                    humantime::format_duration(analysis_time)
                )
                .as_bytes(),
            )
            .expect("Unable to write data");
        writer
            .write_all(format!("#Unmodeled externals: {}\n", s.model_missing).as_bytes())
            .expect("Unable to write data");
        writer
            .write_all(format!("#Universal-class queries: {}\n", s.universal_queries).as_bytes())
            .expect("Unable to write data");
        writer
            .write_all(
                format!(
                    "#Indirect calls resolved/unresolved: {}/{}\n",
                    s.indirect_resolved, s.indirect_unresolved
                )
                .as_bytes(),
            )
            .expect("Unable to write data");
        writer
            .write_all(format!("#Online queries: {}\n", s.online_queries).as_bytes())
            .expect("Unable to write data");
        writer
            .write_all(
                format!(
                    "#Fallback-mode index queries: {}\n",
                    s.incomplete_index_queries
                )
                .as_bytes(),
            )
            .expect("Unable to write data");
        writer
            .write_all("##########################################################\n".as_bytes())
            .expect("Unable to write data");
    }

    /// Dumps the snapshot as pretty-printed JSON.
    pub fn dump_json<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let summary = self.snapshot();
        let text = serde_json::to_string_pretty(&summary).expect("stats are always serializable");
        writer.write_all(text.as_bytes())?;
        writer.write_all(b"\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let stats = AnalysisStats::new();
        AnalysisStats::bump(&stats.model_missing);
        AnalysisStats::bump(&stats.model_missing);
        AnalysisStats::bump(&stats.online_queries);
        let s = stats.snapshot();
        assert_eq!(s.model_missing, 2);
        assert_eq!(s.online_queries, 1);
        assert_eq!(s.universal_queries, 0);
    }

    #[test]
    fn json_dump_is_valid() {
        let stats = AnalysisStats::new();
        AnalysisStats::bump(&stats.indirect_resolved);
        let mut buf = Vec::new();
        stats.dump_json(&mut buf).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed["indirect_resolved"], 1);
    }
}
