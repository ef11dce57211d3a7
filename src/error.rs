// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Error kinds shared by all builders.
//!
//! Builders return `Result<Artifact, AnalysisError>`. Queries never fail;
//! they degrade to the most conservative sound answer and bump a counter in
//! [`crate::util::stats::AnalysisStats`] instead.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The input module or graph file is unreadable or malformed.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// An external call had no alias model and the conservative fallback was
    /// taken. Surfaced as a counter during analysis; only reported as an
    /// error by tools that demand a fully modeled module.
    #[error("no alias model for external function `{0}`")]
    ModelMissing(String),

    /// Index construction was aborted (cancellation, memory pressure).
    /// Queries against the artifact run in fallback mode.
    #[error("index construction incomplete: {0}")]
    BuildIncomplete(String),

    /// A long-running operation hit its wall-clock budget. Partial results
    /// have been emitted where the operation supports them.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The must-alias rule set could not give a definite answer where the
    /// caller requested one.
    #[error("definite answer requested but only an approximation is available")]
    QueryImprecise,
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
