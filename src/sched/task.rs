// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Units of scheduled work.
//!
//! Tasks are descriptions, not owners: callbacks borrow whatever analysis
//! state they need through the closure the scheduler wraps around them.

use std::fmt;

use crate::ir::FuncId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// Analyze one function.
    Function(FuncId),
    /// Release per-function state for a batch of finished functions.
    Gc(Vec<FuncId>),
    /// Anything else a client wants on the pool.
    Custom(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub kind: TaskKind,
    pub weight: u32,
}

impl Task {
    pub fn function(func: FuncId) -> Task {
        Task {
            kind: TaskKind::Function(func),
            weight: 1,
        }
    }

    pub fn gc(funcs: Vec<FuncId>) -> Task {
        let weight = funcs.len() as u32;
        Task {
            kind: TaskKind::Gc(funcs),
            weight,
        }
    }

    pub fn custom(name: &str) -> Task {
        Task {
            kind: TaskKind::Custom(name.to_string()),
            weight: 1,
        }
    }

    pub fn is_gc(&self) -> bool {
        matches!(self.kind, TaskKind::Gc(_))
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TaskKind::Function(func) => write!(f, "function task {:?}", func),
            TaskKind::Gc(funcs) => write!(f, "gc task ({} functions)", funcs.len()),
            TaskKind::Custom(name) => write!(f, "custom task `{}`", name),
        }
    }
}
