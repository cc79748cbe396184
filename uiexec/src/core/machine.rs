//! Fixed orchestration topology.
//!
//! ```text
//! prepare -> execute -> parse -> triage -> approve -+-> terminated
//!               ^                                   |
//!               +-------------- retry <-------------+
//! ```
//!
//! `retry -> execute` is the only back-edge.

use std::fmt;

use serde::Serialize;

use crate::core::router::Route;

/// Named states of the orchestration machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Execute,
    Parse,
    Triage,
    Approve,
    Retry,
    Terminated,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Execute => "execute",
            Stage::Parse => "parse",
            Stage::Triage => "triage",
            Stage::Approve => "approve",
            Stage::Retry => "retry",
            Stage::Terminated => "terminated",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every edge of the topology as `(from, to)`.
pub const TRANSITIONS: &[(Stage, Stage)] = &[
    (Stage::Prepare, Stage::Execute),
    (Stage::Execute, Stage::Parse),
    (Stage::Parse, Stage::Triage),
    (Stage::Triage, Stage::Approve),
    (Stage::Approve, Stage::Retry),
    (Stage::Approve, Stage::Terminated),
    (Stage::Retry, Stage::Execute),
];

/// Next stage after `from` completes. `route` is only consulted after Approve;
/// a missing route there terminates.
pub fn next_stage(from: Stage, route: Option<Route>) -> Stage {
    match (from, route) {
        (Stage::Prepare, _) => Stage::Execute,
        (Stage::Execute, _) => Stage::Parse,
        (Stage::Parse, _) => Stage::Triage,
        (Stage::Triage, _) => Stage::Approve,
        (Stage::Approve, Some(Route::Retry)) => Stage::Retry,
        (Stage::Approve, Some(Route::Terminate(_)) | None) => Stage::Terminated,
        (Stage::Retry, _) => Stage::Execute,
        (Stage::Terminated, _) => Stage::Terminated,
    }
}
