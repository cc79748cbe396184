//! Caller-facing summary of a finished run.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::core::state::{RawRunConfig, RunState};
use crate::core::types::{
    Decision, FatalError, StatusCounts, TerminalReason, TestResult, TestStatus, TriageEntry,
};
use crate::error::StepError;

/// Everything a caller learns about a run once it has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub suite: String,
    pub environment: String,
    /// Executions performed (0 when the configuration was rejected).
    pub attempt: u32,
    /// Budget as supplied by the caller; may be negative when rejected.
    pub max_retries: i64,
    pub terminal_reason: TerminalReason,
    pub counts: StatusCounts,
    pub results: Vec<TestResult>,
    pub triage: Option<Vec<TriageEntry>>,
    pub decision: Option<Decision>,
    pub error: Option<FatalError>,
    pub duration_ms: u64,
}

impl RunReport {
    /// Build the report from a terminal state. A state without a terminal
    /// reason is reported as a fatal error.
    pub fn from_state(run_id: &str, state: &RunState, duration_ms: u64) -> Self {
        Self {
            run_id: run_id.to_string(),
            suite: state.config.suite.clone(),
            environment: state.config.environment.clone(),
            attempt: state.attempt,
            max_retries: i64::from(state.config.max_retries),
            terminal_reason: state.terminal_reason.unwrap_or(TerminalReason::FatalError),
            counts: StatusCounts::from_results(&state.results),
            results: state.results.clone(),
            triage: state.triage.clone(),
            decision: state.decision.clone(),
            error: state.fatal.clone(),
            duration_ms,
        }
    }

    /// Report for a run whose configuration never got past Prepare.
    pub fn rejected_config(run_id: &str, raw: &RawRunConfig, err: &StepError) -> Self {
        Self {
            run_id: run_id.to_string(),
            suite: raw.suite.clone(),
            environment: raw.resolved_environment(),
            attempt: 0,
            max_retries: raw.max_retries,
            terminal_reason: TerminalReason::FatalError,
            counts: StatusCounts::default(),
            results: Vec::new(),
            triage: None,
            decision: None,
            error: Some(err.to_fatal()),
            duration_ms: 0,
        }
    }

    pub fn accepted(&self) -> bool {
        self.terminal_reason.is_accepted()
    }
}

/// Render a short human-readable summary for terminal output.
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "run {}: {} after {} attempt(s) (suite {}, environment {})",
        report.run_id, report.terminal_reason, report.attempt, report.suite, report.environment
    );
    let counts = &report.counts;
    if counts.total() > 0 {
        let _ = writeln!(
            out,
            "tests: {} passed, {} failed, {} errors, {} skipped",
            counts.pass, counts.fail, counts.error, counts.skipped
        );
    }
    for result in &report.results {
        if !matches!(result.status, TestStatus::Fail | TestStatus::Error) {
            continue;
        }
        let verdict = report
            .triage
            .iter()
            .flatten()
            .find(|entry| entry.test == result.name);
        match verdict {
            Some(entry) => {
                let _ = writeln!(out, "  {} [{}] {}", result.name, entry.verdict, entry.rationale);
            }
            None => {
                let _ = writeln!(out, "  {}", result.name);
            }
        }
    }
    if let Some(decision) = &report.decision {
        let label = if decision.accept { "accepted" } else { "rejected" };
        match &decision.note {
            Some(note) => {
                let _ = writeln!(out, "decision: {label} ({note})");
            }
            None => {
                let _ = writeln!(out, "decision: {label}");
            }
        }
    }
    if let Some(error) = &report.error {
        let _ = writeln!(out, "error: {}", error.message);
    }
    out
}
