//! Run configuration and the per-run state record.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::types::{Decision, FatalError, TerminalReason, TestResult, TriageEntry};

/// Caller-supplied configuration before validation.
///
/// `max_retries` is signed so that a negative budget can be reported instead
/// of silently wrapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRunConfig {
    pub suite: String,
    pub environment: String,
    pub max_retries: i64,
    /// Extra key/value pairs passed through to the execution collaborator.
    pub overrides: BTreeMap<String, String>,
}

impl RawRunConfig {
    /// Trimmed environment identifier; blank means `local`.
    pub fn resolved_environment(&self) -> String {
        match self.environment.trim() {
            "" => "local".to_string(),
            env => env.to_string(),
        }
    }
}

/// Validated run configuration. Read-only once a run has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub suite: String,
    pub environment: String,
    pub max_retries: u32,
    pub overrides: BTreeMap<String, String>,
}

impl RunConfig {
    /// Total number of executions the budget allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Captured output of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutput {
    /// Runner stdout; this is what gets parsed.
    pub text: String,
    /// Runner stderr, kept for diagnostics.
    pub stderr: String,
    /// Exit code, `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

/// The record threaded through every step of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub config: RunConfig,
    /// Number of execution attempts so far (the first execution is attempt 1).
    pub attempt: u32,
    pub raw_output: Option<RawOutput>,
    pub results: Vec<TestResult>,
    pub triage: Option<Vec<TriageEntry>>,
    pub decision: Option<Decision>,
    pub terminal_reason: Option<TerminalReason>,
    /// Error that ended the run, when `terminal_reason` is `fatal_error`.
    pub fatal: Option<FatalError>,
}

impl RunState {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            attempt: 0,
            raw_output: None,
            results: Vec::new(),
            triage: None,
            decision: None,
            terminal_reason: None,
            fatal: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_reason.is_some()
    }

    /// Clear every field that belongs to a single attempt.
    pub(crate) fn clear_attempt(&mut self) {
        self.raw_output = None;
        self.results.clear();
        self.triage = None;
        self.decision = None;
    }
}

/// Check the state invariants that types alone cannot express:
/// - `attempt <= max_retries + 1`
/// - results only exist alongside the raw output they came from
/// - triage entries reference non-pass tests of the current results, in order
/// - a decision only exists after triage
/// - `fatal` is set iff the run ended with `fatal_error`
pub fn validate_invariants(state: &RunState) -> Vec<String> {
    let mut errors = Vec::new();

    if state.attempt > state.config.max_attempts() {
        errors.push(format!(
            "attempt {} exceeds max_retries + 1 ({})",
            state.attempt,
            state.config.max_attempts()
        ));
    }

    if !state.results.is_empty() && state.raw_output.is_none() {
        errors.push("results present without raw_output".to_string());
    }

    if let Some(triage) = &state.triage {
        let positions: HashMap<&str, usize> = state
            .results
            .iter()
            .enumerate()
            .filter(|(_, result)| result.status.needs_triage())
            .map(|(idx, result)| (result.name.as_str(), idx))
            .collect();
        let mut last = None;
        for entry in triage {
            match positions.get(entry.test.as_str()) {
                None => errors.push(format!(
                    "triage references '{}' which is not a non-pass result",
                    entry.test
                )),
                Some(&pos) => {
                    if last.is_some_and(|prev| pos <= prev) {
                        errors.push(format!("triage entry '{}' is out of order", entry.test));
                    }
                    last = Some(pos);
                }
            }
        }
    }

    if state.decision.is_some() && state.triage.is_none() {
        errors.push("decision present without triage".to_string());
    }

    let fatal_reason = state.terminal_reason == Some(TerminalReason::FatalError);
    if fatal_reason != state.fatal.is_some() {
        errors.push("fatal error must be attached iff terminal_reason is fatal_error".to_string());
    }

    errors
}
