//! Shared deterministic types for the orchestration core.
//!
//! These types define the stable contract between steps and the caller-facing
//! report. They carry no I/O and serialize to stable JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a single UI test as reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Skipped,
}

impl TestStatus {
    /// True for outcomes that need triage (`fail` and `error`).
    ///
    /// Skipped tests were deliberately not run and are not triaged.
    pub fn needs_triage(self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::Error)
    }
}

/// A single parsed test outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
    #[serde(default)]
    pub detail: String,
}

/// Classification of a failing test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    LikelyFlaky,
    LikelyRegression,
    Inconclusive,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::LikelyFlaky => "likely_flaky",
            Verdict::LikelyRegression => "likely_regression",
            Verdict::Inconclusive => "inconclusive",
        };
        f.write_str(label)
    }
}

/// Verdict and rationale for one non-pass test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageEntry {
    pub test: String,
    pub verdict: Verdict,
    pub rationale: String,
}

/// Outcome of the approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub accept: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Decision {
    pub fn accept(note: impl Into<String>) -> Self {
        Self {
            accept: true,
            note: Some(note.into()),
        }
    }

    pub fn reject(note: impl Into<String>) -> Self {
        Self {
            accept: false,
            note: Some(note.into()),
        }
    }
}

/// Why a run ended. Present on every finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    AllPassed,
    ApprovedAfterRetry,
    RetriesExhausted,
    FatalError,
}

impl TerminalReason {
    /// True when the run ended with an accepted decision.
    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            TerminalReason::AllPassed | TerminalReason::ApprovedAfterRetry
        )
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TerminalReason::AllPassed => "all_passed",
            TerminalReason::ApprovedAfterRetry => "approved_after_retry",
            TerminalReason::RetriesExhausted => "retries_exhausted",
            TerminalReason::FatalError => "fatal_error",
        };
        f.write_str(label)
    }
}

/// Category of a fatal step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Execution,
    Parse,
    ApprovalTimeout,
    Approval,
    Cancelled,
}

/// Diagnostic record of the error that ended a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-status tallies for a result set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn from_results(results: &[TestResult]) -> Self {
        let mut counts = Self::default();
        for result in results {
            counts.record(result.status);
        }
        counts
    }

    pub fn record(&mut self, status: TestStatus) {
        match status {
            TestStatus::Pass => self.pass += 1,
            TestStatus::Fail => self.fail += 1,
            TestStatus::Error => self.error += 1,
            TestStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.error + self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdicts_serialize_snake_case() {
        let json = serde_json::to_string(&Verdict::LikelyRegression).expect("serialize");
        assert_eq!(json, "\"likely_regression\"");
        assert_eq!(Verdict::LikelyFlaky.to_string(), "likely_flaky");
    }

    #[test]
    fn only_fail_and_error_need_triage() {
        assert!(TestStatus::Fail.needs_triage());
        assert!(TestStatus::Error.needs_triage());
        assert!(!TestStatus::Pass.needs_triage());
        assert!(!TestStatus::Skipped.needs_triage());
    }

    #[test]
    fn status_counts_tally_each_status() {
        let results = vec![
            TestResult {
                name: "a".to_string(),
                status: TestStatus::Pass,
                detail: String::new(),
            },
            TestResult {
                name: "b".to_string(),
                status: TestStatus::Fail,
                detail: "boom".to_string(),
            },
            TestResult {
                name: "c".to_string(),
                status: TestStatus::Skipped,
                detail: String::new(),
            },
        ];
        let counts = StatusCounts::from_results(&results);
        assert_eq!(counts.pass, 1);
        assert_eq!(counts.fail, 1);
        assert_eq!(counts.error, 0);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.total(), 3);
    }
}
