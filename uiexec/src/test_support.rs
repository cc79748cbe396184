//! Test-only fixtures and scripted collaborators.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::state::{RawOutput, RawRunConfig, RunConfig};
use crate::core::types::{Decision, TestResult, TestStatus, TriageEntry, Verdict};
use crate::error::{ApprovalError, ClassificationError};
use crate::io::approver::{ApprovalRequest, Approver};
use crate::io::classifier::{Classification, Classifier};
use crate::io::test_runner::{RunRequest, TestRunner};

/// Validated config for `suite` on the `staging` environment.
pub fn run_config(suite: &str, max_retries: u32) -> RunConfig {
    RunConfig {
        suite: suite.to_string(),
        environment: "staging".to_string(),
        max_retries,
        overrides: BTreeMap::new(),
    }
}

/// Unvalidated config, as a caller would hand it to Prepare.
pub fn raw_config(suite: &str, max_retries: i64) -> RawRunConfig {
    RawRunConfig {
        suite: suite.to_string(),
        environment: "staging".to_string(),
        max_retries,
        overrides: BTreeMap::new(),
    }
}

pub fn passing(name: &str) -> TestResult {
    TestResult {
        name: name.to_string(),
        status: TestStatus::Pass,
        detail: String::new(),
    }
}

pub fn failing(name: &str, detail: &str) -> TestResult {
    TestResult {
        name: name.to_string(),
        status: TestStatus::Fail,
        detail: detail.to_string(),
    }
}

pub fn entry(name: &str, verdict: Verdict) -> TriageEntry {
    TriageEntry {
        test: name.to_string(),
        verdict,
        rationale: format!("{name} looks {verdict}"),
    }
}

/// Render results as a JSON report the parser accepts.
pub fn json_report(results: &[TestResult]) -> String {
    serde_json::to_string(results).unwrap_or_default()
}

/// One scripted execution.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Return this text as runner stdout.
    Output(String),
    /// Return these results rendered as a JSON report.
    Results(Vec<TestResult>),
    /// Fail to launch.
    Fail(String),
    /// Fire the request's cancel token, then fail.
    Cancel,
}

/// Runner that replays a script. The last entry repeats once the script runs
/// out.
pub struct ScriptedRunner {
    script: Vec<ScriptedRun>,
    seen: Mutex<Vec<u32>>,
}

impl ScriptedRunner {
    pub fn new(script: Vec<ScriptedRun>) -> Self {
        Self {
            script,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Attempt numbers of every call so far.
    pub fn attempts_seen(&self) -> Vec<u32> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.attempts_seen().len()
    }
}

impl TestRunner for ScriptedRunner {
    fn run(&self, request: &RunRequest<'_>) -> Result<RawOutput> {
        let call = {
            let mut seen = self
                .seen
                .lock()
                .map_err(|_| anyhow!("scripted runner lock poisoned"))?;
            seen.push(request.attempt);
            seen.len() - 1
        };
        let step = self
            .script
            .get(call)
            .or_else(|| self.script.last())
            .ok_or_else(|| anyhow!("scripted runner has no script"))?;
        match step {
            ScriptedRun::Output(text) => Ok(RawOutput {
                text: text.clone(),
                stderr: String::new(),
                exit_code: Some(1),
            }),
            ScriptedRun::Results(results) => Ok(RawOutput {
                text: json_report(results),
                stderr: String::new(),
                exit_code: Some(i32::from(
                    results.iter().any(|result| result.status.needs_triage()),
                )),
            }),
            ScriptedRun::Fail(message) => Err(anyhow!("{message}")),
            ScriptedRun::Cancel => {
                request.cancel.cancel();
                Err(anyhow!("runner killed"))
            }
        }
    }
}

/// Classifier with per-test verdicts or errors and a fallback verdict.
pub struct ScriptedClassifier {
    fallback: Verdict,
    answers: HashMap<String, Result<Verdict, ClassificationError>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    pub fn new(fallback: Verdict) -> Self {
        Self {
            fallback,
            answers: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_verdict(mut self, test: &str, verdict: Verdict) -> Self {
        self.answers.insert(test.to_string(), Ok(verdict));
        self
    }

    pub fn with_error(mut self, test: &str, error: ClassificationError) -> Self {
        self.answers.insert(test.to_string(), Err(error));
        self
    }

    /// Test names classified so far, sorted (call order is not deterministic).
    pub fn calls(&self) -> Vec<String> {
        let mut calls = self
            .calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default();
        calls.sort();
        calls
    }
}

impl Classifier for ScriptedClassifier {
    fn classify(&self, test_name: &str, _detail: &str) -> Result<Classification, ClassificationError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(test_name.to_string());
        }
        let verdict = match self.answers.get(test_name) {
            Some(Ok(verdict)) => *verdict,
            Some(Err(err)) => return Err(err.clone()),
            None => self.fallback,
        };
        Ok(Classification {
            verdict,
            rationale: format!("scripted {verdict}"),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ScriptedApproval {
    Accept,
    Reject,
    Timeout,
}

/// Approver that replays a queue of answers and fails once it runs dry.
pub struct ScriptedApprover {
    answers: Mutex<VecDeque<ScriptedApproval>>,
    calls: Mutex<usize>,
}

impl ScriptedApprover {
    pub fn new(answers: Vec<ScriptedApproval>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().map(|calls| *calls).unwrap_or_default()
    }
}

impl Approver for ScriptedApprover {
    fn approve(&self, _request: &ApprovalRequest<'_>) -> Result<Decision, ApprovalError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        let answer = self
            .answers
            .lock()
            .map_err(|_| ApprovalError::Failed("scripted approver lock poisoned".to_string()))?
            .pop_front();
        match answer {
            Some(ScriptedApproval::Accept) => Ok(Decision::accept("approved by script")),
            Some(ScriptedApproval::Reject) => Ok(Decision::reject("rejected by script")),
            Some(ScriptedApproval::Timeout) => Err(ApprovalError::Timeout(Duration::from_secs(1))),
            None => Err(ApprovalError::Failed("no scripted answer left".to_string())),
        }
    }
}
