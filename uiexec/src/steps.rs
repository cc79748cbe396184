//! The six orchestration steps.
//!
//! Each step consumes the [`RunState`] and hands back the next one. A step that
//! fails fatally returns a [`Halt`] that still carries the state, so the
//! orchestrator can report whatever the run produced before the failure.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::parse::parse_report;
use crate::core::policy::default_decision;
use crate::core::state::{RawRunConfig, RunConfig, RunState};
use crate::core::types::{StatusCounts, TestResult, TriageEntry, Verdict};
use crate::error::StepError;
use crate::io::approver::{ApprovalRequest, Approver};
use crate::io::classifier::Classifier;
use crate::io::test_runner::{RunRequest, TestRunner};

static OVERRIDE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// A fatal step failure together with the state it interrupted.
#[derive(Debug)]
pub struct Halt {
    pub state: RunState,
    pub error: StepError,
}

pub type StepOutcome = Result<RunState, Box<Halt>>;

fn halt(state: RunState, error: StepError) -> Box<Halt> {
    Box::new(Halt { state, error })
}

/// Validate the caller's configuration and create the run state.
pub fn prepare(raw: &RawRunConfig) -> Result<RunState, StepError> {
    let suite = raw.suite.trim();
    if suite.is_empty() {
        return Err(StepError::Config("suite selector is empty".to_string()));
    }
    if raw.max_retries < 0 {
        return Err(StepError::Config(format!(
            "max_retries must be >= 0 (got {})",
            raw.max_retries
        )));
    }
    let max_retries = u32::try_from(raw.max_retries).map_err(|_| {
        StepError::Config(format!("max_retries {} is too large", raw.max_retries))
    })?;
    if let Some(key) = raw.overrides.keys().find(|key| !OVERRIDE_KEY_RE.is_match(key)) {
        return Err(StepError::Config(format!(
            "override key '{key}' is not an identifier"
        )));
    }

    let environment = raw.resolved_environment();
    debug!(suite, environment, max_retries, "run prepared");
    Ok(RunState::new(RunConfig {
        suite: suite.to_string(),
        environment,
        max_retries,
        overrides: raw.overrides.clone(),
    }))
}

/// Run the suite once and capture its output.
///
/// A suite that reports failures is ordinary data. Only launch failures,
/// timeouts and cancellation are errors.
#[instrument(skip_all, fields(attempt = state.attempt + 1))]
pub fn execute<R: TestRunner + ?Sized>(
    mut state: RunState,
    runner: &R,
    cancel: &CancelToken,
) -> StepOutcome {
    if cancel.is_cancelled() {
        return Err(halt(state, StepError::Cancelled("before execute".to_string())));
    }
    state.attempt += 1;
    info!(
        suite = %state.config.suite,
        environment = %state.config.environment,
        max_attempts = state.config.max_attempts(),
        "executing suite"
    );

    let request = RunRequest {
        suite: &state.config.suite,
        environment: &state.config.environment,
        overrides: &state.config.overrides,
        attempt: state.attempt,
        cancel,
    };
    match runner.run(&request) {
        Ok(raw) => {
            state.clear_attempt();
            state.raw_output = Some(raw);
            Ok(state)
        }
        Err(_) if cancel.is_cancelled() => Err(halt(
            state,
            StepError::Cancelled("during execute".to_string()),
        )),
        Err(err) => Err(halt(state, StepError::Execution(format!("{err:#}")))),
    }
}

/// Turn the captured output into ordered per-test results.
pub fn parse(mut state: RunState) -> StepOutcome {
    let Some(raw) = &state.raw_output else {
        return Err(halt(
            state,
            StepError::Parse("no runner output captured".to_string()),
        ));
    };
    match parse_report(&raw.text) {
        Ok(results) => {
            let counts = StatusCounts::from_results(&results);
            info!(
                pass = counts.pass,
                fail = counts.fail,
                error = counts.error,
                skipped = counts.skipped,
                "parsed results"
            );
            state.results = results;
            state.triage = None;
            state.decision = None;
            Ok(state)
        }
        Err(message) => {
            let message = match raw.exit_code {
                Some(code) => format!("{message} (runner exit code {code})"),
                None => format!("{message} (runner killed by signal)"),
            };
            Err(halt(state, StepError::Parse(message)))
        }
    }
}

/// Classify every failing or erroring test.
///
/// Calls run on up to `parallelism` threads and the entries come back in
/// `results` order. A classifier failure marks that test `inconclusive`;
/// this step never fails.
pub fn triage<C: Classifier + ?Sized>(
    mut state: RunState,
    classifier: &C,
    parallelism: usize,
) -> RunState {
    let pending: Vec<&TestResult> = state
        .results
        .iter()
        .filter(|result| result.status.needs_triage())
        .collect();
    if pending.is_empty() {
        debug!("nothing to triage");
        state.triage = Some(Vec::new());
        return state;
    }

    let workers = parallelism.clamp(1, pending.len());
    info!(failures = pending.len(), workers, "triaging failures");
    let mut slots: Vec<Option<TriageEntry>> = vec![None; pending.len()];
    let next = AtomicUsize::new(0);
    thread::scope(|scope| {
        let next = &next;
        let pending = &pending;
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(move || {
                    let mut done = Vec::new();
                    loop {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some(result) = pending.get(idx) else {
                            break;
                        };
                        done.push((idx, classify_one(classifier, result)));
                    }
                    done
                })
            })
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(done) => {
                    for (idx, entry) in done {
                        slots[idx] = Some(entry);
                    }
                }
                Err(_) => warn!("triage worker panicked"),
            }
        }
    });

    let entries: Vec<TriageEntry> = slots
        .into_iter()
        .zip(&pending)
        .map(|(slot, result)| {
            slot.unwrap_or_else(|| TriageEntry {
                test: result.name.clone(),
                verdict: Verdict::Inconclusive,
                rationale: "classification did not complete".to_string(),
            })
        })
        .collect();
    state.triage = Some(entries);
    state
}

fn classify_one<C: Classifier + ?Sized>(classifier: &C, result: &TestResult) -> TriageEntry {
    match classifier.classify(&result.name, &result.detail) {
        Ok(classification) => TriageEntry {
            test: result.name.clone(),
            verdict: classification.verdict,
            rationale: classification.rationale,
        },
        Err(err) => {
            warn!(test = %result.name, error = %err, "classification failed, marking inconclusive");
            TriageEntry {
                test: result.name.clone(),
                verdict: Verdict::Inconclusive,
                rationale: err.to_string(),
            }
        }
    }
}

/// Decide whether this attempt is acceptable.
///
/// The default policy decides first. The approver is only asked when the
/// policy rejects, and it may override the rejection.
pub fn approve<A: Approver + ?Sized>(mut state: RunState, approver: &A) -> StepOutcome {
    let triage = state.triage.as_deref().unwrap_or_default();
    let policy = default_decision(triage);
    let decision = if policy.accept {
        policy
    } else {
        let request = ApprovalRequest {
            suite: &state.config.suite,
            environment: &state.config.environment,
            attempt: state.attempt,
            max_attempts: state.config.max_attempts(),
            triage,
            policy: &policy,
        };
        match approver.approve(&request) {
            Ok(decision) => decision,
            Err(err) => return Err(halt(state, err.into())),
        }
    };
    info!(accept = decision.accept, note = ?decision.note, "approval decided");
    state.decision = Some(decision);
    Ok(state)
}

/// Drop everything the previous attempt produced. `config` and `attempt`
/// carry over.
pub fn retry(mut state: RunState) -> RunState {
    debug!(attempt = state.attempt, "clearing attempt for retry");
    state.clear_attempt();
    state
}
