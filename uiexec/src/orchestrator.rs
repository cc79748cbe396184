//! Drives one run through the fixed stage topology.

use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, info_span, warn};

use crate::cancel::CancelToken;
use crate::core::machine::{Stage, next_stage};
use crate::core::router::{Route, route};
use crate::core::state::{RawRunConfig, RunState, validate_invariants};
use crate::core::types::{StatusCounts, TerminalReason};
use crate::error::StepError;
use crate::io::approver::Approver;
use crate::io::attempt_log::{
    AttemptMeta, AttemptWriteRequest, validate_run_id, write_attempt, write_report,
};
use crate::io::classifier::Classifier;
use crate::io::test_runner::TestRunner;
use crate::report::RunReport;
use crate::steps::{self, Halt, StepOutcome};

/// Owns the collaborators for a run and enforces the termination contract:
/// every run ends with a terminal reason, and no step runs after that.
pub struct Orchestrator<R, C, A> {
    runner: R,
    classifier: C,
    approver: A,
    parallelism: usize,
    artifacts_dir: Option<PathBuf>,
    run_id: Option<String>,
    cancel: CancelToken,
}

impl<R: TestRunner, C: Classifier, A: Approver> Orchestrator<R, C, A> {
    pub fn new(runner: R, classifier: C, approver: A) -> Self {
        Self {
            runner,
            classifier,
            approver,
            parallelism: 1,
            artifacts_dir: None,
            run_id: None,
            cancel: CancelToken::new(),
        }
    }

    /// Maximum concurrent classification calls during Triage.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Write attempt logs and `report.json` under this directory.
    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(dir.into());
        self
    }

    /// Run id used for artifact paths. An id that is not a plain directory
    /// name fails the run with a `config` error.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Handle that cancels this orchestrator's runs from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    pub fn approver(&self) -> &A {
        &self.approver
    }

    /// Prepare and drive a run to completion.
    pub fn run(&self, raw: &RawRunConfig) -> RunReport {
        let started = Instant::now();
        let run_id = self
            .run_id
            .clone()
            .unwrap_or_else(|| default_run_id(&raw.suite));
        let _span = info_span!("run", run_id = %run_id).entered();

        let prepared = validate_run_id(&run_id)
            .map_err(StepError::Config)
            .and_then(|()| steps::prepare(raw));
        let report = match prepared {
            Ok(state) => {
                let state = self.drive(&run_id, state);
                RunReport::from_state(&run_id, &state, elapsed_ms(started))
            }
            Err(err) => {
                error!(error = %err, "configuration rejected");
                RunReport::rejected_config(&run_id, raw, &err)
            }
        };

        info!(
            terminal_reason = %report.terminal_reason,
            attempts = report.attempt,
            "run finished"
        );
        if let Some(dir) = &self.artifacts_dir
            && let Err(err) = write_report(dir, &run_id, &report)
        {
            warn!(error = %format!("{err:#}"), "failed to write run report");
        }
        report
    }

    /// Drive a prepared state from Execute until it is terminal.
    pub fn drive(&self, run_id: &str, state: RunState) -> RunState {
        let mut state = state;
        let mut stage = next_stage(Stage::Prepare, None);
        let mut attempt_started = Instant::now();

        while stage != Stage::Terminated {
            if self.cancel.is_cancelled() {
                let halted = Box::new(Halt {
                    state,
                    error: StepError::Cancelled(format!("before {stage}")),
                });
                state = self.finish_fatal(run_id, halted, attempt_started);
                break;
            }

            debug!(stage = %stage, attempt = state.attempt, "entering stage");
            if stage == Stage::Execute {
                attempt_started = Instant::now();
            }
            let outcome: StepOutcome = match stage {
                Stage::Execute => steps::execute(state, &self.runner, &self.cancel),
                Stage::Parse => steps::parse(state),
                Stage::Triage => Ok(steps::triage(state, &self.classifier, self.parallelism)),
                Stage::Approve => steps::approve(state, &self.approver),
                Stage::Retry => Ok(steps::retry(state)),
                Stage::Prepare | Stage::Terminated => Ok(state),
            };
            state = match outcome {
                Ok(next) => next,
                Err(halted) => {
                    state = self.finish_fatal(run_id, halted, attempt_started);
                    break;
                }
            };

            let routed = (stage == Stage::Approve).then(|| route(&state));
            if let Some(next) = routed {
                info!(attempt = state.attempt, route = ?next, "routed");
                if let Route::Terminate(reason) = next {
                    state.terminal_reason = Some(reason);
                }
                self.log_attempt(run_id, &state, Some(next), attempt_started);
            }
            check_invariants(&state);
            stage = next_stage(stage, routed);
        }
        state
    }

    fn finish_fatal(&self, run_id: &str, halted: Box<Halt>, attempt_started: Instant) -> RunState {
        let Halt { mut state, error } = *halted;
        error!(kind = ?error.kind(), error = %error, attempt = state.attempt, "run halted");
        state.fatal = Some(error.to_fatal());
        state.terminal_reason = Some(TerminalReason::FatalError);
        if state.attempt > 0 {
            self.log_attempt(run_id, &state, None, attempt_started);
        }
        check_invariants(&state);
        state
    }

    fn log_attempt(&self, run_id: &str, state: &RunState, route: Option<Route>, started: Instant) {
        let Some(dir) = &self.artifacts_dir else {
            return;
        };
        let meta = AttemptMeta {
            run_id: run_id.to_string(),
            attempt: state.attempt,
            max_attempts: state.config.max_attempts(),
            counts: StatusCounts::from_results(&state.results),
            route,
            error: state.fatal.clone(),
            duration_ms: elapsed_ms(started),
        };
        let written = write_attempt(&AttemptWriteRequest {
            artifacts_dir: dir,
            meta: &meta,
            raw_output: state.raw_output.as_ref(),
            results: &state.results,
            triage: state.triage.as_deref(),
            decision: state.decision.as_ref(),
        });
        match written {
            Ok(paths) => debug!(dir = %paths.dir.display(), "attempt logged"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to write attempt log"),
        }
    }
}

fn check_invariants(state: &RunState) {
    let violations = validate_invariants(state);
    debug_assert!(
        violations.is_empty(),
        "run state invariants violated: {violations:?}"
    );
    if !violations.is_empty() {
        error!(?violations, "run state invariants violated");
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// `<suite-slug>-<unix-millis>`, e.g. `tests-ui-login-1760000000000`.
pub fn default_run_id(suite: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    format!("{}-{millis}", slug(suite))
}

fn slug(text: &str) -> String {
    let mut slug = String::new();
    for ch in text.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "run".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_separators() {
        assert_eq!(slug("tests/ui/login_flow.py"), "tests-ui-login-flow-py");
        assert_eq!(slug("  //  "), "run");
        assert_eq!(slug("Checkout::Smoke"), "checkout-smoke");
    }

    #[test]
    fn default_run_id_starts_with_slug() {
        let id = default_run_id("tests/ui");
        assert!(id.starts_with("tests-ui-"));
        assert!(id["tests-ui-".len()..].chars().all(|ch| ch.is_ascii_digit()));
    }
}
