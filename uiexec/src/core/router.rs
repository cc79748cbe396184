//! Post-approval routing.

use serde::Serialize;

use crate::core::state::RunState;
use crate::core::types::TerminalReason;

/// Next hop chosen after the approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "route", content = "reason", rename_all = "snake_case")]
pub enum Route {
    Retry,
    Terminate(TerminalReason),
}

/// Select the next hop from the approved state.
///
/// Pure and total over every `RunState`:
/// 1. accepted: `all_passed` when the first attempt needed no triage,
///    otherwise `approved_after_retry`
/// 2. budget spent (`attempt >= max_retries + 1`): `retries_exhausted`
/// 3. otherwise: retry
///
/// A missing decision counts as a rejection.
pub fn route(state: &RunState) -> Route {
    let accepted = state.decision.as_ref().is_some_and(|d| d.accept);
    if accepted {
        let nothing_triaged = state.triage.as_ref().is_none_or(Vec::is_empty);
        if nothing_triaged && state.attempt <= 1 {
            return Route::Terminate(TerminalReason::AllPassed);
        }
        return Route::Terminate(TerminalReason::ApprovedAfterRetry);
    }
    if state.attempt >= state.config.max_attempts() {
        return Route::Terminate(TerminalReason::RetriesExhausted);
    }
    Route::Retry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::RunState;
    use crate::core::types::{Decision, Verdict};
    use crate::test_support::{entry, run_config};

    fn state(max_retries: u32, attempt: u32, decision: Option<Decision>) -> RunState {
        let mut state = RunState::new(run_config("tests/ui", max_retries));
        state.attempt = attempt;
        state.triage = Some(Vec::new());
        state.decision = decision;
        state
    }

    #[test]
    fn accepted_first_attempt_without_triage_is_all_passed() {
        let s = state(2, 1, Some(Decision::accept("ok")));
        assert_eq!(route(&s), Route::Terminate(TerminalReason::AllPassed));
    }

    #[test]
    fn accepted_with_flaky_triage_is_approved_after_retry() {
        let mut s = state(2, 1, Some(Decision::accept("flaky")));
        s.triage = Some(vec![entry("a", Verdict::LikelyFlaky)]);
        assert_eq!(
            route(&s),
            Route::Terminate(TerminalReason::ApprovedAfterRetry)
        );
    }

    #[test]
    fn accepted_clean_retry_is_approved_after_retry() {
        let s = state(1, 2, Some(Decision::accept("ok")));
        assert_eq!(
            route(&s),
            Route::Terminate(TerminalReason::ApprovedAfterRetry)
        );
    }

    /// Exhaustive sweep over `accept` x `attempt` x `max_retries`.
    #[test]
    fn routing_is_total_and_deterministic() {
        for max_retries in 0..4u32 {
            for attempt in 0..=max_retries + 1 {
                for decision in [
                    None,
                    Some(Decision::accept("a")),
                    Some(Decision::reject("r")),
                ] {
                    let s = state(max_retries, attempt, decision.clone());
                    let first = route(&s);
                    assert_eq!(first, route(&s));

                    let accepted = decision.as_ref().is_some_and(|d| d.accept);
                    let expected = if accepted {
                        if attempt <= 1 {
                            Route::Terminate(TerminalReason::AllPassed)
                        } else {
                            Route::Terminate(TerminalReason::ApprovedAfterRetry)
                        }
                    } else if attempt > max_retries {
                        Route::Terminate(TerminalReason::RetriesExhausted)
                    } else {
                        Route::Retry
                    };
                    assert_eq!(first, expected, "max_retries={max_retries} attempt={attempt}");
                }
            }
        }
    }
}
