//! Retry-aware orchestration for UI test suites.
//!
//! A run executes the suite, parses the per-test outcomes, triages each
//! failure as flaky, regression or inconclusive, asks an approval gate whether
//! the attempt is acceptable, and re-runs the suite within a bounded retry
//! budget until it is accepted or the budget is spent.
//!
//! - **[`core`]**: pure, deterministic logic (state, parsing, policy, routing,
//!   the stage table). No I/O.
//! - **[`io`]**: side-effecting collaborators (process execution, config files,
//!   templates, attempt logs) behind traits so tests can script them.
//!
//! [`steps`] and [`orchestrator`] tie the two together.

pub mod cancel;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod report;
pub mod steps;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
