//! Stable exit codes for uiexec CLI commands.

use crate::core::types::TerminalReason;

/// Command succeeded, or the run ended accepted (`all_passed` or
/// `approved_after_retry`).
pub const OK: i32 = 0;
/// The run ended with a fatal error, or the invocation/config was invalid.
pub const FATAL: i32 = 1;
/// The retry budget was spent without an accepted attempt.
pub const RETRIES_EXHAUSTED: i32 = 2;

pub fn for_reason(reason: TerminalReason) -> i32 {
    match reason {
        TerminalReason::AllPassed | TerminalReason::ApprovedAfterRetry => OK,
        TerminalReason::RetriesExhausted => RETRIES_EXHAUSTED,
        TerminalReason::FatalError => FATAL,
    }
}
