//! Default approval policy.

use crate::core::types::{Decision, TriageEntry, Verdict};

/// Decide from triage alone.
///
/// Accepts when nothing needed triage or every verdict is `likely_flaky`;
/// rejects as soon as one `likely_regression` or `inconclusive` is present.
pub fn default_decision(triage: &[TriageEntry]) -> Decision {
    if triage.is_empty() {
        return Decision::accept("all tests passed");
    }
    let blocking: Vec<&str> = triage
        .iter()
        .filter(|entry| entry.verdict != Verdict::LikelyFlaky)
        .map(|entry| entry.test.as_str())
        .collect();
    if blocking.is_empty() {
        return Decision::accept(format!("{} failure(s) triaged as flaky", triage.len()));
    }
    Decision::reject(format!(
        "{} failure(s) not attributed to flakiness: {}",
        blocking.len(),
        blocking.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::entry;

    #[test]
    fn empty_triage_accepts() {
        assert!(default_decision(&[]).accept);
    }

    #[test]
    fn all_flaky_accepts() {
        let triage = vec![
            entry("a", Verdict::LikelyFlaky),
            entry("b", Verdict::LikelyFlaky),
        ];
        let decision = default_decision(&triage);
        assert!(decision.accept);
        assert_eq!(
            decision.note.as_deref(),
            Some("2 failure(s) triaged as flaky")
        );
    }

    #[test]
    fn regression_or_inconclusive_rejects() {
        for verdict in [Verdict::LikelyRegression, Verdict::Inconclusive] {
            let triage = vec![entry("a", Verdict::LikelyFlaky), entry("b", verdict)];
            let decision = default_decision(&triage);
            assert!(!decision.accept);
            assert!(decision.note.as_deref().is_some_and(|n| n.ends_with(": b")));
        }
    }
}
