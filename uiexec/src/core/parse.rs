//! Deterministic conversion of runner output into ordered test results.
//!
//! Two report shapes are recognized:
//! - JSON: an array of test objects, or an object with a `tests` array
//!   (pytest-json-report compatible: `nodeid`/`outcome`/`call.longrepr`).
//! - Text: pytest verbose lines (`<id> PASSED`), short summary lines
//!   (`FAILED <id> - <message>`) and the closing session tally
//!   (`1 failed, 2 passed in 3.10s`), which must agree with the lines parsed.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::types::{StatusCounts, TestResult, TestStatus};

/// `<id> PASSED`, optionally followed by `(reason)` and a `[ 50%]` progress
/// marker. The id may contain spaces inside parametrized brackets.
static VERBOSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<name>\S.*?)\s+(?P<status>PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)(?:\s+\((?P<reason>.*)\))?(?:\s+\[\s*\d+%\])?$",
    )
    .unwrap()
});

/// Lines that lead with a status word: short summary lines and the xdist
/// form `[gw0] [ 50%] PASSED <id>`.
static STATUS_FIRST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\[gw\d+\]\s+\[\s*\d+%\]\s+)?(?P<status>PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)(?:\s+(?P<rest>.*))?$",
    )
    .unwrap()
});

/// `SKIPPED [2] tests/ui/test_cart.py:12: reason` names a location, not a test.
static SKIP_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(?P<count>\d+)\]\s+(?P<file>.+?):\d+:\s*(?P<reason>.*)$").unwrap()
});

static TALLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^=*\s*(?P<body>\d+ \w+(?:, \d+ \w+)*) in \d+(?:\.\d+)?s\b").unwrap()
});

static TALLY_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<count>\d+) (?P<label>\w+)").unwrap());

/// Parse a raw runner artifact into ordered test results.
///
/// Returns an error message when the artifact is structurally unrecognizable,
/// contains no tests, or reports outcomes that could not all be attributed to
/// a test. Parsing is pure: the same input always yields the same results.
pub fn parse_report(raw: &str) -> Result<Vec<TestResult>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("runner produced no output".to_string());
    }

    let results = if trimmed.starts_with('[') || trimmed.starts_with('{') {
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => parse_json_report(&value)?,
            Err(_) => parse_text_report(raw)?,
        }
    } else {
        parse_text_report(raw)?
    };

    if results.is_empty() {
        return Err("no test outcomes found in runner output".to_string());
    }
    Ok(results)
}

fn parse_json_report(value: &Value) -> Result<Vec<TestResult>, String> {
    let tests = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("tests") {
            Some(Value::Array(items)) => items,
            _ => return Err("JSON report has no `tests` array".to_string()),
        },
        _ => return Err("JSON report must be an array or object".to_string()),
    };

    let mut builder = ResultsBuilder::default();
    for (idx, test) in tests.iter().enumerate() {
        let name = string_field(test, &["name", "nodeid"])
            .ok_or_else(|| format!("test #{idx} has no `name`"))?;
        let raw_status = string_field(test, &["status", "outcome"])
            .ok_or_else(|| format!("test '{name}' has no `status`"))?;
        let status = status_from_word(&raw_status)
            .ok_or_else(|| format!("test '{name}' has unknown status '{raw_status}'"))?;
        let detail = string_field(test, &["detail", "message"])
            .or_else(|| {
                test.get("call")
                    .and_then(|call| call.get("longrepr"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();
        builder.record(name, status, detail);
    }
    Ok(builder.finish())
}

fn parse_text_report(raw: &str) -> Result<Vec<TestResult>, String> {
    let mut builder = ResultsBuilder::default();
    let mut location_skips = 0;
    let mut tally = None;

    for line in raw.lines() {
        let line = line.trim_end();
        if let Some(caps) = STATUS_FIRST_RE.captures(line) {
            let Some(status) = status_from_word(&caps["status"]) else {
                continue;
            };
            let rest = caps.name("rest").map_or("", |m| m.as_str().trim());
            if status == TestStatus::Skipped
                && let Some(skip) = SKIP_SUMMARY_RE.captures(rest)
            {
                location_skips += skip["count"].parse::<usize>().unwrap_or(1);
                builder.annotate_skips(&skip["file"], skip["reason"].trim());
                continue;
            }
            let (name, detail) = split_summary(rest);
            if name.is_empty() {
                return Err(format!("result line without a test id: '{line}'"));
            }
            builder.record(name.to_string(), status, detail.to_string());
        } else if let Some(caps) = VERBOSE_RE.captures(line) {
            let name = &caps["name"];
            // Free-form log text that happens to end in a status word.
            if name.contains(char::is_whitespace) && !name.contains("::") {
                continue;
            }
            let Some(status) = status_from_word(&caps["status"]) else {
                continue;
            };
            let detail = caps
                .name("reason")
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            builder.record(name.to_string(), status, detail);
        } else if let Some(caps) = TALLY_RE.captures(line) {
            tally = Some(session_tally(&caps["body"]));
        }
    }

    if let Some(reported) = tally {
        check_tally(reported, builder.outcome_counts(), location_skips)?;
    }
    Ok(builder.finish())
}

/// Split `<id> - <message>` on the first separator outside `[...]`.
fn split_summary(rest: &str) -> (&str, &str) {
    let mut depth = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ' ' if depth == 0 && rest[idx..].starts_with(" - ") => {
                return (rest[..idx].trim(), rest[idx + 3..].trim());
            }
            _ => {}
        }
    }
    (rest.trim(), "")
}

fn session_tally(body: &str) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for item in TALLY_ITEM_RE.captures_iter(body) {
        let count = item["count"].parse::<usize>().unwrap_or(0);
        match &item["label"] {
            "passed" | "xfailed" | "xpassed" => counts.pass += count,
            "failed" => counts.fail += count,
            "error" | "errors" => counts.error += count,
            "skipped" => counts.skipped += count,
            _ => {}
        }
    }
    counts
}

/// Skips may be reported only as `[N] file:line` locations (`-rs` without
/// `-v`), so location counts can stand in for named skips.
fn check_tally(
    reported: StatusCounts,
    parsed: StatusCounts,
    location_skips: usize,
) -> Result<(), String> {
    let skips_agree = parsed.skipped == reported.skipped
        || parsed.skipped + location_skips == reported.skipped;
    if parsed.pass == reported.pass
        && parsed.fail == reported.fail
        && parsed.error == reported.error
        && skips_agree
    {
        return Ok(());
    }
    Err(format!(
        "runner reported {} but parsed {}",
        describe_counts(reported),
        describe_counts(parsed)
    ))
}

fn describe_counts(counts: StatusCounts) -> String {
    format!(
        "{} passed, {} failed, {} error, {} skipped",
        counts.pass, counts.fail, counts.error, counts.skipped
    )
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// Map runner status words onto the four outcomes.
///
/// Expected failures (`xfail`) and unexpected passes (`xpass`) do not fail a
/// non-strict suite, so both count as passes.
fn status_from_word(word: &str) -> Option<TestStatus> {
    match word.to_ascii_lowercase().as_str() {
        "pass" | "passed" | "ok" | "xfail" | "xfailed" | "xpass" | "xpassed" => {
            Some(TestStatus::Pass)
        }
        "fail" | "failed" | "failure" => Some(TestStatus::Fail),
        "error" | "errored" => Some(TestStatus::Error),
        "skip" | "skipped" => Some(TestStatus::Skipped),
        _ => None,
    }
}

fn severity(status: TestStatus) -> u8 {
    match status {
        TestStatus::Pass => 0,
        TestStatus::Skipped => 1,
        TestStatus::Fail => 2,
        TestStatus::Error => 3,
    }
}

/// Collects results keyed by name, keeping first-seen order.
///
/// A repeated name (verbose line plus summary line, or a teardown error after
/// a pass) may raise the recorded severity or fill an empty detail.
#[derive(Default)]
struct ResultsBuilder {
    results: Vec<TestResult>,
    index: HashMap<String, usize>,
    outcomes: HashSet<(String, TestStatus)>,
}

impl ResultsBuilder {
    fn record(&mut self, name: String, status: TestStatus, detail: String) {
        self.outcomes.insert((name.clone(), status));
        if let Some(&idx) = self.index.get(&name) {
            let existing = &mut self.results[idx];
            if severity(status) > severity(existing.status) {
                existing.status = status;
            }
            if existing.detail.is_empty() {
                existing.detail = detail;
            }
            return;
        }
        self.index.insert(name.clone(), self.results.len());
        self.results.push(TestResult {
            name,
            status,
            detail,
        });
    }

    /// Fill the detail of unexplained skips declared in `file`.
    fn annotate_skips(&mut self, file: &str, reason: &str) {
        let prefix = format!("{file}::");
        for result in &mut self.results {
            if result.status == TestStatus::Skipped
                && result.detail.is_empty()
                && result.name.starts_with(&prefix)
            {
                result.detail = reason.to_string();
            }
        }
    }

    /// Distinct (test, outcome) pairs, counted the way the session tally
    /// counts them: a pass followed by a teardown error contributes to both.
    fn outcome_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for (_, status) in &self.outcomes {
            counts.record(*status);
        }
        counts
    }

    fn finish(self) -> Vec<TestResult> {
        self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTEST_OUTPUT: &str = "\
============================= test session starts ==============================
collected 3 items

tests/ui/test_login.py::test_valid_login PASSED                          [ 33%]
tests/ui/test_login.py::test_bad_password FAILED                         [ 66%]
tests/ui/test_cart.py::test_checkout SKIPPED (no payment sandbox)        [100%]

=========================== short test summary info ============================
PASSED tests/ui/test_login.py::test_valid_login
FAILED tests/ui/test_login.py::test_bad_password - AssertionError: banner not shown
SKIPPED [1] tests/ui/test_cart.py:12: no payment sandbox
==================== 1 failed, 1 passed, 1 skipped in 4.20s ====================
";

    #[test]
    fn parses_pytest_verbose_and_summary_lines() {
        let results = parse_report(PYTEST_OUTPUT).expect("parse");
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "tests/ui/test_login.py::test_valid_login",
                "tests/ui/test_login.py::test_bad_password",
                "tests/ui/test_cart.py::test_checkout",
            ]
        );
        assert_eq!(results[0].status, TestStatus::Pass);
        assert_eq!(results[1].status, TestStatus::Fail);
        assert_eq!(results[1].detail, "AssertionError: banner not shown");
        assert_eq!(results[2].status, TestStatus::Skipped);
        assert_eq!(results[2].detail, "no payment sandbox");
    }

    #[test]
    fn skip_location_summary_is_not_a_test() {
        let raw = "\
tests/ui/test_cart.py::test_checkout SKIPPED                             [100%]
SKIPPED [1] tests/ui/test_cart.py:12: no sandbox
";
        let results = parse_report(raw).expect("parse");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "tests/ui/test_cart.py::test_checkout");
        assert_eq!(results[0].detail, "no sandbox");
    }

    #[test]
    fn parametrized_ids_with_spaces() {
        let raw = "\
tests/ui/test_search.py::test_ok PASSED                                  [ 50%]
tests/ui/test_search.py::test_search[red shoes] FAILED                   [100%]

=========================== short test summary info ============================
FAILED tests/ui/test_search.py::test_search[red shoes] - AssertionError: no results
========================= 1 failed, 1 passed in 2.01s =========================
";
        let results = parse_report(raw).expect("parse");
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].name, "tests/ui/test_search.py::test_search[red shoes]");
        assert_eq!(results[1].status, TestStatus::Fail);
        assert_eq!(results[1].detail, "AssertionError: no results");
    }

    #[test]
    fn summary_separator_inside_params_is_part_of_the_id() {
        let results = parse_report("FAILED t.py::test_range[1 - 2] - assert 3 == -1\n")
            .expect("parse");
        assert_eq!(results[0].name, "t.py::test_range[1 - 2]");
        assert_eq!(results[0].detail, "assert 3 == -1");
    }

    #[test]
    fn tally_disagreement_is_an_error() {
        let raw = "\
tests/ui/test_a.py::test_ok PASSED
tests/ui/test_a.py::test_broken <garbled output>
==================== 1 failed, 1 passed in 0.50s ====================
";
        let err = parse_report(raw).unwrap_err();
        assert!(err.contains("runner reported 1 passed, 1 failed"), "{err}");
        assert!(err.contains("parsed 1 passed, 0 failed"), "{err}");
    }

    #[test]
    fn tally_counts_teardown_error_separately() {
        let raw = "\
tests/a.py::test_x PASSED
tests/a.py::test_x ERROR
====== 1 passed, 1 error in 0.10s ======
";
        let results = parse_report(raw).expect("parse");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TestStatus::Error);
    }

    #[test]
    fn quiet_skip_locations_satisfy_the_tally() {
        let raw = "\
FAILED tests/a.py::test_b - boom
SKIPPED [2] tests/a.py:3: no database
1 failed, 2 skipped in 0.12s
";
        let results = parse_report(raw).expect("parse");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TestStatus::Fail);
    }

    #[test]
    fn bare_status_line_is_an_error() {
        let err = parse_report("tests/a.py::test_x hello\nPASSED\n").unwrap_err();
        assert!(err.contains("without a test id"), "{err}");
    }

    #[test]
    fn xdist_lines_and_log_noise() {
        let raw = "\
2024-05-01 12:00:01 login request FAILED
[gw0] [ 50%] PASSED tests/a.py::test_one
[gw1] [100%] FAILED tests/a.py::test_two
";
        let results = parse_report(raw).expect("parse");
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["tests/a.py::test_one", "tests/a.py::test_two"]);
        assert_eq!(results[1].status, TestStatus::Fail);
    }

    #[test]
    fn parsing_is_idempotent() {
        let first = parse_report(PYTEST_OUTPUT).expect("first");
        let second = parse_report(PYTEST_OUTPUT).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn teardown_error_raises_severity() {
        let raw = "tests/a.py::test_x PASSED\ntests/a.py::test_x ERROR\n";
        let results = parse_report(raw).expect("parse");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TestStatus::Error);
    }

    #[test]
    fn parses_json_array_report() {
        let raw = r#"[
            {"name": "login", "status": "pass"},
            {"name": "checkout", "status": "fail", "detail": "timeout waiting for #pay"}
        ]"#;
        let results = parse_report(raw).expect("parse");
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].status, TestStatus::Fail);
        assert_eq!(results[1].detail, "timeout waiting for #pay");
    }

    #[test]
    fn parses_pytest_json_report_object() {
        let raw = r#"{
            "summary": {"passed": 1, "failed": 1},
            "tests": [
                {"nodeid": "t.py::a", "outcome": "passed"},
                {"nodeid": "t.py::b", "outcome": "failed", "call": {"longrepr": "E assert 1 == 2"}}
            ]
        }"#;
        let results = parse_report(raw).expect("parse");
        assert_eq!(results[0].name, "t.py::a");
        assert_eq!(results[1].detail, "E assert 1 == 2");
    }

    #[test]
    fn rejects_json_without_tests() {
        let err = parse_report(r#"{"summary": {}}"#).unwrap_err();
        assert!(err.contains("no `tests` array"));
    }

    #[test]
    fn rejects_unknown_json_status() {
        let err = parse_report(r#"[{"name": "a", "status": "maybe"}]"#).unwrap_err();
        assert!(err.contains("unknown status 'maybe'"));
    }

    #[test]
    fn rejects_empty_and_unrecognized_output() {
        assert!(parse_report("   \n").is_err());
        let err = parse_report("Traceback (most recent call last):\n  boom\n").unwrap_err();
        assert!(err.contains("no test outcomes"));
    }
}
