//! Per-attempt artifact logs under `<artifacts_dir>/<run_id>/<attempt>/`.
//!
//! These files are product output: they are written whenever an artifacts
//! directory is configured and are independent of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

use crate::core::router::Route;
use crate::core::state::RawOutput;
use crate::core::types::{Decision, FatalError, StatusCounts, TestResult, TriageEntry};

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub run_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub counts: StatusCounts,
    /// Routing decision taken after this attempt, if it got that far.
    pub route: Option<Route>,
    pub error: Option<FatalError>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub runner_log_path: PathBuf,
    pub results_path: PathBuf,
    pub triage_path: PathBuf,
    pub decision_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(artifacts_dir: &Path, run_id: &str, attempt: u32) -> Self {
        let dir = run_dir(artifacts_dir, run_id).join(attempt.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            runner_log_path: dir.join("runner.log"),
            results_path: dir.join("results.json"),
            triage_path: dir.join("triage.json"),
            decision_path: dir.join("decision.json"),
            dir,
        }
    }
}

/// Check that a run id names a single directory under the artifacts root:
/// ASCII letters, digits, `-`, `_` and `.`, and not `.` or `..`.
pub fn validate_run_id(run_id: &str) -> Result<(), String> {
    if run_id.is_empty() || run_id == "." || run_id == ".." {
        return Err(format!("run id '{run_id}' is not a directory name"));
    }
    if let Some(bad) = run_id
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')))
    {
        return Err(format!("run id '{run_id}' contains '{bad}'"));
    }
    Ok(())
}

/// Directory holding every attempt of one run plus its `report.json`.
pub fn run_dir(artifacts_dir: &Path, run_id: &str) -> PathBuf {
    artifacts_dir.join(run_id)
}

pub struct AttemptWriteRequest<'a> {
    pub artifacts_dir: &'a Path,
    pub meta: &'a AttemptMeta,
    pub raw_output: Option<&'a RawOutput>,
    pub results: &'a [TestResult],
    pub triage: Option<&'a [TriageEntry]>,
    pub decision: Option<&'a Decision>,
}

/// Write the logs of one finished attempt. Files for stages the attempt never
/// reached are omitted.
pub fn write_attempt(request: &AttemptWriteRequest<'_>) -> Result<AttemptPaths> {
    let meta = request.meta;
    validate_run_id(&meta.run_id).map_err(|msg| anyhow!(msg))?;
    let paths = AttemptPaths::new(request.artifacts_dir, &meta.run_id, meta.attempt);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, meta)?;
    if let Some(raw) = request.raw_output {
        write_text(&paths.runner_log_path, &render_runner_log(raw))?;
    }
    if !request.results.is_empty() {
        write_json(&paths.results_path, &request.results)?;
    }
    if let Some(triage) = request.triage {
        write_json(&paths.triage_path, &triage)?;
    }
    if let Some(decision) = request.decision {
        write_json(&paths.decision_path, decision)?;
    }
    Ok(paths)
}

/// Write `report.json` for a run and return its path.
pub fn write_report<T: Serialize>(artifacts_dir: &Path, run_id: &str, report: &T) -> Result<PathBuf> {
    validate_run_id(run_id).map_err(|msg| anyhow!(msg))?;
    let dir = run_dir(artifacts_dir, run_id);
    fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
    let path = dir.join("report.json");
    write_json(&path, report)?;
    Ok(path)
}

fn render_runner_log(raw: &RawOutput) -> String {
    let mut log = format!("exit_code: {:?}\n", raw.exit_code);
    log.push_str("--- stdout ---\n");
    log.push_str(&raw.text);
    if !raw.text.ends_with('\n') {
        log.push('\n');
    }
    log.push_str("--- stderr ---\n");
    log.push_str(&raw.stderr);
    log
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{TerminalReason, Verdict};
    use crate::test_support::{entry, failing};

    fn meta(attempt: u32) -> AttemptMeta {
        AttemptMeta {
            run_id: "tests-ui-1".to_string(),
            attempt,
            max_attempts: 2,
            counts: StatusCounts::default(),
            route: None,
            error: None,
            duration_ms: 12,
        }
    }

    #[test]
    fn run_ids_must_be_single_path_segments() {
        assert!(validate_run_id("tests-ui-login-1760000000000").is_ok());
        assert!(validate_run_id("nightly_2.1").is_ok());
        for bad in ["", ".", "..", "../x", "a/b", "a\\b", "with space"] {
            assert!(validate_run_id(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn writers_refuse_escaping_run_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("artifacts");
        let err = write_report(&root, "../escaped", &serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("contains '/'"), "{err}");
        assert!(!temp.path().join("escaped").exists());
        assert!(!root.exists());
    }

    #[test]
    fn attempt_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AttemptPaths::new(temp.path(), "tests-ui-1", 2);

        assert!(paths.dir.ends_with(Path::new("tests-ui-1/2")));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.runner_log_path.ends_with("runner.log"));
        assert!(paths.results_path.ends_with("results.json"));
        assert!(paths.triage_path.ends_with("triage.json"));
        assert!(paths.decision_path.ends_with("decision.json"));
    }

    #[test]
    fn writes_full_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let raw = RawOutput {
            text: "a.py::t FAILED".to_string(),
            stderr: "warning".to_string(),
            exit_code: Some(1),
        };
        let results = vec![failing("a.py::t", "boom")];
        let triage = vec![entry("a.py::t", Verdict::LikelyFlaky)];
        let decision = Decision::accept("1 failure(s) triaged as flaky");
        let mut meta = meta(1);
        meta.route = Some(Route::Terminate(TerminalReason::ApprovedAfterRetry));

        let paths = write_attempt(&AttemptWriteRequest {
            artifacts_dir: temp.path(),
            meta: &meta,
            raw_output: Some(&raw),
            results: &results,
            triage: Some(&triage),
            decision: Some(&decision),
        })
        .expect("write");

        let log = fs::read_to_string(&paths.runner_log_path).expect("log");
        assert!(log.contains("a.py::t FAILED\n--- stderr ---\nwarning"));
        let stored: Vec<TriageEntry> =
            serde_json::from_str(&fs::read_to_string(&paths.triage_path).expect("triage"))
                .expect("decode");
        assert_eq!(stored, triage);
        assert!(paths.decision_path.is_file());
        assert!(paths.meta_path.is_file());
    }

    #[test]
    fn skips_files_for_unreached_stages() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_attempt(&AttemptWriteRequest {
            artifacts_dir: temp.path(),
            meta: &meta(1),
            raw_output: None,
            results: &[],
            triage: None,
            decision: None,
        })
        .expect("write");

        assert!(paths.meta_path.is_file());
        assert!(!paths.runner_log_path.exists());
        assert!(!paths.results_path.exists());
        assert!(!paths.triage_path.exists());
        assert!(!paths.decision_path.exists());
    }
}
