//! Orchestrator configuration stored in `uiexec.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::state::RawRunConfig;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "uiexec.toml";

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values that run a pytest suite locally with one retry and no classifier.
/// Suite and retry budget are validated by the Prepare step, not here, so
/// that a bad value surfaces as a `config` fatal error on the run report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Suite selector passed to the runner command (e.g. `tests/ui`).
    pub suite: String,

    /// Target environment identifier.
    pub environment: String,

    /// Additional attempts after the first one.
    pub max_retries: i64,

    /// Root for per-run attempt logs. `None` disables artifact writing.
    pub artifacts_dir: Option<PathBuf>,

    /// Extra key/value pairs exposed to the runner as `UIEXEC_<KEY>` and as
    /// template variables.
    pub overrides: BTreeMap<String, String>,

    pub runner: RunnerCommandConfig,
    pub classifier: ClassifierConfig,
    pub approver: ApproverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerCommandConfig {
    /// Command template; each argument is rendered with `suite`, `environment`
    /// and the overrides in scope (e.g. `["pytest", "{{ suite }}", "-rA"]`).
    pub command: Vec<String>,

    /// Wall-clock limit for one suite execution.
    pub timeout_secs: u64,

    /// Truncate captured runner stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for RunnerCommandConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "pytest".to_string(),
                "{{ suite }}".to_string(),
                "-v".to_string(),
                "-rA".to_string(),
            ],
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Command that reads a prompt on stdin and prints a JSON verdict.
    /// Empty means no classifier: every failure triages as `inconclusive`.
    pub command: Vec<String>,

    /// Optional prompt template overriding the built-in one.
    pub prompt_template: Option<String>,

    /// Wall-clock limit for one classification call.
    pub timeout_secs: u64,

    /// Maximum concurrent classification calls.
    pub parallelism: usize,

    pub output_limit_bytes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            prompt_template: None,
            timeout_secs: 120,
            parallelism: 4,
            output_limit_bytes: 100_000,
        }
    }
}

/// Which approval collaborator to consult when the default policy rejects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApproverKind {
    /// Default policy only.
    #[default]
    Auto,
    /// External command: exit 0 accepts.
    Command,
    /// Interactive prompt on the terminal.
    Console,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApproverConfig {
    pub kind: ApproverKind,
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ApproverConfig {
    fn default() -> Self {
        Self {
            kind: ApproverKind::Auto,
            command: Vec::new(),
            timeout_secs: 10 * 60,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            suite: String::new(),
            environment: "local".to_string(),
            max_retries: 1,
            overrides: BTreeMap::new(),
            artifacts_dir: Some(PathBuf::from(".uiexec/runs")),
            runner: RunnerCommandConfig::default(),
            classifier: ClassifierConfig::default(),
            approver: ApproverConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.runner.command.is_empty() || self.runner.command[0].trim().is_empty() {
            return Err(anyhow!("runner.command must be a non-empty array"));
        }
        if self.runner.timeout_secs == 0 {
            return Err(anyhow!("runner.timeout_secs must be > 0"));
        }
        if self.runner.output_limit_bytes == 0 {
            return Err(anyhow!("runner.output_limit_bytes must be > 0"));
        }
        if !self.classifier.command.is_empty() && self.classifier.command[0].trim().is_empty() {
            return Err(anyhow!("classifier.command must start with a program"));
        }
        if self.classifier.timeout_secs == 0 {
            return Err(anyhow!("classifier.timeout_secs must be > 0"));
        }
        if self.classifier.parallelism == 0 {
            return Err(anyhow!("classifier.parallelism must be > 0"));
        }
        if self.classifier.output_limit_bytes == 0 {
            return Err(anyhow!("classifier.output_limit_bytes must be > 0"));
        }
        if self.approver.timeout_secs == 0 {
            return Err(anyhow!("approver.timeout_secs must be > 0"));
        }
        if self.approver.kind == ApproverKind::Command
            && (self.approver.command.is_empty() || self.approver.command[0].trim().is_empty())
        {
            return Err(anyhow!(
                "approver.command must be a non-empty array when approver.kind = \"command\""
            ));
        }
        Ok(())
    }

    /// The caller-facing run configuration handed to Prepare.
    pub fn raw_run_config(&self) -> RawRunConfig {
        RawRunConfig {
            suite: self.suite.clone(),
            environment: self.environment.clone(),
            max_retries: self.max_retries,
            overrides: self.overrides.clone(),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
