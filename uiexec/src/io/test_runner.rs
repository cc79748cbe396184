//! Execution collaborator for the UI suite.
//!
//! The [`TestRunner`] trait decouples the Execute step from how the suite is
//! actually launched. Tests use scripted runners that return canned output
//! without spawning processes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::state::RawOutput;
use crate::io::config::RunnerCommandConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::{TemplateEngine, template_vars};

/// Parameters for one suite execution.
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub suite: &'a str,
    pub environment: &'a str,
    pub overrides: &'a BTreeMap<String, String>,
    /// 1-based attempt number this execution belongs to.
    pub attempt: u32,
    pub cancel: &'a CancelToken,
}

/// Abstraction over suite execution backends.
///
/// A suite that runs and reports failures is a successful call. Errors are
/// reserved for launch failures, timeouts and cancellation. Implementations
/// must be callable repeatedly.
pub trait TestRunner {
    fn run(&self, request: &RunRequest<'_>) -> Result<RawOutput>;
}

/// Runner that spawns the configured command (pytest by default).
pub struct CommandTestRunner {
    config: RunnerCommandConfig,
    workdir: PathBuf,
    templates: TemplateEngine,
}

impl CommandTestRunner {
    pub fn new(config: RunnerCommandConfig, workdir: PathBuf) -> Self {
        Self {
            config,
            workdir,
            templates: TemplateEngine::new(None),
        }
    }

    fn build_command(&self, request: &RunRequest<'_>) -> Result<Command> {
        let vars = template_vars(
            request.suite,
            request.environment,
            request.attempt,
            request.overrides,
        );
        let args = self.templates.render_args(&self.config.command, &vars)?;
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| anyhow!("runner command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .current_dir(&self.workdir)
            .env("UIEXEC_SUITE", request.suite)
            .env("UIEXEC_ENVIRONMENT", request.environment)
            .env("UIEXEC_ATTEMPT", request.attempt.to_string());
        for (key, value) in request.overrides {
            cmd.env(format!("UIEXEC_{}", key.to_ascii_uppercase()), value);
        }
        Ok(cmd)
    }
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(suite = request.suite, environment = request.environment, attempt = request.attempt))]
    fn run(&self, request: &RunRequest<'_>) -> Result<RawOutput> {
        let cmd = self.build_command(request)?;
        info!(workdir = %self.workdir.display(), "launching test runner");

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = run_command_with_timeout(
            cmd,
            None,
            timeout,
            self.config.output_limit_bytes,
            Some(request.cancel),
        )
        .context("launch test runner")?;

        if output.cancelled {
            return Err(anyhow!("test runner cancelled"));
        }
        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "test runner timed out");
            return Err(anyhow!("test runner timed out after {:?}", timeout));
        }

        debug!(exit_code = ?output.status.code(), "test runner finished");
        let mut stderr = output.stderr_lossy();
        stderr.push_str(&output.stdout_truncated_notice("runner"));
        stderr.push_str(&output.stderr_truncated_notice("runner"));
        Ok(RawOutput {
            text: output.stdout_lossy(),
            stderr,
            exit_code: output.status.code(),
        })
    }
}
