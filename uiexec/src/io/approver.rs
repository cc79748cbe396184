//! Approval collaborators consulted when the default policy rejects an attempt.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::types::{Decision, TriageEntry};
use crate::error::ApprovalError;
use crate::io::process::run_command_with_timeout;

const APPROVER_OUTPUT_LIMIT: usize = 64 * 1024;

/// What an approver sees for one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest<'a> {
    pub suite: &'a str,
    pub environment: &'a str,
    pub attempt: u32,
    pub max_attempts: u32,
    pub triage: &'a [TriageEntry],
    /// Decision the default policy reached.
    pub policy: &'a Decision,
}

/// Source of accept/reject decisions beyond the default policy.
pub trait Approver {
    fn approve(&self, request: &ApprovalRequest<'_>) -> Result<Decision, ApprovalError>;
}

impl<T: Approver + ?Sized> Approver for Box<T> {
    fn approve(&self, request: &ApprovalRequest<'_>) -> Result<Decision, ApprovalError> {
        (**self).approve(request)
    }
}

/// Keeps the default policy's decision.
pub struct AutoApprover;

impl Approver for AutoApprover {
    fn approve(&self, request: &ApprovalRequest<'_>) -> Result<Decision, ApprovalError> {
        Ok(request.policy.clone())
    }
}

/// Pipes the request as JSON into an external command.
///
/// Exit status 0 accepts and any other status rejects. Trimmed stdout, when
/// present, becomes the decision note.
pub struct CommandApprover {
    command: Vec<String>,
    timeout: Duration,
    workdir: PathBuf,
}

impl CommandApprover {
    pub fn new(command: Vec<String>, timeout: Duration, workdir: PathBuf) -> Self {
        Self {
            command,
            timeout,
            workdir,
        }
    }
}

impl Approver for CommandApprover {
    fn approve(&self, request: &ApprovalRequest<'_>) -> Result<Decision, ApprovalError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ApprovalError::Failed("approver command is empty".to_string()))?;
        let payload = serde_json::to_vec(request)
            .map_err(|err| ApprovalError::Failed(format!("serialize approval request: {err}")))?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(
            cmd,
            Some(payload.as_slice()),
            self.timeout,
            APPROVER_OUTPUT_LIMIT,
            None,
        )
        .map_err(|err| ApprovalError::Failed(format!("{err:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "approver timed out");
            return Err(ApprovalError::Timeout(self.timeout));
        }

        let stdout = output.stdout_lossy();
        let note = match stdout.trim() {
            "" if output.status.success() => "approved by command".to_string(),
            "" => format!("rejected by command (exit {:?})", output.status.code()),
            text => text.to_string(),
        };
        debug!(exit_code = ?output.status.code(), "approver finished");
        if output.status.success() {
            Ok(Decision::accept(note))
        } else {
            Ok(Decision::reject(note))
        }
    }
}

/// Asks a human on an interactive stream.
///
/// Lines are read on a background thread so a prompt can give up after the
/// configured timeout without blocking the run forever.
pub struct ConsoleApprover {
    lines: Receiver<String>,
    out: Mutex<Box<dyn Write + Send>>,
    timeout: Duration,
}

impl ConsoleApprover {
    pub fn new<R>(input: R, out: Box<dyn Write + Send>, timeout: Duration) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in input.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self {
            lines: rx,
            out: Mutex::new(out),
            timeout,
        }
    }

    /// Console approver bound to the process stdin/stderr.
    pub fn stdio(timeout: Duration) -> Self {
        Self::new(
            std::io::BufReader::new(std::io::stdin()),
            Box::new(std::io::stderr()),
            timeout,
        )
    }

    fn prompt(&self, request: &ApprovalRequest<'_>) -> Result<(), ApprovalError> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| ApprovalError::Failed("console output lock poisoned".to_string()))?;
        let write = |out: &mut Box<dyn Write + Send>| -> std::io::Result<()> {
            writeln!(
                out,
                "\nAttempt {}/{} of {} on {} was rejected by policy:",
                request.attempt, request.max_attempts, request.suite, request.environment
            )?;
            if let Some(note) = &request.policy.note {
                writeln!(out, "  {note}")?;
            }
            for entry in request.triage {
                writeln!(out, "  - {} [{}] {}", entry.test, entry.verdict, entry.rationale)?;
            }
            write!(
                out,
                "Accept anyway? [y/N] (times out in {}s): ",
                self.timeout.as_secs()
            )?;
            out.flush()
        };
        write(&mut *out).map_err(|err| ApprovalError::Failed(format!("write prompt: {err}")))
    }
}

impl Approver for ConsoleApprover {
    fn approve(&self, request: &ApprovalRequest<'_>) -> Result<Decision, ApprovalError> {
        self.prompt(request)?;
        let answer = match self.lines.recv_timeout(self.timeout) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => return Err(ApprovalError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ApprovalError::Failed("console input closed".to_string()));
            }
        };
        info!(answer = answer.trim(), "console approval answered");
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Ok(Decision::accept("approved at console")),
            _ => Ok(Decision::reject("rejected at console")),
        }
    }
}
