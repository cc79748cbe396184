//! Error taxonomy for orchestration steps.
//!
//! Fatal errors end the run with `terminal_reason = fatal_error`. Classification
//! failures are never fatal; Triage absorbs them into an `inconclusive` verdict.

use std::time::Duration;

use thiserror::Error;

use crate::core::types::{ErrorKind, FatalError};

/// A fatal failure raised by a step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("invalid run configuration: {0}")]
    Config(String),
    #[error("test runner failed: {0}")]
    Execution(String),
    #[error("unrecognized runner output: {0}")]
    Parse(String),
    #[error("no approval received within {}s", .0.as_secs())]
    ApprovalTimeout(Duration),
    #[error("approval collaborator failed: {0}")]
    Approval(String),
    #[error("run cancelled {0}")]
    Cancelled(String),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Config(_) => ErrorKind::Config,
            StepError::Execution(_) => ErrorKind::Execution,
            StepError::Parse(_) => ErrorKind::Parse,
            StepError::ApprovalTimeout(_) => ErrorKind::ApprovalTimeout,
            StepError::Approval(_) => ErrorKind::Approval,
            StepError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn to_fatal(&self) -> FatalError {
        FatalError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Failure of a single classification call.
#[derive(Debug, Clone, Error)]
pub enum ClassificationError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error("classifier timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("classifier failed: {0}")]
    Failed(String),
    #[error("unparseable classifier output: {message}")]
    Unparseable { message: String, raw: String },
}

/// Failure of the approval collaborator.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("{0}")]
    Failed(String),
}

impl From<ApprovalError> for StepError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::Timeout(limit) => StepError::ApprovalTimeout(limit),
            ApprovalError::Failed(message) => StepError::Approval(message),
        }
    }
}
