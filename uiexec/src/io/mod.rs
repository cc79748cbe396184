//! Side-effecting collaborators: processes, config files, templates and logs.

pub mod approver;
pub mod attempt_log;
pub mod classifier;
pub mod config;
pub mod process;
pub mod prompt;
pub mod test_runner;
