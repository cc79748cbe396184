//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod machine;
pub mod nudge;
pub mod parse;
pub mod policy;
pub mod router;
pub mod state;
pub mod types;
