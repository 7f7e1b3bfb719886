//! External command execution with timing and peak-memory accounting.
//!
//! Every pipeline stage that shells out goes through [`ProcessRunner`]. It
//! applies an environment overlay (how secrets reach the tools), enforces an
//! optional wall-clock timeout, captures output, and reports duration and
//! peak resident memory of the process tree.

pub mod memory;
pub mod runner;

pub use runner::{ProcessError, ProcessOutput, ProcessRunner, ProcessSpec, StageMetrics};
