//! Command-line interface for pipequeue.
//!
//! Provides the relay, supervisor, status and worker entry points, plus a
//! small publisher for feeding test messages into a pipeline.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
