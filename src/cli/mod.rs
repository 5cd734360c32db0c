//! Command-line interface for buildloop.
//!
//! Provides commands to run jobs through the queues, repair a failing
//! workspace, and dump metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
