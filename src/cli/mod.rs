//! Command-line interface for nexus.
//!
//! Provides commands for running task pipelines, inspecting and
//! validating configs, scaffolding a starter config, and preflighting
//! the fleet.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
