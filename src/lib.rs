//! Nexus: SSH fleet orchestration.
//!
//! A declarative config of hosts, groups, tasks, handlers, and resources
//! is compiled into a dependency graph and executed phase by phase across
//! local and remote machines, with idempotent resources, deduplicated
//! handler notifications, and a bounded per-host SSH connection pool.

// Core modules
pub mod cli;
pub mod common;
pub mod config;
pub mod dag;
pub mod error;
pub mod facts;
pub mod handlers;
pub mod pipeline;
pub mod pool;
pub mod preflight;
pub mod resource;
pub mod runner;
pub mod ssh;
pub mod telemetry;

// Re-export commonly used error types
pub use error::{
    ConfigError, DagError, PipelineError, PoolError, ProviderError, SessionError, StepError,
};
