//! Error types for nexus operations.
//!
//! Defines error types for all major subsystems:
//! - Configuration loading and reference validation
//! - Dependency graph construction
//! - SSH sessions and the connection pool
//! - Resource providers
//! - Pipeline execution
//! - Step execution inside the task runner

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid host spec '{0}': expected [user@]host[:port]")]
    InvalidHostSpec(String),

    #[error("Task '{task}' targets unknown host or group '{target}'")]
    UnknownTarget { task: String, target: String },

    #[error("Group '{group}' references unknown host '{host}'")]
    UnknownGroupMember { group: String, host: String },

    #[error("Task '{task}' depends on unknown task '{dep}'")]
    UnknownDependency { task: String, dep: String },

    #[error("Resource in task '{task}' notifies unknown handler '{handler}'")]
    UnknownHandler { task: String, handler: String },

    #[error("Path traversal is not allowed in '{0}'")]
    PathTraversal(String),

    #[error("Invalid artifact name '{0}': must match [A-Za-z0-9._-]+ with no directory separators")]
    InvalidArtifactName(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while building or querying the task dependency graph.
#[derive(Debug, Error)]
pub enum DagError {
    /// A dependency cycle, with a witness path `v0 -> v1 -> ... -> v0`.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// Dependencies on tasks that do not exist, as (task, missing dep) pairs.
    #[error("Unknown dependencies: {}", missing.iter().map(|(t, d)| format!("{t} -> {d}")).collect::<Vec<_>>().join(", "))]
    MissingDeps { missing: Vec<(String, String)> },

    #[error("Unknown task '{0}' in subgraph targets")]
    UnknownVertex(String),
}

/// Errors raised by a live session or while establishing one.
///
/// `is_fatal` distinguishes session-level failures (the pool destroys the
/// session and the next checkout dials a replacement) from command-level
/// failures (the session is returned to the pool).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection to '{host}' failed: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("Authentication failed for host '{host}'")]
    AuthFailed { host: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("No usable authentication method for host '{host}'")]
    NoAuthMethod { host: String },

    #[error("Private key '{0}' is group- or world-readable; refusing to use it")]
    KeyPermissions(PathBuf),

    #[error("Remote host requires a sudo password; non-interactive escalation failed")]
    SudoPasswordRequired,

    #[error("Invalid sudo user '{0}'")]
    InvalidSudoUser(String),

    #[error("Command timed out")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("Exec failed: {0}")]
    Exec(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the underlying session is unusable and must be evicted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionFailed { .. }
                | SessionError::AuthFailed { .. }
                | SessionError::ConnectionLost(_)
                | SessionError::NoAuthMethod { .. }
        )
    }
}

/// Errors raised by the connection pool itself.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool is closed")]
    Closed,

    #[error("Timed out waiting for a free session to '{host}'")]
    CheckoutTimeout { host: String },

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Errors raised by resource providers.
///
/// The resource executor converts every variant into a failed
/// `ResourceResult`; these never escape past it.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unsupported OS: {family}")]
    UnsupportedOs { family: String },

    #[error("check failed: {0}")]
    CheckFailed(String),

    #[error("apply failed: {0}")]
    ApplyFailed(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Errors raised while executing a single step on a host.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Template rendering failed: {0}")]
    Template(#[from] tera::Error),

    #[error("Health check failed: {0}")]
    Health(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that prevent a pipeline from starting.
///
/// Runtime failures never surface here; they are reported through
/// `PipelineResult` with `status = error` and populated task results.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown tasks: {}", names.join(", "))]
    UnknownTasks { names: Vec<String> },

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_formats_witness_path() {
        let err = DagError::Cycle {
            path: vec!["a".into(), "b".into(), "c".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> c -> a");
    }

    #[test]
    fn test_missing_deps_error_lists_pairs() {
        let err = DagError::MissingDeps {
            missing: vec![("deploy".into(), "build".into())],
        };
        assert!(err.to_string().contains("deploy -> build"));
    }

    #[test]
    fn test_session_error_fatality() {
        assert!(SessionError::ConnectionLost("reset".into()).is_fatal());
        assert!(SessionError::AuthFailed { host: "web1".into() }.is_fatal());
        assert!(!SessionError::Timeout.is_fatal());
        assert!(!SessionError::Exec("exit 1".into()).is_fatal());
    }

    #[test]
    fn test_unsupported_os_message() {
        let err = ProviderError::UnsupportedOs { family: "solaris".into() };
        assert_eq!(err.to_string(), "unsupported OS: solaris");
    }
}
