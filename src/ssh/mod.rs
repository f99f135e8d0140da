//! Session layer: the exec/SFTP contract the engine drives, with a russh
//! implementation for remote hosts and a subshell implementation for the
//! reserved local target.
//!
//! Everything above this module (pool, providers, task runner) talks to
//! `dyn Session`; nothing else touches russh directly.

pub mod auth;
pub mod local;
pub mod session;
pub mod ssh_config;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::common::CancellationToken;
use crate::error::SessionError;

pub use local::LocalSession;
pub use session::{SshConnector, SshSession};
pub use ssh_config::{HostOverride, SshConfigMap};

/// Options applied to a single exec call.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub cancel: CancellationToken,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            cwd: None,
            env: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

impl ExecOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Outcome of one executed command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr joined, trimmed, for result reporting.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Subset of stat information the engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mode: Option<u32>,
    pub is_dir: bool,
}

/// A live execution channel to one host.
///
/// `exec_streaming` delivers chunks lazily; the stream is finite and not
/// restartable. SFTP-style operations transfer binary-faithful bytes.
#[async_trait]
pub trait Session: Send + Sync {
    async fn exec(&self, cmd: &str, opts: &ExecOptions) -> Result<ExecOutput, SessionError>;

    /// Runs `cmd` under non-interactive privilege escalation. Fails fast
    /// with `SudoPasswordRequired` when the remote requires a password.
    async fn exec_sudo(
        &self,
        cmd: &str,
        user: Option<&str>,
        opts: &ExecOptions,
    ) -> Result<ExecOutput, SessionError>;

    async fn exec_streaming(
        &self,
        cmd: &str,
        opts: &ExecOptions,
        on_chunk: &mut (dyn for<'c> FnMut(&'c [u8]) + Send),
    ) -> Result<ExecOutput, SessionError>;

    async fn upload(&self, data: &[u8], remote: &str) -> Result<(), SessionError>;

    async fn download(&self, remote: &str) -> Result<Vec<u8>, SessionError>;

    async fn stat(&self, path: &str) -> Result<Option<FileStat>, SessionError>;

    async fn mkdir_p(&self, path: &str) -> Result<(), SessionError>;

    async fn rm(&self, path: &str) -> Result<(), SessionError>;

    async fn alive(&self) -> bool;
}

/// Builds the shell line for an exec call: env exports, then cwd, then the
/// command itself.
pub(crate) fn shell_command(cmd: &str, opts: &ExecOptions) -> String {
    let mut line = String::new();
    for (key, value) in &opts.env {
        line.push_str(&format!("export {}={}; ", key, shell_words::quote(value)));
    }
    if let Some(cwd) = &opts.cwd {
        line.push_str(&format!("cd {} && ", shell_words::quote(cwd)));
    }
    line.push_str(cmd);
    line
}

/// Wraps a command with `sudo -n`, validating the target user.
pub(crate) fn sudo_wrap(cmd: &str, user: Option<&str>) -> Result<String, SessionError> {
    if let Some(user) = user {
        let valid = Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("static regex");
        if !valid.is_match(user) {
            return Err(SessionError::InvalidSudoUser(user.to_string()));
        }
        Ok(format!("sudo -n -u {} sh -c {}", user, shell_words::quote(cmd)))
    } else {
        Ok(format!("sudo -n sh -c {}", shell_words::quote(cmd)))
    }
}

/// Recognizes sudo's non-interactive refusal so callers can fail fast.
pub(crate) fn is_sudo_password_refusal(output: &ExecOutput) -> bool {
    !output.success()
        && (output.stderr.contains("a password is required")
            || output.stderr.contains("a terminal is required"))
}
