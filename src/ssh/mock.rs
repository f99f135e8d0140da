//! Scripted in-memory session for unit tests.
//!
//! Rules map command substrings to canned outputs; unmatched commands
//! succeed with empty output. Every exec is recorded so tests can assert
//! on what ran (and what did not).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SessionError;

use super::{ExecOptions, ExecOutput, FileStat, Session};

struct Rule {
    needle: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

#[derive(Default)]
pub(crate) struct MockSession {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    /// Commands containing this marker raise a fatal connection error.
    fatal_marker: Mutex<Option<String>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a canned response for commands containing `needle`.
    pub fn on(&self, needle: &str, exit_code: i32, stdout: &str) {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: String::new(),
        });
    }

    pub fn on_stderr(&self, needle: &str, exit_code: i32, stderr: &str) {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
    }

    pub fn fail_fatally_on(&self, marker: &str) {
        *self.fatal_marker.lock().unwrap() = Some(marker.to_string());
    }

    pub fn seed_file(&self, path: &str, data: &[u8]) {
        self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn respond(&self, cmd: &str) -> Result<ExecOutput, SessionError> {
        if let Some(marker) = self.fatal_marker.lock().unwrap().as_ref() {
            if cmd.contains(marker.as_str()) {
                return Err(SessionError::ConnectionLost("scripted failure".into()));
            }
        }
        let rules = self.rules.lock().unwrap();
        for rule in rules.iter() {
            if cmd.contains(&rule.needle) {
                return Ok(ExecOutput {
                    exit_code: rule.exit_code,
                    stdout: rule.stdout.clone(),
                    stderr: rule.stderr.clone(),
                });
            }
        }
        Ok(ExecOutput::default())
    }
}

#[async_trait]
impl Session for MockSession {
    async fn exec(&self, cmd: &str, _opts: &ExecOptions) -> Result<ExecOutput, SessionError> {
        self.calls.lock().unwrap().push(cmd.to_string());
        self.respond(cmd)
    }

    async fn exec_sudo(
        &self,
        cmd: &str,
        user: Option<&str>,
        _opts: &ExecOptions,
    ) -> Result<ExecOutput, SessionError> {
        let recorded = match user {
            Some(user) => format!("sudo[{user}]:{cmd}"),
            None => format!("sudo:{cmd}"),
        };
        self.calls.lock().unwrap().push(recorded);
        self.respond(cmd)
    }

    async fn exec_streaming(
        &self,
        cmd: &str,
        opts: &ExecOptions,
        on_chunk: &mut (dyn for<'c> FnMut(&'c [u8]) + Send),
    ) -> Result<ExecOutput, SessionError> {
        let output = self.exec(cmd, opts).await?;
        if !output.stdout.is_empty() {
            on_chunk(output.stdout.as_bytes());
        }
        Ok(output)
    }

    async fn upload(&self, data: &[u8], remote: &str) -> Result<(), SessionError> {
        self.files
            .lock()
            .unwrap()
            .insert(remote.to_string(), data.to_vec());
        Ok(())
    }

    async fn download(&self, remote: &str) -> Result<Vec<u8>, SessionError> {
        self.files
            .lock()
            .unwrap()
            .get(remote)
            .cloned()
            .ok_or_else(|| SessionError::Sftp(format!("no such file: {remote}")))
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>, SessionError> {
        Ok(self.files.lock().unwrap().get(path).map(|data| FileStat {
            size: data.len() as u64,
            mode: Some(0o644),
            is_dir: false,
        }))
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), SessionError> {
        self.calls.lock().unwrap().push(format!("mkdir_p:{path}"));
        Ok(())
    }

    async fn rm(&self, path: &str) -> Result<(), SessionError> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn alive(&self) -> bool {
        true
    }
}
