//! Local execution shortcut for the reserved `local` target.
//!
//! Commands run in a subshell on the control machine with the same outcome
//! shape as remote sessions; file transfer operations map to plain
//! filesystem IO.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command as ProcessCommand;

use crate::error::SessionError;

use super::{
    is_sudo_password_refusal, shell_command, sudo_wrap, ExecOptions, ExecOutput, FileStat, Session,
};

/// Session implementation backed by `sh -c` on the control machine.
#[derive(Debug, Default)]
pub struct LocalSession;

impl LocalSession {
    pub fn new() -> Self {
        Self
    }

    fn command(line: &str) -> ProcessCommand {
        let mut cmd = ProcessCommand::new("sh");
        cmd.arg("-c").arg(line);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(line: String, opts: &ExecOptions) -> Result<ExecOutput, SessionError> {
        let mut cmd = Self::command(&line);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let work = async {
            let output = cmd.output().await.map_err(SessionError::Io)?;
            Ok(ExecOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        };

        tokio::select! {
            _ = opts.cancel.cancelled() => Err(SessionError::Cancelled),
            result = async {
                match opts.timeout {
                    Some(limit) => tokio::time::timeout(limit, work)
                        .await
                        .map_err(|_| SessionError::Timeout)?,
                    None => work.await,
                }
            } => result,
        }
    }
}

#[async_trait]
impl Session for LocalSession {
    async fn exec(&self, cmd: &str, opts: &ExecOptions) -> Result<ExecOutput, SessionError> {
        Self::run(shell_command(cmd, opts), opts).await
    }

    async fn exec_sudo(
        &self,
        cmd: &str,
        user: Option<&str>,
        opts: &ExecOptions,
    ) -> Result<ExecOutput, SessionError> {
        let wrapped = sudo_wrap(&shell_command(cmd, opts), user)?;
        let output = Self::run(wrapped, opts).await?;
        if is_sudo_password_refusal(&output) {
            return Err(SessionError::SudoPasswordRequired);
        }
        Ok(output)
    }

    async fn exec_streaming(
        &self,
        cmd: &str,
        opts: &ExecOptions,
        on_chunk: &mut (dyn for<'c> FnMut(&'c [u8]) + Send),
    ) -> Result<ExecOutput, SessionError> {
        let line = shell_command(cmd, opts);
        let mut child = Self::command(&line)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SessionError::Io)?;

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Exec("stdout not captured".into()))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::Exec("stderr not captured".into()))?;

        let work = async {
            let mut stdout = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = stdout_pipe.read(&mut buf).await.map_err(SessionError::Io)?;
                if n == 0 {
                    break;
                }
                on_chunk(&buf[..n]);
                stdout.extend_from_slice(&buf[..n]);
            }

            let mut stderr = Vec::new();
            stderr_pipe
                .read_to_end(&mut stderr)
                .await
                .map_err(SessionError::Io)?;
            let status = child.wait().await.map_err(SessionError::Io)?;

            Ok(ExecOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        };

        tokio::select! {
            _ = opts.cancel.cancelled() => Err(SessionError::Cancelled),
            result = async {
                match opts.timeout {
                    Some(limit) => tokio::time::timeout(limit, work)
                        .await
                        .map_err(|_| SessionError::Timeout)?,
                    None => work.await,
                }
            } => result,
        }
    }

    async fn upload(&self, data: &[u8], remote: &str) -> Result<(), SessionError> {
        tokio::fs::write(remote, data).await.map_err(SessionError::Io)
    }

    async fn download(&self, remote: &str) -> Result<Vec<u8>, SessionError> {
        tokio::fs::read(remote).await.map_err(SessionError::Io)
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>, SessionError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                #[cfg(unix)]
                let mode = {
                    use std::os::unix::fs::PermissionsExt;
                    Some(meta.permissions().mode() & 0o7777)
                };
                #[cfg(not(unix))]
                let mode = None;

                Ok(Some(FileStat {
                    size: meta.len(),
                    mode,
                    is_dir: meta.is_dir(),
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SessionError::Io(err)),
        }
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(path).await.map_err(SessionError::Io)
    }

    async fn rm(&self, path: &str) -> Result<(), SessionError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path)
                .await
                .map_err(SessionError::Io),
            Ok(_) => tokio::fs::remove_file(path).await.map_err(SessionError::Io),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SessionError::Io(err)),
        }
    }

    async fn alive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_exec_captures_output_and_exit_code() {
        let session = LocalSession::new();
        let out = session
            .exec("echo hello; echo oops >&2; exit 3", &ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_exec_applies_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let opts = ExecOptions {
            cwd: Some(dir.path().to_string_lossy().into_owned()),
            env: vec![("NEXUS_TEST_VAR".into(), "42".into())],
            ..Default::default()
        };
        let session = LocalSession::new();
        let out = session.exec("pwd; echo $NEXUS_TEST_VAR", &opts).await.unwrap();
        let lines: Vec<_> = out.stdout.lines().collect();
        assert!(lines[0].ends_with(
            dir.path()
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
        ));
        assert_eq!(lines[1], "42");
    }

    #[tokio::test]
    async fn test_exec_times_out() {
        let session = LocalSession::new();
        let opts = ExecOptions::default().with_timeout(Duration::from_millis(100));
        let err = session.exec("sleep 5", &opts).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
    }

    #[tokio::test]
    async fn test_exec_observes_cancellation() {
        let session = LocalSession::new();
        let opts = ExecOptions::default();
        let cancel = opts.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = session.exec("sleep 5", &opts).await.unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
    }

    #[tokio::test]
    async fn test_exec_streaming_delivers_chunks() {
        let session = LocalSession::new();
        let mut seen = Vec::new();
        let out = session
            .exec_streaming(
                "printf 'one\\ntwo\\n'",
                &ExecOptions::default(),
                &mut |chunk| seen.extend_from_slice(chunk),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(String::from_utf8(seen).unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let path_str = path.to_string_lossy().into_owned();
        let payload: Vec<u8> = (0u16..512).map(|b| (b % 251) as u8).collect();

        let session = LocalSession::new();
        session.upload(&payload, &path_str).await.unwrap();
        let read_back = session.download(&path_str).await.unwrap();
        assert_eq!(read_back, payload);

        let stat = session.stat(&path_str).await.unwrap().unwrap();
        assert_eq!(stat.size, payload.len() as u64);
        assert!(!stat.is_dir);
    }

    #[tokio::test]
    async fn test_stat_missing_and_rm_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghost");
        let path_str = path.to_string_lossy().into_owned();

        let session = LocalSession::new();
        assert!(session.stat(&path_str).await.unwrap().is_none());
        session.rm(&path_str).await.unwrap();

        session.mkdir_p(&path_str).await.unwrap();
        assert!(session.stat(&path_str).await.unwrap().unwrap().is_dir);
        session.rm(&path_str).await.unwrap();
        assert!(session.stat(&path_str).await.unwrap().is_none());
    }
}
