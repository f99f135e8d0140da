//! Guarded one-shot commands.
//!
//! Guards run during `check` and are evaluated in declaration order
//! (`creates`, `removes`, `unless`, `onlyif`); the first one that says
//! "skip" short-circuits the rest. A skipped exec produces a clean diff,
//! so the executor reports it as `ok` without running anything.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::resource::{
    CurrentState, Diff, ExecResource, ExecutionContext, ResourceKind, ResourceResult,
};
use crate::ssh::{ExecOptions, Session};

use super::Provider;

const PROP_SKIP: &str = "skip";

fn resource(kind: &ResourceKind) -> &ExecResource {
    match kind {
        ResourceKind::Exec(r) => r,
        _ => unreachable!("registry routes only exec resources here"),
    }
}

/// Always-supported provider for the command resource.
pub struct ExecProvider;

impl ExecProvider {
    async fn guard_skip(
        exec: &ExecResource,
        session: &dyn Session,
        opts: &ExecOptions,
    ) -> Result<Option<String>, ProviderError> {
        if let Some(path) = &exec.creates {
            if session.stat(path).await?.is_some() {
                return Ok(Some(format!("creates: {path} already exists")));
            }
        }
        if let Some(path) = &exec.removes {
            if session.stat(path).await?.is_none() {
                return Ok(Some(format!("removes: {path} does not exist")));
            }
        }
        if let Some(cmd) = &exec.unless {
            let out = session.exec(cmd, opts).await?;
            if out.success() {
                return Ok(Some("unless: command exited 0".to_string()));
            }
        }
        if let Some(cmd) = &exec.onlyif {
            let out = session.exec(cmd, opts).await?;
            if !out.success() {
                return Ok(Some(format!("onlyif: command exited {}", out.exit_code)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Provider for ExecProvider {
    async fn check(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<CurrentState, ProviderError> {
        let exec = resource(kind);
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());
        let mut state = CurrentState::present();
        if let Some(reason) = Self::guard_skip(exec, session, &opts).await? {
            state = state.with_prop(PROP_SKIP, reason);
        }
        Ok(state)
    }

    fn diff(&self, kind: &ResourceKind, current: &CurrentState) -> Diff {
        let exec = resource(kind);
        let mut diff = Diff::unchanged();
        if current.prop(PROP_SKIP).is_none() {
            diff.record("run", "", &exec.cmd, format!("run {}", exec.cmd));
        }
        diff
    }

    async fn apply(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<ResourceResult, ProviderError> {
        let exec = resource(kind);
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());

        let out = session.exec(&exec.cmd, &opts).await?;
        if !out.success() {
            return Err(ProviderError::ApplyFailed(format!(
                "exit {}: {}",
                out.exit_code,
                out.combined()
            )));
        }

        let mut result = ResourceResult::applied(kind.describe());
        let combined = out.combined();
        if !combined.is_empty() {
            result = result.with_message(combined);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::Facts;
    use crate::ssh::mock::MockSession;
    use std::sync::Arc;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Arc::new(Facts::for_os("linux", "debian")), "web1")
    }

    fn exec_with(f: impl FnOnce(&mut ExecResource)) -> ResourceKind {
        let mut exec = ExecResource {
            cmd: "make install".into(),
            ..Default::default()
        };
        f(&mut exec);
        ResourceKind::Exec(exec)
    }

    #[tokio::test]
    async fn test_creates_guard_skips_when_path_exists() {
        let session = MockSession::new();
        session.seed_file("/usr/local/bin/tool", b"");

        let provider = ExecProvider;
        let kind = exec_with(|e| e.creates = Some("/usr/local/bin/tool".into()));
        let current = provider.check(&kind, &session, &ctx()).await.unwrap();
        assert!(current.prop("skip").unwrap().contains("already exists"));
        assert!(!provider.diff(&kind, &current).changed);
    }

    #[tokio::test]
    async fn test_creates_guard_runs_when_path_missing() {
        let session = MockSession::new();
        let provider = ExecProvider;
        let kind = exec_with(|e| e.creates = Some("/usr/local/bin/tool".into()));
        let current = provider.check(&kind, &session, &ctx()).await.unwrap();
        assert!(current.prop("skip").is_none());

        let diff = provider.diff(&kind, &current);
        assert!(diff.changed);
        assert_eq!(diff.changes, vec!["run make install"]);
    }

    #[tokio::test]
    async fn test_removes_guard_skips_when_path_missing() {
        let session = MockSession::new();
        let provider = ExecProvider;
        let kind = exec_with(|e| e.removes = Some("/var/run/stale.pid".into()));
        let current = provider.check(&kind, &session, &ctx()).await.unwrap();
        assert!(current.prop("skip").unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_unless_guard() {
        let session = MockSession::new();
        session.on("which tool", 0, "/usr/bin/tool");

        let provider = ExecProvider;
        let kind = exec_with(|e| e.unless = Some("which tool".into()));
        let current = provider.check(&kind, &session, &ctx()).await.unwrap();
        assert!(current.prop("skip").unwrap().starts_with("unless"));
    }

    #[tokio::test]
    async fn test_onlyif_guard() {
        let session = MockSession::new();
        session.on("test -f /etc/flag", 1, "");

        let provider = ExecProvider;
        let kind = exec_with(|e| e.onlyif = Some("test -f /etc/flag".into()));
        let current = provider.check(&kind, &session, &ctx()).await.unwrap();
        assert!(current.prop("skip").unwrap().starts_with("onlyif"));
    }

    #[tokio::test]
    async fn test_guard_order_creates_first() {
        let session = MockSession::new();
        session.seed_file("/made", b"");
        session.on("unless-probe", 0, "");

        let provider = ExecProvider;
        let kind = exec_with(|e| {
            e.creates = Some("/made".into());
            e.unless = Some("unless-probe".into());
        });
        let current = provider.check(&kind, &session, &ctx()).await.unwrap();
        // creates wins; the unless command is never run.
        assert!(current.prop("skip").unwrap().starts_with("creates"));
        assert!(session.calls().is_empty());
    }

    #[tokio::test]
    async fn test_apply_runs_command_and_captures_output() {
        let session = MockSession::new();
        session.on("make install", 0, "installed 4 files");

        let provider = ExecProvider;
        let kind = exec_with(|_| {});
        let result = provider.apply(&kind, &session, &ctx()).await.unwrap();
        assert_eq!(result.status, crate::resource::ResourceStatus::Changed);
        assert_eq!(result.message.as_deref(), Some("installed 4 files"));
    }

    #[tokio::test]
    async fn test_apply_failure() {
        let session = MockSession::new();
        session.on_stderr("make install", 2, "no rule to make target");

        let provider = ExecProvider;
        let err = provider
            .apply(&exec_with(|_| {}), &session, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ApplyFailed(msg) if msg.contains("no rule")));
    }
}
