//! Service management through systemd and launchd.
//!
//! Observed properties: `running` and `enabled`, both "true"/"false".

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::resource::{
    CurrentState, Diff, ExecutionContext, ResourceKind, ResourceResult, ServiceResource,
    ServiceState,
};
use crate::ssh::{ExecOptions, Session};

use super::Provider;

const PROP_RUNNING: &str = "running";
const PROP_ENABLED: &str = "enabled";

fn resource(kind: &ResourceKind) -> &ServiceResource {
    match kind {
        ResourceKind::Service(r) => r,
        _ => unreachable!("registry routes only service resources here"),
    }
}

/// Shared diff logic for both service providers.
fn service_diff(svc: &ServiceResource, current: &CurrentState) -> Diff {
    let mut diff = Diff::unchanged();
    let running = current.prop(PROP_RUNNING) == Some("true");

    match svc.state {
        ServiceState::Running if !running => {
            diff.record(PROP_RUNNING, "false", "true", format!("start {}", svc.name));
        }
        ServiceState::Stopped if running => {
            diff.record(PROP_RUNNING, "true", "false", format!("stop {}", svc.name));
        }
        _ => {}
    }

    if let Some(want_enabled) = svc.enabled {
        let enabled = current.prop(PROP_ENABLED) == Some("true");
        if want_enabled != enabled {
            let verb = if want_enabled { "enable" } else { "disable" };
            diff.record(
                PROP_ENABLED,
                enabled.to_string(),
                want_enabled.to_string(),
                format!("{verb} {}", svc.name),
            );
        }
    }

    diff
}

/// systemd provider for Linux hosts.
pub struct SystemdProvider;

#[async_trait]
impl Provider for SystemdProvider {
    async fn check(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<CurrentState, ProviderError> {
        let svc = resource(kind);
        let name = shell_words::quote(&svc.name).into_owned();
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());

        let active = session
            .exec(&format!("systemctl is-active {name}"), &opts)
            .await?;
        let enabled = session
            .exec(&format!("systemctl is-enabled {name}"), &opts)
            .await?;

        let running = active.stdout.trim() == "active";
        let is_enabled = enabled.stdout.trim() == "enabled";
        let known = active.stdout.trim() != "unknown";

        Ok(CurrentState {
            exists: known,
            properties: [
                (PROP_RUNNING.to_string(), running.to_string()),
                (PROP_ENABLED.to_string(), is_enabled.to_string()),
            ]
            .into_iter()
            .collect(),
        })
    }

    fn diff(&self, kind: &ResourceKind, current: &CurrentState) -> Diff {
        service_diff(resource(kind), current)
    }

    async fn apply(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<ResourceResult, ProviderError> {
        let svc = resource(kind);
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());
        let current = self.check(kind, session, ctx).await?;
        let pending = service_diff(svc, &current);
        let name = shell_words::quote(&svc.name).into_owned();

        for change in &pending.changes {
            let verb = change.split_whitespace().next().unwrap_or("");
            let cmd = format!("systemctl {verb} {name}");
            let out = session.exec(&cmd, &opts).await?;
            if !out.success() {
                return Err(ProviderError::ApplyFailed(format!(
                    "{cmd}: {}",
                    out.combined()
                )));
            }
        }

        Ok(ResourceResult::applied(kind.describe()))
    }
}

/// launchd provider for macOS hosts.
pub struct LaunchdProvider;

#[async_trait]
impl Provider for LaunchdProvider {
    async fn check(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<CurrentState, ProviderError> {
        let svc = resource(kind);
        let name = shell_words::quote(&svc.name).into_owned();
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());

        // Listed means loaded; a numeric PID in the first column means running.
        let out = session
            .exec(&format!("launchctl list {name}"), &opts)
            .await?;
        let loaded = out.success();
        let running = loaded
            && out
                .stdout
                .lines()
                .any(|line| line.contains("\"PID\"") || line.split_whitespace().next().is_some_and(|c| c.parse::<u32>().is_ok()));

        Ok(CurrentState {
            exists: loaded,
            properties: [
                (PROP_RUNNING.to_string(), running.to_string()),
                (PROP_ENABLED.to_string(), loaded.to_string()),
            ]
            .into_iter()
            .collect(),
        })
    }

    fn diff(&self, kind: &ResourceKind, current: &CurrentState) -> Diff {
        service_diff(resource(kind), current)
    }

    async fn apply(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<ResourceResult, ProviderError> {
        let svc = resource(kind);
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());
        let current = self.check(kind, session, ctx).await?;
        let pending = service_diff(svc, &current);
        let name = shell_words::quote(&svc.name).into_owned();

        for change in &pending.changes {
            let verb = change.split_whitespace().next().unwrap_or("");
            let cmd = match verb {
                "start" => format!("launchctl start {name}"),
                "stop" => format!("launchctl stop {name}"),
                "enable" => format!("launchctl enable system/{name}"),
                "disable" => format!("launchctl disable system/{name}"),
                other => {
                    return Err(ProviderError::ApplyFailed(format!(
                        "unknown service action '{other}'"
                    )))
                }
            };
            let out = session.exec(&cmd, &opts).await?;
            if !out.success() {
                return Err(ProviderError::ApplyFailed(format!(
                    "{cmd}: {}",
                    out.combined()
                )));
            }
        }

        Ok(ResourceResult::applied(kind.describe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::Facts;
    use crate::ssh::mock::MockSession;
    use std::sync::Arc;

    fn svc(state: ServiceState, enabled: Option<bool>) -> ResourceKind {
        ResourceKind::Service(ServiceResource {
            name: "nginx".into(),
            state,
            enabled,
        })
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Arc::new(Facts::for_os("linux", "debian")), "web1")
    }

    #[tokio::test]
    async fn test_systemd_stopped_service_needs_start() {
        let session = MockSession::new();
        session.on("is-active", 3, "inactive");
        session.on("is-enabled", 1, "disabled");

        let provider = SystemdProvider;
        let kind = svc(ServiceState::Running, Some(true));
        let current = provider.check(&kind, &session, &ctx()).await.unwrap();
        let diff = provider.diff(&kind, &current);

        assert!(diff.changed);
        assert_eq!(diff.changes, vec!["start nginx", "enable nginx"]);
    }

    #[tokio::test]
    async fn test_systemd_running_service_is_clean() {
        let session = MockSession::new();
        session.on("is-active", 0, "active");
        session.on("is-enabled", 0, "enabled");

        let provider = SystemdProvider;
        let kind = svc(ServiceState::Running, Some(true));
        let current = provider.check(&kind, &session, &ctx()).await.unwrap();
        assert!(!provider.diff(&kind, &current).changed);
    }

    #[tokio::test]
    async fn test_systemd_apply_issues_actions() {
        let session = MockSession::new();
        session.on("is-active", 3, "inactive");
        session.on("is-enabled", 1, "disabled");

        let provider = SystemdProvider;
        let kind = svc(ServiceState::Running, Some(true));
        provider.apply(&kind, &session, &ctx()).await.unwrap();

        let calls = session.calls();
        assert!(calls.iter().any(|c| c == "systemctl start nginx"));
        assert!(calls.iter().any(|c| c == "systemctl enable nginx"));
    }

    #[tokio::test]
    async fn test_systemd_stop_when_stopped_desired() {
        let session = MockSession::new();
        session.on("is-active", 0, "active");
        session.on("is-enabled", 0, "enabled");

        let provider = SystemdProvider;
        let kind = svc(ServiceState::Stopped, None);
        let current = provider.check(&kind, &session, &ctx()).await.unwrap();
        let diff = provider.diff(&kind, &current);
        assert_eq!(diff.changes, vec!["stop nginx"]);
    }

    #[tokio::test]
    async fn test_launchd_unloaded_service() {
        let session = MockSession::new();
        session.on("launchctl list", 113, "");

        let provider = LaunchdProvider;
        let kind = svc(ServiceState::Running, None);
        let current = provider.check(&kind, &session, &ctx()).await.unwrap();
        assert!(!current.exists);
        assert!(provider.diff(&kind, &current).changed);
    }
}
