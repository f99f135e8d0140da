//! Package management across apt, yum, pacman, and Homebrew.
//!
//! One provider parameterized by the package manager the registry picked
//! from `os_family`. Observed properties: `version` and, for
//! `state: latest`, `update_available`.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::resource::{
    CurrentState, Diff, ExecutionContext, PackageState, ResourceKind, ResourceResult,
};
use crate::ssh::{ExecOptions, Session};

use super::Provider;

const PROP_VERSION: &str = "version";
const PROP_CANDIDATE: &str = "candidate";
const PROP_UPDATE_AVAILABLE: &str = "update_available";

/// The concrete package manager to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Yum,
    Pacman,
    Brew,
}

impl PackageManager {
    fn install_cmd(&self, name: &str) -> String {
        let name = shell_words::quote(name).into_owned();
        match self {
            PackageManager::Apt => {
                format!("DEBIAN_FRONTEND=noninteractive apt-get install -y {name}")
            }
            PackageManager::Yum => format!("yum install -y {name}"),
            PackageManager::Pacman => format!("pacman -S --noconfirm {name}"),
            PackageManager::Brew => format!("brew install {name}"),
        }
    }

    fn remove_cmd(&self, name: &str) -> String {
        let name = shell_words::quote(name).into_owned();
        match self {
            PackageManager::Apt => {
                format!("DEBIAN_FRONTEND=noninteractive apt-get remove -y {name}")
            }
            PackageManager::Yum => format!("yum remove -y {name}"),
            PackageManager::Pacman => format!("pacman -R --noconfirm {name}"),
            PackageManager::Brew => format!("brew uninstall {name}"),
        }
    }

    fn upgrade_cmd(&self, name: &str) -> String {
        let name = shell_words::quote(name).into_owned();
        match self {
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y --only-upgrade {name}"
            ),
            PackageManager::Yum => format!("yum update -y {name}"),
            PackageManager::Pacman => format!("pacman -S --noconfirm {name}"),
            PackageManager::Brew => format!("brew upgrade {name}"),
        }
    }
}

/// Package provider for one manager.
pub struct PackageProvider {
    manager: PackageManager,
}

impl PackageProvider {
    pub fn new(manager: PackageManager) -> Self {
        Self { manager }
    }

    fn resource<'a>(kind: &'a ResourceKind) -> &'a crate::resource::PackageResource {
        match kind {
            ResourceKind::Package(r) => r,
            _ => unreachable!("registry routes only package resources here"),
        }
    }

    async fn query(
        &self,
        name: &str,
        session: &dyn Session,
        opts: &ExecOptions,
    ) -> Result<CurrentState, ProviderError> {
        let quoted = shell_words::quote(name).into_owned();
        match self.manager {
            PackageManager::Apt => {
                let out = session
                    .exec(&format!("apt-cache policy {quoted}"), opts)
                    .await?;
                let installed = scrape_field(&out.stdout, "Installed:");
                let candidate = scrape_field(&out.stdout, "Candidate:");
                let exists = installed.as_deref().is_some_and(|v| v != "(none)");
                let mut state = if exists {
                    CurrentState::present().with_prop(PROP_VERSION, installed.unwrap_or_default())
                } else {
                    CurrentState::absent()
                };
                if let Some(candidate) = candidate {
                    let available = state
                        .prop(PROP_VERSION)
                        .is_some_and(|installed| installed != candidate);
                    state = state
                        .with_prop(PROP_CANDIDATE, candidate)
                        .with_prop(PROP_UPDATE_AVAILABLE, available.to_string());
                }
                Ok(state)
            }
            PackageManager::Yum => {
                let out = session
                    .exec(
                        &format!("rpm -q --qf '%{{VERSION}}-%{{RELEASE}}' {quoted}"),
                        opts,
                    )
                    .await?;
                if !out.success() {
                    return Ok(CurrentState::absent());
                }
                let mut state =
                    CurrentState::present().with_prop(PROP_VERSION, out.stdout.trim());
                let update = session
                    .exec(&format!("yum -q check-update {quoted}"), opts)
                    .await?;
                state = state.with_prop(PROP_UPDATE_AVAILABLE, (update.exit_code == 100).to_string());
                Ok(state)
            }
            PackageManager::Pacman => {
                let out = session.exec(&format!("pacman -Q {quoted}"), opts).await?;
                if !out.success() {
                    return Ok(CurrentState::absent());
                }
                let version = out.stdout.split_whitespace().nth(1).unwrap_or("").to_string();
                let update = session.exec(&format!("pacman -Qu {quoted}"), opts).await?;
                Ok(CurrentState::present()
                    .with_prop(PROP_VERSION, version)
                    .with_prop(PROP_UPDATE_AVAILABLE, update.success().to_string()))
            }
            PackageManager::Brew => {
                let out = session
                    .exec(&format!("brew list --versions {quoted}"), opts)
                    .await?;
                if !out.success() || out.stdout.trim().is_empty() {
                    return Ok(CurrentState::absent());
                }
                let version = out.stdout.split_whitespace().nth(1).unwrap_or("").to_string();
                let update = session
                    .exec(&format!("brew outdated --quiet {quoted}"), opts)
                    .await?;
                let outdated = update.stdout.lines().any(|l| l.trim() == name);
                Ok(CurrentState::present()
                    .with_prop(PROP_VERSION, version)
                    .with_prop(PROP_UPDATE_AVAILABLE, outdated.to_string()))
            }
        }
    }
}

fn scrape_field(text: &str, label: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.trim().strip_prefix(label).map(|v| v.trim().to_string()))
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl Provider for PackageProvider {
    async fn check(
        &self,
        resource: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<CurrentState, ProviderError> {
        let pkg = Self::resource(resource);
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());
        self.query(&pkg.name, session, &opts).await
    }

    fn diff(&self, resource: &ResourceKind, current: &CurrentState) -> Diff {
        let pkg = Self::resource(resource);
        let mut diff = Diff::unchanged();
        match pkg.state {
            PackageState::Installed => {
                if !current.exists {
                    diff.record("state", "absent", "installed", format!("install {}", pkg.name));
                }
            }
            PackageState::Removed => {
                if current.exists {
                    diff.record("state", "installed", "absent", format!("remove {}", pkg.name));
                }
            }
            PackageState::Latest => {
                if !current.exists {
                    diff.record("state", "absent", "installed", format!("install {}", pkg.name));
                } else if current.prop(PROP_UPDATE_AVAILABLE) == Some("true") {
                    let installed = current.prop(PROP_VERSION).unwrap_or("unknown");
                    let candidate = current.prop(PROP_CANDIDATE).unwrap_or("latest");
                    diff.record(
                        PROP_VERSION,
                        installed,
                        candidate,
                        format!("upgrade {} {} -> {}", pkg.name, installed, candidate),
                    );
                }
            }
        }
        diff
    }

    async fn apply(
        &self,
        resource: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<ResourceResult, ProviderError> {
        let pkg = Self::resource(resource);
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());

        let cmd = match pkg.state {
            PackageState::Installed => self.manager.install_cmd(&pkg.name),
            PackageState::Removed => self.manager.remove_cmd(&pkg.name),
            PackageState::Latest => {
                let current = self.query(&pkg.name, session, &opts).await?;
                if current.exists {
                    self.manager.upgrade_cmd(&pkg.name)
                } else {
                    self.manager.install_cmd(&pkg.name)
                }
            }
        };

        let out = session.exec(&cmd, &opts).await?;
        if !out.success() {
            return Err(ProviderError::ApplyFailed(out.combined()));
        }
        Ok(ResourceResult::applied(resource.describe()))
    }
}
