//! OS-specific provider implementations of the resource kinds.
//!
//! Every provider obeys the same contract:
//! - `check` is read-only,
//! - `diff` is pure over (resource, current state),
//! - `apply` is a no-op when there is no drift, and never runs in
//!   check mode (the executor short-circuits before calling it).

pub mod account;
pub mod exec;
pub mod fs;
pub mod package;
pub mod service;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::ssh::Session;

use super::{CurrentState, Diff, ExecutionContext, ResourceKind, ResourceResult};

/// The four-operation provider interface.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Observes the current state of the resource on the host.
    async fn check(
        &self,
        resource: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<CurrentState, ProviderError>;

    /// Computes the pending transformation. Equal inputs yield equal
    /// outputs; no IO happens here.
    fn diff(&self, resource: &ResourceKind, current: &CurrentState) -> Diff;

    /// Performs the transition toward the desired state.
    async fn apply(
        &self,
        resource: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<ResourceResult, ProviderError>;

    /// Short description for results and logs.
    fn describe(&self, resource: &ResourceKind) -> String {
        resource.describe()
    }
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Provider")
    }
}

pub use account::{DarwinAccountProvider, LinuxAccountProvider};
pub use exec::ExecProvider;
pub use fs::UnixFsProvider;
pub use package::{PackageManager, PackageProvider};
pub use service::{LaunchdProvider, SystemdProvider};
