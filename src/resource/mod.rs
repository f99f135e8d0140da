//! Declarative resources: model types, provider registry, and the
//! check/diff/apply executor.
//!
//! A resource names a desired state (package installed, service running,
//! file content present). Providers observe the current state, compute a
//! diff, and apply the transition only when the diff reports drift.

pub mod executor;
pub mod providers;
pub mod registry;
pub mod when;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::common::CancellationToken;
use crate::facts::Facts;

pub use executor::ResourceExecutor;
pub use registry::ProviderRegistry;
pub use when::Predicate;

/// Desired package state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    Installed,
    Removed,
    Latest,
}

/// Desired service run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
}

/// Presence for files, directories, users, and groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ensure {
    #[default]
    Present,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageResource {
    pub name: String,
    pub state: PackageState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResource {
    pub name: String,
    pub state: ServiceState,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResource {
    pub path: String,
    /// Desired content; `source` files are resolved into this at load time.
    pub content: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Octal mode string, e.g. "0644".
    pub mode: Option<String>,
    pub state: Ensure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryResource {
    pub path: String,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<String>,
    pub state: Ensure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserResource {
    pub name: String,
    pub uid: Option<u32>,
    pub groups: Vec<String>,
    pub shell: Option<String>,
    pub home: Option<String>,
    pub state: Ensure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupResource {
    pub name: String,
    pub gid: Option<u32>,
    pub state: Ensure,
}

/// Guarded one-shot command. Guards are evaluated in declaration order
/// (`creates`, `removes`, `unless`, `onlyif`); the first skip wins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecResource {
    pub cmd: String,
    pub creates: Option<String>,
    pub removes: Option<String>,
    pub unless: Option<String>,
    pub onlyif: Option<String>,
}

/// The tagged resource variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Package(PackageResource),
    Service(ServiceResource),
    File(FileResource),
    Directory(DirectoryResource),
    User(UserResource),
    Group(GroupResource),
    Exec(ExecResource),
}

impl ResourceKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResourceKind::Package(_) => "package",
            ResourceKind::Service(_) => "service",
            ResourceKind::File(_) => "file",
            ResourceKind::Directory(_) => "directory",
            ResourceKind::User(_) => "user",
            ResourceKind::Group(_) => "group",
            ResourceKind::Exec(_) => "exec",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ResourceKind::Package(r) => format!("package[{}]", r.name),
            ResourceKind::Service(r) => format!("service[{}]", r.name),
            ResourceKind::File(r) => format!("file[{}]", r.path),
            ResourceKind::Directory(r) => format!("directory[{}]", r.path),
            ResourceKind::User(r) => format!("user[{}]", r.name),
            ResourceKind::Group(r) => format!("group[{}]", r.name),
            ResourceKind::Exec(r) => format!("exec[{}]", r.cmd),
        }
    }
}

/// A resource plus its common attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub kind: ResourceKind,
    /// Predicate over facts; false means the resource is skipped.
    pub when: Option<Predicate>,
    /// Handler to notify when apply reports a change.
    pub notify: Option<String>,
}

impl Resource {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            when: None,
            notify: None,
        }
    }

    pub fn describe(&self) -> String {
        self.kind.describe()
    }
}

/// Pending transformation of one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub changed: bool,
    pub before: BTreeMap<String, String>,
    pub after: BTreeMap<String, String>,
    /// Human-readable change descriptions, in application order.
    pub changes: Vec<String>,
}

impl Diff {
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Records one pending change.
    pub fn record(
        &mut self,
        key: &str,
        before: impl Into<String>,
        after: impl Into<String>,
        change: impl Into<String>,
    ) {
        self.changed = true;
        self.before.insert(key.to_string(), before.into());
        self.after.insert(key.to_string(), after.into());
        self.changes.push(change.into());
    }
}

/// Resource outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Ok,
    Changed,
    Failed,
    Skipped,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Ok => write!(f, "ok"),
            ResourceStatus::Changed => write!(f, "changed"),
            ResourceStatus::Failed => write!(f, "failed"),
            ResourceStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of executing one resource.
///
/// Invariant: a diff that reports drift is only ever attached to a
/// `Changed` result; `Ok` results may carry the zero-change diff.
#[derive(Debug, Clone)]
pub struct ResourceResult {
    pub description: String,
    pub status: ResourceStatus,
    pub diff: Option<Diff>,
    pub message: Option<String>,
    pub duration_ms: u64,
    pub notify: Option<String>,
}

impl ResourceResult {
    pub fn ok(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: ResourceStatus::Ok,
            diff: None,
            message: None,
            duration_ms: 0,
            notify: None,
        }
    }

    pub fn changed(description: impl Into<String>, diff: Diff) -> Self {
        debug_assert!(diff.changed);
        Self {
            description: description.into(),
            status: ResourceStatus::Changed,
            diff: Some(diff),
            message: None,
            duration_ms: 0,
            notify: None,
        }
    }

    /// A successful apply; the executor attaches the diff it computed.
    pub fn applied(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: ResourceStatus::Changed,
            diff: None,
            message: None,
            duration_ms: 0,
            notify: None,
        }
    }

    pub fn failed(description: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: ResourceStatus::Failed,
            diff: None,
            message: Some(message.into()),
            duration_ms: 0,
            notify: None,
        }
    }

    pub fn skipped(description: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: ResourceStatus::Skipped,
            diff: None,
            message: Some(message.into()),
            duration_ms: 0,
            notify: None,
        }
    }

    /// Attaches a zero-change diff to an `Ok` result.
    pub fn with_clean_diff(mut self, diff: Diff) -> Self {
        debug_assert!(!diff.changed);
        self.diff = Some(diff);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == ResourceStatus::Failed
    }
}

/// Observed state of a resource on a host, produced by `Provider::check`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentState {
    pub exists: bool,
    pub properties: BTreeMap<String, String>,
}

impl CurrentState {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn present() -> Self {
        Self {
            exists: true,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_prop(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn prop(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Per-host, per-run context handed to providers.
#[derive(Clone)]
pub struct ExecutionContext {
    pub facts: Arc<Facts>,
    pub host_id: String,
    pub check_mode: bool,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(facts: Arc<Facts>, host_id: impl Into<String>) -> Self {
        Self {
            facts,
            host_id: host_id.into(),
            check_mode: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_check_mode(mut self, check_mode: bool) -> Self {
        self.check_mode = check_mode;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
