//! In-memory configuration model.
//!
//! The root [`Config`] is built once by the loader and treated read-only
//! for the duration of a run. Reference validation happens at load time,
//! so the engine can assume every host, group, task, and handler name
//! resolves.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;

use crate::error::ConfigError;
use crate::resource::Resource;

/// Reserved target value meaning "run on the control machine".
pub const LOCAL_TARGET: &str = "local";

/// A single machine, parsed from `[user@]host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Symbolic name used in groups and task targets.
    pub name: String,
    /// Network address to dial.
    pub hostname: String,
    /// Login user; falls back to `Defaults::default_user`.
    pub user: Option<String>,
    /// SSH port.
    pub port: u16,
}

impl Host {
    /// Parses a `[user@]host[:port]` spec into a host named `name`.
    pub fn parse(name: impl Into<String>, spec: &str) -> Result<Self, ConfigError> {
        let name = name.into();
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) => {
                if user.is_empty() {
                    return Err(ConfigError::InvalidHostSpec(spec.to_string()));
                }
                (Some(user.to_string()), rest)
            }
            None => (None, spec),
        };

        let (hostname, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidHostSpec(spec.to_string()))?;
                (host.to_string(), port)
            }
            None => (rest.to_string(), 22),
        };

        if hostname.is_empty() {
            return Err(ConfigError::InvalidHostSpec(spec.to_string()));
        }

        Ok(Self {
            name,
            hostname,
            user,
            port,
        })
    }

    /// Effective login user given process-wide defaults.
    pub fn effective_user<'a>(&'a self, defaults: &'a Defaults) -> Option<&'a str> {
        self.user.as_deref().or(defaults.default_user.as_deref())
    }
}

impl fmt::Display for Host {
    /// Formats back to `[user@]host[:port]`, omitting the default port.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.hostname)?;
        if self.port != 22 {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// An ordered, named list of host names. Groups contain hosts only,
/// never other groups.
#[derive(Debug, Clone)]
pub struct HostGroup {
    pub name: String,
    pub hosts: Vec<String>,
}

/// Process-wide defaults applied where a task or host leaves a value unset.
#[derive(Debug, Clone)]
pub struct Defaults {
    pub default_user: Option<String>,
    pub default_port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub max_connections: usize,
    pub continue_on_error: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            default_user: None,
            default_port: 22,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
            max_connections: 5,
            continue_on_error: false,
        }
    }
}

/// Where a task runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The control machine itself; bypasses the connection pool.
    Local,
    /// A host or group name from the config.
    Named(String),
}

impl Target {
    pub fn parse(value: &str) -> Self {
        if value == LOCAL_TARGET {
            Target::Local
        } else {
            Target::Named(value.to_string())
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => write!(f, "{LOCAL_TARGET}"),
            Target::Named(name) => write!(f, "{name}"),
        }
    }
}

/// How a task's commands are spread across its host set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// All hosts concurrently, bounded by the task's fork limit.
    #[default]
    Parallel,
    /// One host at a time, in list order.
    Serial,
    /// Batched rollout with post-batch health checks.
    Rolling,
}

impl Strategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "parallel" => Some(Strategy::Parallel),
            "serial" => Some(Strategy::Serial),
            "rolling" => Some(Strategy::Rolling),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Parallel => write!(f, "parallel"),
            Strategy::Serial => write!(f, "serial"),
            Strategy::Rolling => write!(f, "rolling"),
        }
    }
}

/// A raw shell command step.
#[derive(Debug, Clone)]
pub struct Command {
    pub cmd: String,
    pub sudo: bool,
    pub user: Option<String>,
    pub timeout: Option<Duration>,
    /// Additional attempts after the first failure.
    pub retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    pub cwd: Option<String>,
    pub env: IndexMap<String, String>,
}

impl Command {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            sudo: false,
            user: None,
            timeout: None,
            retries: 0,
            retry_delay: Duration::from_secs(1),
            cwd: None,
            env: IndexMap::new(),
        }
    }
}

/// Uploads a local file to a remote path.
#[derive(Debug, Clone)]
pub struct Upload {
    pub src: PathBuf,
    pub dest: String,
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// Downloads a remote file to a local path.
#[derive(Debug, Clone)]
pub struct Download {
    pub src: String,
    pub dest: PathBuf,
}

/// Renders a local tera template against facts and config vars, then
/// uploads the result.
#[derive(Debug, Clone)]
pub struct TemplateStep {
    pub src: PathBuf,
    pub dest: String,
    pub mode: Option<String>,
    pub vars: IndexMap<String, serde_json::Value>,
}

/// A health probe polled until it passes or its timeout expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    /// Poll until the response carries the expected status (2xx if unset).
    Http { url: String, status: Option<u16> },
    /// Poll until a TCP connect succeeds.
    Tcp { host: Option<String>, port: u16 },
    /// Poll until the command exits 0 on the target host.
    Cmd { cmd: String },
}

/// Wait-for step: a health check with polling parameters.
#[derive(Debug, Clone)]
pub struct WaitFor {
    pub check: HealthCheck,
    pub interval: Duration,
    pub timeout: Duration,
}

impl WaitFor {
    pub fn describe(&self) -> String {
        match &self.check {
            HealthCheck::Http { url, .. } => format!("wait_for http {url}"),
            HealthCheck::Tcp { host, port } => match host {
                Some(host) => format!("wait_for tcp {host}:{port}"),
                None => format!("wait_for tcp :{port}"),
            },
            HealthCheck::Cmd { cmd } => format!("wait_for cmd {cmd}"),
        }
    }
}

/// One entry in a task's ordered command list.
#[derive(Debug, Clone)]
pub enum Step {
    Command(Command),
    Resource(Resource),
    Upload(Upload),
    Download(Download),
    Template(TemplateStep),
    WaitFor(WaitFor),
}

impl Step {
    /// Short human description used in step outcomes and logs.
    pub fn describe(&self) -> String {
        match self {
            Step::Command(c) => c.cmd.clone(),
            Step::Resource(r) => r.describe(),
            Step::Upload(u) => format!("upload {} -> {}", u.src.display(), u.dest),
            Step::Download(d) => format!("download {} -> {}", d.src, d.dest.display()),
            Step::Template(t) => format!("template {} -> {}", t.src.display(), t.dest),
            Step::WaitFor(w) => w.describe(),
        }
    }
}

/// A named unit of work executed on one or more hosts.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub deps: BTreeSet<String>,
    pub on: Target,
    pub steps: Vec<Step>,
    /// Wall-clock bound for the whole task on one host.
    pub timeout: Option<Duration>,
    pub strategy: Strategy,
    /// Rolling batch size; ignored by other strategies.
    pub batch_size: usize,
    /// Per-task bound on concurrent host executions.
    pub forks: usize,
}

impl Task {
    pub fn new(name: impl Into<String>, on: Target) -> Self {
        Self {
            name: name.into(),
            deps: BTreeSet::new(),
            on,
            steps: Vec::new(),
            timeout: None,
            strategy: Strategy::default(),
            batch_size: 1,
            forks: 5,
        }
    }
}

/// A named command sequence triggered by resource notifications.
#[derive(Debug, Clone)]
pub struct Handler {
    pub name: String,
    pub commands: Vec<Command>,
}

/// The root configuration document.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub hosts: IndexMap<String, Host>,
    pub groups: IndexMap<String, HostGroup>,
    pub tasks: IndexMap<String, Task>,
    pub handlers: IndexMap<String, Handler>,
    pub defaults: Defaults,
    /// Free-form variables exposed to template rendering.
    pub vars: IndexMap<String, serde_json::Value>,
}

impl Config {
    /// Resolves a task target to its ordered host list.
    ///
    /// `Target::Local` resolves to an empty list; the runner substitutes
    /// the local execution shortcut.
    pub fn resolve_target(&self, target: &Target) -> Vec<Host> {
        match target {
            Target::Local => Vec::new(),
            Target::Named(name) => {
                if let Some(group) = self.groups.get(name) {
                    group
                        .hosts
                        .iter()
                        .filter_map(|h| self.hosts.get(h))
                        .cloned()
                        .collect()
                } else if let Some(host) = self.hosts.get(name) {
                    vec![host.clone()]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Every host in the config, in declaration order. Handlers run here.
    pub fn all_hosts(&self) -> Vec<Host> {
        self.hosts.values().cloned().collect()
    }

    /// Checks that every cross-reference resolves to a known name.
    pub fn validate_refs(&self) -> Result<(), ConfigError> {
        for group in self.groups.values() {
            for host in &group.hosts {
                if !self.hosts.contains_key(host) {
                    return Err(ConfigError::UnknownGroupMember {
                        group: group.name.clone(),
                        host: host.clone(),
                    });
                }
            }
        }

        for task in self.tasks.values() {
            if let Target::Named(name) = &task.on {
                if !self.hosts.contains_key(name) && !self.groups.contains_key(name) {
                    return Err(ConfigError::UnknownTarget {
                        task: task.name.clone(),
                        target: name.clone(),
                    });
                }
            }
            for dep in &task.deps {
                if !self.tasks.contains_key(dep) {
                    return Err(ConfigError::UnknownDependency {
                        task: task.name.clone(),
                        dep: dep.clone(),
                    });
                }
            }
            for step in &task.steps {
                if let Step::Resource(resource) = step {
                    if let Some(handler) = &resource.notify {
                        if !self.handlers.contains_key(handler) {
                            return Err(ConfigError::UnknownHandler {
                                task: task.name.clone(),
                                handler: handler.clone(),
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
