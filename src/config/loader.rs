//! YAML configuration loader.
//!
//! Raw serde documents are compiled into the validated [`Config`] model.
//! The loader rejects references to undefined names, path-traversal
//! sequences in file arguments, and artifact names outside
//! `[A-Za-z0-9._-]+`. File resources with a `source` are resolved into
//! inline content here, relative to the config file's directory.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::resource::{
    DirectoryResource, Ensure, ExecResource, FileResource, GroupResource, PackageResource,
    PackageState, Predicate, Resource, ResourceKind, ServiceResource, ServiceState, UserResource,
};
use crate::ssh::{HostOverride, SshConfigMap};

use super::model::{
    Command, Config, Defaults, Download, Handler, HealthCheck, Host, HostGroup, Step, Strategy,
    Target, Task, TemplateStep, Upload, WaitFor,
};

/// A loaded configuration plus the SSH override map that rode along.
#[derive(Debug)]
pub struct Loaded {
    pub config: Config,
    pub ssh_config: SshConfigMap,
}

/// Loads and validates a config file.
pub fn load(path: &Path) -> Result<Loaded, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    load_str(&raw, &base_dir)
}

/// Loads a config document from a string; `base_dir` anchors relative
/// file references (template sources, file resource sources).
pub fn load_str(raw: &str, base_dir: &Path) -> Result<Loaded, ConfigError> {
    let document: RawConfig = serde_yaml::from_str(raw)?;
    compile(document, base_dir)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    vars: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    hosts: IndexMap<String, String>,
    #[serde(default)]
    groups: IndexMap<String, Vec<String>>,
    #[serde(default)]
    ssh_config: Vec<RawSshBlock>,
    #[serde(default)]
    tasks: IndexMap<String, RawTask>,
    #[serde(default)]
    handlers: IndexMap<String, Vec<RawCommand>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefaults {
    user: Option<String>,
    port: Option<u16>,
    #[serde(default, with = "humantime_serde")]
    connect_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    command_timeout: Option<Duration>,
    max_connections: Option<usize>,
    continue_on_error: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawSshBlock {
    hosts: Vec<String>,
    #[serde(flatten)]
    overrides: HostOverride,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTask {
    #[serde(default)]
    deps: Vec<String>,
    on: String,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    strategy: Option<String>,
    batch_size: Option<usize>,
    forks: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCommand {
    cmd: String,
    #[serde(default)]
    sudo: bool,
    user: Option<String>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    retries: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    retry_delay: Option<Duration>,
    cwd: Option<String>,
    #[serde(default)]
    env: IndexMap<String, String>,
}

/// One step: exactly one of the step-kind fields must be present.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    // Command step.
    cmd: Option<String>,
    #[serde(default)]
    sudo: bool,
    user: Option<String>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    retries: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    retry_delay: Option<Duration>,
    cwd: Option<String>,
    #[serde(default)]
    env: IndexMap<String, String>,

    // Resource steps.
    package: Option<RawPackage>,
    service: Option<RawService>,
    file: Option<RawFile>,
    directory: Option<RawDirectory>,
    account: Option<RawUser>,
    group: Option<RawGroup>,
    exec: Option<RawExec>,

    // Transfer and wait steps.
    upload: Option<RawUpload>,
    download: Option<RawDownload>,
    template: Option<RawTemplate>,
    wait_for: Option<RawWaitFor>,

    // Resource common attributes.
    when: Option<RawPredicate>,
    notify: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPackage {
    name: String,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    name: String,
    state: Option<String>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    path: String,
    content: Option<String>,
    source: Option<PathBuf>,
    owner: Option<String>,
    group: Option<String>,
    mode: Option<String>,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDirectory {
    path: String,
    owner: Option<String>,
    group: Option<String>,
    mode: Option<String>,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawUser {
    name: String,
    uid: Option<u32>,
    #[serde(default)]
    groups: Vec<String>,
    shell: Option<String>,
    home: Option<String>,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGroup {
    name: String,
    gid: Option<u32>,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExec {
    cmd: String,
    creates: Option<String>,
    removes: Option<String>,
    unless: Option<String>,
    onlyif: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawUpload {
    src: PathBuf,
    dest: String,
    mode: Option<String>,
    owner: Option<String>,
    group: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDownload {
    src: String,
    dest: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTemplate {
    src: PathBuf,
    dest: String,
    mode: Option<String>,
    #[serde(default)]
    vars: IndexMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWaitFor {
    http: Option<String>,
    status: Option<u16>,
    tcp: Option<String>,
    port: Option<u16>,
    cmd: Option<String>,
    #[serde(default, with = "humantime_serde")]
    interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPredicate {
    Not {
        not: Box<RawPredicate>,
    },
    All {
        all: Vec<RawPredicate>,
    },
    Any {
        any: Vec<RawPredicate>,
    },
    FactEquals {
        fact: String,
        equals: String,
    },
    FactExists {
        fact: String,
        exists: bool,
    },
}

fn compile(raw: RawConfig, base_dir: &Path) -> Result<Loaded, ConfigError> {
    let defaults = Defaults {
        default_user: raw.defaults.user,
        default_port: raw.defaults.port.unwrap_or(22),
        connect_timeout: raw.defaults.connect_timeout.unwrap_or(Duration::from_secs(10)),
        command_timeout: raw.defaults.command_timeout.unwrap_or(Duration::from_secs(60)),
        max_connections: raw.defaults.max_connections.unwrap_or(5),
        continue_on_error: raw.defaults.continue_on_error.unwrap_or(false),
    };

    let mut hosts = IndexMap::new();
    for (name, spec) in raw.hosts {
        let mut host = Host::parse(&name, &spec)?;
        if host.port == 22 && defaults.default_port != 22 && !spec.contains(':') {
            host.port = defaults.default_port;
        }
        hosts.insert(name, host);
    }

    let mut groups = IndexMap::new();
    for (name, members) in raw.groups {
        groups.insert(
            name.clone(),
            HostGroup {
                name,
                hosts: members,
            },
        );
    }

    let mut ssh_config = SshConfigMap::new();
    for block in raw.ssh_config {
        ssh_config.add_block(block.hosts, block.overrides);
    }

    let mut tasks = IndexMap::new();
    for (name, task) in raw.tasks {
        tasks.insert(name.clone(), compile_task(name, task, base_dir)?);
    }

    let mut handlers = IndexMap::new();
    for (name, commands) in raw.handlers {
        handlers.insert(
            name.clone(),
            Handler {
                name,
                commands: commands.into_iter().map(compile_command).collect(),
            },
        );
    }

    let config = Config {
        hosts,
        groups,
        tasks,
        handlers,
        defaults,
        vars: raw.vars,
    };
    config.validate_refs()?;
    debug!(
        hosts = config.hosts.len(),
        tasks = config.tasks.len(),
        handlers = config.handlers.len(),
        "Config loaded"
    );
    Ok(Loaded { config, ssh_config })
}

fn compile_task(name: String, raw: RawTask, base_dir: &Path) -> Result<Task, ConfigError> {
    let strategy = match raw.strategy.as_deref() {
        None => Strategy::default(),
        Some(value) => Strategy::parse(value).ok_or_else(|| {
            ConfigError::Parse(format!(
                "task '{name}': unknown strategy '{value}' (serial, parallel, rolling)"
            ))
        })?,
    };

    let mut steps = Vec::with_capacity(raw.steps.len());
    for (index, step) in raw.steps.into_iter().enumerate() {
        steps.push(
            compile_step(step, base_dir)
                .map_err(|err| prefix_step_error(&name, index, err))?,
        );
    }

    Ok(Task {
        name,
        deps: raw.deps.into_iter().collect::<BTreeSet<String>>(),
        on: Target::parse(&raw.on),
        steps,
        timeout: raw.timeout,
        strategy,
        batch_size: raw.batch_size.unwrap_or(1).max(1),
        forks: raw.forks.unwrap_or(5).max(1),
    })
}

fn prefix_step_error(task: &str, index: usize, err: ConfigError) -> ConfigError {
    match err {
        ConfigError::Parse(msg) => {
            ConfigError::Parse(format!("task '{task}' step {}: {msg}", index + 1))
        }
        other => other,
    }
}

fn compile_command(raw: RawCommand) -> Command {
    Command {
        cmd: raw.cmd,
        sudo: raw.sudo,
        user: raw.user,
        timeout: raw.timeout,
        retries: raw.retries.unwrap_or(0),
        retry_delay: raw.retry_delay.unwrap_or(Duration::from_secs(1)),
        cwd: raw.cwd,
        env: raw.env,
    }
}

fn compile_step(mut raw: RawStep, base_dir: &Path) -> Result<Step, ConfigError> {
    let kind_count = [
        raw.cmd.is_some(),
        raw.package.is_some(),
        raw.service.is_some(),
        raw.file.is_some(),
        raw.directory.is_some(),
        raw.account.is_some(),
        raw.group.is_some(),
        raw.exec.is_some(),
        raw.upload.is_some(),
        raw.download.is_some(),
        raw.template.is_some(),
        raw.wait_for.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();
    if kind_count != 1 {
        return Err(ConfigError::Parse(
            "each step needs exactly one of cmd/package/service/file/directory/account/group/exec/upload/download/template/wait_for"
                .to_string(),
        ));
    }

    let resource_kind = compile_resource_kind(&raw, base_dir)?;
    let when = raw.when.take().map(compile_predicate);
    let notify = raw.notify.take();

    if let Some(cmd) = raw.cmd.take() {
        return Ok(Step::Command(Command {
            cmd,
            sudo: raw.sudo,
            user: raw.user.take(),
            timeout: raw.timeout,
            retries: raw.retries.unwrap_or(0),
            retry_delay: raw.retry_delay.unwrap_or(Duration::from_secs(1)),
            cwd: raw.cwd.take(),
            env: std::mem::take(&mut raw.env),
        }));
    }

    if let Some(kind) = resource_kind {
        return Ok(Step::Resource(Resource { kind, when, notify }));
    }

    if let Some(upload) = raw.upload.take() {
        reject_traversal(&upload.src.to_string_lossy())?;
        reject_traversal(&upload.dest)?;
        check_artifact_name(&upload.src)?;
        return Ok(Step::Upload(Upload {
            src: resolve_path(base_dir, upload.src),
            dest: upload.dest,
            mode: upload.mode,
            owner: upload.owner,
            group: upload.group,
        }));
    }

    if let Some(download) = raw.download.take() {
        reject_traversal(&download.src)?;
        reject_traversal(&download.dest.to_string_lossy())?;
        return Ok(Step::Download(Download {
            src: download.src,
            dest: resolve_path(base_dir, download.dest),
        }));
    }

    if let Some(template) = raw.template.take() {
        reject_traversal(&template.src.to_string_lossy())?;
        reject_traversal(&template.dest)?;
        check_artifact_name(&template.src)?;
        return Ok(Step::Template(TemplateStep {
            src: resolve_path(base_dir, template.src),
            dest: template.dest,
            mode: template.mode,
            vars: template.vars,
        }));
    }

    if let Some(wait) = raw.wait_for.take() {
        return Ok(Step::WaitFor(compile_wait_for(wait)?));
    }

    unreachable!("kind_count == 1 guarantees one branch matched");
}

fn compile_resource_kind(
    raw: &RawStep,
    base_dir: &Path,
) -> Result<Option<ResourceKind>, ConfigError> {
    if let Some(package) = &raw.package {
        let state = match package.state.as_deref() {
            None | Some("installed") => PackageState::Installed,
            Some("removed") => PackageState::Removed,
            Some("latest") => PackageState::Latest,
            Some(other) => {
                return Err(ConfigError::Parse(format!(
                    "package '{}': unknown state '{other}' (installed, removed, latest)",
                    package.name
                )))
            }
        };
        return Ok(Some(ResourceKind::Package(PackageResource {
            name: package.name.clone(),
            state,
        })));
    }

    if let Some(service) = &raw.service {
        let state = match service.state.as_deref() {
            None | Some("running") => ServiceState::Running,
            Some("stopped") => ServiceState::Stopped,
            Some(other) => {
                return Err(ConfigError::Parse(format!(
                    "service '{}': unknown state '{other}' (running, stopped)",
                    service.name
                )))
            }
        };
        return Ok(Some(ResourceKind::Service(ServiceResource {
            name: service.name.clone(),
            state,
            enabled: service.enabled,
        })));
    }

    if let Some(file) = &raw.file {
        reject_traversal(&file.path)?;
        let content = match (&file.content, &file.source) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Parse(format!(
                    "file '{}': content and source are mutually exclusive",
                    file.path
                )))
            }
            (Some(content), None) => Some(content.clone()),
            (None, Some(source)) => {
                reject_traversal(&source.to_string_lossy())?;
                check_artifact_name(source)?;
                let resolved = resolve_path(base_dir, source.clone());
                Some(std::fs::read_to_string(&resolved).map_err(|err| {
                    ConfigError::Parse(format!(
                        "file '{}': cannot read source {}: {err}",
                        file.path,
                        resolved.display()
                    ))
                })?)
            }
            (None, None) => None,
        };
        return Ok(Some(ResourceKind::File(FileResource {
            path: file.path.clone(),
            content,
            owner: file.owner.clone(),
            group: file.group.clone(),
            mode: file.mode.clone(),
            state: compile_ensure(file.state.as_deref())?,
        })));
    }

    if let Some(directory) = &raw.directory {
        reject_traversal(&directory.path)?;
        return Ok(Some(ResourceKind::Directory(DirectoryResource {
            path: directory.path.clone(),
            owner: directory.owner.clone(),
            group: directory.group.clone(),
            mode: directory.mode.clone(),
            state: compile_ensure(directory.state.as_deref())?,
        })));
    }

    if let Some(account) = &raw.account {
        return Ok(Some(ResourceKind::User(UserResource {
            name: account.name.clone(),
            uid: account.uid,
            groups: account.groups.clone(),
            shell: account.shell.clone(),
            home: account.home.clone(),
            state: compile_ensure(account.state.as_deref())?,
        })));
    }

    if let Some(group) = &raw.group {
        return Ok(Some(ResourceKind::Group(GroupResource {
            name: group.name.clone(),
            gid: group.gid,
            state: compile_ensure(group.state.as_deref())?,
        })));
    }

    if let Some(exec) = &raw.exec {
        return Ok(Some(ResourceKind::Exec(ExecResource {
            cmd: exec.cmd.clone(),
            creates: exec.creates.clone(),
            removes: exec.removes.clone(),
            unless: exec.unless.clone(),
            onlyif: exec.onlyif.clone(),
        })));
    }

    Ok(None)
}

fn compile_ensure(state: Option<&str>) -> Result<Ensure, ConfigError> {
    match state {
        None | Some("present") => Ok(Ensure::Present),
        Some("absent") => Ok(Ensure::Absent),
        Some(other) => Err(ConfigError::Parse(format!(
            "unknown state '{other}' (present, absent)"
        ))),
    }
}

fn compile_wait_for(raw: RawWaitFor) -> Result<WaitFor, ConfigError> {
    let check = match (&raw.http, &raw.tcp, raw.port, &raw.cmd) {
        (Some(url), None, None, None) => HealthCheck::Http {
            url: url.clone(),
            status: raw.status,
        },
        (None, Some(addr), None, None) => {
            let (host, port) = match addr.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| {
                        ConfigError::Parse(format!("wait_for: invalid tcp port in '{addr}'"))
                    })?;
                    let host = (!host.is_empty()).then(|| host.to_string());
                    (host, port)
                }
                None => {
                    return Err(ConfigError::Parse(format!(
                        "wait_for: tcp expects host:port, got '{addr}'"
                    )))
                }
            };
            HealthCheck::Tcp { host, port }
        }
        (None, None, Some(port), None) => HealthCheck::Tcp { host: None, port },
        (None, None, None, Some(cmd)) => HealthCheck::Cmd { cmd: cmd.clone() },
        _ => {
            return Err(ConfigError::Parse(
                "wait_for needs exactly one of http/tcp/port/cmd".to_string(),
            ))
        }
    };

    Ok(WaitFor {
        check,
        interval: raw.interval.unwrap_or(Duration::from_secs(2)),
        timeout: raw.timeout.unwrap_or(Duration::from_secs(30)),
    })
}

fn compile_predicate(raw: RawPredicate) -> Predicate {
    match raw {
        RawPredicate::Not { not } => Predicate::Not(Box::new(compile_predicate(*not))),
        RawPredicate::All { all } => Predicate::All(all.into_iter().map(compile_predicate).collect()),
        RawPredicate::Any { any } => Predicate::Any(any.into_iter().map(compile_predicate).collect()),
        RawPredicate::FactEquals { fact, equals } => Predicate::FactEquals { fact, value: equals },
        RawPredicate::FactExists { fact, exists } => {
            let base = Predicate::FactExists { fact };
            if exists {
                base
            } else {
                Predicate::Not(Box::new(base))
            }
        }
    }
}

fn reject_traversal(path: &str) -> Result<(), ConfigError> {
    let has_traversal = Path::new(path)
        .components()
        .any(|component| matches!(component, Component::ParentDir));
    if has_traversal {
        return Err(ConfigError::PathTraversal(path.to_string()));
    }
    Ok(())
}

/// Artifact file names must be plain: `[A-Za-z0-9._-]+`.
fn check_artifact_name(path: &Path) -> Result<(), ConfigError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let valid = Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex");
    if name.is_empty() || !valid.is_match(name) {
        return Err(ConfigError::InvalidArtifactName(name.to_string()));
    }
    Ok(())
}

fn resolve_path(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
defaults:
  user: deploy
  max_connections: 3

vars:
  app_port: 8080

hosts:
  web1: web1.example.com
  web2: admin@web2.example.com:2222
  db1: db1.internal

groups:
  web: [web1, web2]

ssh_config:
  - hosts: ["web*"]
    port: 2200

tasks:
  build:
    on: local
    steps:
      - cmd: make build
  deploy:
    deps: [build]
    on: web
    strategy: rolling
    batch_size: 2
    timeout: 5m
    steps:
      - package: { name: nginx, state: installed }
        notify: reload_nginx
        when: { fact: os_family, equals: debian }
      - cmd: systemctl restart app
        sudo: true
        retries: 2
        retry_delay: 5s
      - wait_for: { http: "http://localhost/health", timeout: 30s, interval: 2s }

handlers:
  reload_nginx:
    - cmd: systemctl reload nginx
      sudo: true
"#;

    fn load_sample() -> Loaded {
        load_str(SAMPLE, Path::new(".")).unwrap()
    }

    #[test]
    fn test_load_sample_structure() {
        let loaded = load_sample();
        let config = &loaded.config;

        assert_eq!(config.defaults.default_user.as_deref(), Some("deploy"));
        assert_eq!(config.defaults.max_connections, 3);
        assert_eq!(config.hosts.len(), 3);
        assert_eq!(config.hosts["web2"].port, 2222);
        assert_eq!(config.groups["web"].hosts, vec!["web1", "web2"]);
        assert_eq!(config.vars["app_port"], serde_json::json!(8080));

        let deploy = &config.tasks["deploy"];
        assert!(deploy.deps.contains("build"));
        assert_eq!(deploy.strategy, Strategy::Rolling);
        assert_eq!(deploy.batch_size, 2);
        assert_eq!(deploy.timeout, Some(Duration::from_secs(300)));
        assert_eq!(deploy.steps.len(), 3);

        assert_eq!(loaded.ssh_config.resolve("web1").port, Some(2200));
        assert_eq!(loaded.ssh_config.resolve("db1").port, None);
    }

    #[test]
    fn test_step_kinds_compiled() {
        let loaded = load_sample();
        let deploy = &loaded.config.tasks["deploy"];

        match &deploy.steps[0] {
            Step::Resource(resource) => {
                assert!(matches!(resource.kind, ResourceKind::Package(_)));
                assert_eq!(resource.notify.as_deref(), Some("reload_nginx"));
                assert!(resource.when.is_some());
            }
            other => panic!("expected resource, got {other:?}"),
        }
        match &deploy.steps[1] {
            Step::Command(command) => {
                assert!(command.sudo);
                assert_eq!(command.retries, 2);
                assert_eq!(command.retry_delay, Duration::from_secs(5));
            }
            other => panic!("expected command, got {other:?}"),
        }
        match &deploy.steps[2] {
            Step::WaitFor(wait) => {
                assert!(matches!(wait.check, HealthCheck::Http { .. }));
                assert_eq!(wait.timeout, Duration::from_secs(30));
            }
            other => panic!("expected wait_for, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let doc = r#"
hosts:
  a: a.example.com
tasks:
  deploy:
    deps: [missing]
    on: a
    steps: []
"#;
        let err = load_str(doc, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let doc = r#"
tasks:
  deploy:
    on: ghosts
    steps: []
"#;
        let err = load_str(doc, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTarget { .. }));
    }

    #[test]
    fn test_unknown_handler_rejected() {
        let doc = r#"
hosts:
  a: a.example.com
tasks:
  deploy:
    on: a
    steps:
      - exec: { cmd: "true" }
        notify: missing_handler
"#;
        let err = load_str(doc, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownHandler { .. }));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let doc = r#"
hosts:
  a: a.example.com
tasks:
  deploy:
    on: a
    steps:
      - upload: { src: "../../etc/shadow", dest: /tmp/x }
"#;
        let err = load_str(doc, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::PathTraversal(_)));
    }

    #[test]
    fn test_artifact_name_enforced() {
        let doc = r#"
hosts:
  a: a.example.com
tasks:
  deploy:
    on: a
    steps:
      - upload: { src: "files/has space.txt", dest: /tmp/x }
"#;
        let err = load_str(doc, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidArtifactName(_)));
    }

    #[test]
    fn test_step_with_two_kinds_rejected() {
        let doc = r#"
hosts:
  a: a.example.com
tasks:
  deploy:
    on: a
    steps:
      - cmd: "true"
        package: { name: nginx }
"#;
        let err = load_str(doc, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_file_source_resolved_at_load_time() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("motd.txt"), "welcome\n").unwrap();

        let doc = r#"
hosts:
  a: a.example.com
tasks:
  deploy:
    on: a
    steps:
      - file: { path: /etc/motd, source: motd.txt }
"#;
        let loaded = load_str(doc, dir.path()).unwrap();
        match &loaded.config.tasks["deploy"].steps[0] {
            Step::Resource(resource) => match &resource.kind {
                ResourceKind::File(file) => {
                    assert_eq!(file.content.as_deref(), Some("welcome\n"));
                }
                other => panic!("expected file, got {other:?}"),
            },
            other => panic!("expected resource, got {other:?}"),
        }
    }

    #[test]
    fn test_predicate_combinators_parse() {
        let doc = r#"
hosts:
  a: a.example.com
tasks:
  deploy:
    on: a
    steps:
      - exec: { cmd: "true" }
        when:
          all:
            - { fact: os, equals: linux }
            - not: { fact: os_family, equals: rhel }
"#;
        let loaded = load_str(doc, Path::new(".")).unwrap();
        match &loaded.config.tasks["deploy"].steps[0] {
            Step::Resource(resource) => {
                let facts = crate::facts::Facts::for_os("linux", "debian");
                assert!(resource.when.as_ref().unwrap().evaluate(&facts));
                let rhel = crate::facts::Facts::for_os("linux", "rhel");
                assert!(!resource.when.as_ref().unwrap().evaluate(&rhel));
            }
            other => panic!("expected resource, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_error() {
        let err = load(Path::new("/nonexistent/nexus.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
