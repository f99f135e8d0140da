//! Pre-run environment checks.
//!
//! `preflight` validates the config graph, target names, host resolution,
//! SSH reachability, and non-interactive sudo before a real run. Each
//! check can be skipped individually; the report lists every outcome.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::config::{Config, Target};
use crate::dag::Dag;
use crate::pool::ConnectionPool;
use crate::ssh::{ExecOptions, Session};

/// The individual checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Config,
    Hosts,
    Ssh,
    Sudo,
    Tasks,
}

impl CheckKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "config" => Some(CheckKind::Config),
            "hosts" => Some(CheckKind::Hosts),
            "ssh" => Some(CheckKind::Ssh),
            "sudo" => Some(CheckKind::Sudo),
            "tasks" => Some(CheckKind::Tasks),
            _ => None,
        }
    }

    pub const ALL: [CheckKind; 5] = [
        CheckKind::Config,
        CheckKind::Hosts,
        CheckKind::Ssh,
        CheckKind::Sudo,
        CheckKind::Tasks,
    ];
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckKind::Config => "config",
            CheckKind::Hosts => "hosts",
            CheckKind::Ssh => "ssh",
            CheckKind::Sudo => "sudo",
            CheckKind::Tasks => "tasks",
        };
        write!(f, "{label}")
    }
}

/// One check's outcome.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub check: CheckKind,
    pub passed: bool,
    pub detail: String,
}

/// The full report.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }
}

/// Runs every check not in `skip`.
pub async fn run_checks(
    config: &Config,
    pool: &Arc<ConnectionPool>,
    targets: &[String],
    skip: &[CheckKind],
) -> PreflightReport {
    let mut report = PreflightReport::default();

    for check in CheckKind::ALL {
        if skip.contains(&check) {
            continue;
        }
        let outcome = match check {
            CheckKind::Config => check_config(config),
            CheckKind::Tasks => check_tasks(config, targets),
            CheckKind::Hosts => check_hosts(config).await,
            CheckKind::Ssh => check_ssh(config, pool).await,
            CheckKind::Sudo => check_sudo(config, pool).await,
        };
        info!(check = %outcome.check, passed = outcome.passed, "Preflight check");
        report.outcomes.push(outcome);
    }
    report
}

fn check_config(config: &Config) -> CheckOutcome {
    let result = config.validate_refs().err().map(|e| e.to_string()).or_else(|| {
        Dag::build(config).err().map(|e| e.to_string())
    });
    match result {
        None => CheckOutcome {
            check: CheckKind::Config,
            passed: true,
            detail: format!(
                "{} hosts, {} tasks, {} handlers",
                config.hosts.len(),
                config.tasks.len(),
                config.handlers.len()
            ),
        },
        Some(error) => CheckOutcome {
            check: CheckKind::Config,
            passed: false,
            detail: error,
        },
    }
}

fn check_tasks(config: &Config, targets: &[String]) -> CheckOutcome {
    let unknown: Vec<&str> = targets
        .iter()
        .filter(|t| !config.tasks.contains_key(*t))
        .map(String::as_str)
        .collect();
    if unknown.is_empty() {
        CheckOutcome {
            check: CheckKind::Tasks,
            passed: true,
            detail: format!("{} target(s) resolved", targets.len()),
        }
    } else {
        CheckOutcome {
            check: CheckKind::Tasks,
            passed: false,
            detail: format!("unknown tasks: {}", unknown.join(", ")),
        }
    }
}

async fn check_hosts(config: &Config) -> CheckOutcome {
    let mut failures = Vec::new();
    for host in config.hosts.values() {
        let address = format!("{}:{}", host.hostname, host.port);
        let result = tokio::net::lookup_host(&address).await;
        if let Err(err) = result {
            failures.push(format!("{}: {err}", host.name));
        }
    }
    if failures.is_empty() {
        CheckOutcome {
            check: CheckKind::Hosts,
            passed: true,
            detail: format!("{} host(s) resolve", config.hosts.len()),
        }
    } else {
        CheckOutcome {
            check: CheckKind::Hosts,
            passed: false,
            detail: failures.join("; "),
        }
    }
}

async fn check_ssh(config: &Config, pool: &Arc<ConnectionPool>) -> CheckOutcome {
    let mut failures = Vec::new();
    for host in config.hosts.values() {
        let result = pool
            .with_connection(host, |session| async move {
                session.exec("true", &ExecOptions::default()).await.map(|_| ())
            })
            .await;
        if let Err(err) = result {
            failures.push(format!("{}: {err}", host.name));
        }
    }
    if failures.is_empty() {
        CheckOutcome {
            check: CheckKind::Ssh,
            passed: true,
            detail: format!("{} host(s) reachable", config.hosts.len()),
        }
    } else {
        CheckOutcome {
            check: CheckKind::Ssh,
            passed: false,
            detail: failures.join("; "),
        }
    }
}

async fn check_sudo(config: &Config, pool: &Arc<ConnectionPool>) -> CheckOutcome {
    // Only meaningful for tasks that actually escalate.
    let needs_sudo = config.tasks.values().any(|task| {
        task.on != Target::Local
            && task.steps.iter().any(|step| {
                matches!(step, crate::config::Step::Command(c) if c.sudo)
            })
    });
    if !needs_sudo {
        return CheckOutcome {
            check: CheckKind::Sudo,
            passed: true,
            detail: "no remote task uses sudo".into(),
        };
    }

    let mut failures = Vec::new();
    for host in config.hosts.values() {
        let result = pool
            .with_connection(host, |session| async move {
                session
                    .exec_sudo("true", None, &ExecOptions::default())
                    .await
                    .map(|_| ())
            })
            .await;
        if let Err(err) = result {
            failures.push(format!("{}: {err}", host.name));
        }
    }
    if failures.is_empty() {
        CheckOutcome {
            check: CheckKind::Sudo,
            passed: true,
            detail: "non-interactive sudo works".into(),
        }
    } else {
        CheckOutcome {
            check: CheckKind::Sudo,
            passed: false,
            detail: failures.join("; "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Host, Task};
    use crate::error::SessionError;
    use crate::pool::{Connector, PoolConfig};
    use crate::ssh::mock::MockSession;
    use crate::telemetry::CollectingSink;
    use async_trait::async_trait;

    struct OkConnector;

    #[async_trait]
    impl Connector for OkConnector {
        async fn connect(&self, _host: &Host) -> Result<Box<dyn Session>, SessionError> {
            Ok(Box::new(MockSession::new()))
        }
    }

    fn pool() -> Arc<ConnectionPool> {
        ConnectionPool::new(
            Arc::new(OkConnector),
            PoolConfig::default(),
            Arc::new(CollectingSink::new()),
        )
    }

    fn local_config() -> Config {
        let mut config = Config::default();
        config
            .tasks
            .insert("build".into(), Task::new("build", Target::Local));
        config
    }

    #[tokio::test]
    async fn test_all_checks_pass_for_local_config() {
        let config = local_config();
        let report = run_checks(&config, &pool(), &["build".into()], &[]).await;
        assert!(report.passed());
        assert_eq!(report.outcomes.len(), CheckKind::ALL.len());
    }

    #[tokio::test]
    async fn test_unknown_target_fails_tasks_check() {
        let config = local_config();
        let report = run_checks(&config, &pool(), &["ghost".into()], &[]).await;
        assert!(!report.passed());
        let tasks = report
            .outcomes
            .iter()
            .find(|o| o.check == CheckKind::Tasks)
            .unwrap();
        assert!(!tasks.passed);
        assert!(tasks.detail.contains("ghost"));
    }

    #[tokio::test]
    async fn test_cycle_fails_config_check() {
        let mut config = local_config();
        let mut task = Task::new("loop", Target::Local);
        task.deps.insert("loop".into());
        config.tasks.insert("loop".into(), task);

        let report = run_checks(&config, &pool(), &[], &[]).await;
        let outcome = report
            .outcomes
            .iter()
            .find(|o| o.check == CheckKind::Config)
            .unwrap();
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("cycle"));
    }

    #[tokio::test]
    async fn test_skip_list_respected() {
        let config = local_config();
        let report = run_checks(
            &config,
            &pool(),
            &[],
            &[CheckKind::Hosts, CheckKind::Ssh, CheckKind::Sudo],
        )
        .await;
        assert_eq!(report.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_hosts_check_resolves_localhost() {
        let mut config = local_config();
        config
            .hosts
            .insert("lo".into(), Host::parse("lo", "localhost").unwrap());
        let report = run_checks(&config, &pool(), &[], &[CheckKind::Ssh, CheckKind::Sudo]).await;
        let outcome = report
            .outcomes
            .iter()
            .find(|o| o.check == CheckKind::Hosts)
            .unwrap();
        assert!(outcome.passed, "{}", outcome.detail);
    }
}
