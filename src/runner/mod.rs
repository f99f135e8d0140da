//! Task execution across a resolved host set.
//!
//! One runner instance serves a whole run: it borrows sessions from the
//! pool, gathers facts, and walks each task's ordered steps per host under
//! the chosen strategy (parallel, serial, or rolling). Step execution
//! within a host is always sequential; failures roll up into host results,
//! host failures into the task result.

pub mod health;
pub mod rolling;
pub mod steps;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use indexmap::IndexMap;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::common::{retry_with_delay, CancellationToken, Stopwatch};
use crate::config::{Command, Defaults, Host, Step, Target, Task};
use crate::error::SessionError;
use crate::facts::FactCache;
use crate::handlers::HandlerQueue;
use crate::pool::{ConnectionPool, SessionHealth};
use crate::resource::{ExecutionContext, ProviderRegistry, ResourceExecutor, ResourceStatus};
use crate::ssh::{ExecOptions, LocalSession, Session};
use crate::telemetry::{names, Event, SharedSink};

/// Host label used for the local execution shortcut.
pub const LOCAL_HOST: &str = "local";

/// Outcome status of one step on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    Changed,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn is_ok(&self) -> bool {
        !matches!(self, StepStatus::Error)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Ok => write!(f, "ok"),
            StepStatus::Changed => write!(f, "changed"),
            StepStatus::Error => write!(f, "error"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One executed step on one host.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub description: String,
    pub status: StepStatus,
    pub output: String,
    pub exit_code: Option<i32>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl StepOutcome {
    fn error(description: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: StepStatus::Error,
            output: output.into(),
            exit_code: None,
            attempts: 1,
            duration_ms: 0,
        }
    }
}

/// Per-task, per-host status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Ok,
    Error,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostStatus::Ok => write!(f, "ok"),
            HostStatus::Error => write!(f, "error"),
        }
    }
}

/// Everything that happened on one host for one task.
#[derive(Debug, Clone)]
pub struct HostResult {
    pub host: String,
    pub status: HostStatus,
    pub steps: Vec<StepOutcome>,
}

impl HostResult {
    fn from_outcomes(host: impl Into<String>, steps: Vec<StepOutcome>) -> Self {
        let status = if steps.iter().all(|s| s.status.is_ok()) {
            HostStatus::Ok
        } else {
            HostStatus::Error
        };
        Self {
            host: host.into(),
            status,
            steps,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HostStatus::Ok
    }
}

/// Task-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ok,
    Error,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Ok => write!(f, "ok"),
            TaskStatus::Error => write!(f, "error"),
        }
    }
}

/// One task's outcome across its host set.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: String,
    pub status: TaskStatus,
    pub duration_ms: u64,
    pub host_results: Vec<HostResult>,
    /// Handlers notified by this task's resources, name-ascending.
    pub triggered_handlers: Vec<String>,
}

impl TaskResult {
    pub fn is_ok(&self) -> bool {
        self.status == TaskStatus::Ok
    }
}

/// Run-wide execution options.
#[derive(Clone)]
pub struct RunOptions {
    pub check_mode: bool,
    pub continue_on_error: bool,
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            check_mode: false,
            continue_on_error: false,
            cancel: CancellationToken::new(),
        }
    }
}

/// Scratch accumulators shared with the (droppable) per-host future, so a
/// task timeout still surfaces the partial outcomes.
#[derive(Default)]
struct HostScratch {
    outcomes: Mutex<Vec<StepOutcome>>,
    notified: Mutex<Vec<String>>,
    fatal_session: AtomicBool,
}

/// Executes tasks against resolved host sets.
#[derive(Clone)]
pub struct TaskRunner {
    pool: Arc<ConnectionPool>,
    facts: Arc<FactCache>,
    resources: Arc<ResourceExecutor>,
    telemetry: SharedSink,
    defaults: Defaults,
    vars: IndexMap<String, serde_json::Value>,
}

impl TaskRunner {
    pub fn new(
        pool: Arc<ConnectionPool>,
        facts: Arc<FactCache>,
        registry: Arc<ProviderRegistry>,
        telemetry: SharedSink,
        defaults: Defaults,
        vars: IndexMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            pool,
            facts,
            resources: Arc::new(ResourceExecutor::new(registry)),
            telemetry,
            defaults,
            vars,
        }
    }

    /// Runs one task over its resolved hosts and rolls the results up.
    pub async fn run(
        &self,
        task: &Task,
        hosts: &[Host],
        handlers: Arc<HandlerQueue>,
        opts: &RunOptions,
    ) -> TaskResult {
        let stopwatch = Stopwatch::start();
        self.telemetry.emit(Event::new(
            names::TASK_START,
            serde_json::json!({"task": task.name, "hosts": hosts.len(), "strategy": task.strategy.to_string()}),
        ));
        info!(task = %task.name, hosts = hosts.len(), strategy = %task.strategy, "Task started");

        let (host_results, notified) = if task.on == Target::Local {
            let (result, notified) = self.run_local(task, &handlers, opts).await;
            (vec![result], notified)
        } else {
            match task.strategy {
                crate::config::Strategy::Serial => {
                    self.run_serial(task, hosts, &handlers, opts).await
                }
                crate::config::Strategy::Parallel => {
                    self.run_parallel(task, hosts, &handlers, opts).await
                }
                crate::config::Strategy::Rolling if hosts.len() > 1 => {
                    self.run_rolling(task, hosts, &handlers, opts).await
                }
                crate::config::Strategy::Rolling => {
                    self.run_parallel(task, hosts, &handlers, opts).await
                }
            }
        };

        let status = if host_results.iter().all(HostResult::is_ok) {
            TaskStatus::Ok
        } else {
            TaskStatus::Error
        };

        let mut triggered: Vec<String> = notified;
        triggered.sort();
        triggered.dedup();

        let duration_ms = stopwatch.elapsed_ms();
        self.telemetry.emit(
            Event::new(
                names::TASK_STOP,
                serde_json::json!({"task": task.name, "status": status.to_string()}),
            )
            .with_duration(duration_ms),
        );
        info!(task = %task.name, status = %status, duration_ms, "Task finished");

        TaskResult {
            task: task.name.clone(),
            status,
            duration_ms,
            host_results,
            triggered_handlers: triggered,
        }
    }

    async fn run_serial(
        &self,
        task: &Task,
        hosts: &[Host],
        handlers: &Arc<HandlerQueue>,
        opts: &RunOptions,
    ) -> (Vec<HostResult>, Vec<String>) {
        let mut results = Vec::with_capacity(hosts.len());
        let mut notified = Vec::new();
        for host in hosts {
            let (result, mut names) = self.run_host(task, &task.steps, host, handlers, opts).await;
            results.push(result);
            notified.append(&mut names);
        }
        (results, notified)
    }

    async fn run_parallel(
        &self,
        task: &Task,
        hosts: &[Host],
        handlers: &Arc<HandlerQueue>,
        opts: &RunOptions,
    ) -> (Vec<HostResult>, Vec<String>) {
        self.run_hosts_bounded(task, &task.steps, hosts, handlers, opts)
            .await
    }

    /// Runs the given steps on every host concurrently, bounded by the
    /// task's fork limit. Results come back in input host order.
    pub(crate) async fn run_hosts_bounded(
        &self,
        task: &Task,
        steps: &[Step],
        hosts: &[Host],
        handlers: &Arc<HandlerQueue>,
        opts: &RunOptions,
    ) -> (Vec<HostResult>, Vec<String>) {
        let semaphore = Arc::new(Semaphore::new(task.forks.max(1)));
        let steps: Arc<[Step]> = steps.to_vec().into();

        let mut joins = Vec::with_capacity(hosts.len());
        for (index, host) in hosts.iter().enumerate() {
            let runner = self.clone();
            let task = task.clone();
            let steps = Arc::clone(&steps);
            let host = host.clone();
            let handlers = Arc::clone(handlers);
            let opts = opts.clone();
            let semaphore = Arc::clone(&semaphore);

            joins.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let (result, notified) = runner
                    .run_host(&task, &steps, &host, &handlers, &opts)
                    .await;
                (index, result, notified)
            }));
        }

        let mut indexed: Vec<(usize, HostResult, Vec<String>)> = Vec::with_capacity(joins.len());
        for (spawn_index, join) in join_all(joins).await.into_iter().enumerate() {
            match join {
                Ok(entry) => indexed.push(entry),
                Err(err) => {
                    warn!(error = %err, "Host worker panicked");
                    let host = hosts[spawn_index].name.clone();
                    indexed.push((
                        spawn_index,
                        HostResult::from_outcomes(
                            host,
                            vec![StepOutcome::error("worker", err.to_string())],
                        ),
                        Vec::new(),
                    ));
                }
            }
        }
        indexed.sort_by_key(|(index, _, _)| *index);

        let mut results = Vec::with_capacity(indexed.len());
        let mut notified = Vec::new();
        for (_, result, mut names) in indexed {
            results.push(result);
            notified.append(&mut names);
        }
        (results, notified)
    }

    async fn run_local(
        &self,
        task: &Task,
        handlers: &Arc<HandlerQueue>,
        opts: &RunOptions,
    ) -> (HostResult, Vec<String>) {
        let scratch = Arc::new(HostScratch::default());
        let session = LocalSession::new();

        let work = {
            let scratch = Arc::clone(&scratch);
            async move {
                match self.facts.get_or_gather(LOCAL_HOST, &session).await {
                    Ok(facts) => {
                        self.execute_steps(
                            task,
                            &task.steps,
                            LOCAL_HOST,
                            None,
                            &session,
                            facts,
                            handlers,
                            opts,
                            &scratch,
                        )
                        .await;
                    }
                    Err(err) => {
                        scratch
                            .outcomes
                            .lock()
                            .unwrap()
                            .push(StepOutcome::error("gather facts", err.to_string()));
                    }
                }
            }
        };
        if self.bound_by_task_timeout(task, work).await.is_none() {
            scratch
                .outcomes
                .lock()
                .unwrap()
                .push(StepOutcome::error(task.name.as_str(), "timeout"));
        }

        Self::drain_scratch(LOCAL_HOST, &scratch)
    }

    /// Runs `steps` on one remote host through a pooled session.
    pub(crate) async fn run_host(
        &self,
        task: &Task,
        steps: &[Step],
        host: &Host,
        handlers: &Arc<HandlerQueue>,
        opts: &RunOptions,
    ) -> (HostResult, Vec<String>) {
        let scratch = Arc::new(HostScratch::default());

        let checkout = self.pool.checkout(host, |session| {
            let scratch = Arc::clone(&scratch);
            let runner = self.clone();
            let handlers = Arc::clone(handlers);
            let opts = opts.clone();
            async move {
                match runner.facts.get_or_gather(&host.name, &*session).await {
                    Ok(facts) => {
                        runner
                            .execute_steps(
                                task,
                                steps,
                                &host.name,
                                Some(host),
                                &*session,
                                facts,
                                &handlers,
                                &opts,
                                &scratch,
                            )
                            .await;
                    }
                    Err(err) => {
                        if err.is_fatal() {
                            scratch.fatal_session.store(true, Ordering::SeqCst);
                        }
                        scratch
                            .outcomes
                            .lock()
                            .unwrap()
                            .push(StepOutcome::error("gather facts", err.to_string()));
                    }
                }
                let health = if scratch.fatal_session.load(Ordering::SeqCst) {
                    SessionHealth::Broken
                } else {
                    SessionHealth::Healthy
                };
                ((), health)
            }
        });

        match self.bound_by_task_timeout(task, checkout).await {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                scratch.outcomes.lock().unwrap().push(StepOutcome::error(
                    format!("connect {}", host.name),
                    err.to_string(),
                ));
            }
            None => {
                scratch
                    .outcomes
                    .lock()
                    .unwrap()
                    .push(StepOutcome::error(task.name.as_str(), "timeout"));
            }
        }

        Self::drain_scratch(&host.name, &scratch)
    }

    /// Bounds `work` by the task's wall-clock timeout. Returns `None` when
    /// the timeout fired; the partial outcomes stay in scratch.
    async fn bound_by_task_timeout<T>(
        &self,
        task: &Task,
        work: impl std::future::Future<Output = T>,
    ) -> Option<T> {
        match task.timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.ok(),
            None => Some(work.await),
        }
    }

    fn drain_scratch(host_label: &str, scratch: &HostScratch) -> (HostResult, Vec<String>) {
        let outcomes = std::mem::take(&mut *scratch.outcomes.lock().unwrap());
        let notified = std::mem::take(&mut *scratch.notified.lock().unwrap());
        (HostResult::from_outcomes(host_label, outcomes), notified)
    }

    /// Sequentially executes steps on one host; outcomes accumulate in
    /// scratch so callers can salvage them after a timeout.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn execute_steps(
        &self,
        task: &Task,
        steps: &[Step],
        host_label: &str,
        host: Option<&Host>,
        session: &dyn Session,
        facts: Arc<crate::facts::Facts>,
        handlers: &HandlerQueue,
        opts: &RunOptions,
        scratch: &HostScratch,
    ) {
        for step in steps {
            if opts.cancel.is_cancelled() {
                scratch
                    .outcomes
                    .lock()
                    .unwrap()
                    .push(StepOutcome::error(step.describe(), "cancelled"));
                return;
            }

            let outcome = match step {
                Step::Command(command) => {
                    self.run_command(command, host_label, session, opts, scratch)
                        .await
                }
                Step::Resource(resource) => {
                    let ctx = ExecutionContext::new(Arc::clone(&facts), host_label)
                        .with_check_mode(opts.check_mode)
                        .with_cancel(opts.cancel.clone());
                    let result = self
                        .resources
                        .execute(resource, session, &ctx, handlers)
                        .await;
                    if !opts.check_mode {
                        if let Some(handler) = &result.notify {
                            scratch.notified.lock().unwrap().push(handler.clone());
                        }
                    }
                    resource_outcome(result)
                }
                Step::Upload(upload) => {
                    step_outcome_from(step.describe(), steps::upload(session, upload).await)
                }
                Step::Download(download) => {
                    step_outcome_from(step.describe(), steps::download(session, download).await)
                }
                Step::Template(template) => step_outcome_from(
                    step.describe(),
                    steps::template(session, template, &facts, &self.vars, host_label).await,
                ),
                Step::WaitFor(wait) => {
                    let stopwatch = Stopwatch::start();
                    let result = health::wait_for(wait, host, session, &opts.cancel).await;
                    let mut outcome = step_outcome_from(step.describe(), result.map(|_| "passed".to_string()));
                    outcome.duration_ms = stopwatch.elapsed_ms();
                    outcome
                }
            };

            let failed = !outcome.status.is_ok();
            debug!(
                host = %host_label,
                step = %outcome.description,
                status = %outcome.status,
                "Step finished"
            );
            scratch.outcomes.lock().unwrap().push(outcome);

            if failed && !opts.continue_on_error {
                return;
            }
        }
    }

    /// Runs a command step with fixed-delay retries.
    async fn run_command(
        &self,
        command: &Command,
        host_label: &str,
        session: &dyn Session,
        opts: &RunOptions,
        scratch: &HostScratch,
    ) -> StepOutcome {
        let stopwatch = Stopwatch::start();
        self.telemetry.emit(Event::new(
            names::COMMAND_START,
            serde_json::json!({"cmd": command.cmd, "host": host_label}),
        ));

        let exec_opts = ExecOptions {
            timeout: command.timeout.or(Some(self.defaults.command_timeout)),
            cwd: command.cwd.clone(),
            env: command.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            cancel: opts.cancel.clone(),
        };

        // Retry on command failure and transient session errors; fatal
        // session errors and cancellation stop the attempt loop early.
        let retried = retry_with_delay(command.retries, command.retry_delay, |_attempt| {
            let exec_opts = exec_opts.clone();
            async move {
                let result = if command.sudo {
                    session
                        .exec_sudo(&command.cmd, command.user.as_deref(), &exec_opts)
                        .await
                } else {
                    session.exec(&command.cmd, &exec_opts).await
                };
                match result {
                    Ok(out) if out.success() => Ok(Ok(out)),
                    Ok(out) => Err(AttemptFailure::Exit(out)),
                    Err(err) if err.is_fatal() || matches!(err, SessionError::Cancelled) => {
                        Ok(Err(err))
                    }
                    Err(err) => Err(AttemptFailure::Session(err)),
                }
            }
        })
        .await;

        let attempts = retried.attempts;
        let mut outcome = match retried.result {
            Ok(Ok(out)) => StepOutcome {
                description: command.cmd.clone(),
                status: StepStatus::Ok,
                output: out.combined(),
                exit_code: Some(out.exit_code),
                attempts,
                duration_ms: 0,
            },
            Ok(Err(err)) => {
                if err.is_fatal() {
                    scratch.fatal_session.store(true, Ordering::SeqCst);
                }
                StepOutcome {
                    description: command.cmd.clone(),
                    status: StepStatus::Error,
                    output: err.to_string(),
                    exit_code: None,
                    attempts,
                    duration_ms: 0,
                }
            }
            Err(AttemptFailure::Exit(out)) => StepOutcome {
                description: command.cmd.clone(),
                status: StepStatus::Error,
                output: out.combined(),
                exit_code: Some(out.exit_code),
                attempts,
                duration_ms: 0,
            },
            Err(AttemptFailure::Session(err)) => StepOutcome {
                description: command.cmd.clone(),
                status: StepStatus::Error,
                output: match err {
                    SessionError::Timeout => "timeout".to_string(),
                    other => other.to_string(),
                },
                exit_code: None,
                attempts,
                duration_ms: 0,
            },
        };
        outcome.duration_ms = stopwatch.elapsed_ms();

        self.telemetry.emit(
            Event::new(
                names::COMMAND_STOP,
                serde_json::json!({
                    "cmd": command.cmd,
                    "host": host_label,
                    "exit_code": outcome.exit_code,
                    "status": outcome.status.to_string(),
                }),
            )
            .with_duration(outcome.duration_ms),
        );
        outcome
    }
}

/// Why one command attempt failed (and may be retried).
enum AttemptFailure {
    Exit(crate::ssh::ExecOutput),
    Session(SessionError),
}

fn resource_outcome(result: crate::resource::ResourceResult) -> StepOutcome {
    let status = match result.status {
        ResourceStatus::Ok => StepStatus::Ok,
        ResourceStatus::Changed => StepStatus::Changed,
        ResourceStatus::Failed => StepStatus::Error,
        ResourceStatus::Skipped => StepStatus::Skipped,
    };
    let mut output_parts = Vec::new();
    if let Some(message) = &result.message {
        output_parts.push(message.clone());
    }
    if let Some(diff) = &result.diff {
        if diff.changed {
            output_parts.push(diff.changes.join("; "));
        }
    }
    StepOutcome {
        description: result.description,
        status,
        output: output_parts.join(" | "),
        exit_code: None,
        attempts: 1,
        duration_ms: result.duration_ms,
    }
}

fn step_outcome_from(description: String, result: Result<String, crate::error::StepError>) -> StepOutcome {
    match result {
        Ok(message) => StepOutcome {
            description,
            status: StepStatus::Ok,
            output: message,
            exit_code: None,
            attempts: 1,
            duration_ms: 0,
        },
        Err(err) => StepOutcome::error(description, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use crate::error::SessionError as SessErr;
    use crate::pool::{Connector, PoolConfig};
    use crate::ssh::mock::MockSession;
    use crate::telemetry::CollectingSink;
    use async_trait::async_trait;
    use std::time::Duration;

    struct PlainConnector;

    #[async_trait]
    impl Connector for PlainConnector {
        async fn connect(&self, _host: &Host) -> Result<Box<dyn Session>, SessErr> {
            Ok(Box::new(MockSession::new()))
        }
    }

    fn runner() -> TaskRunner {
        let pool = ConnectionPool::new(
            Arc::new(PlainConnector),
            PoolConfig::default(),
            Arc::new(CollectingSink::new()),
        );
        TaskRunner::new(
            pool,
            Arc::new(FactCache::new()),
            Arc::new(crate::resource::ProviderRegistry::standard()),
            Arc::new(CollectingSink::new()),
            Defaults::default(),
            IndexMap::new(),
        )
    }

    fn runner_with_sink(sink: Arc<CollectingSink>) -> TaskRunner {
        let pool = ConnectionPool::new(
            Arc::new(PlainConnector),
            PoolConfig::default(),
            Arc::new(CollectingSink::new()),
        );
        TaskRunner::new(
            pool,
            Arc::new(FactCache::new()),
            Arc::new(crate::resource::ProviderRegistry::standard()),
            sink,
            Defaults::default(),
            IndexMap::new(),
        )
    }

    fn local_task(name: &str, cmds: &[&str]) -> Task {
        let mut task = Task::new(name, Target::Local);
        task.steps = cmds
            .iter()
            .map(|c| Step::Command(Command::new(*c)))
            .collect();
        task
    }

    #[tokio::test]
    async fn test_local_task_runs_commands_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("order.txt");
        let marker_str = marker.to_string_lossy().into_owned();

        let task = local_task(
            "ordered",
            &[
                &format!("echo first >> {marker_str}"),
                &format!("echo second >> {marker_str}"),
            ],
        );
        let result = runner()
            .run(&task, &[], Arc::new(HandlerQueue::new()), &RunOptions::default())
            .await;

        assert!(result.is_ok());
        assert_eq!(result.host_results.len(), 1);
        assert_eq!(result.host_results[0].host, LOCAL_HOST);
        let content = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_failed_command_halts_host_by_default() {
        let task = local_task("failing", &["true", "false", "echo unreached"]);
        let result = runner()
            .run(&task, &[], Arc::new(HandlerQueue::new()), &RunOptions::default())
            .await;

        assert!(!result.is_ok());
        let steps = &result.host_results[0].steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Ok);
        assert_eq!(steps[1].status, StepStatus::Error);
        assert_eq!(steps[1].exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_continue_on_error_surfaces_failure_but_continues() {
        let task = local_task("tolerant", &["false", "echo after"]);
        let opts = RunOptions {
            continue_on_error: true,
            ..Default::default()
        };
        let result = runner()
            .run(&task, &[], Arc::new(HandlerQueue::new()), &opts)
            .await;

        assert!(!result.is_ok());
        let steps = &result.host_results[0].steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].status, StepStatus::Ok);
    }

    #[tokio::test]
    async fn test_retry_counts_attempts_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("attempts");
        let counter_str = counter.to_string_lossy().into_owned();

        // Fails twice, succeeds on the third attempt.
        let script = format!(
            "n=$(cat {counter_str} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {counter_str}; test $n -ge 3"
        );
        let mut task = Task::new("retrying", Target::Local);
        let mut command = Command::new(script);
        command.retries = 5;
        command.retry_delay = Duration::from_millis(30);
        task.steps = vec![Step::Command(command)];

        let started = std::time::Instant::now();
        let result = runner()
            .run(&task, &[], Arc::new(HandlerQueue::new()), &RunOptions::default())
            .await;

        assert!(result.is_ok());
        let step = &result.host_results[0].steps[0];
        assert_eq!(step.attempts, 3);
        // Two failed attempts mean two fixed delays.
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_final_attempt() {
        let mut task = Task::new("hopeless", Target::Local);
        let mut command = Command::new("false");
        command.retries = 2;
        command.retry_delay = Duration::from_millis(1);
        task.steps = vec![Step::Command(command)];

        let result = runner()
            .run(&task, &[], Arc::new(HandlerQueue::new()), &RunOptions::default())
            .await;

        let step = &result.host_results[0].steps[0];
        assert_eq!(step.status, StepStatus::Error);
        assert_eq!(step.attempts, 3);
    }

    #[tokio::test]
    async fn test_task_timeout_marks_host_error() {
        let mut task = local_task("slow", &["sleep 5"]);
        task.timeout = Some(Duration::from_millis(100));

        let result = runner()
            .run(&task, &[], Arc::new(HandlerQueue::new()), &RunOptions::default())
            .await;

        assert!(!result.is_ok());
        let last = result.host_results[0].steps.last().unwrap();
        assert_eq!(last.status, StepStatus::Error);
        assert_eq!(last.output, "timeout");
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_steps() {
        let opts = RunOptions::default();
        opts.cancel.cancel();

        let task = local_task("cancelled", &["echo never"]);
        let result = runner()
            .run(&task, &[], Arc::new(HandlerQueue::new()), &opts)
            .await;

        assert!(!result.is_ok());
        let step = &result.host_results[0].steps[0];
        assert_eq!(step.output, "cancelled");
    }

    #[tokio::test]
    async fn test_parallel_results_keep_host_order() {
        let hosts: Vec<Host> = (1..=4)
            .map(|i| Host::parse(format!("h{i}"), &format!("h{i}.example.com")).unwrap())
            .collect();
        let mut task = Task::new("fanout", Target::Named("web".into()));
        task.steps = vec![Step::Command(Command::new("true"))];
        task.strategy = Strategy::Parallel;

        let result = runner()
            .run(&task, &hosts, Arc::new(HandlerQueue::new()), &RunOptions::default())
            .await;

        let names: Vec<_> = result.host_results.iter().map(|r| r.host.as_str()).collect();
        assert_eq!(names, vec!["h1", "h2", "h3", "h4"]);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_command_telemetry_events() {
        let sink = Arc::new(CollectingSink::new());
        let task = local_task("observed", &["true"]);
        runner_with_sink(Arc::clone(&sink))
            .run(&task, &[], Arc::new(HandlerQueue::new()), &RunOptions::default())
            .await;

        let names = sink.names();
        assert_eq!(
            names,
            vec!["task.start", "command.start", "command.stop", "task.stop"]
        );
    }
}
