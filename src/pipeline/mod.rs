//! The pipeline: drives a full run phase by phase.
//!
//! Validation and planning happen before anything executes; runtime
//! failures surface in the result, never as `Err`. The single coordinator
//! owns the accumulator and receives worker results over a channel; task
//! runners never share mutable state with it.
//!
//! State machine:
//! `init -> validated -> planned -> running -> [aborting] -> completed`,
//! with `cancelled` as the alternate exit from `running`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;
use tracing::{info, warn};

use crate::common::{CancellationToken, Stopwatch};
use crate::config::{Config, Loaded, Strategy, Target, Task};
use crate::dag::Dag;
use crate::error::PipelineError;
use crate::facts::FactCache;
use crate::handlers::HandlerQueue;
use crate::pool::{ConnectionPool, Connector, PoolConfig};
use crate::resource::ProviderRegistry;
use crate::runner::{HostResult, RunOptions, StepOutcome, TaskResult, TaskRunner, TaskStatus};
use crate::ssh::auth::AuthOptions;
use crate::ssh::SshConnector;
use crate::telemetry::{names, Event, SharedSink};

/// Overall pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Ok,
    Error,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Ok => write!(f, "ok"),
            PipelineStatus::Error => write!(f, "error"),
        }
    }
}

/// Where the run ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Validated,
    Planned,
    Running,
    Aborting,
    Completed,
    Cancelled,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineState::Init => "init",
            PipelineState::Validated => "validated",
            PipelineState::Planned => "planned",
            PipelineState::Running => "running",
            PipelineState::Aborting => "aborting",
            PipelineState::Completed => "completed",
            PipelineState::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// Options for one run.
#[derive(Clone)]
pub struct PipelineOptions {
    /// Bound on concurrently running task runners per phase.
    pub parallel_limit: usize,
    /// Overrides the config default when set.
    pub continue_on_error: Option<bool>,
    pub check_mode: bool,
    pub cancel: CancellationToken,
    /// Wall-clock bound for each handler run.
    pub handler_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            parallel_limit: 10,
            continue_on_error: None,
            check_mode: false,
            cancel: CancellationToken::new(),
            handler_timeout: Duration::from_secs(300),
        }
    }
}

/// Aggregate outcome of one run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Unique id for this run, threaded through telemetry metadata.
    pub run_id: Uuid,
    pub status: PipelineStatus,
    pub state: PipelineState,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tasks_run: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub task_results: Vec<TaskResult>,
    pub handler_results: Vec<TaskResult>,
    /// First failed task (by name) of the phase that stopped the run.
    pub aborted_at: Option<String>,
}

impl PipelineResult {
    pub fn is_ok(&self) -> bool {
        self.status == PipelineStatus::Ok
    }
}

/// Plan produced by `dry_run`: the phases plus per-task metadata.
#[derive(Debug, Clone)]
pub struct Plan {
    pub phases: Vec<Vec<String>>,
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Clone)]
pub struct PlanTask {
    pub name: String,
    pub on: String,
    pub strategy: Strategy,
    pub deps: Vec<String>,
    pub step_count: usize,
}

/// Owns the run-scoped machinery: pool, fact cache, runner.
pub struct Pipeline {
    config: Arc<Config>,
    pool: Arc<ConnectionPool>,
    runner: TaskRunner,
    telemetry: SharedSink,
}

impl Pipeline {
    /// Builds a pipeline dialing real SSH hosts.
    pub fn new(loaded: Loaded, auth: AuthOptions, telemetry: SharedSink) -> Self {
        let connector = Arc::new(SshConnector::new(
            loaded.config.defaults.clone(),
            loaded.ssh_config,
            auth,
        ));
        Self::with_connector(loaded.config, connector, telemetry)
    }

    /// Builds a pipeline over any connector (tests inject scripted ones).
    pub fn with_connector(
        config: Config,
        connector: Arc<dyn Connector>,
        telemetry: SharedSink,
    ) -> Self {
        let pool = ConnectionPool::new(
            connector,
            PoolConfig::from_defaults(&config.defaults),
            Arc::clone(&telemetry),
        );
        let config = Arc::new(config);
        let runner = TaskRunner::new(
            Arc::clone(&pool),
            Arc::new(FactCache::new()),
            Arc::new(ProviderRegistry::standard()),
            Arc::clone(&telemetry),
            config.defaults.clone(),
            config.vars.clone(),
        );
        Self {
            config,
            pool,
            runner,
            telemetry,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Terminates pooled sessions; the pipeline is unusable afterwards.
    pub fn shutdown(&self) {
        self.pool.close_all();
    }

    /// Validation and planning only (steps 1-3 of a run).
    pub fn dry_run(&self, targets: &[String]) -> Result<Plan, PipelineError> {
        let (_, phases, required) = self.plan(targets)?;
        let tasks = required
            .iter()
            .filter_map(|name| self.config.tasks.get(name))
            .map(|task| PlanTask {
                name: task.name.clone(),
                on: task.on.to_string(),
                strategy: task.strategy,
                deps: task.deps.iter().cloned().collect(),
                step_count: task.steps.len(),
            })
            .collect();
        Ok(Plan { phases, tasks })
    }

    fn plan(&self, targets: &[String]) -> Result<(Dag, Vec<Vec<String>>, Vec<String>), PipelineError> {
        // init -> validated: every target must name a known task.
        let unknown: Vec<String> = targets
            .iter()
            .filter(|t| !self.config.tasks.contains_key(*t))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(PipelineError::UnknownTasks { names: unknown });
        }

        let dag = Dag::build(&self.config)?;

        // validated -> planned: derive the required subgraph and phases.
        let scoped = if targets.is_empty() {
            dag.clone()
        } else {
            dag.subgraph_for(targets)?
        };
        let phases = scoped.execution_phases();
        let required = scoped.topological_sort();
        Ok((scoped, phases, required))
    }

    /// Runs the targeted tasks (all tasks when `targets` is empty).
    pub async fn run(
        &self,
        targets: &[String],
        opts: PipelineOptions,
    ) -> Result<PipelineResult, PipelineError> {
        let (_dag, phases, _required) = match self.plan(targets) {
            Ok(planned) => planned,
            Err(err) => {
                self.telemetry.emit(Event::new(
                    names::PIPELINE_EXCEPTION,
                    serde_json::json!({"reason": err.to_string()}),
                ));
                return Err(err);
            }
        };
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let stopwatch = Stopwatch::start();
        let continue_on_error = opts
            .continue_on_error
            .unwrap_or(self.config.defaults.continue_on_error);

        self.telemetry.emit(Event::new(
            names::PIPELINE_START,
            serde_json::json!({
                "run_id": run_id,
                "targets": targets,
                "phases": phases.len(),
                "check_mode": opts.check_mode,
            }),
        ));
        info!(phases = phases.len(), check_mode = opts.check_mode, "Pipeline started");

        let handlers = Arc::new(HandlerQueue::new());
        let run_opts = RunOptions {
            check_mode: opts.check_mode,
            continue_on_error,
            cancel: opts.cancel.clone(),
        };

        let mut state = PipelineState::Running;
        let mut task_results: Vec<TaskResult> = Vec::new();
        let mut aborted_at: Option<String> = None;

        for (phase_index, phase) in phases.iter().enumerate() {
            if opts.cancel.is_cancelled() {
                state = PipelineState::Cancelled;
                warn!(phase = phase_index, "Pipeline cancelled");
                break;
            }

            let mut phase_results = self
                .run_phase(phase, &handlers, &run_opts, opts.parallel_limit)
                .await;
            phase_results.sort_by(|a, b| a.task.cmp(&b.task));

            let first_failed = phase_results
                .iter()
                .filter(|r| !r.is_ok())
                .map(|r| r.task.clone())
                .next();
            task_results.extend(phase_results);

            if let Some(failed) = first_failed {
                if !continue_on_error {
                    // aborting: remaining phases are skipped, handlers
                    // still flush.
                    warn!(task = %failed, "Aborting pipeline");
                    aborted_at = Some(failed);
                    state = PipelineState::Aborting;
                    break;
                }
            }
        }

        // Handlers run after all phase execution, even on abort.
        let handler_results = if opts.check_mode {
            Vec::new()
        } else {
            self.run_handlers(&handlers, &run_opts, opts.handler_timeout)
                .await
        };

        let tasks_failed = task_results.iter().filter(|r| !r.is_ok()).count();
        let tasks_succeeded = task_results.len() - tasks_failed;
        let handler_failures = handler_results.iter().filter(|r| !r.is_ok()).count();

        let status = if tasks_failed == 0 && handler_failures == 0 && aborted_at.is_none() {
            PipelineStatus::Ok
        } else {
            PipelineStatus::Error
        };
        if state != PipelineState::Cancelled {
            state = PipelineState::Completed;
        }

        let duration_ms = stopwatch.elapsed_ms();
        self.telemetry.emit(
            Event::new(
                names::PIPELINE_STOP,
                serde_json::json!({
                    "run_id": run_id,
                    "status": status.to_string(),
                    "tasks_run": task_results.len(),
                    "tasks_failed": tasks_failed,
                    "aborted_at": aborted_at,
                }),
            )
            .with_duration(duration_ms),
        );
        info!(status = %status, tasks = task_results.len(), duration_ms, "Pipeline finished");

        Ok(PipelineResult {
            run_id,
            status,
            state,
            started_at,
            duration_ms,
            tasks_run: task_results.len(),
            tasks_succeeded,
            tasks_failed,
            task_results,
            handler_results,
            aborted_at,
        })
    }

    /// Launches the phase members (ascending name order) and collects
    /// their results over a channel.
    async fn run_phase(
        &self,
        phase: &[String],
        handlers: &Arc<HandlerQueue>,
        run_opts: &RunOptions,
        parallel_limit: usize,
    ) -> Vec<TaskResult> {
        let (tx, mut rx) = mpsc::channel(phase.len().max(1));
        let semaphore = Arc::new(Semaphore::new(parallel_limit.max(1)));

        for name in phase {
            let Some(task) = self.config.tasks.get(name).cloned() else {
                continue;
            };
            let hosts = self.config.resolve_target(&task.on);
            let runner = self.runner.clone();
            let handlers = Arc::clone(handlers);
            let run_opts = run_opts.clone();
            let tx = tx.clone();
            let semaphore = Arc::clone(&semaphore);

            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = runner.run(&task, &hosts, handlers, &run_opts).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(phase.len());
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        // A missing result means the worker died; surface it rather than
        // silently shrinking the phase.
        if results.len() < phase.len() {
            let seen: Vec<String> = results.iter().map(|r| r.task.clone()).collect();
            for name in phase {
                if !seen.iter().any(|s| s == name) {
                    self.telemetry.emit(Event::new(
                        names::TASK_EXCEPTION,
                        serde_json::json!({"task": name, "reason": "worker died"}),
                    ));
                    results.push(TaskResult {
                        task: name.clone(),
                        status: TaskStatus::Error,
                        duration_ms: 0,
                        host_results: vec![HostResult {
                            host: String::new(),
                            status: crate::runner::HostStatus::Error,
                            steps: vec![StepOutcome {
                                description: name.clone(),
                                status: crate::runner::StepStatus::Error,
                                output: "worker died".into(),
                                exit_code: None,
                                attempts: 1,
                                duration_ms: 0,
                            }],
                        }],
                        triggered_handlers: Vec::new(),
                    });
                }
            }
        }
        results
    }

    /// Flushes the queue and runs each handler as a synthetic task over
    /// every host in the config (local when the config has none).
    async fn run_handlers(
        &self,
        handlers: &Arc<HandlerQueue>,
        run_opts: &RunOptions,
        timeout: Duration,
    ) -> Vec<TaskResult> {
        let queued = handlers.flush();
        if queued.is_empty() {
            return Vec::new();
        }
        info!(count = queued.len(), "Running handlers");

        let all_hosts = self.config.all_hosts();
        let mut results = Vec::with_capacity(queued.len());
        for name in queued {
            let Some(handler) = self.config.handlers.get(&name) else {
                warn!(handler = %name, "Handler not found");
                continue;
            };

            let mut task = Task::new(handler.name.clone(), if all_hosts.is_empty() {
                Target::Local
            } else {
                Target::Named("all".into())
            });
            task.strategy = Strategy::Parallel;
            task.timeout = Some(timeout);
            task.steps = handler
                .commands
                .iter()
                .cloned()
                .map(crate::config::Step::Command)
                .collect();

            // Handlers always run to completion, even after an abort.
            let handler_opts = RunOptions {
                continue_on_error: false,
                ..run_opts.clone()
            };
            results.push(
                self.runner
                    .run(&task, &all_hosts, Arc::clone(handlers), &handler_opts)
                    .await,
            );
        }
        results
    }
}
