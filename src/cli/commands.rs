//! CLI command definitions and dispatch.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::config;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::preflight::{self, CheckKind};
use crate::ssh::auth::AuthOptions;
use crate::telemetry;

/// Default config file name.
const DEFAULT_CONFIG: &str = "nexus.yml";

/// Starter config written by `nexus init`.
const STARTER_CONFIG: &str = r#"# nexus starter config
defaults:
  user: deploy
  max_connections: 5

hosts:
  web1: web1.example.com

groups:
  web: [web1]

tasks:
  ping:
    on: web
    steps:
      - cmd: uptime

  build:
    on: local
    steps:
      - cmd: echo building

  deploy:
    deps: [build]
    on: web
    strategy: rolling
    batch_size: 1
    steps:
      - cmd: echo deploying
      - wait_for: { cmd: "true", timeout: 30s, interval: 2s }

handlers:
  reload_app:
    - cmd: echo reloading
"#;

/// SSH-based fleet orchestration with dependency-aware parallelism.
#[derive(Parser)]
#[command(name = "nexus")]
#[command(about = "Run declarative task pipelines across an SSH fleet")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run target tasks (and their dependencies) from a config.
    Run(RunArgs),

    /// List the hosts, groups, and tasks a config defines.
    List(ListArgs),

    /// Validate a config: references, dependency graph, phases.
    Validate(ValidateArgs),

    /// Write a starter config to get going.
    Init(InitArgs),

    /// Check config, host resolution, SSH, and sudo before a run.
    Preflight(PreflightArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the config file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Task names to run; empty means every task.
    pub tasks: Vec<String>,

    /// Maximum concurrently running tasks per phase.
    #[arg(long, default_value = "10")]
    pub parallel_limit: usize,

    /// Keep going after task failures.
    #[arg(long)]
    pub continue_on_error: bool,

    /// Check mode: report what would change without applying.
    #[arg(long)]
    pub check: bool,

    /// Identity file for SSH authentication.
    #[arg(short, long)]
    pub identity_file: Option<PathBuf>,

    /// SSH password (prefer keys; mostly for lab setups).
    #[arg(long, env = "NEXUS_SSH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

/// Arguments for the list command.
#[derive(Parser, Debug)]
pub struct ListArgs {
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
}

/// Arguments for the validate command.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
}

/// Arguments for the init command.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Where to write the starter config.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
}

/// Arguments for the preflight command.
#[derive(Parser, Debug)]
pub struct PreflightArgs {
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Task names to verify (optional).
    pub tasks: Vec<String>,

    /// Checks to skip: config, hosts, ssh, sudo, tasks.
    #[arg(long, value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Identity file for SSH authentication.
    #[arg(short, long)]
    pub identity_file: Option<PathBuf>,
}

/// Parses CLI arguments from the process environment.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Dispatches a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline(args).await,
        Commands::List(args) => list(args),
        Commands::Validate(args) => validate(args),
        Commands::Init(args) => init(args),
        Commands::Preflight(args) => run_preflight(args).await,
    }
}

async fn run_pipeline(args: RunArgs) -> anyhow::Result<()> {
    let loaded = config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let auth = AuthOptions {
        identity_file: args.identity_file,
        password: args.password,
        ..Default::default()
    };
    let pipeline = Pipeline::new(loaded, auth, telemetry::tracing_sink());

    let opts = PipelineOptions {
        parallel_limit: args.parallel_limit,
        continue_on_error: args.continue_on_error.then_some(true),
        check_mode: args.check,
        ..Default::default()
    };

    let result = pipeline.run(&args.tasks, opts).await?;
    pipeline.shutdown();

    println!(
        "pipeline {}: {} run, {} ok, {} failed ({} ms)",
        result.status, result.tasks_run, result.tasks_succeeded, result.tasks_failed,
        result.duration_ms
    );
    for task in &result.task_results {
        println!("  task {:<24} {}", task.task, task.status);
        for host in &task.host_results {
            if !host.is_ok() {
                for step in host.steps.iter().filter(|s| !s.status.is_ok()) {
                    println!("    {}: {} ({})", host.host, step.description, step.output);
                }
            }
        }
    }
    for handler in &result.handler_results {
        println!("  handler {:<21} {}", handler.task, handler.status);
    }
    if let Some(aborted_at) = &result.aborted_at {
        println!("  aborted at: {aborted_at}");
    }

    if result.is_ok() {
        Ok(())
    } else {
        anyhow::bail!("pipeline finished with errors")
    }
}

fn list(args: ListArgs) -> anyhow::Result<()> {
    let loaded = config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let config = &loaded.config;

    println!("hosts:");
    for host in config.hosts.values() {
        println!("  {:<16} {host}", host.name);
    }
    println!("groups:");
    for group in config.groups.values() {
        println!("  {:<16} [{}]", group.name, group.hosts.join(", "));
    }
    println!("tasks:");
    for task in config.tasks.values() {
        let deps: Vec<&str> = task.deps.iter().map(String::as_str).collect();
        println!(
            "  {:<16} on={} strategy={} steps={} deps=[{}]",
            task.name,
            task.on,
            task.strategy,
            task.steps.len(),
            deps.join(", ")
        );
    }
    println!("handlers:");
    for handler in config.handlers.values() {
        println!("  {:<16} {} command(s)", handler.name, handler.commands.len());
    }
    Ok(())
}

fn validate(args: ValidateArgs) -> anyhow::Result<()> {
    let loaded = config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let pipeline = Pipeline::with_connector(
        loaded.config,
        std::sync::Arc::new(NullConnector),
        telemetry::tracing_sink(),
    );
    let plan = pipeline.dry_run(&[])?;

    println!("config ok: {} phase(s)", plan.phases.len());
    for (index, phase) in plan.phases.iter().enumerate() {
        println!("  phase {}: [{}]", index, phase.join(", "));
    }
    Ok(())
}

fn init(args: InitArgs) -> anyhow::Result<()> {
    if args.config.exists() {
        anyhow::bail!("{} already exists", args.config.display());
    }
    std::fs::write(&args.config, STARTER_CONFIG)?;
    info!(path = %args.config.display(), "Wrote starter config");
    println!("wrote {}", args.config.display());
    Ok(())
}

async fn run_preflight(args: PreflightArgs) -> anyhow::Result<()> {
    let loaded = config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let skip: Vec<CheckKind> = args
        .skip
        .iter()
        .filter_map(|s| CheckKind::parse(s))
        .collect();

    let auth = AuthOptions {
        identity_file: args.identity_file,
        ..Default::default()
    };
    let pipeline = Pipeline::new(loaded, auth, telemetry::tracing_sink());

    let report =
        preflight::run_checks(pipeline.config(), pipeline.pool(), &args.tasks, &skip).await;
    pipeline.shutdown();

    for outcome in &report.outcomes {
        let mark = if outcome.passed { "ok  " } else { "FAIL" };
        println!("{mark} {:<8} {}", outcome.check, outcome.detail);
    }

    if report.passed() {
        Ok(())
    } else {
        anyhow::bail!("preflight failed")
    }
}

/// Connector for commands that never dial out.
struct NullConnector;

#[async_trait::async_trait]
impl crate::pool::Connector for NullConnector {
    async fn connect(
        &self,
        host: &crate::config::Host,
    ) -> Result<Box<dyn crate::ssh::Session>, crate::error::SessionError> {
        Err(crate::error::SessionError::ConnectionFailed {
            host: host.name.clone(),
            reason: "validation-only pipeline".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Target;

    #[test]
    fn test_cli_parses_run_with_flags() {
        let cli = Cli::parse_from([
            "nexus",
            "run",
            "deploy",
            "--config",
            "fleet.yml",
            "--parallel-limit",
            "4",
            "--continue-on-error",
            "--check",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.tasks, vec!["deploy"]);
                assert_eq!(args.config, PathBuf::from("fleet.yml"));
                assert_eq!(args.parallel_limit, 4);
                assert!(args.continue_on_error);
                assert!(args.check);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parses_preflight_skip_list() {
        let cli = Cli::parse_from(["nexus", "preflight", "--skip", "ssh,sudo"]);
        match cli.command {
            Commands::Preflight(args) => {
                assert_eq!(args.skip, vec!["ssh", "sudo"]);
            }
            _ => panic!("expected preflight"),
        }
    }

    #[test]
    fn test_starter_config_is_loadable() {
        let loaded = config::load_str(STARTER_CONFIG, std::path::Path::new(".")).unwrap();
        assert!(loaded.config.tasks.contains_key("deploy"));
        assert!(loaded.config.tasks["deploy"].deps.contains("build"));
        assert_eq!(
            loaded.config.tasks["deploy"].on,
            Target::Named("web".into())
        );
    }
}
