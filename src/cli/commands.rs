//! CLI command definitions for buildloop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::FixError;
use crate::fix::{
    CommandTestRunner, FsWorkspace, LlmRepairAgent, RepairAgent, RepairContext, RepairResponse,
    SelfFixLoop, TestRunner,
};
use crate::llm::{LiteLlmClient, LlmProvider};
use crate::processor::handlers::TestingPhaseHandler;
use crate::processor::PhaseHandler;
use crate::runtime::Runtime;
use crate::scheduler::{Job, JobContext, JobOptions, QueueOptions};

/// Default time `run` waits for its jobs.
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 3600;

/// Async job execution core with retrying queues and a self-fix loop.
#[derive(Parser)]
#[command(name = "buildloop")]
#[command(about = "Run pipeline jobs with retries, escalation and automatic test repair")]
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
    /// Enqueue jobs from a file, run them to completion and print a report.
    Run(RunArgs),

    /// Run a workspace's tests and repair them on failure.
    Fix(FixArgs),

    /// Print the Prometheus exposition.
    Metrics,
}

/// Arguments for `buildloop run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// JSON file holding an array of jobs (`queue`, `name`, `payload`, ...).
    #[arg(short, long)]
    pub jobs: PathBuf,

    /// YAML service configuration.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seconds to wait for every job to finish.
    #[arg(long, default_value_t = DEFAULT_RUN_TIMEOUT_SECS)]
    pub timeout: u64,
}

/// Arguments for `buildloop fix`.
#[derive(Parser, Debug)]
pub struct FixArgs {
    /// Workspace root the tests run in.
    #[arg(short, long)]
    pub workspace: PathBuf,

    /// Test framework (cargo, pytest, go, jest, npm).
    #[arg(short, long)]
    pub framework: Option<String>,

    /// Explicit test command; repeat for several.
    #[arg(long = "command")]
    pub commands: Vec<String>,

    /// Override the configured iteration limit.
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Repair model (falls back to LITELLM_DEFAULT_MODEL).
    #[arg(short, long)]
    pub model: Option<String>,

    /// YAML service configuration.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// One entry of the `run --jobs` file.
#[derive(Debug, Deserialize)]
struct JobSpec {
    queue: String,
    name: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    delay_ms: Option<u64>,
    #[serde(default)]
    max_attempts: Option<u32>,
}

impl JobSpec {
    fn options(&self) -> JobOptions {
        let mut opts = JobOptions::new();
        if let Some(priority) = self.priority {
            opts = opts.with_priority(priority);
        }
        if let Some(ms) = self.delay_ms {
            opts = opts.with_delay(Duration::from_millis(ms));
        }
        if let Some(max) = self.max_attempts {
            opts = opts.with_max_attempts(max);
        }
        opts
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Err(e) = crate::metrics::init_metrics() {
        warn!(error = %e, "Metrics registry unavailable");
    }

    match cli.command {
        Commands::Run(args) => run_jobs_command(args).await,
        Commands::Fix(args) => run_fix_command(args).await,
        Commands::Metrics => {
            print!("{}", crate::metrics::metrics_handler().await);
            Ok(())
        }
    }
}

// ============================================================================
// run
// ============================================================================

fn load_jobs(path: &Path) -> anyhow::Result<Vec<JobSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read jobs file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid jobs file {}", path.display()))
}

fn job_report(job: &Job) -> Value {
    json!({
        "id": job.id,
        "queue": job.queue,
        "name": job.name,
        "state": job.state,
        "attemptsMade": job.attempts_made,
        "failureReason": job.failure_reason,
        "result": job.result,
    })
}

async fn run_jobs_command(args: RunArgs) -> anyhow::Result<()> {
    let config = ServiceConfig::load(args.config.as_deref())?;
    let specs = load_jobs(&args.jobs)?;

    let agent: Arc<dyn RepairAgent> = match build_repair_agent(&config, None) {
        Ok(agent) => agent,
        Err(e) => {
            warn!(error = %e, "No repair provider; failing tests will escalate");
            Arc::new(UnavailableRepairAgent {
                reason: e.to_string(),
            })
        }
    };

    let runtime = Runtime::connect(config, agent).await?;
    runtime.start().await?;

    let mut submitted = Vec::with_capacity(specs.len());
    for spec in &specs {
        let job = runtime
            .queues()
            .add_job(&spec.queue, &spec.name, spec.payload.clone(), spec.options())
            .await
            .with_context(|| format!("Failed to enqueue '{}' on '{}'", spec.name, spec.queue))?;
        submitted.push((spec.queue.clone(), job.id));
    }
    info!(jobs = submitted.len(), "Jobs submitted");

    let jobs = runtime
        .wait_for_jobs(&submitted, Duration::from_secs(args.timeout))
        .await?;

    let queues: Vec<Value> = runtime
        .queue_stats()
        .await?
        .into_iter()
        .map(|s| json!({"name": s.name, "paused": s.paused, "counts": s.counts}))
        .collect();

    let report = json!({
        "jobs": jobs.iter().map(job_report).collect::<Vec<_>>(),
        "queues": queues,
        "processor": runtime.processor().all_metrics(),
        "escalations": runtime.processor().recent_escalations(20),
        "fix": runtime.fix_loop().get_fix_stats(),
        "pendingReviews": runtime.fix_loop().pending_escalations().len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Err(e) = runtime.shutdown().await {
        warn!(error = %e, "Shutdown did not complete cleanly");
    }
    Ok(())
}

// ============================================================================
// fix
// ============================================================================

async fn run_fix_command(args: FixArgs) -> anyhow::Result<()> {
    if !args.workspace.exists() {
        return Err(anyhow::anyhow!(
            "Workspace does not exist: {}",
            args.workspace.display()
        ));
    }

    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(max) = args.max_iterations {
        config.fix = config.fix.with_max_iterations(max);
        config.validate()?;
    }

    let agent = build_repair_agent(&config, args.model)?;
    let runner: Arc<dyn TestRunner> = Arc::new(CommandTestRunner::new());
    let fix_loop = Arc::new(SelfFixLoop::new(
        config.fix.clone(),
        agent,
        Arc::new(FsWorkspace::new()),
        Arc::clone(&runner),
    ));
    let handler = TestingPhaseHandler::new(runner, Arc::clone(&fix_loop));

    let payload = json!({
        "workspace": args.workspace,
        "framework": args.framework,
        "commands": args.commands,
    });
    let ctx = JobContext::detached(Job::new(
        "testing",
        "fix",
        payload,
        &QueueOptions::default(),
        &JobOptions::new(),
    ));

    info!(workspace = %args.workspace.display(), "Running tests");
    let outcome = handler.run(&ctx).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if let Some(escalation) = fix_loop.get_escalation(&ctx.id().to_string()) {
        println!("\n=== Escalated for human review ===");
        println!("Reason:      {}", escalation.reason);
        println!("Iterations:  {}", escalation.iterations);
        println!("Cost (USD):  {:.4}", escalation.summary.total_cost_usd);
        for fp in &escalation.summary.error_fingerprints {
            println!("  [{}] x{} {}", fp.fingerprint, fp.occurrences, fp.sample);
        }
    }
    Ok(())
}

fn build_repair_agent(
    config: &ServiceConfig,
    model: Option<String>,
) -> anyhow::Result<Arc<dyn RepairAgent>> {
    let client = LiteLlmClient::from_env().map_err(|e| {
        anyhow::anyhow!(
            "Failed to initialize LLM client: {}. Please set LITELLM_API_BASE (and LITELLM_API_KEY if required).",
            e
        )
    })?;
    let llm: Arc<dyn LlmProvider> = Arc::new(client);

    let mut fix = config.fix.clone();
    if let Some(model) = model {
        fix = fix.with_model(model);
    }
    info!(model = %fix.model, "Using LiteLLM repair agent");
    Ok(Arc::new(LlmRepairAgent::new(llm, &fix)))
}

/// Stands in when no provider is configured, so test failures escalate.
struct UnavailableRepairAgent {
    reason: String,
}

#[async_trait]
impl RepairAgent for UnavailableRepairAgent {
    async fn generate(&self, _ctx: &RepairContext) -> Result<RepairResponse, FixError> {
        Err(FixError::Repair(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_args() {
        let cli = Cli::try_parse_from([
            "buildloop",
            "run",
            "--jobs",
            "jobs.json",
            "--timeout",
            "60",
            "--log-level",
            "debug",
        ])
        .expect("parse");
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.jobs, PathBuf::from("jobs.json"));
                assert_eq!(args.timeout, 60);
                assert!(args.config.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_fix_args_repeated_commands() {
        let cli = Cli::try_parse_from([
            "buildloop",
            "fix",
            "--workspace",
            "/tmp/ws",
            "--command",
            "make lint",
            "--command",
            "make test",
            "--max-iterations",
            "2",
        ])
        .expect("parse");
        match cli.command {
            Commands::Fix(args) => {
                assert_eq!(args.commands, vec!["make lint", "make test"]);
                assert_eq!(args.max_iterations, Some(2));
            }
            _ => panic!("expected fix"),
        }
    }

    #[test]
    fn test_job_spec_options() {
        let specs: Vec<JobSpec> = serde_json::from_str(
            r#"[{"queue": "build", "name": "compile", "payload": {"command": "make"},
                 "priority": 5, "delay_ms": 100, "max_attempts": 2},
                {"queue": "testing", "name": "test"}]"#,
        )
        .expect("json");

        let opts = specs[0].options();
        assert_eq!(opts.priority, 5);
        assert_eq!(opts.delay, Some(Duration::from_millis(100)));
        assert_eq!(opts.max_attempts, Some(2));
        assert_eq!(specs[1].payload, Value::Null);
        assert_eq!(specs[1].options(), JobOptions::new());
    }
}
