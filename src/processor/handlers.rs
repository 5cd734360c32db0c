//! Built-in phase handlers.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use crate::fix::{collect_sources, CodeContext, SelfFixLoop, TestFailure, TestRunner, TestSpec};
use crate::scheduler::JobContext;

use super::schema::{FieldKind, PayloadSchema};
use super::PhaseHandler;

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 900;
/// Characters of stderr kept in a failure message.
const STDERR_TAIL_CHARS: usize = 2_000;
/// Source files handed to the repair agent.
const MAX_CONTEXT_FILES: usize = 20;

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

#[derive(Debug, Deserialize)]
struct CommandPayload {
    command: String,
    #[serde(default)]
    workdir: Option<PathBuf>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// Runs `payload.command` with `sh -c`, used for the build phase.
///
/// A non-zero exit fails the job with the tail of stderr, so failure
/// classification sees the tool's own message.
#[derive(Debug, Clone, Default)]
pub struct CommandPhaseHandler;

impl CommandPhaseHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn schema() -> PayloadSchema {
        PayloadSchema::new()
            .required("command", FieldKind::String)
            .optional("workdir", FieldKind::String)
            .optional("timeout_secs", FieldKind::Integer)
    }
}

#[async_trait]
impl PhaseHandler for CommandPhaseHandler {
    async fn run(&self, ctx: &JobContext) -> anyhow::Result<Value> {
        let payload: CommandPayload =
            serde_json::from_value(ctx.payload().clone()).context("invalid command payload")?;
        let timeout = Duration::from_secs(payload.timeout_secs.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS));

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&payload.command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &payload.workdir {
            command.current_dir(dir);
        }

        info!(job_id = %ctx.id(), command = %payload.command, "Running phase command");
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| anyhow::anyhow!("command timeout after {:?}", timeout))?
            .with_context(|| format!("failed to spawn '{}'", payload.command))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            bail!(
                "command '{}' exited with {}: {}",
                payload.command,
                code,
                tail(stderr.trim(), STDERR_TAIL_CHARS)
            );
        }

        Ok(json!({
            "exit_code": output.status.code(),
            "stdout": tail(&stdout, STDERR_TAIL_CHARS),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct TestingPayload {
    workspace: PathBuf,
    #[serde(default)]
    framework: Option<String>,
    #[serde(default)]
    commands: Vec<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    language: Option<String>,
}

/// Source extensions worth showing the repair agent for a framework.
fn source_extensions(framework: Option<&str>) -> &'static [&'static str] {
    match framework.map(|f| f.to_ascii_lowercase()).as_deref() {
        Some("cargo") | Some("rust") => &["rs", "toml"],
        Some("pytest") | Some("python") => &["py"],
        Some("jest") | Some("npm") | Some("node") => &["js", "ts", "jsx", "tsx", "json"],
        Some("go") | Some("gotest") => &["go", "mod"],
        _ => &["rs", "py", "js", "ts", "go"],
    }
}

/// Runs a project's tests and, when they fail, hands the job to the
/// self-fix loop.
///
/// The fix outcome (success or escalation) is the job's result; only a test
/// run that cannot start, or a fix loop that faults, fails the job.
pub struct TestingPhaseHandler {
    runner: Arc<dyn TestRunner>,
    fix_loop: Arc<SelfFixLoop>,
}

impl TestingPhaseHandler {
    pub fn new(runner: Arc<dyn TestRunner>, fix_loop: Arc<SelfFixLoop>) -> Self {
        Self { runner, fix_loop }
    }

    pub fn schema() -> PayloadSchema {
        PayloadSchema::new()
            .required("workspace", FieldKind::String)
            .optional("framework", FieldKind::String)
            .optional("commands", FieldKind::Array)
            .optional("timeout_secs", FieldKind::Integer)
            .optional("language", FieldKind::String)
    }
}

#[async_trait]
impl PhaseHandler for TestingPhaseHandler {
    async fn run(&self, ctx: &JobContext) -> anyhow::Result<Value> {
        let payload: TestingPayload =
            serde_json::from_value(ctx.payload().clone()).context("invalid testing payload")?;

        let mut spec = TestSpec {
            framework: payload.framework.clone(),
            commands: payload.commands.clone(),
            timeout: None,
        };
        if let Some(secs) = payload.timeout_secs {
            spec = spec.with_timeout(Duration::from_secs(secs));
        }

        let result = self
            .runner
            .run(&payload.workspace, &spec)
            .await
            .context("test run could not start")?;

        if result.success {
            info!(job_id = %ctx.id(), passed = result.tests_passed, "Tests passed");
            return Ok(json!({ "tests": result }));
        }

        warn!(
            job_id = %ctx.id(),
            failed = result.tests_failed,
            "Tests failed, starting self-fix loop"
        );

        let mut code = CodeContext::new(&payload.workspace, spec);
        code.files = collect_sources(
            &payload.workspace,
            source_extensions(payload.framework.as_deref()),
            MAX_CONTEXT_FILES,
        );
        code.language = payload.language.or(payload.framework);

        let job_id = ctx.id().to_string();
        let outcome = self
            .fix_loop
            .start_fix_loop(&job_id, TestFailure::from(&result), code)
            .await
            .context("self-fix loop failed")?;

        Ok(json!({ "tests": result, "fix": outcome }))
    }
}
