//! Test execution capability.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::FixError;

use super::types::{TestResult, TestSpec};

/// Default timeout for one test command.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Output kept per run, from the end.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Runs a workspace's tests.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// A failing suite is `Ok` with `success == false`; `Err` means the
    /// tests could not be run at all.
    async fn run(&self, workspace: &Path, spec: &TestSpec) -> Result<TestResult, FixError>;
}

/// Default command for a framework identifier.
pub fn default_command(framework: &str) -> Option<&'static str> {
    match framework.to_ascii_lowercase().as_str() {
        "cargo" | "rust" => Some("cargo test"),
        "pytest" | "python" => Some("pytest -q"),
        "jest" => Some("npx jest --ci"),
        "npm" | "node" => Some("npm test"),
        "go" | "gotest" => Some("go test ./..."),
        _ => None,
    }
}

/// [`TestRunner`] that shells out with `sh -c`.
///
/// Explicit commands run in order and stop at the first failure; otherwise
/// the framework's default command is used.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    default_timeout: Duration,
}

impl Default for CommandTestRunner {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TEST_TIMEOUT,
        }
    }
}

impl CommandTestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn commands(spec: &TestSpec) -> Result<Vec<String>, FixError> {
        if !spec.commands.is_empty() {
            return Ok(spec.commands.clone());
        }
        match spec.framework.as_deref() {
            Some(framework) => default_command(framework)
                .map(|c| vec![c.to_string()])
                .ok_or_else(|| FixError::TestRun(format!("unknown test framework '{}'", framework))),
            None => Err(FixError::TestRun(
                "no test framework or command given".to_string(),
            )),
        }
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, workspace: &Path, spec: &TestSpec) -> Result<TestResult, FixError> {
        let commands = Self::commands(spec)?;
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();

        let mut output = String::new();
        let mut exit_code = Some(0);
        let mut error = None;

        for command in &commands {
            debug!(command = %command, workspace = %workspace.display(), "Running tests");

            let child = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(workspace)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output();

            match tokio::time::timeout(timeout, child).await {
                Ok(Ok(out)) => {
                    output.push_str(&String::from_utf8_lossy(&out.stdout));
                    output.push_str(&String::from_utf8_lossy(&out.stderr));
                    exit_code = out.status.code();
                    if !out.status.success() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    return Err(FixError::TestRun(format!("failed to spawn '{}': {}", command, e)));
                }
                Err(_) => {
                    warn!(command = %command, ?timeout, "Test command timed out");
                    exit_code = None;
                    error = Some(format!("test command '{}' timed out after {:?}", command, timeout));
                    break;
                }
            }
        }

        let counts = parse_counts(&output);
        let failing_tests = parse_failing_tests(&output);
        let success = exit_code == Some(0) && error.is_none();
        let tests_failed = counts
            .failed
            .unwrap_or(failing_tests.len() as u32)
            .max(failing_tests.len() as u32);
        let tests_passed = counts.passed.unwrap_or(0);

        Ok(TestResult {
            success,
            exit_code,
            output: truncate_tail(output, MAX_OUTPUT_BYTES),
            tests_run: tests_passed + tests_failed,
            tests_passed,
            tests_failed,
            failing_tests,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn truncate_tail(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = text.len() - max_bytes;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
    text
}

#[derive(Debug, Default, PartialEq)]
struct Counts {
    passed: Option<u32>,
    failed: Option<u32>,
}

fn passed_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) (?:passed|passing)").ok())
        .as_ref()
}

fn failed_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) (?:failed|failing)").ok())
        .as_ref()
}

fn failing_test_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(?:test (\S+) \.\.\. FAILED|FAILED (\S+)|--- FAIL: (\S+)|\s*✕ (.+?)(?: \(\d+ ?m?s\))?$)")
            .ok()
    })
    .as_ref()
}

/// Sums every "N passed" / "N failed" occurrence (cargo prints one summary
/// per test binary).
fn parse_counts(output: &str) -> Counts {
    let sum = |re: Option<&Regex>| -> Option<u32> {
        let re = re?;
        let mut found = false;
        let total: u32 = re
            .captures_iter(output)
            .filter_map(|c| c.get(1)?.as_str().parse::<u32>().ok())
            .inspect(|_| found = true)
            .sum();
        found.then_some(total)
    };
    Counts {
        passed: sum(passed_regex()),
        failed: sum(failed_regex()),
    }
}

/// Failing test ids from cargo, pytest, go and jest output, deduplicated in
/// order of appearance.
fn parse_failing_tests(output: &str) -> Vec<String> {
    let Some(re) = failing_test_regex() else {
        return Vec::new();
    };
    let mut tests: Vec<String> = Vec::new();
    for caps in re.captures_iter(output) {
        if let Some(name) = (1..=4).find_map(|i| caps.get(i)) {
            let name = name.as_str().trim().to_string();
            if !tests.contains(&name) {
                tests.push(name);
            }
        }
    }
    tests
}
