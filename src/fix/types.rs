//! Data model of the self-fix loop: patches, test results, sessions and
//! attempts.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a change does to its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Modify,
    Delete,
}

/// How a change carries its new contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeFormat {
    /// `content` is the complete new file.
    #[default]
    Full,
    /// `hunks` are applied against the existing file.
    Hunks,
}

/// One region replacement extracted from a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    /// Context and removed lines, as they appear in the file today.
    pub before: String,
    /// Context and added lines.
    pub after: String,
}

/// A single file operation proposed by a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Path relative to the workspace root.
    #[serde(alias = "path")]
    pub file: String,
    pub action: ChangeAction,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub format: ChangeFormat,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hunks: Vec<Hunk>,
}

impl Change {
    pub fn create(file: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            action: ChangeAction::Create,
            content: Some(content.into()),
            explanation: String::new(),
            format: ChangeFormat::Full,
            hunks: Vec::new(),
        }
    }

    pub fn modify(file: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            action: ChangeAction::Modify,
            ..Self::create(file, content)
        }
    }

    pub fn delete(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            action: ChangeAction::Delete,
            content: None,
            explanation: String::new(),
            format: ChangeFormat::Full,
            hunks: Vec::new(),
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }
}

/// Where a patch came from and what it cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub provider: String,
    pub model: String,
    pub cost_usd: f64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
}

impl Provenance {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens as u64 + self.completion_tokens as u64
    }
}

/// A parsed repair suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub analysis: String,
    /// Never empty.
    pub changes: Vec<Change>,
    pub description: String,
    /// Clamped to `[0, 1]`.
    pub confidence: f64,
    pub provenance: Provenance,
}

/// Per-file outcome of applying a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub file: String,
    pub action: ChangeAction,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchResult {
    pub applied: usize,
    pub failed: usize,
    pub files: Vec<FileOutcome>,
}

impl PatchResult {
    pub fn is_partial(&self) -> bool {
        self.failed > 0
    }

    pub fn total(&self) -> usize {
        self.applied + self.failed
    }

    /// `"file: error"` for each failed change, joined with `"; "`.
    pub fn failure_details(&self) -> String {
        self.files
            .iter()
            .filter(|f| !f.success)
            .map(|f| format!("{}: {}", f.file, f.error.as_deref().unwrap_or("unknown error")))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// What to run to test a workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Framework identifier (`cargo`, `pytest`, `jest`, `npm`, `go`).
    #[serde(default)]
    pub framework: Option<String>,
    /// Explicit shell commands; take precedence over `framework`.
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, with = "opt_duration_secs")]
    pub timeout: Option<Duration>,
}

impl TestSpec {
    pub fn framework(framework: impl Into<String>) -> Self {
        Self {
            framework: Some(framework.into()),
            ..Self::default()
        }
    }

    pub fn commands<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Outcome of one test run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr, possibly truncated to its tail.
    pub output: String,
    pub tests_run: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub failing_tests: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TestResult {
    pub fn passed() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn failed(output: impl Into<String>, failing_tests: Vec<String>) -> Self {
        let failed = failing_tests.len() as u32;
        Self {
            success: false,
            exit_code: Some(1),
            output: output.into(),
            tests_run: failed,
            tests_failed: failed,
            failing_tests,
            ..Self::default()
        }
    }
}

/// The failure a fix iteration tries to repair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub message: String,
    pub failing_tests: Vec<String>,
    pub logs: String,
}

impl TestFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_failing_tests(mut self, tests: Vec<String>) -> Self {
        self.failing_tests = tests;
        self
    }

    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }
}

impl From<&TestResult> for TestFailure {
    fn from(result: &TestResult) -> Self {
        let message = match (&result.error, result.tests_failed) {
            (Some(error), _) => error.clone(),
            (None, 0) => format!(
                "test command exited with code {}",
                result
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
            (None, n) => format!("{} test(s) failed", n),
        };
        Self {
            message,
            failing_tests: result.failing_tests.clone(),
            logs: result.output.clone(),
        }
    }
}

/// A source file shown to the repair agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// Everything the loop needs to know about the code being repaired.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeContext {
    pub workspace: PathBuf,
    #[serde(default)]
    pub files: Vec<SourceFile>,
    #[serde(default)]
    pub test_spec: TestSpec,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CodeContext {
    pub fn new(workspace: impl Into<PathBuf>, test_spec: TestSpec) -> Self {
        Self {
            workspace: workspace.into(),
            test_spec,
            ..Self::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push(SourceFile {
            path: path.into(),
            content: content.into(),
        });
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Applying,
    Testing,
    Success,
    /// The patch was applied and tested but tests still fail, or the patch
    /// could not be parsed.
    Failed,
    /// A step faulted.
    Error,
}

/// One iteration of a fix session. Frozen once the iteration ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub iteration: u32,
    pub patch: Option<Patch>,
    pub patch_result: Option<PatchResult>,
    pub test_result: Option<TestResult>,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub(crate) fn start(iteration: u32) -> Self {
        Self {
            iteration,
            patch: None,
            patch_result: None,
            test_result: None,
            status: AttemptStatus::Applying,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// One-line outcome used in prompts and summaries.
    pub fn outcome(&self) -> String {
        match self.status {
            AttemptStatus::Success => "tests passed".to_string(),
            AttemptStatus::Error | AttemptStatus::Failed if self.error.is_some() => {
                format!("error: {}", self.error.as_deref().unwrap_or_default())
            }
            _ => match &self.test_result {
                Some(result) if !result.failing_tests.is_empty() => {
                    format!("tests still failing: {}", result.failing_tests.join(", "))
                }
                Some(_) => "tests still failing".to_string(),
                None => format!("{:?}", self.status).to_lowercase(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

/// The state of one job's repair effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSession {
    pub job_id: String,
    /// Current (or last) iteration, 0 before the first starts.
    pub iteration: u32,
    pub max_iterations: u32,
    pub status: SessionStatus,
    /// Failure that started the session.
    pub test_failure: TestFailure,
    pub attempts: Vec<Attempt>,
    pub escalated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FixSession {
    pub(crate) fn new(job_id: &str, max_iterations: u32, test_failure: TestFailure) -> Self {
        Self {
            job_id: job_id.to_string(),
            iteration: 0,
            max_iterations,
            status: SessionStatus::Running,
            test_failure,
            attempts: Vec::new(),
            escalated: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Result of [`SelfFixLoop::start_fix_loop`](super::SelfFixLoop::start_fix_loop).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixOutcome {
    pub success: bool,
    pub escalated: bool,
    /// Iteration that succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub total_iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_result: Option<TestResult>,
}

/// Aggregate counters across all sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FixStats {
    pub active: usize,
    pub total: u64,
    pub successful: u64,
    /// Sessions that ended on a fault: an error on the final iteration or
    /// cancellation mid-iteration. Each is also counted in `escalated`.
    pub failed: u64,
    /// Sessions handed to human review for any reason.
    pub escalated: u64,
    /// Mean iteration count of successful sessions.
    pub average_iterations_to_resolution: f64,
}
