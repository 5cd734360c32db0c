//! Error types for buildloop operations.
//!
//! Defines error types for every subsystem of the execution core:
//! - Queue service and durable job stores
//! - Job processing (validation, failure classification)
//! - The self-fix loop and its collaborators
//! - LLM API interactions

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The named queue was never declared.
    #[error("Queue '{0}' not found")]
    QueueNotFound(String),

    #[error("Invalid options for queue '{queue}': {reason}")]
    InvalidOptions { queue: String, reason: String },

    /// A worker set is already consuming this queue.
    #[error("Queue '{0}' already has a worker set attached")]
    WorkerAlreadyAttached(String),

    /// The service no longer accepts new jobs or workers.
    #[error("Queue service is shutting down")]
    ShuttingDown,

    /// Workers did not drain within the grace window and were aborted.
    #[error("Shutdown timed out after {grace:?}; {aborted} worker(s) force-closed")]
    ShutdownTimeout { grace: Duration, aborted: usize },

    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while processing a job on behalf of a phase handler.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The payload did not satisfy the queue's schema. Never retried.
    #[error("Payload validation failed for queue '{queue}': {}", .violations.join("; "))]
    Validation {
        queue: String,
        violations: Vec<String>,
    },

    /// A failure that looks recoverable; handed back to the queue's backoff.
    #[error("Transient execution failure on attempt {attempt}: {message}")]
    TransientExecution { attempt: u32, message: String },

    /// A failure that was escalated and will not be retried.
    #[error("Permanent execution failure after {attempts} attempt(s): {message}")]
    PermanentExecution { attempts: u32, message: String },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors that can occur while applying a single file change.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApplyError {
    #[error("Path '{0}' escapes the workspace root")]
    PathOutsideWorkspace(String),

    #[error("Change for '{0}' has no content")]
    MissingContent(String),

    #[error("File '{0}' does not exist")]
    FileNotFound(String),

    #[error("Hunk {hunk} did not match the current contents of '{file}'")]
    HunkMismatch { file: String, hunk: usize },

    #[error("IO error on '{file}': {message}")]
    Io { file: String, message: String },
}

/// Errors that can occur inside the self-fix loop.
#[derive(Debug, Error)]
pub enum FixError {
    /// A session for this job is already active.
    #[error("Fix loop already running for job '{0}'")]
    AlreadyRunning(String),

    /// No parse strategy could turn the repair output into a patch.
    #[error("Repair output could not be parsed as a patch: {0}")]
    PatchFormat(String),

    #[error("Patch application failed for {failed} of {total} change(s): {details}")]
    PatchApplication {
        failed: usize,
        total: usize,
        details: String,
    },

    /// The repair-suggestion capability failed.
    #[error("Repair suggestion failed: {0}")]
    Repair(String),

    /// The test command could not be executed at all.
    #[error("Test run failed to execute: {0}")]
    TestRun(String),

    #[error("Iteration {iteration} exceeded its time budget of {budget:?}")]
    IterationTimeout { iteration: u32, budget: Duration },

    #[error("No pending escalation for job '{0}'")]
    EscalationNotFound(String),

    #[error("Self-fix loop is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LlmError> for FixError {
    fn from(err: LlmError) -> Self {
        FixError::Repair(err.to_string())
    }
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
