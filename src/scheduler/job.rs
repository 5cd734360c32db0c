//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: A unit of work owned by exactly one queue
//! - `QueueOptions` / `JobOptions`: retry policy defaults and per-job overrides
//! - `BackoffPolicy`: delay strategy between retry attempts
//! - `JobError`: failure reported by a handler, with a retry hint
//! - `QueueEvent`: state transitions published to subscribers

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base backoff delay in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 1000;

/// Default number of completed jobs retained per queue.
pub const DEFAULT_KEEP_COMPLETED: usize = 100;

/// Default number of failed jobs retained per queue.
pub const DEFAULT_KEEP_FAILED: usize = 50;

/// Upper bound on the exponential backoff shift.
const MAX_BACKOFF_SHIFT: u32 = 20;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every retry.
    Fixed,
    /// `delay * 2^(attempt - 1)`.
    Exponential,
}

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Returns the delay to wait after the given number of attempts has failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => Duration::from_millis(self.delay_ms),
            BackoffKind::Exponential => {
                let shift = attempts_made.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
                Duration::from_millis(self.delay_ms.saturating_mul(1u64 << shift))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(DEFAULT_BACKOFF_MS))
    }
}

/// Default options applied to every job added to a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Maximum number of attempts before a job is marked failed.
    pub max_attempts: u32,
    /// Delay strategy between attempts.
    pub backoff: BackoffPolicy,
    /// Number of completed jobs kept; older ones are evicted.
    pub keep_completed: usize,
    /// Number of failed jobs kept; older ones are evicted.
    pub keep_failed: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            keep_completed: DEFAULT_KEEP_COMPLETED,
            keep_failed: DEFAULT_KEEP_FAILED,
        }
    }
}

impl QueueOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retention(mut self, keep_completed: usize, keep_failed: usize) -> Self {
        self.keep_completed = keep_completed;
        self.keep_failed = keep_failed;
        self
    }
}

/// Per-job overrides of the queue defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    /// Higher values are dispatched first.
    pub priority: i32,
    /// Initial delay before the job becomes eligible for dispatch.
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Eligible for dispatch once `ready_at` has passed.
    Waiting,
    /// Claimed by a worker.
    Active,
    /// Handler returned successfully.
    Completed,
    /// Attempts exhausted or failure not retryable.
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// A job representing a unit of work owned by one queue.
///
/// Jobs are persisted by a `JobStore` and claimed by workers. The record
/// doubles as the status record handed to dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    /// Logical job name within the queue (e.g. "compile").
    pub name: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Progress percentage, 0 to 100.
    pub progress: u8,
    /// Number of attempts claimed so far, including the running one.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub priority: i32,
    /// Insertion sequence assigned by the store; FIFO tiebreak.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Error chain of the most recent failure.
    #[serde(default)]
    pub stacktrace: Vec<String>,
    /// How many times the job was re-enqueued by `retry_failed_jobs`.
    #[serde(default)]
    pub manual_retries: u32,
    pub created_at: DateTime<Utc>,
    /// The job is not dispatched before this instant.
    pub ready_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a waiting job, resolving queue defaults against per-job overrides.
    pub fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: serde_json::Value,
        defaults: &QueueOptions,
        opts: &JobOptions,
    ) -> Self {
        let now = Utc::now();
        let ready_at = match opts.delay {
            Some(delay) => instant_after(now, delay),
            None => now,
        };

        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            name: name.into(),
            payload,
            state: JobState::Waiting,
            progress: 0,
            attempts_made: 0,
            max_attempts: opts.max_attempts.unwrap_or(defaults.max_attempts),
            backoff: opts.backoff.unwrap_or(defaults.backoff),
            priority: opts.priority,
            seq: 0,
            result: None,
            failure_reason: None,
            stacktrace: Vec::new(),
            manual_retries: 0,
            created_at: now,
            ready_at,
            processed_at: None,
            finished_at: None,
        }
    }

    /// Returns whether another attempt is allowed after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_made)
    }

    /// Returns whether the job may be dispatched at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.ready_at <= now
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Returns `from + delay`, saturating at the latest representable instant.
pub(crate) fn instant_after(from: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Failure reported by a job handler.
///
/// `retryable` is a hint: the queue still refuses to retry once the job's
/// attempts are exhausted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
    pub stack: Vec<String>,
    pub retryable: bool,
}

impl JobError {
    /// A failure the queue may retry with backoff.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Vec::new(),
            retryable: true,
        }
    }

    /// A failure that must not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Vec::new(),
            retryable: false,
        }
    }

    pub fn with_stack(mut self, stack: Vec<String>) -> Self {
        self.stack = stack;
        self
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: format!("{:#}", err),
            stack: err.chain().map(|cause| cause.to_string()).collect(),
            retryable: true,
        }
    }
}

/// Job state transitions, published in the order they happen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Added {
        queue: String,
        job_id: Uuid,
    },
    Active {
        queue: String,
        job_id: Uuid,
        attempt: u32,
    },
    Progress {
        queue: String,
        job_id: Uuid,
        progress: u8,
    },
    Completed {
        queue: String,
        job_id: Uuid,
        result: serde_json::Value,
    },
    Retrying {
        queue: String,
        job_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    Failed {
        queue: String,
        job_id: Uuid,
        attempts_made: u32,
        reason: String,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            QueueEvent::Added { job_id, .. }
            | QueueEvent::Active { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Retrying { job_id, .. }
            | QueueEvent::Failed { job_id, .. } => *job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_new_uses_queue_defaults() {
        let defaults = QueueOptions::default()
            .with_max_attempts(5)
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(250)));
        let job = Job::new(
            "build",
            "compile",
            serde_json::json!({"project_id": "p-1"}),
            &defaults,
            &JobOptions::default(),
        );

        assert!(!job.id.is_nil());
        assert_eq!(job.queue, "build");
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.backoff.kind, BackoffKind::Fixed);
        assert!(job.should_retry());
        assert!(job.is_ready(Utc::now()));
    }

    #[test]
    fn test_job_options_override_defaults() {
        let opts = JobOptions::new()
            .with_priority(10)
            .with_max_attempts(1)
            .with_delay(Duration::from_secs(60));
        let job = Job::new(
            "build",
            "compile",
            serde_json::Value::Null,
            &QueueOptions::default(),
            &opts,
        );

        assert_eq!(job.priority, 10);
        assert_eq!(job.max_attempts, 1);
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn test_remaining_attempts() {
        let mut job = Job::new(
            "q",
            "n",
            serde_json::Value::Null,
            &QueueOptions::default().with_max_attempts(2),
            &JobOptions::default(),
        );

        assert_eq!(job.remaining_attempts(), 2);
        job.attempts_made = 1;
        assert!(job.should_retry());
        job.attempts_made = 2;
        assert!(!job.should_retry());
        assert_eq!(job.remaining_attempts(), 0);
    }

    #[test]
    fn test_backoff_delays() {
        let fixed = BackoffPolicy::fixed(Duration::from_millis(500));
        assert_eq!(fixed.delay_for(1), Duration::from_millis(500));
        assert_eq!(fixed.delay_for(4), Duration::from_millis(500));

        let exp = BackoffPolicy::exponential(Duration::from_millis(100));
        assert_eq!(exp.delay_for(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for(2), Duration::from_millis(200));
        assert_eq!(exp.delay_for(3), Duration::from_millis(400));
        // Large attempt counts saturate instead of overflowing.
        assert!(exp.delay_for(u32::MAX) >= Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_serializes_with_type_key() {
        let json = serde_json::to_value(BackoffPolicy::exponential(Duration::from_secs(2)))
            .expect("serialization should work");
        assert_eq!(json["type"], "exponential");
        assert_eq!(json["delay_ms"], 2000);
    }

    #[test]
    fn test_job_state_display() {
        assert_eq!(JobState::Waiting.to_string(), "waiting");
        assert_eq!(JobState::Active.to_string(), "active");
        assert_eq!(JobState::Completed.to_string(), "completed");
        assert_eq!(JobState::Failed.to_string(), "failed");
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }

    #[test]
    fn test_job_error_from_anyhow_keeps_chain() {
        let err = anyhow::anyhow!("connection reset").context("fetching dependencies");
        let job_err = JobError::from(err);

        assert!(job_err.retryable);
        assert!(job_err.message.contains("fetching dependencies"));
        assert!(job_err.message.contains("connection reset"));
        assert_eq!(job_err.stack.len(), 2);
    }

    #[test]
    fn test_queue_event_serialization() {
        let job_id = Uuid::new_v4();
        let event = QueueEvent::Progress {
            queue: "build".to_string(),
            job_id,
            progress: 10,
        };
        let json = serde_json::to_value(&event).expect("serialization should work");
        assert_eq!(json["event"], "progress");
        assert_eq!(event.job_id(), job_id);
    }
}
