//! Job processing on top of the queue service.
//!
//! `JobProcessor` wraps a queue's business handler ([`PhaseHandler`]) with:
//!
//! 1. Payload validation against a per-queue [`PayloadSchema`]; invalid jobs
//!    fail immediately and the handler never runs
//! 2. Progress reporting (10% on start, 100% on success)
//! 3. Failure classification ([`FailureClassifier`])
//! 4. The retry-or-escalate decision: transient failures below the retry
//!    limit go back to the queue's backoff; everything else is escalated and
//!    failed for good
//! 5. Rolling per-queue metrics
//!
//! ```text
//! Received → Validating ─┬─► ValidationFailed
//!                        └─► Executing ─┬─► Succeeded
//!                                       └─► Failed ─┬─► Retryable (requeued)
//!                                                   └─► Escalated
//! ```

pub mod classifier;
pub mod handlers;
pub mod metrics;
pub mod schema;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ProcessorError;
use crate::metrics::MetricsCollector;
use crate::scheduler::{JobContext, JobError, JobHandler, QueueService};
use crate::utils::BoundedLog;

pub use classifier::{FailureClass, FailureClassifier, DEFAULT_TRANSIENT_PATTERNS};
pub use handlers::{CommandPhaseHandler, TestingPhaseHandler};
pub use metrics::ProcessorMetrics;
pub use schema::{FieldKind, FieldSpec, PayloadSchema};

use metrics::{Outcome, RollingMetrics};

/// Default number of attempts below which transient failures are retried.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default number of escalation records kept in memory.
pub const DEFAULT_ESCALATION_CAPACITY: usize = 200;

/// Progress reported when a handler starts.
const PROGRESS_STARTED: u8 = 10;

/// Configuration for the job processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Case-insensitive substrings that mark a failure as transient.
    pub transient_patterns: Vec<String>,
    /// Transient failures are retried while `attempts_made` is below this
    /// (and below the job's own `max_attempts`).
    pub retry_limit: u32,
    /// Number of escalation records kept; oldest evicted first.
    pub escalation_capacity: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            transient_patterns: DEFAULT_TRANSIENT_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            escalation_capacity: DEFAULT_ESCALATION_CAPACITY,
        }
    }
}

/// Business logic of one pipeline phase.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> anyhow::Result<Value>;
}

/// Options for [`JobProcessor::register_processor`].
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub schema: Option<PayloadSchema>,
    /// Number of parallel workers for the queue.
    pub concurrency: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            schema: None,
            concurrency: 1,
        }
    }
}

impl ProcessorOptions {
    pub fn new(concurrency: usize) -> Self {
        Self {
            schema: None,
            concurrency,
        }
    }

    pub fn with_schema(mut self, schema: PayloadSchema) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// A job failure handed to human review.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationRecord {
    pub job_id: Uuid,
    pub queue: String,
    pub job_name: String,
    pub payload: Value,
    pub error: String,
    pub stack: Vec<String>,
    pub attempts_made: u32,
    pub classification: FailureClass,
    pub created_at: DateTime<Utc>,
}

struct ProcessorState {
    config: ProcessorConfig,
    classifier: FailureClassifier,
    escalations: Mutex<BoundedLog<EscalationRecord>>,
    metrics: Mutex<HashMap<String, RollingMetrics>>,
    collector: MetricsCollector,
}

impl ProcessorState {
    fn record(&self, queue: &str, outcome: Outcome, latency: Option<std::time::Duration>) {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(queue.to_string())
            .or_default()
            .record(outcome, latency);
    }
}

/// Registers phase handlers on queues and applies the processing policy.
pub struct JobProcessor {
    queues: Arc<QueueService>,
    state: Arc<ProcessorState>,
    registered: Mutex<HashSet<String>>,
}

impl JobProcessor {
    pub fn new(queues: Arc<QueueService>, config: ProcessorConfig) -> Self {
        let classifier = FailureClassifier::new(&config.transient_patterns);
        let escalations = Mutex::new(BoundedLog::new(config.escalation_capacity));
        Self {
            queues,
            state: Arc::new(ProcessorState {
                config,
                classifier,
                escalations,
                metrics: Mutex::new(HashMap::new()),
                collector: MetricsCollector::new(),
            }),
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Attaches `handler` to `queue` behind the processing policy.
    ///
    /// Returns `Ok(false)` without doing anything if the queue already has a
    /// registered processor.
    pub async fn register_processor(
        &self,
        queue: &str,
        handler: Arc<dyn PhaseHandler>,
        opts: ProcessorOptions,
    ) -> Result<bool, ProcessorError> {
        if !self
            .registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(queue.to_string())
        {
            return Ok(false);
        }

        let wrapped = Arc::new(ProcessingHandler {
            queue: queue.to_string(),
            schema: opts.schema,
            handler,
            state: Arc::clone(&self.state),
        });

        if let Err(e) = self
            .queues
            .create_worker(queue, wrapped, opts.concurrency)
            .await
        {
            self.registered
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(queue);
            return Err(e.into());
        }

        info!(queue = %queue, concurrency = opts.concurrency, "Processor registered");
        Ok(true)
    }

    pub fn is_registered(&self, queue: &str) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(queue)
    }

    /// Up to `n` most recent escalations, newest first.
    pub fn recent_escalations(&self, n: usize) -> Vec<EscalationRecord> {
        self.state
            .escalations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latest(n)
    }

    pub fn metrics(&self, queue: &str) -> Option<ProcessorMetrics> {
        self.state
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .map(RollingMetrics::snapshot)
    }

    pub fn all_metrics(&self) -> HashMap<String, ProcessorMetrics> {
        self.state
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(queue, m)| (queue.clone(), m.snapshot()))
            .collect()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.state.config
    }
}

/// The queue-facing wrapper around a [`PhaseHandler`].
struct ProcessingHandler {
    queue: String,
    schema: Option<PayloadSchema>,
    handler: Arc<dyn PhaseHandler>,
    state: Arc<ProcessorState>,
}

impl ProcessingHandler {
    fn escalate(&self, ctx: &JobContext, error: &str, stack: &[String], class: FailureClass) {
        let record = EscalationRecord {
            job_id: ctx.id(),
            queue: self.queue.clone(),
            job_name: ctx.job().name.clone(),
            payload: ctx.payload().clone(),
            error: error.to_string(),
            stack: stack.to_vec(),
            attempts_made: ctx.attempts_made(),
            classification: class,
            created_at: Utc::now(),
        };

        error!(
            queue = %self.queue,
            job_id = %ctx.id(),
            attempts_made = ctx.attempts_made(),
            classification = ?class,
            error = %error,
            "Job escalated for human review"
        );

        self.state
            .escalations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        self.state.collector.record_escalation("processor");
    }
}

#[async_trait]
impl JobHandler for ProcessingHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Value, JobError> {
        if let Some(schema) = &self.schema {
            if let Err(violations) = schema.validate(ctx.payload()) {
                let err = ProcessorError::Validation {
                    queue: self.queue.clone(),
                    violations,
                };
                warn!(queue = %self.queue, job_id = %ctx.id(), error = %err, "Payload rejected");
                self.state.record(&self.queue, Outcome::ValidationFailed, None);
                return Err(JobError::fatal(err.to_string()));
            }
        }

        if let Err(e) = ctx.report_progress(PROGRESS_STARTED).await {
            warn!(job_id = %ctx.id(), error = %e, "Failed to report progress");
        }

        let started = Instant::now();
        let result = self.handler.run(&ctx).await;
        let latency = started.elapsed();

        match result {
            Ok(value) => {
                if let Err(e) = ctx.report_progress(100).await {
                    warn!(job_id = %ctx.id(), error = %e, "Failed to report progress");
                }
                self.state
                    .record(&self.queue, Outcome::Succeeded, Some(latency));
                Ok(value)
            }
            Err(err) => {
                let message = format!("{:#}", err);
                let stack: Vec<String> = err.chain().map(|cause| cause.to_string()).collect();
                let class = self.state.classifier.classify(&message);
                let attempt = ctx.attempts_made();
                let limit = self.state.config.retry_limit.min(ctx.job().max_attempts);

                if class == FailureClass::Transient && attempt < limit {
                    let err = ProcessorError::TransientExecution { attempt, message };
                    warn!(queue = %self.queue, job_id = %ctx.id(), error = %err, "Transient failure");
                    self.state.record(&self.queue, Outcome::Retried, Some(latency));
                    return Err(JobError::retryable(err.to_string()).with_stack(stack));
                }

                self.escalate(&ctx, &message, &stack, class);
                self.state
                    .record(&self.queue, Outcome::Escalated, Some(latency));
                let err = ProcessorError::PermanentExecution {
                    attempts: attempt,
                    message,
                };
                Err(JobError::fatal(err.to_string()).with_stack(stack))
            }
        }
    }
}
