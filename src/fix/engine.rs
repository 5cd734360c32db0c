//! The bounded iterate-patch-test loop.
//!
//! ```text
//! start_fix_loop(job)
//!   │
//!   ├─ iteration 1..=max
//!   │    ├─ generate patch   (RepairAgent + PatchParser)
//!   │    ├─ apply patch      (PatchApplier, per file)
//!   │    └─ run tests        (TestRunner)
//!   │         ├─ pass → Success
//!   │         └─ fail → failure feeds the next iteration
//!   │
//!   └─ exhausted → Escalation (pending_human_review)
//! ```
//!
//! At most one session per job id is active at a time. A session leaves the
//! active map for the bounded history as soon as `start_fix_loop` returns or
//! its future is dropped. A session dropped mid-iteration is escalated like
//! any other that ends without a passing attempt.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::FixError;
use crate::metrics::MetricsCollector;
use crate::utils::BoundedLog;

use super::config::{FixConfig, PartialApplyPolicy};
use super::escalation::{Escalation, EscalationStore, Resolution};
use super::parser::PatchParser;
use super::repair::{AttemptSummary, RepairAgent, RepairContext};
use super::runner::TestRunner;
use super::types::{
    Attempt, AttemptStatus, CodeContext, FileOutcome, FixOutcome, FixSession, FixStats, Patch,
    PatchResult, SessionStatus, TestFailure, TestResult,
};
use super::workspace::PatchApplier;

/// Poll interval while waiting for sessions to drain on shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct FixCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    escalated: AtomicU64,
    resolved_iterations: AtomicU64,
}

/// How an iteration that ran to completion ended.
enum IterationEnd {
    Passed(TestResult),
    StillFailing(TestResult),
}

/// Runs fix sessions for failing jobs.
pub struct SelfFixLoop {
    config: FixConfig,
    agent: Arc<dyn RepairAgent>,
    applier: Arc<dyn PatchApplier>,
    runner: Arc<dyn TestRunner>,
    parser: PatchParser,
    active: Mutex<HashMap<String, FixSession>>,
    history: Mutex<BoundedLog<FixSession>>,
    escalations: EscalationStore,
    counters: FixCounters,
    accepting: AtomicBool,
    metrics: MetricsCollector,
}

/// Moves a session from the active map to history when dropped, escalating
/// it if it was cancelled while still running.
struct ActiveSession<'a> {
    owner: &'a SelfFixLoop,
    job_id: String,
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        let removed = self
            .owner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.job_id);

        if let Some(mut session) = removed {
            if session.status == SessionStatus::Running {
                if let Some(attempt) = session
                    .attempts
                    .last_mut()
                    .filter(|a| a.finished_at.is_none())
                {
                    attempt.status = AttemptStatus::Error;
                    attempt.error = Some("interrupted".to_string());
                    attempt.finished_at = Some(Utc::now());
                }
                self.owner.escalate(&mut session, "interrupted before completion");
                self.owner.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            self.owner
                .history
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(session);
        }
    }
}

impl SelfFixLoop {
    pub fn new(
        config: FixConfig,
        agent: Arc<dyn RepairAgent>,
        applier: Arc<dyn PatchApplier>,
        runner: Arc<dyn TestRunner>,
    ) -> Self {
        let history = Mutex::new(BoundedLog::new(config.history_capacity));
        let escalations = EscalationStore::new(config.history_capacity);
        Self {
            config,
            agent,
            applier,
            runner,
            parser: PatchParser::default(),
            active: Mutex::new(HashMap::new()),
            history,
            escalations,
            counters: FixCounters::default(),
            accepting: AtomicBool::new(true),
            metrics: MetricsCollector::new(),
        }
    }

    /// Replaces the default strategy pipeline.
    pub fn with_parser(mut self, parser: PatchParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn config(&self) -> &FixConfig {
        &self.config
    }

    /// Runs a fix session for `job_id` until its tests pass or it escalates.
    ///
    /// Returns `Ok` with `success: true` on a passing iteration, or with
    /// `escalated: true` once iterations are exhausted. A fault on the final
    /// iteration is escalated and then returned as `Err`.
    pub async fn start_fix_loop(
        &self,
        job_id: &str,
        test_failure: TestFailure,
        code: CodeContext,
    ) -> Result<FixOutcome, FixError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(FixError::ShuttingDown);
        }

        let max_iterations = self.config.max_iterations.max(1);
        let mut session = FixSession::new(job_id, max_iterations, test_failure.clone());
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(job_id) {
                return Err(FixError::AlreadyRunning(job_id.to_string()));
            }
            active.insert(job_id.to_string(), session.clone());
        }
        let _guard = ActiveSession {
            owner: self,
            job_id: job_id.to_string(),
        };

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        info!(
            job_id = %job_id,
            max_iterations,
            failing_tests = test_failure.failing_tests.len(),
            "Starting fix loop"
        );

        let mut failure = test_failure;

        for iteration in 1..=max_iterations {
            if !self.accepting.load(Ordering::SeqCst) {
                let outcome = self.escalate(&mut session, "interrupted by shutdown");
                return Ok(outcome);
            }

            session.iteration = iteration;
            let mut attempt = Attempt::start(iteration);
            self.publish_attempt(&session, &attempt);

            let run = self.run_iteration(&session, &failure, &code, &mut attempt);
            let result = match self.config.iteration_timeout {
                Some(budget) => tokio::time::timeout(budget, run)
                    .await
                    .unwrap_or(Err(FixError::IterationTimeout { iteration, budget })),
                None => run.await,
            };
            attempt.finished_at = Some(Utc::now());

            match result {
                Ok(IterationEnd::Passed(test_result)) => {
                    attempt.status = AttemptStatus::Success;
                    let patch = attempt.patch.clone();
                    session.attempts.push(attempt);
                    return Ok(self.succeed(&mut session, patch, test_result));
                }
                Ok(IterationEnd::StillFailing(test_result)) => {
                    attempt.status = AttemptStatus::Failed;
                    failure = TestFailure::from(&test_result);
                    info!(
                        job_id = %job_id,
                        iteration,
                        failing_tests = test_result.failing_tests.len(),
                        "Tests still failing after patch"
                    );
                    session.attempts.push(attempt);
                }
                Err(err) => {
                    attempt.status = match &err {
                        FixError::PatchFormat(_) => AttemptStatus::Failed,
                        _ => AttemptStatus::Error,
                    };
                    attempt.error = Some(err.to_string());
                    warn!(job_id = %job_id, iteration, error = %err, "Fix iteration faulted");
                    session.attempts.push(attempt);

                    if iteration == max_iterations {
                        self.escalate(&mut session, &format!("final iteration failed: {}", err));
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }
                }
            }
            self.publish(&session);
        }

        let reason = format!(
            "tests still failing after {} iteration(s)",
            max_iterations
        );
        Ok(self.escalate(&mut session, &reason))
    }

    /// Generate, apply and test one patch, recording progress on `attempt`.
    async fn run_iteration(
        &self,
        session: &FixSession,
        failure: &TestFailure,
        code: &CodeContext,
        attempt: &mut Attempt,
    ) -> Result<IterationEnd, FixError> {
        let ctx = RepairContext {
            job_id: session.job_id.clone(),
            iteration: attempt.iteration,
            max_iterations: session.max_iterations,
            failure: failure.clone(),
            code: code.clone(),
            previous_attempts: session.attempts.iter().map(AttemptSummary::from).collect(),
        };

        let response = self.agent.generate(&ctx).await?;
        let patch = self.parser.parse(&response.text, response.provenance)?;
        attempt.patch = Some(patch.clone());

        attempt.status = AttemptStatus::Applying;
        self.publish_attempt(session, attempt);
        let patch_result = self.apply_patch(&code.workspace, &patch).await;
        attempt.patch_result = Some(patch_result.clone());

        if patch_result.is_partial() {
            warn!(
                job_id = %session.job_id,
                iteration = attempt.iteration,
                failed = patch_result.failed,
                total = patch_result.total(),
                "Patch partially applied"
            );
            if self.config.partial_apply == PartialApplyPolicy::AbortIteration {
                return Err(FixError::PatchApplication {
                    failed: patch_result.failed,
                    total: patch_result.total(),
                    details: patch_result.failure_details(),
                });
            }
        }

        attempt.status = AttemptStatus::Testing;
        self.publish_attempt(session, attempt);
        let test_result = self.runner.run(&code.workspace, &code.test_spec).await?;
        attempt.test_result = Some(test_result.clone());

        if test_result.success {
            Ok(IterationEnd::Passed(test_result))
        } else {
            Ok(IterationEnd::StillFailing(test_result))
        }
    }

    /// Applies every change in order; a failed change does not stop the rest.
    async fn apply_patch(&self, workspace: &Path, patch: &Patch) -> PatchResult {
        let mut result = PatchResult::default();
        for change in &patch.changes {
            let outcome = self.applier.apply(workspace, change).await;
            match &outcome {
                Ok(()) => result.applied += 1,
                Err(e) => {
                    warn!(file = %change.file, error = %e, "Change failed to apply");
                    result.failed += 1;
                }
            }
            result.files.push(FileOutcome {
                file: change.file.clone(),
                action: change.action,
                success: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }
        result
    }

    fn succeed(
        &self,
        session: &mut FixSession,
        patch: Option<Patch>,
        test_result: TestResult,
    ) -> FixOutcome {
        session.status = SessionStatus::Completed;
        session.finished_at = Some(Utc::now());
        self.publish(session);

        self.counters.successful.fetch_add(1, Ordering::Relaxed);
        self.counters
            .resolved_iterations
            .fetch_add(session.iteration as u64, Ordering::Relaxed);
        self.metrics.record_fix_session("success", session.iteration);

        info!(job_id = %session.job_id, iteration = session.iteration, "Fix loop succeeded");

        FixOutcome {
            success: true,
            escalated: false,
            iteration: Some(session.iteration),
            total_iterations: session.iteration,
            patch,
            test_result: Some(test_result),
        }
    }

    /// Files an escalation for the session and marks it failed.
    fn escalate(&self, session: &mut FixSession, reason: &str) -> FixOutcome {
        let iterations = session.attempts.len() as u32;
        let escalation = Escalation::build(
            &session.job_id,
            reason,
            session.test_failure.clone(),
            session.attempts.clone(),
        );

        warn!(
            job_id = %session.job_id,
            iterations,
            total_cost_usd = escalation.summary.total_cost_usd,
            reason = %reason,
            "Escalating to human review"
        );
        self.escalations.insert(escalation);

        session.status = SessionStatus::Failed;
        session.escalated = true;
        session.finished_at = Some(Utc::now());
        self.publish(session);

        self.counters.escalated.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_escalation("fix_loop");
        self.metrics.record_fix_session("escalated", iterations);

        FixOutcome {
            success: false,
            escalated: true,
            iteration: None,
            total_iterations: iterations,
            patch: None,
            test_result: None,
        }
    }

    /// Publishes `session` with the in-flight `attempt` appended, so a
    /// cancelled session still carries it.
    fn publish_attempt(&self, session: &FixSession, attempt: &Attempt) {
        let mut snapshot = session.clone();
        snapshot.attempts.push(attempt.clone());
        self.publish(&snapshot);
    }

    fn publish(&self, session: &FixSession) {
        if let Some(slot) = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&session.job_id)
        {
            *slot = session.clone();
        }
    }

    pub fn get_fix_stats(&self) -> FixStats {
        let successful = self.counters.successful.load(Ordering::Relaxed);
        let resolved_iterations = self.counters.resolved_iterations.load(Ordering::Relaxed);
        FixStats {
            active: self.active.lock().unwrap_or_else(|e| e.into_inner()).len(),
            total: self.counters.total.load(Ordering::Relaxed),
            successful,
            failed: self.counters.failed.load(Ordering::Relaxed),
            escalated: self.counters.escalated.load(Ordering::Relaxed),
            average_iterations_to_resolution: if successful == 0 {
                0.0
            } else {
                resolved_iterations as f64 / successful as f64
            },
        }
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(job_id)
    }

    /// The active session for `job_id`, else its most recent finished one.
    pub fn get_session(&self, job_id: &str) -> Option<FixSession> {
        if let Some(session) = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
        {
            return Some(session.clone());
        }
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .find_latest(|s| s.job_id == job_id)
            .cloned()
    }

    pub fn get_escalation(&self, job_id: &str) -> Option<Escalation> {
        self.escalations.get(job_id)
    }

    pub fn pending_escalations(&self) -> Vec<Escalation> {
        self.escalations.pending()
    }

    pub fn resolve_escalation(
        &self,
        job_id: &str,
        resolution: Resolution,
    ) -> Result<Escalation, FixError> {
        let escalation = self.escalations.resolve(job_id, resolution)?;
        info!(job_id = %job_id, "Escalation resolved");
        Ok(escalation)
    }

    /// Stops new sessions and iterations, then waits up to `grace` for
    /// active sessions to finish. Returns how many were still running.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.accepting.store(false, Ordering::SeqCst);
        let active = || self.active.lock().unwrap_or_else(|e| e.into_inner()).len();

        let drained = tokio::time::timeout(grace, async {
            while active() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;

        let remaining = active();
        match drained {
            Ok(()) => info!("Fix loop drained"),
            Err(_) => warn!(remaining, ?grace, "Fix loop shutdown grace expired"),
        }
        remaining
    }
}
