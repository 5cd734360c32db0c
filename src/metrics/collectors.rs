//! Metric collectors for buildloop operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with consistent
//! labeling. Every method is a no-op until `init_metrics()` has run, so
//! library code can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, ESCALATIONS_TOTAL, FIX_ITERATIONS, FIX_SESSIONS_TOTAL, JOBS_TOTAL,
    JOB_DURATION, JOB_RETRIES, QUEUE_DEPTH, REPAIR_COST_CENTS, REPAIR_TOKENS_TOTAL,
};
use crate::scheduler::StateCounts;

/// Token usage information for repair requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    /// Number of input/prompt tokens.
    pub input_tokens: u64,
    /// Number of output/completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Get the total number of tokens (input + output).
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Metrics collector for recording buildloop operational metrics.
///
/// # Example
///
/// ```ignore
/// use buildloop::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_job("build", "completed", 1.5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished job attempt.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue the job belongs to
    /// * `status` - Outcome of the attempt ("completed", "retrying", "failed")
    /// * `duration_secs` - Handler duration in seconds
    pub fn record_job(&self, queue: &str, status: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[queue, status]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[queue])
                .observe(duration_secs);
        }

        tracing::trace!(
            queue = queue,
            status = status,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    pub fn record_retry(&self, queue: &str) {
        if let Some(retries) = JOB_RETRIES.get() {
            retries.with_label_values(&[queue]).inc();
        }
    }

    /// Update the per-state depth gauges of a queue.
    pub fn update_queue_depth(&self, queue: &str, counts: &StateCounts) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            for (state, count) in [
                ("waiting", counts.waiting),
                ("delayed", counts.delayed),
                ("active", counts.active),
                ("completed", counts.completed),
                ("failed", counts.failed),
            ] {
                queue_depth
                    .with_label_values(&[queue, state])
                    .set(count as f64);
            }
        }

        tracing::trace!(queue = queue, total = counts.total(), "Updated queue depth metric");
    }

    pub fn inc_active_workers(&self, queue: &str) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.with_label_values(&[queue]).inc();
        }
    }

    pub fn dec_active_workers(&self, queue: &str) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.with_label_values(&[queue]).dec();
        }
    }

    /// Record an escalation to human review.
    ///
    /// `source` is `"processor"` or `"fix_loop"`.
    pub fn record_escalation(&self, source: &str) {
        if let Some(escalations) = ESCALATIONS_TOTAL.get() {
            escalations.with_label_values(&[source]).inc();
        }

        tracing::trace!(source = source, "Recorded escalation metric");
    }

    /// Record a finished fix session.
    pub fn record_fix_session(&self, outcome: &str, iterations: u32) {
        if let Some(sessions) = FIX_SESSIONS_TOTAL.get() {
            sessions.with_label_values(&[outcome]).inc();
        }

        if let Some(histogram) = FIX_ITERATIONS.get() {
            histogram.observe(iterations as f64);
        }

        tracing::trace!(
            outcome = outcome,
            iterations = iterations,
            "Recorded fix session metric"
        );
    }

    /// Record the cost of one repair suggestion.
    pub fn record_repair(&self, model: &str, tokens: TokenUsage, cost_usd: f64) {
        if let Some(tokens_total) = REPAIR_TOKENS_TOTAL.get() {
            tokens_total
                .with_label_values(&[model])
                .inc_by(tokens.total() as f64);
        }

        if let Some(cost) = REPAIR_COST_CENTS.get() {
            cost.with_label_values(&[model])
                .inc_by((cost_usd * 100.0).max(0.0));
        }

        tracing::trace!(
            model = model,
            input_tokens = tokens.input_tokens,
            output_tokens = tokens.output_tokens,
            cost_usd = cost_usd,
            "Recorded repair metric"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_token_usage() {
        let usage = TokenUsage::new(1000, 500);
        assert_eq!(usage.total(), 1500);
        assert_eq!(TokenUsage::default().total(), 0);
    }

    #[test]
    fn test_record_job_and_retry() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_job("build", "completed", 1.2);
        collector.record_job("build", "failed", 0.4);
        collector.record_retry("build");

        let text = export_metrics();
        assert!(text.contains("buildloop_job_retries_total"));
    }

    #[test]
    fn test_update_queue_depth() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        let counts = StateCounts {
            waiting: 4,
            delayed: 1,
            active: 2,
            completed: 10,
            failed: 1,
        };
        collector.update_queue_depth("testing", &counts);

        let text = export_metrics();
        assert!(text.contains("buildloop_queue_depth"));
    }

    #[test]
    fn test_fix_loop_metrics_do_not_panic() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.inc_active_workers("generation");
        collector.dec_active_workers("generation");
        collector.record_escalation("fix_loop");
        collector.record_fix_session("escalated", 5);
        collector.record_repair("gpt-4o", TokenUsage::new(1200, 300), 0.0123);
    }
}
