//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by buildloop and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all buildloop metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of finished jobs, labeled by queue and status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job handler duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total retries scheduled through backoff, labeled by queue.
pub static JOB_RETRIES: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs per queue and state.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of workers currently running a handler, labeled by queue.
pub static ACTIVE_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Escalations to human review, labeled by source (processor or fix_loop).
pub static ESCALATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Finished fix sessions, labeled by outcome.
pub static FIX_SESSIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Iterations used per finished fix session.
pub static FIX_ITERATIONS: OnceLock<Histogram> = OnceLock::new();

/// Repair suggestion costs in cents, labeled by model.
pub static REPAIR_COST_CENTS: OnceLock<CounterVec> = OnceLock::new();

/// Repair suggestion tokens, labeled by model.
pub static REPAIR_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// before initialization is a silent no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Queue metrics
    let jobs_total = CounterVec::new(
        Opts::new("buildloop_jobs_total", "Total number of finished jobs"),
        &["queue", "status"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "buildloop_job_duration_seconds",
            "Job handler duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0, 1800.0]),
        &["queue"],
    )?;

    let job_retries = CounterVec::new(
        Opts::new("buildloop_job_retries_total", "Total job retries scheduled"),
        &["queue"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("buildloop_queue_depth", "Number of jobs per queue and state"),
        &["queue", "state"],
    )?;

    let active_workers = GaugeVec::new(
        Opts::new("buildloop_active_workers", "Workers currently running a job"),
        &["queue"],
    )?;

    // Escalation and fix loop metrics
    let escalations_total = CounterVec::new(
        Opts::new("buildloop_escalations_total", "Total escalations to human review"),
        &["source"],
    )?;

    let fix_sessions_total = CounterVec::new(
        Opts::new("buildloop_fix_sessions_total", "Total finished fix sessions"),
        &["outcome"],
    )?;

    let fix_iterations = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "buildloop_fix_iterations",
            "Iterations used per finished fix session",
        )
        .buckets(vec![1.0, 2.0, 3.0, 4.0, 5.0, 7.0, 10.0]),
    )?;

    let repair_cost_cents = CounterVec::new(
        Opts::new("buildloop_repair_cost_cents", "Repair suggestion costs in cents"),
        &["model"],
    )?;

    let repair_tokens_total = CounterVec::new(
        Opts::new("buildloop_repair_tokens_total", "Repair suggestion tokens used"),
        &["model"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(job_retries.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(escalations_total.clone()))?;
    registry.register(Box::new(fix_sessions_total.clone()))?;
    registry.register(Box::new(fix_iterations.clone()))?;
    registry.register(Box::new(repair_cost_cents.clone()))?;
    registry.register(Box::new(repair_tokens_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOB_RETRIES.set(job_retries);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = ESCALATIONS_TOTAL.set(escalations_total);
    let _ = FIX_SESSIONS_TOTAL.set(fix_sessions_total);
    let _ = FIX_ITERATIONS.set(fix_iterations);
    let _ = REPAIR_COST_CENTS.set(repair_cost_cents);
    let _ = REPAIR_TOKENS_TOTAL.set(repair_tokens_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem instead.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler body for a `/metrics` endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
