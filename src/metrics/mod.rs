//! Metrics module for Prometheus-based monitoring.
//!
//! Covers queue throughput and depth, worker activity, escalations, and the
//! cost of the self-fix loop.
//!
//! # Example
//!
//! ```ignore
//! use buildloop::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_escalation("processor");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, TokenUsage};
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ACTIVE_WORKERS, ESCALATIONS_TOTAL, FIX_ITERATIONS, FIX_SESSIONS_TOTAL, JOBS_TOTAL,
    JOB_DURATION, JOB_RETRIES, QUEUE_DEPTH, REGISTRY, REPAIR_COST_CENTS, REPAIR_TOKENS_TOTAL,
};
