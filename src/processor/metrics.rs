//! Rolling per-queue processing metrics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How one processed attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Handed back to the queue for another attempt.
    Retried,
    Escalated,
    ValidationFailed,
}

/// Snapshot of a queue's processing metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessorMetrics {
    /// Attempts seen, including rejected payloads.
    pub processed: u64,
    pub succeeded: u64,
    /// Attempts that did not succeed (retried, escalated or invalid).
    pub failed: u64,
    pub retried: u64,
    pub escalated: u64,
    pub validation_failures: u64,
    /// Mean handler latency over attempts that ran the handler.
    pub average_latency_ms: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub(crate) struct RollingMetrics {
    snapshot: ProcessorMetrics,
    executed: u64,
    total_latency_ms: u128,
}

impl RollingMetrics {
    pub(crate) fn record(&mut self, outcome: Outcome, latency: Option<Duration>) {
        let m = &mut self.snapshot;
        m.processed += 1;
        match outcome {
            Outcome::Succeeded => m.succeeded += 1,
            Outcome::Retried => {
                m.failed += 1;
                m.retried += 1;
            }
            Outcome::Escalated => {
                m.failed += 1;
                m.escalated += 1;
            }
            Outcome::ValidationFailed => {
                m.failed += 1;
                m.validation_failures += 1;
            }
        }
        m.last_processed_at = Some(Utc::now());

        if let Some(latency) = latency {
            self.executed += 1;
            self.total_latency_ms += latency.as_millis();
            self.snapshot.average_latency_ms = self.total_latency_ms as f64 / self.executed as f64;
        }
    }

    pub(crate) fn snapshot(&self) -> ProcessorMetrics {
        self.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_metrics() {
        let mut rolling = RollingMetrics::default();
        rolling.record(Outcome::Succeeded, Some(Duration::from_millis(100)));
        rolling.record(Outcome::Retried, Some(Duration::from_millis(300)));
        rolling.record(Outcome::ValidationFailed, None);

        let m = rolling.snapshot();
        assert_eq!(m.processed, 3);
        assert_eq!(m.succeeded, 1);
        assert_eq!(m.failed, 2);
        assert_eq!(m.retried, 1);
        assert_eq!(m.validation_failures, 1);
        assert!((m.average_latency_ms - 200.0).abs() < f64::EPSILON);
        assert!(m.last_processed_at.is_some());
    }
}
