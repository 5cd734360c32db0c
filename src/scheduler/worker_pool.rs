//! Worker pool for processing jobs of one queue.
//!
//! Each worker runs as an independent async task that claims jobs from the
//! queue's store and hands them to the queue's handler.
//!
//! # Features
//!
//! - Fixed number of workers (the queue's concurrency)
//! - Graceful shutdown with broadcast channel
//! - Wakeup on new jobs, with a poll interval for delayed ones
//! - Pool statistics tracking

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobError};
use super::queue::{JobContext, JobHandler, QueueCore, QueueEntry, DEFAULT_POLL_INTERVAL};
use crate::metrics::MetricsCollector;

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How often an idle worker re-checks the queue.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Statistics about a worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Attempts that ended in completion.
    pub jobs_completed: u64,
    /// Attempts that ended in an error (retried or not).
    pub jobs_failed: u64,
    /// Average attempt duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of attempts processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// The set of workers attached to one queue.
pub struct WorkerPool {
    queue: String,
    config: WorkerPoolConfig,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Spawns `config.num_workers` workers for `entry`.
    pub(crate) fn spawn(
        config: WorkerPoolConfig,
        core: Arc<QueueCore>,
        entry: Arc<QueueEntry>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        let stats = Arc::new(SharedPoolStats::new());

        let worker_handles = (0..config.num_workers)
            .map(|i| {
                let worker = Worker {
                    id: format!("{}-worker-{}", entry.name, i),
                    core: Arc::clone(&core),
                    entry: Arc::clone(&entry),
                    handler: Arc::clone(&handler),
                    shutdown_rx: shutdown_tx.subscribe(),
                    poll_interval: config.poll_interval,
                    stats: Arc::clone(&stats),
                    metrics: MetricsCollector::new(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            queue = %entry.name,
            num_workers = config.num_workers,
            "Worker pool started"
        );

        Self {
            queue: entry.name.clone(),
            config,
            shutdown_tx,
            worker_handles,
            stats,
        }
    }

    /// Tells every worker to stop after its current job.
    pub fn signal_shutdown(&self) {
        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for all workers to exit.
    pub async fn join(&mut self) {
        for handle in self.worker_handles.iter_mut() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(queue = %self.queue, error = %e, "Worker task panicked during shutdown");
                }
            }
        }
        self.worker_handles.clear();
        info!(queue = %self.queue, "Worker pool shutdown complete");
    }

    /// Aborts workers that are still running. Returns how many were aborted.
    pub fn abort(&mut self) -> usize {
        let mut aborted = 0;
        for handle in self.worker_handles.drain(..) {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker that processes jobs from its queue.
struct Worker {
    id: String,
    core: Arc<QueueCore>,
    entry: Arc<QueueEntry>,
    handler: Arc<dyn JobHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Claims and processes jobs until a shutdown signal is received. While
    /// the queue is paused or empty, the worker sleeps until woken by a new
    /// job, a resume, the poll interval, or shutdown.
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Worker started");

        loop {
            // Check for shutdown signal (non-blocking)
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => break,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if self.entry.is_paused() {
                if self.idle().await {
                    break;
                }
                continue;
            }

            match self.core.claim(&self.entry).await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => {
                    if self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to claim job");
                    if self.idle().await {
                        break;
                    }
                }
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    /// Sleeps until there may be work. Returns `true` on shutdown.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            _ = self.entry.notify.notified() => false,
            _ = tokio::time::sleep(self.poll_interval) => false,
        }
    }

    /// Processes a single job.
    async fn process_job(&self, job: Job) {
        let job_id = job.id;
        let queue = self.entry.name.as_str();
        let start_time = Instant::now();

        debug!(
            worker_id = %self.id,
            queue = %queue,
            job_id = %job_id,
            attempt = job.attempts_made,
            "Processing job"
        );

        self.stats.increment_active();
        self.metrics.inc_active_workers(queue);

        let ctx = JobContext::attached(job.clone(), Arc::clone(&self.core));
        let outcome = AssertUnwindSafe(self.handler.handle(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(JobError::fatal("job handler panicked")));
        let duration = start_time.elapsed();

        self.stats.decrement_active();
        self.metrics.dec_active_workers(queue);

        match outcome {
            Ok(result) => {
                self.stats.record_completion(duration);
                match self.core.complete(&self.entry, job, result, duration).await {
                    Ok(()) => info!(
                        worker_id = %self.id,
                        queue = %queue,
                        job_id = %job_id,
                        duration_ms = duration.as_millis() as u64,
                        "Job completed"
                    ),
                    Err(e) => error!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Failed to mark job complete"
                    ),
                }
            }
            Err(err) => {
                self.stats.record_failure(duration);
                let attempt = job.attempts_made;
                let remaining = job.remaining_attempts();
                let message = err.message.clone();
                match self.core.fail(&self.entry, job, err, duration).await {
                    Ok(true) => warn!(
                        worker_id = %self.id,
                        queue = %queue,
                        job_id = %job_id,
                        attempt = attempt,
                        remaining_attempts = remaining,
                        error = %message,
                        "Job failed, scheduled for retry"
                    ),
                    Ok(false) => error!(
                        worker_id = %self.id,
                        queue = %queue,
                        job_id = %job_id,
                        attempts_made = attempt,
                        error = %message,
                        "Job failed permanently"
                    ),
                    Err(e) => error!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Failed to record job failure"
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8).with_poll_interval(Duration::from_millis(20));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(WorkerPoolConfig::default().num_workers, 1);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(5));

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[test]
    fn test_shared_pool_stats_active_workers() {
        let stats = SharedPoolStats::new();

        stats.increment_active();
        stats.increment_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 2);

        stats.decrement_active();
        assert_eq!(stats.to_pool_stats(3).active_workers, 1);
    }
}
