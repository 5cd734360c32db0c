//! Multi-queue job service.
//!
//! `QueueService` owns a set of named queues on top of a [`JobStore`]:
//!
//! - Each queue carries default retry options (max attempts, backoff) and
//!   retention counts for terminal jobs
//! - A worker set with a fixed concurrency can be attached per queue
//! - Failed attempts are retried by moving the job back to `waiting` with a
//!   backoff-derived `ready_at`; jobs never exceed their `max_attempts`
//! - Every state transition is published as a [`QueueEvent`]
//!
//! Queues are independent: a slow or paused queue never blocks another.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{instant_after, Job, JobError, JobOptions, JobState, QueueEvent, QueueOptions};
use super::store::{JobStore, MemoryStore, StateCounts};
use super::worker_pool::{PoolStats, WorkerPool, WorkerPoolConfig};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// Default interval at which idle workers re-check for delayed jobs.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Capacity of the event channel; slow subscribers lag instead of blocking.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Business logic attached to a queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs one attempt of a job. The returned value becomes the job result.
    async fn handle(&self, ctx: JobContext) -> Result<Value, JobError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    async fn handle(&self, ctx: JobContext) -> Result<Value, JobError> {
        (self.0)(ctx).await
    }
}

/// Wraps an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Per-attempt view of a job handed to handlers.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    progress: Arc<AtomicU8>,
    core: Option<Arc<QueueCore>>,
}

impl JobContext {
    /// A context not backed by any queue; progress is only tracked locally.
    pub fn detached(job: Job) -> Self {
        Self {
            progress: Arc::new(AtomicU8::new(job.progress)),
            job,
            core: None,
        }
    }

    pub(crate) fn attached(job: Job, core: Arc<QueueCore>) -> Self {
        Self {
            progress: Arc::new(AtomicU8::new(job.progress)),
            job,
            core: Some(core),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> Uuid {
        self.job.id
    }

    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    pub fn payload(&self) -> &Value {
        &self.job.payload
    }

    /// Attempts claimed so far, including this one.
    pub fn attempts_made(&self) -> u32 {
        self.job.attempts_made
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Records progress (clamped to 100) on the job and publishes it.
    pub async fn report_progress(&self, progress: u8) -> Result<(), QueueError> {
        let progress = progress.min(100);
        self.progress.store(progress, Ordering::SeqCst);
        if let Some(core) = &self.core {
            core.update_progress(&self.job.queue, self.job.id, progress)
                .await?;
        }
        Ok(())
    }
}

/// Snapshot returned by [`QueueService::get_queue_stats`].
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub name: String,
    pub counts: StateCounts,
    pub paused: bool,
    /// Present when a worker set is attached.
    pub workers: Option<PoolStats>,
}

pub(crate) struct QueueEntry {
    pub(crate) name: String,
    pub(crate) options: QueueOptions,
    paused: AtomicBool,
    pub(crate) notify: Notify,
    /// Held for writing while a job is stored and announced as `added`, and
    /// for reading across a claim, so `added` always precedes `active`.
    publish: tokio::sync::RwLock<()>,
    pool: Mutex<Option<WorkerPool>>,
}

impl QueueEntry {
    fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            paused: AtomicBool::new(false),
            notify: Notify::new(),
            publish: tokio::sync::RwLock::new(()),
            pool: Mutex::new(None),
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// State shared between the service handle and its workers.
pub(crate) struct QueueCore {
    store: Arc<dyn JobStore>,
    queues: RwLock<HashMap<String, Arc<QueueEntry>>>,
    events: broadcast::Sender<QueueEvent>,
    accepting: AtomicBool,
    poll_interval: Duration,
    metrics: MetricsCollector,
}

impl QueueCore {
    fn entry(&self, queue: &str) -> Result<Arc<QueueEntry>, QueueError> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) async fn claim(&self, entry: &QueueEntry) -> Result<Option<Job>, QueueError> {
        let _gate = entry.publish.read().await;
        let claimed = self.store.claim(&entry.name, Utc::now()).await?;
        if let Some(job) = &claimed {
            self.emit(QueueEvent::Active {
                queue: entry.name.clone(),
                job_id: job.id,
                attempt: job.attempts_made,
            });
        }
        Ok(claimed)
    }

    async fn update_progress(&self, queue: &str, id: Uuid, progress: u8) -> Result<(), QueueError> {
        if let Some(mut job) = self.store.get(queue, id).await? {
            job.progress = progress;
            self.store.save(&job).await?;
        }
        self.emit(QueueEvent::Progress {
            queue: queue.to_string(),
            job_id: id,
            progress,
        });
        Ok(())
    }

    pub(crate) async fn complete(
        &self,
        entry: &QueueEntry,
        mut job: Job,
        result: Value,
        duration: Duration,
    ) -> Result<(), QueueError> {
        job.state = JobState::Completed;
        job.progress = 100;
        job.result = Some(result.clone());
        job.finished_at = Some(Utc::now());
        self.store.save(&job).await?;

        self.metrics
            .record_job(&entry.name, "completed", duration.as_secs_f64());
        self.emit(QueueEvent::Completed {
            queue: entry.name.clone(),
            job_id: job.id,
            result,
        });

        self.enforce_retention(&entry.name, JobState::Completed, entry.options.keep_completed)
            .await
    }

    /// Records a failed attempt. Returns whether the job was scheduled again.
    pub(crate) async fn fail(
        &self,
        entry: &QueueEntry,
        mut job: Job,
        err: JobError,
        duration: Duration,
    ) -> Result<bool, QueueError> {
        job.failure_reason = Some(err.message.clone());
        job.stacktrace = if err.stack.is_empty() {
            vec![err.message.clone()]
        } else {
            err.stack.clone()
        };

        if err.retryable && job.should_retry() {
            let delay = job.backoff.delay_for(job.attempts_made);
            job.state = JobState::Waiting;
            job.ready_at = instant_after(Utc::now(), delay);
            self.emit(QueueEvent::Retrying {
                queue: entry.name.clone(),
                job_id: job.id,
                attempt: job.attempts_made,
                delay_ms: delay.as_millis() as u64,
                reason: err.message,
            });
            self.store.save(&job).await?;

            self.metrics
                .record_job(&entry.name, "retrying", duration.as_secs_f64());
            self.metrics.record_retry(&entry.name);
            return Ok(true);
        }

        job.state = JobState::Failed;
        job.finished_at = Some(Utc::now());
        self.store.save(&job).await?;

        self.metrics
            .record_job(&entry.name, "failed", duration.as_secs_f64());
        self.emit(QueueEvent::Failed {
            queue: entry.name.clone(),
            job_id: job.id,
            attempts_made: job.attempts_made,
            reason: err.message,
        });

        self.enforce_retention(&entry.name, JobState::Failed, entry.options.keep_failed)
            .await?;
        Ok(false)
    }

    /// Evicts the oldest terminal jobs beyond `keep`.
    async fn enforce_retention(
        &self,
        queue: &str,
        state: JobState,
        keep: usize,
    ) -> Result<(), QueueError> {
        let jobs = self.store.list(queue, state).await?;
        if jobs.len() <= keep {
            return Ok(());
        }

        let excess = jobs.len() - keep;
        for job in jobs.into_iter().take(excess) {
            self.store.remove(queue, job.id).await?;
        }
        debug!(queue = %queue, state = %state, evicted = excess, "Evicted old jobs");
        Ok(())
    }
}

/// Named job queues with attached worker sets.
///
/// # Example
///
/// ```ignore
/// use buildloop::scheduler::{handler_fn, JobOptions, QueueOptions, QueueService};
///
/// let service = QueueService::in_memory();
/// service.create_queue("build", QueueOptions::default())?;
/// service.create_worker("build", handler_fn(|ctx| async move {
///     Ok(serde_json::json!({"built": ctx.id()}))
/// }), 3)?;
/// service.add_job("build", "compile", serde_json::json!({}), JobOptions::new()).await?;
/// ```
pub struct QueueService {
    core: Arc<QueueCore>,
}

impl QueueService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_poll_interval(store, DEFAULT_POLL_INTERVAL)
    }

    /// Creates a service whose idle workers re-check for due jobs at `poll_interval`.
    pub fn with_poll_interval(store: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            core: Arc::new(QueueCore {
                store,
                queues: RwLock::new(HashMap::new()),
                events,
                accepting: AtomicBool::new(true),
                poll_interval,
                metrics: MetricsCollector::new(),
            }),
        }
    }

    /// Creates a service backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Declares a queue. Returns `false` if it already existed, in which case
    /// the original options are kept.
    pub fn create_queue(&self, name: &str, options: QueueOptions) -> Result<bool, QueueError> {
        if name.trim().is_empty() {
            return Err(QueueError::InvalidOptions {
                queue: name.to_string(),
                reason: "queue name must not be empty".to_string(),
            });
        }
        if options.max_attempts == 0 {
            return Err(QueueError::InvalidOptions {
                queue: name.to_string(),
                reason: "max_attempts must be at least 1".to_string(),
            });
        }

        let mut queues = self.core.queues.write().unwrap_or_else(|e| e.into_inner());
        if queues.contains_key(name) {
            debug!(queue = %name, "Queue already exists");
            return Ok(false);
        }

        info!(
            queue = %name,
            max_attempts = options.max_attempts,
            backoff_ms = options.backoff.delay_ms,
            "Queue created"
        );
        queues.insert(name.to_string(), Arc::new(QueueEntry::new(name, options)));
        Ok(true)
    }

    /// Enqueues a job. Fails without touching any state if the queue is unknown.
    pub async fn add_job(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        opts: JobOptions,
    ) -> Result<Job, QueueError> {
        if !self.core.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        let entry = self.core.entry(queue)?;

        let job = Job::new(queue, name, payload, &entry.options, &opts);
        let job = {
            let _gate = entry.publish.write().await;
            let job = self.core.store.insert(job).await?;
            self.core.emit(QueueEvent::Added {
                queue: queue.to_string(),
                job_id: job.id,
            });
            job
        };

        debug!(queue = %queue, job_id = %job.id, name = %name, "Job added");
        entry.notify.notify_one();
        Ok(job)
    }

    /// Attaches `concurrency` parallel workers running `handler`.
    ///
    /// Jobs left active by an earlier worker set are recovered first.
    pub async fn create_worker(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<(), QueueError> {
        if !self.core.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        let entry = self.core.entry(queue)?;
        if concurrency == 0 {
            return Err(QueueError::InvalidOptions {
                queue: queue.to_string(),
                reason: "concurrency must be at least 1".to_string(),
            });
        }
        if entry.pool.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
            return Err(QueueError::WorkerAlreadyAttached(queue.to_string()));
        }

        let recovered = self.recover_stalled_jobs(queue).await?;
        if recovered > 0 {
            info!(queue = %queue, recovered = recovered, "Recovered stalled jobs");
        }

        let config = WorkerPoolConfig::new(concurrency).with_poll_interval(self.core.poll_interval);
        let pool = WorkerPool::spawn(config, Arc::clone(&self.core), Arc::clone(&entry), handler);

        let mut slot = entry.pool.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            // Lost a race with another attach; keep the first pool.
            drop(slot);
            pool.signal_shutdown();
            return Err(QueueError::WorkerAlreadyAttached(queue.to_string()));
        }
        *slot = Some(pool);
        Ok(())
    }

    /// Stops dispatching new jobs; in-flight jobs run to completion.
    pub fn pause_queue(&self, queue: &str) -> Result<(), QueueError> {
        let entry = self.core.entry(queue)?;
        entry.paused.store(true, Ordering::SeqCst);
        info!(queue = %queue, "Queue paused");
        Ok(())
    }

    pub fn resume_queue(&self, queue: &str) -> Result<(), QueueError> {
        let entry = self.core.entry(queue)?;
        entry.paused.store(false, Ordering::SeqCst);
        entry.notify.notify_waiters();
        info!(queue = %queue, "Queue resumed");
        Ok(())
    }

    pub fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        Ok(self.core.entry(queue)?.is_paused())
    }

    /// Names of all declared queues, sorted.
    pub fn list_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .core
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Re-enqueues up to `max` failed jobs (oldest first) with a fresh
    /// attempt budget. Returns how many were re-enqueued.
    pub async fn retry_failed_jobs(&self, queue: &str, max: usize) -> Result<usize, QueueError> {
        let entry = self.core.entry(queue)?;
        let failed = self.core.store.list(queue, JobState::Failed).await?;

        let mut retried = 0;
        for mut job in failed.into_iter().take(max) {
            job.state = JobState::Waiting;
            job.attempts_made = 0;
            job.manual_retries += 1;
            job.progress = 0;
            job.failure_reason = None;
            job.stacktrace.clear();
            job.finished_at = None;
            job.ready_at = Utc::now();
            {
                let _gate = entry.publish.write().await;
                self.core.store.save(&job).await?;
                self.core.emit(QueueEvent::Added {
                    queue: queue.to_string(),
                    job_id: job.id,
                });
            }
            retried += 1;
        }

        if retried > 0 {
            entry.notify.notify_waiters();
            info!(queue = %queue, retried = retried, "Failed jobs re-enqueued");
        }
        Ok(retried)
    }

    /// Removes completed jobs that finished more than `grace` ago, oldest
    /// first, at most `limit` of them (`0` means no limit).
    pub async fn clean_queue(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
    ) -> Result<Vec<Uuid>, QueueError> {
        self.core.entry(queue)?;
        let cutoff = chrono::Duration::from_std(grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let limit = if limit == 0 { usize::MAX } else { limit };

        let completed = self.core.store.list(queue, JobState::Completed).await?;
        let mut removed = Vec::new();
        for job in completed
            .into_iter()
            .filter(|job| job.finished_at.is_some_and(|at| at <= cutoff))
            .take(limit)
        {
            if self.core.store.remove(queue, job.id).await? {
                removed.push(job.id);
            }
        }

        info!(queue = %queue, removed = removed.len(), "Queue cleaned");
        Ok(removed)
    }

    pub async fn get_queue_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let entry = self.core.entry(queue)?;
        let counts = self.core.store.counts(queue, Utc::now()).await?;
        self.core.metrics.update_queue_depth(queue, &counts);

        let workers = entry
            .pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|pool| pool.stats());

        Ok(QueueStats {
            name: entry.name.clone(),
            counts,
            paused: entry.is_paused(),
            workers,
        })
    }

    pub async fn get_job(&self, queue: &str, id: Uuid) -> Result<Option<Job>, QueueError> {
        self.core.entry(queue)?;
        self.core.store.get(queue, id).await
    }

    /// Subscribes to job state transitions, in the order they happen.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.core.events.subscribe()
    }

    /// Returns jobs left `active` without a live worker to `waiting`, or to
    /// `failed` when no attempts remain.
    ///
    /// Runs automatically when a worker set is attached. With a shared Redis
    /// store, only call this when no other process is consuming the queue.
    pub async fn recover_stalled_jobs(&self, queue: &str) -> Result<usize, QueueError> {
        let entry = self.core.entry(queue)?;
        let stalled = self.core.store.list(queue, JobState::Active).await?;
        let count = stalled.len();

        for mut job in stalled {
            if job.should_retry() {
                job.state = JobState::Waiting;
                job.ready_at = Utc::now();
                let _gate = entry.publish.write().await;
                self.core.store.save(&job).await?;
                self.core.emit(QueueEvent::Added {
                    queue: queue.to_string(),
                    job_id: job.id,
                });
            } else {
                let reason = "job stalled: worker stopped before completion".to_string();
                warn!(queue = %queue, job_id = %job.id, "Stalled job has no attempts left");
                job.state = JobState::Failed;
                job.failure_reason = Some(reason.clone());
                job.finished_at = Some(Utc::now());
                self.core.store.save(&job).await?;
                self.core.emit(QueueEvent::Failed {
                    queue: queue.to_string(),
                    job_id: job.id,
                    attempts_made: job.attempts_made,
                    reason,
                });
                self.core
                    .enforce_retention(queue, JobState::Failed, entry.options.keep_failed)
                    .await?;
            }
        }
        Ok(count)
    }

    /// Stops dispatch on every queue and waits up to `grace` for in-flight
    /// jobs. Workers still running afterwards are aborted; their jobs stay
    /// `active` until recovered.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), QueueError> {
        self.core.accepting.store(false, Ordering::SeqCst);
        info!(grace_ms = grace.as_millis() as u64, "Initiating queue service shutdown");

        let entries: Vec<Arc<QueueEntry>> = self
            .core
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut pools: Vec<WorkerPool> = entries
            .iter()
            .filter_map(|entry| entry.pool.lock().unwrap_or_else(|e| e.into_inner()).take())
            .collect();

        for pool in pools.iter_mut() {
            pool.signal_shutdown();
        }

        let drain = async {
            for pool in pools.iter_mut() {
                pool.join().await;
            }
        };

        match tokio::time::timeout(grace, drain).await {
            Ok(()) => {
                info!("Queue service shutdown complete");
                Ok(())
            }
            Err(_) => {
                let aborted: usize = pools.iter_mut().map(|pool| pool.abort()).sum();
                warn!(aborted = aborted, "Shutdown grace elapsed; workers force-closed");
                Err(QueueError::ShutdownTimeout { grace, aborted })
            }
        }
    }
}

impl Drop for QueueService {
    fn drop(&mut self) {
        // Workers hold the core; without a signal they would outlive the service.
        self.core.accepting.store(false, Ordering::SeqCst);
        for entry in self
            .core
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            if let Some(pool) = entry.pool.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                pool.signal_shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::scheduler::job::BackoffPolicy;

    fn fast_service() -> QueueService {
        QueueService::with_poll_interval(Arc::new(MemoryStore::new()), Duration::from_millis(10))
    }

    fn fast_options(max_attempts: u32) -> QueueOptions {
        QueueOptions::default()
            .with_max_attempts(max_attempts)
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(5)))
    }

    async fn wait_for_state(service: &QueueService, queue: &str, id: Uuid, state: JobState) -> Job {
        for _ in 0..400 {
            if let Some(job) = service.get_job(queue, id).await.expect("get_job") {
                if job.state == state {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached {}", id, state);
    }

    #[tokio::test]
    async fn test_create_queue_is_idempotent() {
        let service = fast_service();
        assert!(service.create_queue("build", fast_options(3)).expect("create"));
        assert!(!service.create_queue("build", fast_options(7)).expect("create"));
        assert_eq!(service.list_queues(), vec!["build".to_string()]);
    }

    #[tokio::test]
    async fn test_create_queue_rejects_zero_attempts() {
        let service = fast_service();
        let err = service
            .create_queue("build", QueueOptions::default().with_max_attempts(0))
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions { .. }));
    }

    #[tokio::test]
    async fn test_add_job_to_unknown_queue() {
        let service = fast_service();
        let err = service
            .add_job("missing", "x", Value::Null, JobOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::QueueNotFound(ref q) if q == "missing"));
        assert!(service.list_queues().is_empty());
    }

    /// Memory store whose inserts always fail.
    struct RejectingStore(MemoryStore);

    #[async_trait]
    impl JobStore for RejectingStore {
        async fn insert(&self, _job: Job) -> Result<Job, QueueError> {
            Err(QueueError::ConnectionFailed("store offline".to_string()))
        }
        async fn claim(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
            self.0.claim(queue, now).await
        }
        async fn save(&self, job: &Job) -> Result<(), QueueError> {
            self.0.save(job).await
        }
        async fn get(&self, queue: &str, id: Uuid) -> Result<Option<Job>, QueueError> {
            self.0.get(queue, id).await
        }
        async fn list(&self, queue: &str, state: JobState) -> Result<Vec<Job>, QueueError> {
            self.0.list(queue, state).await
        }
        async fn remove(&self, queue: &str, id: Uuid) -> Result<bool, QueueError> {
            self.0.remove(queue, id).await
        }
        async fn counts(&self, queue: &str, now: DateTime<Utc>) -> Result<StateCounts, QueueError> {
            self.0.counts(queue, now).await
        }
    }

    #[tokio::test]
    async fn test_failed_insert_emits_no_event() {
        let service = QueueService::with_poll_interval(
            Arc::new(RejectingStore(MemoryStore::new())),
            Duration::from_millis(10),
        );
        service.create_queue("build", fast_options(3)).expect("create");
        let mut events = service.subscribe();

        let err = service
            .add_job("build", "compile", Value::Null, JobOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ConnectionFailed(_)));
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_worker_completes_job_and_emits_events() {
        let service = fast_service();
        service.create_queue("build", fast_options(3)).expect("create");
        let mut events = service.subscribe();

        service
            .create_worker(
                "build",
                handler_fn(|ctx| async move {
                    ctx.report_progress(50).await.map_err(|e| JobError::fatal(e.to_string()))?;
                    Ok(serde_json::json!({"ok": true}))
                }),
                2,
            )
            .await
            .expect("worker");

        let job = service
            .add_job("build", "compile", Value::Null, JobOptions::new())
            .await
            .expect("add");
        let done = wait_for_state(&service, "build", job.id, JobState::Completed).await;

        assert_eq!(done.progress, 100);
        assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
        assert_eq!(done.attempts_made, 1);

        let mut kinds = Vec::new();
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(200), events.recv()).await
        {
            if event.job_id() != job.id {
                continue;
            }
            let kind = serde_json::to_value(&event).expect("json")["event"].clone();
            let finished = kind == "completed";
            kinds.push(kind);
            if finished {
                break;
            }
        }
        assert_eq!(
            kinds,
            vec!["added", "active", "progress", "completed"]
                .into_iter()
                .map(Value::from)
                .collect::<Vec<_>>()
        );

        service.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let service = fast_service();
        service.create_queue("build", fast_options(5)).expect("create");
        service
            .create_worker(
                "build",
                handler_fn(|_ctx| async move { Err(JobError::fatal("bad config")) }),
                1,
            )
            .await
            .expect("worker");

        let job = service
            .add_job("build", "compile", Value::Null, JobOptions::new())
            .await
            .expect("add");
        let failed = wait_for_state(&service, "build", job.id, JobState::Failed).await;

        assert_eq!(failed.attempts_made, 1);
        assert_eq!(failed.failure_reason.as_deref(), Some("bad config"));
        service.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_max() {
        let service = fast_service();
        service.create_queue("build", fast_options(3)).expect("create");
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        service
            .create_worker(
                "build",
                handler_fn(move |_ctx| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(JobError::retryable("network down"))
                    }
                }),
                1,
            )
            .await
            .expect("worker");

        let job = service
            .add_job("build", "compile", Value::Null, JobOptions::new())
            .await
            .expect("add");
        let failed = wait_for_state(&service, "build", job.id, JobState::Failed).await;

        assert_eq!(failed.attempts_made, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        service.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_retry_failed_jobs_resets_attempts() {
        let service = fast_service();
        service.create_queue("build", fast_options(1)).expect("create");
        service
            .create_worker(
                "build",
                handler_fn(|ctx| async move {
                    if ctx.job().manual_retries == 0 {
                        Err(JobError::retryable("timeout"))
                    } else {
                        Ok(Value::Null)
                    }
                }),
                1,
            )
            .await
            .expect("worker");

        let job = service
            .add_job("build", "compile", Value::Null, JobOptions::new())
            .await
            .expect("add");
        wait_for_state(&service, "build", job.id, JobState::Failed).await;

        assert_eq!(service.retry_failed_jobs("build", 10).await.expect("retry"), 1);
        let done = wait_for_state(&service, "build", job.id, JobState::Completed).await;
        assert_eq!(done.manual_retries, 1);
        assert_eq!(done.attempts_made, 1);
        service.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_pause_blocks_dispatch_until_resume() {
        let service = fast_service();
        service.create_queue("build", fast_options(1)).expect("create");
        service.pause_queue("build").expect("pause");
        assert!(service.is_paused("build").expect("paused"));

        service
            .create_worker("build", handler_fn(|_ctx| async move { Ok(Value::Null) }), 1)
            .await
            .expect("worker");
        let job = service
            .add_job("build", "compile", Value::Null, JobOptions::new())
            .await
            .expect("add");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiting = service.get_job("build", job.id).await.expect("get").expect("job");
        assert_eq!(waiting.state, JobState::Waiting);

        service.resume_queue("build").expect("resume");
        wait_for_state(&service, "build", job.id, JobState::Completed).await;
        service.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_second_worker_set_rejected() {
        let service = fast_service();
        service.create_queue("build", fast_options(1)).expect("create");
        let handler = handler_fn(|_ctx| async move { Ok(Value::Null) });
        service
            .create_worker("build", Arc::clone(&handler), 1)
            .await
            .expect("worker");

        let err = service.create_worker("build", handler, 1).await.unwrap_err();
        assert!(matches!(err, QueueError::WorkerAlreadyAttached(_)));
        service.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest_completed() {
        let service = fast_service();
        service
            .create_queue("build", fast_options(1).with_retention(2, 2))
            .expect("create");
        service
            .create_worker("build", handler_fn(|_ctx| async move { Ok(Value::Null) }), 1)
            .await
            .expect("worker");

        let mut ids = Vec::new();
        for _ in 0..4 {
            let job = service
                .add_job("build", "compile", Value::Null, JobOptions::new())
                .await
                .expect("add");
            wait_for_state(&service, "build", job.id, JobState::Completed).await;
            ids.push(job.id);
        }

        let stats = service.get_queue_stats("build").await.expect("stats");
        assert_eq!(stats.counts.completed, 2);
        assert!(service.get_job("build", ids[0]).await.expect("get").is_none());
        assert!(service.get_job("build", ids[3]).await.expect("get").is_some());
        service.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_clean_queue_respects_grace_and_limit() {
        let service = fast_service();
        service.create_queue("build", fast_options(1)).expect("create");
        service
            .create_worker("build", handler_fn(|_ctx| async move { Ok(Value::Null) }), 1)
            .await
            .expect("worker");

        for _ in 0..3 {
            let job = service
                .add_job("build", "compile", Value::Null, JobOptions::new())
                .await
                .expect("add");
            wait_for_state(&service, "build", job.id, JobState::Completed).await;
        }

        let none = service
            .clean_queue("build", Duration::from_secs(3600), 0)
            .await
            .expect("clean");
        assert!(none.is_empty());

        let removed = service
            .clean_queue("build", Duration::ZERO, 2)
            .await
            .expect("clean");
        assert_eq!(removed.len(), 2);
        let stats = service.get_queue_stats("build").await.expect("stats");
        assert_eq!(stats.counts.completed, 1);
        service.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_recover_stalled_jobs() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let service = QueueService::with_poll_interval(Arc::clone(&store), Duration::from_millis(10));
        service.create_queue("build", fast_options(2)).expect("create");

        let job = service
            .add_job("build", "compile", Value::Null, JobOptions::new())
            .await
            .expect("add");
        // Simulate a worker that claimed the job and died.
        store.claim("build", Utc::now()).await.expect("claim");

        assert_eq!(service.recover_stalled_jobs("build").await.expect("recover"), 1);
        let recovered = service.get_job("build", job.id).await.expect("get").expect("job");
        assert_eq!(recovered.state, JobState::Waiting);
        assert_eq!(recovered.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_shutdown_times_out_and_aborts() {
        let service = fast_service();
        service.create_queue("slow", fast_options(1)).expect("create");
        service
            .create_worker(
                "slow",
                handler_fn(|_ctx| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Value::Null)
                }),
                1,
            )
            .await
            .expect("worker");

        let job = service
            .add_job("slow", "sleep", Value::Null, JobOptions::new())
            .await
            .expect("add");
        wait_for_state(&service, "slow", job.id, JobState::Active).await;

        let err = service.shutdown(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, QueueError::ShutdownTimeout { aborted: 1, .. }));

        let err = service
            .add_job("slow", "sleep", Value::Null, JobOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_detached_context_tracks_progress() {
        let job = Job::new(
            "build",
            "compile",
            Value::Null,
            &QueueOptions::default(),
            &JobOptions::new(),
        );
        let ctx = JobContext::detached(job);
        ctx.report_progress(250).await.expect("progress");
        assert_eq!(ctx.progress(), 100);
    }
}
