//! Durable job storage behind the queue service.
//!
//! The queue service never touches job collections directly; it goes through
//! a `JobStore`, which must offer an atomic claim per named queue. Two
//! substrates ship with the crate:
//!
//! - [`MemoryStore`]: in-process maps, the default and what tests use
//! - [`RedisStore`](super::redis_store::RedisStore): hashes plus sorted-set
//!   indexes, shared between processes
//!
//! # Dispatch order
//!
//! Among ready waiting jobs, higher `priority` is claimed first, then lower
//! `seq` (FIFO). Jobs whose `ready_at` is in the future are skipped until due.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::job::{Job, JobState};
use crate::error::QueueError;

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub waiting: usize,
    /// Waiting jobs whose `ready_at` has not passed yet (subset of `waiting`).
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed
    }
}

/// Durable queue substrate.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new waiting job and assigns its sequence number.
    async fn insert(&self, job: Job) -> Result<Job, QueueError>;

    /// Atomically claims the next ready job of `queue`.
    ///
    /// The claimed job is moved to `active`, its `attempts_made` incremented
    /// and `processed_at` stamped. Two concurrent claims never return the
    /// same job.
    async fn claim(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, QueueError>;

    /// Persists `job` and re-indexes it under its current state.
    async fn save(&self, job: &Job) -> Result<(), QueueError>;

    async fn get(&self, queue: &str, id: Uuid) -> Result<Option<Job>, QueueError>;

    /// Lists jobs in `state`.
    ///
    /// Waiting jobs come back in dispatch order; completed and failed jobs
    /// oldest-finished first.
    async fn list(&self, queue: &str, state: JobState) -> Result<Vec<Job>, QueueError>;

    /// Deletes a job record. Returns whether it existed.
    async fn remove(&self, queue: &str, id: Uuid) -> Result<bool, QueueError>;

    async fn counts(&self, queue: &str, now: DateTime<Utc>) -> Result<StateCounts, QueueError>;
}

type WaitKey = (Reverse<i32>, u64, Uuid);

fn wait_key(job: &Job) -> WaitKey {
    (Reverse(job.priority), job.seq, job.id)
}

#[derive(Default)]
struct QueueTable {
    jobs: HashMap<Uuid, Job>,
    waiting: BTreeSet<WaitKey>,
}

/// In-process job store.
///
/// State lives for the lifetime of the process; jobs left active by a
/// force-closed worker are recovered by the queue service on the next
/// worker attachment.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, QueueTable>>,
    next_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<R>(&self, queue: &str, f: impl FnOnce(&mut QueueTable) -> R) -> R {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        f(tables.entry(queue.to_string()).or_default())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, mut job: Job) -> Result<Job, QueueError> {
        job.seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        job.state = JobState::Waiting;
        let stored = job.clone();
        let queue = job.queue.clone();
        self.with_table(&queue, move |table| {
            table.waiting.insert(wait_key(&job));
            table.jobs.insert(job.id, job);
        });
        Ok(stored)
    }

    async fn claim(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        Ok(self.with_table(queue, |table| {
            let key = table
                .waiting
                .iter()
                .find(|key| {
                    table
                        .jobs
                        .get(&key.2)
                        .is_some_and(|job| job.ready_at <= now)
                })
                .copied()?;
            table.waiting.remove(&key);

            let job = table.jobs.get_mut(&key.2)?;
            job.state = JobState::Active;
            job.attempts_made += 1;
            job.processed_at = Some(now);
            Some(job.clone())
        }))
    }

    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        self.with_table(&job.queue, |table| {
            table.waiting.remove(&wait_key(job));
            if job.state == JobState::Waiting {
                table.waiting.insert(wait_key(job));
            }
            table.jobs.insert(job.id, job.clone());
        });
        Ok(())
    }

    async fn get(&self, queue: &str, id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.with_table(queue, |table| table.jobs.get(&id).cloned()))
    }

    async fn list(&self, queue: &str, state: JobState) -> Result<Vec<Job>, QueueError> {
        Ok(self.with_table(queue, |table| {
            if state == JobState::Waiting {
                return table
                    .waiting
                    .iter()
                    .filter_map(|key| table.jobs.get(&key.2).cloned())
                    .collect();
            }

            let mut jobs: Vec<Job> = table
                .jobs
                .values()
                .filter(|job| job.state == state)
                .cloned()
                .collect();
            match state {
                JobState::Active => jobs.sort_by_key(|job| job.processed_at),
                _ => jobs.sort_by_key(|job| (job.finished_at, job.seq)),
            }
            jobs
        }))
    }

    async fn remove(&self, queue: &str, id: Uuid) -> Result<bool, QueueError> {
        Ok(self.with_table(queue, |table| match table.jobs.remove(&id) {
            Some(job) => {
                table.waiting.remove(&wait_key(&job));
                true
            }
            None => false,
        }))
    }

    async fn counts(&self, queue: &str, now: DateTime<Utc>) -> Result<StateCounts, QueueError> {
        Ok(self.with_table(queue, |table| {
            let mut counts = StateCounts::default();
            for job in table.jobs.values() {
                match job.state {
                    JobState::Waiting => {
                        counts.waiting += 1;
                        if job.ready_at > now {
                            counts.delayed += 1;
                        }
                    }
                    JobState::Active => counts.active += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                }
            }
            counts
        }))
    }
}
