//! Redis-backed job store.
//!
//! # Key Structure
//!
//! For a queue named `build` under prefix `buildloop`:
//!
//! - `buildloop:build:jobs`: hash of job id to serialized job
//! - `buildloop:build:wait`: sorted set of ready job ids (dispatch order)
//! - `buildloop:build:delayed`: sorted set of job ids scored by `ready_at`
//! - `buildloop:build:active`: set of claimed job ids
//! - `buildloop:build:completed` / `:failed`: sorted sets scored by finish time
//! - `buildloop:seq`: global sequence counter
//!
//! # Reliability
//!
//! Claims use ZPOPMIN, so two workers (in any process) never receive the same
//! job. Due delayed jobs are promoted with ZREM first; only the caller whose
//! ZREM removed the member re-adds it to the wait set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use super::job::{Job, JobState};
use super::store::{JobStore, StateCounts};
use crate::error::QueueError;

/// Priorities are clamped to this magnitude so wait scores stay exact in f64.
const MAX_PRIORITY: i32 = 1000;

/// Gap between priority bands in the wait score.
const PRIORITY_BAND: f64 = 1e12;

/// Redis-based job store shared across processes.
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
        }
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        queue_key(&self.prefix, queue, suffix)
    }

    async fn load(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.hget(self.key(queue, "jobs"), id).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn load_many(&self, queue: &str, ids: &[String]) -> Result<Vec<Job>, QueueError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let data: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.key(queue, "jobs"))
            .arg(ids)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(data.len());
        for entry in data.into_iter().flatten() {
            jobs.push(serde_json::from_str(&entry)?);
        }
        Ok(jobs)
    }

    /// Moves delayed jobs whose `ready_at` has passed into the wait set.
    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let delayed_key = self.key(queue, "delayed");
        let due: Vec<String> = conn
            .zrangebyscore(&delayed_key, "-inf", now.timestamp_millis())
            .await?;

        let mut promoted = 0;
        for id in due {
            let removed: i64 = conn.zrem(&delayed_key, &id).await?;
            if removed == 0 {
                // Another worker promoted it first.
                continue;
            }
            if let Some(job) = self.load(queue, &id).await? {
                let _: () = conn
                    .zadd(self.key(queue, "wait"), &id, wait_score(&job))
                    .await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }
}

fn queue_key(prefix: &str, queue: &str, suffix: &str) -> String {
    format!("{}:{}:{}", prefix, queue, suffix)
}

/// Lower scores are popped first: higher priority, then lower sequence.
fn wait_score(job: &Job) -> f64 {
    let priority = job.priority.clamp(-MAX_PRIORITY, MAX_PRIORITY);
    -(priority as f64) * PRIORITY_BAND + job.seq as f64
}

fn finished_score(job: &Job) -> i64 {
    job.finished_at.unwrap_or_else(Utc::now).timestamp_millis()
}

#[async_trait]
impl JobStore for RedisStore {
    async fn insert(&self, mut job: Job) -> Result<Job, QueueError> {
        let mut conn = self.redis.clone();
        let seq: u64 = conn.incr(format!("{}:seq", self.prefix), 1).await?;
        job.seq = seq;
        job.state = JobState::Waiting;
        self.save(&job).await?;
        Ok(job)
    }

    async fn claim(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        self.promote_due(queue, now).await?;

        let mut conn = self.redis.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(self.key(queue, "wait"), 1).await?;
        let Some((id, _)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let Some(mut job) = self.load(queue, &id).await? else {
            // Index entry without a record; it was removed concurrently.
            return Ok(None);
        };

        job.state = JobState::Active;
        job.attempts_made += 1;
        job.processed_at = Some(now);

        let serialized = serde_json::to_string(&job)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.key(queue, "jobs"), &id, serialized)
            .sadd(self.key(queue, "active"), &id);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(Some(job))
    }

    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let id = job.id.to_string();
        let queue = job.queue.as_str();
        let serialized = serde_json::to_string(job)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.key(queue, "jobs"), &id, serialized)
            .zrem(self.key(queue, "wait"), &id)
            .zrem(self.key(queue, "delayed"), &id)
            .srem(self.key(queue, "active"), &id)
            .zrem(self.key(queue, "completed"), &id)
            .zrem(self.key(queue, "failed"), &id);

        match job.state {
            JobState::Waiting if job.ready_at > Utc::now() => {
                pipe.zadd(
                    self.key(queue, "delayed"),
                    &id,
                    job.ready_at.timestamp_millis(),
                );
            }
            JobState::Waiting => {
                pipe.zadd(self.key(queue, "wait"), &id, wait_score(job));
            }
            JobState::Active => {
                pipe.sadd(self.key(queue, "active"), &id);
            }
            JobState::Completed => {
                pipe.zadd(self.key(queue, "completed"), &id, finished_score(job));
            }
            JobState::Failed => {
                pipe.zadd(self.key(queue, "failed"), &id, finished_score(job));
            }
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, queue: &str, id: Uuid) -> Result<Option<Job>, QueueError> {
        self.load(queue, &id.to_string()).await
    }

    async fn list(&self, queue: &str, state: JobState) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = match state {
            JobState::Waiting => {
                let mut ids: Vec<String> = conn.zrange(self.key(queue, "wait"), 0, -1).await?;
                let delayed: Vec<String> =
                    conn.zrange(self.key(queue, "delayed"), 0, -1).await?;
                ids.extend(delayed);
                ids
            }
            JobState::Active => conn.smembers(self.key(queue, "active")).await?,
            JobState::Completed => conn.zrange(self.key(queue, "completed"), 0, -1).await?,
            JobState::Failed => conn.zrange(self.key(queue, "failed"), 0, -1).await?,
        };
        self.load_many(queue, &ids).await
    }

    async fn remove(&self, queue: &str, id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let id = id.to_string();
        let removed: i64 = conn.hdel(self.key(queue, "jobs"), &id).await?;

        let mut pipe = redis::pipe();
        pipe.zrem(self.key(queue, "wait"), &id)
            .zrem(self.key(queue, "delayed"), &id)
            .srem(self.key(queue, "active"), &id)
            .zrem(self.key(queue, "completed"), &id)
            .zrem(self.key(queue, "failed"), &id);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(removed > 0)
    }

    async fn counts(&self, queue: &str, now: DateTime<Utc>) -> Result<StateCounts, QueueError> {
        let mut conn = self.redis.clone();
        let ready: usize = conn.zcard(self.key(queue, "wait")).await?;
        let delayed_total: usize = conn.zcard(self.key(queue, "delayed")).await?;
        let delayed: usize = conn
            .zcount(
                self.key(queue, "delayed"),
                now.timestamp_millis() + 1,
                "+inf",
            )
            .await?;
        let active: usize = conn.scard(self.key(queue, "active")).await?;
        let completed: usize = conn.zcard(self.key(queue, "completed")).await?;
        let failed: usize = conn.zcard(self.key(queue, "failed")).await?;

        Ok(StateCounts {
            waiting: ready + delayed_total,
            delayed,
            active,
            completed,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobOptions, QueueOptions};

    fn job_with(priority: i32, seq: u64) -> Job {
        let mut job = Job::new(
            "build",
            "compile",
            serde_json::json!({}),
            &QueueOptions::default(),
            &JobOptions::new().with_priority(priority),
        );
        job.seq = seq;
        job
    }

    #[test]
    fn test_queue_key_layout() {
        assert_eq!(queue_key("buildloop", "build", "wait"), "buildloop:build:wait");
    }

    #[test]
    fn test_wait_score_orders_priority_then_fifo() {
        let normal_early = wait_score(&job_with(0, 1));
        let normal_late = wait_score(&job_with(0, 2));
        let urgent_late = wait_score(&job_with(10, 50));
        let low = wait_score(&job_with(-1, 0));

        assert!(urgent_late < normal_early);
        assert!(normal_early < normal_late);
        assert!(normal_late < low);
    }

    #[test]
    fn test_wait_score_clamps_priority() {
        assert_eq!(
            wait_score(&job_with(i32::MAX, 1)),
            wait_score(&job_with(MAX_PRIORITY, 1))
        );
    }

    #[tokio::test]
    #[ignore] // Run with: REDIS_URL=redis://localhost:6379 cargo test -- --ignored
    async fn test_redis_claim_roundtrip() {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
        let prefix = format!("buildloop-test-{}", Uuid::new_v4());
        let store = RedisStore::connect(&url, &prefix).await.expect("connect");

        let inserted = store.insert(job_with(0, 0)).await.expect("insert");
        let claimed = store
            .claim("build", Utc::now())
            .await
            .expect("claim")
            .expect("job should be claimable");

        assert_eq!(claimed.id, inserted.id);
        assert_eq!(claimed.attempts_made, 1);
        assert!(store.claim("build", Utc::now()).await.expect("claim").is_none());

        let counts = store.counts("build", Utc::now()).await.expect("counts");
        assert_eq!(counts.active, 1);
        assert!(store.remove("build", claimed.id).await.expect("remove"));
    }
}
