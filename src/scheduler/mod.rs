//! Multi-queue job scheduling with retry and backoff.
//!
//! This module provides the queue half of the execution core:
//!
//! - **QueueService**: named queues, worker attachment, pause/resume, stats,
//!   cleanup, manual retry and graceful shutdown
//! - **WorkerPool**: per-queue set of workers bounded by the queue's concurrency
//! - **JobStore**: durable substrate with an atomic claim ([`MemoryStore`],
//!   [`RedisStore`])
//! - **Job**: job records, retry options and backoff policies
//!
//! # Architecture
//!
//! ```text
//!        add_job("build", ..)            add_job("testing", ..)
//!               │                                │
//!        ┌──────▼───────┐                 ┌──────▼───────┐
//!        │ queue: build │                 │queue: testing│
//!        └──────┬───────┘                 └──────┬───────┘
//!               │  JobStore::claim               │
//!       ┌───────┼───────┐         ┌──────────────┼──────────────┐
//!       ▼       ▼       ▼         ▼       ▼      ▼      ▼       ▼
//!   worker-0 worker-1 worker-2  worker-0 ...                 worker-4
//!       │
//!       └─► JobHandler::handle ─► complete | retry (backoff) | fail
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use buildloop::scheduler::{handler_fn, JobOptions, QueueOptions, QueueService};
//! use std::time::Duration;
//!
//! let service = QueueService::in_memory();
//! service.create_queue("build", QueueOptions::default().with_max_attempts(3))?;
//! service
//!     .create_worker("build", handler_fn(|ctx| async move { Ok(ctx.payload().clone()) }), 3)
//!     .await?;
//!
//! let job = service.add_job("build", "compile", payload, JobOptions::new()).await?;
//! let stats = service.get_queue_stats("build").await?;
//!
//! service.shutdown(Duration::from_secs(30)).await?;
//! ```

pub mod job;
pub mod queue;
pub mod redis_store;
pub mod store;
pub mod worker_pool;

pub use job::{
    BackoffKind, BackoffPolicy, Job, JobError, JobOptions, JobState, QueueEvent, QueueOptions,
};
pub use queue::{handler_fn, JobContext, JobHandler, QueueService, QueueStats};
pub use redis_store::RedisStore;
pub use store::{JobStore, MemoryStore, StateCounts};
pub use worker_pool::{PoolStats, WorkerPool, WorkerPoolConfig};
