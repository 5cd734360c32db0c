//! Wiring of the execution core.
//!
//! [`Runtime`] owns one [`QueueService`], one [`JobProcessor`] and one
//! [`SelfFixLoop`], seeds the configured queues and attaches the built-in
//! phase handlers to them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{PhaseKind, ServiceConfig};
use crate::error::{ProcessorError, QueueError};
use crate::fix::{CommandTestRunner, FsWorkspace, RepairAgent, SelfFixLoop, TestRunner};
use crate::processor::handlers::{CommandPhaseHandler, TestingPhaseHandler};
use crate::processor::{JobProcessor, PhaseHandler, ProcessorOptions};
use crate::scheduler::{Job, JobStore, MemoryStore, QueueService, QueueStats, RedisStore};

pub struct Runtime {
    config: ServiceConfig,
    queues: Arc<QueueService>,
    processor: JobProcessor,
    fix_loop: Arc<SelfFixLoop>,
    runner: Arc<dyn TestRunner>,
}

impl Runtime {
    /// Opens the configured store (Redis when `redis_url` is set) and builds
    /// the services on top of it.
    pub async fn connect(
        config: ServiceConfig,
        agent: Arc<dyn RepairAgent>,
    ) -> Result<Self, QueueError> {
        let store: Arc<dyn JobStore> = match &config.redis_url {
            Some(url) => {
                info!(prefix = %config.key_prefix, "Using Redis job store");
                Arc::new(RedisStore::connect(url, &config.key_prefix).await?)
            }
            None => {
                info!("Using in-memory job store");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(
            config,
            store,
            agent,
            Arc::new(CommandTestRunner::new()),
        ))
    }

    pub fn with_store(
        config: ServiceConfig,
        store: Arc<dyn JobStore>,
        agent: Arc<dyn RepairAgent>,
        runner: Arc<dyn TestRunner>,
    ) -> Self {
        let queues = Arc::new(QueueService::with_poll_interval(store, config.poll_interval));
        let processor = JobProcessor::new(Arc::clone(&queues), config.processor.clone());
        let fix_loop = Arc::new(SelfFixLoop::new(
            config.fix.clone(),
            agent,
            Arc::new(FsWorkspace::new()),
            Arc::clone(&runner),
        ));
        Self {
            config,
            queues,
            processor,
            fix_loop,
            runner,
        }
    }

    /// Creates every configured queue and registers its phase handler.
    ///
    /// Safe to call twice: queues and processors already in place are kept.
    pub async fn start(&self) -> Result<(), ProcessorError> {
        for def in &self.config.queues {
            self.queues.create_queue(&def.name, def.options())?;

            let (handler, default_schema): (Arc<dyn PhaseHandler>, _) = match def.phase {
                PhaseKind::Command => (
                    Arc::new(CommandPhaseHandler::new()),
                    CommandPhaseHandler::schema(),
                ),
                PhaseKind::Testing => (
                    Arc::new(TestingPhaseHandler::new(
                        Arc::clone(&self.runner),
                        Arc::clone(&self.fix_loop),
                    )),
                    TestingPhaseHandler::schema(),
                ),
            };
            let schema = def.schema.clone().unwrap_or(default_schema);

            self.processor
                .register_processor(
                    &def.name,
                    handler,
                    ProcessorOptions::new(def.concurrency).with_schema(schema),
                )
                .await?;
        }

        info!(queues = self.config.queues.len(), "Runtime started");
        Ok(())
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn queues(&self) -> &Arc<QueueService> {
        &self.queues
    }

    pub fn processor(&self) -> &JobProcessor {
        &self.processor
    }

    pub fn fix_loop(&self) -> &Arc<SelfFixLoop> {
        &self.fix_loop
    }

    /// Stats for every queue; also refreshes the queue depth gauges.
    pub async fn queue_stats(&self) -> Result<Vec<QueueStats>, QueueError> {
        let mut stats = Vec::new();
        for name in self.queues.list_queues() {
            stats.push(self.queues.get_queue_stats(&name).await?);
        }
        Ok(stats)
    }

    /// Polls until every listed job is terminal or `timeout` elapses, and
    /// returns the jobs as last seen.
    pub async fn wait_for_jobs(
        &self,
        jobs: &[(String, Uuid)],
        timeout: Duration,
    ) -> Result<Vec<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut seen = Vec::with_capacity(jobs.len());
            for (queue, id) in jobs {
                if let Some(job) = self.queues.get_job(queue, *id).await? {
                    seen.push(job);
                }
            }

            let done = seen.len() == jobs.len() && seen.iter().all(|job| job.state.is_terminal());
            if done || tokio::time::Instant::now() >= deadline {
                if !done {
                    warn!(
                        pending = jobs.len() - seen.iter().filter(|j| j.state.is_terminal()).count(),
                        "Timed out waiting for jobs"
                    );
                }
                return Ok(seen);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Stops the fix loop and the queues together within the configured
    /// grace window.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        let grace = self.config.shutdown_grace;
        let (remaining, queues) =
            tokio::join!(self.fix_loop.shutdown(grace), self.queues.shutdown(grace));
        if remaining > 0 {
            warn!(remaining, "Fix sessions still active at shutdown");
        }
        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueDefinition;
    use crate::error::FixError;
    use crate::fix::{RepairContext, RepairResponse};
    use crate::scheduler::{JobOptions, JobState};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoRepair;

    #[async_trait]
    impl RepairAgent for NoRepair {
        async fn generate(&self, _ctx: &RepairContext) -> Result<RepairResponse, FixError> {
            Err(FixError::Repair("no provider".to_string()))
        }
    }

    fn runtime(queues: Vec<QueueDefinition>) -> Runtime {
        let config = ServiceConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_shutdown_grace(Duration::from_secs(2))
            .with_queues(queues);
        Runtime::with_store(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(NoRepair),
            Arc::new(CommandTestRunner::new()),
        )
    }

    #[tokio::test]
    async fn test_start_seeds_queues_and_processors() {
        let rt = runtime(crate::config::default_queues());
        rt.start().await.expect("start");

        let mut names = rt.queues().list_queues();
        names.sort();
        assert_eq!(names, vec!["build", "generation", "testing"]);
        assert!(rt.processor().is_registered("testing"));

        // Second start keeps what is already there.
        rt.start().await.expect("restart");
        rt.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_command_job_runs_to_completion() {
        let rt = runtime(vec![QueueDefinition::new("build", 2)]);
        rt.start().await.expect("start");

        let job = rt
            .queues()
            .add_job("build", "compile", json!({"command": "echo ok"}), JobOptions::new())
            .await
            .expect("add");

        let jobs = rt
            .wait_for_jobs(&[("build".to_string(), job.id)], Duration::from_secs(10))
            .await
            .expect("wait");
        assert_eq!(jobs[0].state, JobState::Completed);
        assert_eq!(jobs[0].attempts_made, 1);

        let stats = rt.queue_stats().await.expect("stats");
        assert_eq!(stats[0].counts.completed, 1);
        rt.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_without_retry() {
        let rt = runtime(vec![QueueDefinition::new("build", 1)]);
        rt.start().await.expect("start");

        let job = rt
            .queues()
            .add_job("build", "compile", json!({"cmd": "typo"}), JobOptions::new())
            .await
            .expect("add");

        let jobs = rt
            .wait_for_jobs(&[("build".to_string(), job.id)], Duration::from_secs(10))
            .await
            .expect("wait");
        assert_eq!(jobs[0].state, JobState::Failed);
        assert_eq!(jobs[0].attempts_made, 1);
        rt.shutdown().await.expect("shutdown");
    }
}
