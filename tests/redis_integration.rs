//! Integration tests for the Redis job store.
//!
//! These tests need a running Redis server.
//! Run with: REDIS_URL=redis://127.0.0.1/ cargo test --test redis_integration -- --ignored

use chrono::Utc;
use serde_json::json;

use buildloop::scheduler::{Job, JobOptions, JobState, JobStore, QueueOptions, RedisStore};

fn redis_url() -> String {
    std::env::var("REDIS_URL").expect("REDIS_URL environment variable must be set for integration tests")
}

/// A fresh key prefix so runs never see each other's jobs.
fn test_prefix() -> String {
    format!("buildloop-test-{}", uuid::Uuid::new_v4())
}

fn job(priority: i32) -> Job {
    Job::new(
        "build",
        "compile",
        json!({"priority": priority}),
        &QueueOptions::default(),
        &JobOptions::new().with_priority(priority),
    )
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_claim_respects_priority_and_counts_attempts() {
    let store = RedisStore::connect(&redis_url(), &test_prefix())
        .await
        .expect("connect");

    let low = store.insert(job(0)).await.expect("insert low");
    let high = store.insert(job(10)).await.expect("insert high");

    let first = store
        .claim("build", Utc::now())
        .await
        .expect("claim")
        .expect("a ready job");
    assert_eq!(first.id, high.id);
    assert_eq!(first.state, JobState::Active);
    assert_eq!(first.attempts_made, 1);

    let second = store
        .claim("build", Utc::now())
        .await
        .expect("claim")
        .expect("a ready job");
    assert_eq!(second.id, low.id);
    assert!(store.claim("build", Utc::now()).await.expect("claim").is_none());

    let counts = store.counts("build", Utc::now()).await.expect("counts");
    assert_eq!(counts.active, 2);
    assert_eq!(counts.waiting, 0);

    assert!(store.remove("build", low.id).await.expect("remove"));
    assert!(store.remove("build", high.id).await.expect("remove"));
}

#[tokio::test]
#[ignore]
async fn test_save_moves_job_between_states() {
    let store = RedisStore::connect(&redis_url(), &test_prefix())
        .await
        .expect("connect");

    store.insert(job(0)).await.expect("insert");
    let mut claimed = store
        .claim("build", Utc::now())
        .await
        .expect("claim")
        .expect("a ready job");

    claimed.state = JobState::Completed;
    claimed.result = Some(json!({"ok": true}));
    claimed.finished_at = Some(Utc::now());
    store.save(&claimed).await.expect("save");

    let completed = store.list("build", JobState::Completed).await.expect("list");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].result, Some(json!({"ok": true})));
    assert!(store.list("build", JobState::Active).await.expect("list").is_empty());

    store.remove("build", claimed.id).await.expect("remove");
}
