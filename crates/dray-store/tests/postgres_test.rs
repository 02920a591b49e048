// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the PostgreSQL backend.
//!
//! These tests need a reachable database and are skipped unless
//! `TEST_DATABASE_URL` is set:
//!
//! ```bash
//! TEST_DATABASE_URL=postgres://localhost/dray_test \
//!     cargo test -p dray-store --test postgres_test
//! ```

use std::time::Duration;

use dray_store::{
    FailureReason, PostgresStore, SpawnTask, StartAt, SuspendOutcome, TaskState, TaskStore,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use uuid::Uuid;

const CLAIM: Duration = Duration::from_secs(60);

/// Connect to the test database, or None when TEST_DATABASE_URL is unset.
async fn test_store() -> Option<PostgresStore> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .ok()?;
    PostgresStore::with_schema(pool, "dray_test").ok()
}

fn spawn_request(name: &str) -> SpawnTask {
    SpawnTask {
        task_name: name.to_string(),
        params: json!({ "n": 1 }),
        headers: json!({}),
        retry_strategy: None,
        max_attempts: 1,
        cancellation: None,
        start_at: StartAt::Now,
    }
}

/// Count this queue's tables in the test schema.
async fn table_count(queue: &str) -> i64 {
    let url = std::env::var("TEST_DATABASE_URL").expect("checked by caller");
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("connect");
    let row = sqlx::query(&format!(
        r#"
        SELECT COUNT(*) AS n
        FROM information_schema.tables
        WHERE table_schema = 'dray_test'
          AND table_name IN ('t_{q}', 'r_{q}', 'c_{q}', 'e_{q}', 'w_{q}')
        "#,
        q = queue,
    ))
    .fetch_one(&pool)
    .await
    .expect("count");
    row.try_get::<i64, _>("n").expect("count column")
}

#[tokio::test]
async fn test_queue_creates_and_drops_five_tables() {
    let Some(store) = test_store().await else {
        return;
    };
    let queue = "lifecycle";
    store.drop_queue(queue).await.expect("reset");

    store.create_queue(queue).await.expect("create");
    // Creation is idempotent.
    store.create_queue(queue).await.expect("recreate");
    assert_eq!(table_count(queue).await, 5);
    assert!(store
        .list_queues()
        .await
        .expect("list")
        .contains(&queue.to_string()));

    store.drop_queue(queue).await.expect("drop");
    assert_eq!(table_count(queue).await, 0);
    // Dropping a missing queue is tolerated.
    store.drop_queue(queue).await.expect("drop again");
}

#[tokio::test]
async fn test_spawn_claim_complete_round_trip() {
    let Some(store) = test_store().await else {
        return;
    };
    let queue = "roundtrip";
    store.drop_queue(queue).await.expect("reset");
    store.create_queue(queue).await.expect("create");

    let handle = store
        .spawn_task(queue, spawn_request("echo"))
        .await
        .expect("spawn");
    assert_eq!(handle.attempt, 1);

    let claims = store
        .claim_tasks(queue, 10, CLAIM, "worker-pg")
        .await
        .expect("claim");
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].run_id, handle.run_id);
    assert_eq!(claims[0].task_name, "echo");
    assert_eq!(claims[0].params, json!({ "n": 1 }));

    // Claimed runs are exclusive.
    assert!(store
        .claim_tasks(queue, 10, CLAIM, "other")
        .await
        .expect("claim")
        .is_empty());

    store
        .complete_run(queue, handle.run_id, "worker-pg", json!({ "ok": true }))
        .await
        .expect("complete");

    let task = store
        .get_task(queue, handle.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.completed_payload, Some(json!({ "ok": true })));

    let run = store
        .get_run(queue, handle.run_id)
        .await
        .expect("get_run")
        .expect("run exists");
    assert_eq!(run.state, TaskState::Completed);
    assert!(run.completed_at.is_some());

    store.drop_queue(queue).await.expect("cleanup");
}

#[tokio::test]
async fn test_complete_requires_ownership() {
    let Some(store) = test_store().await else {
        return;
    };
    let queue = "ownership";
    store.drop_queue(queue).await.expect("reset");
    store.create_queue(queue).await.expect("create");

    let handle = store
        .spawn_task(queue, spawn_request("echo"))
        .await
        .expect("spawn");
    store
        .claim_tasks(queue, 1, CLAIM, "owner")
        .await
        .expect("claim");

    let err = store
        .complete_run(queue, handle.run_id, "intruder", json!(null))
        .await
        .unwrap_err();
    assert!(err.is_not_owner());

    let err = store
        .extend_claim(queue, handle.run_id, "intruder", CLAIM)
        .await
        .unwrap_err();
    assert!(err.is_not_owner());

    store.drop_queue(queue).await.expect("cleanup");
}

#[tokio::test]
async fn test_fail_run_enqueues_backed_off_retry() {
    let Some(store) = test_store().await else {
        return;
    };
    let queue = "retrying";
    store.drop_queue(queue).await.expect("reset");
    store.create_queue(queue).await.expect("create");

    let mut spawn = spawn_request("flaky");
    spawn.max_attempts = 2;
    spawn.retry_strategy = Some(dray_store::RetryStrategy::Fixed { seconds: 30.0 });
    let handle = store.spawn_task(queue, spawn).await.expect("spawn");

    store
        .claim_tasks(queue, 1, CLAIM, "worker-pg")
        .await
        .expect("claim");
    store
        .fail_run(queue, handle.run_id, "worker-pg", FailureReason::new("boom"))
        .await
        .expect("fail");

    let task = store
        .get_task(queue, handle.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempts, 2);
    assert_ne!(task.last_attempt_run, Some(handle.run_id));

    // The retry waits out the backoff before it is claimable.
    assert!(store
        .claim_tasks(queue, 1, CLAIM, "worker-pg")
        .await
        .expect("claim")
        .is_empty());

    let failed_run = store
        .get_run(queue, handle.run_id)
        .await
        .expect("get_run")
        .expect("run exists");
    assert_eq!(failed_run.state, TaskState::Failed);
    assert_eq!(
        failed_run.failure_reason.expect("reason").message,
        "boom"
    );

    store.drop_queue(queue).await.expect("cleanup");
}

#[tokio::test]
async fn test_event_wait_park_and_wake() {
    let Some(store) = test_store().await else {
        return;
    };
    let queue = "eventing";
    store.drop_queue(queue).await.expect("reset");
    store.create_queue(queue).await.expect("create");

    let handle = store
        .spawn_task(queue, spawn_request("awaiter"))
        .await
        .expect("spawn");
    store
        .claim_tasks(queue, 1, CLAIM, "worker-pg")
        .await
        .expect("claim");

    // No emission yet: the run parks.
    let outcome = store
        .suspend_for_event(queue, handle.task_id, handle.run_id, "$event:go", "go")
        .await
        .expect("suspend");
    assert_eq!(outcome, SuspendOutcome::Parked);
    let run = store
        .get_run(queue, handle.run_id)
        .await
        .expect("get_run")
        .expect("run exists");
    assert_eq!(run.state, TaskState::Sleeping);
    assert_eq!(run.wake_event.as_deref(), Some("go"));

    // Emission wakes the waiter and records the delivery durably.
    store
        .emit_event(queue, "go", json!({ "v": 7 }))
        .await
        .expect("emit");
    let claims = store
        .claim_tasks(queue, 1, CLAIM, "worker-pg")
        .await
        .expect("claim");
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].run_id, handle.run_id);

    let outcome = store
        .suspend_for_event(queue, handle.task_id, handle.run_id, "$event:go", "go")
        .await
        .expect("replay");
    assert_eq!(outcome, SuspendOutcome::Cached(json!({ "v": 7 })));

    store.drop_queue(queue).await.expect("cleanup");
}

#[tokio::test]
async fn test_checkpoint_write_once() {
    let Some(store) = test_store().await else {
        return;
    };
    let queue = "checkpoints";
    store.drop_queue(queue).await.expect("reset");
    store.create_queue(queue).await.expect("create");

    let task_id = Uuid::new_v4();
    let run_id = Uuid::new_v4();
    store
        .write_checkpoint(queue, task_id, "step", json!(1), run_id)
        .await
        .expect("write");
    store
        .write_checkpoint(queue, task_id, "step", json!(2), run_id)
        .await
        .expect("second write is a no-op");

    let checkpoint = store
        .read_checkpoint(queue, task_id, "step")
        .await
        .expect("read")
        .expect("exists");
    assert_eq!(checkpoint.state, json!(1));
    assert_eq!(checkpoint.owner_run_id, run_id);

    store.drop_queue(queue).await.expect("cleanup");
}
