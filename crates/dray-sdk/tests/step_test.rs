// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step checkpoint semantics: read-through caching, canonical naming, and
//! replay across retries.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{TestContext, CLAIM, WORKER};
use dray_sdk::{SpawnOptions, TaskError, TaskSpec, TaskState};
use serde_json::{json, Value};

#[tokio::test]
async fn test_single_step_task_completes() {
    let ctx = TestContext::new().await;

    ctx.dray
        .register_task(TaskSpec::new("doubler"), |params: Value, ctx| async move {
            let doubled = ctx
                .step("double", || async move {
                    Ok(params["value"].as_i64().unwrap_or(0) * 2)
                })
                .await?;
            Ok(json!({ "doubled": doubled }))
        });

    let handle = ctx
        .dray
        .spawn("doubler", json!({ "value": 21 }), SpawnOptions::default())
        .await
        .expect("spawn");
    assert_eq!(handle.attempt, 1);

    assert_eq!(ctx.drain().await, 1);

    let task = ctx
        .dray
        .get_task(handle.task_id)
        .await
        .expect("get_task")
        .expect("task exists");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.completed_payload, Some(json!({ "doubled": 42 })));

    let checkpoints = ctx
        .dray
        .get_checkpoints(handle.task_id)
        .await
        .expect("get_checkpoints");
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].checkpoint_name, "double");
    assert_eq!(checkpoints[0].state, json!(42));
}

#[tokio::test]
async fn test_partial_retry_skips_cached_steps() {
    let ctx = TestContext::new().await;
    let executed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let executed_in_handler = executed.clone();
    ctx.dray.register_task(
        TaskSpec::new("three-steps").with_default_max_attempts(2),
        move |_: Value, ctx| {
            let executed = executed_in_handler.clone();
            async move {
                let record = |name: &'static str| {
                    let executed = executed.clone();
                    async move {
                        executed.lock().unwrap().push(name.to_string());
                        Ok(name.to_string())
                    }
                };
                let s1 = ctx.step("s1", || record("s1")).await?;
                let s2 = ctx.step("s2", || record("s2")).await?;
                if ctx.attempt() == 1 {
                    return Err(TaskError::msg("crash between s2 and s3"));
                }
                let s3 = ctx.step("s3", || record("s3")).await?;
                Ok(json!({ "combined": format!("{}+{}+{}", s1, s2, s3) }))
            }
        },
    );

    let handle = ctx
        .dray
        .spawn("three-steps", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");

    // First attempt runs s1 and s2, then fails.
    assert_eq!(ctx.drain().await, 1);
    let task = ctx.dray.get_task(handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempts, 2);

    // Second attempt replays s1 and s2 from checkpoints; only s3 executes.
    ctx.advance(Duration::from_secs(2));
    assert_eq!(ctx.drain().await, 1);

    assert_eq!(*executed.lock().unwrap(), vec!["s1", "s2", "s3"]);

    let task = ctx.dray.get_task(handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(
        task.completed_payload,
        Some(json!({ "combined": "s1+s2+s3" }))
    );

    let names: Vec<String> = ctx
        .dray
        .get_checkpoints(handle.task_id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.checkpoint_name)
        .collect();
    assert_eq!(names, vec!["s1", "s2", "s3"]);
}

#[tokio::test]
async fn test_repeated_step_names_get_ordinal_suffixes() {
    let ctx = TestContext::new().await;

    ctx.dray
        .register_task(TaskSpec::new("looper"), |_: Value, ctx| async move {
            let mut results = Vec::new();
            for i in 0..3i64 {
                let value = ctx.step("loop", || async move { Ok(i * 10) }).await?;
                results.push(value);
            }
            Ok(json!({ "results": results }))
        });

    let handle = ctx
        .dray
        .spawn("looper", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");
    assert_eq!(ctx.drain().await, 1);

    let task = ctx.dray.get_task(handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.completed_payload, Some(json!({ "results": [0, 10, 20] })));

    let checkpoints = ctx.dray.get_checkpoints(handle.task_id).await.unwrap();
    let names: Vec<&str> = checkpoints
        .iter()
        .map(|c| c.checkpoint_name.as_str())
        .collect();
    assert_eq!(names, vec!["loop", "loop#2", "loop#3"]);
    let states: Vec<&Value> = checkpoints.iter().map(|c| &c.state).collect();
    assert_eq!(states, vec![&json!(0), &json!(10), &json!(20)]);
}

#[tokio::test]
async fn test_failed_step_body_writes_no_checkpoint() {
    let ctx = TestContext::new().await;
    let calls = Arc::new(AtomicU32::new(0));

    let calls_in_handler = calls.clone();
    ctx.dray.register_task(
        TaskSpec::new("flaky-step").with_default_max_attempts(2),
        move |_: Value, ctx| {
            let calls = calls_in_handler.clone();
            async move {
                let value = ctx
                    .step("flaky", || async move {
                        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        if call == 1 {
                            Err(TaskError::msg("first call fails"))
                        } else {
                            Ok(call)
                        }
                    })
                    .await?;
                Ok(json!({ "value": value }))
            }
        },
    );

    let handle = ctx
        .dray
        .spawn("flaky-step", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");

    assert_eq!(ctx.drain().await, 1);
    // No checkpoint after the failed body; the step retries on attempt 2.
    assert!(ctx.dray.get_checkpoints(handle.task_id).await.unwrap().is_empty());

    ctx.advance(Duration::from_secs(2));
    assert_eq!(ctx.drain().await, 1);

    let task = ctx.dray.get_task(handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.completed_payload, Some(json!({ "value": 2 })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_child_spawn_recorded_in_step_survives_retry() {
    let ctx = TestContext::new().await;

    ctx.dray
        .register_task(TaskSpec::new("child"), |params: Value, _ctx| async move {
            Ok(json!({ "echo": params }))
        });

    ctx.dray.register_task(
        TaskSpec::new("parent").with_default_max_attempts(2),
        |_: Value, ctx| async move {
            let child_ctx = ctx.clone();
            let child_id = ctx
                .step("spawn-child", || async move {
                    let handle = child_ctx
                        .spawn_child("child", json!({ "from": "parent" }), SpawnOptions::default())
                        .await?;
                    Ok(handle.task_id)
                })
                .await?;
            if ctx.attempt() == 1 {
                return Err(TaskError::msg("crash after spawning child"));
            }
            Ok(json!({ "child": child_id }))
        },
    );

    let handle = ctx
        .dray
        .spawn("parent", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");

    // Attempt 1 spawns the child and fails.
    assert_eq!(ctx.drain().await, 1);
    // The child was enqueued during the parent's run; it completes next.
    assert_eq!(ctx.drain().await, 1);
    ctx.advance(Duration::from_secs(2));
    // Attempt 2 replays the spawn step without creating a second child.
    assert_eq!(ctx.drain().await, 1);

    let task = ctx.dray.get_task(handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);
    let child_id: uuid::Uuid =
        serde_json::from_value(task.completed_payload.unwrap()["child"].clone()).unwrap();

    let child = ctx.dray.get_task(child_id).await.unwrap().unwrap();
    assert_eq!(child.state, TaskState::Completed);
    assert_eq!(child.completed_payload, Some(json!({ "echo": { "from": "parent" } })));

    // Exactly one child exists: a second one would still be pending.
    assert_eq!(
        ctx.dray.work_batch(WORKER, CLAIM, 16).await.unwrap(),
        0,
        "no stray child task should remain"
    );
}
