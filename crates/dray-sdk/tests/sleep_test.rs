// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable timers: parking, wake on deadline, and replay without
//! re-sleeping.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::TestContext;
use dray_sdk::{SpawnOptions, TaskError, TaskSpec, TaskState};
use serde_json::{json, Value};

#[tokio::test]
async fn test_sleep_parks_until_deadline() {
    let ctx = TestContext::new().await;
    let after_sleep = Arc::new(AtomicU32::new(0));

    let after = after_sleep.clone();
    ctx.dray
        .register_task(TaskSpec::new("napper"), move |_: Value, ctx| {
            let after = after.clone();
            async move {
                ctx.sleep(Duration::from_secs(30)).await?;
                after.fetch_add(1, Ordering::SeqCst);
                Ok(json!("woke up"))
            }
        });

    let handle = ctx
        .dray
        .spawn("napper", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");

    // First batch parks the run until the deadline.
    assert_eq!(ctx.drain().await, 1);
    let task = ctx.dray.get_task(handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Sleeping);
    let run = ctx.dray.get_run(handle.run_id).await.unwrap().unwrap();
    assert_eq!(run.state, TaskState::Sleeping);
    assert!(run.available_at.is_some());
    assert!(run.wake_event.is_none());
    assert_eq!(after_sleep.load(Ordering::SeqCst), 0);

    // Not claimable before the deadline.
    ctx.advance(Duration::from_secs(10));
    assert_eq!(ctx.drain().await, 0);

    // Claimable after; the same run resumes past the sleep.
    ctx.advance(Duration::from_secs(21));
    assert_eq!(ctx.drain().await, 1);
    let task = ctx.dray.get_task(handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.completed_payload, Some(json!("woke up")));
    assert_eq!(after_sleep.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_completed_sleep_is_not_repeated_on_retry() {
    let ctx = TestContext::new().await;

    ctx.dray.register_task(
        TaskSpec::new("nap-then-crash").with_default_max_attempts(2),
        |_: Value, ctx| async move {
            ctx.sleep(Duration::from_secs(30)).await?;
            if ctx.attempt() == 1 {
                return Err(TaskError::msg("crash after waking"));
            }
            Ok(json!("done"))
        },
    );

    let handle = ctx
        .dray
        .spawn("nap-then-crash", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");

    assert_eq!(ctx.drain().await, 1);
    ctx.advance(Duration::from_secs(31));
    // Wakes, then crashes.
    assert_eq!(ctx.drain().await, 1);

    // The retry replays the elapsed sleep immediately: only the backoff
    // delay gates it, not another 30 seconds.
    ctx.advance(Duration::from_secs(2));
    assert_eq!(ctx.drain().await, 1);

    let task = ctx.dray.get_task(handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.attempts, 2);
}

#[tokio::test]
async fn test_sequential_sleeps_park_twice() {
    let ctx = TestContext::new().await;

    ctx.dray
        .register_task(TaskSpec::new("two-naps"), |_: Value, ctx| async move {
            ctx.sleep(Duration::from_secs(10)).await?;
            ctx.sleep(Duration::from_secs(10)).await?;
            Ok(json!("done"))
        });

    let handle = ctx
        .dray
        .spawn("two-naps", json!({}), SpawnOptions::default())
        .await
        .expect("spawn");

    assert_eq!(ctx.drain().await, 1);
    ctx.advance(Duration::from_secs(11));
    // Resumes, passes the first sleep, parks on the second.
    assert_eq!(ctx.drain().await, 1);
    let task = ctx.dray.get_task(handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Sleeping);

    ctx.advance(Duration::from_secs(11));
    assert_eq!(ctx.drain().await, 1);
    let task = ctx.dray.get_task(handle.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);
}
