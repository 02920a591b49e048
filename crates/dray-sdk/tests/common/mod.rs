// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for dray-sdk integration tests.
//!
//! Provides a TestContext wrapping a client over an in-memory store with a
//! controllable clock.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dray_sdk::{Dray, MemoryStore, TaskState};
use uuid::Uuid;

/// Worker identity used by the one-shot batch helpers.
pub const WORKER: &str = "test-worker";

/// Claim timeout used by the one-shot batch helpers.
pub const CLAIM: Duration = Duration::from_secs(60);

/// Test context: a client over an in-memory store plus direct access to
/// the store for clock control.
pub struct TestContext {
    pub dray: Dray,
    pub store: Arc<MemoryStore>,
}

impl TestContext {
    /// Create a context with a freshly created queue named "default".
    pub async fn new() -> Self {
        Self::with_queue("default").await
    }

    /// Create a context with a freshly created queue.
    pub async fn with_queue(queue: &str) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let dray = Dray::new(store.clone(), queue);
        dray.create_queue(queue)
            .await
            .expect("failed to create test queue");
        Self { dray, store }
    }

    /// Run one work batch with the shared worker identity.
    pub async fn drain(&self) -> usize {
        self.dray
            .work_batch(WORKER, CLAIM, 16)
            .await
            .expect("work batch failed")
    }

    /// Advance the store clock.
    pub fn advance(&self, by: Duration) {
        self.store.advance(by);
    }

    /// Poll until the task reaches the expected state or the timeout
    /// elapses. Panics on timeout.
    pub async fn wait_for_state(&self, task_id: Uuid, state: TaskState, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self
                .dray
                .get_task(task_id)
                .await
                .expect("get_task failed")
                .expect("task exists");
            if task.state == state {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {} did not reach {:?} within {:?}, still {:?}",
                task_id,
                state,
                timeout,
                task.state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
