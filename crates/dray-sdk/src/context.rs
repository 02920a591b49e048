// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run step context passed to task handlers.
//!
//! The context mediates every durable effect a handler performs: named
//! steps with write-once checkpoints, durable event waits, durable timers,
//! and child spawns. Handlers must be deterministic in step order and step
//! names; values that vary between executions (time, randomness, remote
//! responses) belong inside step bodies so replays observe the cached
//! result instead of recomputing it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dray_store::{SuspendOutcome, TaskHandle, TaskStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::client::resolve_spawn;
use crate::registry::TaskRegistry;
use crate::signal::{Suspension, TaskError};
use crate::types::SpawnOptions;

/// Handle exposed to a handler for the duration of one run.
///
/// Cloning is cheap; the clone shares the run's step counters.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    queue: String,
    task_id: Uuid,
    run_id: Uuid,
    attempt: u32,
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    name_counts: Mutex<HashMap<String, u32>>,
}

impl TaskContext {
    pub(crate) fn new(
        queue: impl Into<String>,
        task_id: Uuid,
        run_id: Uuid,
        attempt: u32,
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                queue: queue.into(),
                task_id,
                run_id,
                attempt,
                store,
                registry,
                name_counts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The task this run belongs to.
    pub fn task_id(&self) -> Uuid {
        self.inner.task_id
    }

    /// The current run.
    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// 1-based attempt number of the current run.
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    /// The queue the task lives on.
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Canonical name for the k-th occurrence of `name` within this run:
    /// `name` the first time, `name#k` after that. Occurrence counting
    /// restarts each run, so a deterministic handler produces the same
    /// canonical names on every execution.
    async fn canonical_name(&self, name: &str) -> String {
        let mut counts = self.inner.name_counts.lock().await;
        let count = counts.entry(name.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            name.to_string()
        } else {
            format!("{}#{}", name, count)
        }
    }

    /// Run a named step with a durably cached result.
    ///
    /// On a checkpoint hit the stored value is returned and `body` is not
    /// executed. On a miss, `body` runs; its value is checkpointed once on
    /// success, while an error propagates unchanged and writes nothing, so
    /// the next run retries the step.
    pub async fn step<T, F, Fut>(&self, name: &str, body: F) -> Result<T, TaskError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let checkpoint_name = self.canonical_name(name).await;
        let existing = self
            .inner
            .store
            .read_checkpoint(&self.inner.queue, self.inner.task_id, &checkpoint_name)
            .await?;
        if let Some(checkpoint) = existing {
            debug!(
                task_id = %self.inner.task_id,
                step = %checkpoint_name,
                "Step replayed from checkpoint"
            );
            return Ok(serde_json::from_value(checkpoint.state)?);
        }

        let value = body().await?;
        let state = serde_json::to_value(&value)?;
        self.inner
            .store
            .write_checkpoint(
                &self.inner.queue,
                self.inner.task_id,
                &checkpoint_name,
                state,
                self.inner.run_id,
            )
            .await?;
        debug!(
            task_id = %self.inner.task_id,
            step = %checkpoint_name,
            "Step executed and checkpointed"
        );
        Ok(value)
    }

    /// Wait durably for a named event.
    ///
    /// Returns immediately when a matching emission is already cached (or
    /// this wait was satisfied on an earlier execution); otherwise the run
    /// is parked against the event and the suspension signal is raised.
    /// Delivery is recorded as a checkpoint under the wait key, so retries
    /// replay the same payload.
    pub async fn await_event<T: DeserializeOwned>(&self, name: &str) -> Result<T, TaskError> {
        let wait_key = self.canonical_name(&format!("$event:{}", name)).await;
        let outcome = self
            .inner
            .store
            .suspend_for_event(
                &self.inner.queue,
                self.inner.task_id,
                self.inner.run_id,
                &wait_key,
                name,
            )
            .await?;
        match outcome {
            SuspendOutcome::Cached(payload) => Ok(serde_json::from_value(payload)?),
            SuspendOutcome::Parked => Err(TaskError::Suspended(Suspension::Event {
                name: name.to_string(),
            })),
        }
    }

    /// Sleep durably for the given duration, measured on the store clock.
    ///
    /// Returns immediately on the execution that follows the wake (and on
    /// later retries); otherwise the run is parked until the deadline and
    /// the suspension signal is raised.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        let wait_key = self.canonical_name("$sleep").await;
        let outcome = self
            .inner
            .store
            .suspend_for_sleep(
                &self.inner.queue,
                self.inner.task_id,
                self.inner.run_id,
                &wait_key,
                duration,
            )
            .await?;
        match outcome {
            SuspendOutcome::Cached(_) => Ok(()),
            SuspendOutcome::Parked => Err(TaskError::Suspended(Suspension::Sleep { duration })),
        }
    }

    /// Spawn a child task and return its handle.
    ///
    /// The spawn itself is transactional but not replay-safe on its own:
    /// wrap it in a [`step`](Self::step) that records the returned ids so a
    /// retried run does not spawn a second child.
    pub async fn spawn_child(
        &self,
        name: &str,
        params: impl Serialize,
        options: SpawnOptions,
    ) -> Result<TaskHandle, TaskError> {
        let params = serde_json::to_value(params)?;
        let (queue, spawn) = resolve_spawn(
            &self.inner.registry,
            &self.inner.queue,
            name,
            params,
            options,
        )
        .map_err(|err| match err {
            crate::error::SdkError::Store(e) => TaskError::Store(e),
            other => TaskError::msg(other.to_string()),
        })?;
        let handle = self.inner.store.spawn_task(&queue, spawn).await?;
        debug!(
            parent = %self.inner.task_id,
            child = %handle.task_id,
            task = %name,
            "Child task spawned"
        );
        Ok(handle)
    }
}
