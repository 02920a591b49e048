// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory task store.
//!
//! Implements the same semantics as the PostgreSQL backend over plain
//! maps, for tests and embedded deployments. The store clock is real time
//! plus an adjustable skew, standing in for the database clock override
//! used by the SQL backend.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock as StdRwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::{
    validate_queue_name, CheckpointRecord, ClaimedTask, FailureReason, RunRecord, SpawnTask,
    StartAt, SuspendOutcome, TaskHandle, TaskRecord, TaskState, TaskStore,
};

struct RunSlot {
    record: RunRecord,
    seq: u64,
}

struct EventRow {
    id: i64,
    event_name: String,
    payload: Value,
    emitted_at: DateTime<Utc>,
    consumed_by: HashSet<Uuid>,
}

struct WaiterRow {
    task_id: Uuid,
    run_id: Uuid,
    event_name: String,
    wait_key: String,
}

#[derive(Default)]
struct QueueData {
    tasks: HashMap<Uuid, TaskRecord>,
    runs: HashMap<Uuid, RunSlot>,
    next_seq: u64,
    checkpoints: Vec<CheckpointRecord>,
    events: Vec<EventRow>,
    next_event_id: i64,
    waiters: Vec<WaiterRow>,
}

impl QueueData {
    fn checkpoint(&self, task_id: Uuid, name: &str) -> Option<&CheckpointRecord> {
        self.checkpoints
            .iter()
            .find(|c| c.task_id == task_id && c.checkpoint_name == name)
    }

    fn write_checkpoint_once(
        &mut self,
        task_id: Uuid,
        name: &str,
        state: Value,
        owner_run_id: Uuid,
        now: DateTime<Utc>,
    ) {
        if self.checkpoint(task_id, name).is_none() {
            self.checkpoints.push(CheckpointRecord {
                task_id,
                checkpoint_name: name.to_string(),
                state,
                owner_run_id,
                updated_at: now,
            });
        }
    }

    fn park(&mut self, run_id: Uuid, wake_event: Option<String>, available_at: Option<DateTime<Utc>>) {
        if let Some(slot) = self.runs.get_mut(&run_id) {
            slot.record.state = TaskState::Sleeping;
            slot.record.wake_event = wake_event;
            slot.record.available_at = available_at;
            slot.record.claimed_by = None;
            slot.record.claim_expires_at = None;
        }
    }
}

/// In-memory implementation of [`TaskStore`].
pub struct MemoryStore {
    queues: RwLock<HashMap<String, QueueData>>,
    skew: StdRwLock<chrono::Duration>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            skew: StdRwLock::new(chrono::Duration::zero()),
        }
    }

    /// The store clock: real time plus the configured skew.
    pub fn now(&self) -> DateTime<Utc> {
        let skew = self
            .skew
            .read()
            .map(|s| *s)
            .unwrap_or_else(|poisoned| *poisoned.into_inner());
        Utc::now() + skew
    }

    /// Advance the store clock. Test hook mirroring the database clock
    /// override of the SQL backend.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        match self.skew.write() {
            Ok(mut skew) => *skew = *skew + by,
            Err(poisoned) => {
                let mut skew = poisoned.into_inner();
                *skew = *skew + by;
            }
        }
    }

    /// Pin the store clock to an absolute instant.
    pub fn set_now(&self, at: DateTime<Utc>) {
        let skew = at - Utc::now();
        match self.skew.write() {
            Ok(mut guard) => *guard = skew,
            Err(poisoned) => *poisoned.into_inner() = skew,
        }
    }
}

fn queue_mut<'a>(
    queues: &'a mut HashMap<String, QueueData>,
    queue: &str,
) -> Result<&'a mut QueueData> {
    queues.get_mut(queue).ok_or_else(|| StoreError::QueueNotFound {
        queue: queue.to_string(),
    })
}

fn queue_ref<'a>(queues: &'a HashMap<String, QueueData>, queue: &str) -> Result<&'a QueueData> {
    queues.get(queue).ok_or_else(|| StoreError::QueueNotFound {
        queue: queue.to_string(),
    })
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        let mut queues = self.queues.write().await;
        queues.entry(queue.to_string()).or_default();
        debug!(queue = %queue, "Queue created");
        Ok(())
    }

    async fn drop_queue(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        let mut queues = self.queues.write().await;
        queues.remove(queue);
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<String>> {
        let queues = self.queues.read().await;
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn spawn_task(&self, queue: &str, spawn: SpawnTask) -> Result<TaskHandle> {
        let now = self.now();
        let mut queues = self.queues.write().await;
        let data = queue_mut(&mut queues, queue)?;

        let task_id = Uuid::new_v4();
        let run_id = Uuid::new_v4();
        let available_at = match spawn.start_at {
            StartAt::Now => now,
            StartAt::At(at) => at,
            StartAt::After(delay) => {
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
            }
        };

        data.tasks.insert(
            task_id,
            TaskRecord {
                task_id,
                task_name: spawn.task_name.clone(),
                params: spawn.params,
                headers: spawn.headers,
                retry_strategy: spawn.retry_strategy,
                max_attempts: spawn.max_attempts.max(1),
                cancellation: spawn.cancellation,
                state: TaskState::Pending,
                attempts: 1,
                enqueued_at: now,
                first_started_at: None,
                last_attempt_run: Some(run_id),
                completed_payload: None,
                cancelled_at: None,
            },
        );

        let seq = data.next_seq;
        data.next_seq += 1;
        data.runs.insert(
            run_id,
            RunSlot {
                seq,
                record: RunRecord {
                    run_id,
                    task_id,
                    attempt: 1,
                    state: TaskState::Pending,
                    claimed_by: None,
                    claim_expires_at: None,
                    available_at: Some(available_at),
                    wake_event: None,
                    event_payload: None,
                    started_at: None,
                    completed_at: None,
                    failed_at: None,
                    result: None,
                    failure_reason: None,
                },
            },
        );

        debug!(queue = %queue, task_id = %task_id, task = %spawn.task_name, "Task spawned");
        Ok(TaskHandle {
            task_id,
            run_id,
            attempt: 1,
        })
    }

    async fn emit_event(&self, queue: &str, event_name: &str, payload: Value) -> Result<()> {
        let now = self.now();
        let mut queues = self.queues.write().await;
        let data = queue_mut(&mut queues, queue)?;

        let id = data.next_event_id;
        data.next_event_id += 1;
        let mut consumed_by = HashSet::new();

        // Deliver to every parked waiter on this event, once per task.
        let woken: Vec<WaiterRow> = {
            let (matched, rest): (Vec<WaiterRow>, Vec<WaiterRow>) = data
                .waiters
                .drain(..)
                .partition(|w| w.event_name == event_name);
            data.waiters = rest;
            matched
        };
        for waiter in &woken {
            consumed_by.insert(waiter.task_id);
            data.write_checkpoint_once(
                waiter.task_id,
                &waiter.wait_key,
                payload.clone(),
                waiter.run_id,
                now,
            );
            if let Some(slot) = data.runs.get_mut(&waiter.run_id) {
                slot.record.available_at = Some(now);
                slot.record.wake_event = None;
                slot.record.event_payload = Some(payload.clone());
            }
            if let Some(task) = data.tasks.get_mut(&waiter.task_id) {
                task.state = TaskState::Pending;
            }
            debug!(queue = %queue, event = %event_name, run_id = %waiter.run_id, "Waiter woken");
        }

        data.events.push(EventRow {
            id,
            event_name: event_name.to_string(),
            payload,
            emitted_at: now,
            consumed_by,
        });
        Ok(())
    }

    async fn claim_tasks(
        &self,
        queue: &str,
        batch_size: u32,
        claim_timeout: Duration,
        worker_id: &str,
    ) -> Result<Vec<ClaimedTask>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let now = self.now();
        let expires = now
            + chrono::Duration::from_std(claim_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let mut queues = self.queues.write().await;
        let data = queue_mut(&mut queues, queue)?;

        let mut eligible: Vec<(DateTime<Utc>, u64, Uuid)> = data
            .runs
            .values()
            .filter_map(|slot| {
                let r = &slot.record;
                let ready = match r.state {
                    TaskState::Pending | TaskState::Sleeping => {
                        r.available_at.is_some_and(|at| at <= now)
                    }
                    TaskState::Running => r.claim_expires_at.is_some_and(|at| at <= now),
                    _ => false,
                };
                ready.then(|| {
                    (
                        r.available_at.unwrap_or(now),
                        slot.seq,
                        r.run_id,
                    )
                })
            })
            .collect();
        eligible.sort_by_key(|(available_at, seq, _)| (*available_at, *seq));
        eligible.truncate(batch_size as usize);

        let mut out = Vec::with_capacity(eligible.len());
        for (_, _, run_id) in eligible {
            let (task_id, attempt) = {
                let slot = match data.runs.get_mut(&run_id) {
                    Some(slot) => slot,
                    None => continue,
                };
                slot.record.state = TaskState::Running;
                slot.record.claimed_by = Some(worker_id.to_string());
                slot.record.claim_expires_at = Some(expires);
                slot.record.started_at.get_or_insert(now);
                slot.record.wake_event = None;
                (slot.record.task_id, slot.record.attempt)
            };
            let task = match data.tasks.get_mut(&task_id) {
                Some(task) => task,
                None => continue,
            };
            task.state = TaskState::Running;
            task.first_started_at.get_or_insert(now);
            out.push(ClaimedTask {
                task_id,
                run_id,
                attempt,
                task_name: task.task_name.clone(),
                params: task.params.clone(),
                headers: task.headers.clone(),
            });
        }
        debug!(queue = %queue, worker_id = %worker_id, count = out.len(), "Runs claimed");
        Ok(out)
    }

    async fn extend_claim(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        claim_timeout: Duration,
    ) -> Result<()> {
        let now = self.now();
        let mut queues = self.queues.write().await;
        let data = queue_mut(&mut queues, queue)?;

        let not_owner = || StoreError::NotOwner {
            run_id,
            worker_id: worker_id.to_string(),
        };
        let slot = data.runs.get_mut(&run_id).ok_or_else(not_owner)?;
        let r = &mut slot.record;
        let live = r.state == TaskState::Running
            && r.claimed_by.as_deref() == Some(worker_id)
            && r.claim_expires_at.is_some_and(|at| at > now);
        if !live {
            return Err(not_owner());
        }
        r.claim_expires_at = Some(
            now + chrono::Duration::from_std(claim_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero()),
        );
        Ok(())
    }

    async fn complete_run(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<()> {
        let now = self.now();
        let mut queues = self.queues.write().await;
        let data = queue_mut(&mut queues, queue)?;

        let slot = data
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound { run_id })?;
        let r = &mut slot.record;
        if r.state != TaskState::Running || r.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::NotOwner {
                run_id,
                worker_id: worker_id.to_string(),
            });
        }
        r.state = TaskState::Completed;
        r.completed_at = Some(now);
        r.result = Some(result.clone());
        r.claimed_by = None;
        r.claim_expires_at = None;
        let task_id = r.task_id;

        if let Some(task) = data.tasks.get_mut(&task_id) {
            task.state = TaskState::Completed;
            task.completed_payload = Some(result);
        }
        debug!(queue = %queue, run_id = %run_id, "Run completed");
        Ok(())
    }

    async fn fail_run(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        reason: FailureReason,
    ) -> Result<()> {
        let now = self.now();
        let mut queues = self.queues.write().await;
        let data = queue_mut(&mut queues, queue)?;

        let (task_id, attempt) = {
            let slot = data
                .runs
                .get_mut(&run_id)
                .ok_or(StoreError::RunNotFound { run_id })?;
            let r = &mut slot.record;
            if r.claimed_by.as_deref() != Some(worker_id) {
                return Err(StoreError::NotOwner {
                    run_id,
                    worker_id: worker_id.to_string(),
                });
            }
            r.state = TaskState::Failed;
            r.failed_at = Some(now);
            r.failure_reason = Some(reason);
            r.claimed_by = None;
            r.claim_expires_at = None;
            (r.task_id, r.attempt)
        };

        let (max_attempts, strategy) = match data.tasks.get(&task_id) {
            Some(task) => (
                task.max_attempts,
                task.retry_strategy.clone().unwrap_or_default(),
            ),
            None => return Err(StoreError::TaskNotFound { task_id }),
        };

        if attempt < max_attempts {
            let retry_run = Uuid::new_v4();
            let delay = strategy.delay_for_attempt(attempt);
            let available_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            let seq = data.next_seq;
            data.next_seq += 1;
            data.runs.insert(
                retry_run,
                RunSlot {
                    seq,
                    record: RunRecord {
                        run_id: retry_run,
                        task_id,
                        attempt: attempt + 1,
                        state: TaskState::Pending,
                        claimed_by: None,
                        claim_expires_at: None,
                        available_at: Some(available_at),
                        wake_event: None,
                        event_payload: None,
                        started_at: None,
                        completed_at: None,
                        failed_at: None,
                        result: None,
                        failure_reason: None,
                    },
                },
            );
            if let Some(task) = data.tasks.get_mut(&task_id) {
                task.state = TaskState::Pending;
                task.attempts = attempt + 1;
                task.last_attempt_run = Some(retry_run);
            }
            debug!(queue = %queue, run_id = %run_id, attempt, "Run failed, retry enqueued");
        } else {
            if let Some(task) = data.tasks.get_mut(&task_id) {
                task.state = TaskState::Failed;
            }
            debug!(queue = %queue, run_id = %run_id, attempt, "Run failed terminally");
        }
        Ok(())
    }

    async fn suspend_for_event(
        &self,
        queue: &str,
        task_id: Uuid,
        run_id: Uuid,
        wait_key: &str,
        event_name: &str,
    ) -> Result<SuspendOutcome> {
        let now = self.now();
        let mut queues = self.queues.write().await;
        let data = queue_mut(&mut queues, queue)?;

        // Replay of a wait that was already satisfied.
        if let Some(checkpoint) = data.checkpoint(task_id, wait_key) {
            return Ok(SuspendOutcome::Cached(checkpoint.state.clone()));
        }

        // Oldest cached emission this task has not consumed yet.
        let mut candidates: Vec<usize> = (0..data.events.len())
            .filter(|&i| {
                let e = &data.events[i];
                e.event_name == event_name && !e.consumed_by.contains(&task_id)
            })
            .collect();
        candidates.sort_by_key(|&i| (data.events[i].emitted_at, data.events[i].id));
        if let Some(&index) = candidates.first() {
            let payload = data.events[index].payload.clone();
            data.events[index].consumed_by.insert(task_id);
            data.write_checkpoint_once(task_id, wait_key, payload.clone(), run_id, now);
            debug!(queue = %queue, event = %event_name, run_id = %run_id, "Cached event consumed");
            return Ok(SuspendOutcome::Cached(payload));
        }

        // Nothing cached: park the run and release the claim.
        let already_waiting = data
            .waiters
            .iter()
            .any(|w| w.task_id == task_id && w.run_id == run_id && w.wait_key == wait_key);
        if !already_waiting {
            data.waiters.push(WaiterRow {
                task_id,
                run_id,
                event_name: event_name.to_string(),
                wait_key: wait_key.to_string(),
            });
        }
        data.park(run_id, Some(event_name.to_string()), None);
        if let Some(task) = data.tasks.get_mut(&task_id) {
            task.state = TaskState::Sleeping;
        }
        debug!(queue = %queue, event = %event_name, run_id = %run_id, "Run parked on event");
        Ok(SuspendOutcome::Parked)
    }

    async fn suspend_for_sleep(
        &self,
        queue: &str,
        task_id: Uuid,
        run_id: Uuid,
        wait_key: &str,
        duration: Duration,
    ) -> Result<SuspendOutcome> {
        let now = self.now();
        let mut queues = self.queues.write().await;
        let data = queue_mut(&mut queues, queue)?;

        if let Some(checkpoint) = data.checkpoint(task_id, wait_key) {
            return Ok(SuspendOutcome::Cached(checkpoint.state.clone()));
        }

        data.write_checkpoint_once(task_id, wait_key, Value::Null, run_id, now);
        let wake_at =
            now + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        data.park(run_id, None, Some(wake_at));
        if let Some(task) = data.tasks.get_mut(&task_id) {
            task.state = TaskState::Sleeping;
        }
        debug!(queue = %queue, run_id = %run_id, secs = duration.as_secs_f64(), "Run sleeping");
        Ok(SuspendOutcome::Parked)
    }

    async fn read_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
    ) -> Result<Option<CheckpointRecord>> {
        let queues = self.queues.read().await;
        let data = queue_ref(&queues, queue)?;
        Ok(data.checkpoint(task_id, name).cloned())
    }

    async fn write_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
        state: Value,
        owner_run_id: Uuid,
    ) -> Result<()> {
        let now = self.now();
        let mut queues = self.queues.write().await;
        let data = queue_mut(&mut queues, queue)?;
        data.write_checkpoint_once(task_id, name, state, owner_run_id, now);
        Ok(())
    }

    async fn get_checkpoints(&self, queue: &str, task_id: Uuid) -> Result<Vec<CheckpointRecord>> {
        let queues = self.queues.read().await;
        let data = queue_ref(&queues, queue)?;
        Ok(data
            .checkpoints
            .iter()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn get_task(&self, queue: &str, task_id: Uuid) -> Result<Option<TaskRecord>> {
        let queues = self.queues.read().await;
        let data = queue_ref(&queues, queue)?;
        Ok(data.tasks.get(&task_id).cloned())
    }

    async fn get_run(&self, queue: &str, run_id: Uuid) -> Result<Option<RunRecord>> {
        let queues = self.queues.read().await;
        let data = queue_ref(&queues, queue)?;
        Ok(data.runs.get(&run_id).map(|slot| slot.record.clone()))
    }

    async fn cancel_task(&self, queue: &str, task_id: Uuid) -> Result<bool> {
        let now = self.now();
        let mut queues = self.queues.write().await;
        let data = queue_mut(&mut queues, queue)?;

        let task = data
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound { task_id })?;
        if task.state.is_terminal() {
            return Ok(false);
        }
        task.state = TaskState::Cancelled;
        task.cancelled_at = Some(now);

        for slot in data.runs.values_mut() {
            let r = &mut slot.record;
            if r.task_id == task_id && !r.state.is_terminal() {
                r.state = TaskState::Cancelled;
                r.claimed_by = None;
                r.claim_expires_at = None;
                r.available_at = None;
                r.wake_event = None;
            }
        }
        data.waiters.retain(|w| w.task_id != task_id);
        debug!(queue = %queue, task_id = %task_id, "Task cancelled");
        Ok(true)
    }
}
