// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Datastore adapter for the Dray durable task SDK.
//!
//! This crate defines the storage abstraction the SDK executes against and
//! two backend implementations:
//!
//! - [`PostgresStore`]: per-queue tables in a dedicated schema, claim
//!   exclusivity via row-level locking, all time decisions made on the
//!   database clock
//! - [`MemoryStore`]: an in-process backend with a controllable clock,
//!   used for tests and embedded deployments
//!
//! The datastore is the source of truth for all task, run, checkpoint, and
//! event state. Every queue owns five tables: tasks (`t_<queue>`), runs
//! (`r_<queue>`), checkpoints (`c_<queue>`), events (`e_<queue>`), and
//! waiters (`w_<queue>`).

pub mod error;
pub mod memory;
pub mod postgres;

pub use self::error::{Result, StoreError};
pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state shared by tasks and runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Enqueued and waiting to be claimed.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Parked until an event arrives or a timer elapses.
    Sleeping,
    /// Finished successfully.
    Completed,
    /// Finished with a terminal failure.
    Failed,
    /// Cancelled before reaching a terminal state.
    Cancelled,
}

impl TaskState {
    /// Returns the string representation stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a state from its stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "sleeping" => Some(Self::Sleeping),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Returns true for completed, failed, and cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Retry backoff strategy persisted on a task.
///
/// The delay between a failed run and its retry is computed by the adapter
/// against the database clock, never from the worker's wall clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Constant delay between attempts.
    Fixed {
        /// Delay in seconds.
        seconds: f64,
    },
    /// Exponential backoff: `min(max, base * 2^(attempts-1))`, plus an
    /// optional jitter fraction added on top of the computed delay.
    Exponential {
        /// Base delay in seconds for the first retry.
        #[serde(default = "default_backoff_base")]
        base: f64,
        /// Upper bound on the delay in seconds.
        #[serde(default = "default_backoff_max")]
        max: f64,
        /// Jitter fraction in `[0, 1]`; 0 disables jitter.
        #[serde(default)]
        jitter: f64,
    },
}

fn default_backoff_base() -> f64 {
    1.0
}

fn default_backoff_max() -> f64 {
    60.0
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: default_backoff_base(),
            max: default_backoff_max(),
            jitter: 0.0,
        }
    }
}

impl RetryStrategy {
    /// Delay before the retry that follows the given failed attempt
    /// (1-based, so the first retry passes `attempts = 1`).
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let seconds = match self {
            Self::Fixed { seconds } => *seconds,
            Self::Exponential { base, max, jitter } => {
                let exponent = attempts.saturating_sub(1).min(62);
                let mut delay = (base * 2f64.powi(exponent as i32)).min(*max);
                if *jitter > 0.0 {
                    delay += delay * jitter * rand::random::<f64>();
                }
                delay
            }
        };
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

/// Persisted failure details for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Human-readable error message.
    pub message: String,
    /// Stack or backtrace text if one was captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl FailureReason {
    /// Create a failure reason with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

/// When a newly spawned task becomes claimable.
#[derive(Debug, Clone, Copy, Default)]
pub enum StartAt {
    /// Claimable immediately.
    #[default]
    Now,
    /// Claimable at an absolute timestamp.
    At(DateTime<Utc>),
    /// Claimable after a delay measured on the database clock.
    After(Duration),
}

/// Request to enqueue a new task.
#[derive(Debug, Clone)]
pub struct SpawnTask {
    /// Registered task name.
    pub task_name: String,
    /// Structured parameters passed to the handler.
    pub params: Value,
    /// Arbitrary metadata stored on the task and returned with each claim.
    pub headers: Value,
    /// Retry backoff override; the default strategy applies when absent.
    pub retry_strategy: Option<RetryStrategy>,
    /// Maximum number of runs before the task fails terminally.
    pub max_attempts: u32,
    /// Opaque cancellation policy stored on the task.
    pub cancellation: Option<Value>,
    /// When the first run becomes claimable.
    pub start_at: StartAt,
}

/// Identifiers returned when a task is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    /// The new task's id.
    pub task_id: Uuid,
    /// The first run's id.
    pub run_id: Uuid,
    /// Attempt number of that run, always 1 for a fresh spawn.
    pub attempt: u32,
}

/// A run handed to a worker by `claim_tasks`.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    /// Task the run belongs to.
    pub task_id: Uuid,
    /// The claimed run.
    pub run_id: Uuid,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Registered task name, used to look up the handler.
    pub task_name: String,
    /// Task parameters.
    pub params: Value,
    /// Task headers.
    pub headers: Value,
}

/// Result of an atomic suspend call.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspendOutcome {
    /// The wake condition was already satisfied; the payload is returned
    /// and the run keeps executing.
    Cached(Value),
    /// The run was parked and its claim released.
    Parked,
}

/// Task record as stored in `t_<queue>`.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Task id.
    pub task_id: Uuid,
    /// Registered task name.
    pub task_name: String,
    /// Structured parameters.
    pub params: Value,
    /// Arbitrary metadata.
    pub headers: Value,
    /// Retry backoff override.
    pub retry_strategy: Option<RetryStrategy>,
    /// Maximum number of runs.
    pub max_attempts: u32,
    /// Opaque cancellation policy.
    pub cancellation: Option<Value>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Number of runs created so far.
    pub attempts: u32,
    /// When the task was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When the first run started executing.
    pub first_started_at: Option<DateTime<Utc>>,
    /// The most recently created run.
    pub last_attempt_run: Option<Uuid>,
    /// Result of the handler on success.
    pub completed_payload: Option<Value>,
    /// When the task was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Run record as stored in `r_<queue>`.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Run id.
    pub run_id: Uuid,
    /// Task the run belongs to.
    pub task_id: Uuid,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Worker currently holding the claim.
    pub claimed_by: Option<String>,
    /// When the current claim lapses.
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// When the run becomes claimable; null while parked on an event.
    pub available_at: Option<DateTime<Utc>>,
    /// Event name the run is parked on.
    pub wake_event: Option<String>,
    /// Payload of the event that woke the run.
    pub event_payload: Option<Value>,
    /// When the run was first claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the run failed.
    pub failed_at: Option<DateTime<Utc>>,
    /// Handler result on success.
    pub result: Option<Value>,
    /// Failure details on failure.
    pub failure_reason: Option<FailureReason>,
}

/// Checkpoint record as stored in `c_<queue>`.
///
/// A checkpoint is written at most once per `(task_id, name)` and is
/// immutable for the remainder of the task.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    /// Task the checkpoint belongs to.
    pub task_id: Uuid,
    /// Canonical checkpoint name.
    pub checkpoint_name: String,
    /// Durably cached step state.
    pub state: Value,
    /// Run that wrote the checkpoint.
    pub owner_run_id: Uuid,
    /// When the checkpoint was written.
    pub updated_at: DateTime<Utc>,
}

/// Storage interface the SDK executes against.
///
/// This is the single boundary with the datastore; alternate backends
/// substitute here without touching the execution engine.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create the five tables backing a queue. Idempotent.
    async fn create_queue(&self, queue: &str) -> Result<()>;

    /// Drop a queue's tables. Tolerates a missing queue.
    async fn drop_queue(&self, queue: &str) -> Result<()>;

    /// List the queues present in the store.
    async fn list_queues(&self) -> Result<Vec<String>>;

    /// Enqueue a task and its first run.
    async fn spawn_task(&self, queue: &str, spawn: SpawnTask) -> Result<TaskHandle>;

    /// Record an event emission and wake any matching parked waiters.
    async fn emit_event(&self, queue: &str, event_name: &str, payload: Value) -> Result<()>;

    /// Claim up to `batch_size` eligible runs for `worker_id`, extending
    /// each claim to `claim_timeout` from now. Eligible runs are returned
    /// FIFO by `available_at`, ties broken by insertion order. Runs whose
    /// previous claim has lapsed are eligible again.
    async fn claim_tasks(
        &self,
        queue: &str,
        batch_size: u32,
        claim_timeout: Duration,
        worker_id: &str,
    ) -> Result<Vec<ClaimedTask>>;

    /// Extend a live claim. Fails with [`StoreError::NotOwner`] when the
    /// run is no longer claimed by `worker_id` or the claim has lapsed.
    async fn extend_claim(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        claim_timeout: Duration,
    ) -> Result<()>;

    /// Mark a run (and its task) completed with the handler's result.
    async fn complete_run(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<()>;

    /// Mark a run failed. Creates a retry run with a backed-off
    /// `available_at` while attempts remain; otherwise the task fails
    /// terminally.
    async fn fail_run(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        reason: FailureReason,
    ) -> Result<()>;

    /// Atomic event wait. Returns the payload when the wait key is already
    /// checkpointed or an unconsumed cached event matches; otherwise parks
    /// the run against the event and releases the claim.
    async fn suspend_for_event(
        &self,
        queue: &str,
        task_id: Uuid,
        run_id: Uuid,
        wait_key: &str,
        event_name: &str,
    ) -> Result<SuspendOutcome>;

    /// Atomic durable timer. Returns [`SuspendOutcome::Cached`] when the
    /// wait key is already checkpointed (the timer elapsed on an earlier
    /// execution); otherwise checkpoints the wait key and parks the run
    /// until the deadline, in one transaction.
    async fn suspend_for_sleep(
        &self,
        queue: &str,
        task_id: Uuid,
        run_id: Uuid,
        wait_key: &str,
        duration: Duration,
    ) -> Result<SuspendOutcome>;

    /// Read a checkpoint by canonical name.
    async fn read_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
    ) -> Result<Option<CheckpointRecord>>;

    /// Write a checkpoint. The first write wins; later writes for the same
    /// `(task_id, name)` are ignored.
    async fn write_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
        state: Value,
        owner_run_id: Uuid,
    ) -> Result<()>;

    /// List a task's checkpoints in write order.
    async fn get_checkpoints(&self, queue: &str, task_id: Uuid) -> Result<Vec<CheckpointRecord>>;

    /// Fetch a task, or `None` when the id is unknown.
    async fn get_task(&self, queue: &str, task_id: Uuid) -> Result<Option<TaskRecord>>;

    /// Fetch a run, or `None` when the id is unknown.
    async fn get_run(&self, queue: &str, run_id: Uuid) -> Result<Option<RunRecord>>;

    /// Cancel a non-terminal task and its current run, removing any
    /// waiters. Returns false when the task was already terminal.
    async fn cancel_task(&self, queue: &str, task_id: Uuid) -> Result<bool>;
}

/// Maximum queue name length; keeps prefixed table names well under the
/// PostgreSQL identifier limit.
pub const MAX_QUEUE_NAME_LEN: usize = 48;

/// Validate a queue name before it is interpolated into table names.
///
/// Names must start with a lowercase letter and contain only lowercase
/// letters, digits, and underscores.
pub fn validate_queue_name(queue: &str) -> Result<()> {
    let invalid = |reason: &str| StoreError::Validation {
        field: "queue".to_string(),
        message: format!("invalid queue name '{}': {}", queue, reason),
    };

    if queue.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if queue.len() > MAX_QUEUE_NAME_LEN {
        return Err(invalid("too long"));
    }
    let mut chars = queue.chars();
    let first = chars.next().unwrap_or('_');
    if !first.is_ascii_lowercase() {
        return Err(invalid("must start with a lowercase letter"));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(invalid(
            "only lowercase letters, digits, and underscores are allowed",
        ));
    }
    Ok(())
}
