// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dray SDK - durable task execution backed by a relational store.
//!
//! Producers spawn named tasks with structured parameters; workers claim
//! runs under expiring leases, execute handlers, checkpoint partial
//! progress, suspend on external events or timers, and resume. The
//! datastore is the source of truth for all task, run, checkpoint, and
//! event state; this crate is the client library that enqueues work, runs
//! handlers, and administers queues.
//!
//! # Features
//!
//! - **Replay-safe steps**: `ctx.step(name, body)` caches each step's
//!   result durably; retried runs skip already-completed steps
//! - **Durable waits**: `ctx.await_event(name)` and `ctx.sleep(duration)`
//!   park the run in the store and release the worker
//! - **Bounded retries**: failed runs are re-enqueued with backoff until
//!   `max_attempts` is exhausted
//! - **Crash failover**: claims expire; another worker picks up runs whose
//!   worker died mid-execution
//! - **Workers**: a polling loop with bounded concurrency, lease
//!   heartbeats, and graceful shutdown, plus one-shot batch execution
//!
//! # Quick Start
//!
//! ```ignore
//! use dray_sdk::{Dray, DrayConfig, SpawnOptions, TaskSpec, WorkerConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> dray_sdk::Result<()> {
//!     let dray = Dray::connect(DrayConfig::from_env()?).await?;
//!     dray.create_queue("default").await?;
//!
//!     dray.register_task(
//!         TaskSpec::new("welcome").with_default_max_attempts(3),
//!         |params: serde_json::Value, ctx| async move {
//!             let user = ctx
//!                 .step("load-user", || async move {
//!                     Ok(params["user_id"].clone())
//!                 })
//!                 .await?;
//!
//!             // Wait durably for an external confirmation event.
//!             let confirmation: serde_json::Value =
//!                 ctx.await_event("email-confirmed").await?;
//!
//!             Ok(json!({ "user": user, "confirmation": confirmation }))
//!         },
//!     );
//!
//!     dray.spawn("welcome", json!({ "user_id": 7 }), SpawnOptions::default())
//!         .await?;
//!
//!     let worker = dray.start_worker(WorkerConfig::default());
//!     // ... later
//!     worker.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Handler contract
//!
//! A handler is an async function `(params, ctx) -> Result<R, TaskError>`.
//! Handlers must be deterministic in step order and step names: the k-th
//! occurrence of a step name within a run maps to the canonical name
//! `name` (k = 1) or `name#k`, and those names are the replay cache keys
//! across retries. Values that differ between executions belong inside
//! step bodies.

mod client;
mod config;
mod context;
mod engine;
mod error;
mod lease;
mod registry;
mod signal;
mod types;
mod worker;

// Main types
pub use client::Dray;
pub use config::{DrayConfig, DEFAULT_QUEUE};
pub use context::TaskContext;
pub use error::{Result, SdkError};
pub use registry::TaskSpec;
pub use signal::{Suspension, TaskError};
pub use types::{ErrorContext, SpawnOptions};
pub use worker::{ErrorHandler, WorkerConfig, WorkerHandle};

// Re-export the store records and the adapter surface so most consumers
// depend on this crate alone.
pub use dray_store::{
    CheckpointRecord, ClaimedTask, FailureReason, MemoryStore, PostgresStore, RetryStrategy,
    RunRecord, SpawnTask, StartAt, StoreError, SuspendOutcome, TaskHandle, TaskRecord, TaskState,
    TaskStore,
};
