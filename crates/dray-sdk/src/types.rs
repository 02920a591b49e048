// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level types for the SDK.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dray_store::RetryStrategy;
use serde_json::Value;
use uuid::Uuid;

/// Options accepted when spawning a task.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Target queue. Must agree with the registration's bound queue when
    /// both are present.
    pub queue: Option<String>,
    /// Maximum number of runs; falls back to the registration's default,
    /// then to 1.
    pub max_attempts: Option<u32>,
    /// Absolute earliest claim time. Takes precedence over `run_after`.
    pub run_at: Option<DateTime<Utc>>,
    /// Delay before the task becomes claimable, measured on the store clock.
    pub run_after: Option<Duration>,
    /// Retry backoff override.
    pub retry_strategy: Option<RetryStrategy>,
    /// Opaque cancellation policy stored on the task.
    pub cancellation: Option<Value>,
    /// Arbitrary metadata stored on the task and returned with each claim.
    pub headers: Option<Value>,
}

impl SpawnOptions {
    /// Target a specific queue.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the maximum number of runs.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay the first run until an absolute timestamp.
    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Delay the first run by a duration.
    pub fn run_after(mut self, delay: Duration) -> Self {
        self.run_after = Some(delay);
        self
    }

    /// Override the retry backoff strategy.
    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    /// Attach headers to the task.
    pub fn with_headers(mut self, headers: Value) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Identifies the run an error was observed on, passed to `on_error`.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Queue the run belongs to.
    pub queue: String,
    /// Task id.
    pub task_id: Uuid,
    /// Run id.
    pub run_id: Uuid,
    /// Registered task name.
    pub task_name: String,
}
