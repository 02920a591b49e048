// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polling worker loop.
//!
//! The worker claims eligible runs in batches bounded by a concurrency
//! semaphore and dispatches each to the execution engine with its own
//! claim lease. Run errors are routed to the `on_error` callback and never
//! stop the loop, except for a fatal lease loss when
//! `fatal_on_lease_timeout` is set.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dray_store::{ClaimedTask, TaskStore};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{Executor, RunOutcome};
use crate::error::SdkError;
use crate::types::ErrorContext;

/// Callback invoked with every error surfaced by the worker.
pub type ErrorHandler = Arc<dyn Fn(SdkError, Option<ErrorContext>) + Send + Sync>;

/// Worker loop configuration.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Maximum handler invocations in flight at once.
    pub concurrency: usize,
    /// Sleep between polls when no work was claimed.
    pub poll_interval: Duration,
    /// Claim duration requested on each claim and lease extension.
    pub claim_timeout: Duration,
    /// Shut the worker down when a claim lease is fatally lost. When
    /// false, the affected run is abandoned and the worker continues.
    pub fatal_on_lease_timeout: bool,
    /// Identity reported to the store for claims and extensions.
    pub worker_id: String,
    /// Callback for errors surfaced by the loop and by individual runs.
    pub on_error: Option<ErrorHandler>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            claim_timeout: Duration::from_secs(60),
            fatal_on_lease_timeout: true,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            on_error: None,
        }
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("concurrency", &self.concurrency)
            .field("poll_interval", &self.poll_interval)
            .field("claim_timeout", &self.claim_timeout)
            .field("fatal_on_lease_timeout", &self.fatal_on_lease_timeout)
            .field("worker_id", &self.worker_id)
            .field("on_error", &self.on_error.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    done: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop polling, wait for in-flight runs to reach a terminal or
    /// suspended state, and return.
    pub async fn close(self) {
        self.shutdown.cancel();
        let _ = self.done.await;
    }

    /// Returns true once the loop has exited, which happens on `close()`
    /// or on a fatal lease loss.
    pub fn is_finished(&self) -> bool {
        self.done.is_finished()
    }
}

pub(crate) struct Worker {
    executor: Arc<Executor>,
    store: Arc<dyn TaskStore>,
    queue: String,
    config: WorkerConfig,
}

impl Worker {
    pub fn start(
        executor: Arc<Executor>,
        store: Arc<dyn TaskStore>,
        queue: String,
        mut config: WorkerConfig,
    ) -> WorkerHandle {
        config.concurrency = config.concurrency.max(1);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let worker = Worker {
            executor,
            store,
            queue,
            config,
        };
        let done = tokio::spawn(async move { worker.run(token).await });
        WorkerHandle { shutdown, done }
    }

    async fn run(self, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let fatal = CancellationToken::new();
        info!(
            queue = %self.queue,
            worker_id = %self.config.worker_id,
            concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker started"
        );

        loop {
            if shutdown.is_cancelled() || fatal.is_cancelled() {
                break;
            }

            let available = semaphore.available_permits();
            if available == 0 {
                // All slots busy; wait for one to free before polling again.
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = fatal.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => drop(permit),
                }
                continue;
            }

            let claimed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = fatal.cancelled() => break,
                result = self.store.claim_tasks(
                    &self.queue,
                    available as u32,
                    self.config.claim_timeout,
                    &self.config.worker_id,
                ) => result,
            };

            match claimed {
                Ok(claims) if claims.is_empty() => self.idle(&shutdown, &fatal).await,
                Ok(claims) => {
                    debug!(queue = %self.queue, count = claims.len(), "Dispatching claims");
                    for claim in claims {
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            break;
                        };
                        let executor = self.executor.clone();
                        let queue = self.queue.clone();
                        let claim_timeout = self.config.claim_timeout;
                        let worker_id = self.config.worker_id.clone();
                        let fatal_on_lease = self.config.fatal_on_lease_timeout;
                        let fatal = fatal.clone();
                        let on_error = self.config.on_error.clone();
                        tokio::spawn(async move {
                            run_one(
                                executor,
                                queue,
                                claim,
                                claim_timeout,
                                worker_id,
                                fatal_on_lease,
                                fatal,
                                on_error,
                            )
                            .await;
                            drop(permit);
                        });
                    }
                }
                Err(err) => {
                    report(&self.config.on_error, SdkError::Store(err), None);
                    self.idle(&shutdown, &fatal).await;
                }
            }
        }

        // Drain: wait for every in-flight run to finish or suspend.
        let _ = semaphore.acquire_many(concurrency as u32).await;
        info!(queue = %self.queue, worker_id = %self.config.worker_id, "Worker stopped");
    }

    async fn idle(&self, shutdown: &CancellationToken, fatal: &CancellationToken) {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {}
            _ = fatal.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    executor: Arc<Executor>,
    queue: String,
    claim: ClaimedTask,
    claim_timeout: Duration,
    worker_id: String,
    fatal_on_lease: bool,
    fatal: CancellationToken,
    on_error: Option<ErrorHandler>,
) {
    let ctx = ErrorContext {
        queue: queue.clone(),
        task_id: claim.task_id,
        run_id: claim.run_id,
        task_name: claim.task_name.clone(),
    };
    match executor
        .execute(&queue, claim, claim_timeout, &worker_id, true)
        .await
    {
        Ok(RunOutcome::Completed) | Ok(RunOutcome::Suspended) => {}
        Ok(RunOutcome::Failed(reason)) => {
            report(
                &on_error,
                SdkError::Handler {
                    message: reason.message,
                    stack: reason.stack,
                },
                Some(ctx),
            );
        }
        Ok(RunOutcome::LeaseLost) => {
            let run_id = ctx.run_id;
            report(&on_error, SdkError::LeaseLost { run_id }, Some(ctx));
            if fatal_on_lease {
                error!(run_id = %run_id, "Lease lost, shutting worker down");
                fatal.cancel();
            } else {
                warn!(run_id = %run_id, "Lease lost, run abandoned");
            }
        }
        Err(err) => report(&on_error, err, Some(ctx)),
    }
}

fn report(on_error: &Option<ErrorHandler>, err: SdkError, ctx: Option<ErrorContext>) {
    match on_error {
        Some(callback) => callback(err, ctx),
        None => match &ctx {
            Some(ctx) => error!(
                queue = %ctx.queue,
                run_id = %ctx.run_id,
                task = %ctx.task_name,
                error = %err,
                "Run error"
            ),
            None => error!(error = %err, "Worker error"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.claim_timeout, Duration::from_secs(60));
        assert!(config.fatal_on_lease_timeout);
        assert!(config.worker_id.starts_with("worker-"));
        assert!(config.on_error.is_none());
    }

    #[test]
    fn test_config_debug_hides_callback() {
        let config = WorkerConfig {
            on_error: Some(Arc::new(|_, _| {})),
            ..WorkerConfig::default()
        };
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("<callback>"));
    }
}
