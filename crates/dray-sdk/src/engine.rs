// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution engine: runs a claimed task through its handler and persists
//! the outcome.
//!
//! The engine never writes a completion or failure for a run it no longer
//! owns. `NotOwner` from the store is recoverable: the run is abandoned
//! and the next claim cycle re-dispatches it. Durable writes are retried a
//! small fixed number of times before the run is abandoned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dray_store::{ClaimedTask, FailureReason, StoreError, TaskStore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::TaskContext;
use crate::error::{Result, SdkError};
use crate::lease::ClaimLease;
use crate::registry::TaskRegistry;
use crate::signal::TaskError;

const DURABLE_WRITE_ATTEMPTS: u32 = 3;
const DURABLE_WRITE_DELAY: Duration = Duration::from_millis(100);

/// How a claimed run ended, from the executing worker's point of view.
#[derive(Debug)]
pub(crate) enum RunOutcome {
    /// The handler returned and the result was persisted.
    Completed,
    /// The handler suspended; the run is parked in the store.
    Suspended,
    /// The handler failed and the failure was persisted.
    Failed(FailureReason),
    /// The claim lapsed or moved to another worker; nothing was written.
    LeaseLost,
}

/// Shared executor handed to the worker loop and one-shot entry points.
pub(crate) struct Executor {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
}

impl Executor {
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<TaskRegistry>) -> Self {
        Self { store, registry }
    }

    /// Execute one claimed run to an outcome.
    ///
    /// With `use_lease` the claim is kept alive by a background extension
    /// task and the handler is cancelled on fatal lease loss.
    pub async fn execute(
        &self,
        queue: &str,
        claimed: ClaimedTask,
        claim_timeout: Duration,
        worker_id: &str,
        use_lease: bool,
    ) -> Result<RunOutcome> {
        let lease = use_lease.then(|| {
            ClaimLease::start(
                self.store.clone(),
                queue.to_string(),
                claimed.run_id,
                worker_id.to_string(),
                claim_timeout,
            )
        });
        let result = self.drive(queue, claimed, worker_id, lease.as_ref()).await;
        if let Some(lease) = lease {
            lease.stop().await;
        }
        result
    }

    async fn drive(
        &self,
        queue: &str,
        claimed: ClaimedTask,
        worker_id: &str,
        lease: Option<&ClaimLease>,
    ) -> Result<RunOutcome> {
        let Some(registration) = self.registry.get(&claimed.task_name) else {
            warn!(
                queue = %queue,
                task = %claimed.task_name,
                run_id = %claimed.run_id,
                "No handler registered for claimed task"
            );
            return self
                .persist_failure(
                    queue,
                    claimed.run_id,
                    worker_id,
                    FailureReason::new("Task not registered"),
                )
                .await;
        };

        let ctx = TaskContext::new(
            queue,
            claimed.task_id,
            claimed.run_id,
            claimed.attempt,
            self.store.clone(),
            self.registry.clone(),
        );
        let handler_future = (registration.handler)(claimed.params, ctx);

        let handler_result = match lease {
            Some(lease) => {
                tokio::select! {
                    biased;
                    _ = lease.lost() => {
                        warn!(run_id = %claimed.run_id, "Execution cancelled on lease loss");
                        return Ok(RunOutcome::LeaseLost);
                    }
                    result = handler_future => result,
                }
            }
            None => handler_future.await,
        };
        if lease.is_some_and(ClaimLease::is_lost) {
            return Ok(RunOutcome::LeaseLost);
        }

        match handler_result {
            Ok(value) => {
                let write = retry_durable_write("complete_run", claimed.run_id, || {
                    self.store
                        .complete_run(queue, claimed.run_id, worker_id, value.clone())
                })
                .await;
                match write {
                    Ok(()) => {
                        debug!(run_id = %claimed.run_id, "Run completed");
                        Ok(RunOutcome::Completed)
                    }
                    Err(err) if err.is_not_owner() => {
                        warn!(run_id = %claimed.run_id, "Completion dropped, run no longer owned");
                        Ok(RunOutcome::LeaseLost)
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Err(TaskError::Suspended(suspension)) => {
                debug!(run_id = %claimed.run_id, suspension = ?suspension, "Run suspended");
                Ok(RunOutcome::Suspended)
            }
            Err(TaskError::Store(err)) => {
                // A datastore failure mid-handler is not a handler failure.
                // Abandon the run; its claim lapses and it is re-dispatched.
                warn!(
                    run_id = %claimed.run_id,
                    error = %err,
                    "Abandoning run after datastore failure"
                );
                Err(err.into())
            }
            Err(err) => {
                let reason = match err {
                    TaskError::Failed { message, stack } => FailureReason { message, stack },
                    other => FailureReason::new(other.to_string()),
                };
                self.persist_failure(queue, claimed.run_id, worker_id, reason)
                    .await
            }
        }
    }

    async fn persist_failure(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        reason: FailureReason,
    ) -> Result<RunOutcome> {
        let write = retry_durable_write("fail_run", run_id, || {
            self.store.fail_run(queue, run_id, worker_id, reason.clone())
        })
        .await;
        match write {
            Ok(()) => Ok(RunOutcome::Failed(reason)),
            Err(err) if err.is_not_owner() => {
                warn!(run_id = %run_id, "Failure dropped, run no longer owned");
                Ok(RunOutcome::LeaseLost)
            }
            Err(err) => Err(SdkError::Store(err)),
        }
    }
}

/// Retry a durable store write a few times before giving up. `NotOwner`
/// is never retried; it means the run has moved on.
async fn retry_durable_write<T, F, Fut>(
    operation: &str,
    run_id: Uuid,
    mut write: F,
) -> std::result::Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, StoreError>>,
{
    let mut last_error = None;
    for attempt in 1..=DURABLE_WRITE_ATTEMPTS {
        match write().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_not_owner() => return Err(err),
            Err(err) => {
                warn!(
                    run_id = %run_id,
                    operation = %operation,
                    attempt,
                    error = %err,
                    "Durable write failed"
                );
                last_error = Some(err);
                if attempt < DURABLE_WRITE_ATTEMPTS {
                    tokio::time::sleep(DURABLE_WRITE_DELAY).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or(StoreError::Database {
        operation: operation.to_string(),
        details: "durable write failed".to_string(),
    }))
}
