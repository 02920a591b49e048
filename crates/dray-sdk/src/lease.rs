// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Claim lease manager.
//!
//! Each in-flight run gets a background task that periodically re-extends
//! the worker's claim so it outlives long handler executions. The
//! extension interval is a third of the claim timeout. A lease is fatally
//! lost when the store reports another owner, or when transient extension
//! failures persist long enough that the claim must have lapsed.

use std::sync::Arc;
use std::time::Duration;

use dray_store::TaskStore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle to the background extension task for one claimed run.
pub(crate) struct ClaimLease {
    cancel: CancellationToken,
    lost: CancellationToken,
    handle: JoinHandle<()>,
}

impl ClaimLease {
    /// Start extending the claim on `run_id` every `claim_timeout / 3`.
    pub fn start(
        store: Arc<dyn TaskStore>,
        queue: String,
        run_id: Uuid,
        worker_id: String,
        claim_timeout: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let lost = CancellationToken::new();
        let interval = claim_timeout / 3;
        // Declare the lease lost before the claim can actually lapse.
        let deadline = claim_timeout.saturating_sub(claim_timeout / 6);

        let cancel_token = cancel.clone();
        let lost_token = lost.clone();
        let handle = tokio::spawn(async move {
            let mut last_extended = Instant::now();
            loop {
                tokio::select! {
                    biased;

                    _ = cancel_token.cancelled() => {
                        debug!(run_id = %run_id, "Lease extension stopped");
                        break;
                    }

                    _ = tokio::time::sleep(interval) => {
                        match store.extend_claim(&queue, run_id, &worker_id, claim_timeout).await {
                            Ok(()) => {
                                last_extended = Instant::now();
                                debug!(run_id = %run_id, "Claim extended");
                            }
                            Err(err) if err.is_not_owner() => {
                                warn!(run_id = %run_id, error = %err, "Claim lost to another worker");
                                lost_token.cancel();
                                break;
                            }
                            Err(err) => {
                                warn!(run_id = %run_id, error = %err, "Claim extension failed");
                                if last_extended.elapsed() >= deadline {
                                    warn!(run_id = %run_id, "Claim presumed lapsed after repeated extension failures");
                                    lost_token.cancel();
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        Self {
            cancel,
            lost,
            handle,
        }
    }

    /// Resolves when the lease is fatally lost.
    pub fn lost(&self) -> WaitForCancellationFuture<'_> {
        self.lost.cancelled()
    }

    /// Returns true once the lease has been fatally lost.
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stop the extension task and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
