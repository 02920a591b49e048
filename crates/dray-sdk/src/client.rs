// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Public client for the Dray SDK.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dray_store::{
    CheckpointRecord, ClaimedTask, MemoryStore, PostgresStore, RunRecord, SpawnTask, StartAt,
    StoreError, TaskHandle, TaskRecord, TaskStore,
};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::DrayConfig;
use crate::context::TaskContext;
use crate::engine::{Executor, RunOutcome};
use crate::error::{Result, SdkError};
use crate::registry::{ErasedHandler, TaskRegistration, TaskRegistry, TaskSpec};
use crate::signal::TaskError;
use crate::types::SpawnOptions;
use crate::worker::{Worker, WorkerConfig, WorkerHandle};

/// Client for a Dray task store: spawns tasks, administers queues, and
/// hosts workers.
///
/// A client owns a task registry and a default queue. Handlers registered
/// on one client are invoked by the workers and one-shot entry points of
/// that client.
///
/// # Example
///
/// ```ignore
/// use dray_sdk::{Dray, DrayConfig, SpawnOptions, TaskSpec};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> dray_sdk::Result<()> {
///     let dray = Dray::connect(DrayConfig::from_env()?).await?;
///     dray.create_queue("default").await?;
///
///     dray.register_task(TaskSpec::new("double"), |params: serde_json::Value, ctx| async move {
///         let doubled = ctx
///             .step("double", || async move {
///                 Ok(params["value"].as_i64().unwrap_or(0) * 2)
///             })
///             .await?;
///         Ok(json!({ "doubled": doubled }))
///     });
///
///     dray.spawn("double", json!({ "value": 21 }), SpawnOptions::default())
///         .await?;
///     dray.work_batch("worker-1", std::time::Duration::from_secs(60), 1)
///         .await?;
///     Ok(())
/// }
/// ```
pub struct Dray {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    executor: Arc<Executor>,
    default_queue: String,
}

impl Dray {
    /// Create a client over an existing store.
    pub fn new(store: Arc<dyn TaskStore>, default_queue: impl Into<String>) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let executor = Arc::new(Executor::new(store.clone(), registry.clone()));
        Self {
            store,
            registry,
            executor,
            default_queue: default_queue.into(),
        }
    }

    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: DrayConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(StoreError::from)?;
        let store = PostgresStore::with_schema(pool, config.schema)?;
        info!(queue = %config.default_queue, "Connected to datastore");
        Ok(Self::new(Arc::new(store), config.default_queue))
    }

    /// Connect to PostgreSQL using `DRAY_*` environment variables.
    pub async fn from_env() -> Result<Self> {
        Self::connect(DrayConfig::from_env()?).await
    }

    /// Create a client over a fresh in-memory store. Intended for tests
    /// and embedded use.
    pub fn in_memory(default_queue: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryStore::new()), default_queue)
    }

    /// The underlying store, for administration beyond the default queue.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// The queue used when spawn options and registrations name none.
    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    // ========== Queue administration ==========

    /// Create a queue. Idempotent.
    #[instrument(skip(self))]
    pub async fn create_queue(&self, queue: &str) -> Result<()> {
        self.store.create_queue(queue).await?;
        Ok(())
    }

    /// Drop a queue and all its state. Tolerates a missing queue.
    #[instrument(skip(self))]
    pub async fn drop_queue(&self, queue: &str) -> Result<()> {
        self.store.drop_queue(queue).await?;
        Ok(())
    }

    /// List queues present in the store.
    pub async fn list_queues(&self) -> Result<Vec<String>> {
        Ok(self.store.list_queues().await?)
    }

    // ========== Registration & spawn ==========

    /// Register a task handler. Re-registering a name overwrites the
    /// previous registration; handlers already running keep the closure
    /// they resolved.
    pub fn register_task<P, R, F, Fut>(&self, spec: TaskSpec, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TaskError>> + Send + 'static,
    {
        let erased: ErasedHandler = Arc::new(
            move |params: Value,
                  ctx: TaskContext|
                  -> BoxFuture<'static, std::result::Result<Value, TaskError>> {
                match serde_json::from_value::<P>(params) {
                Ok(parsed) => {
                    let future = handler(parsed, ctx);
                    Box::pin(async move {
                        let result = future.await?;
                        Ok(serde_json::to_value(result)?)
                    })
                }
                Err(err) => Box::pin(async move { Err(TaskError::Serialization(err)) }),
            }
        });
        self.registry.register(
            spec.name,
            TaskRegistration {
                handler: erased,
                queue: spec.queue,
                default_max_attempts: spec.default_max_attempts,
            },
        );
    }

    /// Spawn a task.
    ///
    /// The effective queue is `options.queue`, else the registration's
    /// bound queue, else the client default. Spawning an unregistered name
    /// requires an explicit queue; a queue that disagrees with the bound
    /// queue is rejected.
    #[instrument(skip(self, params, options), fields(task = %name))]
    pub async fn spawn(
        &self,
        name: &str,
        params: impl Serialize,
        options: SpawnOptions,
    ) -> Result<TaskHandle> {
        let params = serde_json::to_value(params)?;
        let (queue, spawn) =
            resolve_spawn(&self.registry, &self.default_queue, name, params, options)?;
        let handle = self.store.spawn_task(&queue, spawn).await?;
        info!(queue = %queue, task_id = %handle.task_id, "Task spawned");
        Ok(handle)
    }

    // ========== Events ==========

    /// Emit an event on the default queue. The emission is cached until
    /// matching waiters consume it; parked waiters wake immediately.
    #[instrument(skip(self, payload), fields(event = %name))]
    pub async fn emit_event(&self, name: &str, payload: impl Serialize) -> Result<()> {
        let payload = serde_json::to_value(payload)?;
        self.store
            .emit_event(&self.default_queue, name, payload)
            .await?;
        Ok(())
    }

    // ========== Introspection ==========

    /// Fetch a task on the default queue, or `None` for an unknown id.
    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
        Ok(self.store.get_task(&self.default_queue, task_id).await?)
    }

    /// Fetch a run on the default queue, or `None` for an unknown id.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        Ok(self.store.get_run(&self.default_queue, run_id).await?)
    }

    /// List a task's checkpoints in write order.
    pub async fn get_checkpoints(&self, task_id: Uuid) -> Result<Vec<CheckpointRecord>> {
        Ok(self
            .store
            .get_checkpoints(&self.default_queue, task_id)
            .await?)
    }

    /// Cancel a non-terminal task. Returns false when the task had already
    /// reached a terminal state.
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool> {
        Ok(self.store.cancel_task(&self.default_queue, task_id).await?)
    }

    // ========== Execution ==========

    /// Claim up to `batch_size` eligible runs on the default queue.
    pub async fn claim_tasks(
        &self,
        batch_size: u32,
        claim_timeout: Duration,
        worker_id: &str,
    ) -> Result<Vec<ClaimedTask>> {
        Ok(self
            .store
            .claim_tasks(&self.default_queue, batch_size, claim_timeout, worker_id)
            .await?)
    }

    /// Execute one previously claimed run, keeping its claim alive while
    /// the handler runs. Handler failures are caught and persisted; a lost
    /// lease surfaces as [`SdkError::LeaseLost`].
    pub async fn execute_task(
        &self,
        claimed: ClaimedTask,
        claim_timeout: Duration,
        worker_id: &str,
    ) -> Result<()> {
        let run_id = claimed.run_id;
        match self
            .executor
            .execute(&self.default_queue, claimed, claim_timeout, worker_id, true)
            .await?
        {
            RunOutcome::LeaseLost => Err(SdkError::LeaseLost { run_id }),
            _ => Ok(()),
        }
    }

    /// One-shot batch: claim up to `batch_size` runs and execute them
    /// sequentially, without lease extension. Returns the number of claims
    /// processed.
    #[instrument(skip(self), fields(queue = %self.default_queue))]
    pub async fn work_batch(
        &self,
        worker_id: &str,
        claim_timeout: Duration,
        batch_size: u32,
    ) -> Result<usize> {
        let claims = self
            .store
            .claim_tasks(&self.default_queue, batch_size, claim_timeout, worker_id)
            .await?;
        let mut processed = 0;
        for claim in claims {
            let run_id = claim.run_id;
            let outcome = self
                .executor
                .execute(&self.default_queue, claim, claim_timeout, worker_id, false)
                .await?;
            if let RunOutcome::LeaseLost = outcome {
                warn!(run_id = %run_id, "Run lost during batch execution");
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Start a polling worker on the default queue.
    pub fn start_worker(&self, config: WorkerConfig) -> WorkerHandle {
        Worker::start(
            self.executor.clone(),
            self.store.clone(),
            self.default_queue.clone(),
            config,
        )
    }
}

/// Validate spawn options against the registry and build the store-level
/// spawn request. Shared by [`Dray::spawn`] and child spawns.
pub(crate) fn resolve_spawn(
    registry: &TaskRegistry,
    default_queue: &str,
    name: &str,
    params: Value,
    options: SpawnOptions,
) -> Result<(String, SpawnTask)> {
    let registration = registry.get(name);
    if registration.is_none() && options.queue.is_none() {
        return Err(SdkError::UnregisteredTask {
            name: name.to_string(),
        });
    }
    let bound_queue = registration.as_ref().and_then(|r| r.queue.clone());
    if let (Some(bound), Some(requested)) = (bound_queue.as_deref(), options.queue.as_deref()) {
        if bound != requested {
            return Err(SdkError::QueueMismatch {
                name: name.to_string(),
                bound: bound.to_string(),
                requested: requested.to_string(),
            });
        }
    }
    let queue = options
        .queue
        .or(bound_queue)
        .unwrap_or_else(|| default_queue.to_string());

    let max_attempts = options
        .max_attempts
        .or_else(|| registration.as_ref().and_then(|r| r.default_max_attempts))
        .unwrap_or(1);

    // An absolute start time wins over a relative delay.
    let start_at = match (options.run_at, options.run_after) {
        (Some(at), _) => StartAt::At(at),
        (None, Some(delay)) => StartAt::After(delay),
        (None, None) => StartAt::Now,
    };

    Ok((
        queue,
        SpawnTask {
            task_name: name.to_string(),
            params,
            headers: options
                .headers
                .unwrap_or_else(|| Value::Object(Default::default())),
            retry_strategy: options.retry_strategy,
            max_attempts,
            cancellation: options.cancellation,
            start_at,
        },
    ))
}
