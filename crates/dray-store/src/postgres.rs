// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed task store.
//!
//! Each queue is a group of five tables in a dedicated schema: tasks
//! (`t_<queue>`), runs (`r_<queue>`), checkpoints (`c_<queue>`), events
//! (`e_<queue>`), and waiters (`w_<queue>`). Claim exclusivity relies on
//! `FOR UPDATE SKIP LOCKED`; no in-process locks are involved.
//!
//! Every durable time decision is made on the database clock. Tests may
//! override "now" process-wide through the `dray.now` session setting,
//! which all queries consult before falling back to `NOW()`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::{
    validate_queue_name, CheckpointRecord, ClaimedTask, FailureReason, RetryStrategy, RunRecord,
    SpawnTask, StartAt, SuspendOutcome, TaskHandle, TaskRecord, TaskState, TaskStore,
};

/// SQL expression for the store clock, honoring the `dray.now` override.
const NOW_SQL: &str = "COALESCE(NULLIF(current_setting('dray.now', TRUE), '')::timestamptz, NOW())";

/// Default schema holding all queue tables.
pub const DEFAULT_SCHEMA: &str = "dray";

/// PostgreSQL-backed implementation of [`TaskStore`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    schema: String,
}

/// Fully qualified table names for one queue.
struct QueueTables {
    tasks: String,
    runs: String,
    checkpoints: String,
    events: String,
    waiters: String,
}

impl PostgresStore {
    /// Create a store using the default schema.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: DEFAULT_SCHEMA.to_string(),
        }
    }

    /// Create a store using a custom schema name.
    pub fn with_schema(pool: PgPool, schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        if schema.is_empty()
            || !schema
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(StoreError::Validation {
                field: "schema".to_string(),
                message: format!("invalid schema name '{}'", schema),
            });
        }
        Ok(Self { pool, schema })
    }

    /// The schema this store operates in.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn tables(&self, queue: &str) -> Result<QueueTables> {
        validate_queue_name(queue)?;
        let qualified = |prefix: &str| format!("\"{}\".\"{}_{}\"", self.schema, prefix, queue);
        Ok(QueueTables {
            tasks: qualified("t"),
            runs: qualified("r"),
            checkpoints: qualified("c"),
            events: qualified("e"),
            waiters: qualified("w"),
        })
    }
}

fn parse_state(raw: &str) -> Result<TaskState> {
    TaskState::parse(raw).ok_or_else(|| StoreError::Database {
        operation: "decode".to_string(),
        details: format!("unknown state '{}'", raw),
    })
}

fn task_from_row(row: &PgRow) -> Result<TaskRecord> {
    let state: String = row.try_get("state")?;
    let retry_strategy: Option<Value> = row.try_get("retry_strategy")?;
    let retry_strategy = retry_strategy
        .map(serde_json::from_value::<RetryStrategy>)
        .transpose()?;
    Ok(TaskRecord {
        task_id: row.try_get("task_id")?,
        task_name: row.try_get("task_name")?,
        params: row.try_get("params")?,
        headers: row.try_get("headers")?,
        retry_strategy,
        max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
        cancellation: row.try_get("cancellation")?,
        state: parse_state(&state)?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        enqueued_at: row.try_get("enqueued_at")?,
        first_started_at: row.try_get("first_started_at")?,
        last_attempt_run: row.try_get("last_attempt_run")?,
        completed_payload: row.try_get("completed_payload")?,
        cancelled_at: row.try_get("cancelled_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<RunRecord> {
    let state: String = row.try_get("state")?;
    let failure_reason: Option<Value> = row.try_get("failure_reason")?;
    let failure_reason = failure_reason
        .map(serde_json::from_value::<FailureReason>)
        .transpose()?;
    Ok(RunRecord {
        run_id: row.try_get("run_id")?,
        task_id: row.try_get("task_id")?,
        attempt: row.try_get::<i32, _>("attempt")? as u32,
        state: parse_state(&state)?,
        claimed_by: row.try_get("claimed_by")?,
        claim_expires_at: row.try_get("claim_expires_at")?,
        available_at: row.try_get("available_at")?,
        wake_event: row.try_get("wake_event")?,
        event_payload: row.try_get("event_payload")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        failed_at: row.try_get("failed_at")?,
        result: row.try_get("result")?,
        failure_reason,
    })
}

fn checkpoint_from_row(row: &PgRow) -> Result<CheckpointRecord> {
    Ok(CheckpointRecord {
        task_id: row.try_get("task_id")?,
        checkpoint_name: row.try_get("checkpoint_name")?,
        state: row.try_get("state")?,
        owner_run_id: row.try_get("owner_run_id")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TaskStore for PostgresStore {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        let t = self.tables(queue)?;

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema))
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {tasks} (
                task_id UUID PRIMARY KEY,
                task_name TEXT NOT NULL,
                params JSONB NOT NULL,
                headers JSONB NOT NULL DEFAULT '{{}}',
                retry_strategy JSONB,
                max_attempts INT NOT NULL,
                cancellation JSONB,
                state TEXT NOT NULL,
                attempts INT NOT NULL,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                first_started_at TIMESTAMPTZ,
                last_attempt_run UUID,
                completed_payload JSONB,
                cancelled_at TIMESTAMPTZ
            )
            "#,
            tasks = t.tasks,
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {runs} (
                run_id UUID PRIMARY KEY,
                task_id UUID NOT NULL REFERENCES {tasks} (task_id) ON DELETE CASCADE,
                attempt INT NOT NULL,
                state TEXT NOT NULL,
                claimed_by TEXT,
                claim_expires_at TIMESTAMPTZ,
                available_at TIMESTAMPTZ,
                wake_event TEXT,
                event_payload JSONB,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                failed_at TIMESTAMPTZ,
                result JSONB,
                failure_reason JSONB,
                seq BIGINT GENERATED ALWAYS AS IDENTITY
            )
            "#,
            runs = t.runs,
            tasks = t.tasks,
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"r_{queue}_ready_idx\" ON {runs} (state, available_at)",
            queue = queue,
            runs = t.runs,
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {checkpoints} (
                task_id UUID NOT NULL,
                checkpoint_name TEXT NOT NULL,
                state JSONB NOT NULL,
                owner_run_id UUID NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                seq BIGINT GENERATED ALWAYS AS IDENTITY,
                PRIMARY KEY (task_id, checkpoint_name)
            )
            "#,
            checkpoints = t.checkpoints,
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {events} (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                event_name TEXT NOT NULL,
                payload JSONB NOT NULL,
                emitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                consumed_by UUID[] NOT NULL DEFAULT '{{}}'
            )
            "#,
            events = t.events,
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"e_{queue}_name_idx\" ON {events} (event_name, emitted_at)",
            queue = queue,
            events = t.events,
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {waiters} (
                task_id UUID NOT NULL,
                run_id UUID NOT NULL,
                event_name TEXT NOT NULL,
                wait_key TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (task_id, run_id, wait_key)
            )
            "#,
            waiters = t.waiters,
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"w_{queue}_event_idx\" ON {waiters} (event_name)",
            queue = queue,
            waiters = t.waiters,
        ))
        .execute(&self.pool)
        .await?;

        debug!(queue = %queue, schema = %self.schema, "Queue created");
        Ok(())
    }

    async fn drop_queue(&self, queue: &str) -> Result<()> {
        let t = self.tables(queue)?;
        for table in [&t.waiters, &t.events, &t.checkpoints, &t.runs, &t.tasks] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&self.pool)
                .await?;
        }
        debug!(queue = %queue, "Queue dropped");
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT table_name
            FROM information_schema.tables
            WHERE table_schema = $1 AND table_name LIKE 't\_%' ESCAPE '\'
            ORDER BY table_name
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;

        let mut queues = Vec::with_capacity(rows.len());
        for row in rows {
            let table: String = row.try_get("table_name")?;
            if let Some(queue) = table.strip_prefix("t_") {
                queues.push(queue.to_string());
            }
        }
        Ok(queues)
    }

    async fn spawn_task(&self, queue: &str, spawn: SpawnTask) -> Result<TaskHandle> {
        let t = self.tables(queue)?;
        let task_id = Uuid::new_v4();
        let run_id = Uuid::new_v4();
        let retry_strategy = spawn
            .retry_strategy
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let (run_at, run_after_secs) = match spawn.start_at {
            StartAt::Now => (None, None),
            StartAt::At(at) => (Some(at), None),
            StartAt::After(delay) => (None, Some(delay.as_secs_f64())),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {tasks}
                (task_id, task_name, params, headers, retry_strategy, max_attempts,
                 cancellation, state, attempts, enqueued_at, last_attempt_run)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 1, {now}, $8)
            "#,
            tasks = t.tasks,
            now = NOW_SQL,
        ))
        .bind(task_id)
        .bind(&spawn.task_name)
        .bind(&spawn.params)
        .bind(&spawn.headers)
        .bind(retry_strategy)
        .bind(spawn.max_attempts.max(1) as i32)
        .bind(&spawn.cancellation)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {runs} (run_id, task_id, attempt, state, available_at)
            VALUES ($1, $2, 1, 'pending',
                    CASE
                        WHEN $3::timestamptz IS NOT NULL THEN $3::timestamptz
                        WHEN $4::double precision IS NOT NULL
                            THEN {now} + make_interval(secs => $4)
                        ELSE {now}
                    END)
            "#,
            runs = t.runs,
            now = NOW_SQL,
        ))
        .bind(run_id)
        .bind(task_id)
        .bind(run_at)
        .bind(run_after_secs)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(queue = %queue, task_id = %task_id, task = %spawn.task_name, "Task spawned");
        Ok(TaskHandle {
            task_id,
            run_id,
            attempt: 1,
        })
    }

    async fn emit_event(&self, queue: &str, event_name: &str, payload: Value) -> Result<()> {
        let t = self.tables(queue)?;
        let mut tx = self.pool.begin().await?;

        let event_row = sqlx::query(&format!(
            "INSERT INTO {events} (event_name, payload, emitted_at) VALUES ($1, $2, {now}) RETURNING id",
            events = t.events,
            now = NOW_SQL,
        ))
        .bind(event_name)
        .bind(&payload)
        .fetch_one(&mut *tx)
        .await?;
        let event_id: i64 = event_row.try_get("id")?;

        let waiters = sqlx::query(&format!(
            "SELECT task_id, run_id, wait_key FROM {waiters} WHERE event_name = $1 FOR UPDATE",
            waiters = t.waiters,
        ))
        .bind(event_name)
        .fetch_all(&mut *tx)
        .await?;

        for waiter in waiters {
            let task_id: Uuid = waiter.try_get("task_id")?;
            let run_id: Uuid = waiter.try_get("run_id")?;
            let wait_key: String = waiter.try_get("wait_key")?;

            sqlx::query(&format!(
                "UPDATE {events} SET consumed_by = array_append(consumed_by, $2) WHERE id = $1",
                events = t.events,
            ))
            .bind(event_id)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(&format!(
                r#"
                INSERT INTO {checkpoints} (task_id, checkpoint_name, state, owner_run_id, updated_at)
                VALUES ($1, $2, $3, $4, {now})
                ON CONFLICT (task_id, checkpoint_name) DO NOTHING
                "#,
                checkpoints = t.checkpoints,
                now = NOW_SQL,
            ))
            .bind(task_id)
            .bind(&wait_key)
            .bind(&payload)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(&format!(
                r#"
                UPDATE {runs}
                SET available_at = {now}, wake_event = NULL, event_payload = $2
                WHERE run_id = $1
                "#,
                runs = t.runs,
                now = NOW_SQL,
            ))
            .bind(run_id)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;

            sqlx::query(&format!(
                "UPDATE {tasks} SET state = 'pending' WHERE task_id = $1",
                tasks = t.tasks,
            ))
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(&format!(
                "DELETE FROM {waiters} WHERE task_id = $1 AND run_id = $2 AND wait_key = $3",
                waiters = t.waiters,
            ))
            .bind(task_id)
            .bind(run_id)
            .bind(&wait_key)
            .execute(&mut *tx)
            .await?;

            debug!(queue = %queue, event = %event_name, run_id = %run_id, "Waiter woken");
        }

        tx.commit().await?;
        Ok(())
    }

    async fn claim_tasks(
        &self,
        queue: &str,
        batch_size: u32,
        claim_timeout: Duration,
        worker_id: &str,
    ) -> Result<Vec<ClaimedTask>> {
        let t = self.tables(queue)?;
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(&format!(
            r#"
            WITH picked AS (
                SELECT run_id
                FROM {runs}
                WHERE (state IN ('pending', 'sleeping')
                       AND available_at IS NOT NULL AND available_at <= {now})
                   OR (state = 'running'
                       AND claim_expires_at IS NOT NULL AND claim_expires_at <= {now})
                ORDER BY available_at, seq
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {runs} AS r
            SET state = 'running',
                claimed_by = $2,
                claim_expires_at = {now} + make_interval(secs => $3),
                started_at = COALESCE(r.started_at, {now}),
                wake_event = NULL
            FROM picked
            WHERE r.run_id = picked.run_id
            RETURNING r.run_id, r.task_id
            "#,
            runs = t.runs,
            now = NOW_SQL,
        ))
        .bind(batch_size as i64)
        .bind(worker_id)
        .bind(claim_timeout.as_secs_f64())
        .fetch_all(&mut *tx)
        .await?;

        if claimed.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut run_ids = Vec::with_capacity(claimed.len());
        let mut task_ids = Vec::with_capacity(claimed.len());
        for row in &claimed {
            run_ids.push(row.try_get::<Uuid, _>("run_id")?);
            task_ids.push(row.try_get::<Uuid, _>("task_id")?);
        }

        sqlx::query(&format!(
            r#"
            UPDATE {tasks}
            SET state = 'running', first_started_at = COALESCE(first_started_at, {now})
            WHERE task_id = ANY($1)
            "#,
            tasks = t.tasks,
            now = NOW_SQL,
        ))
        .bind(&task_ids)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT r.run_id, r.task_id, r.attempt, t.task_name, t.params, t.headers
            FROM {runs} r
            JOIN {tasks} t USING (task_id)
            WHERE r.run_id = ANY($1)
            ORDER BY r.available_at, r.seq
            "#,
            runs = t.runs,
            tasks = t.tasks,
        ))
        .bind(&run_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ClaimedTask {
                task_id: row.try_get("task_id")?,
                run_id: row.try_get("run_id")?,
                attempt: row.try_get::<i32, _>("attempt")? as u32,
                task_name: row.try_get("task_name")?,
                params: row.try_get("params")?,
                headers: row.try_get("headers")?,
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
        let t = self.tables(queue)?;
        let result = sqlx::query(&format!(
            r#"
            UPDATE {runs}
            SET claim_expires_at = {now} + make_interval(secs => $3)
            WHERE run_id = $1 AND claimed_by = $2 AND state = 'running'
              AND claim_expires_at > {now}
            "#,
            runs = t.runs,
            now = NOW_SQL,
        ))
        .bind(run_id)
        .bind(worker_id)
        .bind(claim_timeout.as_secs_f64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotOwner {
                run_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    async fn complete_run(
        &self,
        queue: &str,
        run_id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<()> {
        let t = self.tables(queue)?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(&format!(
            r#"
            UPDATE {runs}
            SET state = 'completed', completed_at = {now}, result = $3,
                claimed_by = NULL, claim_expires_at = NULL
            WHERE run_id = $1 AND claimed_by = $2 AND state = 'running'
            RETURNING task_id
            "#,
            runs = t.runs,
            now = NOW_SQL,
        ))
        .bind(run_id)
        .bind(worker_id)
        .bind(&result)
        .fetch_optional(&mut *tx)
        .await?;

        let task_id: Uuid = match updated {
            Some(row) => row.try_get("task_id")?,
            None => {
                let exists = sqlx::query(&format!(
                    "SELECT run_id FROM {runs} WHERE run_id = $1",
                    runs = t.runs,
                ))
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;
                return Err(match exists {
                    Some(_) => StoreError::NotOwner {
                        run_id,
                        worker_id: worker_id.to_string(),
                    },
                    None => StoreError::RunNotFound { run_id },
                });
            }
        };

        sqlx::query(&format!(
            "UPDATE {tasks} SET state = 'completed', completed_payload = $2 WHERE task_id = $1",
            tasks = t.tasks,
        ))
        .bind(task_id)
        .bind(&result)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
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
        let t = self.tables(queue)?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            SELECT r.task_id, r.attempt, r.claimed_by, t.max_attempts, t.retry_strategy
            FROM {runs} r
            JOIN {tasks} t USING (task_id)
            WHERE r.run_id = $1
            FOR UPDATE
            "#,
            runs = t.runs,
            tasks = t.tasks,
        ))
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::RunNotFound { run_id })?;

        let claimed_by: Option<String> = row.try_get("claimed_by")?;
        if claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::NotOwner {
                run_id,
                worker_id: worker_id.to_string(),
            });
        }
        let task_id: Uuid = row.try_get("task_id")?;
        let attempt = row.try_get::<i32, _>("attempt")? as u32;
        let max_attempts = row.try_get::<i32, _>("max_attempts")? as u32;
        let retry_strategy: Option<Value> = row.try_get("retry_strategy")?;
        let strategy = retry_strategy
            .map(serde_json::from_value::<RetryStrategy>)
            .transpose()?
            .unwrap_or_default();

        sqlx::query(&format!(
            r#"
            UPDATE {runs}
            SET state = 'failed', failed_at = {now}, failure_reason = $2,
                claimed_by = NULL, claim_expires_at = NULL
            WHERE run_id = $1
            "#,
            runs = t.runs,
            now = NOW_SQL,
        ))
        .bind(run_id)
        .bind(serde_json::to_value(&reason)?)
        .execute(&mut *tx)
        .await?;

        if attempt < max_attempts {
            let retry_run = Uuid::new_v4();
            let delay = strategy.delay_for_attempt(attempt);
            sqlx::query(&format!(
                r#"
                INSERT INTO {runs} (run_id, task_id, attempt, state, available_at)
                VALUES ($1, $2, $3, 'pending', {now} + make_interval(secs => $4))
                "#,
                runs = t.runs,
                now = NOW_SQL,
            ))
            .bind(retry_run)
            .bind(task_id)
            .bind((attempt + 1) as i32)
            .bind(delay.as_secs_f64())
            .execute(&mut *tx)
            .await?;

            sqlx::query(&format!(
                r#"
                UPDATE {tasks}
                SET state = 'pending', attempts = $2, last_attempt_run = $3
                WHERE task_id = $1
                "#,
                tasks = t.tasks,
            ))
            .bind(task_id)
            .bind((attempt + 1) as i32)
            .bind(retry_run)
            .execute(&mut *tx)
            .await?;
            debug!(queue = %queue, run_id = %run_id, attempt, "Run failed, retry enqueued");
        } else {
            sqlx::query(&format!(
                "UPDATE {tasks} SET state = 'failed' WHERE task_id = $1",
                tasks = t.tasks,
            ))
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            debug!(queue = %queue, run_id = %run_id, attempt, "Run failed terminally");
        }

        tx.commit().await?;
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
        let t = self.tables(queue)?;
        let mut tx = self.pool.begin().await?;

        // Replay of a wait that was already satisfied.
        let cached = sqlx::query(&format!(
            "SELECT state FROM {checkpoints} WHERE task_id = $1 AND checkpoint_name = $2",
            checkpoints = t.checkpoints,
        ))
        .bind(task_id)
        .bind(wait_key)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = cached {
            tx.commit().await?;
            return Ok(SuspendOutcome::Cached(row.try_get("state")?));
        }

        // Oldest cached emission this task has not consumed yet.
        let event = sqlx::query(&format!(
            r#"
            SELECT id, payload FROM {events}
            WHERE event_name = $1 AND NOT ($2 = ANY(consumed_by))
            ORDER BY emitted_at, id
            LIMIT 1
            FOR UPDATE
            "#,
            events = t.events,
        ))
        .bind(event_name)
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = event {
            let event_id: i64 = row.try_get("id")?;
            let payload: Value = row.try_get("payload")?;

            sqlx::query(&format!(
                "UPDATE {events} SET consumed_by = array_append(consumed_by, $2) WHERE id = $1",
                events = t.events,
            ))
            .bind(event_id)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(&format!(
                r#"
                INSERT INTO {checkpoints} (task_id, checkpoint_name, state, owner_run_id, updated_at)
                VALUES ($1, $2, $3, $4, {now})
                ON CONFLICT (task_id, checkpoint_name) DO NOTHING
                "#,
                checkpoints = t.checkpoints,
                now = NOW_SQL,
            ))
            .bind(task_id)
            .bind(wait_key)
            .bind(&payload)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            debug!(queue = %queue, event = %event_name, run_id = %run_id, "Cached event consumed");
            return Ok(SuspendOutcome::Cached(payload));
        }

        // Nothing cached: park the run and release the claim.
        sqlx::query(&format!(
            r#"
            INSERT INTO {waiters} (task_id, run_id, event_name, wait_key, created_at)
            VALUES ($1, $2, $3, $4, {now})
            ON CONFLICT (task_id, run_id, wait_key) DO NOTHING
            "#,
            waiters = t.waiters,
            now = NOW_SQL,
        ))
        .bind(task_id)
        .bind(run_id)
        .bind(event_name)
        .bind(wait_key)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"
            UPDATE {runs}
            SET state = 'sleeping', wake_event = $2, available_at = NULL,
                claimed_by = NULL, claim_expires_at = NULL
            WHERE run_id = $1
            "#,
            runs = t.runs,
        ))
        .bind(run_id)
        .bind(event_name)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "UPDATE {tasks} SET state = 'sleeping' WHERE task_id = $1",
            tasks = t.tasks,
        ))
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
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
        let t = self.tables(queue)?;
        let mut tx = self.pool.begin().await?;

        let cached = sqlx::query(&format!(
            "SELECT state FROM {checkpoints} WHERE task_id = $1 AND checkpoint_name = $2",
            checkpoints = t.checkpoints,
        ))
        .bind(task_id)
        .bind(wait_key)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = cached {
            tx.commit().await?;
            return Ok(SuspendOutcome::Cached(row.try_get("state")?));
        }

        // Checkpoint and park in the same transaction so the timer cannot
        // be skipped or repeated by a crash in between.
        sqlx::query(&format!(
            r#"
            INSERT INTO {checkpoints} (task_id, checkpoint_name, state, owner_run_id, updated_at)
            VALUES ($1, $2, 'null'::jsonb, $3, {now})
            ON CONFLICT (task_id, checkpoint_name) DO NOTHING
            "#,
            checkpoints = t.checkpoints,
            now = NOW_SQL,
        ))
        .bind(task_id)
        .bind(wait_key)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"
            UPDATE {runs}
            SET state = 'sleeping', wake_event = NULL,
                available_at = {now} + make_interval(secs => $2),
                claimed_by = NULL, claim_expires_at = NULL
            WHERE run_id = $1
            "#,
            runs = t.runs,
            now = NOW_SQL,
        ))
        .bind(run_id)
        .bind(duration.as_secs_f64())
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "UPDATE {tasks} SET state = 'sleeping' WHERE task_id = $1",
            tasks = t.tasks,
        ))
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(queue = %queue, run_id = %run_id, secs = duration.as_secs_f64(), "Run sleeping");
        Ok(SuspendOutcome::Parked)
    }

    async fn read_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
    ) -> Result<Option<CheckpointRecord>> {
        let t = self.tables(queue)?;
        let row = sqlx::query(&format!(
            r#"
            SELECT task_id, checkpoint_name, state, owner_run_id, updated_at
            FROM {checkpoints}
            WHERE task_id = $1 AND checkpoint_name = $2
            "#,
            checkpoints = t.checkpoints,
        ))
        .bind(task_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn write_checkpoint(
        &self,
        queue: &str,
        task_id: Uuid,
        name: &str,
        state: Value,
        owner_run_id: Uuid,
    ) -> Result<()> {
        let t = self.tables(queue)?;
        // First write wins; a replayed step never overwrites.
        sqlx::query(&format!(
            r#"
            INSERT INTO {checkpoints} (task_id, checkpoint_name, state, owner_run_id, updated_at)
            VALUES ($1, $2, $3, $4, {now})
            ON CONFLICT (task_id, checkpoint_name) DO NOTHING
            "#,
            checkpoints = t.checkpoints,
            now = NOW_SQL,
        ))
        .bind(task_id)
        .bind(name)
        .bind(&state)
        .bind(owner_run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_checkpoints(&self, queue: &str, task_id: Uuid) -> Result<Vec<CheckpointRecord>> {
        let t = self.tables(queue)?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT task_id, checkpoint_name, state, owner_run_id, updated_at
            FROM {checkpoints}
            WHERE task_id = $1
            ORDER BY seq
            "#,
            checkpoints = t.checkpoints,
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn get_task(&self, queue: &str, task_id: Uuid) -> Result<Option<TaskRecord>> {
        let t = self.tables(queue)?;
        let row = sqlx::query(&format!(
            r#"
            SELECT task_id, task_name, params, headers, retry_strategy, max_attempts,
                   cancellation, state, attempts, enqueued_at, first_started_at,
                   last_attempt_run, completed_payload, cancelled_at
            FROM {tasks}
            WHERE task_id = $1
            "#,
            tasks = t.tasks,
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn get_run(&self, queue: &str, run_id: Uuid) -> Result<Option<RunRecord>> {
        let t = self.tables(queue)?;
        let row = sqlx::query(&format!(
            r#"
            SELECT run_id, task_id, attempt, state, claimed_by, claim_expires_at,
                   available_at, wake_event, event_payload, started_at, completed_at,
                   failed_at, result, failure_reason
            FROM {runs}
            WHERE run_id = $1
            "#,
            runs = t.runs,
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn cancel_task(&self, queue: &str, task_id: Uuid) -> Result<bool> {
        let t = self.tables(queue)?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT state FROM {tasks} WHERE task_id = $1 FOR UPDATE",
            tasks = t.tasks,
        ))
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::TaskNotFound { task_id })?;
        let state: String = row.try_get("state")?;
        if parse_state(&state)?.is_terminal() {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(&format!(
            "UPDATE {tasks} SET state = 'cancelled', cancelled_at = {now} WHERE task_id = $1",
            tasks = t.tasks,
            now = NOW_SQL,
        ))
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"
            UPDATE {runs}
            SET state = 'cancelled', claimed_by = NULL, claim_expires_at = NULL,
                available_at = NULL, wake_event = NULL
            WHERE task_id = $1 AND state NOT IN ('completed', 'failed', 'cancelled')
            "#,
            runs = t.runs,
        ))
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "DELETE FROM {waiters} WHERE task_id = $1",
            waiters = t.waiters,
        ))
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(queue = %queue, task_id = %task_id, "Task cancelled");
        Ok(true)
    }
}
