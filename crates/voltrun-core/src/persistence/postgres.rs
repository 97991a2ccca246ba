// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{Result, StoreError};
use crate::model::{
    ExecutionFilter, ExecutionRecord, ExecutionStatus, Function, NewExecution, TransitionPayload,
};

use super::{ExecutionRow, ExecutionStore, FunctionStore, check_transition, lost_transition};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgres");

const EXECUTION_COLUMNS: &str = "id, function_id, status, input, output, error, logs, \
     duration_ms, memory_peak_mb, sandbox_id, created_at, started_at, finished_at, deadline_at";

const FUNCTION_COLUMNS: &str = "id, name, description, runtime, code, entry_point, \
     memory_mb, timeout_sec, status, created_at, updated_at";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing, already migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| StoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ExecutionStore for PostgresStore {
    async fn create_execution(&self, execution: &NewExecution) -> Result<String> {
        create_execution(&self.pool, execution).await
    }

    async fn transition(
        &self,
        id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
        payload: &TransitionPayload,
    ) -> Result<()> {
        transition(&self.pool, id, from, to, payload).await
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        get_execution(&self.pool, id).await
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        list_executions(&self.pool, filter, limit, offset).await
    }

    async fn count_executions(&self, filter: &ExecutionFilter) -> Result<i64> {
        count_executions(&self.pool, filter).await
    }

    async fn list_overdue(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ExecutionRecord>> {
        list_overdue(&self.pool, now, limit).await
    }

    async fn list_unfinished(&self, limit: i64) -> Result<Vec<ExecutionRecord>> {
        list_unfinished(&self.pool, limit).await
    }

    async fn health_check(&self) -> Result<bool> {
        let result: std::result::Result<(i32,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[async_trait]
impl FunctionStore for PostgresStore {
    async fn create_function(&self, function: &Function) -> Result<()> {
        create_function(&self.pool, function).await
    }

    async fn get_function(&self, id: &str) -> Result<Option<Function>> {
        let function = sqlx::query_as::<_, Function>(&format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(function)
    }

    async fn list_functions(&self, limit: i64, offset: i64) -> Result<Vec<Function>> {
        let functions = sqlx::query_as::<_, Function>(&format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions \
             ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(functions)
    }

    async fn update_function(&self, function: &Function) -> Result<()> {
        update_function(&self.pool, function).await
    }

    async fn delete_function(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM functions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn into_records(rows: Vec<ExecutionRow>) -> Result<Vec<ExecutionRecord>> {
    rows.into_iter().map(ExecutionRecord::try_from).collect()
}

pub async fn create_execution(pool: &PgPool, execution: &NewExecution) -> Result<String> {
    let input = serde_json::to_string(&execution.input)?;
    sqlx::query(
        r#"
        INSERT INTO executions (id, function_id, status, input, logs, created_at, deadline_at)
        VALUES ($1, $2, 'pending', $3, '', $4, $5)
        "#,
    )
    .bind(&execution.id)
    .bind(&execution.function_id)
    .bind(input)
    .bind(execution.created_at)
    .bind(execution.deadline_at)
    .execute(pool)
    .await?;

    Ok(execution.id.clone())
}

pub async fn transition(
    pool: &PgPool,
    id: &str,
    from: ExecutionStatus,
    to: ExecutionStatus,
    payload: &TransitionPayload,
) -> Result<()> {
    let encoded = check_transition(from, to, payload)?;

    let result = sqlx::query(
        r#"
        UPDATE executions
        SET status = $1,
            started_at = COALESCE($2, started_at),
            finished_at = COALESCE($3, finished_at),
            deadline_at = COALESCE($4, deadline_at),
            output = COALESCE($5, output),
            error = COALESCE($6, error),
            logs = COALESCE($7, logs),
            duration_ms = COALESCE($8, duration_ms),
            memory_peak_mb = COALESCE($9, memory_peak_mb),
            sandbox_id = COALESCE($10, sandbox_id)
        WHERE id = $11
          AND status = $12
        "#,
    )
    .bind(to.as_str())
    .bind(payload.started_at)
    .bind(payload.finished_at)
    .bind(payload.deadline_at)
    .bind(encoded.output)
    .bind(encoded.error)
    .bind(payload.logs.as_deref())
    .bind(payload.duration_ms)
    .bind(payload.memory_peak_mb)
    .bind(payload.sandbox_id.as_deref())
    .bind(id)
    .bind(from.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(());
    }

    let current: Option<(String,)> = sqlx::query_as("SELECT status FROM executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Err(lost_transition(id, from, current.map(|(s,)| s)))
}

pub async fn get_execution(pool: &PgPool, id: &str) -> Result<Option<ExecutionRecord>> {
    let row = sqlx::query_as::<_, ExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(ExecutionRecord::try_from).transpose()
}

pub async fn list_executions(
    pool: &PgPool,
    filter: &ExecutionFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<ExecutionRecord>> {
    let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
        r#"
        SELECT {EXECUTION_COLUMNS}
        FROM executions
        WHERE ($1::TEXT IS NULL OR function_id = $1)
          AND ($2::TEXT IS NULL OR status = $2)
        ORDER BY created_at DESC, id DESC
        LIMIT $3 OFFSET $4
        "#
    ))
    .bind(filter.function_id.as_deref())
    .bind(filter.status.map(|s| s.as_str()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    into_records(rows)
}

pub async fn count_executions(pool: &PgPool, filter: &ExecutionFilter) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM executions
        WHERE ($1::TEXT IS NULL OR function_id = $1)
          AND ($2::TEXT IS NULL OR status = $2)
        "#,
    )
    .bind(filter.function_id.as_deref())
    .bind(filter.status.map(|s| s.as_str()))
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

pub async fn list_overdue(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<ExecutionRecord>> {
    let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
        r#"
        SELECT {EXECUTION_COLUMNS}
        FROM executions
        WHERE status IN ('pending', 'running')
          AND deadline_at IS NOT NULL
          AND deadline_at < $1
        ORDER BY deadline_at ASC
        LIMIT $2
        "#
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    into_records(rows)
}

pub async fn list_unfinished(pool: &PgPool, limit: i64) -> Result<Vec<ExecutionRecord>> {
    let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
        r#"
        SELECT {EXECUTION_COLUMNS}
        FROM executions
        WHERE status IN ('pending', 'running')
        ORDER BY created_at ASC
        LIMIT $1
        "#
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    into_records(rows)
}

pub async fn create_function(pool: &PgPool, function: &Function) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO functions (id, name, description, runtime, code, entry_point,
                               memory_mb, timeout_sec, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(&function.id)
    .bind(&function.name)
    .bind(function.description.as_deref())
    .bind(&function.runtime)
    .bind(&function.code)
    .bind(&function.entry_point)
    .bind(function.memory_mb)
    .bind(function.timeout_sec)
    .bind(function.status.as_str())
    .bind(function.created_at)
    .bind(function.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn update_function(pool: &PgPool, function: &Function) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE functions
        SET name = $1, description = $2, runtime = $3, code = $4, entry_point = $5,
            memory_mb = $6, timeout_sec = $7, status = $8, updated_at = $9
        WHERE id = $10
        "#,
    )
    .bind(&function.name)
    .bind(function.description.as_deref())
    .bind(&function.runtime)
    .bind(&function.code)
    .bind(&function.entry_point)
    .bind(function.memory_mb)
    .bind(function.timeout_sec)
    .bind(function.status.as_str())
    .bind(function.updated_at)
    .bind(&function.id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::FunctionNotFound {
            function_id: function.id.clone(),
        });
    }
    Ok(())
}
