// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{Result, StoreError};
use crate::model::{
    ExecutionFilter, ExecutionRecord, ExecutionStatus, Function, NewExecution, TransitionPayload,
};

use super::{ExecutionRow, ExecutionStore, FunctionStore, check_transition, lost_transition};

pub(crate) static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const EXECUTION_COLUMNS: &str = "id, function_id, status, input, output, error, logs, \
     duration_ms, memory_peak_mb, sandbox_id, created_at, started_at, finished_at, deadline_at";

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let file = url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        let file = file.split('?').next().unwrap_or_default();
        if !file.is_empty()
            && file != ":memory:"
            && let Some(parent) = Path::new(file).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        // Each connection to an in-memory database sees its own database.
        let in_memory = file == ":memory:" || url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect(url)
            .await
            .map_err(|e| StoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Run the embedded migrations against `pool`.
    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        MIGRATOR.run(pool).await?;
        Ok(())
    }

    async fn current_status(&self, id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(status,)| status))
    }
}

fn into_records(rows: Vec<ExecutionRow>) -> Result<Vec<ExecutionRecord>> {
    rows.into_iter().map(ExecutionRecord::try_from).collect()
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn create_execution(&self, execution: &NewExecution) -> Result<String> {
        let input = serde_json::to_string(&execution.input)?;
        sqlx::query(
            r#"
            INSERT INTO executions (id, function_id, status, input, logs, created_at, deadline_at)
            VALUES (?, ?, 'pending', ?, '', ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.function_id)
        .bind(input)
        .bind(execution.created_at)
        .bind(execution.deadline_at)
        .execute(&self.pool)
        .await?;

        Ok(execution.id.clone())
    }

    async fn transition(
        &self,
        id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
        payload: &TransitionPayload,
    ) -> Result<()> {
        let encoded = check_transition(from, to, payload)?;

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?1,
                started_at = COALESCE(?2, started_at),
                finished_at = COALESCE(?3, finished_at),
                deadline_at = COALESCE(?4, deadline_at),
                output = COALESCE(?5, output),
                error = COALESCE(?6, error),
                logs = COALESCE(?7, logs),
                duration_ms = COALESCE(?8, duration_ms),
                memory_peak_mb = COALESCE(?9, memory_peak_mb),
                sandbox_id = COALESCE(?10, sandbox_id)
            WHERE id = ?11
              AND status = ?12
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
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        Err(lost_transition(id, from, self.current_status(id).await?))
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ExecutionRecord::try_from).transpose()
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM executions
            WHERE (?1 IS NULL OR function_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "#
        ))
        .bind(filter.function_id.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    async fn count_executions(&self, filter: &ExecutionFilter) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM executions
            WHERE (?1 IS NULL OR function_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            "#,
        )
        .bind(filter.function_id.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn list_overdue(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM executions
            WHERE status IN ('pending', 'running')
              AND deadline_at IS NOT NULL
              AND deadline_at < ?
            ORDER BY deadline_at ASC
            LIMIT ?
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    async fn list_unfinished(&self, limit: i64) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM executions
            WHERE status IN ('pending', 'running')
            ORDER BY created_at ASC
            LIMIT ?
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    async fn health_check(&self) -> Result<bool> {
        let result: std::result::Result<(i64,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[async_trait]
impl FunctionStore for SqliteStore {
    async fn create_function(&self, function: &Function) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO functions (id, name, description, runtime, code, entry_point,
                                   memory_mb, timeout_sec, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_function(&self, id: &str) -> Result<Option<Function>> {
        let function = sqlx::query_as::<_, Function>(
            r#"
            SELECT id, name, description, runtime, code, entry_point,
                   memory_mb, timeout_sec, status, created_at, updated_at
            FROM functions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(function)
    }

    async fn list_functions(&self, limit: i64, offset: i64) -> Result<Vec<Function>> {
        let functions = sqlx::query_as::<_, Function>(
            r#"
            SELECT id, name, description, runtime, code, entry_point,
                   memory_mb, timeout_sec, status, created_at, updated_at
            FROM functions
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(functions)
    }

    async fn update_function(&self, function: &Function) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET name = ?, description = ?, runtime = ?, code = ?, entry_point = ?,
                memory_mb = ?, timeout_sec = ?, status = ?, updated_at = ?
            WHERE id = ?
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
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FunctionNotFound {
                function_id: function.id.clone(),
            });
        }
        Ok(())
    }

    async fn delete_function(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM functions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
