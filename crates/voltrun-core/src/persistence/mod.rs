// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for voltrun-core.
//!
//! This module defines the store abstraction and backend implementations.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::{Result, StoreError};
use crate::model::{
    ExecutionError, ExecutionFilter, ExecutionRecord, ExecutionStatus, Function, NewExecution,
    TransitionPayload,
};

/// Execution row as stored. JSON columns are kept as text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ExecutionRow {
    pub id: String,
    pub function_id: String,
    pub status: String,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub logs: String,
    pub duration_ms: Option<i64>,
    pub memory_peak_mb: Option<i64>,
    pub sandbox_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        let corrupt = |details: String| StoreError::Corrupt {
            id: row.id.clone(),
            details,
        };

        let status: ExecutionStatus = row.status.parse().map_err(corrupt)?;
        let input = serde_json::from_str(&row.input)
            .map_err(|e| corrupt(format!("input: {e}")))?;
        let output = row
            .output
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt(format!("output: {e}")))?;
        let error = row
            .error
            .as_deref()
            .map(serde_json::from_str::<ExecutionError>)
            .transpose()
            .map_err(|e| corrupt(format!("error: {e}")))?;

        Ok(ExecutionRecord {
            id: row.id,
            function_id: row.function_id,
            status,
            input,
            output,
            error,
            logs: row.logs,
            duration_ms: row.duration_ms,
            memory_peak_mb: row.memory_peak_mb,
            sandbox_id: row.sandbox_id,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            deadline_at: row.deadline_at,
        })
    }
}

/// Encoded JSON columns of a transition payload.
pub(crate) struct EncodedPayload {
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Validate a transition before it reaches the database.
pub(crate) fn check_transition(
    from: ExecutionStatus,
    to: ExecutionStatus,
    payload: &TransitionPayload,
) -> Result<EncodedPayload> {
    if !from.can_transition_to(to) {
        return Err(StoreError::InvalidTransition { from, to });
    }
    payload.check_for(to).map_err(StoreError::InvalidPayload)?;

    let output = payload
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let error = payload
        .error
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    Ok(EncodedPayload { output, error })
}

/// Map a zero-row CAS update to `NotFound` or `Conflict`.
pub(crate) fn lost_transition(
    id: &str,
    expected: ExecutionStatus,
    current: Option<String>,
) -> StoreError {
    match current {
        None => StoreError::ExecutionNotFound {
            execution_id: id.to_string(),
        },
        Some(raw) => match raw.parse() {
            Ok(actual) => StoreError::Conflict {
                execution_id: id.to_string(),
                expected,
                actual,
            },
            Err(details) => StoreError::Corrupt {
                id: id.to_string(),
                details,
            },
        },
    }
}

/// Durable execution records.
///
/// Every status change is a compare-and-set on the expected current status:
/// the first writer wins and later writers get [`StoreError::Conflict`].
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new `pending` execution and return its id.
    async fn create_execution(&self, execution: &NewExecution) -> Result<String>;

    /// Move an execution from `from` to `to`, writing `payload` atomically.
    async fn transition(
        &self,
        id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
        payload: &TransitionPayload,
    ) -> Result<()>;

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>>;

    /// List executions, newest first.
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>>;

    async fn count_executions(&self, filter: &ExecutionFilter) -> Result<i64>;

    /// Non-terminal executions whose deadline passed before `now`.
    async fn list_overdue(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ExecutionRecord>>;

    /// Every non-terminal execution, oldest first.
    async fn list_unfinished(&self, limit: i64) -> Result<Vec<ExecutionRecord>>;

    async fn health_check(&self) -> Result<bool>;
}

/// Minimal function registry storage.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn create_function(&self, function: &Function) -> Result<()>;

    async fn get_function(&self, id: &str) -> Result<Option<Function>>;

    /// List functions, newest first.
    async fn list_functions(&self, limit: i64, offset: i64) -> Result<Vec<Function>>;

    /// Replace a stored definition. Fails with `FunctionNotFound` if absent.
    async fn update_function(&self, function: &Function) -> Result<()>;

    /// Returns whether a row was deleted.
    async fn delete_function(&self, id: &str) -> Result<bool>;
}

/// Both stores behind one handle.
pub trait Store: ExecutionStore + FunctionStore {}

impl<T: ExecutionStore + FunctionStore> Store for T {}

/// Open a store from a database URL (`sqlite:` or `postgres://`) and run
/// migrations.
pub async fn connect(url: &str) -> Result<Arc<dyn Store>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        info!("Connecting to PostgreSQL store");
        let store = PostgresStore::connect(url).await?;
        Ok(Arc::new(store))
    } else if url.starts_with("sqlite:") {
        info!(url = %url, "Connecting to SQLite store");
        let store = SqliteStore::connect(url).await?;
        Ok(Arc::new(store))
    } else {
        Err(StoreError::Database {
            operation: "connect".to_string(),
            details: format!("unsupported database URL scheme: {url}"),
        })
    }
}
