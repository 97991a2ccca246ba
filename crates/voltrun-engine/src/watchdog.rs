// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for reconciling executions that never finished.
//!
//! Every accepted execution carries a `deadline_at`: its timeout plus the
//! admission timeout plus a teardown grace. A coordinator that is alive
//! always finalizes before that instant, so a row still `pending` or
//! `running` afterwards belongs to a run that was lost (a crashed task, a
//! killed engine). The watchdog fails such rows.
//!
//! On startup, before any request is served, every unfinished row is failed:
//! the engine that owned it is gone. This assumes one engine per store.
//!
//! All writes go through the store's compare-and-set, so a watchdog racing a
//! live coordinator can only lose, never overwrite.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use voltrun_core::StoreError;
use voltrun_core::model::{
    ErrorKind, ExecutionError, ExecutionRecord, ExecutionStatus, TransitionPayload,
};
use voltrun_core::persistence::{ExecutionStore, Store};

/// Configuration for the watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often to look for overdue executions.
    pub poll_interval: Duration,
    /// Maximum rows handled per pass.
    pub batch_size: i64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            batch_size: 100,
        }
    }
}

/// Fail a non-terminal execution, going through `running` if it is still
/// `pending`. `logs`, when given, replace the stored logs.
///
/// Returns `Ok(false)` when another writer moved the row first.
pub async fn fail_execution<S>(
    store: &S,
    execution_id: &str,
    current: ExecutionStatus,
    error: ExecutionError,
    logs: Option<String>,
) -> Result<bool, StoreError>
where
    S: ExecutionStore + ?Sized,
{
    let now = Utc::now();
    match current {
        ExecutionStatus::Pending => {
            let started = TransitionPayload {
                started_at: Some(now),
                ..Default::default()
            };
            match store
                .transition(
                    execution_id,
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                    &started,
                )
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_conflict() => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        ExecutionStatus::Running => {}
        ExecutionStatus::Success | ExecutionStatus::Failed => return Ok(false),
    }

    let failed = TransitionPayload {
        finished_at: Some(now),
        error: Some(error),
        logs,
        ..Default::default()
    };
    match store
        .transition(
            execution_id,
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            &failed,
        )
        .await
    {
        Ok(()) => Ok(true),
        Err(e) if e.is_conflict() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Background worker that fails overdue executions.
pub struct Watchdog {
    store: Arc<dyn Store>,
    config: WatchdogConfig,
    shutdown: Arc<Notify>,
}

impl Watchdog {
    pub fn new(store: Arc<dyn Store>, config: WatchdogConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Execution watchdog started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Execution watchdog received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Failed to sweep overdue executions");
                    }
                }
            }
        }

        info!("Execution watchdog stopped");
    }

    /// Fail every unfinished execution left by a previous engine.
    pub async fn reconcile_on_startup(&self) -> Result<usize, StoreError> {
        let mut reconciled = 0;
        loop {
            let batch = self.store.list_unfinished(self.config.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            let mut progressed = false;
            for record in &batch {
                let error = ExecutionError::new(
                    ErrorKind::InternalError,
                    "engine restarted before the execution finished",
                );
                match self.reconcile(record, error).await {
                    Ok(true) => {
                        reconciled += 1;
                        progressed = true;
                    }
                    Ok(false) => progressed = true,
                    Err(e) => {
                        error!(execution_id = %record.id, error = %e, "Failed to reconcile execution");
                    }
                }
            }
            if !progressed || (batch.len() as i64) < self.config.batch_size {
                break;
            }
        }

        if reconciled > 0 {
            warn!(reconciled = reconciled, "Failed executions orphaned by a previous run");
        }
        Ok(reconciled)
    }

    /// One pass over executions whose deadline has passed.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let overdue = self
            .store
            .list_overdue(Utc::now(), self.config.batch_size)
            .await?;
        if overdue.is_empty() {
            debug!("No overdue executions");
            return Ok(0);
        }

        let mut reconciled = 0;
        for record in &overdue {
            let error = match record.status {
                ExecutionStatus::Running => ExecutionError::new(
                    ErrorKind::ExecutionTimeout,
                    "execution passed its deadline without finishing",
                ),
                _ => ExecutionError::new(
                    ErrorKind::InternalError,
                    "execution was never started",
                ),
            };
            match self.reconcile(record, error).await {
                Ok(true) => reconciled += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(execution_id = %record.id, error = %e, "Failed to reconcile execution");
                }
            }
        }

        info!(
            overdue = overdue.len(),
            reconciled = reconciled,
            "Reconciled overdue executions"
        );
        Ok(reconciled)
    }

    async fn reconcile(
        &self,
        record: &ExecutionRecord,
        error: ExecutionError,
    ) -> Result<bool, StoreError> {
        let kind = error.kind;
        let won = fail_execution(self.store.as_ref(), &record.id, record.status, error, None).await?;
        if won {
            warn!(
                execution_id = %record.id,
                function_id = %record.function_id,
                from = %record.status,
                kind = %kind,
                "Execution failed by watchdog"
            );
        } else {
            debug!(execution_id = %record.id, "Execution finalized by another writer");
        }
        Ok(won)
    }
}
