// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution coordinator.
//!
//! Validates an invocation, records it, and drives it to a terminal state:
//!
//! ```text
//! validate ─► create (pending) ─► running ─► acquire sandbox ─► run ─► success | failed
//!                                                                  └─► release sandbox
//! ```
//!
//! The drive runs on its own task so a caller that goes away (an HTTP client
//! disconnecting) never cancels it. The coordinator waits for that task and
//! returns the finalized record. A panicking task is finalized as
//! `InternalError`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};
use voltrun_core::StoreError;
use voltrun_core::model::{
    ErrorKind, ExecutionError, ExecutionRecord, ExecutionStatus, Function, FunctionSpec,
    FunctionValidationError, NewExecution, TransitionPayload,
};
use voltrun_core::persistence::Store;

use crate::capture::LogCapture;
use crate::sandbox::lifecycle::{Invocation, RunReport};
use crate::sandbox::{SandboxClass, SandboxPool};
use crate::watchdog::fail_execution;

/// Coordinator limits.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long an invocation may wait for a sandbox.
    pub admission_timeout: Duration,
    /// Byte cap on captured logs per execution.
    pub log_cap_bytes: usize,
    /// Byte cap on the serialized input.
    pub max_input_bytes: usize,
    /// Margin on top of timeout and admission before the watchdog may step in.
    pub teardown_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            admission_timeout: Duration::from_secs(5),
            log_cap_bytes: 64 * 1024,
            max_input_bytes: 256 * 1024,
            teardown_grace: Duration::from_millis(500),
        }
    }
}

/// An invocation rejected before any execution row exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    #[error(transparent)]
    Function(#[from] FunctionValidationError),

    #[error("input is {size} bytes, above the {limit} byte limit")]
    InputTooLarge { size: usize, limit: usize },
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvokeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Drives invocations from validation to a terminal execution record.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn Store>,
    pool: Arc<SandboxPool>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, pool: Arc<SandboxPool>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            pool,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.pool
    }

    /// Check an invocation without recording anything.
    pub fn validate(&self, function: &Function, input: &Value) -> Result<FunctionSpec, ValidationError> {
        let spec = function.invocable_spec()?;
        let size = input.to_string().len();
        if size > self.config.max_input_bytes {
            return Err(ValidationError::InputTooLarge {
                size,
                limit: self.config.max_input_bytes,
            });
        }
        Ok(spec)
    }

    /// Instant after which a live coordinator must have finalized.
    fn deadline_for(&self, spec: &FunctionSpec) -> chrono::DateTime<Utc> {
        let budget = spec.timeout + self.config.admission_timeout + self.config.teardown_grace;
        Utc::now() + chrono::Duration::milliseconds(budget.as_millis() as i64)
    }

    /// Invoke a stored function by id.
    pub async fn invoke_by_id(
        &self,
        function_id: &str,
        input: Value,
    ) -> Result<ExecutionRecord, InvokeError> {
        let function = self
            .store
            .get_function(function_id)
            .await?
            .ok_or_else(|| InvokeError::FunctionNotFound(function_id.to_string()))?;
        self.invoke(&function, input).await
    }

    /// Run `function` with `input` and return the finalized execution.
    pub async fn invoke(
        &self,
        function: &Function,
        input: Value,
    ) -> Result<ExecutionRecord, InvokeError> {
        let spec = self.validate(function, &input)?;

        let execution = NewExecution::new(&function.id, input.clone(), self.deadline_for(&spec));
        let execution_id = self.store.create_execution(&execution).await?;
        info!(
            execution_id = %execution_id,
            function_id = %function.id,
            runtime = %spec.runtime,
            memory_mb = spec.memory_mb,
            "Execution accepted"
        );

        let capture = Arc::new(LogCapture::new(self.config.log_cap_bytes));
        let drive = Drive {
            coordinator: self.clone(),
            execution_id: execution_id.clone(),
            capture: capture.clone(),
            invocation: Invocation {
                execution_id: execution_id.clone(),
                spec,
                code: function.code.clone(),
                input,
            },
        };

        if let Err(e) = tokio::spawn(drive.run()).await {
            error!(execution_id = %execution_id, error = %e, "Execution task failed");
            self.recover(&execution_id, &capture, e.to_string()).await?;
        }

        let record = self.store.get_execution(&execution_id).await?;
        record.ok_or(InvokeError::Store(StoreError::ExecutionNotFound { execution_id }))
    }

    /// Finalize an execution whose task died, from whatever state it reached.
    async fn recover(
        &self,
        execution_id: &str,
        capture: &LogCapture,
        reason: String,
    ) -> Result<(), StoreError> {
        let Some(record) = self.store.get_execution(execution_id).await? else {
            return Ok(());
        };
        if record.status.is_terminal() {
            return Ok(());
        }

        let error = ExecutionError::new(
            ErrorKind::InternalError,
            format!("execution task failed: {reason}"),
        );
        fail_execution(
            self.store.as_ref(),
            execution_id,
            record.status,
            error,
            Some(capture.snapshot()),
        )
        .await?;
        Ok(())
    }
}

/// Everything one detached run needs.
struct Drive {
    coordinator: Coordinator,
    execution_id: String,
    capture: Arc<LogCapture>,
    invocation: Invocation,
}

impl Drive {
    async fn run(self) {
        let store = &self.coordinator.store;
        let pool = &self.coordinator.pool;
        let config = &self.coordinator.config;
        let spec = &self.invocation.spec;
        let id = self.execution_id.as_str();

        let admission_deadline = Instant::now() + config.admission_timeout;
        let started = TransitionPayload::started(self.coordinator.deadline_for(spec));
        match store
            .transition(id, ExecutionStatus::Pending, ExecutionStatus::Running, &started)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                warn!(execution_id = %id, "Execution reconciled before it started");
                return;
            }
            Err(e) => {
                error!(execution_id = %id, error = %e, "Failed to mark execution running");
                return;
            }
        }

        let class = SandboxClass::new(spec.runtime, spec.memory_mb);
        let lease = match pool.acquire(class, id, admission_deadline).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(execution_id = %id, class = %class, error = %e, "No sandbox for execution");
                let error = ExecutionError::new(ErrorKind::ResourceExhausted, e.to_string());
                self.finalize(
                    ExecutionStatus::Failed,
                    TransitionPayload::failed(error, self.capture.snapshot(), None),
                )
                .await;
                return;
            }
        };
        let sandbox_id = lease.sandbox_id().to_string();

        let (status, payload, reusable) = match pool
            .lifecycle()
            .run(lease.sandbox(), &self.invocation, &self.capture)
            .await
        {
            Ok(report) => {
                let reusable = report.is_reusable();
                let (status, payload) = self.outcome(report);
                (status, payload, reusable)
            }
            Err(e) => {
                error!(execution_id = %id, sandbox_id = %sandbox_id, error = %e, "Run could not start");
                let error = ExecutionError::new(ErrorKind::InternalError, e.to_string());
                (
                    ExecutionStatus::Failed,
                    TransitionPayload::failed(error, self.capture.snapshot(), None),
                    false,
                )
            }
        };

        self.finalize(status, payload.with_sandbox(Some(sandbox_id)))
            .await;
        pool.release(lease, reusable).await;
    }

    fn outcome(&self, report: RunReport) -> (ExecutionStatus, TransitionPayload) {
        let logs = self.capture.snapshot();
        let duration_ms = report.duration.as_millis() as i64;
        let memory_peak_mb = report.memory_peak_mb.map(|mb| mb as i64);

        let (status, payload) = match (report.output, report.error) {
            (Some(output), None) => (
                ExecutionStatus::Success,
                TransitionPayload::succeeded(output, logs, duration_ms),
            ),
            (_, error) => {
                let error = error.unwrap_or_else(|| {
                    ExecutionError::new(ErrorKind::InternalError, "run ended without a result")
                });
                (
                    ExecutionStatus::Failed,
                    TransitionPayload::failed(error, logs, Some(duration_ms)),
                )
            }
        };
        (status, payload.with_memory_peak(memory_peak_mb))
    }

    async fn finalize(&self, status: ExecutionStatus, payload: TransitionPayload) {
        let id = self.execution_id.as_str();
        let kind = payload.error.as_ref().map(|e| e.kind);
        match self
            .coordinator
            .store
            .transition(id, ExecutionStatus::Running, status, &payload)
            .await
        {
            Ok(()) => info!(
                execution_id = %id,
                status = %status,
                error_kind = ?kind,
                duration_ms = ?payload.duration_ms,
                "Execution finished"
            ),
            Err(e) if e.is_conflict() => {
                warn!(execution_id = %id, "Execution already finalized by another writer");
            }
            Err(e) => {
                error!(execution_id = %id, error = %e, "Failed to record execution result");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::driver::MockDriver;
    use crate::sandbox::lifecycle::{LifecycleConfig, LifecycleController};
    use crate::sandbox::pool::PoolConfig;
    use serde_json::json;
    use voltrun_core::model::{FunctionStatus, NewFunction};
    use voltrun_core::persistence::SqliteStore;

    async fn coordinator(dir: &std::path::Path) -> Coordinator {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let lifecycle = Arc::new(LifecycleController::new(
            Arc::new(MockDriver::new(dir)),
            LifecycleConfig::default(),
        ));
        let pool = Arc::new(SandboxPool::new(lifecycle, PoolConfig::default()));
        Coordinator::new(
            store,
            pool,
            CoordinatorConfig {
                max_input_bytes: 64,
                ..Default::default()
            },
        )
    }

    fn function(code: &str) -> Function {
        NewFunction {
            name: "f".to_string(),
            runtime: "python311".to_string(),
            code: code.to_string(),
            ..Default::default()
        }
        .into_function()
        .unwrap()
    }

    #[tokio::test]
    async fn test_invoke_records_success() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;

        let record = coordinator
            .invoke(&function("log hello\nreturn {\"ok\":true}"), json!({}))
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.output, Some(json!({"ok": true})));
        assert_eq!(record.logs, "hello\n");
        assert!(record.error.is_none());
        assert!(record.sandbox_id.as_deref().is_some_and(|s| s.starts_with("sbx-")));
        assert!(record.started_at.is_some() && record.finished_at.is_some());
        assert!(record.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_rejected_invocations_leave_no_row() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;

        let mut disabled = function("echo");
        disabled.status = FunctionStatus::Disabled;
        let err = coordinator.invoke(&disabled, json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Validation(ValidationError::Function(FunctionValidationError::NotActive(_)))
        ));

        let err = coordinator
            .invoke(&function("echo"), json!({"blob": "x".repeat(100)}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Validation(ValidationError::InputTooLarge { limit: 64, .. })
        ));

        let count = coordinator
            .store()
            .count_executions(&Default::default())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_invoke_by_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        let err = coordinator.invoke_by_id("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, InvokeError::FunctionNotFound(_)));
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_run() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        let f = function("sleep 100\nreturn 7");
        coordinator.store().create_function(&f).await.unwrap();

        let call = {
            let coordinator = coordinator.clone();
            let id = f.id.clone();
            tokio::spawn(async move { coordinator.invoke_by_id(&id, json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        call.abort();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let records = coordinator
            .store()
            .list_executions(&Default::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Success);
        assert_eq!(records[0].output, Some(json!(7)));
    }
}
