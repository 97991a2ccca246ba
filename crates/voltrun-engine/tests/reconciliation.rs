// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Watchdog and startup reconciliation against live and orphaned executions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{TestContext, memory_store};
use serde_json::json;
use voltrun_core::model::{
    ErrorKind, ExecutionError, ExecutionStatus, NewExecution, TransitionPayload,
};
use voltrun_engine::runtime::EngineRuntime;
use voltrun_engine::sandbox::driver::MockDriver;
use voltrun_engine::watchdog::fail_execution;

#[tokio::test]
async fn test_watchdog_and_coordinator_race_has_one_winner() {
    let ctx = TestContext::new().await;
    let function = ctx.function("nodejs20", "sleep 300\nreturn 1", 5).await;

    let invoke = tokio::spawn({
        let coordinator = ctx.coordinator.clone();
        let function = function.clone();
        async move { coordinator.invoke(&function, json!({})).await }
    });

    // Wait until the run is executing inside its sandbox.
    let execution_id = loop {
        let rows = ctx
            .store
            .list_executions(&Default::default(), 10, 0)
            .await
            .unwrap();
        if let Some(row) = rows.first()
            && row.status == ExecutionStatus::Running
            && ctx.driver.running_count() == 1
        {
            break row.id.clone();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let won = fail_execution(
        ctx.store.as_ref(),
        &execution_id,
        ExecutionStatus::Running,
        ExecutionError::new(ErrorKind::ExecutionTimeout, "deadline passed"),
        None,
    )
    .await
    .unwrap();
    assert!(won);

    // The coordinator's success write loses and the record keeps the first outcome.
    let record = invoke.await.unwrap().unwrap();
    assert_eq!(record.id, execution_id);
    assert_eq!(record.status, ExecutionStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ExecutionTimeout);
    assert_eq!(error.message, "deadline passed");
    assert!(record.output.is_none());

    // The sandbox still went back to the pool.
    let stats = ctx.pool.stats();
    assert_eq!(stats[0].leased, 0);
    assert_eq!(stats[0].idle, 1);
}

#[tokio::test]
async fn test_late_watchdog_loses_to_finished_execution() {
    let ctx = TestContext::new().await;
    let function = ctx.function("nodejs20", "return 7", 5).await;

    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Success);

    let won = fail_execution(
        ctx.store.as_ref(),
        &record.id,
        ExecutionStatus::Running,
        ExecutionError::new(ErrorKind::ExecutionTimeout, "too late"),
        None,
    )
    .await
    .unwrap();
    assert!(!won);

    let stored = ctx.store.get_execution(&record.id).await.unwrap().unwrap();
    assert_eq!(stored, record);
}

#[tokio::test]
async fn test_engine_start_fails_orphaned_executions() {
    let store = memory_store().await;
    let deadline = Utc::now() + chrono::Duration::minutes(5);

    let pending = store
        .create_execution(&NewExecution::new("fn-gone", json!({}), deadline))
        .await
        .unwrap();
    let running = store
        .create_execution(&NewExecution::new("fn-gone", json!({}), deadline))
        .await
        .unwrap();
    store
        .transition(
            &running,
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            &TransitionPayload::started(deadline),
        )
        .await
        .unwrap();

    let workspaces = tempfile::tempdir().unwrap();
    let runtime = EngineRuntime::builder()
        .store(store.clone())
        .driver(Arc::new(MockDriver::new(workspaces.path())))
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    for id in [&pending, &running] {
        let record = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        let error = record.error.unwrap();
        assert_eq!(error.kind, ErrorKind::InternalError);
        assert!(record.finished_at.is_some());
    }

    runtime.shutdown().await.unwrap();
}
