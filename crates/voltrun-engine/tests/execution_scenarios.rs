// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end invocation behavior over the mock driver.

mod common;

use std::time::Duration;

use common::TestContext;
use serde_json::json;
use tokio::time::Instant;
use voltrun_core::model::{ErrorKind, ExecutionStatus, Runtime, TransitionPayload};
use voltrun_engine::adapter::ERROR_MARKER;
use voltrun_engine::capture::TRUNCATION_MARKER;
use voltrun_engine::coordinator::CoordinatorConfig;
use voltrun_engine::sandbox::SandboxClass;
use voltrun_engine::sandbox::pool::PoolConfig;

#[tokio::test]
async fn test_successful_invocation() {
    let ctx = TestContext::new().await;
    let function = ctx
        .function("nodejs20", "log starting\nreturn {\"result\": 42}", 10)
        .await;

    let record = ctx
        .coordinator
        .invoke_by_id(&function.id, json!({"n": 1}))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(record.output, Some(json!({"result": 42})));
    assert_eq!(record.input, json!({"n": 1}));
    assert_eq!(record.logs, "starting\n");
    assert!(record.error.is_none());

    let started = record.started_at.unwrap();
    let finished = record.finished_at.unwrap();
    assert!(record.created_at <= started && started <= finished);
}

#[tokio::test]
async fn test_timeout_kills_the_run() {
    let ctx = TestContext::new().await;
    let function = ctx
        .function("python311", "log working\nsleep 5000\nreturn 1", 1)
        .await;

    let begin = Instant::now();
    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();
    let elapsed = begin.elapsed();

    assert_eq!(record.status, ExecutionStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ExecutionTimeout);
    assert!(record.output.is_none());
    assert_eq!(record.logs, "working\n");

    // Bounded by the timeout plus the kill grace.
    let duration_ms = record.duration_ms.unwrap();
    assert!(duration_ms >= 1000, "duration {duration_ms}ms");
    assert!(duration_ms <= 1000 + 500, "duration {duration_ms}ms");
    assert!(elapsed < Duration::from_secs(3));

    // A timed-out sandbox is never handed out again.
    assert_eq!(ctx.pool.stats()[0].idle, 0);
    assert_eq!(ctx.driver.destroyed_count(), 1);
}

#[tokio::test]
async fn test_admission_timeout_when_class_is_saturated() {
    let ctx = TestContext::with_config(
        PoolConfig {
            max_per_class: 1,
            ..Default::default()
        },
        CoordinatorConfig {
            admission_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    )
    .await;
    let function = ctx.function("nodejs20", "return 1", 5).await;

    let holder = ctx
        .pool
        .acquire(
            SandboxClass::new(Runtime::Nodejs20, 128),
            "holder",
            Instant::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();

    let begin = Instant::now();
    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.unwrap().kind, ErrorKind::ResourceExhausted);
    assert!(record.sandbox_id.is_none());
    assert!(begin.elapsed() >= Duration::from_millis(200));

    // Capacity comes back once the holder releases.
    ctx.pool.release(holder, true).await;
    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_thrown_error_crashes_execution() {
    let ctx = TestContext::new().await;
    let function = ctx
        .function("nodejs20", "log before\nthrow boom happened", 5)
        .await;

    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ExecutionCrashed);
    assert!(error.message.contains("boom happened"));
    assert!(record.logs.contains("before"));
    assert!(record.logs.contains(ERROR_MARKER));
    assert!(record.output.is_none());
}

#[tokio::test]
async fn test_nonzero_exit_without_result_crashes() {
    let ctx = TestContext::new().await;
    let function = ctx.function("go121", "warn fatal\nexit 3", 5).await;

    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ExecutionCrashed);
    assert!(error.message.contains("exit code 3"));
    assert_eq!(record.logs, "fatal\n");
}

#[tokio::test]
async fn test_handler_without_return_value_succeeds() {
    let ctx = TestContext::new().await;
    let function = ctx
        .function("python39", "def handler(event):\n    pass", 5)
        .await;

    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(
        record.output,
        Some(json!({"message": "Execution completed"}))
    );
}

#[tokio::test]
async fn test_memory_limit_kills_the_run() {
    let ctx = TestContext::new().await;
    let function = ctx
        .function("nodejs18", "alloc 4096\nsleep 2000\nreturn 1", 5)
        .await;

    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.unwrap().kind, ErrorKind::OomKilled);
    assert!(record.memory_peak_mb.unwrap() >= 4096);
    assert!(record.duration_ms.unwrap() < 2000);
}

#[tokio::test]
async fn test_logs_are_capped_with_marker() {
    let ctx = TestContext::with_config(
        PoolConfig::default(),
        CoordinatorConfig {
            log_cap_bytes: 256,
            ..Default::default()
        },
    )
    .await;
    let function = ctx
        .function("nodejs20", "spam 200 0123456789abcdef\nreturn \"done\"", 5)
        .await;

    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(record.output, Some(json!("done")));
    assert!(record.logs.len() <= 256);
    assert!(record.logs.ends_with(TRUNCATION_MARKER));
    assert!(record.logs.starts_with("0123456789abcdef\n"));
}

#[tokio::test]
async fn test_concurrent_invocations_never_share_a_sandbox() {
    let ctx = TestContext::with_config(
        PoolConfig {
            max_per_class: 4,
            idle_target: 4,
            ..Default::default()
        },
        CoordinatorConfig::default(),
    )
    .await;
    let function = ctx.function("nodejs20", "sleep 50\necho", 10).await;

    let driver = ctx.driver.clone();
    let monitor = tokio::spawn(async move {
        let mut max_running = 0;
        for _ in 0..100 {
            max_running = max_running.max(driver.running_count());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        max_running
    });

    let mut handles = Vec::new();
    for i in 0..12 {
        let coordinator = ctx.coordinator.clone();
        let function = function.clone();
        handles.push(tokio::spawn(async move {
            coordinator.invoke(&function, json!({"i": i})).await
        }));
    }

    let mut records = Vec::new();
    for handle in handles {
        records.push(handle.await.unwrap().unwrap());
    }

    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.status, ExecutionStatus::Success);
        // Each run saw its own input and nobody else's.
        assert_eq!(record.output, Some(json!({"i": i})));
    }

    assert!(monitor.await.unwrap() <= 4);
    assert_eq!(ctx.driver.exec_count(), 12);
    assert!(ctx.driver.provisioned_count() <= 4);
    let stats = ctx.pool.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].leased, 0);
}

#[tokio::test]
async fn test_sandboxes_are_reused_only_within_their_class() {
    let ctx = TestContext::new().await;
    let small = ctx.function("nodejs20", "return 1", 5).await;
    let python = ctx.function("python311", "return 2", 5).await;

    let first = ctx.coordinator.invoke(&small, json!({})).await.unwrap();
    let second = ctx.coordinator.invoke(&small, json!({})).await.unwrap();
    let third = ctx.coordinator.invoke(&python, json!({})).await.unwrap();

    assert_eq!(first.sandbox_id, second.sandbox_id);
    assert_ne!(first.sandbox_id, third.sandbox_id);
    assert_eq!(ctx.driver.provisioned_count(), 2);
}

#[tokio::test]
async fn test_terminal_record_is_stable() {
    let ctx = TestContext::new().await;
    let function = ctx.function("nodejs20", "return {\"a\": 1}", 5).await;

    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();
    let first = ctx.store.get_execution(&record.id).await.unwrap().unwrap();
    let second = ctx.store.get_execution(&record.id).await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first, record);

    // No writer can move a terminal record.
    let err = ctx
        .store
        .transition(
            &record.id,
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            &TransitionPayload::failed(
                voltrun_core::model::ExecutionError::new(ErrorKind::InternalError, "late"),
                String::new(),
                None,
            ),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    let third = ctx.store.get_execution(&record.id).await.unwrap().unwrap();
    assert_eq!(third, record);
}

#[tokio::test]
async fn test_provisioning_retries_then_succeeds() {
    let ctx = TestContext::new().await;
    let function = ctx.function("nodejs20", "return 1", 5).await;

    ctx.driver.fail_next_provisions(2);
    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_provisioning_exhaustion_is_resource_exhausted() {
    let ctx = TestContext::new().await;
    let function = ctx.function("nodejs20", "return 1", 5).await;

    ctx.driver.fail_next_provisions(10);
    let record = ctx
        .coordinator
        .invoke(&function, json!({}))
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.unwrap().kind, ErrorKind::ResourceExhausted);
    assert_eq!(ctx.pool.stats()[0].leased, 0);
}
