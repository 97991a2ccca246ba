// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use voltrun_core::model::{Function, NewFunction};
use voltrun_core::persistence::{SqliteStore, Store};
use voltrun_engine::coordinator::{Coordinator, CoordinatorConfig};
use voltrun_engine::sandbox::driver::MockDriver;
use voltrun_engine::sandbox::lifecycle::{LifecycleConfig, LifecycleController};
use voltrun_engine::sandbox::pool::PoolConfig;
use voltrun_engine::sandbox::SandboxPool;

/// In-memory store with migrations applied.
pub async fn memory_store() -> Arc<dyn Store> {
    Arc::new(
        SqliteStore::connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory store"),
    )
}

/// Lifecycle settings tuned for fast tests.
pub fn fast_lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        provision_backoff: Duration::from_millis(5),
        memory_poll_interval: Duration::from_millis(10),
        kill_grace: Duration::from_millis(200),
        ..Default::default()
    }
}

/// A coordinator over an in-memory store and the mock driver.
pub struct TestContext {
    pub store: Arc<dyn Store>,
    pub driver: Arc<MockDriver>,
    pub pool: Arc<SandboxPool>,
    pub coordinator: Coordinator,
    _workspaces: TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(PoolConfig::default(), CoordinatorConfig::default()).await
    }

    pub async fn with_config(pool_config: PoolConfig, coordinator_config: CoordinatorConfig) -> Self {
        let workspaces = TempDir::new().unwrap();
        let store = memory_store().await;
        let driver = Arc::new(MockDriver::new(workspaces.path()));
        let lifecycle = Arc::new(LifecycleController::new(driver.clone(), fast_lifecycle()));
        let pool = Arc::new(SandboxPool::new(lifecycle, pool_config));
        let coordinator = Coordinator::new(store.clone(), pool.clone(), coordinator_config);

        Self {
            store,
            driver,
            pool,
            coordinator,
            _workspaces: workspaces,
        }
    }

    /// Register a function running `script` on the mock driver.
    pub async fn function(&self, runtime: &str, script: &str, timeout_sec: i32) -> Function {
        let function = new_function(runtime, script, timeout_sec)
            .into_function()
            .unwrap();
        self.store.create_function(&function).await.unwrap();
        function
    }
}

pub fn new_function(runtime: &str, script: &str, timeout_sec: i32) -> NewFunction {
    NewFunction {
        name: "test-fn".to_string(),
        runtime: runtime.to_string(),
        code: script.to_string(),
        timeout_sec: Some(timeout_sec),
        ..Default::default()
    }
}
