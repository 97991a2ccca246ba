// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for voltrun-engine.
//!
//! [`EngineRuntime`] owns every piece of engine state: the sandbox pool, the
//! coordinator, the background workers and the HTTP server. Nothing is global,
//! so tests can start several engines side by side.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use voltrun_engine::runtime::EngineRuntime;
//! use voltrun_engine::sandbox::driver::process::{ProcessDriver, ProcessDriverConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = voltrun_core::persistence::connect("sqlite:.data/voltrun.db?mode=rwc").await?;
//!     let driver = Arc::new(ProcessDriver::new(ProcessDriverConfig::from_data_dir(".data")));
//!
//!     let runtime = EngineRuntime::builder()
//!         .store(store)
//!         .driver(driver)
//!         .bind_addr("0.0.0.0:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve requests ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Start order: reconcile executions left by a previous run, pre-warm the
//! pool, spawn the pool maintainer and the watchdog, then accept requests.
//! Shutdown runs in reverse: stop accepting (in-flight requests finish), stop
//! the workers, drain and destroy every sandbox.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};
use voltrun_core::persistence::Store;

use crate::config::{Config, DriverKind};
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::sandbox::driver::mock::MockDriver;
use crate::sandbox::driver::process::{ProcessDriver, ProcessDriverConfig};
use crate::sandbox::lifecycle::LifecycleConfig;
use crate::sandbox::pool::{PoolConfig, PoolMaintainer};
use crate::sandbox::{LifecycleController, SandboxDriver, SandboxPool};
use crate::server;
use crate::watchdog::{Watchdog, WatchdogConfig};

/// Build the sandbox driver selected by `config`, creating its data
/// directory.
pub fn driver_from_config(config: &Config) -> crate::Result<Arc<dyn SandboxDriver>> {
    std::fs::create_dir_all(&config.data_dir)?;
    let driver: Arc<dyn SandboxDriver> = match config.driver {
        DriverKind::Process => Arc::new(ProcessDriver::new(ProcessDriverConfig::from_data_dir(
            &config.data_dir,
        ))),
        DriverKind::Mock => Arc::new(MockDriver::new(config.data_dir.join("sandboxes"))),
    };
    Ok(driver)
}

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    driver: Option<Arc<dyn SandboxDriver>>,
    bind_addr: SocketAddr,
    pool_config: PoolConfig,
    lifecycle_config: LifecycleConfig,
    coordinator_config: CoordinatorConfig,
    watchdog_config: WatchdogConfig,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            driver: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            pool_config: PoolConfig::default(),
            lifecycle_config: LifecycleConfig::default(),
            coordinator_config: CoordinatorConfig::default(),
            watchdog_config: WatchdogConfig::default(),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take address and limits from a loaded [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.bind_addr(config.http_addr)
            .pool_config(config.pool.clone())
            .coordinator_config(config.coordinator.clone())
            .watchdog_config(config.watchdog.clone())
    }

    /// Set the execution and function store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the sandbox driver (required).
    pub fn driver(mut self, driver: Arc<dyn SandboxDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the bind address for the HTTP server. Port 0 picks a free port.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn lifecycle_config(mut self, config: LifecycleConfig) -> Self {
        self.lifecycle_config = config;
        self
    }

    pub fn coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator_config = config;
        self
    }

    pub fn watchdog_config(mut self, config: WatchdogConfig) -> Self {
        self.watchdog_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("driver is required"))?;

        Ok(EngineRuntimeConfig {
            store,
            driver,
            bind_addr: self.bind_addr,
            pool_config: self.pool_config,
            lifecycle_config: self.lifecycle_config,
            coordinator_config: self.coordinator_config,
            watchdog_config: self.watchdog_config,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    store: Arc<dyn Store>,
    driver: Arc<dyn SandboxDriver>,
    bind_addr: SocketAddr,
    pool_config: PoolConfig,
    lifecycle_config: LifecycleConfig,
    coordinator_config: CoordinatorConfig,
    watchdog_config: WatchdogConfig,
}

impl EngineRuntimeConfig {
    /// Start the runtime: reconcile, pre-warm, spawn workers and the server.
    pub async fn start(self) -> Result<EngineRuntime> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let bind_addr = listener.local_addr()?;

        let watchdog = Watchdog::new(self.store.clone(), self.watchdog_config);
        let reconciled = watchdog.reconcile_on_startup().await?;

        let lifecycle = Arc::new(LifecycleController::new(
            self.driver.clone(),
            self.lifecycle_config,
        ));
        let pool = Arc::new(SandboxPool::new(lifecycle, self.pool_config));
        let warmed = pool.prefill().await;

        let maintainer = PoolMaintainer::new(pool.clone());
        let maintainer_shutdown = maintainer.shutdown_handle();
        let maintainer_handle = tokio::spawn(async move {
            maintainer.run().await;
        });

        let watchdog_shutdown = watchdog.shutdown_handle();
        let watchdog_handle = tokio::spawn(async move {
            watchdog.run().await;
        });

        let coordinator = Coordinator::new(self.store.clone(), pool.clone(), self.coordinator_config);

        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(server::serve_with_shutdown(
            listener,
            coordinator.clone(),
            server_shutdown_rx,
        ));

        info!(
            bind_addr = %bind_addr,
            driver = self.driver.driver_type(),
            reconciled = reconciled,
            warmed = warmed,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            server_handle,
            maintainer_handle,
            watchdog_handle,
            server_shutdown_tx,
            maintainer_shutdown,
            watchdog_shutdown,
            coordinator,
            bind_addr,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// The runtime manages:
/// - HTTP server for the REST API
/// - Pool maintainer for warm sandboxes and idle eviction
/// - Watchdog for executions that passed their deadline
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    server_handle: JoinHandle<Result<()>>,
    maintainer_handle: JoinHandle<()>,
    watchdog_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    maintainer_shutdown: Arc<Notify>,
    watchdog_shutdown: Arc<Notify>,
    coordinator: Coordinator,
    bind_addr: SocketAddr,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Address the HTTP server is bound to.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Check if the server and workers are still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
            && !self.maintainer_handle.is_finished()
            && !self.watchdog_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting requests and waits for in-flight ones, stops the
    /// background workers, then drains and destroys every pooled sandbox.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        // Signal server shutdown
        let _ = self.server_shutdown_tx.send(true);
        let server_result = match self.server_handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("HTTP server task panicked: {}", e);
                Err(anyhow::anyhow!("HTTP server task panicked: {}", e))
            }
        };

        self.maintainer_shutdown.notify_one();
        self.watchdog_shutdown.notify_one();

        if let Err(e) = self.maintainer_handle.await {
            error!("Pool maintainer task panicked: {}", e);
        }
        if let Err(e) = self.watchdog_handle.await {
            error!("Watchdog task panicked: {}", e);
        }

        self.coordinator.pool().shutdown().await;

        match server_result {
            Ok(()) => {
                info!("EngineRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("HTTP server error during shutdown: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxClass;
    use voltrun_core::model::Runtime;
    use voltrun_core::persistence::SqliteStore;

    #[test]
    fn test_build_requires_store() {
        let err = EngineRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("store is required"));

        let temp = tempfile::tempdir().unwrap();
        let err = EngineRuntime::builder()
            .driver(Arc::new(MockDriver::new(temp.path())))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("store is required"));
    }

    #[tokio::test]
    async fn test_build_requires_driver() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let err = EngineRuntime::builder().store(store).build().err().unwrap();
        assert!(err.to_string().contains("driver is required"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let temp = tempfile::tempdir().unwrap();
        let driver = Arc::new(MockDriver::new(temp.path()));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());

        let runtime = EngineRuntime::builder()
            .store(store)
            .driver(driver.clone())
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .pool_config(PoolConfig {
                warm_classes: vec![SandboxClass::new(Runtime::Nodejs20, 128)],
                ..Default::default()
            })
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_ne!(runtime.bind_addr().port(), 0);
        assert!(runtime.is_running());
        assert_eq!(driver.provisioned_count(), 1);

        runtime.shutdown().await.unwrap();
        assert_eq!(driver.destroyed_count(), 1);
    }
}
