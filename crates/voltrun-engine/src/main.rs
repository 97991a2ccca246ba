// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VoltRun Engine - Function Execution Server
//!
//! An HTTP server responsible for:
//! - Function registry (create, list, update, delete)
//! - Synchronous function execution in pooled sandboxes
//! - Execution history and logs

use tracing::{info, warn};

use voltrun_engine::config::Config;
use voltrun_engine::runtime::{EngineRuntime, driver_from_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voltrun_engine=info,voltrun_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        data_dir = %config.data_dir.display(),
        driver = ?config.driver,
        "Starting VoltRun Engine"
    );

    let driver = driver_from_config(&config)?;
    let store = voltrun_core::persistence::connect(&config.database_url).await?;
    info!("Connected to store");

    let runtime = EngineRuntime::builder()
        .config(&config)
        .store(store)
        .driver(driver)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.bind_addr(), "VoltRun Engine ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("VoltRun Engine shut down");

    Ok(())
}
