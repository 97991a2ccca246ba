// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for voltrun-engine.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Execution or function store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] voltrun_core::StoreError),

    /// Sandbox driver operation failed.
    #[error("Driver error: {0}")]
    Driver(#[from] crate::sandbox::DriverError),

    /// Sandbox lifecycle operation failed.
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] crate::sandbox::LifecycleError),

    /// Sandbox pool could not serve a lease.
    #[error("Pool error: {0}")]
    Pool(#[from] crate::sandbox::PoolError),

    /// Runtime adapter failed to stage or run code.
    #[error("Adapter error: {0}")]
    Adapter(#[from] crate::adapter::AdapterError),

    /// Invocation was rejected or could not be recorded.
    #[error("Invoke error: {0}")]
    Invoke(#[from] crate::coordinator::InvokeError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using engine Error.
pub type Result<T> = std::result::Result<T, Error>;
