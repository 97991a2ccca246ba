// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use voltrun_core::model::{MEMORY_MB_MAX, MEMORY_MB_MIN};

use crate::capture::MIN_LOG_CAP_BYTES;
use crate::coordinator::CoordinatorConfig;
use crate::sandbox::SandboxClass;
use crate::sandbox::pool::PoolConfig;
use crate::watchdog::WatchdogConfig;

const DEFAULT_DATABASE_URL: &str = "sqlite:.data/voltrun.db?mode=rwc";

/// Which sandbox driver the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Process,
    Mock,
}

impl FromStr for DriverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(DriverKind::Process),
            "mock" => Ok(DriverKind::Mock),
            _ => Err(ConfigError::Invalid(
                "VOLTRUN_SANDBOX_DRIVER",
                "must be 'process' or 'mock'",
            )),
        }
    }
}

/// VoltRun engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite or PostgreSQL connection URL
    pub database_url: String,
    /// REST server address
    pub http_addr: SocketAddr,
    /// Root for sandbox workspaces
    pub data_dir: PathBuf,
    pub driver: DriverKind,
    pub pool: PoolConfig,
    pub coordinator: CoordinatorConfig,
    pub watchdog: WatchdogConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional:
    /// - `VOLTRUN_DATABASE_URL` / `DATABASE_URL`: store URL (default: `sqlite:.data/voltrun.db?mode=rwc`)
    /// - `VOLTRUN_HTTP_PORT` / `PORT`: REST port (default: 8080)
    /// - `DATA_DIR`: sandbox workspace root (default: `.data`)
    /// - `VOLTRUN_SANDBOX_DRIVER`: `process` or `mock` (default: `process`)
    /// - `VOLTRUN_POOL_MAX_GLOBAL` (64), `VOLTRUN_POOL_MAX_PER_CLASS` (16),
    ///   `VOLTRUN_POOL_MIN_WARM` (1), `VOLTRUN_POOL_IDLE_TARGET` (4),
    ///   `VOLTRUN_POOL_IDLE_TTL_SECS` (300)
    /// - `VOLTRUN_WARM_CLASSES`: comma separated `runtime:memory_mb` (default: `nodejs20:128`)
    /// - `VOLTRUN_ADMISSION_TIMEOUT_MS` (5000), `VOLTRUN_LOG_CAP_BYTES` (65536),
    ///   `VOLTRUN_MAX_INPUT_BYTES` (262144), `VOLTRUN_TEARDOWN_GRACE_MS` (500)
    /// - `VOLTRUN_WATCHDOG_INTERVAL_SECS` (15)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = var_any(&["VOLTRUN_DATABASE_URL", "DATABASE_URL"])
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let http_port: u16 = match var_any(&["VOLTRUN_HTTP_PORT", "PORT"]) {
            Some(port) => port.parse().map_err(|_| {
                ConfigError::Invalid("VOLTRUN_HTTP_PORT", "must be a valid port number")
            })?,
            None => 8080,
        };

        let data_dir = PathBuf::from(
            std::env::var("DATA_DIR").unwrap_or_else(|_| ".data".to_string()),
        );

        let driver = match std::env::var("VOLTRUN_SANDBOX_DRIVER") {
            Ok(value) => value.parse()?,
            Err(_) => DriverKind::Process,
        };

        let warm_classes = parse_classes(
            &std::env::var("VOLTRUN_WARM_CLASSES").unwrap_or_else(|_| "nodejs20:128".to_string()),
        )?;

        let pool = PoolConfig {
            max_global: positive("VOLTRUN_POOL_MAX_GLOBAL", 64)?,
            max_per_class: positive("VOLTRUN_POOL_MAX_PER_CLASS", 16)?,
            min_warm: number("VOLTRUN_POOL_MIN_WARM", 1)?,
            idle_target: number("VOLTRUN_POOL_IDLE_TARGET", 4)?,
            idle_ttl: Duration::from_secs(positive("VOLTRUN_POOL_IDLE_TTL_SECS", 300)?),
            warm_classes,
            ..Default::default()
        };

        let coordinator = CoordinatorConfig {
            admission_timeout: Duration::from_millis(positive(
                "VOLTRUN_ADMISSION_TIMEOUT_MS",
                5000,
            )?),
            log_cap_bytes: log_cap()?,
            max_input_bytes: positive("VOLTRUN_MAX_INPUT_BYTES", 262144)?,
            teardown_grace: Duration::from_millis(number("VOLTRUN_TEARDOWN_GRACE_MS", 500)?),
        };

        let watchdog = WatchdogConfig {
            poll_interval: Duration::from_secs(positive("VOLTRUN_WATCHDOG_INTERVAL_SECS", 15)?),
            ..Default::default()
        };

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            data_dir,
            driver,
            pool,
            coordinator,
            watchdog,
        })
    }
}

fn var_any(keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
}

fn number<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn positive<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let value = number(key, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn log_cap() -> Result<usize, ConfigError> {
    let cap = number("VOLTRUN_LOG_CAP_BYTES", 65536)?;
    if cap < MIN_LOG_CAP_BYTES {
        return Err(ConfigError::Invalid(
            "VOLTRUN_LOG_CAP_BYTES",
            "must leave room for the truncation marker (at least 32 bytes)",
        ));
    }
    Ok(cap)
}

fn parse_classes(raw: &str) -> Result<Vec<SandboxClass>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let class = s.parse::<SandboxClass>().map_err(|_| {
                ConfigError::Invalid(
                    "VOLTRUN_WARM_CLASSES",
                    "must be a comma separated list of runtime:memory_mb",
                )
            })?;
            let memory = i64::from(class.memory_mb);
            if memory < i64::from(MEMORY_MB_MIN) || memory > i64::from(MEMORY_MB_MAX) {
                return Err(ConfigError::Invalid(
                    "VOLTRUN_WARM_CLASSES",
                    "memory_mb must be within 128..=10240",
                ));
            }
            Ok(class)
        })
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
