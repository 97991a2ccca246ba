// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandbox drivers - the backends that boot environments and run processes.
//!
//! Drivers are pure mechanism: they never look at the execution store and
//! never decide when to kill. The lifecycle controller makes those calls.

pub mod mock;
pub mod process;

pub use mock::MockDriver;
pub use process::ProcessDriver;

use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::AsyncRead;

use super::Sandbox;

/// Errors from driver operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// The environment could not be booted.
    #[error("Provisioning failed: {0}")]
    Provision(String),

    /// The runtime process could not be started.
    #[error("Failed to start '{program}': {reason}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// Why it failed.
        reason: String,
    },

    /// A file path tried to leave the sandbox workspace.
    #[error("Path escapes the sandbox workspace: {0}")]
    PathEscape(String),

    /// Workspace still had content after a reset.
    #[error("Workspace not clean after reset: {0}")]
    DirtyWorkspace(String),

    /// Processes of an earlier run survived the kill.
    #[error("{count} process(es) still alive in group {pgid} after kill")]
    LingeringProcesses {
        /// Process group of the earlier run.
        pgid: u32,
        /// Live members found.
        count: usize,
    },

    /// Sandbox was used before being provisioned.
    #[error("Sandbox '{0}' has no workspace")]
    NotProvisioned(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// A command to run inside a sandbox workspace.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Workspace-relative path of the user code file.
    pub code_file: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn code_file(mut self, path: impl Into<String>) -> Self {
        self.code_file = path.into();
        self
    }
}

/// How a sandbox process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn killed() -> Self {
        Self {
            code: None,
            signal: Some(nix::sys::signal::Signal::SIGKILL as i32),
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// A process started inside a sandbox.
pub struct SandboxProcess {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    /// Resolves when the process exits (or is killed).
    pub exit: BoxFuture<'static, std::io::Result<ExitInfo>>,
}

/// Backend that boots sandboxes and runs processes in them.
///
/// Every call is addressed by sandbox: `kill` and `memory_usage_mb` act on
/// whatever the sandbox is currently running.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Driver type identifier (e.g., "process", "mock").
    fn driver_type(&self) -> &'static str;

    /// Boot the environment and return its workspace directory.
    async fn provision(&self, sandbox: &Sandbox) -> Result<PathBuf>;

    /// Start `command` inside the sandbox.
    async fn exec(&self, sandbox: &Sandbox, command: &CommandSpec) -> Result<SandboxProcess>;

    /// Hard-kill everything running in the sandbox. Idempotent.
    async fn kill(&self, sandbox: &Sandbox) -> Result<()>;

    /// Current memory use of the sandbox, if it can be sampled.
    async fn memory_usage_mb(&self, sandbox: &Sandbox) -> Option<u64>;

    /// Kill leftovers, wipe the workspace and verify it is empty.
    async fn reset(&self, sandbox: &Sandbox) -> Result<()> {
        self.kill(sandbox).await?;
        wipe_workspace(sandbox).await
    }

    /// Tear the environment down.
    async fn destroy(&self, sandbox: &Sandbox) -> Result<()>;

    /// Write a file into the workspace.
    async fn write_file(&self, sandbox: &Sandbox, relative: &str, contents: &[u8]) -> Result<()> {
        let path = resolve_in_workspace(sandbox, relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }
}

/// Join `relative` onto the workspace, rejecting absolute paths and `..`.
pub fn resolve_in_workspace(sandbox: &Sandbox, relative: &str) -> Result<PathBuf> {
    let workspace = sandbox.workspace();
    if workspace.as_os_str().is_empty() {
        return Err(DriverError::NotProvisioned(sandbox.id().to_string()));
    }
    let rel = Path::new(relative);
    let safe = !relative.is_empty()
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(DriverError::PathEscape(relative.to_string()));
    }
    Ok(workspace.join(rel))
}

/// Remove every entry in the workspace, then confirm nothing is left.
pub async fn wipe_workspace(sandbox: &Sandbox) -> Result<()> {
    let workspace = sandbox.workspace();
    if workspace.as_os_str().is_empty() {
        return Err(DriverError::NotProvisioned(sandbox.id().to_string()));
    }

    let mut entries = tokio::fs::read_dir(workspace).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }

    let mut check = tokio::fs::read_dir(workspace).await?;
    if let Some(leftover) = check.next_entry().await? {
        return Err(DriverError::DirtyWorkspace(
            leftover.path().display().to_string(),
        ));
    }
    Ok(())
}
