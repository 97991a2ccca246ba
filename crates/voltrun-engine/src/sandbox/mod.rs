// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandboxes: isolated, resource-bounded environments hosting one invocation
//! at a time.
//!
//! - [`driver`] boots environments and runs processes inside them
//! - [`lifecycle`] moves a sandbox through its states and enforces limits
//! - [`pool`] owns every sandbox and leases them to executions
//!
//! ```text
//! cold ─► provisioning ─► ready ─► busy ─► draining ─► destroyed
//!              ▲    │        │               │
//!              │    └────────┼───────────────┼─► destroyed (boot failure)
//!              │             └─► draining    │
//!              └─────────────────────────────┘ (reset for reuse)
//! ```

pub mod driver;
pub mod lifecycle;
pub mod pool;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tokio::time::Instant;
use voltrun_core::model::Runtime;

pub use driver::{DriverError, SandboxDriver};
pub use lifecycle::{LifecycleController, LifecycleError};
pub use pool::{PoolError, SandboxLease, SandboxPool};

/// A (runtime, memory) class. Sandboxes are only ever reused within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SandboxClass {
    pub runtime: Runtime,
    pub memory_mb: u32,
}

impl SandboxClass {
    pub fn new(runtime: Runtime, memory_mb: u32) -> Self {
        Self { runtime, memory_mb }
    }
}

impl fmt::Display for SandboxClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.runtime, self.memory_mb)
    }
}

impl FromStr for SandboxClass {
    type Err = String;

    /// Parse `runtime:memory_mb`, e.g. `nodejs20:128`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (runtime, memory) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected 'runtime:memory_mb', got '{s}'"))?;
        let runtime = runtime.parse::<Runtime>().map_err(|e| e.to_string())?;
        let memory_mb = memory
            .parse::<u32>()
            .map_err(|_| format!("invalid memory_mb in '{s}'"))?;
        Ok(Self { runtime, memory_mb })
    }
}

/// Sandbox states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxState {
    Cold,
    Provisioning,
    Ready,
    Busy,
    Draining,
    Destroyed,
}

impl SandboxState {
    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, next),
            (Cold, Provisioning)
                | (Provisioning, Ready)
                | (Provisioning, Destroyed)
                | (Ready, Busy)
                | (Ready, Draining)
                | (Busy, Draining)
                | (Draining, Provisioning)
                | (Draining, Destroyed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Cold => "cold",
            SandboxState::Provisioning => "provisioning",
            SandboxState::Ready => "ready",
            SandboxState::Busy => "busy",
            SandboxState::Draining => "draining",
            SandboxState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected sandbox state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sandbox '{sandbox_id}' cannot move from '{from}' to '{to}'")]
pub struct InvalidSandboxTransition {
    pub sandbox_id: String,
    pub from: SandboxState,
    pub to: SandboxState,
}

/// One isolated environment. Owned by the pool; lent to one execution at a time.
#[derive(Debug)]
pub struct Sandbox {
    id: String,
    class: SandboxClass,
    state: SandboxState,
    assigned_execution_id: Option<String>,
    workspace: PathBuf,
    created_at: Instant,
    last_used_at: Instant,
    runs_completed: u64,
}

impl Sandbox {
    /// A fresh, cold sandbox for `class`.
    pub fn new(class: SandboxClass) -> Self {
        let now = Instant::now();
        Self {
            id: format!("sbx-{}", uuid::Uuid::new_v4().simple()),
            class,
            state: SandboxState::Cold,
            assigned_execution_id: None,
            workspace: PathBuf::new(),
            created_at: now,
            last_used_at: now,
            runs_completed: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> SandboxClass {
        self.class
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn assigned_execution_id(&self) -> Option<&str> {
        self.assigned_execution_id.as_deref()
    }

    /// Workspace directory, set once the driver has provisioned the sandbox.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub(crate) fn set_workspace(&mut self, workspace: PathBuf) {
        self.workspace = workspace;
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed
    }

    pub(crate) fn transition(&mut self, to: SandboxState) -> Result<(), InvalidSandboxTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidSandboxTransition {
                sandbox_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        if self.state == SandboxState::Busy {
            self.assigned_execution_id = None;
            self.runs_completed += 1;
            self.last_used_at = Instant::now();
        }
        self.state = to;
        Ok(())
    }

    /// Lease a ready sandbox to an execution (`ready -> busy`).
    pub(crate) fn bind(&mut self, execution_id: &str) -> Result<(), InvalidSandboxTransition> {
        self.transition(SandboxState::Busy)?;
        self.assigned_execution_id = Some(execution_id.to_string());
        self.last_used_at = Instant::now();
        Ok(())
    }
}
