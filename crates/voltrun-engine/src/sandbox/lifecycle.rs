// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandbox lifecycle controller.
//!
//! Moves sandboxes through their states via the driver and supervises one
//! run at a time: the wall-clock deadline and the memory ceiling are enforced
//! here, never inside the adapters.
//!
//! A run ends in exactly one [`RunState`]. Completion is polled before the
//! deadline and the memory sampler, so a result that is already available
//! when the deadline fires wins.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use voltrun_core::model::{ErrorKind, ExecutionError, FunctionSpec};

use super::driver::{DriverError, SandboxDriver};
use super::{InvalidSandboxTransition, Sandbox, SandboxState};
use crate::adapter::{self, AdapterError, AdapterOutput, AdapterRegistry, RunRequest, RunResult};
use crate::capture::LogCapture;

/// Lifecycle tuning.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Boot attempts before giving up.
    pub provision_attempts: u32,
    /// Delay after the first failed boot; doubles on every retry.
    pub provision_backoff: Duration,
    /// How often sandbox memory is sampled during a run.
    pub memory_poll_interval: Duration,
    /// How long to keep reading output after a hard kill.
    pub kill_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            provision_attempts: 3,
            provision_backoff: Duration::from_millis(100),
            memory_poll_interval: Duration::from_millis(50),
            kill_grace: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    #[error(transparent)]
    Transition(#[from] InvalidSandboxTransition),

    /// Every boot attempt failed.
    #[error("Provisioning failed after {attempts} attempts: {last}")]
    ProvisionFailed { attempts: u32, last: DriverError },

    /// `run` was called on a sandbox that is not leased.
    #[error("Sandbox '{sandbox_id}' is {state}, not busy")]
    NotBusy {
        sandbox_id: String,
        state: SandboxState,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// A single invocation handed to a leased sandbox.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub execution_id: String,
    pub spec: FunctionSpec,
    pub code: String,
    pub input: Value,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Success,
    /// Setup failed before user code ran.
    Failed,
    Timeout,
    Crashed,
    OomKilled,
}

/// Result of [`LifecycleController::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub state: RunState,
    /// Set iff `state` is `Success`.
    pub output: Option<Value>,
    /// Set iff `state` is not `Success`.
    pub error: Option<ExecutionError>,
    /// From the start of the run to its terminal state.
    pub duration: Duration,
    pub memory_peak_mb: Option<u64>,
}

impl RunReport {
    fn success(output: Value, duration: Duration, memory_peak_mb: Option<u64>) -> Self {
        Self {
            state: RunState::Success,
            output: Some(output),
            error: None,
            duration,
            memory_peak_mb,
        }
    }

    fn failure(
        state: RunState,
        error: ExecutionError,
        duration: Duration,
        memory_peak_mb: Option<u64>,
    ) -> Self {
        Self {
            state,
            output: None,
            error: Some(error),
            duration,
            memory_peak_mb,
        }
    }

    /// Only a clean success leaves the sandbox fit for reuse.
    pub fn is_reusable(&self) -> bool {
        self.state == RunState::Success
    }
}

enum Verdict {
    Finished(Result<AdapterOutput, AdapterError>),
    TimedOut,
    OverMemory(u64),
}

/// Drives sandboxes through their states and supervises runs.
pub struct LifecycleController {
    driver: Arc<dyn SandboxDriver>,
    adapters: AdapterRegistry,
    config: LifecycleConfig,
}

impl LifecycleController {
    pub fn new(driver: Arc<dyn SandboxDriver>, config: LifecycleConfig) -> Self {
        Self {
            driver,
            adapters: AdapterRegistry::new(),
            config,
        }
    }

    pub fn driver(&self) -> &Arc<dyn SandboxDriver> {
        &self.driver
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Boot a cold sandbox (`cold -> provisioning -> ready`).
    ///
    /// Retries with exponential backoff. When every attempt fails the
    /// sandbox ends `destroyed` and the last driver error is returned.
    pub async fn provision(&self, sandbox: &mut Sandbox) -> Result<(), LifecycleError> {
        sandbox.transition(SandboxState::Provisioning)?;

        let attempts = self.config.provision_attempts.max(1);
        let mut backoff = self.config.provision_backoff;
        let mut attempt = 1;
        let last = loop {
            match self.driver.provision(sandbox).await {
                Ok(workspace) => {
                    sandbox.set_workspace(workspace);
                    sandbox.transition(SandboxState::Ready)?;
                    info!(
                        sandbox_id = %sandbox.id(),
                        runtime = %sandbox.class().runtime,
                        memory_mb = sandbox.class().memory_mb,
                        attempt = attempt,
                        "Sandbox provisioned"
                    );
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        sandbox_id = %sandbox.id(),
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Sandbox provisioning failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        error!(
            sandbox_id = %sandbox.id(),
            attempts = attempts,
            error = %last,
            "Sandbox provisioning exhausted"
        );
        if let Err(e) = self.driver.destroy(sandbox).await {
            debug!(sandbox_id = %sandbox.id(), error = %e, "Cleanup after failed boot");
        }
        sandbox.transition(SandboxState::Destroyed)?;
        Err(LifecycleError::ProvisionFailed { attempts, last })
    }

    /// Run one invocation in a busy sandbox, enforcing its deadline and
    /// memory ceiling. Logs are streamed into `capture`.
    pub async fn run(
        &self,
        sandbox: &Sandbox,
        invocation: &Invocation,
        capture: &LogCapture,
    ) -> Result<RunReport, LifecycleError> {
        if sandbox.state() != SandboxState::Busy {
            return Err(LifecycleError::NotBusy {
                sandbox_id: sandbox.id().to_string(),
                state: sandbox.state(),
            });
        }

        let spec = &invocation.spec;
        let adapter = self.adapters.for_runtime(spec.runtime);
        let request = RunRequest {
            runtime: spec.runtime,
            entry_point: &spec.entry_point,
            code: &invocation.code,
            input: &invocation.input,
        };
        let limit_mb = u64::from(spec.memory_mb);

        debug!(
            execution_id = %invocation.execution_id,
            sandbox_id = %sandbox.id(),
            timeout_ms = spec.timeout.as_millis() as u64,
            memory_mb = spec.memory_mb,
            "Run started"
        );

        let started = Instant::now();
        let deadline = started + spec.timeout;
        let exec = adapter::execute(adapter, self.driver.as_ref(), sandbox, request, capture);
        tokio::pin!(exec);

        let mut sampler = tokio::time::interval(self.config.memory_poll_interval);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut peak: Option<u64> = None;

        let verdict = loop {
            tokio::select! {
                biased;

                result = &mut exec => break Verdict::Finished(result),

                _ = tokio::time::sleep_until(deadline) => break Verdict::TimedOut,

                _ = sampler.tick() => {
                    if let Some(mb) = self.driver.memory_usage_mb(sandbox).await {
                        peak = Some(peak.map_or(mb, |p| p.max(mb)));
                        if mb > limit_mb {
                            break Verdict::OverMemory(mb);
                        }
                    }
                }
            }
        };
        let duration = started.elapsed();

        let report = match verdict {
            Verdict::Finished(result) => classify(result, duration, peak),
            Verdict::TimedOut => {
                self.kill_and_flush(sandbox, exec.as_mut()).await;
                RunReport::failure(
                    RunState::Timeout,
                    ExecutionError::new(
                        ErrorKind::ExecutionTimeout,
                        format!(
                            "execution exceeded its timeout of {} ms",
                            spec.timeout.as_millis()
                        ),
                    ),
                    duration,
                    peak,
                )
            }
            Verdict::OverMemory(mb) => {
                self.kill_and_flush(sandbox, exec.as_mut()).await;
                RunReport::failure(
                    RunState::OomKilled,
                    ExecutionError::new(
                        ErrorKind::OomKilled,
                        format!("memory usage {mb} MB exceeded the {limit_mb} MB limit"),
                    ),
                    duration,
                    peak,
                )
            }
        };

        info!(
            execution_id = %invocation.execution_id,
            sandbox_id = %sandbox.id(),
            state = ?report.state,
            duration_ms = report.duration.as_millis() as u64,
            "Run finished"
        );
        Ok(report)
    }

    async fn kill_and_flush<F>(&self, sandbox: &Sandbox, exec: std::pin::Pin<&mut F>)
    where
        F: std::future::Future<Output = Result<AdapterOutput, AdapterError>>,
    {
        if let Err(e) = self.driver.kill(sandbox).await {
            error!(sandbox_id = %sandbox.id(), error = %e, "Failed to kill sandbox process");
        }
        if tokio::time::timeout(self.config.kill_grace, exec).await.is_err() {
            warn!(sandbox_id = %sandbox.id(), "Output not closed within kill grace");
        }
    }

    /// Stop whatever is running (`busy|ready -> draining`).
    pub async fn drain(&self, sandbox: &mut Sandbox) -> Result<(), LifecycleError> {
        sandbox.transition(SandboxState::Draining)?;
        self.driver.kill(sandbox).await?;
        Ok(())
    }

    /// Wipe a drained sandbox for reuse (`draining -> provisioning -> ready`).
    ///
    /// The workspace must be verified empty before the sandbox is ready again;
    /// on failure the sandbox is destroyed.
    pub async fn reset(&self, sandbox: &mut Sandbox) -> Result<(), LifecycleError> {
        sandbox.transition(SandboxState::Provisioning)?;
        match self.driver.reset(sandbox).await {
            Ok(()) => {
                sandbox.transition(SandboxState::Ready)?;
                debug!(sandbox_id = %sandbox.id(), runs = sandbox.runs_completed(), "Sandbox reset");
                Ok(())
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox.id(), error = %e, "Sandbox reset failed, destroying");
                self.destroy(sandbox).await?;
                Err(e.into())
            }
        }
    }

    /// Tear a sandbox down. No-op for sandboxes that never booted or are
    /// already gone.
    pub async fn destroy(&self, sandbox: &mut Sandbox) -> Result<(), LifecycleError> {
        match sandbox.state() {
            SandboxState::Cold | SandboxState::Destroyed => return Ok(()),
            SandboxState::Ready | SandboxState::Busy => {
                sandbox.transition(SandboxState::Draining)?;
            }
            SandboxState::Provisioning | SandboxState::Draining => {}
        }

        let result = self.driver.destroy(sandbox).await;
        sandbox.transition(SandboxState::Destroyed)?;
        debug!(sandbox_id = %sandbox.id(), "Sandbox destroyed");
        result.map_err(Into::into)
    }
}

fn classify(
    result: Result<AdapterOutput, AdapterError>,
    duration: Duration,
    peak: Option<u64>,
) -> RunReport {
    let crashed = |message: String| {
        RunReport::failure(
            RunState::Crashed,
            ExecutionError::new(ErrorKind::ExecutionCrashed, message),
            duration,
            peak,
        )
    };

    match result {
        Ok(AdapterOutput { exit, result }) => match result {
            RunResult::Threw(message) if message.is_empty() => {
                crashed(format!("handler raised an error ({exit})"))
            }
            RunResult::Threw(message) => crashed(message),
            RunResult::Returned(value) if exit.success() => {
                RunReport::success(value, duration, peak)
            }
            RunResult::NoResult if exit.success() => RunReport::success(
                json!({ "message": "Execution completed" }),
                duration,
                peak,
            ),
            RunResult::Returned(_) | RunResult::NoResult => {
                crashed(format!("process exited with {exit}"))
            }
        },
        Err(AdapterError::Driver(e @ DriverError::Spawn { .. })) => RunReport::failure(
            RunState::Failed,
            ExecutionError::new(ErrorKind::SandboxProvisionError, e.to_string()),
            duration,
            peak,
        ),
        Err(e) => RunReport::failure(
            RunState::Failed,
            ExecutionError::new(ErrorKind::InternalError, e.to_string()),
            duration,
            peak,
        ),
    }
}
