// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock driver for testing.
//!
//! Workspaces are real directories, but no runtime is started. Instead the
//! user code file is read as a small script, one command per line, and the
//! mock prints what a runtime wrapper would print:
//!
//! | Line | Effect |
//! |------|--------|
//! | `log <text>` | `<text>` on stdout |
//! | `warn <text>` | `<text>` on stderr |
//! | `spam <n> <text>` | `<text>` on stdout `n` times |
//! | `sleep <ms>` | pause |
//! | `alloc <mb>` | report `<mb>` of resident memory |
//! | `return <json>` | print the output block and exit 0 |
//! | `echo` | return the invocation input |
//! | `throw <message>` | print the error marker on stderr and exit 1 |
//! | `exit <code>` | exit with `<code>` without an output block |
//! | `hang` | never finish |
//!
//! Any other line is ignored, so real handler source runs to completion with
//! no output block.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::AbortHandle;

use super::{
    CommandSpec, DriverError, ExitInfo, Result, SandboxDriver, SandboxProcess,
    resolve_in_workspace,
};
use crate::adapter::{ERROR_MARKER, OUTPUT_END, OUTPUT_START};
use crate::sandbox::Sandbox;

const PIPE_CAPACITY: usize = 64 * 1024;

struct MockRun {
    abort: AbortHandle,
    memory_mb: Arc<AtomicU64>,
}

/// Mock driver for testing.
pub struct MockDriver {
    root: PathBuf,
    runs: Arc<DashMap<String, MockRun>>,
    /// Simulated boot latency.
    pub provision_delay: Duration,
    /// Resident memory reported while a script runs, before any `alloc`.
    pub base_memory_mb: u64,
    failing_provisions: AtomicU32,
    provisioned: AtomicUsize,
    destroyed: AtomicUsize,
    execs: AtomicUsize,
}

impl MockDriver {
    /// Create a mock driver keeping workspaces under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runs: Arc::new(DashMap::new()),
            provision_delay: Duration::ZERO,
            base_memory_mb: 16,
            failing_provisions: AtomicU32::new(0),
            provisioned: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` provisioning attempts fail.
    pub fn fail_next_provisions(&self, n: u32) {
        self.failing_provisions.store(n, Ordering::SeqCst);
    }

    /// Number of successful provisions.
    pub fn provisioned_count(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    /// Number of destroyed sandboxes.
    pub fn destroyed_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Number of processes started.
    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    /// Sandboxes with a script currently running.
    pub fn running_count(&self) -> usize {
        self.runs.len()
    }
}

#[async_trait]
impl SandboxDriver for MockDriver {
    fn driver_type(&self) -> &'static str {
        "mock"
    }

    async fn provision(&self, sandbox: &Sandbox) -> Result<PathBuf> {
        if !self.provision_delay.is_zero() {
            tokio::time::sleep(self.provision_delay).await;
        }

        let failing = self
            .failing_provisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DriverError::Provision("mock boot failure".to_string()));
        }

        let workspace = self.root.join(sandbox.id());
        tokio::fs::create_dir_all(&workspace).await?;
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(workspace)
    }

    async fn exec(&self, sandbox: &Sandbox, command: &CommandSpec) -> Result<SandboxProcess> {
        let code_path = resolve_in_workspace(sandbox, &command.code_file)?;
        let script = tokio::fs::read_to_string(&code_path)
            .await
            .map_err(|e| DriverError::Spawn {
                program: command.program.clone(),
                reason: format!("cannot read {}: {}", code_path.display(), e),
            })?;
        let input = match resolve_in_workspace(sandbox, "input.json") {
            Ok(path) => tokio::fs::read_to_string(path).await.unwrap_or_default(),
            Err(_) => String::new(),
        };

        let (stdout_w, stdout_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_w, stderr_r) = tokio::io::duplex(PIPE_CAPACITY);
        let memory_mb = Arc::new(AtomicU64::new(self.base_memory_mb));

        let task = tokio::spawn(run_script(
            script,
            input,
            stdout_w,
            stderr_w,
            memory_mb.clone(),
        ));
        self.runs.insert(
            sandbox.id().to_string(),
            MockRun {
                abort: task.abort_handle(),
                memory_mb,
            },
        );
        self.execs.fetch_add(1, Ordering::SeqCst);

        let runs = self.runs.clone();
        let sandbox_id = sandbox.id().to_string();
        let exit = async move {
            let result = match task.await {
                Ok(info) => Ok(info),
                Err(e) if e.is_cancelled() => Ok(ExitInfo::killed()),
                Err(e) => Err(std::io::Error::other(e.to_string())),
            };
            runs.remove(&sandbox_id);
            result
        }
        .boxed();

        Ok(SandboxProcess {
            stdout: Box::pin(stdout_r),
            stderr: Box::pin(stderr_r),
            exit,
        })
    }

    async fn kill(&self, sandbox: &Sandbox) -> Result<()> {
        if let Some((_, run)) = self.runs.remove(sandbox.id()) {
            run.abort.abort();
        }
        Ok(())
    }

    async fn memory_usage_mb(&self, sandbox: &Sandbox) -> Option<u64> {
        self.runs
            .get(sandbox.id())
            .map(|run| run.memory_mb.load(Ordering::SeqCst))
    }

    async fn destroy(&self, sandbox: &Sandbox) -> Result<()> {
        self.kill(sandbox).await?;
        let workspace = self.root.join(sandbox.id());
        match tokio::fs::remove_dir_all(&workspace).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn emit<W: AsyncWrite + Unpin>(w: &mut W, line: &str) {
    // The reader may be gone after a kill; nothing to do then.
    let _ = w.write_all(line.as_bytes()).await;
    let _ = w.write_all(b"\n").await;
}

async fn emit_output<W: AsyncWrite + Unpin>(w: &mut W, body: &str) {
    emit(w, OUTPUT_START).await;
    emit(w, body).await;
    emit(w, OUTPUT_END).await;
}

async fn run_script(
    script: String,
    input: String,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    memory_mb: Arc<AtomicU64>,
) -> ExitInfo {
    for raw in script.lines() {
        let line = raw.trim();
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        match cmd {
            "log" => emit(&mut stdout, rest).await,
            "warn" => emit(&mut stderr, rest).await,
            "spam" => {
                let (count, text) = rest.split_once(' ').unwrap_or((rest, ""));
                for _ in 0..count.parse::<usize>().unwrap_or(0) {
                    emit(&mut stdout, text).await;
                }
            }
            "sleep" => {
                let ms = rest.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            "alloc" => {
                memory_mb.store(rest.parse().unwrap_or(0), Ordering::SeqCst);
            }
            "return" => {
                emit_output(&mut stdout, rest).await;
                return ExitInfo::from_code(0);
            }
            "echo" => {
                let body = if input.trim().is_empty() { "null" } else { input.trim() };
                emit_output(&mut stdout, body).await;
                return ExitInfo::from_code(0);
            }
            "throw" => {
                emit(&mut stderr, &format!("{ERROR_MARKER} {rest}")).await;
                emit(&mut stderr, &format!("    at handler ({rest})")).await;
                return ExitInfo::from_code(1);
            }
            "exit" => return ExitInfo::from_code(rest.parse().unwrap_or(1)),
            "hang" => std::future::pending::<()>().await,
            _ => {}
        }
    }
    let _ = stdout.flush().await;
    ExitInfo::from_code(0)
}
