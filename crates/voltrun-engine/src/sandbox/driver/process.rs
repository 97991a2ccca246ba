// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process driver: each sandbox is a private workspace directory and runs its
//! code as a separate process group.
//!
//! Processes get a cleared environment (only `PATH`, `HOME` pointing at the
//! workspace, and the command's own variables), run with the workspace as
//! their working directory, and are killed as a whole group with `SIGKILL`.
//! A sandbox remembers its group until a reset has seen the group empty, so
//! children that outlive the leader are still killed before reuse. Memory is
//! the resident set summed over every live member of the group.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    CommandSpec, DriverError, ExitInfo, Result, SandboxDriver, SandboxProcess, wipe_workspace,
};
use crate::sandbox::Sandbox;

/// Reads a `/proc/<pid>/status` field in kB, e.g. `VmRSS`.
async fn read_proc_status_kb(pid: u32, field: &str) -> Option<u64> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
}

/// `(state, pgrp)` from `/proc/<pid>/stat`. The command name may contain
/// spaces or parentheses, so fields are read after the last `)`.
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

/// Live members of process group `pgid`. Zombies are skipped.
async fn group_members(pgid: u32) -> Vec<u32> {
    let mut members = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir("/proc").await else {
        return members;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await else {
            continue;
        };
        if let Some((state, pgrp)) = parse_stat(&stat)
            && pgrp == pgid
            && !matches!(state, 'Z' | 'X')
        {
            members.push(pid);
        }
    }
    members
}

/// How long a reset waits for a killed group to disappear.
const GROUP_EXIT_WAIT: Duration = Duration::from_secs(2);

/// Process driver configuration.
#[derive(Debug, Clone)]
pub struct ProcessDriverConfig {
    /// Directory holding one workspace per sandbox.
    pub sandboxes_dir: PathBuf,
    /// `PATH` given to sandbox processes.
    pub path_env: String,
}

impl ProcessDriverConfig {
    /// Workspaces under `<data_dir>/sandboxes`, host `PATH`.
    pub fn from_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            sandboxes_dir: data_dir.into().join("sandboxes"),
            path_env: std::env::var("PATH")
                .unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
        }
    }
}

/// Runs sandbox code as host processes in private workspaces.
pub struct ProcessDriver {
    config: ProcessDriverConfig,
    /// sandbox id -> process group of its latest run. Kept after the leader
    /// exits and cleared only once a reset finds the group empty.
    groups: Arc<DashMap<String, u32>>,
}

impl ProcessDriver {
    pub fn new(config: ProcessDriverConfig) -> Self {
        Self {
            config,
            groups: Arc::new(DashMap::new()),
        }
    }

    fn workspace_for(&self, sandbox: &Sandbox) -> PathBuf {
        self.config.sandboxes_dir.join(sandbox.id())
    }

    fn group_of(&self, sandbox: &Sandbox) -> Option<u32> {
        self.groups.get(sandbox.id()).map(|g| *g)
    }

    /// Poll until no live process is left in `pgid`.
    async fn wait_group_exit(&self, sandbox: &Sandbox, pgid: u32) -> Result<()> {
        let deadline = tokio::time::Instant::now() + GROUP_EXIT_WAIT;
        loop {
            let members = group_members(pgid).await;
            if members.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(sandbox_id = %sandbox.id(), pgid = pgid, alive = members.len(), "Process group survived kill");
                return Err(DriverError::LingeringProcesses {
                    pgid,
                    count: members.len(),
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl SandboxDriver for ProcessDriver {
    fn driver_type(&self) -> &'static str {
        "process"
    }

    async fn provision(&self, sandbox: &Sandbox) -> Result<PathBuf> {
        let workspace = self.workspace_for(sandbox);
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| DriverError::Provision(format!("{}: {}", workspace.display(), e)))?;
        debug!(sandbox_id = %sandbox.id(), workspace = %workspace.display(), "Workspace created");
        Ok(workspace)
    }

    async fn exec(&self, sandbox: &Sandbox, command: &CommandSpec) -> Result<SandboxProcess> {
        let workspace = sandbox.workspace();
        if workspace.as_os_str().is_empty() {
            return Err(DriverError::NotProvisioned(sandbox.id().to_string()));
        }

        // A group left over from an earlier run must not share the workspace.
        self.kill(sandbox).await?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(workspace)
            .env_clear()
            .env("PATH", &self.config.path_env)
            .env("HOME", workspace)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| DriverError::Spawn {
            program: command.program.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| DriverError::Spawn {
            program: command.program.clone(),
            reason: "process exited before its pid was read".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| DriverError::Spawn {
            program: command.program.clone(),
            reason: "stdout not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| DriverError::Spawn {
            program: command.program.clone(),
            reason: "stderr not captured".to_string(),
        })?;

        self.groups.insert(sandbox.id().to_string(), pid);
        info!(sandbox_id = %sandbox.id(), pid = pid, program = %command.program, "Sandbox process started");

        let exit = async move {
            let status = child.wait().await?;
            Ok(ExitInfo {
                code: status.code(),
                signal: status.signal(),
            })
        }
        .boxed();

        Ok(SandboxProcess {
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exit,
        })
    }

    async fn kill(&self, sandbox: &Sandbox) -> Result<()> {
        let Some(pgid) = self.group_of(sandbox) else {
            return Ok(());
        };
        match signal::killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            Ok(()) => {
                warn!(sandbox_id = %sandbox.id(), pgid = pgid, "Killed sandbox process group");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(DriverError::Io(std::io::Error::from(e))),
        }
    }

    async fn memory_usage_mb(&self, sandbox: &Sandbox) -> Option<u64> {
        let pgid = self.group_of(sandbox)?;
        let members = group_members(pgid).await;
        if members.is_empty() {
            return None;
        }
        let mut total_kb = 0;
        for pid in members {
            total_kb += read_proc_status_kb(pid, "VmRSS").await.unwrap_or(0);
        }
        Some(total_kb / 1024)
    }

    async fn reset(&self, sandbox: &Sandbox) -> Result<()> {
        if let Some(pgid) = self.group_of(sandbox) {
            self.kill(sandbox).await?;
            self.wait_group_exit(sandbox, pgid).await?;
            self.groups.remove_if(sandbox.id(), |_, group| *group == pgid);
        }
        wipe_workspace(sandbox).await
    }

    async fn destroy(&self, sandbox: &Sandbox) -> Result<()> {
        self.kill(sandbox).await?;
        self.groups.remove(sandbox.id());
        let workspace = self.workspace_for(sandbox);
        match tokio::fs::remove_dir_all(&workspace).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(sandbox_id = %sandbox.id(), "Workspace removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxClass;
    use tokio::io::AsyncReadExt;
    use voltrun_core::model::Runtime;

    fn driver(dir: &std::path::Path) -> ProcessDriver {
        ProcessDriver::new(ProcessDriverConfig::from_data_dir(dir))
    }

    async fn provisioned(driver: &ProcessDriver) -> Sandbox {
        let mut sandbox = Sandbox::new(SandboxClass::new(Runtime::Nodejs20, 128));
        let workspace = driver.provision(&sandbox).await.unwrap();
        sandbox.set_workspace(workspace);
        sandbox
    }

    #[tokio::test]
    async fn test_exec_runs_in_workspace_with_clean_env() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let sandbox = provisioned(&driver).await;

        let command = CommandSpec::new("sh")
            .arg("-c")
            .arg("pwd; echo \"$HOME\"; echo \"${SECRET:-unset}\"; echo err >&2")
            .env("EXTRA", "1");
        let mut process = driver.exec(&sandbox, &command).await.unwrap();

        let mut out = String::new();
        process.stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        process.stderr.read_to_string(&mut err).await.unwrap();
        let exit = process.exit.await.unwrap();

        assert!(exit.success());
        let lines: Vec<_> = out.lines().collect();
        let workspace = sandbox.workspace().to_string_lossy().to_string();
        assert!(lines[0].ends_with(sandbox.id()));
        assert_eq!(lines[1], workspace);
        assert_eq!(lines[2], "unset");
        assert_eq!(err.trim(), "err");
    }

    #[tokio::test]
    async fn test_kill_terminates_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let sandbox = provisioned(&driver).await;

        let command = CommandSpec::new("sh").arg("-c").arg("sleep 30 & sleep 30");
        let process = driver.exec(&sandbox, &command).await.unwrap();
        assert!(driver.memory_usage_mb(&sandbox).await.is_some());

        driver.kill(&sandbox).await.unwrap();
        let exit = tokio::time::timeout(std::time::Duration::from_secs(5), process.exit)
            .await
            .expect("process should die promptly")
            .unwrap();
        assert_eq!(exit.signal, Some(Signal::SIGKILL as i32));

        // Killing again is a no-op.
        driver.kill(&sandbox).await.unwrap();
    }

    #[test]
    fn test_parse_stat_reads_fields_after_command_name() {
        let stat = "4242 (odd (name) here) S 1 4240 4240 0 -1 4194560";
        assert_eq!(parse_stat(stat), Some(('S', 4240)));
        assert_eq!(parse_stat("17 (sh) Z 1 17 17"), Some(('Z', 17)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[tokio::test]
    async fn test_reset_kills_children_that_outlived_the_leader() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let sandbox = provisioned(&driver).await;

        let command = CommandSpec::new("sh")
            .arg("-c")
            .arg("(sleep 1; echo leaked > leak.txt) >/dev/null 2>&1 &");
        let process = driver.exec(&sandbox, &command).await.unwrap();
        assert!(process.exit.await.unwrap().success());

        // The leader is gone but its child is still running.
        let pgid = driver.group_of(&sandbox).unwrap();
        assert!(!group_members(pgid).await.is_empty());
        assert!(driver.memory_usage_mb(&sandbox).await.is_some());

        driver.reset(&sandbox).await.unwrap();
        assert!(group_members(pgid).await.is_empty());
        assert!(driver.group_of(&sandbox).is_none());

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!sandbox.workspace().join("leak.txt").exists());
    }

    #[tokio::test]
    async fn test_memory_covers_the_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let sandbox = provisioned(&driver).await;

        let command = CommandSpec::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30 & wait");
        let process = driver.exec(&sandbox, &command).await.unwrap();

        let pgid = driver.group_of(&sandbox).unwrap();
        let mut members = Vec::new();
        for _ in 0..100 {
            members = group_members(pgid).await;
            if members.len() >= 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(members.contains(&pgid));
        assert!(members.len() >= 3, "members {members:?}");

        let leader_mb = read_proc_status_kb(pgid, "VmRSS").await.unwrap() / 1024;
        assert!(driver.memory_usage_mb(&sandbox).await.unwrap() >= leader_mb);

        driver.kill(&sandbox).await.unwrap();
        process.exit.await.unwrap();
        driver.reset(&sandbox).await.unwrap();
        assert!(driver.memory_usage_mb(&sandbox).await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let sandbox = provisioned(&driver).await;

        let err = match driver
            .exec(&sandbox, &CommandSpec::new("/definitely/not/a/binary"))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("spawn should fail"),
        };
        assert!(matches!(err, DriverError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_reset_and_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let sandbox = provisioned(&driver).await;

        driver
            .write_file(&sandbox, "lib/index.js", b"module.exports = {}")
            .await
            .unwrap();
        driver.reset(&sandbox).await.unwrap();
        assert!(sandbox.workspace().exists());
        assert!(!sandbox.workspace().join("lib").exists());

        driver.destroy(&sandbox).await.unwrap();
        assert!(!sandbox.workspace().exists());
    }
}
