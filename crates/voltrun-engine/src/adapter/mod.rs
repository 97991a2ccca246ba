// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime adapters.
//!
//! An adapter knows how one language family lays out user code, which
//! bootstrap wrapper calls the handler, and which command starts it. The
//! shared [`execute`] routine writes those files into a sandbox, starts the
//! process through the driver and turns the output streams into log lines
//! plus a result.
//!
//! Wrappers talk back over stdout/stderr with three markers:
//!
//! ```text
//! __VOLTRUN_OUTPUT_START__     (stdout)
//! <JSON result>
//! __VOLTRUN_OUTPUT_END__
//! __VOLTRUN_ERROR__ <message>  (stderr, then exit 1)
//! ```
//!
//! Adapters never enforce limits or timing; the lifecycle controller does.

pub mod go;
pub mod node;
pub mod python;

pub use go::GoAdapter;
pub use node::NodeAdapter;
pub use python::PythonAdapter;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use voltrun_core::model::{EntryPoint, Runtime, RuntimeFamily};

use crate::capture::LogCapture;
use crate::sandbox::Sandbox;
use crate::sandbox::driver::{CommandSpec, DriverError, ExitInfo, OutputStream, SandboxDriver};

pub const OUTPUT_START: &str = "__VOLTRUN_OUTPUT_START__";
pub const OUTPUT_END: &str = "__VOLTRUN_OUTPUT_END__";
pub const ERROR_MARKER: &str = "__VOLTRUN_ERROR__";

/// Invocation input, written into the workspace for the wrapper to read.
pub const INPUT_FILE: &str = "input.json";

/// Errors setting up or observing a run. Faults of the user code are not
/// errors here; they come back as [`RunResult::Threw`] or a failing exit.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AdapterError {
    /// Writing files or starting the process failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Input could not be encoded.
    #[error("Failed to encode input: {0}")]
    Input(#[from] serde_json::Error),

    /// Reading the output streams or the exit status failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A file the adapter needs next to the user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapFile {
    pub path: String,
    pub contents: String,
}

impl BootstrapFile {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// One language family.
pub trait RuntimeAdapter: Send + Sync {
    fn family(&self) -> RuntimeFamily;

    /// Workspace-relative path the user code is written to.
    fn code_file(&self, entry: &EntryPoint) -> String;

    /// Wrapper and build files written alongside the code.
    fn bootstrap_files(&self, entry: &EntryPoint) -> Vec<BootstrapFile>;

    /// Command that runs the wrapper.
    fn command(&self, runtime: Runtime, entry: &EntryPoint) -> CommandSpec;
}

/// What the adapter needs to run one invocation.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub runtime: Runtime,
    pub entry_point: &'a EntryPoint,
    pub code: &'a str,
    pub input: &'a Value,
}

/// What the handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// A complete output block was printed.
    Returned(Value),
    /// The wrapper reported a fault.
    Threw(String),
    /// The process ended without either.
    NoResult,
}

/// Outcome of [`execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOutput {
    pub exit: ExitInfo,
    pub result: RunResult,
}

/// Fixed set of adapters, one per family.
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    node: NodeAdapter,
    python: PythonAdapter,
    go: GoAdapter,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_runtime(&self, runtime: Runtime) -> &dyn RuntimeAdapter {
        match runtime.family() {
            RuntimeFamily::Node => &self.node,
            RuntimeFamily::Python => &self.python,
            RuntimeFamily::Go => &self.go,
        }
    }
}

/// Write the code, wrapper and input into the sandbox, run it, and stream
/// its output into `capture` until the process exits.
pub async fn execute(
    adapter: &dyn RuntimeAdapter,
    driver: &dyn SandboxDriver,
    sandbox: &Sandbox,
    request: RunRequest<'_>,
    capture: &LogCapture,
) -> Result<AdapterOutput, AdapterError> {
    let code_file = adapter.code_file(request.entry_point);
    driver
        .write_file(sandbox, &code_file, request.code.as_bytes())
        .await?;
    for file in adapter.bootstrap_files(request.entry_point) {
        driver
            .write_file(sandbox, &file.path, file.contents.as_bytes())
            .await?;
    }
    let input = serde_json::to_vec(request.input)?;
    driver.write_file(sandbox, INPUT_FILE, &input).await?;

    let command = adapter
        .command(request.runtime, request.entry_point)
        .code_file(code_file);
    debug!(
        sandbox_id = %sandbox.id(),
        runtime = %request.runtime,
        program = %command.program,
        "Starting runtime process"
    );
    let process = driver.exec(sandbox, &command).await?;

    let (returned, thrown, exit) = tokio::join!(
        pump_stdout(process.stdout, capture),
        pump_stderr(process.stderr, capture),
        process.exit
    );
    let exit = exit?;
    let returned = returned?;
    let thrown = thrown?;

    let result = match (thrown, returned) {
        (Some(message), _) => RunResult::Threw(message),
        (None, Some(raw)) => RunResult::Returned(parse_output(&raw)),
        (None, None) => RunResult::NoResult,
    };
    Ok(AdapterOutput { exit, result })
}

/// JSON output is kept as-is; anything else is wrapped as `{"result": text}`.
pub fn parse_output(raw: &str) -> Value {
    let text = raw.trim();
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "result": text }))
}

async fn next_line(
    reader: &mut BufReader<OutputStream>,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

/// Log lines go to the capture; the output block is collected apart.
async fn pump_stdout(
    stream: OutputStream,
    capture: &LogCapture,
) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut in_block = false;
    let mut block = Vec::new();
    let mut returned = None;

    while let Some(line) = next_line(&mut reader, &mut buf).await? {
        if !in_block && line == OUTPUT_START {
            in_block = true;
            block.clear();
        } else if in_block && line == OUTPUT_END {
            in_block = false;
            returned = Some(block.join("\n"));
        } else if in_block {
            block.push(line);
        } else {
            capture.push_line(&line);
        }
    }
    Ok(returned)
}

async fn pump_stderr(
    stream: OutputStream,
    capture: &LogCapture,
) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut thrown = None;

    while let Some(line) = next_line(&mut reader, &mut buf).await? {
        if thrown.is_none()
            && let Some(message) = line.strip_prefix(ERROR_MARKER)
        {
            thrown = Some(message.trim().to_string());
        }
        capture.push_line(&line);
    }
    Ok(thrown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxClass;
    use crate::sandbox::driver::MockDriver;

    async fn run(script: &str, input: Value) -> (AdapterOutput, String) {
        let dir = tempfile::tempdir().unwrap();
        let driver = MockDriver::new(dir.path());
        let mut sandbox = Sandbox::new(SandboxClass::new(Runtime::Nodejs20, 128));
        let workspace = driver.provision(&sandbox).await.unwrap();
        sandbox.set_workspace(workspace);

        let registry = AdapterRegistry::new();
        let entry = EntryPoint::parse("index.handler").unwrap();
        let capture = LogCapture::new(4096);
        let output = execute(
            registry.for_runtime(Runtime::Nodejs20),
            &driver,
            &sandbox,
            RunRequest {
                runtime: Runtime::Nodejs20,
                entry_point: &entry,
                code: script,
                input: &input,
            },
            &capture,
        )
        .await
        .unwrap();
        (output, capture.snapshot())
    }

    #[test]
    fn test_registry_picks_family() {
        let registry = AdapterRegistry::new();
        for runtime in Runtime::ALL {
            assert_eq!(registry.for_runtime(runtime).family(), runtime.family());
        }
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output("{\"a\":1}\n"), json!({"a": 1}));
        assert_eq!(parse_output("[1,2]"), json!([1, 2]));
        assert_eq!(parse_output("42"), json!(42));
        assert_eq!(parse_output("hello there"), json!({"result": "hello there"}));
    }

    #[tokio::test]
    async fn test_output_block_is_not_logged() {
        let (output, logs) = run("log before\nreturn {\"ok\":true}", json!({})).await;
        assert_eq!(output.result, RunResult::Returned(json!({"ok": true})));
        assert!(output.exit.success());
        assert_eq!(logs, "before\n");
    }

    #[tokio::test]
    async fn test_input_reaches_the_handler() {
        let (output, _) = run("echo", json!({"x": 5})).await;
        assert_eq!(output.result, RunResult::Returned(json!({"x": 5})));
    }

    #[tokio::test]
    async fn test_thrown_error_is_logged_and_reported() {
        let (output, logs) = run("log working\nthrow bad input", json!({})).await;
        assert_eq!(output.result, RunResult::Threw("bad input".to_string()));
        assert_eq!(output.exit.code, Some(1));
        assert!(logs.contains("working\n"));
        assert!(logs.contains(&format!("{ERROR_MARKER} bad input")));
    }

    #[tokio::test]
    async fn test_no_output_block() {
        let (output, logs) = run("const x = 1;\nlog done", json!({})).await;
        assert_eq!(output.result, RunResult::NoResult);
        assert!(output.exit.success());
        assert_eq!(logs, "done\n");
    }
}
