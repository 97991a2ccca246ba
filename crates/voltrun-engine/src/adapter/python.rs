// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Python adapter (`python311`, `python39`).
//!
//! The entry file becomes a dotted module path (`src/app` -> `src.app`) and
//! is loaded with `importlib`. Coroutine handlers are run to completion.

use voltrun_core::model::{EntryPoint, Runtime, RuntimeFamily};

use super::{BootstrapFile, ERROR_MARKER, INPUT_FILE, OUTPUT_END, OUTPUT_START, RuntimeAdapter};
use crate::sandbox::driver::CommandSpec;

const BOOTSTRAP: &str = "__voltrun_bootstrap.py";

#[derive(Debug, Default, Clone, Copy)]
pub struct PythonAdapter;

impl RuntimeAdapter for PythonAdapter {
    fn family(&self) -> RuntimeFamily {
        RuntimeFamily::Python
    }

    fn code_file(&self, entry: &EntryPoint) -> String {
        format!("{}.py", entry.file)
    }

    fn bootstrap_files(&self, entry: &EntryPoint) -> Vec<BootstrapFile> {
        let wrapper = format!(
            r#"import asyncio
import importlib
import inspect
import json
import sys
import traceback

try:
    handler = getattr(importlib.import_module("{module}"), "{symbol}")
    with open("{input}") as f:
        event = json.load(f)
    result = handler(event)
    if inspect.iscoroutine(result):
        result = asyncio.run(result)
    if result is not None:
        print("{start}")
        print(json.dumps(result))
        print("{end}")
except Exception as e:
    print(f"{error} {{e}}", file=sys.stderr)
    traceback.print_exc()
    sys.exit(1)
"#,
            module = entry.file.replace('/', "."),
            symbol = entry.symbol,
            input = INPUT_FILE,
            start = OUTPUT_START,
            end = OUTPUT_END,
            error = ERROR_MARKER,
        );
        vec![BootstrapFile::new(BOOTSTRAP, wrapper)]
    }

    fn command(&self, runtime: Runtime, _entry: &EntryPoint) -> CommandSpec {
        CommandSpec::new("python3")
            .arg("-u")
            .arg(BOOTSTRAP)
            .env("VOLTRUN_RUNTIME", runtime.as_str())
            .env("PYTHONDONTWRITEBYTECODE", "1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_entry_becomes_module_path() {
        let entry = EntryPoint::parse("src/app.main").unwrap();
        let adapter = PythonAdapter;
        assert_eq!(adapter.code_file(&entry), "src/app.py");

        let wrapper = &adapter.bootstrap_files(&entry)[0].contents;
        assert!(wrapper.contains(r#"importlib.import_module("src.app"), "main""#));
        assert!(wrapper.contains(r#"print(f"__VOLTRUN_ERROR__ {e}", file=sys.stderr)"#));
    }
}
