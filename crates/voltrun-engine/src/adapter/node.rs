// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node.js adapter (`nodejs20`, `nodejs18`).

use voltrun_core::model::{EntryPoint, Runtime, RuntimeFamily};

use super::{BootstrapFile, ERROR_MARKER, INPUT_FILE, OUTPUT_END, OUTPUT_START, RuntimeAdapter};
use crate::sandbox::driver::CommandSpec;

const BOOTSTRAP: &str = "__voltrun_bootstrap.js";

#[derive(Debug, Default, Clone, Copy)]
pub struct NodeAdapter;

impl RuntimeAdapter for NodeAdapter {
    fn family(&self) -> RuntimeFamily {
        RuntimeFamily::Node
    }

    fn code_file(&self, entry: &EntryPoint) -> String {
        format!("{}.js", entry.file)
    }

    fn bootstrap_files(&self, entry: &EntryPoint) -> Vec<BootstrapFile> {
        let wrapper = format!(
            r#"const fs = require('fs');
const mod = require('./{file}.js');

(async () => {{
  try {{
    const input = JSON.parse(fs.readFileSync('./{input}', 'utf8'));
    const result = await mod['{symbol}'](input);
    if (result === undefined) process.exit(0);
    const block = ['{start}', JSON.stringify(result), '{end}', ''].join('\n');
    // Pending timers or sockets must not keep a finished handler alive.
    process.stdout.write(block, () => process.exit(0));
  }} catch (error) {{
    const message = error && error.message ? error.message : String(error);
    console.error('{error} ' + message);
    if (error && error.stack) console.error(error.stack);
    process.exit(1);
  }}
}})();
"#,
            file = entry.file,
            symbol = entry.symbol,
            input = INPUT_FILE,
            start = OUTPUT_START,
            end = OUTPUT_END,
            error = ERROR_MARKER,
        );
        vec![BootstrapFile::new(BOOTSTRAP, wrapper)]
    }

    fn command(&self, runtime: Runtime, _entry: &EntryPoint) -> CommandSpec {
        CommandSpec::new("node")
            .arg(BOOTSTRAP)
            .env("VOLTRUN_RUNTIME", runtime.as_str())
            .env("NODE_ENV", "production")
    }
}
