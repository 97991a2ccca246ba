// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Go adapter (`go121`).
//!
//! User code is compiled as part of `package main` next to a generated
//! `main` that calls the entry symbol, which must have the signature
//! `func(any) (any, error)`. `go run` only builds the workspace root, so
//! nested entry files are flattened (`src/app` -> `src_app.go`).

use voltrun_core::model::{EntryPoint, Runtime, RuntimeFamily};

use super::{BootstrapFile, ERROR_MARKER, INPUT_FILE, OUTPUT_END, OUTPUT_START, RuntimeAdapter};
use crate::sandbox::driver::CommandSpec;

const BOOTSTRAP: &str = "zz_voltrun_bootstrap.go";

const GO_MOD: &str = "module voltrun/handler\n\ngo 1.21\n";

#[derive(Debug, Default, Clone, Copy)]
pub struct GoAdapter;

impl RuntimeAdapter for GoAdapter {
    fn family(&self) -> RuntimeFamily {
        RuntimeFamily::Go
    }

    fn code_file(&self, entry: &EntryPoint) -> String {
        format!("{}.go", entry.file.replace('/', "_"))
    }

    fn bootstrap_files(&self, entry: &EntryPoint) -> Vec<BootstrapFile> {
        let wrapper = format!(
            r#"package main

import (
	"encoding/json"
	"fmt"
	"os"
)

func voltrunFail(err error) {{
	fmt.Fprintln(os.Stderr, "{error} "+err.Error())
	os.Exit(1)
}}

func main() {{
	raw, err := os.ReadFile("{input}")
	if err != nil {{
		voltrunFail(err)
	}}
	var input any
	if err := json.Unmarshal(raw, &input); err != nil {{
		voltrunFail(err)
	}}
	result, err := {symbol}(input)
	if err != nil {{
		voltrunFail(err)
	}}
	if result == nil {{
		return
	}}
	out, err := json.Marshal(result)
	if err != nil {{
		voltrunFail(err)
	}}
	fmt.Println("{start}")
	fmt.Println(string(out))
	fmt.Println("{end}")
}}
"#,
            symbol = entry.symbol,
            input = INPUT_FILE,
            start = OUTPUT_START,
            end = OUTPUT_END,
            error = ERROR_MARKER,
        );
        vec![
            BootstrapFile::new("go.mod", GO_MOD),
            BootstrapFile::new(BOOTSTRAP, wrapper),
        ]
    }

    fn command(&self, runtime: Runtime, _entry: &EntryPoint) -> CommandSpec {
        CommandSpec::new("go")
            .arg("run")
            .arg(".")
            .env("VOLTRUN_RUNTIME", runtime.as_str())
            .env("GOTOOLCHAIN", "local")
            .env("GOFLAGS", "-mod=mod")
            .env("CGO_ENABLED", "0")
    }
}
