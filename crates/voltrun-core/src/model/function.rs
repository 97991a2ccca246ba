// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function definitions and their validation rules.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest memory ceiling a function may declare.
pub const MEMORY_MB_MIN: i32 = 128;
/// Highest memory ceiling a function may declare.
pub const MEMORY_MB_MAX: i32 = 10_240;
/// Shortest timeout a function may declare.
pub const TIMEOUT_SEC_MIN: i32 = 1;
/// Longest timeout a function may declare.
pub const TIMEOUT_SEC_MAX: i32 = 900;

pub const DEFAULT_ENTRY_POINT: &str = "index.handler";
pub const DEFAULT_MEMORY_MB: i32 = 128;
pub const DEFAULT_TIMEOUT_SEC: i32 = 30;

/// Supported language runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Nodejs20,
    Nodejs18,
    Python311,
    Python39,
    Go121,
}

/// Runtime families sharing one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFamily {
    Node,
    Python,
    Go,
}

impl Runtime {
    pub const ALL: [Runtime; 5] = [
        Runtime::Nodejs20,
        Runtime::Nodejs18,
        Runtime::Python311,
        Runtime::Python39,
        Runtime::Go121,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Nodejs20 => "nodejs20",
            Runtime::Nodejs18 => "nodejs18",
            Runtime::Python311 => "python311",
            Runtime::Python39 => "python39",
            Runtime::Go121 => "go121",
        }
    }

    pub fn family(&self) -> RuntimeFamily {
        match self {
            Runtime::Nodejs20 | Runtime::Nodejs18 => RuntimeFamily::Node,
            Runtime::Python311 | Runtime::Python39 => RuntimeFamily::Python,
            Runtime::Go121 => RuntimeFamily::Go,
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a runtime name is not one of [`Runtime::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported runtime '{0}'")]
pub struct UnknownRuntime(pub String);

impl FromStr for Runtime {
    type Err = UnknownRuntime;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Runtime::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownRuntime(s.to_string()))
    }
}

/// Whether a function accepts invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FunctionStatus {
    #[default]
    Active,
    #[serde(alias = "inactive")]
    Disabled,
}

impl FunctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionStatus::Active => "active",
            FunctionStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for FunctionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(FunctionStatus::Active),
            "disabled" | "inactive" => Ok(FunctionStatus::Disabled),
            other => Err(format!("unknown function status '{other}'")),
        }
    }
}

/// A parsed `file.symbol` entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub file: String,
    pub symbol: String,
}

impl EntryPoint {
    /// Parse an entry point, splitting at the last dot.
    ///
    /// The file part may contain `/`-separated segments of identifier-like
    /// characters; the symbol must be a plain identifier.
    pub fn parse(raw: &str) -> Result<Self, FunctionValidationError> {
        let invalid = || FunctionValidationError::InvalidEntryPoint(raw.to_string());

        let (file, symbol) = raw.rsplit_once('.').ok_or_else(invalid)?;
        if !is_identifier(symbol) {
            return Err(invalid());
        }
        if file.is_empty() || file.starts_with('/') || file.ends_with('/') {
            return Err(invalid());
        }
        for segment in file.split('/') {
            let ok = !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !ok {
                return Err(invalid());
            }
        }

        Ok(Self {
            file: file.to_string(),
            symbol: symbol.to_string(),
        })
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.file, self.symbol)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reasons a function definition is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FunctionValidationError {
    #[error("function name must not be empty")]
    EmptyName,
    #[error("function code must not be empty")]
    EmptyCode,
    #[error(transparent)]
    UnknownRuntime(#[from] UnknownRuntime),
    #[error("entry point '{0}' must look like 'file.symbol'")]
    InvalidEntryPoint(String),
    #[error("memory_mb {0} is outside {MEMORY_MB_MIN}..={MEMORY_MB_MAX}")]
    MemoryOutOfRange(i32),
    #[error("timeout_sec {0} is outside {TIMEOUT_SEC_MIN}..={TIMEOUT_SEC_MAX}")]
    TimeoutOutOfRange(i32),
    #[error("function '{0}' is not active")]
    NotActive(String),
}

/// A stored function definition.
///
/// `runtime` is kept as the raw registered name so that rows written by
/// other tools still load; [`Function::spec`] resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Function {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub runtime: String,
    pub code: String,
    pub entry_point: String,
    pub memory_mb: i32,
    pub timeout_sec: i32,
    #[sqlx(try_from = "String")]
    pub status: FunctionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<String> for FunctionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The typed, validated view of a function used at invocation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpec {
    pub runtime: Runtime,
    pub entry_point: EntryPoint,
    pub memory_mb: u32,
    pub timeout: Duration,
}

impl Function {
    /// Check the definition (without the status) and resolve its typed view.
    pub fn spec(&self) -> Result<FunctionSpec, FunctionValidationError> {
        if self.name.trim().is_empty() {
            return Err(FunctionValidationError::EmptyName);
        }
        if self.code.is_empty() {
            return Err(FunctionValidationError::EmptyCode);
        }
        let runtime: Runtime = self.runtime.parse()?;
        if !(MEMORY_MB_MIN..=MEMORY_MB_MAX).contains(&self.memory_mb) {
            return Err(FunctionValidationError::MemoryOutOfRange(self.memory_mb));
        }
        if !(TIMEOUT_SEC_MIN..=TIMEOUT_SEC_MAX).contains(&self.timeout_sec) {
            return Err(FunctionValidationError::TimeoutOutOfRange(self.timeout_sec));
        }
        let entry_point = EntryPoint::parse(&self.entry_point)?;

        Ok(FunctionSpec {
            runtime,
            entry_point,
            memory_mb: self.memory_mb as u32,
            timeout: Duration::from_secs(self.timeout_sec as u64),
        })
    }

    /// Full invocation precondition: active and well-formed.
    pub fn invocable_spec(&self) -> Result<FunctionSpec, FunctionValidationError> {
        if self.status != FunctionStatus::Active {
            return Err(FunctionValidationError::NotActive(self.id.clone()));
        }
        self.spec()
    }
}

/// Registry create request. Missing fields take the registry defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewFunction {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub runtime: String,
    pub code: String,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub memory_mb: Option<i32>,
    #[serde(default)]
    pub timeout_sec: Option<i32>,
    #[serde(default)]
    pub status: Option<FunctionStatus>,
}

impl NewFunction {
    /// Build a validated [`Function`] with a fresh id.
    pub fn into_function(self) -> Result<Function, FunctionValidationError> {
        let now = Utc::now();
        let function = Function {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name,
            description: self.description,
            runtime: self.runtime,
            code: self.code,
            entry_point: self
                .entry_point
                .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string()),
            memory_mb: self.memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
            timeout_sec: self.timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SEC),
            status: self.status.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        function.spec()?;
        Ok(function)
    }
}

/// Partial update; `None` leaves the stored value unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub runtime: Option<String>,
    pub code: Option<String>,
    pub entry_point: Option<String>,
    pub memory_mb: Option<i32>,
    pub timeout_sec: Option<i32>,
    pub status: Option<FunctionStatus>,
}

impl FunctionUpdate {
    /// Apply onto an existing definition and re-validate the result.
    pub fn apply(self, mut function: Function) -> Result<Function, FunctionValidationError> {
        if let Some(name) = self.name {
            function.name = name;
        }
        if let Some(description) = self.description {
            function.description = Some(description);
        }
        if let Some(runtime) = self.runtime {
            function.runtime = runtime;
        }
        if let Some(code) = self.code {
            function.code = code;
        }
        if let Some(entry_point) = self.entry_point {
            function.entry_point = entry_point;
        }
        if let Some(memory_mb) = self.memory_mb {
            function.memory_mb = memory_mb;
        }
        if let Some(timeout_sec) = self.timeout_sec {
            function.timeout_sec = timeout_sec;
        }
        if let Some(status) = self.status {
            function.status = status;
        }
        function.spec()?;
        function.updated_at = Utc::now();
        Ok(function)
    }
}
