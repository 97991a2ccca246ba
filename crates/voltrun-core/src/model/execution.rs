// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution records, statuses and error kinds.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of an execution.
///
/// Moves strictly `pending -> running -> success | failed`. Terminal states
/// are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Success) | (Running, Failed)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// Classification of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    ResourceExhausted,
    SandboxProvisionError,
    ExecutionTimeout,
    ExecutionCrashed,
    #[serde(rename = "OOMKilled")]
    OomKilled,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::SandboxProvisionError => "SandboxProvisionError",
            ErrorKind::ExecutionTimeout => "ExecutionTimeout",
            ErrorKind::ExecutionCrashed => "ExecutionCrashed",
            ErrorKind::OomKilled => "OOMKilled",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure stored on a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One execution of a function, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub function_id: String,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<ExecutionError>,
    pub logs: String,
    pub duration_ms: Option<i64>,
    pub memory_peak_mb: Option<i64>,
    pub sandbox_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing, default)]
    pub deadline_at: Option<DateTime<Utc>>,
}

/// Insert request for a new `pending` execution.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub id: String,
    pub function_id: String,
    pub input: Value,
    pub created_at: DateTime<Utc>,
    /// Instant after which the watchdog may reconcile the row.
    pub deadline_at: DateTime<Utc>,
}

impl NewExecution {
    pub fn new(function_id: impl Into<String>, input: Value, deadline_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            function_id: function_id.into(),
            input,
            created_at: Utc::now(),
            deadline_at,
        }
    }
}

/// Fields written alongside a status transition. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPayload {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<ExecutionError>,
    pub logs: Option<String>,
    pub duration_ms: Option<i64>,
    pub memory_peak_mb: Option<i64>,
    pub sandbox_id: Option<String>,
}

impl TransitionPayload {
    /// Payload for `pending -> running`.
    pub fn started(deadline_at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(Utc::now()),
            deadline_at: Some(deadline_at),
            ..Default::default()
        }
    }

    /// Payload for a `success` transition.
    pub fn succeeded(output: Value, logs: String, duration_ms: i64) -> Self {
        Self {
            finished_at: Some(Utc::now()),
            output: Some(output),
            logs: Some(logs),
            duration_ms: Some(duration_ms),
            ..Default::default()
        }
    }

    /// Payload for a `failed` transition.
    pub fn failed(error: ExecutionError, logs: String, duration_ms: Option<i64>) -> Self {
        Self {
            finished_at: Some(Utc::now()),
            error: Some(error),
            logs: Some(logs),
            duration_ms,
            ..Default::default()
        }
    }

    pub fn with_sandbox(mut self, sandbox_id: Option<String>) -> Self {
        self.sandbox_id = sandbox_id;
        self
    }

    pub fn with_memory_peak(mut self, memory_peak_mb: Option<i64>) -> Self {
        self.memory_peak_mb = memory_peak_mb;
        self
    }

    /// Output only on success, error only (and always) on failure.
    pub fn check_for(&self, to: ExecutionStatus) -> Result<(), String> {
        match to {
            ExecutionStatus::Success if self.error.is_some() => {
                Err("a successful execution cannot carry an error".to_string())
            }
            ExecutionStatus::Failed if self.output.is_some() => {
                Err("a failed execution cannot carry output".to_string())
            }
            ExecutionStatus::Failed if self.error.is_none() => {
                Err("a failed execution requires an error".to_string())
            }
            ExecutionStatus::Pending | ExecutionStatus::Running
                if self.output.is_some() || self.error.is_some() =>
            {
                Err(format!("'{to}' cannot carry output or error"))
            }
            _ => Ok(()),
        }
    }
}

/// Filters for listing executions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionFilter {
    pub function_id: Option<String>,
    pub status: Option<ExecutionStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_edges() {
        use ExecutionStatus::*;
        let all = [Pending, Running, Success, Failed];
        let allowed = [
            (Pending, Running),
            (Running, Success),
            (Running, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
        assert!(Success.is_terminal() && Failed.is_terminal());
        assert!(!Pending.is_terminal() && !Running.is_terminal());
    }

    #[test]
    fn test_error_serializes_as_kind_and_message() {
        let err = ExecutionError::new(ErrorKind::OomKilled, "exceeded 128 MB");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value, json!({"kind": "OOMKilled", "message": "exceeded 128 MB"}));

        let back: ExecutionError = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_payload_rules() {
        let ok = TransitionPayload::succeeded(json!(1), String::new(), 5);
        assert!(ok.check_for(ExecutionStatus::Success).is_ok());
        assert!(ok.check_for(ExecutionStatus::Failed).is_err());

        let failed = TransitionPayload::failed(
            ExecutionError::new(ErrorKind::ExecutionTimeout, "late"),
            String::new(),
            None,
        );
        assert!(failed.check_for(ExecutionStatus::Failed).is_ok());
        assert!(failed.check_for(ExecutionStatus::Success).is_err());

        assert!(TransitionPayload::default()
            .check_for(ExecutionStatus::Failed)
            .is_err());
        assert!(TransitionPayload::started(Utc::now())
            .check_for(ExecutionStatus::Running)
            .is_ok());
    }
}
