// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the voltrun store.

use thiserror::Error;

use crate::model::ExecutionStatus;

/// Result type using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the execution and function stores.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Execution was not found.
    #[error("Execution '{execution_id}' not found")]
    ExecutionNotFound {
        /// The execution ID that was not found.
        execution_id: String,
    },

    /// Function was not found.
    #[error("Function '{function_id}' not found")]
    FunctionNotFound {
        /// The function ID that was not found.
        function_id: String,
    },

    /// Another writer already moved the execution away from the expected status.
    #[error(
        "Transition conflict for execution '{execution_id}': expected '{expected}', found '{actual}'"
    )]
    Conflict {
        /// The execution ID.
        execution_id: String,
        /// The status the writer expected to replace.
        expected: ExecutionStatus,
        /// The status actually stored.
        actual: ExecutionStatus,
    },

    /// The requested status edge is not part of the execution lifecycle.
    #[error("Invalid transition from '{from}' to '{to}'")]
    InvalidTransition {
        /// Current status.
        from: ExecutionStatus,
        /// Requested status.
        to: ExecutionStatus,
    },

    /// The transition payload does not fit the target status.
    #[error("Invalid transition payload: {0}")]
    InvalidPayload(String),

    /// A stored row could not be decoded into a record.
    #[error("Corrupt record '{id}': {details}")]
    Corrupt {
        /// Row identifier.
        id: String,
        /// What could not be decoded.
        details: String,
    },

    /// A JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl StoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ExecutionNotFound { .. } => "EXECUTION_NOT_FOUND",
            Self::FunctionNotFound { .. } => "FUNCTION_NOT_FOUND",
            Self::Conflict { .. } => "TRANSITION_CONFLICT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::Corrupt { .. } => "CORRUPT_RECORD",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error means a competing writer won a compare-and-set.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Database {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_codes() {
        let test_cases = vec![
            (
                StoreError::ExecutionNotFound {
                    execution_id: "e1".to_string(),
                },
                "EXECUTION_NOT_FOUND",
            ),
            (
                StoreError::Conflict {
                    execution_id: "e1".to_string(),
                    expected: ExecutionStatus::Running,
                    actual: ExecutionStatus::Failed,
                },
                "TRANSITION_CONFLICT",
            ),
            (
                StoreError::InvalidTransition {
                    from: ExecutionStatus::Running,
                    to: ExecutionStatus::Pending,
                },
                "INVALID_TRANSITION",
            ),
            (
                StoreError::Database {
                    operation: "insert".to_string(),
                    details: "disk full".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(error.error_code(), expected_code, "Error: {:?}", error);
        }
    }

    #[test]
    fn test_conflict_display() {
        let err = StoreError::Conflict {
            execution_id: "abc".to_string(),
            expected: ExecutionStatus::Running,
            actual: ExecutionStatus::Success,
        };
        assert!(err.is_conflict());
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("expected 'running'"));
        assert!(msg.contains("found 'success'"));
    }
}
