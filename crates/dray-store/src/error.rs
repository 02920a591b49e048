// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the datastore adapter.

use std::fmt;

use uuid::Uuid;

/// Result type using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by datastore operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum StoreError {
    /// The named queue does not exist.
    QueueNotFound {
        /// The queue that was not found.
        queue: String,
    },

    /// The task was not found.
    TaskNotFound {
        /// The task id that was not found.
        task_id: Uuid,
    },

    /// The run was not found.
    RunNotFound {
        /// The run id that was not found.
        run_id: Uuid,
    },

    /// The worker no longer owns the run's claim.
    NotOwner {
        /// The contested run.
        run_id: Uuid,
        /// The worker that attempted the operation.
        worker_id: String,
    },

    /// Input validation failed.
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A stored value could not be encoded or decoded.
    Serialization {
        /// Error details.
        details: String,
    },
}

impl StoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::QueueNotFound { .. } => "QUEUE_NOT_FOUND",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::NotOwner { .. } => "NOT_OWNER",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Returns true when the error reports a lost or contested claim.
    pub fn is_not_owner(&self) -> bool {
        matches!(self, Self::NotOwner { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueNotFound { queue } => write!(f, "Queue '{}' not found", queue),
            Self::TaskNotFound { task_id } => write!(f, "Task '{}' not found", task_id),
            Self::RunNotFound { run_id } => write!(f, "Run '{}' not found", run_id),
            Self::NotOwner { run_id, worker_id } => {
                write!(
                    f,
                    "Run '{}' is not claimed by worker '{}'",
                    run_id, worker_id
                )
            }
            Self::Validation { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::Database { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::Serialization { details } => write!(f, "Serialization error: {}", details),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let run_id = Uuid::nil();
        let cases: Vec<(StoreError, &str)> = vec![
            (
                StoreError::QueueNotFound {
                    queue: "q".to_string(),
                },
                "QUEUE_NOT_FOUND",
            ),
            (
                StoreError::TaskNotFound { task_id: run_id },
                "TASK_NOT_FOUND",
            ),
            (StoreError::RunNotFound { run_id }, "RUN_NOT_FOUND"),
            (
                StoreError::NotOwner {
                    run_id,
                    worker_id: "w".to_string(),
                },
                "NOT_OWNER",
            ),
            (
                StoreError::Validation {
                    field: "queue".to_string(),
                    message: "bad".to_string(),
                },
                "VALIDATION_ERROR",
            ),
            (
                StoreError::Database {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
            (
                StoreError::Serialization {
                    details: "invalid JSON".to_string(),
                },
                "SERIALIZATION_ERROR",
            ),
        ];

        for (error, expected_code) in cases {
            assert_eq!(error.error_code(), expected_code);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_is_not_owner() {
        let err = StoreError::NotOwner {
            run_id: Uuid::nil(),
            worker_id: "w".to_string(),
        };
        assert!(err.is_not_owner());
        assert!(!StoreError::QueueNotFound {
            queue: "q".to_string()
        }
        .is_not_owner());
    }

    #[test]
    fn test_display() {
        let err = StoreError::QueueNotFound {
            queue: "orders".to_string(),
        };
        assert_eq!(err.to_string(), "Queue 'orders' not found");

        let err = StoreError::Database {
            operation: "claim".to_string(),
            details: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "Database error during 'claim': timeout");
    }
}
