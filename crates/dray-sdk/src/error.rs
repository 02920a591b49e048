// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK-specific error types.

use dray_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the SDK.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Spawn referenced a task name with no registration and no explicit queue
    #[error("task '{name}' is not registered and no queue was given")]
    UnregisteredTask {
        /// The unknown task name
        name: String,
    },

    /// Spawn requested a queue that disagrees with the task's bound queue
    #[error("task '{name}' is bound to queue '{bound}', not '{requested}'")]
    QueueMismatch {
        /// The task name
        name: String,
        /// The queue the registration is bound to
        bound: String,
        /// The queue the caller requested
        requested: String,
    },

    /// Configuration error (missing or invalid option or environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// A handler failed; the failure was persisted on the run
    #[error("{message}")]
    Handler {
        /// The handler's error message
        message: String,
        /// Stack or backtrace text if one was captured
        stack: Option<String>,
    },

    /// The worker lost its claim on a run while executing it
    #[error("claim lease lost for run {run_id}")]
    LeaseLost {
        /// The run whose lease lapsed
        run_id: Uuid,
    },

    /// Datastore operation failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal SDK error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Type alias for SDK results.
pub type Result<T> = std::result::Result<T, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_task_display() {
        let err = SdkError::UnregisteredTask {
            name: "resize-image".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "task 'resize-image' is not registered and no queue was given"
        );
    }

    #[test]
    fn test_queue_mismatch_display() {
        let err = SdkError::QueueMismatch {
            name: "resize-image".to_string(),
            bound: "media".to_string(),
            requested: "default".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "task 'resize-image' is bound to queue 'media', not 'default'"
        );
    }

    #[test]
    fn test_handler_display_is_bare_message() {
        let err = SdkError::Handler {
            message: "worker boom".to_string(),
            stack: None,
        };
        assert_eq!(format!("{}", err), "worker boom");
    }

    #[test]
    fn test_store_error_is_transparent() {
        let err: SdkError = StoreError::QueueNotFound {
            queue: "orders".to_string(),
        }
        .into();
        assert_eq!(format!("{}", err), "Queue 'orders' not found");
    }

    #[test]
    fn test_lease_lost_display() {
        let run_id = Uuid::nil();
        let err = SdkError::LeaseLost { run_id };
        assert_eq!(
            format!("{}", err),
            format!("claim lease lost for run {}", run_id)
        );
    }
}
