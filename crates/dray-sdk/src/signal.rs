// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The suspension signal and the handler-facing error type.
//!
//! Suspension is expressed as an error variant so it propagates through
//! handler code with `?` like any other failure, yet remains
//! distinguishable by the execution engine. It is raised only after the
//! datastore has persisted the sleeping state, so catching it requires no
//! further bookkeeping.

use std::time::Duration;

use dray_store::StoreError;
use thiserror::Error;

/// Why a run suspended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suspension {
    /// Parked until a named event is emitted.
    Event {
        /// The awaited event name.
        name: String,
    },
    /// Parked until a timer elapses.
    Sleep {
        /// The requested sleep duration.
        duration: Duration,
    },
}

/// Error type returned by task handlers and step bodies.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Control-flow signal: the run was durably parked. Not a failure;
    /// the engine catches it and leaves the run sleeping.
    #[error("run suspended")]
    Suspended(Suspension),

    /// Ordinary handler failure, persisted as the run's failure reason.
    #[error("{message}")]
    Failed {
        /// Human-readable error message.
        message: String,
        /// Stack or backtrace text if one was captured.
        stack: Option<String>,
    },

    /// Datastore failure inside a step or suspend call. The engine
    /// abandons the run rather than recording a handler failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A step value or event payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskError {
    /// Create a failure with just a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: None,
        }
    }

    /// Create a failure with a message and stack text.
    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }

    /// Returns true when this is the suspension signal rather than a failure.
    pub fn is_suspension(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspension_is_not_a_failure() {
        let err = TaskError::Suspended(Suspension::Event {
            name: "payment".to_string(),
        });
        assert!(err.is_suspension());
        assert!(!TaskError::msg("boom").is_suspension());
    }

    #[test]
    fn test_failed_display_is_bare_message() {
        assert_eq!(format!("{}", TaskError::msg("worker boom")), "worker boom");
    }

    #[test]
    fn test_with_stack() {
        let err = TaskError::with_stack("boom", "at step 3");
        match err {
            TaskError::Failed { message, stack } => {
                assert_eq!(message, "boom");
                assert_eq!(stack.as_deref(), Some("at step 3"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
