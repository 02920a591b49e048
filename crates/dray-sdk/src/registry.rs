// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process task registry.
//!
//! Maps task names to their handler, default attempt policy, and optional
//! bound queue. The registry is read-mostly: registrations happen at
//! startup and handlers already running keep the closure they resolved.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::TaskContext;
use crate::signal::TaskError;

/// Type-erased handler stored in the registry. Typed handlers are wrapped
/// at registration time by [`crate::Dray::register_task`].
pub(crate) type ErasedHandler = Arc<
    dyn Fn(Value, TaskContext) -> BoxFuture<'static, std::result::Result<Value, TaskError>>
        + Send
        + Sync,
>;

/// Declarative half of a task registration.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// The task name producers spawn by.
    pub name: String,
    /// Queue this task is bound to, if any.
    pub queue: Option<String>,
    /// Default maximum number of runs when spawn options do not say.
    pub default_max_attempts: Option<u32>,
}

impl TaskSpec {
    /// Create a spec with just a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: None,
            default_max_attempts: None,
        }
    }

    /// Bind the task to a queue.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the default maximum number of runs.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Clone)]
pub(crate) struct TaskRegistration {
    pub handler: ErasedHandler,
    pub queue: Option<String>,
    pub default_max_attempts: Option<u32>,
}

/// Registry of task registrations, consulted on spawn and on claim dispatch.
#[derive(Default)]
pub(crate) struct TaskRegistry {
    inner: RwLock<HashMap<String, TaskRegistration>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a registration.
    pub fn register(&self, name: impl Into<String>, registration: TaskRegistration) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.insert(name.into(), registration);
    }

    /// Look up a registration by task name.
    pub fn get(&self, name: &str) -> Option<TaskRegistration> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> ErasedHandler {
        Arc::new(|params, _ctx| Box::pin(async move { Ok(params) }))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = TaskRegistry::new();
        registry.register(
            "echo",
            TaskRegistration {
                handler: noop_handler(),
                queue: Some("default".to_string()),
                default_max_attempts: Some(3),
            },
        );

        let found = registry.get("echo").expect("registered");
        assert_eq!(found.queue.as_deref(), Some("default"));
        assert_eq!(found.default_max_attempts, Some(3));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_overwrite_is_permitted() {
        let registry = TaskRegistry::new();
        registry.register(
            "echo",
            TaskRegistration {
                handler: noop_handler(),
                queue: None,
                default_max_attempts: Some(1),
            },
        );
        registry.register(
            "echo",
            TaskRegistration {
                handler: noop_handler(),
                queue: None,
                default_max_attempts: Some(5),
            },
        );
        assert_eq!(
            registry.get("echo").expect("registered").default_max_attempts,
            Some(5)
        );
    }

    #[test]
    fn test_task_spec_builders() {
        let spec = TaskSpec::new("resize")
            .on_queue("media")
            .with_default_max_attempts(2);
        assert_eq!(spec.name, "resize");
        assert_eq!(spec.queue.as_deref(), Some("media"));
        assert_eq!(spec.default_max_attempts, Some(2));
    }
}
