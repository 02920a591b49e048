// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK configuration for connecting to the datastore.

use std::env;

use dray_store::postgres::DEFAULT_SCHEMA;

use crate::error::{Result, SdkError};

/// Default queue name when none is configured.
pub const DEFAULT_QUEUE: &str = "default";

/// Configuration for a PostgreSQL-backed [`crate::Dray`] client.
#[derive(Debug, Clone)]
pub struct DrayConfig {
    /// PostgreSQL connection string (required)
    pub database_url: String,
    /// Schema holding the queue tables (default: "dray")
    pub schema: String,
    /// Default queue for spawn and worker operations (default: "default")
    pub default_queue: String,
    /// Maximum connections in the shared pool (default: 10)
    pub max_connections: u32,
}

impl DrayConfig {
    /// Create a configuration with defaults for everything but the URL.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            default_queue: DEFAULT_QUEUE.to_string(),
            max_connections: 10,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `DRAY_DATABASE_URL` - PostgreSQL connection string
    ///
    /// # Optional Environment Variables
    /// - `DRAY_SCHEMA` - schema for queue tables (default: "dray")
    /// - `DRAY_QUEUE` - default queue name (default: "default")
    /// - `DRAY_MAX_CONNECTIONS` - pool size (default: 10)
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DRAY_DATABASE_URL")
            .map_err(|_| SdkError::Config("DRAY_DATABASE_URL is required".to_string()))?;

        let schema = env::var("DRAY_SCHEMA").unwrap_or_else(|_| DEFAULT_SCHEMA.to_string());

        let default_queue = env::var("DRAY_QUEUE").unwrap_or_else(|_| DEFAULT_QUEUE.to_string());

        let max_connections = env::var("DRAY_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            database_url,
            schema,
            default_queue,
            max_connections,
        })
    }

    /// Set the schema for queue tables.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the default queue.
    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Set the connection pool size.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}
