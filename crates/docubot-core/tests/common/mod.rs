// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for docubot-core persistence tests.

#![allow(dead_code)]

use docubot_core::persistence::{Persistence, SqlitePersistence};
use sqlx::sqlite::SqlitePoolOptions;

/// Test context holding an in-memory database with the schema applied.
pub struct TestContext {
    pub persistence: SqlitePersistence,
}

impl TestContext {
    pub async fn new() -> Self {
        // Single connection: every in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory SQLite");

        docubot_core::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        Self {
            persistence: SqlitePersistence::new(pool),
        }
    }

    /// Create an instance and return its ID.
    pub async fn create_instance(&self, instance_id: &str, kind: &str) -> String {
        let created = self
            .persistence
            .create_instance(instance_id, kind, b"{}")
            .await
            .expect("Failed to create instance");
        assert!(created, "instance {} already existed", instance_id);
        instance_id.to_string()
    }
}
