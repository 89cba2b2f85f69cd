// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for docubot-sdk integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use docubot_core::persistence::{Persistence, SqlitePersistence};
use docubot_sdk::{RetryConfig, RetryStrategy, RuntimeConfig, WorkflowContext};
use sqlx::sqlite::SqlitePoolOptions;

/// Create test persistence with in-memory SQLite.
pub async fn create_test_persistence() -> Arc<dyn Persistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    docubot_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");

    Arc::new(SqlitePersistence::new(pool))
}

/// Millisecond-scale policies so tests do not wait on real backoff.
pub fn fast_retry(max_retries: Option<u32>) -> RetryConfig {
    RetryConfig::new(max_retries, 1, RetryStrategy::ExponentialBackoff).with_max_delay_ms(5)
}

pub fn fast_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        step_retry: fast_retry(Some(3)),
        iteration_retry: fast_retry(Some(5)),
        wait: RetryConfig::fixed(2),
    }
}

pub fn test_context(persistence: Arc<dyn Persistence>, instance_id: &str) -> WorkflowContext {
    WorkflowContext::new(persistence, instance_id)
        .with_retry_config(fast_retry(Some(3)))
        .with_wait_config(RetryConfig::fixed(2))
}

pub const POLL: Duration = Duration::from_millis(5);
