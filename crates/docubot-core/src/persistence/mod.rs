// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for docubot-core.
//!
//! This module defines the persistence abstraction and backend implementations.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// Workflow instance record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRecord {
    /// Unique identifier for the instance.
    pub instance_id: String,
    /// Registered workflow kind that executes this instance.
    pub kind: String,
    /// Serialized workflow input.
    pub input: Vec<u8>,
    /// Current status (pending, running, sleeping, completed, failed).
    pub status: String,
    /// Loop iteration the instance is at (0 for one-shot workflows).
    pub iteration: i64,
    /// Failed attempts of the current iteration.
    pub attempt: i64,
    /// When a sleeping instance should be re-entered.
    pub sleep_until: Option<DateTime<Utc>>,
    /// Error message from the last failure.
    pub error: Option<String>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the instance finished (completed or failed).
    pub finished_at: Option<DateTime<Utc>>,
}

/// Checkpoint record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckpointRecord {
    /// Database primary key.
    pub id: i64,
    /// Instance this checkpoint belongs to.
    pub instance_id: String,
    /// Unique checkpoint identifier within the instance.
    pub checkpoint_id: String,
    /// Serialized state data.
    pub state: Vec<u8>,
    /// When the checkpoint was created.
    pub created_at: DateTime<Utc>,
}

/// Failed attempt of a retried step or iteration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RetryAttemptRecord {
    /// Database primary key.
    pub id: i64,
    /// Instance the attempt belongs to.
    pub instance_id: String,
    /// Checkpoint (step label) that was being retried.
    pub checkpoint_id: String,
    /// Attempt number, starting at 1.
    pub attempt: i64,
    /// Error that caused the retry.
    pub error_message: Option<String>,
    /// When the attempt failed.
    pub created_at: DateTime<Utc>,
}

/// Versioned application record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StateRecord {
    /// Record type (e.g. "assistant", "thread").
    pub state_type: String,
    /// Record identifier within its type.
    pub state_id: String,
    /// JSON document.
    pub data: String,
    /// Incremented on every successful write.
    pub version: i64,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

/// Checkpoint committed atomically with a state update.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointWrite<'a> {
    /// Instance the checkpoint belongs to.
    pub instance_id: &'a str,
    /// Checkpoint identifier.
    pub checkpoint_id: &'a str,
    /// Serialized state to store.
    pub state: &'a [u8],
}

/// Outcome of [`Persistence::compare_and_swap_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The update (and checkpoint, if any) was committed.
    Applied,
    /// The stored version no longer matches; nothing was written.
    VersionConflict,
    /// The checkpoint already exists; nothing was written.
    AlreadyRecorded,
}

/// Persistence interface used by the sdk runtime and workflows.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Instances
    // ========================================================================

    /// Insert a pending instance unless one with the same ID exists.
    ///
    /// Returns true if a new row was created.
    async fn create_instance(
        &self,
        instance_id: &str,
        kind: &str,
        input: &[u8],
    ) -> Result<bool, CoreError>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError>;

    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    /// Move a looping instance to its next iteration.
    ///
    /// Sets `iteration`, `sleep_until`, resets `attempt`, and marks the
    /// instance as sleeping. Checkpoints of iterations before `iteration` are
    /// deleted in the same transaction.
    async fn advance_instance_iteration(
        &self,
        instance_id: &str,
        iteration: i64,
        sleep_until: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Record a failed attempt of the current iteration.
    async fn record_instance_failure(
        &self,
        instance_id: &str,
        attempt: i64,
        error: &str,
    ) -> Result<(), CoreError>;

    /// Mark an instance as completed, or failed when `error` is set.
    async fn complete_instance(
        &self,
        instance_id: &str,
        error: Option<&str>,
    ) -> Result<(), CoreError>;

    async fn list_instances(
        &self,
        kind: Option<&str>,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Instances that have not reached a terminal status.
    async fn list_unfinished_instances(&self) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Clear the sleep_until timestamp for an instance.
    async fn clear_instance_sleep(&self, instance_id: &str) -> Result<(), CoreError>;

    // ========================================================================
    // Checkpoints
    // ========================================================================

    /// Save a checkpoint unless one already exists for the key.
    ///
    /// Returns true if the checkpoint was inserted.
    async fn save_checkpoint(
        &self,
        instance_id: &str,
        checkpoint_id: &str,
        state: &[u8],
    ) -> Result<bool, CoreError>;

    /// Save or replace a checkpoint.
    async fn upsert_checkpoint(
        &self,
        instance_id: &str,
        checkpoint_id: &str,
        state: &[u8],
    ) -> Result<(), CoreError>;

    async fn load_checkpoint(
        &self,
        instance_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError>;

    async fn list_checkpoints(&self, instance_id: &str) -> Result<Vec<CheckpointRecord>, CoreError>;

    async fn save_retry_attempt(
        &self,
        instance_id: &str,
        checkpoint_id: &str,
        attempt: i64,
        error_message: Option<&str>,
    ) -> Result<(), CoreError>;

    async fn list_retry_attempts(
        &self,
        instance_id: &str,
    ) -> Result<Vec<RetryAttemptRecord>, CoreError>;

    // ========================================================================
    // State records
    // ========================================================================

    /// Insert a record at version 0 unless it already exists.
    ///
    /// Returns true if the record was created.
    async fn create_state(
        &self,
        state_type: &str,
        state_id: &str,
        data: &str,
    ) -> Result<bool, CoreError>;

    async fn load_state(
        &self,
        state_type: &str,
        state_id: &str,
    ) -> Result<Option<StateRecord>, CoreError>;

    /// Replace a record's data if its version still equals `expected_version`.
    ///
    /// When `checkpoint` is given it is inserted in the same transaction; if it
    /// already exists nothing is written and [`CasOutcome::AlreadyRecorded`]
    /// is returned.
    async fn compare_and_swap_state(
        &self,
        state_type: &str,
        state_id: &str,
        expected_version: i64,
        data: &str,
        checkpoint: Option<CheckpointWrite<'_>>,
    ) -> Result<CasOutcome, CoreError>;

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
