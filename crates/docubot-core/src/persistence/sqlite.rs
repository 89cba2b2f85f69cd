// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

use crate::error::CoreError;

use super::{
    CasOutcome, CheckpointRecord, CheckpointWrite, InstanceRecord, Persistence,
    RetryAttemptRecord, StateRecord,
};

fn require_id(field: &str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() {
        return Err(CoreError::ValidationError {
            field: field.to_string(),
            message: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn checkpoint_failed(instance_id: &str, err: sqlx::Error) -> CoreError {
    CoreError::CheckpointSaveFailed {
        instance_id: instance_id.to_string(),
        reason: err.to_string(),
    }
}

const INSTANCE_COLUMNS: &str = r#"
    instance_id, kind, input, status, iteration, attempt, sleep_until, error,
    created_at, started_at, finished_at
"#;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The pool must already have the schema applied, see
    /// [`crate::migrations::run_sqlite`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/docubot.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let path_str = path.to_string_lossy();
        let url = format!("sqlite:{}?mode=rwc", path_str);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a private in-memory database with migrations applied.
    ///
    /// Uses a single connection, since every SQLite in-memory connection
    /// opens its own database.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        crate::migrations::run_sqlite(pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_instance(
        &self,
        instance_id: &str,
        kind: &str,
        input: &[u8],
    ) -> Result<bool, CoreError> {
        require_id("instance_id", instance_id)?;
        let result = sqlx::query(
            r#"
            INSERT INTO instances (instance_id, kind, input, status, created_at)
            VALUES (?, ?, ?, 'pending', ?)
            ON CONFLICT(instance_id) DO NOTHING
            "#,
        )
        .bind(instance_id)
        .bind(kind)
        .bind(input)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = ?");
        let record = sqlx::query_as::<_, InstanceRecord>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET status = ?1,
                started_at = COALESCE(started_at, ?2)
            WHERE instance_id = ?3
            "#,
        )
        .bind(status)
        .bind(started_at)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }

        Ok(())
    }

    async fn advance_instance_iteration(
        &self,
        instance_id: &str,
        iteration: i64,
        sleep_until: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE instances
            SET iteration = ?1,
                sleep_until = ?2,
                attempt = 0,
                error = NULL,
                status = 'sleeping'
            WHERE instance_id = ?3
            "#,
        )
        .bind(iteration)
        .bind(sleep_until)
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }

        // Checkpoint ids are "{iteration}/{label}"; earlier iterations are never replayed.
        let pruned = sqlx::query(
            r#"
            DELETE FROM checkpoints
            WHERE instance_id = ?1
              AND instr(checkpoint_id, '/') > 0
              AND CAST(substr(checkpoint_id, 1, instr(checkpoint_id, '/') - 1) AS INTEGER) < ?2
            "#,
        )
        .bind(instance_id)
        .bind(iteration)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if pruned.rows_affected() > 0 {
            debug!(
                instance_id = %instance_id,
                iteration,
                pruned = pruned.rows_affected(),
                "Pruned checkpoints of earlier iterations"
            );
        }

        Ok(())
    }

    async fn record_instance_failure(
        &self,
        instance_id: &str,
        attempt: i64,
        error: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE instances
            SET attempt = ?1,
                error = ?2
            WHERE instance_id = ?3
            "#,
        )
        .bind(attempt)
        .bind(error)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_instance(
        &self,
        instance_id: &str,
        error: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE instances
            SET status = CASE
                    WHEN ?1 IS NOT NULL THEN 'failed'
                    ELSE 'completed'
                END,
                finished_at = ?2,
                sleep_until = NULL,
                error = ?1
            WHERE instance_id = ?3
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_instances(
        &self,
        kind: Option<&str>,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM instances
            WHERE (?1 IS NULL OR kind = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at ASC, instance_id ASC
            LIMIT ?3 OFFSET ?4
            "#
        );
        let records = sqlx::query_as::<_, InstanceRecord>(&sql)
            .bind(kind)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn list_unfinished_instances(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM instances
            WHERE status IN ('pending', 'running', 'sleeping')
            ORDER BY created_at ASC, instance_id ASC
            "#
        );
        let records = sqlx::query_as::<_, InstanceRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn clear_instance_sleep(&self, instance_id: &str) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET sleep_until = NULL
            WHERE instance_id = ?
            "#,
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }

        Ok(())
    }

    async fn save_checkpoint(
        &self,
        instance_id: &str,
        checkpoint_id: &str,
        state: &[u8],
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (instance_id, checkpoint_id, state, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(instance_id, checkpoint_id) DO NOTHING
            "#,
        )
        .bind(instance_id)
        .bind(checkpoint_id)
        .bind(state)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| checkpoint_failed(instance_id, e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_checkpoint(
        &self,
        instance_id: &str,
        checkpoint_id: &str,
        state: &[u8],
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (instance_id, checkpoint_id, state, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(instance_id, checkpoint_id) DO UPDATE SET
                state = excluded.state,
                created_at = excluded.created_at
            "#,
        )
        .bind(instance_id)
        .bind(checkpoint_id)
        .bind(state)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| checkpoint_failed(instance_id, e))?;

        Ok(())
    }

    async fn load_checkpoint(
        &self,
        instance_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError> {
        let record = sqlx::query_as::<_, CheckpointRecord>(
            r#"
            SELECT id, instance_id, checkpoint_id, state, created_at
            FROM checkpoints
            WHERE instance_id = ? AND checkpoint_id = ?
            "#,
        )
        .bind(instance_id)
        .bind(checkpoint_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_checkpoints(&self, instance_id: &str) -> Result<Vec<CheckpointRecord>, CoreError> {
        let records = sqlx::query_as::<_, CheckpointRecord>(
            r#"
            SELECT id, instance_id, checkpoint_id, state, created_at
            FROM checkpoints
            WHERE instance_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn save_retry_attempt(
        &self,
        instance_id: &str,
        checkpoint_id: &str,
        attempt: i64,
        error_message: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO retry_attempts (instance_id, checkpoint_id, attempt, error_message, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(instance_id)
        .bind(checkpoint_id)
        .bind(attempt)
        .bind(error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_retry_attempts(
        &self,
        instance_id: &str,
    ) -> Result<Vec<RetryAttemptRecord>, CoreError> {
        let records = sqlx::query_as::<_, RetryAttemptRecord>(
            r#"
            SELECT id, instance_id, checkpoint_id, attempt, error_message, created_at
            FROM retry_attempts
            WHERE instance_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn create_state(
        &self,
        state_type: &str,
        state_id: &str,
        data: &str,
    ) -> Result<bool, CoreError> {
        require_id("state_type", state_type)?;
        require_id("state_id", state_id)?;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO states (state_type, state_id, data, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, 0, ?4, ?4)
            ON CONFLICT(state_type, state_id) DO NOTHING
            "#,
        )
        .bind(state_type)
        .bind(state_id)
        .bind(data)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_state(
        &self,
        state_type: &str,
        state_id: &str,
    ) -> Result<Option<StateRecord>, CoreError> {
        let record = sqlx::query_as::<_, StateRecord>(
            r#"
            SELECT state_type, state_id, data, version, created_at, updated_at
            FROM states
            WHERE state_type = ? AND state_id = ?
            "#,
        )
        .bind(state_type)
        .bind(state_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn compare_and_swap_state(
        &self,
        state_type: &str,
        state_id: &str,
        expected_version: i64,
        data: &str,
        checkpoint: Option<CheckpointWrite<'_>>,
    ) -> Result<CasOutcome, CoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if let Some(cp) = checkpoint {
            let inserted = sqlx::query(
                r#"
                INSERT INTO checkpoints (instance_id, checkpoint_id, state, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(instance_id, checkpoint_id) DO NOTHING
                "#,
            )
            .bind(cp.instance_id)
            .bind(cp.checkpoint_id)
            .bind(cp.state)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                tx.rollback().await?;
                debug!(
                    state_type = %state_type,
                    state_id = %state_id,
                    checkpoint_id = %cp.checkpoint_id,
                    "State write already recorded"
                );
                return Ok(CasOutcome::AlreadyRecorded);
            }
        }

        let updated = sqlx::query(
            r#"
            UPDATE states
            SET data = ?1,
                version = version + 1,
                updated_at = ?2
            WHERE state_type = ?3 AND state_id = ?4 AND version = ?5
            "#,
        )
        .bind(data)
        .bind(now)
        .bind(state_type)
        .bind(state_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(
                state_type = %state_type,
                state_id = %state_id,
                expected_version,
                "State version conflict"
            );
            return Ok(CasOutcome::VersionConflict);
        }

        tx.commit().await?;
        Ok(CasOutcome::Applied)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
