// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed access to versioned state records.
//!
//! Every write is a read-modify-write committed with compare-and-swap on the
//! record's version, retried on conflict. [`StateRef::write_once`] also
//! commits a checkpoint in the same transaction so that a workflow applies a
//! labelled mutation exactly once across replays.

use std::marker::PhantomData;
use std::sync::Arc;

use docubot_core::CoreError;
use docubot_core::persistence::{CasOutcome, CheckpointWrite, Persistence, StateRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::context::WorkflowContext;
use crate::error::{Result, SdkError};

/// Handle to one durable record of type `T`.
pub struct StateRef<T> {
    persistence: Arc<dyn Persistence>,
    state_type: &'static str,
    state_id: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for StateRef<T> {
    fn clone(&self) -> Self {
        Self {
            persistence: self.persistence.clone(),
            state_type: self.state_type,
            state_id: self.state_id.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> StateRef<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a handle. The record itself is not touched.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        state_type: &'static str,
        state_id: impl Into<String>,
    ) -> Self {
        Self {
            persistence,
            state_type,
            state_id: state_id.into(),
            _marker: PhantomData,
        }
    }

    /// Record identifier.
    pub fn id(&self) -> &str {
        &self.state_id
    }

    /// Insert the record unless it already exists.
    ///
    /// Returns true if it was created.
    pub async fn create(&self, initial: &T) -> Result<bool> {
        let data = serde_json::to_string(initial)?;
        let created = self
            .persistence
            .create_state(self.state_type, &self.state_id, &data)
            .await?;
        Ok(created)
    }

    /// Read the record, or `None` if it does not exist.
    pub async fn try_read(&self) -> Result<Option<T>> {
        match self
            .persistence
            .load_state(self.state_type, &self.state_id)
            .await?
        {
            Some(record) => Ok(Some(serde_json::from_str(&record.data)?)),
            None => Ok(None),
        }
    }

    /// Read the record.
    pub async fn read(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.load().await?.data)?)
    }

    /// Apply `mutate` to the record and commit it.
    ///
    /// `mutate` is re-run on a fresh copy after a version conflict, so it
    /// must not have side effects. A mutation that leaves the record
    /// unchanged is not written.
    #[instrument(skip(self, mutate), fields(state_type = self.state_type, state_id = %self.state_id))]
    pub async fn write<R, F>(&self, mut mutate: F) -> Result<R>
    where
        F: FnMut(&mut T) -> R,
    {
        loop {
            let record = self.load().await?;
            let mut value: T = serde_json::from_str(&record.data)?;
            let result = mutate(&mut value);
            let data = serde_json::to_string(&value)?;

            if data == record.data {
                return Ok(result);
            }

            match self
                .persistence
                .compare_and_swap_state(self.state_type, &self.state_id, record.version, &data, None)
                .await?
            {
                CasOutcome::Applied => return Ok(result),
                CasOutcome::VersionConflict => {
                    debug!(version = record.version, "Version conflict, retrying write");
                }
                CasOutcome::AlreadyRecorded => {
                    return Err(SdkError::Internal(
                        "checkpoint reported for a write without one".to_string(),
                    ));
                }
            }
        }
    }

    /// Apply `mutate` exactly once for `label` within the workflow.
    ///
    /// The mutation's result is checkpointed atomically with the record
    /// update. Replays return the recorded result without touching the record.
    #[instrument(skip(self, ctx, mutate), fields(state_type = self.state_type, state_id = %self.state_id, instance_id = %ctx.instance_id()))]
    pub async fn write_once<R, F>(&self, ctx: &WorkflowContext, label: &str, mut mutate: F) -> Result<R>
    where
        R: Serialize + DeserializeOwned,
        F: FnMut(&mut T) -> R,
    {
        if let Some(recorded) = ctx.get_checkpoint(label).await? {
            debug!("Write already applied");
            return Ok(recorded);
        }

        let key = ctx.checkpoint_key(label);
        loop {
            let record = self.load().await?;
            let mut value: T = serde_json::from_str(&record.data)?;
            let result = mutate(&mut value);
            let data = serde_json::to_string(&value)?;
            let recorded = serde_json::to_vec(&result)?;

            let checkpoint = CheckpointWrite {
                instance_id: ctx.instance_id(),
                checkpoint_id: &key,
                state: &recorded,
            };

            match self
                .persistence
                .compare_and_swap_state(
                    self.state_type,
                    &self.state_id,
                    record.version,
                    &data,
                    Some(checkpoint),
                )
                .await?
            {
                CasOutcome::Applied => return Ok(result),
                CasOutcome::VersionConflict => {
                    debug!(version = record.version, "Version conflict, retrying write");
                }
                CasOutcome::AlreadyRecorded => {
                    return ctx.get_checkpoint(label).await?.ok_or_else(|| {
                        SdkError::Internal(format!("checkpoint '{}' vanished", key))
                    });
                }
            }
        }
    }

    async fn load(&self) -> Result<StateRecord> {
        self.persistence
            .load_state(self.state_type, &self.state_id)
            .await?
            .ok_or_else(|| {
                SdkError::Persistence(CoreError::StateNotFound {
                    state_type: self.state_type.to_string(),
                    state_id: self.state_id.clone(),
                })
            })
    }
}
