// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow execution context and the durable step primitives.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use docubot_core::persistence::Persistence;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SdkError, StepError};
use crate::types::RetryConfig;

/// Outcome marker stored for an at-most-once step.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum AtMostOnceMarker {
    Started,
    Succeeded { value: serde_json::Value },
    Failed { message: String },
}

/// Handle passed to a workflow for one iteration of one instance.
///
/// All step results are checkpointed under `"{iteration}/{label}"`, so labels
/// only need to be unique within an iteration.
#[derive(Clone)]
pub struct WorkflowContext {
    persistence: Arc<dyn Persistence>,
    instance_id: String,
    iteration: i64,
    retry: RetryConfig,
    wait: RetryConfig,
    cancel: CancellationToken,
}

impl WorkflowContext {
    /// Create a context at iteration 0 with default retry and wait policies.
    pub fn new(persistence: Arc<dyn Persistence>, instance_id: impl Into<String>) -> Self {
        Self {
            persistence,
            instance_id: instance_id.into(),
            iteration: 0,
            retry: RetryConfig::default(),
            wait: RetryConfig::fixed(500),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the loop iteration.
    pub fn with_iteration(mut self, iteration: i64) -> Self {
        self.iteration = iteration;
        self
    }

    /// Set the retry policy used by [`retry_idempotent`](Self::retry_idempotent).
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the polling policy used by [`wait_until`](Self::wait_until).
    pub fn with_wait_config(mut self, wait: RetryConfig) -> Self {
        self.wait = wait;
        self
    }

    /// Use a cancellation token that interrupts backoff sleeps.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The instance this context belongs to.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Current loop iteration (0 for one-shot workflows).
    pub fn iteration(&self) -> i64 {
        self.iteration
    }

    /// The persistence backend.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Whether the runtime is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Checkpoint key for a label in the current iteration.
    pub fn checkpoint_key(&self, label: &str) -> String {
        format!("{}/{}", self.iteration, label)
    }

    /// Load a memoized value for `label`, if any.
    pub async fn get_checkpoint<T: DeserializeOwned>(&self, label: &str) -> Result<Option<T>> {
        let key = self.checkpoint_key(label);
        match self
            .persistence
            .load_checkpoint(&self.instance_id, &key)
            .await?
        {
            Some(record) => Ok(Some(serde_json::from_slice(&record.state)?)),
            None => Ok(None),
        }
    }

    /// Memoize `value` under `label` unless a value is already recorded.
    ///
    /// Returns the value that is durably recorded, which is the earlier one if
    /// the label was already checkpointed.
    pub async fn save_checkpoint<T>(&self, label: &str, value: T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let key = self.checkpoint_key(label);
        let bytes = serde_json::to_vec(&value)?;
        let inserted = self
            .persistence
            .save_checkpoint(&self.instance_id, &key, &bytes)
            .await?;

        if inserted {
            return Ok(value);
        }

        debug!(checkpoint_id = %key, "Checkpoint already recorded, using stored value");
        self.get_checkpoint(label)
            .await?
            .ok_or_else(|| SdkError::Internal(format!("checkpoint '{}' vanished", key)))
    }

    /// Sleep, returning [`SdkError::Cancelled`] if the runtime shuts down first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(SdkError::Cancelled),
        }
    }

    /// Run an idempotent operation with retries and memoize its result.
    ///
    /// - A recorded result for `label` is returned without running `op`.
    /// - [`StepError::Retryable`] failures are recorded and retried with the
    ///   context's backoff until the retry budget is exhausted.
    /// - [`StepError::Fatal`] failures propagate immediately.
    #[instrument(skip(self, op), fields(instance_id = %self.instance_id, iteration = self.iteration))]
    pub async fn retry_idempotent<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StepError>>,
    {
        if let Some(value) = self.get_checkpoint(label).await? {
            debug!("Returning memoized result");
            return Ok(value);
        }

        let key = self.checkpoint_key(label);
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => return self.save_checkpoint(label, value).await,
                Err(StepError::Fatal(message)) => {
                    warn!(error = %message, "Step failed fatally");
                    return Err(SdkError::Step {
                        label: label.to_string(),
                        source: StepError::Fatal(message),
                    });
                }
                Err(StepError::Retryable(message)) => {
                    attempt += 1;
                    self.persistence
                        .save_retry_attempt(
                            &self.instance_id,
                            &key,
                            i64::from(attempt),
                            Some(&message),
                        )
                        .await?;

                    if !self.retry.allows_attempt(attempt) {
                        warn!(attempt, error = %message, "Retries exhausted");
                        return Err(SdkError::Step {
                            label: label.to_string(),
                            source: StepError::Retryable(message),
                        });
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Step failed, retrying"
                    );
                    self.sleep(delay).await?;
                }
            }
        }
    }

    /// Run a non-idempotent operation at most once.
    ///
    /// A `started` marker is recorded before `op` runs and the outcome after.
    /// On replay a recorded outcome is returned as-is; a marker without an
    /// outcome means the process died mid-call, and
    /// [`SdkError::AtMostOnceInterrupted`] is returned without running `op`.
    #[instrument(skip(self, op), fields(instance_id = %self.instance_id, iteration = self.iteration))]
    pub async fn retry_at_most_once<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, StepError>>,
    {
        let key = self.checkpoint_key(label);

        if let Some(record) = self
            .persistence
            .load_checkpoint(&self.instance_id, &key)
            .await?
        {
            let marker: AtMostOnceMarker = serde_json::from_slice(&record.state)?;
            return match marker {
                AtMostOnceMarker::Started => {
                    warn!("At-most-once step was interrupted, not re-running");
                    Err(SdkError::AtMostOnceInterrupted {
                        label: label.to_string(),
                    })
                }
                AtMostOnceMarker::Succeeded { value } => Ok(serde_json::from_value(value)?),
                AtMostOnceMarker::Failed { message } => Err(SdkError::AtMostOnceFailed {
                    label: label.to_string(),
                    message,
                }),
            };
        }

        self.persistence
            .upsert_checkpoint(
                &self.instance_id,
                &key,
                &serde_json::to_vec(&AtMostOnceMarker::Started)?,
            )
            .await?;

        match op().await {
            Ok(value) => {
                let marker = AtMostOnceMarker::Succeeded {
                    value: serde_json::to_value(&value)?,
                };
                self.persistence
                    .upsert_checkpoint(&self.instance_id, &key, &serde_json::to_vec(&marker)?)
                    .await?;
                Ok(value)
            }
            Err(err) => {
                let message = err.to_string();
                let marker = AtMostOnceMarker::Failed {
                    message: message.clone(),
                };
                self.persistence
                    .upsert_checkpoint(&self.instance_id, &key, &serde_json::to_vec(&marker)?)
                    .await?;
                warn!(error = %message, "At-most-once step failed");
                Err(SdkError::AtMostOnceFailed {
                    label: label.to_string(),
                    message,
                })
            }
        }
    }

    /// Block until `predicate` yields a value, then memoize it.
    ///
    /// The predicate is re-evaluated on the context's wait policy. There is
    /// no timeout. Retryable predicate failures count as "not yet"; fatal
    /// ones propagate.
    #[instrument(skip(self, predicate), fields(instance_id = %self.instance_id, iteration = self.iteration))]
    pub async fn wait_until<T, F, Fut>(&self, label: &str, mut predicate: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, StepError>>,
    {
        if let Some(value) = self.get_checkpoint(label).await? {
            debug!("Condition already satisfied");
            return Ok(value);
        }

        let mut attempt: u32 = 0;
        loop {
            match predicate().await {
                Ok(Some(value)) => {
                    if attempt > 0 {
                        info!(polls = attempt, "Condition satisfied");
                    }
                    return self.save_checkpoint(label, value).await;
                }
                Ok(None) => {}
                Err(StepError::Retryable(message)) => {
                    warn!(error = %message, "Condition check failed, will retry");
                }
                Err(StepError::Fatal(message)) => {
                    return Err(SdkError::Step {
                        label: label.to_string(),
                        source: StepError::Fatal(message),
                    });
                }
            }

            attempt = attempt.saturating_add(1);
            self.sleep(self.wait.delay_for_attempt(attempt)).await?;
        }
    }
}
