// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process workflow runtime.
//!
//! [`WorkflowRuntime`] drives registered [`Workflow`]s as tokio tasks. Each
//! instance row in the database is executed by at most one task; its loop
//! position (`iteration`, `sleep_until`) lives in the row, so a restarted
//! process picks up where the previous one stopped via
//! [`WorkflowRuntime::resume_unfinished`].
//!
//! # Example
//!
//! ```rust,ignore
//! let runtime = WorkflowRuntime::builder()
//!     .persistence(persistence)
//!     .workflow(CrawlLoopWorkflow::new(provider, crawler))
//!     .build()?;
//!
//! runtime.resume_unfinished().await?;
//! runtime.schedule("crawl", "crawl:docs", &input).await?;
//!
//! // Graceful shutdown
//! runtime.shutdown().await;
//! ```

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docubot_core::CoreError;
use docubot_core::persistence::{InstanceRecord, Persistence};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::WorkflowContext;
use crate::error::{Result, SdkError};
use crate::types::{InstanceStatus, RetryConfig, RetryStrategy};

/// What a workflow wants after an iteration finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// The instance is complete.
    Done,
    /// Run the next iteration at `when`.
    Loop {
        /// When to re-enter the workflow.
        when: DateTime<Utc>,
    },
}

impl Control {
    /// Loop again after `delay` from now.
    pub fn loop_after(delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Control::Loop {
            when: Utc::now() + delay,
        }
    }
}

/// A durable workflow definition.
///
/// `run` executes one iteration. It may be re-entered for the same iteration
/// after a crash or a retryable failure, so every side effect must go through
/// the [`WorkflowContext`] primitives.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Kind stored on instance rows; unique per runtime.
    fn kind(&self) -> &'static str;

    /// Execute one iteration.
    async fn run(&self, ctx: WorkflowContext, input: serde_json::Value) -> Result<Control>;

    /// Whether an iteration that failed with a non-retryable error is retried
    /// like a transient failure instead of failing the instance.
    ///
    /// Long-running loops return true so that one bad iteration only delays
    /// the next one. The iteration retry budget still applies.
    fn retries_fatal(&self) -> bool {
        false
    }
}

/// Retry and polling policies applied to every instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Policy for `retry_idempotent` steps.
    pub step_retry: RetryConfig,
    /// Policy for re-running an iteration that failed with a retryable error.
    pub iteration_retry: RetryConfig,
    /// Polling policy for `wait_until`.
    pub wait: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            step_retry: RetryConfig::default(),
            iteration_retry: RetryConfig::new(None, 1000, RetryStrategy::ExponentialBackoff),
            wait: RetryConfig::fixed(500),
        }
    }
}

/// Builder for creating a [`WorkflowRuntime`].
#[derive(Default)]
pub struct WorkflowRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    workflows: HashMap<&'static str, Arc<dyn Workflow>>,
    config: RuntimeConfig,
}

impl std::fmt::Debug for WorkflowRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

impl WorkflowRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Register a workflow under its kind.
    pub fn workflow(mut self, workflow: impl Workflow) -> Self {
        self.workflows.insert(workflow.kind(), Arc::new(workflow));
        self
    }

    /// Register an already shared workflow.
    pub fn shared_workflow(mut self, workflow: Arc<dyn Workflow>) -> Self {
        self.workflows.insert(workflow.kind(), workflow);
        self
    }

    /// Override retry and polling policies.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<WorkflowRuntime> {
        let persistence = self
            .persistence
            .ok_or_else(|| SdkError::Config("persistence is required".to_string()))?;

        Ok(WorkflowRuntime {
            inner: Arc::new(RuntimeInner {
                persistence,
                workflows: self.workflows,
                config: self.config,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                running: Mutex::new(HashSet::new()),
            }),
        })
    }
}

/// Handle to the runtime. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    persistence: Arc<dyn Persistence>,
    workflows: HashMap<&'static str, Arc<dyn Workflow>>,
    config: RuntimeConfig,
    cancel: CancellationToken,
    tracker: TaskTracker,
    running: Mutex<HashSet<String>>,
}

impl WorkflowRuntime {
    /// Create a new runtime builder.
    pub fn builder() -> WorkflowRuntimeBuilder {
        WorkflowRuntimeBuilder::new()
    }

    /// The persistence layer shared by all instances.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.inner.persistence
    }

    /// Create an instance of `kind` unless `instance_id` exists, and make
    /// sure it is running if it has not finished.
    ///
    /// Returns true if a new instance was created. Scheduling the same
    /// instance ID again never starts a second execution.
    pub async fn schedule<I: Serialize>(
        &self,
        kind: &str,
        instance_id: &str,
        input: &I,
    ) -> Result<bool> {
        if !self.inner.workflows.contains_key(kind) {
            return Err(SdkError::UnknownWorkflow(kind.to_string()));
        }

        let input = serde_json::to_vec(input)?;
        let created = self
            .inner
            .persistence
            .create_instance(instance_id, kind, &input)
            .await?;

        if created {
            info!(instance_id = %instance_id, kind = %kind, "Instance created");
        } else {
            debug!(instance_id = %instance_id, "Instance already exists");
        }

        let record = self.get_instance(instance_id).await?;
        if !is_terminal(&record.status) {
            self.launch(instance_id).await;
        }

        Ok(created)
    }

    /// Relaunch every instance that has not reached a terminal status.
    ///
    /// Call once on startup. Returns the number of instances launched.
    pub async fn resume_unfinished(&self) -> Result<usize> {
        let instances = self.inner.persistence.list_unfinished_instances().await?;
        let mut launched = 0;

        for instance in instances {
            if !self.inner.workflows.contains_key(instance.kind.as_str()) {
                warn!(
                    instance_id = %instance.instance_id,
                    kind = %instance.kind,
                    "No workflow registered for unfinished instance, skipping"
                );
                continue;
            }
            if self.launch(&instance.instance_id).await {
                launched += 1;
            }
        }

        info!(launched, "Resumed unfinished instances");
        Ok(launched)
    }

    /// Load an instance row.
    pub async fn get_instance(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.inner
            .persistence
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| {
                SdkError::Persistence(CoreError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })
            })
    }

    /// Poll until an instance is completed or failed.
    pub async fn wait_for_instance(
        &self,
        instance_id: &str,
        poll_interval: Duration,
    ) -> Result<InstanceRecord> {
        loop {
            let record = self.get_instance(instance_id).await?;
            if is_terminal(&record.status) {
                return Ok(record);
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = self.inner.cancel.cancelled() => return Err(SdkError::Cancelled),
            }
        }
    }

    /// Stop all instance tasks and wait for them to exit.
    ///
    /// Instances keep their status, so [`resume_unfinished`](Self::resume_unfinished)
    /// continues them in the next process.
    pub async fn shutdown(&self) {
        info!("Workflow runtime shutting down");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Workflow runtime stopped");
    }

    async fn launch(&self, instance_id: &str) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }

        {
            let mut running = self.inner.running.lock().await;
            if !running.insert(instance_id.to_string()) {
                debug!(instance_id = %instance_id, "Instance already running");
                return false;
            }
        }

        let inner = self.inner.clone();
        let instance_id = instance_id.to_string();
        let span = info_span!("instance", instance_id = %instance_id);

        self.inner.tracker.spawn(
            async move {
                if let Err(e) = inner.execute(&instance_id).await {
                    error!(error = %e, "Instance execution aborted");
                }
                inner.running.lock().await.remove(&instance_id);
            }
            .instrument(span),
        );

        true
    }
}

impl RuntimeInner {
    async fn execute(&self, instance_id: &str) -> Result<()> {
        let mut record = self.persistence.get_instance(instance_id).await?.ok_or_else(|| {
            SdkError::Persistence(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
        })?;

        let workflow = self
            .workflows
            .get(record.kind.as_str())
            .cloned()
            .ok_or_else(|| SdkError::UnknownWorkflow(record.kind.clone()))?;

        let input: serde_json::Value = serde_json::from_slice(&record.input)?;

        loop {
            if is_terminal(&record.status) || self.cancel.is_cancelled() {
                return Ok(());
            }

            if let Some(sleep_until) = record.sleep_until {
                let remaining = (sleep_until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                if !remaining.is_zero() {
                    debug!(
                        remaining_ms = remaining.as_millis() as u64,
                        iteration = record.iteration,
                        "Sleeping until next iteration"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = self.cancel.cancelled() => return Ok(()),
                    }
                }
                self.persistence.clear_instance_sleep(instance_id).await?;
            }

            self.persistence
                .update_instance_status(
                    instance_id,
                    InstanceStatus::Running.as_str(),
                    Some(Utc::now()),
                )
                .await?;

            let ctx = WorkflowContext::new(self.persistence.clone(), instance_id)
                .with_iteration(record.iteration)
                .with_retry_config(self.config.step_retry.clone())
                .with_wait_config(self.config.wait.clone())
                .with_cancellation(self.cancel.clone());

            match workflow.run(ctx, input.clone()).await {
                Ok(Control::Done) => {
                    self.persistence.complete_instance(instance_id, None).await?;
                    info!(iteration = record.iteration, "Instance completed");
                    return Ok(());
                }
                Ok(Control::Loop { when }) => {
                    let next = record.iteration + 1;
                    self.persistence
                        .advance_instance_iteration(instance_id, next, when)
                        .await?;
                    info!(next_iteration = next, next_run_at = %when, "Iteration finished");
                }
                Err(SdkError::Cancelled) => {
                    debug!("Instance interrupted by shutdown");
                    return Ok(());
                }
                Err(e) if e.is_retryable() || workflow.retries_fatal() => {
                    let attempt = record.attempt + 1;
                    let message = e.to_string();
                    self.persistence
                        .save_retry_attempt(
                            instance_id,
                            &format!("{}/iteration", record.iteration),
                            attempt,
                            Some(&message),
                        )
                        .await?;
                    self.persistence
                        .record_instance_failure(instance_id, attempt, &message)
                        .await?;

                    let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
                    if !self.config.iteration_retry.allows_attempt(attempt) {
                        error!(attempt, error = %message, "Iteration retries exhausted");
                        self.persistence
                            .complete_instance(instance_id, Some(&message))
                            .await?;
                        return Ok(());
                    }

                    let delay = self.config.iteration_retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        iteration = record.iteration,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Iteration failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Ok(()),
                    }
                }
                Err(e) => {
                    error!(iteration = record.iteration, error = %e, "Instance failed");
                    self.persistence
                        .complete_instance(instance_id, Some(&e.to_string()))
                        .await?;
                    return Ok(());
                }
            }

            record = self.persistence.get_instance(instance_id).await?.ok_or_else(|| {
                SdkError::Persistence(CoreError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })
            })?;
        }
    }
}

fn is_terminal(status: &str) -> bool {
    InstanceStatus::from_str(status).is_ok_and(|s| s.is_terminal())
}
