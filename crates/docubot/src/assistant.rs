// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Assistants: durable record, resource provisioning, and the crawl loop.
//!
//! Creating an assistant stores an [`AssistantRecord`] and schedules two
//! instances:
//!
//! - `assistant:<id>:provision` ([`ProvisionWorkflow`]) finds or creates the
//!   vector store and the remote assistant, then records their IDs.
//! - `assistant:<id>:crawl` ([`CrawlLoopWorkflow`]) re-crawls the site every
//!   interval and keeps the vector store's files in sync with the latest
//!   complete crawl.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docubot_sdk::docubot_core::persistence::Persistence;
use docubot_sdk::{
    Control, RetryConfig, SdkError, StateRef, StepError, Workflow, WorkflowContext,
    WorkflowRuntime,
};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, error, info, info_span, warn};

use crate::crawler::Crawler;
use crate::manifest::{FileKey, FileManifest, SENTINEL_INDEX};
use crate::provider::{AssistantProvider, AssistantSpec, FileIndexStatus};

/// State type of assistant records.
pub const ASSISTANT_STATE: &str = "assistant";

/// Workflow kind of the provisioning task.
pub const PROVISION_WORKFLOW: &str = "assistant.provision";

/// Workflow kind of the crawl loop.
pub const CRAWL_WORKFLOW: &str = "assistant.crawl";

/// Default delay between crawl iterations.
pub const DEFAULT_CRAWL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default model for new assistants.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

const INSTRUCTIONS: &str = "You are a Q/A chatbot, answering questions based on the \
    uploaded files to provide the best response to the user. \
    Do not provide an answer to the question if the \
    information was not retrieved from the knowledge base.";

/// One knowledge base.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantRecord {
    pub name: String,
    pub site_url: String,
    /// Empty until provisioned.
    pub external_vector_store_id: String,
    /// Empty until provisioned.
    pub external_assistant_id: String,
}

/// Name of the vector store that backs an assistant.
pub fn vector_store_name(assistant_name: &str) -> String {
    format!("Vector Store for '{assistant_name}'")
}

pub(crate) fn assistant_state(
    persistence: Arc<dyn Persistence>,
    assistant_id: &str,
) -> StateRef<AssistantRecord> {
    StateRef::new(persistence, ASSISTANT_STATE, assistant_id)
}

/// The remote assistant ID, or an empty string while provisioning is pending.
pub(crate) async fn assistant_status(
    persistence: Arc<dyn Persistence>,
    assistant_id: &str,
) -> docubot_sdk::Result<String> {
    Ok(assistant_state(persistence, assistant_id)
        .try_read()
        .await?
        .map(|record| record.external_assistant_id)
        .unwrap_or_default())
}

#[derive(Debug, Serialize, Deserialize)]
struct ProvisionInput {
    assistant_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CrawlInput {
    assistant_id: String,
    site_url: String,
}

/// Handle for one assistant.
#[derive(Clone)]
pub struct AssistantRef {
    runtime: WorkflowRuntime,
    id: String,
}

impl AssistantRef {
    pub fn new(runtime: WorkflowRuntime, id: impl Into<String>) -> Self {
        Self {
            runtime,
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> StateRef<AssistantRecord> {
        assistant_state(self.runtime.persistence().clone(), &self.id)
    }

    /// Create the assistant and start provisioning and crawling.
    ///
    /// Idempotent: for an existing assistant the stored name and site are
    /// kept, and its instances are only (re)launched if they are not already
    /// running. Returns true if the record was created by this call.
    pub async fn create(&self, name: &str, site_url: &str) -> docubot_sdk::Result<bool> {
        let state = self.state();
        let created = state
            .create(&AssistantRecord {
                name: name.to_string(),
                site_url: site_url.to_string(),
                ..Default::default()
            })
            .await?;
        let record = state.read().await?;

        if created {
            info!(assistant_id = %self.id, name = %record.name, "Assistant created");
        }

        self.runtime
            .schedule(
                PROVISION_WORKFLOW,
                &format!("assistant:{}:provision", self.id),
                &ProvisionInput {
                    assistant_id: self.id.clone(),
                },
            )
            .await?;

        self.runtime
            .schedule(
                CRAWL_WORKFLOW,
                &format!("assistant:{}:crawl", self.id),
                &CrawlInput {
                    assistant_id: self.id.clone(),
                    site_url: record.site_url,
                },
            )
            .await?;

        Ok(created)
    }

    /// The remote assistant ID; empty until provisioning finished.
    pub async fn status(&self) -> docubot_sdk::Result<String> {
        assistant_status(self.runtime.persistence().clone(), &self.id).await
    }

    pub async fn record(&self) -> docubot_sdk::Result<AssistantRecord> {
        self.state().read().await
    }
}

/// Finds or creates the vector store and remote assistant.
pub struct ProvisionWorkflow {
    provider: Arc<dyn AssistantProvider>,
    model: String,
}

impl ProvisionWorkflow {
    pub fn new(provider: Arc<dyn AssistantProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

async fn ensure_vector_store(
    provider: &dyn AssistantProvider,
    name: &str,
) -> Result<String, StepError> {
    let stores = provider.list_vector_stores().await?;
    if let Some(store) = stores.into_iter().find(|s| s.name.as_deref() == Some(name)) {
        return Ok(store.id);
    }
    Ok(provider.create_vector_store(name).await?.id)
}

async fn ensure_assistant(
    provider: &dyn AssistantProvider,
    name: &str,
    model: &str,
    vector_store_id: &str,
) -> Result<String, StepError> {
    let assistants = provider.list_assistants().await?;
    if let Some(existing) = assistants
        .into_iter()
        .find(|a| a.name.as_deref() == Some(name))
    {
        return Ok(existing.id);
    }

    let models = provider.list_models().await?;
    if !models.iter().any(|m| m == model) {
        return Err(StepError::fatal(format!(
            "model '{model}' is not available (found {})",
            models.join(", ")
        )));
    }

    let spec = AssistantSpec {
        name: name.to_string(),
        instructions: INSTRUCTIONS.to_string(),
        model: model.to_string(),
        vector_store_id: vector_store_id.to_string(),
    };
    Ok(provider.create_assistant(&spec).await?.id)
}

#[async_trait]
impl Workflow for ProvisionWorkflow {
    fn kind(&self) -> &'static str {
        PROVISION_WORKFLOW
    }

    async fn run(&self, ctx: WorkflowContext, input: serde_json::Value) -> docubot_sdk::Result<Control> {
        let input: ProvisionInput = serde_json::from_value(input)?;
        let state = assistant_state(ctx.persistence().clone(), &input.assistant_id);
        let record = state.read().await?;

        let provider = self.provider.as_ref();
        let store_name = vector_store_name(&record.name);
        let store_name = store_name.as_str();

        let found_store: String = ctx
            .retry_idempotent("ensure-vector-store", move || {
                ensure_vector_store(provider, store_name)
            })
            .await?;

        let vector_store_id = state
            .write_once(&ctx, "save-vector-store-id", |a| {
                if a.external_vector_store_id.is_empty() {
                    a.external_vector_store_id = found_store.clone();
                }
                a.external_vector_store_id.clone()
            })
            .await?;

        let name = record.name.as_str();
        let model = self.model.as_str();
        let store = vector_store_id.as_str();
        let found_assistant: String = ctx
            .retry_idempotent("ensure-assistant", move || {
                ensure_assistant(provider, name, model, store)
            })
            .await?;

        let assistant_id = state
            .write_once(&ctx, "save-assistant-id", |a| {
                if a.external_assistant_id.is_empty() {
                    a.external_assistant_id = found_assistant.clone();
                }
                a.external_assistant_id.clone()
            })
            .await?;

        info!(
            assistant_id = %input.assistant_id,
            external_assistant_id = %assistant_id,
            vector_store_id = %vector_store_id,
            "Assistant resources ready"
        );
        Ok(Control::Done)
    }
}

/// Periodically re-crawls a site into the assistant's vector store.
pub struct CrawlLoopWorkflow {
    provider: Arc<dyn AssistantProvider>,
    crawler: Arc<dyn Crawler>,
    manifest: FileManifest,
    interval: Duration,
    cleanup_retry: RetryConfig,
}

impl CrawlLoopWorkflow {
    pub fn new(provider: Arc<dyn AssistantProvider>, crawler: Arc<dyn Crawler>) -> Self {
        Self {
            manifest: FileManifest::new(provider.clone()),
            provider,
            crawler,
            interval: DEFAULT_CRAWL_INTERVAL,
            cleanup_retry: RetryConfig::default(),
        }
    }

    /// Delay between the end of one iteration and the start of the next.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Retry policy for the background removal of stale files.
    pub fn with_cleanup_retry(mut self, retry: RetryConfig) -> Self {
        self.cleanup_retry = retry;
        self
    }

    /// IDs of this iteration's files, crawling and uploading only if the
    /// iteration's sentinel is missing.
    async fn crawl_and_upload(
        &self,
        vector_store_id: &str,
        site_url: &str,
        iteration: u64,
    ) -> Result<Vec<String>, StepError> {
        let existing = self
            .manifest
            .list_for_iteration(vector_store_id, iteration)
            .await?;
        if existing.iter().any(|e| e.key.is_sentinel()) {
            info!(iteration, files = existing.len(), "Crawl already completed");
            return Ok(existing.into_iter().map(|e| e.file_id).collect());
        }
        if !existing.is_empty() {
            // Left over from an interrupted upload; removed by a later cleanup.
            warn!(iteration, files = existing.len(), "Ignoring partial upload");
        }

        info!(iteration, site_url, "Crawling");
        let output = self.crawler.crawl(site_url).await?;
        let Some((sentinel, rest)) = output.paths.split_first() else {
            return Err(StepError::retryable(format!(
                "crawl of {site_url} produced no documents"
            )));
        };

        let uploads = rest.iter().enumerate().map(|(i, path)| {
            self.upload(vector_store_id, iteration, i as u64 + 1, path)
        });
        let mut file_ids = try_join_all(uploads).await?;

        // Uploaded last: its presence means every other file made it.
        file_ids.push(
            self.upload(vector_store_id, iteration, SENTINEL_INDEX, sentinel)
                .await?,
        );

        info!(iteration, files = file_ids.len(), "Uploaded crawl");
        Ok(file_ids)
    }

    async fn upload(
        &self,
        vector_store_id: &str,
        iteration: u64,
        file_index: u64,
        path: &Path,
    ) -> Result<String, StepError> {
        let contents = tokio::fs::read(path).await.map_err(StepError::retryable)?;
        let name = FileKey::new(vector_store_id, iteration, file_index).encode();
        Ok(self.provider.upload_file(&name, contents).await?.id)
    }

    /// Start removing files of iterations before `iteration` without waiting.
    fn spawn_cleanup(&self, vector_store_id: String, iteration: u64) {
        let manifest = self.manifest.clone();
        let retry = self.cleanup_retry.clone();
        let span = info_span!("stale_cleanup", vector_store_id = %vector_store_id, iteration);

        tokio::spawn(
            async move {
                let mut attempt: u32 = 0;
                loop {
                    match manifest.delete_older_than(&vector_store_id, iteration).await {
                        Ok(deleted) => {
                            info!(deleted, "Removed stale files");
                            return;
                        }
                        Err(e) => {
                            attempt += 1;
                            if !retry.allows_attempt(attempt) {
                                error!(attempt, error = %e, "Giving up on stale file removal");
                                return;
                            }
                            warn!(attempt, error = %e, "Stale file removal failed, retrying");
                            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                        }
                    }
                }
            }
            .instrument(span),
        );
    }
}

#[async_trait]
impl Workflow for CrawlLoopWorkflow {
    fn kind(&self) -> &'static str {
        CRAWL_WORKFLOW
    }

    // A bad crawl or upload must not end the loop for good.
    fn retries_fatal(&self) -> bool {
        true
    }

    async fn run(&self, ctx: WorkflowContext, input: serde_json::Value) -> docubot_sdk::Result<Control> {
        let input: CrawlInput = serde_json::from_value(input)?;
        let iteration = u64::try_from(ctx.iteration())
            .map_err(|_| SdkError::Internal(format!("negative iteration {}", ctx.iteration())))?;

        let state = assistant_state(ctx.persistence().clone(), &input.assistant_id);
        let state = &state;
        let vector_store_id: String = ctx
            .wait_until("vector-store-created", move || async move {
                let record = state.read().await?;
                let id = record.external_vector_store_id;
                Ok::<_, StepError>((!id.is_empty()).then_some(id))
            })
            .await?;
        let vs = vector_store_id.as_str();

        info!(iteration, vector_store_id = %vs, "Crawl loop iteration");

        if iteration == 0 {
            let manifest = &self.manifest;
            let removed: usize = ctx
                .retry_idempotent("remove-all-files", move || async move {
                    Ok::<_, StepError>(manifest.delete_all(vs).await?)
                })
                .await?;
            info!(removed, "First iteration, removed previous files");
        }

        let site_url = input.site_url.as_str();
        let file_ids: Vec<String> = ctx
            .retry_idempotent("crawl-and-upload", move || {
                self.crawl_and_upload(vs, site_url, iteration)
            })
            .await?;

        // One at a time: concurrent attaches conflict with each other.
        let provider = self.provider.as_ref();
        for file_id in &file_ids {
            let file_id = file_id.as_str();
            ctx.retry_idempotent(&format!("attach-{file_id}"), move || async move {
                Ok::<_, StepError>(provider.attach_file(vs, file_id).await?)
            })
            .await?;
        }

        let ctx = &ctx;
        let indexed = try_join_all(file_ids.iter().map(|file_id| async move {
            let file_id = file_id.as_str();
            let completed: bool = ctx
                .wait_until(&format!("ready-{file_id}"), move || async move {
                    let ready = match provider.file_index_status(vs, file_id).await? {
                        FileIndexStatus::InProgress => None,
                        FileIndexStatus::Completed => Some(true),
                        other => {
                            warn!(file_id, status = ?other, "File was not indexed");
                            Some(false)
                        }
                    };
                    Ok::<_, StepError>(ready)
                })
                .await?;
            Ok::<_, SdkError>(completed)
        }))
        .await?;

        let ready = indexed.iter().filter(|&&ok| ok).count();
        if ready == 0 {
            // Keep the previous iteration's files searchable.
            error!(iteration, files = indexed.len(), "No file of this crawl was indexed");
        } else {
            self.spawn_cleanup(vector_store_id.clone(), iteration);
        }

        info!(
            iteration,
            next_in_secs = self.interval.as_secs(),
            "Crawl loop iteration complete"
        );
        Ok(Control::loop_after(self.interval))
    }
}
