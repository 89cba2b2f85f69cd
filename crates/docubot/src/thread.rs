// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conversation threads and the turn scheduler.
//!
//! A thread's queries run one at a time, in submission order. Each query is
//! its own instance (`thread:<id>:query:<index>`) that waits until the
//! thread's `active_index` reaches it, streams the run into the record, and
//! finally advances `active_index` exactly once, whatever happened to the run.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use docubot_sdk::docubot_core::persistence::Persistence;
use docubot_sdk::{
    Control, SdkError, StateRef, StepError, Workflow, WorkflowContext, WorkflowRuntime,
};
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::assistant::assistant_status;
use crate::provider::{AssistantProvider, RunEvent};

/// State type of thread records.
pub const THREAD_STATE: &str = "thread";

/// Workflow kind of the thread creation task.
pub const CREATE_THREAD_WORKFLOW: &str = "thread.create";

/// Workflow kind of one conversation turn.
pub const QUERY_WORKFLOW: &str = "thread.query";

/// Appended to a response whose run did not complete.
pub const ERROR_SUFFIX: &str = "...encountered an error!";

/// Metadata key carrying the thread's record ID on remote objects.
pub const THREAD_METADATA_KEY: &str = "docubotThreadStateId";

static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"【[^】]*】").expect("valid regex"));

/// One question and its (possibly partial) answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub content: String,
    pub response: String,
    pub started: bool,
    pub completed: bool,
}

impl QueryRecord {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// One conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub assistant_id: String,
    /// Set once by the creation task.
    pub external_assistant_id: String,
    /// Set once by the creation task.
    pub external_thread_id: String,
    pub queries: Vec<QueryRecord>,
    /// Index of the query allowed to run.
    pub active_index: usize,
}

/// Remove file citation markers such as `【4:0†source】`.
pub fn strip_citations(text: &str) -> String {
    CITATION.replace_all(text, "").into_owned()
}

fn thread_state(persistence: Arc<dyn Persistence>, thread_id: &str) -> StateRef<ThreadRecord> {
    StateRef::new(persistence, THREAD_STATE, thread_id)
}

/// Claim the turn for `index` if it is active, returning the query content.
fn claim_turn(thread: &mut ThreadRecord, index: usize) -> Result<Option<String>, StepError> {
    if index >= thread.queries.len() {
        return Err(StepError::fatal(format!(
            "query {index} does not exist ({} queries)",
            thread.queries.len()
        )));
    }
    if thread.active_index != index {
        return Ok(None);
    }
    let query = &mut thread.queries[index];
    query.started = true;
    Ok(Some(query.content.clone()))
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateInput {
    thread_id: String,
    assistant_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueryInput {
    thread_id: String,
    index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteIds {
    assistant_id: String,
    thread_id: String,
}

/// Handle for one thread.
#[derive(Clone)]
pub struct ThreadRef {
    runtime: WorkflowRuntime,
    id: String,
}

impl ThreadRef {
    pub fn new(runtime: WorkflowRuntime, id: impl Into<String>) -> Self {
        Self {
            runtime,
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> StateRef<ThreadRecord> {
        thread_state(self.runtime.persistence().clone(), &self.id)
    }

    /// Create the thread record and schedule creation of the remote thread.
    ///
    /// Returns true if the record was created by this call.
    pub async fn create(&self, assistant_id: &str) -> docubot_sdk::Result<bool> {
        let state = self.state();
        let created = state
            .create(&ThreadRecord {
                assistant_id: assistant_id.to_string(),
                ..Default::default()
            })
            .await?;
        let record = state.read().await?;

        self.runtime
            .schedule(
                CREATE_THREAD_WORKFLOW,
                &format!("thread:{}:create", self.id),
                &CreateInput {
                    thread_id: self.id.clone(),
                    assistant_id: record.assistant_id,
                },
            )
            .await?;

        Ok(created)
    }

    /// Append a query and schedule its turn. Returns the query index.
    ///
    /// Turns of earlier queries that have not run yet are scheduled again,
    /// which is a no-op unless a previous call died before scheduling them.
    #[instrument(skip(self, content), fields(thread_id = %self.id))]
    pub async fn query(&self, content: &str) -> docubot_sdk::Result<usize> {
        let (index, active_index) = self
            .state()
            .write(|thread| {
                thread.queries.push(QueryRecord::new(content));
                (thread.queries.len() - 1, thread.active_index)
            })
            .await?;

        for pending in active_index..=index {
            self.runtime
                .schedule(
                    QUERY_WORKFLOW,
                    &format!("thread:{}:query:{}", self.id, pending),
                    &QueryInput {
                        thread_id: self.id.clone(),
                        index: pending,
                    },
                )
                .await?;
        }

        debug!(index, "Query submitted");
        Ok(index)
    }

    /// Every query with its response so far.
    pub async fn messages(&self) -> docubot_sdk::Result<Vec<QueryRecord>> {
        Ok(self.state().read().await?.queries)
    }

    pub async fn record(&self) -> docubot_sdk::Result<ThreadRecord> {
        self.state().read().await
    }
}

/// Creates the remote thread once the assistant is provisioned.
pub struct CreateThreadWorkflow {
    provider: Arc<dyn AssistantProvider>,
}

impl CreateThreadWorkflow {
    pub fn new(provider: Arc<dyn AssistantProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Workflow for CreateThreadWorkflow {
    fn kind(&self) -> &'static str {
        CREATE_THREAD_WORKFLOW
    }

    async fn run(&self, ctx: WorkflowContext, input: serde_json::Value) -> docubot_sdk::Result<Control> {
        let input: CreateInput = serde_json::from_value(input)?;
        let persistence = ctx.persistence().clone();
        let assistant_id = input.assistant_id.as_str();

        let external_assistant_id: String = ctx
            .wait_until("assistant-ready", || {
                let persistence = persistence.clone();
                async move {
                    let id = assistant_status(persistence, assistant_id).await?;
                    Ok::<_, StepError>((!id.is_empty()).then_some(id))
                }
            })
            .await?;

        let state = thread_state(persistence, &input.thread_id);
        let record = state.read().await?;

        // Threads cannot be listed remotely, so the stored ID is the only
        // record that one exists.
        if record.external_thread_id.is_empty() {
            let provider = self.provider.as_ref();
            let metadata = HashMap::from([(THREAD_METADATA_KEY.to_string(), input.thread_id.clone())]);
            let metadata = &metadata;

            let external_thread_id: String = ctx
                .retry_idempotent("create-remote-thread", move || async move {
                    Ok::<_, StepError>(provider.create_thread(metadata).await?)
                })
                .await?;

            state
                .write_once(&ctx, "save-ids", |thread| {
                    thread.external_assistant_id = external_assistant_id.clone();
                    thread.external_thread_id = external_thread_id.clone();
                })
                .await?;

            info!(
                thread_id = %input.thread_id,
                external_thread_id = %external_thread_id,
                "Thread created"
            );
        }

        Ok(Control::Done)
    }
}

/// Runs one query of a thread when its turn comes.
pub struct QueryWorkflow {
    provider: Arc<dyn AssistantProvider>,
}

impl QueryWorkflow {
    pub fn new(provider: Arc<dyn AssistantProvider>) -> Self {
        Self { provider }
    }

    /// Post the query, stream the run, and record the response.
    async fn run_query(
        &self,
        ctx: &WorkflowContext,
        state: &StateRef<ThreadRecord>,
        remote: &RemoteIds,
        index: usize,
        content: &str,
    ) -> Result<(), StepError> {
        self.provider
            .create_message(&remote.thread_id, content)
            .await?;

        let metadata = HashMap::from([
            (THREAD_METADATA_KEY.to_string(), state.id().to_string()),
            ("queryIndex".to_string(), index.to_string()),
        ]);
        let mut stream = self
            .provider
            .stream_run(&remote.thread_id, &remote.assistant_id, &metadata)
            .await?;

        let mut delta = 0usize;
        while let Some(event) = stream.next().await {
            match event? {
                RunEvent::MessageDelta(text) => {
                    let text = strip_citations(&text);
                    if text.is_empty() {
                        continue;
                    }
                    state
                        .write_once(ctx, &format!("append-delta-{delta}"), |thread| {
                            if let Some(query) = thread.queries.get_mut(index) {
                                query.response.push_str(&text);
                            }
                        })
                        .await?;
                    delta += 1;
                }
                RunEvent::MessageCompleted => {
                    state
                        .write_once(ctx, "complete", |thread| {
                            if let Some(query) = thread.queries.get_mut(index) {
                                query.completed = true;
                            }
                        })
                        .await?;
                    break;
                }
                RunEvent::Error { code, message } | RunEvent::RunFailed { code, message } => {
                    return Err(StepError::fatal(format!(
                        "Error streaming (code {}): {}",
                        code.as_deref().unwrap_or("none"),
                        message
                    )));
                }
                RunEvent::Done => break,
                RunEvent::Unknown(name) => debug!(event = %name, "Ignoring run event"),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Workflow for QueryWorkflow {
    fn kind(&self) -> &'static str {
        QUERY_WORKFLOW
    }

    async fn run(&self, ctx: WorkflowContext, input: serde_json::Value) -> docubot_sdk::Result<Control> {
        let input: QueryInput = serde_json::from_value(input)?;
        let index = input.index;
        let state = thread_state(ctx.persistence().clone(), &input.thread_id);
        let state_ref = &state;

        let remote: RemoteIds = ctx
            .wait_until("resources-ready", move || async move {
                let thread = state_ref.read().await?;
                let ready = !thread.external_assistant_id.is_empty()
                    && !thread.external_thread_id.is_empty();
                Ok::<_, StepError>(ready.then_some(RemoteIds {
                    assistant_id: thread.external_assistant_id,
                    thread_id: thread.external_thread_id,
                }))
            })
            .await?;

        // The provider allows one run per thread at a time.
        let content: String = ctx
            .wait_until("our-turn", move || async move {
                state_ref.write(|thread| claim_turn(thread, index)).await?
            })
            .await?;

        info!(thread_id = %input.thread_id, index, "Running query");

        let outcome = ctx
            .retry_at_most_once("run", || {
                self.run_query(&ctx, &state, &remote, index, &content)
            })
            .await;

        // Whatever happened to the run, the turn must be released.
        match outcome {
            Ok(()) => {}
            Err(SdkError::Cancelled) => return Err(SdkError::Cancelled),
            Err(e) => {
                warn!(thread_id = %input.thread_id, index, error = %e, "Query run did not complete");
            }
        }

        let completed_normally = state
            .write_once(&ctx, "finish", |thread| {
                let completed = match thread.queries.get_mut(index) {
                    Some(query) if !query.completed => {
                        query.response.push_str(ERROR_SUFFIX);
                        query.completed = true;
                        false
                    }
                    _ => true,
                };
                thread.active_index += 1;
                completed
            })
            .await?;

        info!(
            thread_id = %input.thread_id,
            index,
            completed_normally,
            "Query finished"
        );
        Ok(Control::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread_with(queries: &[&str], active_index: usize) -> ThreadRecord {
        ThreadRecord {
            queries: queries.iter().map(|q| QueryRecord::new(*q)).collect(),
            active_index,
            ..Default::default()
        }
    }

    #[test]
    fn test_strip_citations() {
        assert_eq!(
            strip_citations("See the guide【4:0†source】 for details【4:1†guide.pdf】."),
            "See the guide for details."
        );
        assert_eq!(strip_citations("【0†source】"), "");
        assert_eq!(strip_citations("no markers"), "no markers");
    }

    #[test]
    fn test_claim_turn() {
        let mut thread = thread_with(&["first", "second"], 0);

        assert_eq!(claim_turn(&mut thread, 1).unwrap(), None);
        assert!(!thread.queries[1].started);

        assert_eq!(claim_turn(&mut thread, 0).unwrap(), Some("first".to_string()));
        assert!(thread.queries[0].started);

        thread.active_index = 1;
        assert_eq!(claim_turn(&mut thread, 1).unwrap(), Some("second".to_string()));
    }

    #[test]
    fn test_claim_missing_query_is_fatal() {
        let mut thread = thread_with(&["only"], 0);
        let err = claim_turn(&mut thread, 3).unwrap_err();
        assert!(!err.is_retryable());
    }
}
