// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fakes and helpers for docubot integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docubot::crawler::{CrawlError, CrawlOutput, Crawler};
use docubot::document::render_pdf;
use docubot::provider::{
    AssistantProvider, AssistantSpec, FileIndexStatus, ProviderError, RemoteAssistant, RemoteFile,
    RunEvent, RunEventStream, VectorStore,
};
use docubot::{ThreadRecord, register_workflows};
use docubot_core::persistence::{Persistence, SqlitePersistence};
use docubot_sdk::{RetryConfig, RetryStrategy, RuntimeConfig, WorkflowRuntime};

pub const POLL: Duration = Duration::from_millis(5);
pub const VECTOR_STORE_ID: &str = "vs_docs";

/// Everything the fake provider has been asked to do, plus its remote state.
#[derive(Default)]
pub struct FakeState {
    pub files: Vec<RemoteFile>,
    pub vector_stores: Vec<VectorStore>,
    pub attached: HashSet<(String, String)>,
    pub assistants: Vec<RemoteAssistant>,
    pub created_assistants: Vec<AssistantSpec>,
    pub models: Vec<String>,
    pub threads: Vec<(String, HashMap<String, String>)>,
    pub messages: Vec<(String, String)>,
    /// Operation log, e.g. `upload:crawl:vs_docs:0:1.pdf`.
    pub calls: Vec<String>,
    /// Thread record as seen when each run started.
    pub run_snapshots: Vec<(usize, ThreadRecord)>,
    /// Scripted event sequences, one per run; the default script answers.
    pub run_scripts: VecDeque<Vec<RunEvent>>,
    /// Errors returned by the next calls of an operation.
    pub failures: HashMap<&'static str, VecDeque<ProviderError>>,
    /// Status polls that report `in_progress` before a file is indexed.
    pub index_polls: u32,
    /// Files end up `failed` instead of `completed`.
    pub fail_indexing: bool,
    polls: HashMap<String, u32>,
    next_id: u64,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{}", self.next_id)
    }

    /// Files named `name` are added as if uploaded by an earlier process.
    pub fn seed_file(&mut self, name: &str) -> String {
        let id = self.next_id("file");
        self.files.push(RemoteFile {
            id: id.clone(),
            filename: name.to_string(),
        });
        id
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.files.iter().map(|f| f.filename.clone()).collect();
        names.sort();
        names
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// In-memory [`AssistantProvider`].
#[derive(Default)]
pub struct FakeProvider {
    pub state: Mutex<FakeState>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        let provider = Self::default();
        provider.with_state(|s| {
            s.models = vec!["gpt-3.5-turbo".to_string(), "gpt-4o".to_string()];
        });
        provider
    }

    /// Snapshot thread records from `persistence` when runs start.
    pub fn observing(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::new()
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn call(&self, op: &'static str, detail: &str) -> Result<(), ProviderError> {
        self.with_state(|s| {
            s.calls.push(format!("{op}:{detail}"));
            match s.failures.get_mut(op).and_then(VecDeque::pop_front) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}

#[async_trait]
impl AssistantProvider for FakeProvider {
    async fn list_files(&self) -> Result<Vec<RemoteFile>, ProviderError> {
        self.call("list_files", "")?;
        Ok(self.with_state(|s| s.files.clone()))
    }

    async fn upload_file(
        &self,
        filename: &str,
        contents: Vec<u8>,
    ) -> Result<RemoteFile, ProviderError> {
        self.call("upload", filename)?;
        assert!(!contents.is_empty(), "empty upload for {filename}");
        // Let concurrent uploads interleave.
        tokio::task::yield_now().await;
        Ok(self.with_state(|s| {
            let file = RemoteFile {
                id: s.next_id("file"),
                filename: filename.to_string(),
            };
            s.files.push(file.clone());
            file
        }))
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), ProviderError> {
        self.call("delete", file_id)?;
        self.with_state(|s| {
            let before = s.files.len();
            s.files.retain(|f| f.id != file_id);
            if s.files.len() == before {
                Err(ProviderError::NotFound(file_id.to_string()))
            } else {
                Ok(())
            }
        })
    }

    async fn list_vector_stores(&self) -> Result<Vec<VectorStore>, ProviderError> {
        self.call("list_vector_stores", "")?;
        Ok(self.with_state(|s| s.vector_stores.clone()))
    }

    async fn create_vector_store(&self, name: &str) -> Result<VectorStore, ProviderError> {
        self.call("create_vector_store", name)?;
        Ok(self.with_state(|s| {
            let store = VectorStore {
                id: s.next_id("vs"),
                name: Some(name.to_string()),
            };
            s.vector_stores.push(store.clone());
            store
        }))
    }

    async fn attach_file(
        &self,
        vector_store_id: &str,
        file_id: &str,
    ) -> Result<(), ProviderError> {
        self.call("attach", file_id)?;
        self.with_state(|s| {
            s.attached
                .insert((vector_store_id.to_string(), file_id.to_string()));
        });
        Ok(())
    }

    async fn detach_file(
        &self,
        vector_store_id: &str,
        file_id: &str,
    ) -> Result<(), ProviderError> {
        self.call("detach", file_id)?;
        self.with_state(|s| {
            if s
                .attached
                .remove(&(vector_store_id.to_string(), file_id.to_string()))
            {
                Ok(())
            } else {
                Err(ProviderError::NotFound(file_id.to_string()))
            }
        })
    }

    async fn file_index_status(
        &self,
        _vector_store_id: &str,
        file_id: &str,
    ) -> Result<FileIndexStatus, ProviderError> {
        self.call("status", file_id)?;
        Ok(self.with_state(|s| {
            let limit = s.index_polls;
            let fail = s.fail_indexing;
            let polls = s.polls.entry(file_id.to_string()).or_default();
            *polls += 1;
            if *polls <= limit {
                FileIndexStatus::InProgress
            } else if fail {
                FileIndexStatus::Failed
            } else {
                FileIndexStatus::Completed
            }
        }))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        self.call("list_models", "")?;
        Ok(self.with_state(|s| s.models.clone()))
    }

    async fn list_assistants(&self) -> Result<Vec<RemoteAssistant>, ProviderError> {
        self.call("list_assistants", "")?;
        Ok(self.with_state(|s| s.assistants.clone()))
    }

    async fn create_assistant(
        &self,
        spec: &AssistantSpec,
    ) -> Result<RemoteAssistant, ProviderError> {
        self.call("create_assistant", &spec.name)?;
        Ok(self.with_state(|s| {
            let assistant = RemoteAssistant {
                id: s.next_id("asst"),
                name: Some(spec.name.clone()),
            };
            s.assistants.push(assistant.clone());
            s.created_assistants.push(spec.clone());
            assistant
        }))
    }

    async fn create_thread(
        &self,
        metadata: &HashMap<String, String>,
    ) -> Result<String, ProviderError> {
        self.call("create_thread", "")?;
        Ok(self.with_state(|s| {
            let id = s.next_id("thread");
            s.threads.push((id.clone(), metadata.clone()));
            id
        }))
    }

    async fn create_message(&self, thread_id: &str, content: &str) -> Result<(), ProviderError> {
        self.call("message", content)?;
        self.with_state(|s| s.messages.push((thread_id.to_string(), content.to_string())));
        Ok(())
    }

    async fn stream_run(
        &self,
        thread_id: &str,
        _assistant_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<RunEventStream, ProviderError> {
        let index = metadata.get("queryIndex").cloned().unwrap_or_default();
        self.call("run", &index)?;

        if let (Some(persistence), Some(state_id)) =
            (&self.persistence, metadata.get("docubotThreadStateId"))
        {
            let record = persistence
                .load_state("thread", state_id)
                .await
                .unwrap()
                .expect("thread record exists while running");
            let thread: ThreadRecord = serde_json::from_str(&record.data).unwrap();
            let index: usize = index.parse().unwrap();
            self.with_state(|s| s.run_snapshots.push((index, thread)));
        }

        let events = self.with_state(|s| {
            s.run_scripts.pop_front().unwrap_or_else(|| {
                let question = s
                    .messages
                    .iter()
                    .rev()
                    .find(|(t, _)| t == thread_id)
                    .map(|(_, content)| content.clone())
                    .unwrap_or_default();
                default_script(&question)
            })
        });

        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }
}

/// Answers `question` in two deltas with a citation marker, then completes.
pub fn default_script(question: &str) -> Vec<RunEvent> {
    vec![
        RunEvent::Unknown("thread.run.created".to_string()),
        RunEvent::MessageDelta("Answer to: 【4:0†source】".to_string()),
        RunEvent::MessageDelta("【4:1†source】".to_string()),
        RunEvent::MessageDelta(question.to_string()),
        RunEvent::MessageCompleted,
        RunEvent::Done,
    ]
}

/// Writes one document per page into a temporary directory.
pub struct FakeCrawler {
    pub pages: Vec<String>,
    pub crawls: AtomicU32,
}

impl FakeCrawler {
    pub fn new(pages: &[&str]) -> Self {
        Self {
            pages: pages.iter().map(|p| p.to_string()).collect(),
            crawls: AtomicU32::new(0),
        }
    }

    pub fn crawls(&self) -> u32 {
        self.crawls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Crawler for FakeCrawler {
    async fn crawl(&self, site_url: &str) -> Result<CrawlOutput, CrawlError> {
        self.crawls.fetch_add(1, Ordering::SeqCst);
        if self.pages.is_empty() {
            return Err(CrawlError::Empty(site_url.to_string()));
        }

        let dir = tempfile::tempdir()?;
        let mut paths = Vec::new();
        for (i, page) in self.pages.iter().enumerate() {
            let path = dir.path().join(format!("{i}.pdf"));
            std::fs::write(&path, render_pdf(&format!("{site_url}/{i}"), page)?)?;
            paths.push(path);
        }
        Ok(CrawlOutput { dir, paths })
    }
}

pub async fn create_test_persistence() -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory SQLite persistence"),
    )
}

/// Millisecond-scale policies so tests do not wait on real backoff.
pub fn fast_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        step_retry: RetryConfig::new(Some(3), 1, RetryStrategy::ExponentialBackoff)
            .with_max_delay_ms(5),
        iteration_retry: RetryConfig::new(Some(5), 1, RetryStrategy::ExponentialBackoff)
            .with_max_delay_ms(5),
        wait: RetryConfig::fixed(2),
    }
}

pub fn build_runtime(
    persistence: Arc<dyn Persistence>,
    provider: Arc<FakeProvider>,
    crawler: Arc<FakeCrawler>,
) -> WorkflowRuntime {
    let builder = WorkflowRuntime::builder()
        .persistence(persistence)
        .config(fast_runtime_config());
    register_workflows(
        builder,
        provider,
        crawler,
        "gpt-3.5-turbo",
        Duration::from_secs(3600),
    )
    .build()
    .unwrap()
}

/// Store an already-provisioned assistant record without running provisioning.
pub async fn seed_assistant(persistence: &Arc<dyn Persistence>, id: &str, external_assistant_id: &str) {
    let record = docubot::AssistantRecord {
        name: id.to_string(),
        site_url: "https://docs.test".to_string(),
        external_vector_store_id: VECTOR_STORE_ID.to_string(),
        external_assistant_id: external_assistant_id.to_string(),
    };
    persistence
        .create_state("assistant", id, &serde_json::to_string(&record).unwrap())
        .await
        .unwrap();
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Wait until a looping instance has finished `iteration` and is asleep.
pub async fn wait_for_iteration(runtime: &WorkflowRuntime, instance_id: &str, iteration: i64) {
    eventually(&format!("{instance_id} to reach iteration {iteration}"), move || async move {
        match runtime.get_instance(instance_id).await {
            Ok(record) => record.iteration >= iteration && record.status == "sleeping",
            Err(_) => false,
        }
    })
    .await;
}
