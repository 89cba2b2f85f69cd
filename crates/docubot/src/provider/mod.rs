// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote AI-assistant provider interface.
//!
//! Workflows only talk to the provider through [`AssistantProvider`], so tests
//! can substitute an in-memory fake for the HTTP client in [`openai`].

pub mod openai;
mod sse;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use docubot_sdk::StepError;
use futures::Stream;
use thiserror::Error;

pub use self::openai::OpenAiProvider;
pub use self::sse::{SseDecoder, SseFrame, parse_run_event};

/// An uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Provider-assigned file ID.
    pub id: String,
    /// Name the file was uploaded under.
    pub filename: String,
}

/// A searchable index of files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorStore {
    /// Provider-assigned ID.
    pub id: String,
    /// Display name.
    pub name: Option<String>,
}

/// A configured assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAssistant {
    /// Provider-assigned ID.
    pub id: String,
    /// Display name.
    pub name: Option<String>,
}

/// Parameters for creating an assistant with file search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantSpec {
    /// Display name.
    pub name: String,
    /// System instructions.
    pub instructions: String,
    /// Model ID.
    pub model: String,
    /// Vector store searched by the file-search tool.
    pub vector_store_id: String,
}

/// Indexing status of a file attached to a vector store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileIndexStatus {
    /// Still being processed.
    InProgress,
    /// Ready for search.
    Completed,
    /// Processing was cancelled.
    Cancelled,
    /// Processing failed.
    Failed,
    /// Status this client does not know.
    Other(String),
}

impl FileIndexStatus {
    /// Parse the provider's status string.
    pub fn parse(status: &str) -> Self {
        match status {
            "in_progress" => FileIndexStatus::InProgress,
            "completed" => FileIndexStatus::Completed,
            "cancelled" => FileIndexStatus::Cancelled,
            "failed" => FileIndexStatus::Failed,
            other => FileIndexStatus::Other(other.to_string()),
        }
    }
}

/// Event from a streaming run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Partial assistant text (all text parts of one delta, concatenated).
    MessageDelta(String),
    /// The assistant message is complete.
    MessageCompleted,
    /// The stream reported an error.
    Error {
        /// Provider error code.
        code: Option<String>,
        /// Error message.
        message: String,
    },
    /// The run failed.
    RunFailed {
        /// Provider error code.
        code: Option<String>,
        /// Error message.
        message: String,
    },
    /// End of stream.
    Done,
    /// Any event this client does not handle.
    Unknown(String),
}

/// Stream of run events.
pub type RunEventStream = Pin<Box<dyn Stream<Item = Result<RunEvent, ProviderError>> + Send>>;

/// Errors returned by a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The API returned a non-success status.
    #[error("provider returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body.
        message: String,
    },

    /// The referenced object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request never produced a response.
    #[error("request failed: {0}")]
    Transport(String),

    /// The response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The provider cannot serve this deployment as configured.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Conflicts, rate limits, server errors and network failures are
    /// transient; everything else is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Api { status, .. } => {
                matches!(status, 408 | 409 | 429) || *status >= 500
            }
            ProviderError::Transport(_) => true,
            _ => false,
        }
    }

    /// Returns true for [`ProviderError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ProviderError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None if err.is_decode() => ProviderError::InvalidResponse(err.to_string()),
            None => ProviderError::Transport(err.to_string()),
        }
    }
}

impl From<ProviderError> for StepError {
    fn from(err: ProviderError) -> Self {
        if err.is_retryable() {
            StepError::Retryable(err.to_string())
        } else {
            StepError::Fatal(err.to_string())
        }
    }
}

/// Operations the workflows need from the remote provider.
#[async_trait]
pub trait AssistantProvider: Send + Sync {
    /// List every uploaded file.
    async fn list_files(&self) -> Result<Vec<RemoteFile>, ProviderError>;

    /// Upload a file for use by assistants.
    async fn upload_file(
        &self,
        filename: &str,
        contents: Vec<u8>,
    ) -> Result<RemoteFile, ProviderError>;

    /// Delete an uploaded file.
    async fn delete_file(&self, file_id: &str) -> Result<(), ProviderError>;

    /// List every vector store.
    async fn list_vector_stores(&self) -> Result<Vec<VectorStore>, ProviderError>;

    /// Create a vector store.
    async fn create_vector_store(&self, name: &str) -> Result<VectorStore, ProviderError>;

    /// Attach an uploaded file to a vector store.
    async fn attach_file(&self, vector_store_id: &str, file_id: &str)
    -> Result<(), ProviderError>;

    /// Detach a file from a vector store.
    async fn detach_file(&self, vector_store_id: &str, file_id: &str)
    -> Result<(), ProviderError>;

    /// Indexing status of an attached file.
    async fn file_index_status(
        &self,
        vector_store_id: &str,
        file_id: &str,
    ) -> Result<FileIndexStatus, ProviderError>;

    /// IDs of the models available to this account.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;

    /// List every assistant.
    async fn list_assistants(&self) -> Result<Vec<RemoteAssistant>, ProviderError>;

    /// Create an assistant that searches one vector store.
    async fn create_assistant(&self, spec: &AssistantSpec)
    -> Result<RemoteAssistant, ProviderError>;

    /// Create a conversation thread and return its ID.
    async fn create_thread(
        &self,
        metadata: &HashMap<String, String>,
    ) -> Result<String, ProviderError>;

    /// Post a user message to a thread.
    async fn create_message(&self, thread_id: &str, content: &str) -> Result<(), ProviderError>;

    /// Start a run on a thread and stream its events.
    async fn stream_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<RunEventStream, ProviderError>;
}
