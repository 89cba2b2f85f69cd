// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! [`AssistantProvider`] backed by the OpenAI Assistants v2 HTTP API.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{
    AssistantProvider, AssistantSpec, FileIndexStatus, ProviderError, RemoteAssistant, RemoteFile,
    RunEvent, RunEventStream, SseDecoder, VectorStore, parse_run_event,
};

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const PAGE_LIMIT: &str = "100";

/// HTTP client for the Assistants API.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OpenAiProvider {
    /// Create a client for `base_url` (for example [`DEFAULT_BASE_URL`]).
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert("OpenAI-Beta", HeaderValue::from_static("assistants=v2"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ProviderError> {
        let resp = check(request.send().await?).await?;
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    /// Follow cursor pagination until the list is exhausted.
    async fn list_all<T>(&self, path: &str) -> Result<Vec<T>, ProviderError>
    where
        T: DeserializeOwned + Identified,
    {
        let mut items = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut query = vec![("limit", PAGE_LIMIT.to_string())];
            if let Some(cursor) = &after {
                query.push(("after", cursor.clone()));
            }

            let page: Page<T> = self
                .send_json(self.request(Method::GET, path).query(&query))
                .await?;

            let cursor = page
                .last_id
                .or_else(|| page.data.last().map(|item| item.id().to_string()));
            let fetched = page.data.len();
            items.extend(page.data);

            match cursor {
                Some(cursor) if page.has_more && fetched > 0 => after = Some(cursor),
                _ => break,
            }
        }

        debug!(path, count = items.len(), "Listed objects");
        Ok(items)
    }
}

/// Map a non-success response to a [`ProviderError`].
async fn check(resp: Response) -> Result<Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or(body);

    if status == StatusCode::NOT_FOUND {
        return Err(ProviderError::NotFound(message));
    }
    Err(ProviderError::Api {
        status: status.as_u16(),
        message,
    })
}

trait Identified {
    fn id(&self) -> &str;
}

#[derive(Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Deserialize)]
struct FileObject {
    id: String,
    filename: String,
}

#[derive(Deserialize)]
struct NamedObject {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Deserialize)]
struct VectorStoreFileObject {
    status: String,
}

impl Identified for FileObject {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for NamedObject {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for IdObject {
    fn id(&self) -> &str {
        &self.id
    }
}

impl From<FileObject> for RemoteFile {
    fn from(file: FileObject) -> Self {
        RemoteFile {
            id: file.id,
            filename: file.filename,
        }
    }
}

#[async_trait]
impl AssistantProvider for OpenAiProvider {
    async fn list_files(&self) -> Result<Vec<RemoteFile>, ProviderError> {
        let files: Vec<FileObject> = self.list_all("/files").await?;
        Ok(files.into_iter().map(RemoteFile::from).collect())
    }

    #[instrument(skip(self, contents), fields(bytes = contents.len()))]
    async fn upload_file(
        &self,
        filename: &str,
        contents: Vec<u8>,
    ) -> Result<RemoteFile, ProviderError> {
        let part = Part::bytes(contents)
            .file_name(filename.to_string())
            .mime_str("application/pdf")?;
        let form = Form::new().text("purpose", "assistants").part("file", part);

        let file: FileObject = self
            .send_json(self.request(Method::POST, "/files").multipart(form))
            .await?;
        debug!(file_id = %file.id, "Uploaded file");
        Ok(file.into())
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), ProviderError> {
        let _: Value = self
            .send_json(self.request(Method::DELETE, &format!("/files/{file_id}")))
            .await?;
        Ok(())
    }

    async fn list_vector_stores(&self) -> Result<Vec<VectorStore>, ProviderError> {
        let stores: Vec<NamedObject> = self.list_all("/vector_stores").await?;
        Ok(stores
            .into_iter()
            .map(|s| VectorStore {
                id: s.id,
                name: s.name,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn create_vector_store(&self, name: &str) -> Result<VectorStore, ProviderError> {
        let store: NamedObject = self
            .send_json(
                self.request(Method::POST, "/vector_stores")
                    .json(&json!({ "name": name })),
            )
            .await?;
        Ok(VectorStore {
            id: store.id,
            name: store.name,
        })
    }

    async fn attach_file(
        &self,
        vector_store_id: &str,
        file_id: &str,
    ) -> Result<(), ProviderError> {
        let _: Value = self
            .send_json(
                self.request(Method::POST, &format!("/vector_stores/{vector_store_id}/files"))
                    .json(&json!({ "file_id": file_id })),
            )
            .await?;
        Ok(())
    }

    async fn detach_file(
        &self,
        vector_store_id: &str,
        file_id: &str,
    ) -> Result<(), ProviderError> {
        let _: Value = self
            .send_json(self.request(
                Method::DELETE,
                &format!("/vector_stores/{vector_store_id}/files/{file_id}"),
            ))
            .await?;
        Ok(())
    }

    async fn file_index_status(
        &self,
        vector_store_id: &str,
        file_id: &str,
    ) -> Result<FileIndexStatus, ProviderError> {
        let file: VectorStoreFileObject = self
            .send_json(self.request(
                Method::GET,
                &format!("/vector_stores/{vector_store_id}/files/{file_id}"),
            ))
            .await?;
        Ok(FileIndexStatus::parse(&file.status))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let page: Page<IdObject> = self.send_json(self.request(Method::GET, "/models")).await?;
        Ok(page.data.into_iter().map(|m| m.id).collect())
    }

    async fn list_assistants(&self) -> Result<Vec<RemoteAssistant>, ProviderError> {
        let assistants: Vec<NamedObject> = self.list_all("/assistants").await?;
        Ok(assistants
            .into_iter()
            .map(|a| RemoteAssistant {
                id: a.id,
                name: a.name,
            })
            .collect())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, model = %spec.model))]
    async fn create_assistant(
        &self,
        spec: &AssistantSpec,
    ) -> Result<RemoteAssistant, ProviderError> {
        let body = json!({
            "name": spec.name,
            "instructions": spec.instructions,
            "model": spec.model,
            "tools": [{ "type": "file_search" }],
            "tool_resources": {
                "file_search": { "vector_store_ids": [spec.vector_store_id] }
            },
        });

        let assistant: NamedObject = self
            .send_json(self.request(Method::POST, "/assistants").json(&body))
            .await?;
        Ok(RemoteAssistant {
            id: assistant.id,
            name: assistant.name,
        })
    }

    async fn create_thread(
        &self,
        metadata: &HashMap<String, String>,
    ) -> Result<String, ProviderError> {
        let thread: IdObject = self
            .send_json(
                self.request(Method::POST, "/threads")
                    .json(&json!({ "metadata": metadata })),
            )
            .await?;
        Ok(thread.id)
    }

    async fn create_message(&self, thread_id: &str, content: &str) -> Result<(), ProviderError> {
        let _: Value = self
            .send_json(
                self.request(Method::POST, &format!("/threads/{thread_id}/messages"))
                    .json(&json!({ "role": "user", "content": content })),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self, metadata))]
    async fn stream_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<RunEventStream, ProviderError> {
        let body = json!({
            "assistant_id": assistant_id,
            "stream": true,
            "metadata": metadata,
        });

        let resp = self
            .request(Method::POST, &format!("/threads/{thread_id}/runs"))
            .json(&body)
            .send()
            .await?;
        let resp = check(resp).await?;

        Ok(Box::pin(async_stream::try_stream! {
            let mut byte_stream = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut pending: Vec<u8> = Vec::new();

            while let Some(chunk) = byte_stream.next().await {
                pending.extend_from_slice(&chunk?);

                // Hold back an incomplete multi-byte sequence for the next chunk.
                let valid = match std::str::from_utf8(&pending) {
                    Ok(text) => text.len(),
                    Err(e) => e.valid_up_to(),
                };
                let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
                pending.drain(..valid);

                for frame in decoder.push(&text) {
                    let event = parse_run_event(&frame);
                    let done = event == RunEvent::Done;
                    yield event;
                    if done {
                        return;
                    }
                }
            }

            if let Some(frame) = decoder.finish() {
                yield parse_run_event(&frame);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn provider(server: &MockServer) -> OpenAiProvider {
        OpenAiProvider::new("sk-test", server.uri()).unwrap()
    }

    #[tokio::test]
    async fn test_list_files_follows_pagination() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/files"))
            .and(query_param("after", "file-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "id": "file-3", "filename": "crawl:vs:0:0.pdf" }],
                "has_more": false
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/files"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("openai-beta", "assistants=v2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "id": "file-1", "filename": "crawl:vs:0:1.pdf" },
                    { "id": "file-2", "filename": "notes.txt" }
                ],
                "has_more": true
            })))
            .mount(&server)
            .await;

        let files = provider(&server).await.list_files().await.unwrap();
        let ids: Vec<_> = files.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["file-1", "file-2", "file-3"]);
        assert_eq!(files[0].filename, "crawl:vs:0:1.pdf");
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/vector_stores/vs_1/files/file-9"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "message": "No file found with id 'file-9'." }
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/vector_stores/vs_1/files"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": { "message": "The vector store was updated by another process." }
            })))
            .mount(&server)
            .await;

        let provider = provider(&server).await;

        let err = provider.detach_file("vs_1", "file-9").await.unwrap_err();
        assert!(err.is_not_found());

        let err = provider.attach_file("vs_1", "file-1").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("updated by another process"));
    }

    #[tokio::test]
    async fn test_create_assistant_request_shape() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/assistants"))
            .and(body_json(json!({
                "name": "docs",
                "instructions": "Answer questions.",
                "model": "gpt-4o",
                "tools": [{ "type": "file_search" }],
                "tool_resources": { "file_search": { "vector_store_ids": ["vs_1"] } }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "asst_1", "name": "docs" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let assistant = provider(&server)
            .await
            .create_assistant(&AssistantSpec {
                name: "docs".to_string(),
                instructions: "Answer questions.".to_string(),
                model: "gpt-4o".to_string(),
                vector_store_id: "vs_1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(assistant.id, "asst_1");
    }

    #[tokio::test]
    async fn test_file_index_status_and_models() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/vector_stores/vs_1/files/file-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "file-1", "status": "in_progress" })),
            )
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [{ "id": "gpt-4o" }, { "id": "gpt-3.5-turbo" }]
            })))
            .mount(&server)
            .await;

        let provider = provider(&server).await;
        assert_eq!(
            provider.file_index_status("vs_1", "file-1").await.unwrap(),
            FileIndexStatus::InProgress
        );
        assert_eq!(
            provider.list_models().await.unwrap(),
            vec!["gpt-4o".to_string(), "gpt-3.5-turbo".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stream_run_yields_events() {
        let server = MockServer::start().await;

        let body = concat!(
            "event: thread.run.created\n",
            "data: {\"id\":\"run_1\"}\n\n",
            "event: thread.message.delta\n",
            "data: {\"delta\":{\"content\":[{\"type\":\"text\",\"text\":{\"value\":\"Hi\"}}]}}\n\n",
            "event: thread.message.completed\n",
            "data: {\"id\":\"msg_1\"}\n\n",
            "event: done\n",
            "data: [DONE]\n\n",
        );

        Mock::given(method("POST"))
            .and(path("/threads/thread_1/runs"))
            .and(body_json(json!({
                "assistant_id": "asst_1",
                "stream": true,
                "metadata": { "queryIndex": "0" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let metadata = HashMap::from([("queryIndex".to_string(), "0".to_string())]);
        let stream = provider(&server)
            .await
            .stream_run("thread_1", "asst_1", &metadata)
            .await
            .unwrap();

        let events: Vec<RunEvent> = stream.map(|e| e.unwrap()).collect().await;
        assert_eq!(
            events,
            vec![
                RunEvent::Unknown("thread.run.created".to_string()),
                RunEvent::MessageDelta("Hi".to_string()),
                RunEvent::MessageCompleted,
                RunEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_run_rejected() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/threads/thread_1/runs"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": { "message": "Rate limit reached" }
            })))
            .mount(&server)
            .await;

        let result = provider(&server)
            .await
            .stream_run("thread_1", "asst_1", &HashMap::new())
            .await;
        match result {
            Err(ProviderError::Api { status, message }) => {
                assert_eq!(status, 429);
                assert_eq!(message, "Rate limit reached");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected an error"),
        }
    }
}
