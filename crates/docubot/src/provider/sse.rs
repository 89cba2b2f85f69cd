// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server-sent event decoding for streaming runs.

use serde_json::Value;
use tracing::warn;

use super::RunEvent;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Incremental decoder: feed it chunks as they arrive, get complete frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completes.
    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].trim_end_matches('\r').to_string();
            self.buffer.replace_range(..=newline_pos, "");

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    /// Flush a trailing frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let mut frames = self.push(&format!("{rest}\n"));
            if let Some(frame) = frames.pop() {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Map a frame from the runs endpoint to a [`RunEvent`].
///
/// Frames whose payload does not have the expected shape are logged and
/// reported as [`RunEvent::Unknown`].
pub fn parse_run_event(frame: &SseFrame) -> RunEvent {
    let name = frame.event.as_deref().unwrap_or("message");

    if name == "done" || frame.data == "[DONE]" {
        return RunEvent::Done;
    }

    let payload = match name {
        "thread.message.delta" | "thread.message.completed" | "error" | "thread.run.failed" => {
            match serde_json::from_str::<Value>(&frame.data) {
                Ok(value) => value,
                Err(e) => {
                    warn!(event = %name, error = %e, "Skipping event with unparseable payload");
                    return RunEvent::Unknown(name.to_string());
                }
            }
        }
        other => return RunEvent::Unknown(other.to_string()),
    };

    match name {
        "thread.message.delta" => {
            let Some(parts) = payload["delta"]["content"].as_array() else {
                return RunEvent::MessageDelta(String::new());
            };
            let text = parts
                .iter()
                .filter(|part| part["type"] == "text")
                .filter_map(|part| part["text"]["value"].as_str())
                .collect::<String>();
            RunEvent::MessageDelta(text)
        }
        "thread.message.completed" => RunEvent::MessageCompleted,
        "error" => {
            let error = if payload["error"].is_object() {
                &payload["error"]
            } else {
                &payload
            };
            let (code, message) = error_fields(error);
            RunEvent::Error { code, message }
        }
        _ => {
            let (code, message) = error_fields(&payload["last_error"]);
            RunEvent::RunFailed { code, message }
        }
    }
}

fn error_fields(value: &Value) -> (Option<String>, String) {
    let code = value["code"].as_str().map(str::to_string);
    let message = value["message"]
        .as_str()
        .unwrap_or("unknown error")
        .to_string();
    (code, message)
}
