// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver — native Generative Language API.
//!
//! Uses the `generateContent` / `streamGenerateContent` / `countTokens`
//! endpoints plus the raw media-upload endpoint for file rows.
//!
//! # Auth
//! API key via `?key=...` query param (`GEMINI_API_KEY`).
//!
//! # Endpoint pattern
//! `POST https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent`

use std::path::Path;

use async_trait::async_trait;
use clipgrid_config::ThinkingLevel;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    client::CompletionStream, CompletionOutcome, CompletionRequest, ContentPart, FileRef, Message,
    RemoteError, Role, StreamEvent, ToolSpec,
};

pub struct GoogleClient {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleClient {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            client: reqwest::Client::new(),
        }
    }

    /// Client configured from the `GEMINI_API_KEY` environment variable.
    pub fn from_env() -> Self {
        Self::new(std::env::var("GEMINI_API_KEY").ok(), None)
    }

    fn key(&self) -> Result<&str, RemoteError> {
        self.api_key.as_deref().ok_or(RemoteError::MissingApiKey)
    }

    fn model_url(&self, model_id: &str, verb: &str, key: &str, sse: bool) -> String {
        let alt = if sse { "alt=sse&" } else { "" };
        format!(
            "{}/v1beta/models/{}:{}?{}key={}",
            self.base_url.trim_end_matches('/'),
            model_id,
            verb,
            alt,
            key
        )
    }
}

#[async_trait]
impl crate::RemoteClient for GoogleClient {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionOutcome, RemoteError> {
        let key = self.key()?;
        let body = build_request_body(&req);
        let url = self.model_url(&req.model_id, "generateContent", key, false);

        debug!(model = %req.model_id, tools = req.tools.len(), "sending Gemini request");

        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Api { status, message });
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(parse_outcome(&value))
    }

    async fn stream(&self, req: CompletionRequest) -> Result<CompletionStream, RemoteError> {
        let key = self.key()?;
        let body = build_request_body(&req);
        let url = self.model_url(&req.model_id, "streamGenerateContent", key, true);

        debug!(model = %req.model_id, "sending Gemini streaming request");

        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Api { status, message });
        }

        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .flat_map(|chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::stream::iter(vec![Err(RemoteError::Transport(
                            e.to_string(),
                        ))])
                    }
                };
                let events: Vec<Result<StreamEvent, RemoteError>> = text
                    .lines()
                    .filter_map(|line| {
                        let data = line.strip_prefix("data: ")?.trim();
                        let value: Value = match serde_json::from_str(data) {
                            Ok(v) => v,
                            Err(e) => return Some(Err(RemoteError::Decode(e.to_string()))),
                        };
                        sse_chunk_to_event(&value).map(Ok)
                    })
                    .collect();
                futures::stream::iter(events)
            })
            .chain(futures::stream::iter(vec![Ok(StreamEvent::Done)]));

        Ok(Box::pin(event_stream))
    }

    async fn count_tokens(&self, model_id: &str, messages: &[Message]) -> Result<u32, RemoteError> {
        let key = self.key()?;
        let url = self.model_url(model_id, "countTokens", key, false);
        let body = json!({ "contents": messages_to_contents(messages) });

        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Api { status, message });
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        value["totalTokens"]
            .as_u64()
            .map(|t| t as u32)
            .ok_or_else(|| RemoteError::Decode("missing totalTokens".into()))
    }

    async fn upload_file(&self, path: &Path, mime_type: &str) -> Result<FileRef, RemoteError> {
        let key = self.key()?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| RemoteError::Upload(format!("{}: {e}", path.display())))?;
        let url = format!(
            "{}/upload/v1beta/files?key={}",
            self.base_url.trim_end_matches('/'),
            key
        );

        debug!(path = %path.display(), mime = mime_type, "uploading file to Gemini");

        let resp = self
            .client
            .post(&url)
            .header("X-Goog-Upload-Protocol", "raw")
            .header("Content-Type", mime_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| RemoteError::Upload(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let message = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Upload(format!("{status}: {message}")));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| RemoteError::Upload(e.to_string()))?;
        let uri = value["file"]["uri"]
            .as_str()
            .ok_or_else(|| RemoteError::Upload("missing file.uri in upload response".into()))?;
        let mime = value["file"]["mimeType"].as_str().unwrap_or(mime_type);
        Ok(FileRef { uri: uri.to_string(), mime_type: mime.to_string() })
    }
}

// ─── Wire format ─────────────────────────────────────────────────────────────

fn part_to_json(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text { text } => json!({ "text": text }),
        ContentPart::InlinePng { data } => json!({
            "inline_data": { "mime_type": "image/png", "data": data }
        }),
        ContentPart::File(f) => json!({
            "file_data": { "file_uri": f.uri, "mime_type": f.mime_type }
        }),
    }
}

fn messages_to_contents(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Model => "model",
            };
            let parts: Vec<Value> = m.parts.iter().map(part_to_json).collect();
            json!({ "role": role, "parts": parts })
        })
        .collect()
}

/// Thinking budget in tokens for the `thinkingConfig` block.
/// `-1` requests the provider-chosen dynamic budget.
fn thinking_budget(level: ThinkingLevel) -> i64 {
    match level {
        ThinkingLevel::Fast => 0,
        ThinkingLevel::Balanced => -1,
        ThinkingLevel::HighQuality => 24_576,
        ThinkingLevel::Unlimited => 32_768,
    }
}

fn build_request_body(req: &CompletionRequest) -> Value {
    let mut generation_config = json!({
        "temperature": req.params.temperature,
        "thinkingConfig": { "thinkingBudget": thinking_budget(req.thinking) },
    });
    if let Some(top_p) = req.params.top_p {
        generation_config["topP"] = json!(top_p);
    }
    if let Some(top_k) = req.params.top_k {
        generation_config["topK"] = json!(top_k);
    }
    if let Some(max) = req.params.max_output_tokens {
        generation_config["maxOutputTokens"] = json!(max);
    }
    if let Some(stops) = &req.params.stop_sequences {
        generation_config["stopSequences"] = json!(stops);
    }

    let mut body = json!({
        "contents": messages_to_contents(&req.messages),
        "generationConfig": generation_config,
    });
    if !req.system_instruction.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": req.system_instruction }] });
    }
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| match t {
                ToolSpec::WebSearch => json!({ "google_search": {} }),
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

/// Map one full `generateContent` response to an outcome.
///
/// A `promptFeedback.blockReason` or an empty candidate list never raises —
/// both are expected business outcomes the caller renders as placeholders.
fn parse_outcome(value: &Value) -> CompletionOutcome {
    if value["promptFeedback"]["blockReason"].as_str().is_some() {
        return CompletionOutcome::SafetyBlocked;
    }
    let candidates = match value["candidates"].as_array() {
        Some(c) if !c.is_empty() => c,
        _ => return CompletionOutcome::Empty,
    };
    let text = collect_candidate_text(&candidates[0]);
    if text.is_empty() {
        CompletionOutcome::Empty
    } else {
        CompletionOutcome::Text(text)
    }
}

fn collect_candidate_text(candidate: &Value) -> String {
    candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .concat()
        })
        .unwrap_or_default()
}

/// Map one SSE chunk to a stream event, or `None` when the chunk carries
/// nothing renderable (usage metadata, finish markers).
fn sse_chunk_to_event(value: &Value) -> Option<StreamEvent> {
    if value["promptFeedback"]["blockReason"].as_str().is_some() {
        return Some(StreamEvent::Blocked);
    }
    if let Some(candidates) = value["candidates"].as_array() {
        if let Some(first) = candidates.first() {
            let text = collect_candidate_text(first);
            if !text.is_empty() {
                return Some(StreamEvent::TextDelta(text));
            }
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use clipgrid_config::GenerationParams;

    fn request_with(messages: Vec<Message>) -> CompletionRequest {
        let mut req = CompletionRequest::new("gemini-2.5-flash", "You are terse.");
        req.messages = messages;
        req
    }

    #[test]
    fn body_contains_system_instruction_and_contents() {
        let req = request_with(vec![Message::user_text("hello")]);
        let body = build_request_body(&req);
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "You are terse."
        );
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
    }

    #[test]
    fn body_omits_empty_system_instruction() {
        let mut req = request_with(vec![Message::user_text("x")]);
        req.system_instruction.clear();
        let body = build_request_body(&req);
        assert!(body.get("systemInstruction").is_none());
    }

    #[test]
    fn body_includes_web_search_tool_when_attached() {
        let mut req = request_with(vec![Message::user_text("https://example.com")]);
        req.tools = vec![ToolSpec::WebSearch];
        let body = build_request_body(&req);
        assert!(body["tools"][0].get("google_search").is_some());
    }

    #[test]
    fn body_carries_generation_params() {
        let mut req = request_with(vec![Message::user_text("x")]);
        req.params = GenerationParams {
            temperature: 0.2,
            top_p: Some(0.9),
            top_k: Some(40),
            max_output_tokens: Some(1024),
            stop_sequences: Some(vec!["END".into()]),
        };
        let body = build_request_body(&req);
        let gc = &body["generationConfig"];
        assert_eq!(gc["temperature"], 0.2);
        assert_eq!(gc["topP"], 0.9);
        assert_eq!(gc["topK"], 40);
        assert_eq!(gc["maxOutputTokens"], 1024);
        assert_eq!(gc["stopSequences"][0], "END");
    }

    #[test]
    fn thinking_levels_map_to_budgets() {
        assert_eq!(thinking_budget(ThinkingLevel::Fast), 0);
        assert_eq!(thinking_budget(ThinkingLevel::Balanced), -1);
        assert!(thinking_budget(ThinkingLevel::HighQuality) > 0);
        assert!(thinking_budget(ThinkingLevel::Unlimited) > thinking_budget(ThinkingLevel::HighQuality));
    }

    #[test]
    fn model_turns_map_to_model_role() {
        let req = request_with(vec![
            Message::user_text("q"),
            Message::model_text("a"),
            Message::user_text("q2"),
        ]);
        let body = build_request_body(&req);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][2]["role"], "user");
    }

    #[test]
    fn inline_png_and_file_parts_serialize() {
        let req = request_with(vec![Message::user(vec![
            ContentPart::inline_png("QUJD"),
            ContentPart::File(FileRef { uri: "files/x".into(), mime_type: "application/pdf".into() }),
        ])]);
        let body = build_request_body(&req);
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["inline_data"]["mime_type"], "image/png");
        assert_eq!(parts[1]["file_data"]["file_uri"], "files/x");
    }

    #[test]
    fn parse_outcome_blocked_request() {
        let v = serde_json::json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        assert_eq!(parse_outcome(&v), CompletionOutcome::SafetyBlocked);
    }

    #[test]
    fn parse_outcome_no_candidates_is_empty() {
        let v = serde_json::json!({ "candidates": [] });
        assert_eq!(parse_outcome(&v), CompletionOutcome::Empty);
    }

    #[test]
    fn parse_outcome_joins_candidate_parts() {
        let v = serde_json::json!({
            "candidates": [{ "content": { "parts": [
                { "text": "Hello, " },
                { "text": "world" }
            ]}}]
        });
        assert_eq!(parse_outcome(&v), CompletionOutcome::Text("Hello, world".into()));
    }

    #[test]
    fn parse_outcome_candidate_without_parts_is_empty() {
        let v = serde_json::json!({
            "candidates": [{ "finishReason": "SAFETY", "content": {} }]
        });
        assert_eq!(parse_outcome(&v), CompletionOutcome::Empty);
    }

    #[test]
    fn sse_chunk_with_text_yields_delta() {
        let v = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "chunk" }] } }]
        });
        assert_eq!(sse_chunk_to_event(&v), Some(StreamEvent::TextDelta("chunk".into())));
    }

    #[test]
    fn sse_chunk_blocked_yields_blocked() {
        let v = serde_json::json!({ "promptFeedback": { "blockReason": "OTHER" } });
        assert_eq!(sse_chunk_to_event(&v), Some(StreamEvent::Blocked));
    }

    #[test]
    fn sse_chunk_without_content_is_skipped() {
        let v = serde_json::json!({ "usageMetadata": { "totalTokenCount": 12 } });
        assert_eq!(sse_chunk_to_event(&v), None);
    }
}
