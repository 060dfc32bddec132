// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use clipgrid_config::{GenerationParams, ThinkingLevel};
use serde::{Deserialize, Serialize};

// ─── Content part types ───────────────────────────────────────────────────────

/// A reference to a file previously uploaded through the remote client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub uri: String,
    pub mime_type: String,
}

/// A single content part in a request turn.
///
/// Closed sum: adding an input kind is a compile-time-checked change at every
/// match site.  Images are always normalized PNG, base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    InlinePng {
        /// Base64-encoded PNG bytes.
        data: String,
    },
    File(FileRef),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn inline_png(data: impl Into<String>) -> Self {
        Self::InlinePng { data: data.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Whether this part is plain text that begins with a bare URL — the
    /// trigger for the web-search-tool heuristic.
    pub fn is_bare_url(&self) -> bool {
        match self {
            Self::Text { text } => {
                let t = text.trim_start();
                t.starts_with("http://") || t.starts_with("https://")
            }
            _ => false,
        }
    }
}

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One turn of a conversation sent to the remote client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self { role: Role::User, parts }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentPart::text(text)])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self { role: Role::Model, parts: vec![ContentPart::text(text)] }
    }

    /// All text content of this message, joined; images and files are omitted.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Tools the application can attach to a completion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSpec {
    WebSearch,
}

/// Request sent to the remote client.  One request, one completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model_id: String,
    pub system_instruction: String,
    pub messages: Vec<Message>,
    pub params: GenerationParams,
    pub tools: Vec<ToolSpec>,
    pub thinking: ThinkingLevel,
}

impl CompletionRequest {
    pub fn new(model_id: impl Into<String>, system_instruction: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            system_instruction: system_instruction.into(),
            messages: Vec::new(),
            params: GenerationParams::default(),
            tools: Vec::new(),
            thinking: ThinkingLevel::default(),
        }
    }

    /// The same request with all tools removed, used for the one-shot retry
    /// after a tool-related failure.
    pub fn without_tools(&self) -> Self {
        let mut req = self.clone();
        req.tools.clear();
        req
    }
}

/// Result of a non-streaming completion call.
///
/// `SafetyBlocked` and `Empty` are expected business outcomes — the caller
/// renders them as placeholder text — distinct from [`crate::RemoteError`],
/// which covers transport and API failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Text(String),
    SafetyBlocked,
    Empty,
}

/// A single streamed event from the remote client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TextDelta(String),
    /// The request or the response was blocked by the provider's safety
    /// filters; no further text will arrive.
    Blocked,
    Done,
}

// ─── MIME helpers ─────────────────────────────────────────────────────────────

/// Best-effort MIME type from a file extension, for uploads.
///
/// Unknown extensions fall back to `application/octet-stream`, which the
/// upload endpoint accepts.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
