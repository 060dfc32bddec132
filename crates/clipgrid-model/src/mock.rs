// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use crate::{
    client::CompletionStream, CompletionOutcome, CompletionRequest, FileRef, Message, RemoteError,
    StreamEvent,
};

/// A scripted response for one `complete`/`stream` call.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Text(String),
    Blocked,
    Empty,
    Fail(String),
}

/// What one call looked like, captured at call start.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub model_id: String,
    pub system_instruction: String,
    /// All text parts of all messages, joined — what the model "saw".
    pub content: String,
    pub had_tools: bool,
}

/// Deterministic mock client for tests.
///
/// Responses are popped from a script queue (fallback: echo the last user
/// text).  Every call is logged at start, and an in-flight gauge tracks the
/// peak number of simultaneous `complete` calls so bounded-concurrency
/// properties are directly assertable.
pub struct MockClient {
    scripts: Mutex<VecDeque<MockResponse>>,
    /// Call log, shared so tests can keep reading after the client moves
    /// behind an `Arc<dyn RemoteClient>`.
    pub calls: Arc<Mutex<Vec<CallRecord>>>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    fail_with_tools: bool,
    fail_uploads: bool,
    upload_counter: AtomicUsize,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            fail_with_tools: false,
            fail_uploads: false,
            upload_counter: AtomicUsize::new(0),
        }
    }

    /// Client that always echoes the given reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let mut c = Self::new();
        let r = reply.into();
        c.scripts
            .get_mut()
            .unwrap()
            .extend(std::iter::repeat(MockResponse::Text(r)).take(64));
        c
    }

    /// Client that pops the given responses in order, then echoes.
    pub fn scripted(responses: Vec<MockResponse>) -> Self {
        let c = Self::new();
        c.scripts.lock().unwrap().extend(responses);
        c
    }

    /// Hold each call open for `delay` so concurrency is observable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail any call that has tools attached (exercises the tools-removed
    /// retry).  The failing attempt does not consume a script entry.
    pub fn failing_with_tools(mut self) -> Self {
        self.fail_with_tools = true;
        self
    }

    /// Fail every `upload_file` call.
    pub fn failing_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, req: &CompletionRequest) {
        let content = req
            .messages
            .iter()
            .map(Message::joined_text)
            .collect::<Vec<_>>()
            .join("\n");
        self.calls.lock().unwrap().push(CallRecord {
            model_id: req.model_id.clone(),
            system_instruction: req.system_instruction.clone(),
            content,
            had_tools: !req.tools.is_empty(),
        });
    }

    fn next_script(&self, req: &CompletionRequest) -> MockResponse {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.pop_front().unwrap_or_else(|| {
            let echo = req
                .messages
                .iter()
                .rev()
                .find(|m| m.role == crate::Role::User)
                .map(Message::joined_text)
                .unwrap_or_default();
            MockResponse::Text(format!("MOCK: {echo}"))
        })
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl crate::RemoteClient for MockClient {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionOutcome, RemoteError> {
        self.record(&req);
        if self.fail_with_tools && !req.tools.is_empty() {
            return Err(RemoteError::Api {
                status: 400,
                message: "tool use is not supported".into(),
            });
        }
        let response = self.next_script(&req);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match response {
            MockResponse::Text(t) => Ok(CompletionOutcome::Text(t)),
            MockResponse::Blocked => Ok(CompletionOutcome::SafetyBlocked),
            MockResponse::Empty => Ok(CompletionOutcome::Empty),
            MockResponse::Fail(msg) => Err(RemoteError::Transport(msg)),
        }
    }

    async fn stream(&self, req: CompletionRequest) -> Result<CompletionStream, RemoteError> {
        self.record(&req);
        if self.fail_with_tools && !req.tools.is_empty() {
            return Err(RemoteError::Api {
                status: 400,
                message: "tool use is not supported".into(),
            });
        }
        let response = self.next_script(&req);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let events: Vec<Result<StreamEvent, RemoteError>> = match response {
            MockResponse::Text(t) => {
                // Split the reply so consumers see more than one delta.
                let mid = t.len() / 2;
                let mid = (0..=mid).rev().find(|i| t.is_char_boundary(*i)).unwrap_or(0);
                let (a, b) = t.split_at(mid);
                let mut ev = Vec::new();
                if !a.is_empty() {
                    ev.push(Ok(StreamEvent::TextDelta(a.to_string())));
                }
                if !b.is_empty() {
                    ev.push(Ok(StreamEvent::TextDelta(b.to_string())));
                }
                ev.push(Ok(StreamEvent::Done));
                ev
            }
            MockResponse::Blocked => vec![Ok(StreamEvent::Blocked), Ok(StreamEvent::Done)],
            MockResponse::Empty => vec![Ok(StreamEvent::Done)],
            MockResponse::Fail(msg) => return Err(RemoteError::Transport(msg)),
        };
        Ok(Box::pin(stream::iter(events)))
    }

    async fn count_tokens(&self, _model_id: &str, messages: &[Message]) -> Result<u32, RemoteError> {
        let chars: usize = messages.iter().map(|m| m.joined_text().len()).sum();
        Ok((chars / 4).max(1) as u32)
    }

    async fn upload_file(&self, path: &Path, mime_type: &str) -> Result<FileRef, RemoteError> {
        if self.fail_uploads {
            return Err(RemoteError::Upload(format!(
                "upload refused: {}",
                path.display()
            )));
        }
        let n = self.upload_counter.fetch_add(1, Ordering::SeqCst);
        Ok(FileRef {
            uri: format!("files/mock-{n}"),
            mime_type: mime_type.to_string(),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
