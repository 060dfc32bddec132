// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use clipgrid_config::{GenerationParams, PromptSpec};
use clipgrid_model::{
    CompletionOutcome, CompletionRequest, ContentPart, Message, RemoteClient, RemoteError,
    StreamEvent,
};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::context::{ActionContext, LastResult};
use crate::dispatch::{outcome_text, prepare_local, request_for, resolve_parts};
use crate::error::EngineError;
use crate::events::{emit, notify, EngineEvent, EventSender, NotifyLevel};
use crate::input::{snapshot_with_retry, ClipboardSource};
use crate::limiter::Limiter;
use crate::EngineSettings;

/// Fixed trailer appended to every refine request after the previous output
/// and the new instruction.
const REFINE_REQUIREMENTS: &str =
    "Apply the additional instruction to the previous output and return the complete revised result.";

const CLIPBOARD_ATTEMPTS: u32 = 3;

/// The three mutually exclusive ways a single-shot action resolves its
/// prompt.  Closed enum: a request carries exactly one of them.
#[derive(Debug, Clone)]
pub enum ActionMode {
    /// Run a configured prompt by id.
    Prompt { id: String },
    /// Ad-hoc free-input run; instruction and model must both be present.
    AdHoc {
        system_instruction: String,
        model_id: String,
        params: GenerationParams,
    },
    /// Refine the previous result with an extra instruction, reusing the last
    /// prompt config (or an explicit one).
    Refine {
        instruction: String,
        prompt_id: Option<String>,
    },
}

/// One single-shot request, enqueued from any thread.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub mode: ActionMode,
    /// Explicit files override the clipboard snapshot.
    pub file_paths: Vec<PathBuf>,
}

impl ActionRequest {
    pub fn prompt(id: impl Into<String>) -> Self {
        Self { mode: ActionMode::Prompt { id: id.into() }, file_paths: Vec::new() }
    }

    pub fn ad_hoc(
        system_instruction: impl Into<String>,
        model_id: impl Into<String>,
        params: GenerationParams,
    ) -> Self {
        Self {
            mode: ActionMode::AdHoc {
                system_instruction: system_instruction.into(),
                model_id: model_id.into(),
                params,
            },
            file_paths: Vec::new(),
        }
    }

    pub fn refine(instruction: impl Into<String>) -> Self {
        Self {
            mode: ActionMode::Refine { instruction: instruction.into(), prompt_id: None },
            file_paths: Vec::new(),
        }
    }

    pub fn with_files(mut self, paths: Vec<PathBuf>) -> Self {
        self.file_paths = paths;
        self
    }
}

enum QueueMsg {
    Run(ActionRequest),
    Shutdown,
}

/// Thread-safe handle to the single-action FIFO.
///
/// Requests are processed strictly in submission order, one at a time; a
/// request enqueued while another runs waits — it is never dropped or merged.
#[derive(Clone)]
pub struct ActionQueue {
    tx: mpsc::UnboundedSender<QueueMsg>,
}

impl ActionQueue {
    /// Push a request from any thread.  Returns `false` when the drain loop
    /// has already stopped.
    pub fn enqueue(&self, request: ActionRequest) -> bool {
        self.tx.send(QueueMsg::Run(request)).is_ok()
    }

    /// Stop the drain loop once every already-queued request has finished.
    pub fn shutdown(&self) {
        let _ = self.tx.send(QueueMsg::Shutdown);
    }
}

/// Consumes one queued request at a time: resolves the effective prompt,
/// gathers input content, issues exactly one (streamed) completion call, and
/// publishes the result or failure to the sink.
pub struct SingleActionRunner {
    client: Arc<dyn RemoteClient>,
    clipboard: Arc<dyn ClipboardSource>,
    context: Arc<ActionContext>,
    limiter: Limiter,
    events: EventSender,
    settings: EngineSettings,
}

struct ResolvedAction {
    prompt: PromptSpec,
    /// Pre-built content for refine mode; other modes gather input instead.
    refine_parts: Option<Vec<ContentPart>>,
}

impl SingleActionRunner {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        clipboard: Arc<dyn ClipboardSource>,
        context: Arc<ActionContext>,
        limiter: Limiter,
        events: EventSender,
        settings: EngineSettings,
    ) -> Self {
        Self { client, clipboard, context, limiter, events, settings }
    }

    /// Start the drain loop on the worker loop and return the queue handle.
    pub fn start(self, worker: &Handle) -> ActionQueue {
        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    QueueMsg::Run(request) => self.process(request).await,
                    QueueMsg::Shutdown => break,
                }
            }
            debug!("single-action drain loop stopped");
        });
        ActionQueue { tx }
    }

    async fn process(&self, request: ActionRequest) {
        if let Err(e) = self.execute(request).await {
            warn!(error = %e, "single action failed");
            notify(&self.events, "Action failed", &e.to_string(), NotifyLevel::Error).await;
            emit(&self.events, EngineEvent::ActionFailed { message: e.to_string() }).await;
        }
    }

    async fn execute(&self, request: ActionRequest) -> Result<(), EngineError> {
        let resolved = self.resolve(&request.mode)?;
        let prompt = resolved.prompt;

        notify(
            &self.events,
            &format!("Running '{}'", prompt.name),
            "sending request",
            NotifyLevel::Info,
        )
        .await;

        // Content gathering: refine carries its own parts; otherwise explicit
        // files win over the clipboard snapshot.
        let (local_parts, uploads) = match resolved.refine_parts {
            Some(parts) => (Some(parts), Vec::new()),
            None if !request.file_paths.is_empty() => (None, request.file_paths.clone()),
            None => {
                let item = snapshot_with_retry(self.clipboard.as_ref(), CLIPBOARD_ATTEMPTS)
                    .await
                    .map_err(EngineError::ClipboardUnavailable)?;
                match prepare_local(&item) {
                    crate::dispatch::PreparedInput::Parts(parts) => (Some(parts), Vec::new()),
                    crate::dispatch::PreparedInput::Upload(path, _) => (None, vec![path]),
                }
            }
        };

        // Network critical section: uploads + the completion share one permit.
        let (outcome, messages) = {
            let _permit = self.limiter.acquire().await;
            let mut parts = local_parts.unwrap_or_default();
            for path in &uploads {
                let prepared = prepare_local(&crate::input::InputItem::File(path.clone()));
                parts.extend(resolve_parts(self.client.as_ref(), prepared).await?);
            }
            let messages = vec![Message::user(parts)];
            let req = request_for(&prompt, messages.clone());
            let outcome = self.stream_outcome(req).await?;
            (outcome, messages)
        };

        let (text, notice) = outcome_text(outcome);
        if let Some(n) = notice {
            notify(&self.events, n.title, n.message, n.level).await;
        }

        let cost_note = self.cost_note(&prompt, &messages, &text).await;

        self.context.set_last_result(LastResult {
            text: text.clone(),
            prompt: prompt.clone(),
            params: prompt.params.clone(),
        });

        notify(
            &self.events,
            "Done",
            &format!("'{}' finished. {cost_note}", prompt.name),
            NotifyLevel::Success,
        )
        .await;
        emit(
            &self.events,
            EngineEvent::ActionCompleted { text, prompt, cost_note },
        )
        .await;
        Ok(())
    }

    /// Resolve the effective prompt snapshot for one request.
    fn resolve(&self, mode: &ActionMode) -> Result<ResolvedAction, EngineError> {
        match mode {
            ActionMode::Prompt { id } => {
                let prompt = self
                    .context
                    .prompt(id)
                    .ok_or_else(|| EngineError::PromptNotFound(id.clone()))?;
                Ok(ResolvedAction { prompt, refine_parts: None })
            }
            ActionMode::AdHoc { system_instruction, model_id, params } => {
                if system_instruction.is_empty() || model_id.is_empty() {
                    return Err(EngineError::NoContentSpecified);
                }
                let mut prompt =
                    PromptSpec::new("Manual prompt", model_id.clone(), system_instruction.clone());
                prompt.params = params.clone();
                Ok(ResolvedAction { prompt, refine_parts: None })
            }
            ActionMode::Refine { instruction, prompt_id } => {
                let last = self.context.last_result().ok_or(EngineError::NoLastResult)?;
                let mut prompt = match prompt_id {
                    Some(id) => self
                        .context
                        .prompt(id)
                        .ok_or_else(|| EngineError::PromptNotFound(id.clone()))?,
                    None => last.prompt.clone(),
                };
                prompt.name = format!("{} (refine)", prompt.name);
                let parts = vec![
                    ContentPart::text(format!("Previous output:\n{}", last.text)),
                    ContentPart::text(format!("Additional instruction:\n{instruction}")),
                    ContentPart::text(REFINE_REQUIREMENTS),
                ];
                Ok(ResolvedAction { prompt, refine_parts: Some(parts) })
            }
        }
    }

    /// One streamed completion with the tools-removed retry, forwarding each
    /// text delta to the sink.
    async fn stream_outcome(
        &self,
        req: CompletionRequest,
    ) -> Result<CompletionOutcome, EngineError> {
        let bare = (!req.tools.is_empty()).then(|| req.without_tools());
        match self.try_stream(req).await {
            Ok(outcome) => Ok(outcome),
            Err(first) => match bare {
                Some(retry) => {
                    warn!(error = %first, "tool-carrying stream failed, retrying without tools");
                    self.try_stream(retry).await.map_err(EngineError::RemoteCallFailed)
                }
                None => Err(EngineError::RemoteCallFailed(first)),
            },
        }
    }

    async fn try_stream(&self, req: CompletionRequest) -> Result<CompletionOutcome, RemoteError> {
        let consume = async {
            let mut stream = self.client.stream(req).await?;
            let mut text = String::new();
            let mut blocked = false;
            while let Some(event) = stream.next().await {
                match event? {
                    StreamEvent::TextDelta(delta) => {
                        text.push_str(&delta);
                        emit(&self.events, EngineEvent::ActionDelta(delta)).await;
                    }
                    StreamEvent::Blocked => {
                        blocked = true;
                        break;
                    }
                    StreamEvent::Done => break,
                }
            }
            Ok(if blocked {
                CompletionOutcome::SafetyBlocked
            } else if text.is_empty() {
                CompletionOutcome::Empty
            } else {
                CompletionOutcome::Text(text)
            })
        };
        match self.settings.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, consume).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout),
            },
            None => consume.await,
        }
    }

    /// Token counts + price table → the cost line of the completion
    /// notification.  Counting failures are logged and never fail the action.
    async fn cost_note(&self, prompt: &PromptSpec, messages: &[Message], output: &str) -> String {
        let input_tokens = match self.client.count_tokens(&prompt.model_id, messages).await {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "input token count failed");
                return "estimated cost unavailable".into();
            }
        };
        let output_tokens = match self
            .client
            .count_tokens(&prompt.model_id, &[Message::model_text(output)])
            .await
        {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "output token count failed");
                return "estimated cost unavailable".into();
            }
        };
        match self
            .context
            .prices()
            .estimate(&prompt.model_id, input_tokens, output_tokens)
        {
            Some(cost) => format!("estimated cost: ${cost:.6}"),
            None => "estimated cost unavailable".into(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
