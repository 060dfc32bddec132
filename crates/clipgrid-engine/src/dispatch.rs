// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The shared one-completion call protocol.
//!
//! Every engine issues remote calls the same way: decide whether the
//! web-search tool rides along, place the call (optionally under a hard
//! timeout), retry exactly once with tools stripped when a tool-carrying call
//! fails, and map domain outcomes to the text a cell ultimately shows.

use std::path::PathBuf;
use std::time::Duration;

use clipgrid_config::PromptSpec;
use clipgrid_model::{
    mime_for_path, CompletionOutcome, CompletionRequest, ContentPart, Message, RemoteClient,
    ToolSpec,
};
use tracing::warn;

use crate::error::EngineError;
use crate::events::NotifyLevel;
use crate::input::InputItem;

/// Cell text shown when the provider blocked the request or response.
pub const SAFETY_BLOCKED_PLACEHOLDER: &str = "[request blocked by safety filters]";
/// Cell text shown when the provider returned no candidates / no text.
pub const EMPTY_RESPONSE_PLACEHOLDER: &str = "[model returned no content]";
/// Prefix that marks a cell as a system failure rather than model output.
pub const ERROR_PREFIX: &str = "Error: ";

/// Whether the web-search tool should ride along on this call: the prompt
/// opted in, or some text part is a bare URL.  A heuristic, not a guarantee.
pub(crate) fn wants_web_tool(prompt: &PromptSpec, messages: &[Message]) -> bool {
    prompt.enable_web_tool
        || messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .any(ContentPart::is_bare_url)
}

/// Build the request for one call from a prompt snapshot, applying the tool
/// heuristic.
pub(crate) fn request_for(prompt: &PromptSpec, messages: Vec<Message>) -> CompletionRequest {
    let tools = if wants_web_tool(prompt, &messages) {
        vec![ToolSpec::WebSearch]
    } else {
        vec![]
    };
    CompletionRequest {
        model_id: prompt.model_id.clone(),
        system_instruction: prompt.system_instruction.clone(),
        messages,
        params: prompt.params.clone(),
        tools,
        thinking: prompt.thinking_level,
    }
}

/// Local content assembly, done before a limiter slot is taken.
/// Files carry a marker: the upload is a network call and happens under the
/// permit, next to the completion it feeds.
pub(crate) enum PreparedInput {
    Parts(Vec<ContentPart>),
    Upload(PathBuf, &'static str),
}

pub(crate) fn prepare_local(item: &InputItem) -> PreparedInput {
    match item {
        InputItem::Text(text) => PreparedInput::Parts(vec![ContentPart::text(text.clone())]),
        InputItem::Image(bytes) => {
            // Undecodable clipboard data is sent as-is as a last resort; the
            // provider may still reject it, matching the pre-normalization
            // behavior for corrupt data.
            let data = match clipgrid_image::normalize_png_base64(bytes) {
                Ok(b64) => b64,
                Err(e) => {
                    warn!(error = %e, "image normalization failed, sending raw bytes");
                    clipgrid_image::to_base64(bytes)
                }
            };
            PreparedInput::Parts(vec![ContentPart::inline_png(data)])
        }
        InputItem::File(path) => PreparedInput::Upload(path.clone(), mime_for_path(path)),
    }
}

/// Finish input assembly: perform the upload when one is pending.
/// Call with a limiter permit held.
pub(crate) async fn resolve_parts(
    client: &dyn RemoteClient,
    prepared: PreparedInput,
) -> Result<Vec<ContentPart>, EngineError> {
    match prepared {
        PreparedInput::Parts(parts) => Ok(parts),
        PreparedInput::Upload(path, mime) => {
            let file_ref = client
                .upload_file(&path, mime)
                .await
                .map_err(EngineError::FileUploadFailed)?;
            Ok(vec![ContentPart::File(file_ref)])
        }
    }
}

/// One completion call with the tools-removed retry and the optional hard
/// timeout.  A failure of a tool-carrying call is retried exactly once
/// without tools; a tool-free failure propagates immediately.
pub(crate) async fn complete_with_fallback(
    client: &dyn RemoteClient,
    req: CompletionRequest,
    timeout: Option<Duration>,
) -> Result<CompletionOutcome, EngineError> {
    let had_tools = !req.tools.is_empty();
    let retry = if had_tools { Some(req.without_tools()) } else { None };

    match call_with_timeout(client, req, timeout).await {
        Ok(outcome) => Ok(outcome),
        Err(first) => match retry {
            Some(bare) => {
                warn!(error = %first, "tool-carrying call failed, retrying without tools");
                call_with_timeout(client, bare, timeout)
                    .await
                    .map_err(EngineError::RemoteCallFailed)
            }
            None => Err(EngineError::RemoteCallFailed(first)),
        },
    }
}

async fn call_with_timeout(
    client: &dyn RemoteClient,
    req: CompletionRequest,
    timeout: Option<Duration>,
) -> Result<CompletionOutcome, clipgrid_model::RemoteError> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, client.complete(req)).await {
            Ok(result) => result,
            Err(_) => Err(clipgrid_model::RemoteError::Timeout),
        },
        None => client.complete(req).await,
    }
}

/// A notification that accompanies a placeholder outcome.
pub(crate) struct OutcomeNotice {
    pub title: &'static str,
    pub message: &'static str,
    pub level: NotifyLevel,
}

/// Map a completion outcome to the cell text plus an optional notification.
/// Placeholder outcomes are `Done` cells — the system worked, the model had
/// nothing to say.
pub(crate) fn outcome_text(outcome: CompletionOutcome) -> (String, Option<OutcomeNotice>) {
    match outcome {
        CompletionOutcome::Text(text) => (text, None),
        CompletionOutcome::SafetyBlocked => (
            SAFETY_BLOCKED_PLACEHOLDER.to_string(),
            Some(OutcomeNotice {
                title: "Request blocked",
                message: SAFETY_BLOCKED_PLACEHOLDER,
                level: NotifyLevel::Error,
            }),
        ),
        CompletionOutcome::Empty => (
            EMPTY_RESPONSE_PLACEHOLDER.to_string(),
            Some(OutcomeNotice {
                title: "No response",
                message: EMPTY_RESPONSE_PLACEHOLDER,
                level: NotifyLevel::Warning,
            }),
        ),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use clipgrid_model::MockClient;

    use super::*;

    fn prompt() -> PromptSpec {
        PromptSpec::new("P", "gemini-2.5-flash-lite", "sys")
    }

    #[test]
    fn web_tool_attaches_for_flag_or_url() {
        let mut p = prompt();
        let plain = vec![Message::user_text("hello")];
        let url = vec![Message::user_text("https://example.com/x")];
        assert!(!wants_web_tool(&p, &plain));
        assert!(wants_web_tool(&p, &url));
        p.enable_web_tool = true;
        assert!(wants_web_tool(&p, &plain));
    }

    #[test]
    fn request_for_copies_prompt_snapshot() {
        let p = prompt();
        let req = request_for(&p, vec![Message::user_text("x")]);
        assert_eq!(req.model_id, "gemini-2.5-flash-lite");
        assert_eq!(req.system_instruction, "sys");
        assert!(req.tools.is_empty());
    }

    #[test]
    fn prepare_local_text_and_file() {
        match prepare_local(&InputItem::Text("t".into())) {
            PreparedInput::Parts(parts) => assert_eq!(parts[0].as_text(), Some("t")),
            PreparedInput::Upload(..) => panic!("text must not upload"),
        }
        match prepare_local(&InputItem::File("doc.pdf".into())) {
            PreparedInput::Upload(path, mime) => {
                assert_eq!(path, PathBuf::from("doc.pdf"));
                assert_eq!(mime, "application/pdf");
            }
            PreparedInput::Parts(_) => panic!("file must upload"),
        }
    }

    #[test]
    fn prepare_local_garbage_image_falls_back_to_raw() {
        match prepare_local(&InputItem::Image(b"not an image".to_vec())) {
            PreparedInput::Parts(parts) => {
                assert!(matches!(parts[0], ContentPart::InlinePng { .. }));
            }
            PreparedInput::Upload(..) => panic!("image must not upload"),
        }
    }

    #[tokio::test]
    async fn tool_failure_retries_once_without_tools() {
        let client = MockClient::always_text("ok").failing_with_tools();
        let mut p = prompt();
        p.enable_web_tool = true;
        let req = request_for(&p, vec![Message::user_text("x")]);
        let outcome = complete_with_fallback(&client, req, None).await.unwrap();
        assert_eq!(outcome, CompletionOutcome::Text("ok".into()));
        let calls = client.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].had_tools);
        assert!(!calls[1].had_tools);
    }

    #[tokio::test]
    async fn tool_free_failure_propagates_immediately() {
        let client = MockClient::scripted(vec![clipgrid_model::MockResponse::Fail("down".into())]);
        let req = request_for(&prompt(), vec![Message::user_text("x")]);
        let err = complete_with_fallback(&client, req, None).await.unwrap_err();
        assert!(matches!(err, EngineError::RemoteCallFailed(_)));
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn hard_timeout_converts_to_remote_call_failed() {
        let client = MockClient::always_text("slow").with_delay(Duration::from_millis(80));
        let req = request_for(&prompt(), vec![Message::user_text("x")]);
        let err = complete_with_fallback(&client, req, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn upload_failure_maps_to_file_upload_failed() {
        let client = MockClient::new().failing_uploads();
        let prepared = prepare_local(&InputItem::File("a.bin".into()));
        let err = resolve_parts(&client, prepared).await.unwrap_err();
        assert!(matches!(err, EngineError::FileUploadFailed(_)));
    }

    #[test]
    fn outcome_mapping() {
        let (text, notice) = outcome_text(CompletionOutcome::Text("hi".into()));
        assert_eq!(text, "hi");
        assert!(notice.is_none());

        let (text, notice) = outcome_text(CompletionOutcome::SafetyBlocked);
        assert_eq!(text, SAFETY_BLOCKED_PLACEHOLDER);
        assert_eq!(notice.unwrap().level, NotifyLevel::Error);

        let (text, notice) = outcome_text(CompletionOutcome::Empty);
        assert_eq!(text, EMPTY_RESPONSE_PLACEHOLDER);
        assert_eq!(notice.unwrap().level, NotifyLevel::Warning);
    }
}
