// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{CompletionOutcome, CompletionRequest, FileRef, Message, RemoteError, StreamEvent};

pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<StreamEvent, RemoteError>> + Send>>;

/// The remote completion boundary.
///
/// Engines never talk to a provider SDK directly; everything goes through
/// this trait so tests can substitute an instrumented mock.  All methods may
/// be called concurrently from many tasks on the worker loop — implementations
/// must be internally synchronized.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// One non-streaming completion call.
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionOutcome, RemoteError>;

    /// One streaming completion call.  The stream yields text deltas and ends
    /// with `Done` (or `Blocked` when the provider suppressed the response).
    async fn stream(&self, req: CompletionRequest) -> Result<CompletionStream, RemoteError>;

    /// Token count for the given turns, used only for the cost estimate.
    async fn count_tokens(&self, model_id: &str, messages: &[Message]) -> Result<u32, RemoteError>;

    /// Upload a local file and return a reference usable as a content part.
    /// Failures are surfaced to the caller as-is; uploads are not retried.
    async fn upload_file(&self, path: &Path, mime_type: &str) -> Result<FileRef, RemoteError>;
}
