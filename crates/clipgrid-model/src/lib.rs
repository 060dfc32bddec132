// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod client;
mod error;
mod google;
mod mock;
mod types;

pub use client::{CompletionStream, RemoteClient};
pub use error::RemoteError;
pub use google::GoogleClient;
pub use mock::{CallRecord, MockClient, MockResponse};
pub use types::{
    mime_for_path, CompletionOutcome, CompletionRequest, ContentPart, FileRef, Message, Role,
    StreamEvent, ToolSpec,
};
