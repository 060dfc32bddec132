// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Infrastructure failures from the remote client.
///
/// Domain outcomes that the application renders as placeholder text — a
/// safety-blocked request, an empty candidate list — are NOT errors; they are
/// [`crate::CompletionOutcome`] variants.  This enum covers only the cases
/// where no usable response exists.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("api key not configured")]
    MissingApiKey,

    #[error("request failed: {0}")]
    Transport(String),

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("file upload failed: {0}")]
    Upload(String),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("call exceeded the configured timeout")]
    Timeout,
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
