// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clipgrid_model::RemoteError;
use thiserror::Error;

use crate::grid::ColumnId;
use crate::input::ClipboardError;

/// Task-local failures of the dispatch core.
///
/// Each variant aborts exactly one unit of work (one single action, one cell,
/// one row) and is reported through the notification sink; none of them takes
/// down the worker loop or sibling tasks.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("prompt '{0}' is not configured")]
    PromptNotFound(String),

    #[error("no prompt content specified")]
    NoContentSpecified,

    #[error("no previous result to refine")]
    NoLastResult,

    #[error("clipboard unavailable: {0}")]
    ClipboardUnavailable(#[source] ClipboardError),

    #[error("file upload failed: {0}")]
    FileUploadFailed(#[source] RemoteError),

    #[error("remote call failed: {0}")]
    RemoteCallFailed(#[source] RemoteError),

    #[error("no cells selected")]
    NoSelection,

    #[error("no flow steps selected")]
    NoFlowSteps,

    #[error("row {0} does not exist")]
    UnknownRow(usize),

    #[error("column {0} does not exist")]
    UnknownColumn(ColumnId),
}
