// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod action;
mod context;
mod dispatch;
mod error;
mod events;
mod flow;
mod grid;
mod input;
mod limiter;
mod matrix;
mod worker;

pub use action::{ActionMode, ActionQueue, ActionRequest, SingleActionRunner};
pub use context::{ActionContext, LastResult};
pub use dispatch::{EMPTY_RESPONSE_PLACEHOLDER, ERROR_PREFIX, SAFETY_BLOCKED_PLACEHOLDER};
pub use error::EngineError;
pub use events::{BatchKind, CellStyle, EngineEvent, EventSender, NotifyLevel};
pub use flow::{CancelToken, FlowEngine, FlowPlan, FlowRowSummary, FlowSummary};
pub use grid::{Cell, CellState, Column, ColumnId, MatrixGrid, SharedGrid};
pub use input::{ClipboardError, ClipboardSource, InputItem, StaticClipboard};
pub use limiter::Limiter;
pub use matrix::MatrixEngine;
pub use worker::{WorkerError, WorkerLoop};

/// Settings shared by all engines, snapshotted from configuration at startup.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    /// Hard timeout around each guarded remote call.  `None` disables it.
    pub call_timeout: Option<std::time::Duration>,
}

impl EngineSettings {
    pub fn from_config(config: &clipgrid_config::AppConfig) -> Self {
        Self {
            call_timeout: config.call_timeout_secs.map(std::time::Duration::from_secs),
        }
    }
}
