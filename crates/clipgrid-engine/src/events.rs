// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clipgrid_config::PromptSpec;
use tokio::sync::mpsc;

use crate::grid::ColumnId;

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// Presentation tag for a cell result: normal matrix run or flow-chain run.
/// Set by the engines, consumed only by the view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CellStyle {
    #[default]
    Normal,
    Flow,
}

/// Which engine finished a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Matrix,
    Flow,
}

/// Events published by the engines to the GUI-side sink.
///
/// The sink drains the channel on its own thread and mutates display state
/// there; the engines never touch GUI state directly.  A dropped receiver
/// (window closed mid-run) is tolerated everywhere — sends are fire-and-forget.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// State/text change for one cell.  `is_final = false` marks the
    /// queued/streaming phase, `true` the terminal text (result or error).
    CellUpdate {
        row: usize,
        col: ColumnId,
        text: String,
        is_final: bool,
        style: CellStyle,
    },
    /// Completed / total counters for the running batch.
    Progress { completed: usize, total: usize },
    /// User-visible notification (errors, run status, completion).
    Notify {
        title: String,
        message: String,
        level: NotifyLevel,
    },
    /// One streamed text chunk of the in-flight single action.
    ActionDelta(String),
    /// The single action finished; `text` is already the full result.
    ActionCompleted {
        text: String,
        prompt: PromptSpec,
        cost_note: String,
    },
    /// The single action failed; last-result state was left untouched.
    ActionFailed { message: String },
    /// One flow step finished — the sink unchecks that cell's checkbox.
    StepCompleted { row: usize, col: ColumnId },
    /// All tasks of one `run()` invocation are terminal.  The sink clears the
    /// originally-selected checkboxes and re-enables summarize/export actions.
    BatchCompleted {
        kind: BatchKind,
        pairs: Vec<(usize, ColumnId)>,
    },
}

pub type EventSender = mpsc::Sender<EngineEvent>;

/// Fire-and-forget send: a closed channel means the owning window is gone,
/// which is not an error for the engines.
pub(crate) async fn emit(tx: &EventSender, event: EngineEvent) {
    let _ = tx.send(event).await;
}

pub(crate) async fn notify(tx: &EventSender, title: &str, message: &str, level: NotifyLevel) {
    emit(
        tx,
        EngineEvent::Notify {
            title: title.to_string(),
            message: message.to_string(),
            level,
        },
    )
    .await;
}
