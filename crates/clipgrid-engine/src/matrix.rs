// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use clipgrid_config::PromptSpec;
use clipgrid_model::{Message, RemoteClient};
use futures::future::join_all;
use tokio::runtime::Handle;
use tracing::warn;

use crate::dispatch::{
    complete_with_fallback, outcome_text, prepare_local, request_for, resolve_parts, ERROR_PREFIX,
};
use crate::error::EngineError;
use crate::events::{emit, notify, BatchKind, CellStyle, EngineEvent, EventSender, NotifyLevel};
use crate::grid::{lock_grid, CellState, ColumnId, SharedGrid};
use crate::input::InputItem;
use crate::limiter::Limiter;
use crate::EngineSettings;

/// Fan-out executor: one independent completion task per selected
/// (row, column) pair, each gated by the shared limiter.
///
/// `run()` is called on a GUI thread; everything after validation happens as
/// tasks on the worker loop.  Cell results land in the shared grid and are
/// mirrored to the sink as events.
pub struct MatrixEngine {
    grid: SharedGrid,
    client: Arc<dyn RemoteClient>,
    limiter: Limiter,
    events: EventSender,
    worker: Handle,
    settings: EngineSettings,
}

impl MatrixEngine {
    pub fn new(
        grid: SharedGrid,
        client: Arc<dyn RemoteClient>,
        limiter: Limiter,
        events: EventSender,
        worker: Handle,
        settings: EngineSettings,
    ) -> Self {
        Self { grid, client, limiter, events, worker, settings }
    }

    pub fn grid(&self) -> &SharedGrid {
        &self.grid
    }

    /// Execute every selected pair concurrently.  Returns after scheduling;
    /// progress and results arrive through the event channel.
    pub fn run(&self, selection: Vec<(usize, ColumnId)>) -> Result<(), EngineError> {
        if selection.is_empty() {
            let events = self.events.clone();
            self.worker.spawn(async move {
                notify(&events, "Matrix run", "no cells are selected", NotifyLevel::Info).await;
            });
            return Err(EngineError::NoSelection);
        }

        // Snapshot inputs and prompt configs under one lock, then mark every
        // target cell queued.  In-flight tasks keep these snapshots even if
        // the grid is edited while they run.
        let mut units: Vec<(usize, ColumnId, InputItem, PromptSpec)> = Vec::new();
        {
            let mut grid = lock_grid(&self.grid);
            for (row, col) in &selection {
                let input = grid.row(*row).cloned().ok_or(EngineError::UnknownRow(*row))?;
                let prompt = grid
                    .column(*col)
                    .map(|c| c.prompt.clone())
                    .ok_or(EngineError::UnknownColumn(*col))?;
                units.push((*row, *col, input, prompt));
            }
            for (row, col, _, _) in &units {
                grid.mark_queued(*row, *col, CellStyle::Normal);
            }
        }

        let total = units.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let grid = Arc::clone(&self.grid);
        let client = Arc::clone(&self.client);
        let limiter = self.limiter.clone();
        let events = self.events.clone();
        let settings = self.settings.clone();
        let pairs: Vec<(usize, ColumnId)> = selection.clone();
        let worker = self.worker.clone();

        self.worker.spawn(async move {
            emit(&events, EngineEvent::Progress { completed: 0, total }).await;
            for (row, col, _, _) in &units {
                emit(
                    &events,
                    EngineEvent::CellUpdate {
                        row: *row,
                        col: *col,
                        text: String::new(),
                        is_final: false,
                        style: CellStyle::Normal,
                    },
                )
                .await;
            }

            let handles: Vec<_> = units
                .into_iter()
                .map(|(row, col, input, prompt)| {
                    worker.spawn(process_cell(
                        Arc::clone(&grid),
                        Arc::clone(&client),
                        limiter.clone(),
                        events.clone(),
                        settings.clone(),
                        row,
                        col,
                        input,
                        prompt,
                        Arc::clone(&completed),
                        total,
                    ))
                })
                .collect();

            // Gather-style join: a failed or panicked cell never cancels its
            // siblings; the batch completes when every cell is terminal.
            for (i, result) in join_all(handles).await.into_iter().enumerate() {
                if let Err(e) = result {
                    warn!(cell = i, "matrix cell task panicked: {e}");
                }
            }

            emit(&events, EngineEvent::BatchCompleted { kind: BatchKind::Matrix, pairs }).await;
        });

        Ok(())
    }
}

/// One cell's full pipeline.  Local assembly happens before the permit is
/// taken; the upload (when the row is a file) and the completion share one
/// held permit.
#[allow(clippy::too_many_arguments)]
async fn process_cell(
    grid: SharedGrid,
    client: Arc<dyn RemoteClient>,
    limiter: Limiter,
    events: EventSender,
    settings: EngineSettings,
    row: usize,
    col: ColumnId,
    input: InputItem,
    prompt: PromptSpec,
    completed: Arc<AtomicUsize>,
    total: usize,
) {
    let prepared = prepare_local(&input);

    let outcome = {
        let _permit = limiter.acquire().await;
        match resolve_parts(client.as_ref(), prepared).await {
            Ok(parts) => {
                let req = request_for(&prompt, vec![Message::user(parts)]);
                complete_with_fallback(client.as_ref(), req, settings.call_timeout).await
            }
            Err(e) => Err(e),
        }
    };

    let (text, state) = match outcome {
        Ok(outcome) => {
            let (text, notice) = outcome_text(outcome);
            if let Some(n) = notice {
                notify(&events, n.title, n.message, n.level).await;
            }
            (text, CellState::Done)
        }
        Err(e) => {
            notify(
                &events,
                "Matrix cell failed",
                &format!("row {}, prompt '{}': {e}", row + 1, prompt.name),
                NotifyLevel::Error,
            )
            .await;
            (format!("{ERROR_PREFIX}{e}"), CellState::Error)
        }
    };

    lock_grid(&grid).record_final(row, col, text.clone(), state);
    emit(
        &events,
        EngineEvent::CellUpdate { row, col, text, is_final: true, style: CellStyle::Normal },
    )
    .await;

    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
    emit(&events, EngineEvent::Progress { completed: done, total }).await;
}
