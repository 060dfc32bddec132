// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use clipgrid_config::PromptSpec;
use clipgrid_model::{ContentPart, Message, RemoteClient};
use futures::future::join_all;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::dispatch::{
    complete_with_fallback, outcome_text, prepare_local, request_for, resolve_parts, ERROR_PREFIX,
};
use crate::error::EngineError;
use crate::events::{emit, notify, BatchKind, CellStyle, EngineEvent, EventSender, NotifyLevel};
use crate::grid::{lock_grid, CellState, ColumnId, MatrixGrid, SharedGrid};
use crate::limiter::Limiter;
use crate::EngineSettings;

/// Per-row ordered chains of column identities.  Built once per invocation
/// and immutable during execution.
#[derive(Debug, Clone, Default)]
pub struct FlowPlan {
    steps: BTreeMap<usize, Vec<ColumnId>>,
}

impl FlowPlan {
    /// Build a plan from the current selection: per row, selected columns in
    /// ascending display order (not selection order), truncated to
    /// `max_steps`.  Rows with no selected column are excluded.
    pub fn build(
        grid: &MatrixGrid,
        selection: &[(usize, ColumnId)],
        max_steps: usize,
    ) -> Self {
        let mut steps: BTreeMap<usize, Vec<(usize, ColumnId)>> = BTreeMap::new();
        for (row, col) in selection {
            if grid.row(*row).is_none() {
                continue;
            }
            let Some(position) = grid.column_position(*col) else {
                continue;
            };
            steps.entry(*row).or_default().push((position, *col));
        }
        let steps = steps
            .into_iter()
            .map(|(row, mut cols)| {
                cols.sort_by_key(|(position, _)| *position);
                cols.dedup_by_key(|(position, _)| *position);
                let ordered: Vec<ColumnId> =
                    cols.into_iter().take(max_steps).map(|(_, id)| id).collect();
                (row, ordered)
            })
            .filter(|(_, cols)| !cols.is_empty())
            .collect();
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn total_steps(&self) -> usize {
        self.steps.values().map(Vec::len).sum()
    }

    pub fn rows(&self) -> impl Iterator<Item = (usize, &[ColumnId])> {
        self.steps.iter().map(|(row, cols)| (*row, cols.as_slice()))
    }

    /// Every (row, col) cell the plan will write.
    pub fn pairs(&self) -> Vec<(usize, ColumnId)> {
        self.steps
            .iter()
            .flat_map(|(row, cols)| cols.iter().map(move |c| (*row, *c)))
            .collect()
    }
}

/// One row of the confirmation summary.
#[derive(Debug, Clone)]
pub struct FlowRowSummary {
    pub row: usize,
    pub cols: Vec<ColumnId>,
}

/// What a flow invocation is about to do — computed without side effects so a
/// confirmation dialog can show it before anything is spawned.
#[derive(Debug, Clone)]
pub struct FlowSummary {
    pub rows: Vec<FlowRowSummary>,
    pub total_steps: usize,
    /// Some target cell already holds a non-empty result; running the plan
    /// will overwrite it.
    pub overwrites: bool,
}

/// Shared cancellation flag, checked before every step.  In-flight remote
/// calls are never interrupted; only not-yet-started steps are skipped.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sequential-chain executor: each row's selected columns run strictly in
/// order as one conversation (step N's output becomes step N+1's input),
/// while different rows run concurrently, all gated by the shared limiter.
pub struct FlowEngine {
    grid: SharedGrid,
    client: Arc<dyn RemoteClient>,
    limiter: Limiter,
    events: EventSender,
    worker: Handle,
    settings: EngineSettings,
    max_steps: usize,
}

impl FlowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        grid: SharedGrid,
        client: Arc<dyn RemoteClient>,
        limiter: Limiter,
        events: EventSender,
        worker: Handle,
        settings: EngineSettings,
        max_steps: usize,
    ) -> Self {
        Self { grid, client, limiter, events, worker, settings, max_steps }
    }

    /// Plan the flow for the current selection.
    pub fn plan(&self, selection: &[(usize, ColumnId)]) -> FlowPlan {
        FlowPlan::build(&lock_grid(&self.grid), selection, self.max_steps)
    }

    /// Pure confirmation summary for a plan; no state is touched.
    pub fn summarize(&self, plan: &FlowPlan) -> FlowSummary {
        let grid = lock_grid(&self.grid);
        let rows: Vec<FlowRowSummary> = plan
            .rows()
            .map(|(row, cols)| FlowRowSummary { row, cols: cols.to_vec() })
            .collect();
        let overwrites = plan
            .pairs()
            .iter()
            .any(|(row, col)| grid.has_result(*row, *col));
        FlowSummary { rows, total_steps: plan.total_steps(), overwrites }
    }

    /// Execute a plan.  Returns the cancellation token after scheduling; all
    /// results arrive through the event channel.
    pub fn run(&self, plan: FlowPlan) -> Result<CancelToken, EngineError> {
        if plan.is_empty() {
            let events = self.events.clone();
            self.worker.spawn(async move {
                notify(&events, "Flow run", "no flow steps are selected", NotifyLevel::Info).await;
            });
            return Err(EngineError::NoFlowSteps);
        }

        let total = plan.total_steps();
        let pairs = plan.pairs();
        let cancel = CancelToken::default();

        // Snapshot each row's input and each step's prompt, then queue every
        // target cell in flow style.
        let mut rows: Vec<RowFlow> = Vec::new();
        {
            let mut grid = lock_grid(&self.grid);
            for (row, cols) in plan.rows() {
                let Some(input) = grid.row(row).cloned() else {
                    continue;
                };
                let steps: Vec<(ColumnId, PromptSpec)> = cols
                    .iter()
                    .filter_map(|c| grid.column(*c).map(|col| (*c, col.prompt.clone())))
                    .collect();
                rows.push(RowFlow { row, input, steps });
            }
            for (row, col) in &pairs {
                grid.mark_queued(*row, *col, CellStyle::Flow);
            }
        }

        let completed = Arc::new(AtomicUsize::new(0));
        let grid = Arc::clone(&self.grid);
        let client = Arc::clone(&self.client);
        let limiter = self.limiter.clone();
        let events = self.events.clone();
        let settings = self.settings.clone();
        let worker = self.worker.clone();
        let token = cancel.clone();

        self.worker.spawn(async move {
            emit(&events, EngineEvent::Progress { completed: 0, total }).await;
            for (row, col) in &pairs {
                emit(
                    &events,
                    EngineEvent::CellUpdate {
                        row: *row,
                        col: *col,
                        text: String::new(),
                        is_final: false,
                        style: CellStyle::Flow,
                    },
                )
                .await;
            }

            let handles: Vec<_> = rows
                .into_iter()
                .map(|row_flow| {
                    worker.spawn(process_row(
                        Arc::clone(&grid),
                        Arc::clone(&client),
                        limiter.clone(),
                        events.clone(),
                        settings.clone(),
                        row_flow,
                        token.clone(),
                        Arc::clone(&completed),
                        total,
                    ))
                })
                .collect();

            for (i, result) in join_all(handles).await.into_iter().enumerate() {
                if let Err(e) = result {
                    warn!(row = i, "flow row task panicked: {e}");
                }
            }

            emit(&events, EngineEvent::BatchCompleted { kind: BatchKind::Flow, pairs }).await;
        });

        Ok(cancel)
    }
}

struct RowFlow {
    row: usize,
    input: crate::input::InputItem,
    steps: Vec<(ColumnId, PromptSpec)>,
}

/// Build the user turn for one step.  All-text carryover merges into a single
/// instruction-prefixed blob; image/file turns keep the instruction as a
/// separate leading text part with the non-text parts unchanged.
fn step_user_parts(instruction: &str, current: &[ContentPart]) -> Vec<ContentPart> {
    let all_text = current.iter().all(|p| matches!(p, ContentPart::Text { .. }));
    if all_text {
        let joined = current
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n\n");
        let combined = if instruction.is_empty() {
            joined
        } else {
            format!("{instruction}\n\n---\n\n{joined}")
        };
        vec![ContentPart::text(combined)]
    } else {
        let mut parts = Vec::with_capacity(current.len() + 1);
        if !instruction.is_empty() {
            parts.push(ContentPart::text(instruction));
        }
        parts.extend_from_slice(current);
        parts
    }
}

/// One row's sequential chain: build the initial parts (uploading a file row
/// under a permit), then run each step in order, feeding every completion
/// back into the conversation.
#[allow(clippy::too_many_arguments)]
async fn process_row(
    grid: SharedGrid,
    client: Arc<dyn RemoteClient>,
    limiter: Limiter,
    events: EventSender,
    settings: EngineSettings,
    row_flow: RowFlow,
    cancel: CancelToken,
    completed: Arc<AtomicUsize>,
    total: usize,
) {
    let RowFlow { row, input, steps } = row_flow;

    // Initial input assembly.  An upload failure ends the whole row before
    // any step runs: the first cell shows the error, the rest reset to idle.
    let prepared = prepare_local(&input);
    let initial_parts = {
        let _permit = limiter.acquire().await;
        resolve_parts(client.as_ref(), prepared).await
    };
    let mut current_parts = match initial_parts {
        Ok(parts) => parts,
        Err(e) => {
            if let Some((first_col, _)) = steps.first() {
                let text = format!("{ERROR_PREFIX}{e}");
                lock_grid(&grid).record_final(row, *first_col, text.clone(), CellState::Error);
                emit(
                    &events,
                    EngineEvent::CellUpdate {
                        row,
                        col: *first_col,
                        text,
                        is_final: true,
                        style: CellStyle::Flow,
                    },
                )
                .await;
            }
            notify(
                &events,
                "Flow row failed",
                &format!("row {}: {e}", row + 1),
                NotifyLevel::Error,
            )
            .await;
            skip_remaining(&grid, &events, row, steps.iter().skip(1).map(|(c, _)| *c)).await;
            return;
        }
    };

    let mut conversation: Vec<Message> = Vec::new();

    for (index, (col, prompt)) in steps.iter().enumerate() {
        if cancel.is_cancelled() {
            debug!(row, step = index, "flow cancelled, skipping remaining steps");
            skip_remaining(&grid, &events, row, steps.iter().skip(index).map(|(c, _)| *c)).await;
            return;
        }

        conversation.push(Message::user(step_user_parts(
            &prompt.system_instruction,
            &current_parts,
        )));

        // The model sees the whole conversation so far, not just this turn.
        let outcome = {
            let _permit = limiter.acquire().await;
            let req = request_for(prompt, conversation.clone());
            complete_with_fallback(client.as_ref(), req, settings.call_timeout).await
        };

        let (out_text, state) = match outcome {
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
                    "Flow step failed",
                    &format!("row {}, prompt '{}': {e}", row + 1, prompt.name),
                    NotifyLevel::Error,
                )
                .await;
                (format!("{ERROR_PREFIX}{e}"), CellState::Error)
            }
        };

        lock_grid(&grid).record_final(row, *col, out_text.clone(), state);
        emit(
            &events,
            EngineEvent::CellUpdate {
                row,
                col: *col,
                text: out_text.clone(),
                is_final: true,
                style: CellStyle::Flow,
            },
        )
        .await;
        emit(&events, EngineEvent::StepCompleted { row, col: *col }).await;

        // The step's text — placeholder and error text included — feeds the
        // next step, exactly what the user sees in the cell.
        conversation.push(Message::model_text(out_text.clone()));
        current_parts = vec![ContentPart::text(out_text)];

        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
        emit(&events, EngineEvent::Progress { completed: done, total }).await;
    }
}

/// Reset never-started cells to idle and clear their processing display.
async fn skip_remaining(
    grid: &SharedGrid,
    events: &EventSender,
    row: usize,
    cols: impl Iterator<Item = ColumnId>,
) {
    for col in cols {
        lock_grid(grid).reset_idle(row, col);
        emit(
            events,
            EngineEvent::CellUpdate {
                row,
                col,
                text: String::new(),
                is_final: true,
                style: CellStyle::Flow,
            },
        )
        .await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputItem;

    fn grid_with(rows: usize, cols: usize) -> (MatrixGrid, Vec<ColumnId>) {
        let mut grid = MatrixGrid::new();
        for r in 0..rows {
            grid.add_row(InputItem::Text(format!("row{r}")));
        }
        let ids = (0..cols)
            .map(|i| {
                grid.add_column(PromptSpec::new(
                    format!("P{i}"),
                    "gemini-2.5-flash-lite",
                    format!("instruction {i}"),
                ))
            })
            .collect();
        (grid, ids)
    }

    #[test]
    fn plan_orders_by_display_position_not_selection_order() {
        let (grid, ids) = grid_with(1, 3);
        let plan = FlowPlan::build(&grid, &[(0, ids[2]), (0, ids[0]), (0, ids[1])], 5);
        let rows: Vec<_> = plan.rows().collect();
        assert_eq!(rows[0].1, &[ids[0], ids[1], ids[2]]);
    }

    #[test]
    fn plan_truncates_to_max_steps() {
        let (grid, ids) = grid_with(1, 3);
        let plan = FlowPlan::build(&grid, &[(0, ids[0]), (0, ids[1]), (0, ids[2])], 2);
        assert_eq!(plan.total_steps(), 2);
        let rows: Vec<_> = plan.rows().collect();
        assert_eq!(rows[0].1, &[ids[0], ids[1]]);
    }

    #[test]
    fn plan_excludes_rows_without_selection() {
        let (grid, ids) = grid_with(3, 2);
        let plan = FlowPlan::build(&grid, &[(0, ids[0]), (2, ids[1])], 5);
        let rows: Vec<usize> = plan.rows().map(|(r, _)| r).collect();
        assert_eq!(rows, vec![0, 2]);
    }

    #[test]
    fn plan_follows_reordered_display_positions() {
        let (mut grid, ids) = grid_with(1, 2);
        assert!(grid.reorder_columns(&[ids[1], ids[0]]));
        let plan = FlowPlan::build(&grid, &[(0, ids[0]), (0, ids[1])], 5);
        let rows: Vec<_> = plan.rows().collect();
        // ids[1] now displays first, so it runs first.
        assert_eq!(rows[0].1, &[ids[1], ids[0]]);
    }

    #[test]
    fn empty_selection_builds_empty_plan() {
        let (grid, _) = grid_with(2, 2);
        let plan = FlowPlan::build(&grid, &[], 5);
        assert!(plan.is_empty());
        assert_eq!(plan.total_steps(), 0);
    }

    #[test]
    fn step_user_parts_merges_pure_text_with_instruction_prefix() {
        let parts = step_user_parts(
            "Summarize.",
            &[ContentPart::text("one"), ContentPart::text("two")],
        );
        assert_eq!(parts.len(), 1);
        let text = parts[0].as_text().unwrap();
        assert!(text.starts_with("Summarize.\n\n---\n\n"));
        assert!(text.contains("one\n\ntwo"));
    }

    #[test]
    fn step_user_parts_keeps_non_text_parts_separate() {
        let parts = step_user_parts("Describe.", &[ContentPart::inline_png("QUJD")]);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].as_text(), Some("Describe."));
        assert!(matches!(parts[1], ContentPart::InlinePng { .. }));
    }

    #[test]
    fn step_user_parts_without_instruction_passes_text_through() {
        let parts = step_user_parts("", &[ContentPart::text("payload")]);
        assert_eq!(parts[0].as_text(), Some("payload"));
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::default();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }
}
