// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use clipgrid_config::PromptSpec;
use uuid::Uuid;

use crate::events::CellStyle;
use crate::input::InputItem;

/// Stable identity of a matrix column.
///
/// Cell state is keyed by this identity, never by position: drag-reordering
/// the columns permutes only the display order and can never swap results
/// between prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnId(Uuid);

impl ColumnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ColumnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ColumnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One matrix column: identity plus the prompt snapshot it runs.
#[derive(Debug, Clone)]
pub struct Column {
    pub id: ColumnId,
    pub prompt: PromptSpec,
}

/// Lifecycle of one cell.  Transitions only move forward:
/// `Idle → Queued → Streaming* → Done | Error`; a terminal cell returns to
/// `Queued` only through an explicit re-run reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CellState {
    #[default]
    Idle,
    Queued,
    Streaming,
    Done,
    Error,
}

impl CellState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// One (row, column-identity) result unit.
#[derive(Debug, Clone, Default)]
pub struct Cell {
    pub state: CellState,
    pub partial_text: String,
    pub full_text: String,
    pub style: CellStyle,
}

/// The engines' view of the matrix: input rows, identity-keyed columns, and
/// per-cell state.  Wrapped in [`SharedGrid`] because matrix tasks update
/// their own cells concurrently; ownership is partitioned by `(row, col)`, so
/// the lock only serializes the map accesses themselves.
#[derive(Debug, Default)]
pub struct MatrixGrid {
    rows: Vec<InputItem>,
    columns: Vec<Column>,
    cells: HashMap<(usize, ColumnId), Cell>,
}

pub type SharedGrid = Arc<Mutex<MatrixGrid>>;

/// Lock the shared grid, recovering from poisoning: a panicked cell task must
/// not wedge every later run.
pub(crate) fn lock_grid(grid: &SharedGrid) -> std::sync::MutexGuard<'_, MatrixGrid> {
    grid.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl MatrixGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedGrid {
        Arc::new(Mutex::new(self))
    }

    pub fn add_row(&mut self, item: InputItem) -> usize {
        self.rows.push(item);
        self.rows.len() - 1
    }

    pub fn add_column(&mut self, prompt: PromptSpec) -> ColumnId {
        let id = ColumnId::new();
        self.columns.push(Column { id, prompt });
        id
    }

    pub fn rows(&self) -> &[InputItem] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&InputItem> {
        self.rows.get(index)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, id: ColumnId) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Current display position of a column.
    pub fn column_position(&self, id: ColumnId) -> Option<usize> {
        self.columns.iter().position(|c| c.id == id)
    }

    /// Apply a drag-reorder.  `order` must be a permutation of the current
    /// column identities; on success the columns are re-projected into the
    /// new display order.  Cell state is keyed by identity and is not touched.
    pub fn reorder_columns(&mut self, order: &[ColumnId]) -> bool {
        if order.len() != self.columns.len() {
            return false;
        }
        let mut reordered = Vec::with_capacity(order.len());
        for id in order {
            match self.columns.iter().find(|c| c.id == *id) {
                Some(col) => reordered.push(col.clone()),
                None => return false,
            }
        }
        // Reject duplicate ids smuggled into `order`.
        let mut seen: Vec<ColumnId> = order.to_vec();
        seen.sort();
        seen.dedup();
        if seen.len() != order.len() {
            return false;
        }
        self.columns = reordered;
        true
    }

    pub fn cell(&self, row: usize, col: ColumnId) -> Option<&Cell> {
        self.cells.get(&(row, col))
    }

    /// Final text of a cell that reached `Done`, queried by column identity.
    pub fn result_for(&self, row: usize, col: ColumnId) -> Option<&str> {
        self.cells
            .get(&(row, col))
            .filter(|c| c.state == CellState::Done)
            .map(|c| c.full_text.as_str())
    }

    /// Whether the cell holds any non-empty terminal text (overwrite check).
    pub fn has_result(&self, row: usize, col: ColumnId) -> bool {
        self.cells
            .get(&(row, col))
            .map(|c| c.state.is_terminal() && !c.full_text.is_empty())
            .unwrap_or(false)
    }

    /// Reset a cell to `Queued` for a (re-)run, clearing prior text.
    pub(crate) fn mark_queued(&mut self, row: usize, col: ColumnId, style: CellStyle) {
        let cell = self.cells.entry((row, col)).or_default();
        cell.state = CellState::Queued;
        cell.partial_text.clear();
        cell.full_text.clear();
        cell.style = style;
    }

    /// Record a terminal result.  `state` must be `Done` or `Error`.
    pub(crate) fn record_final(&mut self, row: usize, col: ColumnId, text: String, state: CellState) {
        debug_assert!(state.is_terminal());
        let cell = self.cells.entry((row, col)).or_default();
        cell.state = state;
        cell.partial_text.clear();
        cell.full_text = text;
    }

    /// Return a queued-but-never-started cell to `Idle` (flow cancellation).
    pub(crate) fn reset_idle(&mut self, row: usize, col: ColumnId) {
        if let Some(cell) = self.cells.get_mut(&(row, col)) {
            if cell.state == CellState::Queued {
                cell.state = CellState::Idle;
                cell.partial_text.clear();
                cell.full_text.clear();
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_with_columns(n: usize) -> (MatrixGrid, Vec<ColumnId>) {
        let mut grid = MatrixGrid::new();
        grid.add_row(InputItem::Text("row0".into()));
        let ids = (0..n)
            .map(|i| {
                grid.add_column(PromptSpec::new(
                    format!("P{i}"),
                    "gemini-2.5-flash-lite",
                    "sys",
                ))
            })
            .collect();
        (grid, ids)
    }

    #[test]
    fn cells_default_to_idle() {
        let (grid, ids) = grid_with_columns(1);
        assert!(grid.cell(0, ids[0]).is_none());
        assert!(grid.result_for(0, ids[0]).is_none());
        assert!(!grid.has_result(0, ids[0]));
    }

    #[test]
    fn queued_then_done_records_result() {
        let (mut grid, ids) = grid_with_columns(1);
        grid.mark_queued(0, ids[0], CellStyle::Normal);
        assert_eq!(grid.cell(0, ids[0]).unwrap().state, CellState::Queued);
        grid.record_final(0, ids[0], "X".into(), CellState::Done);
        assert_eq!(grid.result_for(0, ids[0]), Some("X"));
        assert!(grid.has_result(0, ids[0]));
    }

    #[test]
    fn error_cells_have_no_result_but_count_for_overwrite() {
        let (mut grid, ids) = grid_with_columns(1);
        grid.mark_queued(0, ids[0], CellStyle::Normal);
        grid.record_final(0, ids[0], "boom".into(), CellState::Error);
        assert!(grid.result_for(0, ids[0]).is_none());
        assert!(grid.has_result(0, ids[0]));
    }

    #[test]
    fn requeue_clears_prior_text() {
        let (mut grid, ids) = grid_with_columns(1);
        grid.mark_queued(0, ids[0], CellStyle::Normal);
        grid.record_final(0, ids[0], "first".into(), CellState::Done);
        grid.mark_queued(0, ids[0], CellStyle::Normal);
        let cell = grid.cell(0, ids[0]).unwrap();
        assert_eq!(cell.state, CellState::Queued);
        assert!(cell.full_text.is_empty());
    }

    #[test]
    fn reorder_preserves_results_by_identity() {
        let (mut grid, ids) = grid_with_columns(2);
        grid.mark_queued(0, ids[0], CellStyle::Normal);
        grid.record_final(0, ids[0], "X".into(), CellState::Done);
        grid.mark_queued(0, ids[1], CellStyle::Normal);
        grid.record_final(0, ids[1], "Y".into(), CellState::Done);

        assert!(grid.reorder_columns(&[ids[1], ids[0]]));
        assert_eq!(grid.column_position(ids[1]), Some(0));
        // Results still resolve by identity, not position.
        assert_eq!(grid.result_for(0, ids[0]), Some("X"));
        assert_eq!(grid.result_for(0, ids[1]), Some("Y"));
    }

    #[test]
    fn reorder_rejects_non_permutations() {
        let (mut grid, ids) = grid_with_columns(2);
        assert!(!grid.reorder_columns(&[ids[0]]));
        assert!(!grid.reorder_columns(&[ids[0], ids[0]]));
        assert!(!grid.reorder_columns(&[ids[0], ColumnId::new()]));
        // Original order is untouched after rejected reorders.
        assert_eq!(grid.column_position(ids[0]), Some(0));
    }

    #[test]
    fn reset_idle_only_affects_queued_cells() {
        let (mut grid, ids) = grid_with_columns(1);
        grid.mark_queued(0, ids[0], CellStyle::Flow);
        grid.reset_idle(0, ids[0]);
        assert_eq!(grid.cell(0, ids[0]).unwrap().state, CellState::Idle);

        grid.mark_queued(0, ids[0], CellStyle::Flow);
        grid.record_final(0, ids[0], "done".into(), CellState::Done);
        grid.reset_idle(0, ids[0]);
        assert_eq!(grid.cell(0, ids[0]).unwrap().state, CellState::Done);
    }
}
