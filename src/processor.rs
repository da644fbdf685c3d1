//! Pure patch application over a [`Diagram`] (spec §4.3).
//!
//! `OperationProcessor` never mutates the caller's diagram in place —
//! it clones what it needs to change and hands back a fresh value, the
//! same value-in/value-out shape `clawd::policy::rbac::check_tool_authorized`
//! uses for a decision function with no side effects of its own.

use crate::diagram::{Cell, Diagram};
use crate::store::Store;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use uuid::Uuid;

/// A single cell-level mutation within a `diagram_operation` patch.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum CellOp {
    Add { cell: Cell },
    Update { cell: Cell },
    Remove { id: Uuid },
}

impl CellOp {
    fn cell_id(&self) -> Uuid {
        match self {
            CellOp::Add { cell } | CellOp::Update { cell } => cell.id,
            CellOp::Remove { id } => *id,
        }
    }
}

/// Shapes the processor accepts. Spec §4.3: "unknown shapes are
/// rejected." A set rather than an enum so new shapes can be added
/// without touching the wire format; built once since every
/// `diagram_operation` consults it.
static ALLOWED_SHAPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["process", "store", "actor", "trust-boundary", "data-flow", "text-group"]
        .into_iter()
        .collect()
});

fn shape_allowed(shape: &str) -> bool {
    ALLOWED_SHAPES.contains(shape)
}

/// Why a patch application failed or required correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    CellAlreadyExists,
    UpdateNonexistentCell,
    InvalidCell,
    UnknownShape,
    SaveFailed,
}

/// Result of applying a patch (spec §4.3's named fields).
#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub valid: bool,
    pub reason: Option<Reason>,
    pub conflict_detected: bool,
    pub correction_needed: bool,
    pub state_changed: bool,
    /// Current authoritative state of every cell id touched by the
    /// patch, used both to report what changed and, on conflict, as the
    /// payload for the `state_correction` message.
    pub cells_modified: Vec<Option<Cell>>,
    /// Snapshot of each touched cell, alongside its id, *before* this
    /// patch applied — the undo record. An id paired with `None` means
    /// the cell didn't exist before this patch, so undo must delete it.
    pub previous_state: Vec<(Uuid, Option<Cell>)>,
}

impl ApplyResult {
    /// On rejection nothing in `diagram` has changed, so the current
    /// authoritative state of every id the *whole* patch names — not
    /// just the ids processed before the failing op — doubles as both
    /// `cells_modified` (what the offender's `state_correction`
    /// reports) and `previous_state`.
    fn rejected(reason: Reason, correction_needed: bool, diagram: &Diagram, patch: &[CellOp]) -> Self {
        let current: Vec<(Uuid, Option<Cell>)> =
            patch.iter().map(|op| (op.cell_id(), diagram.find_cell(op.cell_id()).cloned())).collect();
        let cells_modified = current.iter().map(|(_, cell)| cell.clone()).collect();
        Self {
            valid: false,
            reason: Some(reason),
            conflict_detected: correction_needed,
            correction_needed,
            state_changed: false,
            cells_modified,
            previous_state: current,
        }
    }
}

/// Applies a whole patch to `diagram` in memory without touching a
/// [`Store`] — used by undo/redo replays and by [`apply_and_persist`].
///
/// Conflict resolution is whole-patch: the first op that fails aborts
/// the entire patch and nothing already applied is kept (spec §4.3
/// "rejected whole").
pub fn apply(diagram: &Diagram, patch: &[CellOp]) -> (Diagram, ApplyResult) {
    let mut working = diagram.clone();
    let mut cells_modified = Vec::with_capacity(patch.len());
    let mut previous_state = Vec::with_capacity(patch.len());
    let mut state_changed = false;

    for op in patch {
        let id = op.cell_id();
        let before = working.find_cell(id).cloned();

        match op {
            CellOp::Add { cell } => {
                if !cell.is_well_formed() {
                    return (diagram.clone(), ApplyResult::rejected(Reason::InvalidCell, false, diagram, patch));
                }
                if !shape_allowed(&cell.shape) {
                    return (diagram.clone(), ApplyResult::rejected(Reason::UnknownShape, false, diagram, patch));
                }
                if before.is_some() {
                    return (
                        diagram.clone(),
                        ApplyResult::rejected(Reason::CellAlreadyExists, true, diagram, patch),
                    );
                }
                working.cells.push(cell.clone());
                previous_state.push((id, None));
                cells_modified.push(Some(cell.clone()));
                state_changed = true;
            }
            CellOp::Update { cell } => {
                if !cell.is_well_formed() {
                    return (diagram.clone(), ApplyResult::rejected(Reason::InvalidCell, false, diagram, patch));
                }
                if !shape_allowed(&cell.shape) {
                    return (diagram.clone(), ApplyResult::rejected(Reason::UnknownShape, false, diagram, patch));
                }
                let Some(existing) = before.clone() else {
                    return (
                        diagram.clone(),
                        ApplyResult::rejected(Reason::UpdateNonexistentCell, true, diagram, patch),
                    );
                };
                if let Some(slot) = working.cells.iter_mut().find(|c| c.id == id) {
                    if *slot != *cell {
                        *slot = cell.clone();
                        state_changed = true;
                    }
                }
                previous_state.push((id, Some(existing)));
                cells_modified.push(Some(cell.clone()));
            }
            CellOp::Remove { id } => {
                let existed = working.cells.iter().any(|c| c.id == *id);
                if existed {
                    working.cells.retain(|c| c.id != *id);
                    state_changed = true;
                }
                previous_state.push((*id, before));
                cells_modified.push(None);
            }
        }
    }

    let result = ApplyResult {
        valid: true,
        reason: None,
        conflict_detected: false,
        correction_needed: false,
        state_changed,
        cells_modified,
        previous_state,
    };
    (working, result)
}

/// Applies `patch` to the diagram currently held by `store` and, if the
/// result is valid and changed state, persists the new value. On a
/// store failure the caller sees `valid=false, reason=SaveFailed` even
/// though the in-memory application itself succeeded (spec §4.3).
pub async fn apply_and_persist(
    store: &dyn Store,
    diagram_id: Uuid,
    patch: &[CellOp],
) -> Result<ApplyResult, crate::error::StoreError> {
    let current = store.get(diagram_id).await?;
    let (updated, mut result) = apply(&current, patch);

    if result.valid && result.state_changed {
        if let Err(e) = store.update(diagram_id, updated).await {
            result.valid = false;
            result.reason = Some(Reason::SaveFailed);
            result.state_changed = false;
            tracing::error!(%diagram_id, err = %e, "failed to persist diagram after valid patch");
        }
    }

    Ok(result)
}

/// Reads the current authoritative state of every cell id named in
/// `patch`, without applying it — used when a write is denied before
/// reaching the processor so the caller can still report each touched
/// cell's present shape (spec §4.4 step 3).
pub async fn current_cells(
    store: &dyn Store,
    diagram_id: Uuid,
    patch: &[CellOp],
) -> Result<Vec<Option<Cell>>, crate::error::StoreError> {
    let diagram = store.get(diagram_id).await?;
    Ok(patch.iter().map(|op| diagram.find_cell(op.cell_id()).cloned()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn cell(id: u128, shape: &str) -> Cell {
        Cell {
            id: Uuid::from_u128(id),
            shape: shape.to_string(),
            visible: None,
            z_index: None,
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn add_new_cell_succeeds() {
        let d = Diagram::new(Uuid::from_u128(1), "d", "dfd");
        let (updated, result) = apply(&d, &[CellOp::Add { cell: cell(2, "process") }]);
        assert!(result.valid);
        assert!(result.state_changed);
        assert_eq!(updated.cells.len(), 1);
    }

    #[test]
    fn add_duplicate_id_conflicts() {
        let mut d = Diagram::new(Uuid::from_u128(1), "d", "dfd");
        d.cells.push(cell(2, "process"));
        let (updated, result) = apply(&d, &[CellOp::Add { cell: cell(2, "store") }]);
        assert!(!result.valid);
        assert_eq!(result.reason, Some(Reason::CellAlreadyExists));
        assert!(result.correction_needed);
        assert_eq!(updated.cells.len(), 1);
        assert_eq!(updated.cells[0].shape, "process");
    }

    #[test]
    fn update_nonexistent_cell_conflicts() {
        let d = Diagram::new(Uuid::from_u128(1), "d", "dfd");
        let (_, result) = apply(&d, &[CellOp::Update { cell: cell(2, "process") }]);
        assert!(!result.valid);
        assert_eq!(result.reason, Some(Reason::UpdateNonexistentCell));
        assert!(result.correction_needed);
    }

    #[test]
    fn update_identical_cell_does_not_change_state() {
        let mut d = Diagram::new(Uuid::from_u128(1), "d", "dfd");
        d.cells.push(cell(2, "process"));
        let (_, result) = apply(&d, &[CellOp::Update { cell: cell(2, "process") }]);
        assert!(result.valid);
        assert!(!result.state_changed);
    }

    #[test]
    fn remove_missing_cell_is_idempotent_noop() {
        let d = Diagram::new(Uuid::from_u128(1), "d", "dfd");
        let (updated, result) = apply(&d, &[CellOp::Remove { id: Uuid::from_u128(99) }]);
        assert!(result.valid);
        assert!(!result.state_changed);
        assert!(updated.cells.is_empty());
    }

    #[test]
    fn unknown_shape_is_rejected() {
        let d = Diagram::new(Uuid::from_u128(1), "d", "dfd");
        let (_, result) = apply(&d, &[CellOp::Add { cell: cell(2, "wormhole") }]);
        assert!(!result.valid);
        assert_eq!(result.reason, Some(Reason::UnknownShape));
        assert!(!result.correction_needed);
    }

    #[test]
    fn whole_patch_rejected_on_first_conflict() {
        let mut d = Diagram::new(Uuid::from_u128(1), "d", "dfd");
        d.cells.push(cell(2, "process"));
        let patch = vec![
            CellOp::Add { cell: cell(3, "store") },
            CellOp::Add { cell: cell(2, "actor") },
        ];
        let (updated, result) = apply(&d, &patch);
        assert!(!result.valid);
        assert_eq!(updated.cells.len(), 1, "partial application must not survive a rejected patch");
    }

    #[tokio::test]
    async fn apply_and_persist_saves_on_valid_change() {
        let id = Uuid::from_u128(1);
        let store = InMemoryStore::new();
        store.seed(Diagram::new(id, "d", "dfd")).await;
        let result = apply_and_persist(&store, id, &[CellOp::Add { cell: cell(2, "process") }])
            .await
            .unwrap();
        assert!(result.valid);
        let saved = store.get(id).await.unwrap();
        assert_eq!(saved.cells.len(), 1);
    }

    #[tokio::test]
    async fn apply_and_persist_reports_save_failed_on_backend_error() {
        let id = Uuid::from_u128(1);
        let store = InMemoryStore::new();
        store.seed(Diagram::new(id, "d", "dfd")).await;
        store.fail_next_update().await;
        let result = apply_and_persist(&store, id, &[CellOp::Add { cell: cell(2, "process") }])
            .await
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.reason, Some(Reason::SaveFailed));
    }
}
