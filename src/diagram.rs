//! The collaborative document: [`Diagram`] and its [`Cell`]s.
//!
//! Diagrams are values — the [`crate::processor`] never mutates one in
//! place, it produces a new one that replaces the prior snapshot at the
//! [`crate::store::Store`] boundary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A node or edge within a diagram.
///
/// `id` is a 128-bit UUID; `Uuid::nil()` is never valid (spec §3: "every
/// cell has a non-zero id"). `data` carries shape-specific geometry and
/// metadata the processor does not interpret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: Uuid,
    pub shape: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "zIndex")]
    pub z_index: Option<i64>,
    #[serde(default = "serde_json::Value::default", skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl Cell {
    /// Validate the invariants spec §4.3 requires of every cell: a
    /// non-nil id and a non-empty shape tag. Unknown shapes are rejected
    /// by the caller (the processor), not here — this only checks shape.
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_nil() && !self.shape.trim().is_empty()
    }
}

/// The mutable document owned by a parent threat model and edited
/// through exactly one [`crate::session::Session`] at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagram {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub diagram_type: String,
    pub cells: Vec<Cell>,
}

impl Diagram {
    pub fn new(id: Uuid, name: impl Into<String>, diagram_type: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            diagram_type: diagram_type.into(),
            cells: Vec::new(),
        }
    }

    pub fn find_cell(&self, id: Uuid) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == id)
    }

    /// Cell ids must be unique within a diagram (spec §3 invariant).
    /// Debug-only guard used by tests and the processor's self checks.
    pub fn has_unique_cell_ids(&self) -> bool {
        let mut seen = std::collections::HashSet::with_capacity(self.cells.len());
        self.cells.iter().all(|c| seen.insert(c.id))
    }
}
