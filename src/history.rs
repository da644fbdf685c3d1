//! Undo/redo ledger over applied operations (spec §4.6).
//!
//! A ring of [`HistoryEntry`] addressed by sequence number plus a
//! cursor pointing at the last applied entry. `undo` walks the cursor
//! back and replays a stored `previous_state`; `redo` walks it forward
//! and re-applies the stored patch through [`crate::processor`].

use crate::processor::CellOp;
use std::collections::VecDeque;

/// One applied mutation, retained for undo/redo and for reporting which
/// cells it touched.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub sequence_number: u64,
    pub patch: Vec<CellOp>,
    /// Id and state of every touched cell immediately before this entry
    /// applied, as produced by [`crate::processor::apply`]. A `None`
    /// state means the cell didn't exist yet, so undo deletes it.
    pub previous_state: Vec<(uuid::Uuid, Option<crate::diagram::Cell>)>,
}

/// Bounded, cursor-addressed history for a single session (spec §4.6).
///
/// `cursor` indexes into `entries` as "the last entry considered
/// applied" — `None` means nothing has been applied yet, or everything
/// has been undone past the oldest retained entry.
pub struct OperationHistory {
    entries: VecDeque<HistoryEntry>,
    /// Index into `entries` of the most recently applied entry, or
    /// `None` if the cursor sits before `entries[0]`.
    cursor: Option<usize>,
    max_entries: usize,
}

impl OperationHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: None,
            max_entries: max_entries.max(1),
        }
    }

    /// Appends a freshly applied entry and advances the cursor to it.
    /// Any redo tail beyond the cursor is discarded, matching the usual
    /// undo-stack convention: a new edit after an undo forecloses redo.
    pub fn push(&mut self, entry: HistoryEntry) {
        if let Some(cursor) = self.cursor {
            self.entries.truncate(cursor + 1);
        } else {
            self.entries.clear();
        }
        self.entries.push_back(entry);
        self.cursor = Some(self.entries.len() - 1);
        self.evict_if_over_budget();
    }

    /// Drops entries older than `cursor - max_entries/2` once the ring
    /// exceeds `max_entries` (spec §4.6 retention).
    fn evict_if_over_budget(&mut self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let Some(cursor) = self.cursor else { return };
        let keep_from = cursor.saturating_sub(self.max_entries / 2);
        if keep_from == 0 {
            return;
        }
        self.entries.drain(0..keep_from);
        self.cursor = Some(cursor - keep_from);
    }

    pub fn can_undo(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn can_redo(&self) -> bool {
        match self.cursor {
            None => !self.entries.is_empty(),
            Some(c) => c + 1 < self.entries.len(),
        }
    }

    /// The entry to undo (the one at the current cursor), and the
    /// cursor position after undoing moves back one step.
    pub fn undo_request(&mut self) -> Option<&HistoryEntry> {
        let cursor = self.cursor?;
        self.cursor = if cursor == 0 { None } else { Some(cursor - 1) };
        Some(&self.entries[cursor])
    }

    /// The entry to redo (the one immediately after the current
    /// cursor). Does not advance the cursor itself — the caller
    /// advances via [`Self::confirm_redo`] only after a successful
    /// re-application, per spec §4.6's "on apply failure ... leave
    /// cursor unchanged".
    pub fn peek_redo(&self) -> Option<&HistoryEntry> {
        let next = self.cursor.map_or(0, |c| c + 1);
        self.entries.get(next)
    }

    pub fn confirm_redo(&mut self) {
        self.cursor = Some(self.cursor.map_or(0, |c| c + 1));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(seq: u64) -> HistoryEntry {
        HistoryEntry {
            sequence_number: seq,
            patch: vec![CellOp::Remove { id: Uuid::from_u128(seq as u128) }],
            previous_state: vec![(Uuid::from_u128(seq as u128), None)],
        }
    }

    #[test]
    fn fresh_history_cannot_undo_or_redo() {
        let h = OperationHistory::new(100);
        assert!(!h.can_undo());
        assert!(!h.can_redo());
    }

    #[test]
    fn push_then_undo_then_redo_round_trips() {
        let mut h = OperationHistory::new(100);
        h.push(entry(1));
        assert!(h.can_undo());
        assert!(!h.can_redo());

        let undone = h.undo_request().unwrap().sequence_number;
        assert_eq!(undone, 1);
        assert!(!h.can_undo());
        assert!(h.can_redo());

        let redo_target = h.peek_redo().unwrap().sequence_number;
        assert_eq!(redo_target, 1);
        h.confirm_redo();
        assert!(h.can_undo());
        assert!(!h.can_redo());
    }

    #[test]
    fn new_push_after_undo_discards_redo_tail() {
        let mut h = OperationHistory::new(100);
        h.push(entry(1));
        h.push(entry(2));
        h.undo_request();
        h.push(entry(3));
        assert!(!h.can_redo());
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn retention_evicts_oldest_half_over_budget() {
        let mut h = OperationHistory::new(4);
        for i in 0..6 {
            h.push(entry(i));
        }
        assert!(h.len() <= 4);
        assert!(h.can_undo());
    }

    #[test]
    fn redo_with_empty_history_is_none() {
        let h = OperationHistory::new(100);
        assert!(h.peek_redo().is_none());
    }
}
