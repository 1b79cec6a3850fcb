//! Bounded undo history over paired (shapes, label grid) snapshots.
//!
//! Snapshots are pushed *after* every committed edit, so the buffer always
//! holds the current state on top. An edit is undoable only when at least
//! two snapshots exist (current + previous); undoing pops the current one
//! and hands back the previous, which stays on the stack as the new top.

use std::collections::VecDeque;

use crate::patch_grid::LabelGrid;
use crate::shape::Shape;

/// Immutable pair of deep copies taken at commit time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub shapes: Vec<Shape>,
    pub grid: LabelGrid,
}

/// Ring buffer of snapshots with capacity `num_backups + 1` (the current
/// state plus `num_backups` undoable states). The oldest is evicted first.
#[derive(Debug, Clone)]
pub struct History {
    snapshots: VecDeque<Snapshot>,
    capacity: usize,
}

impl History {
    pub fn new(num_backups: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            capacity: num_backups + 1,
        }
    }

    /// Push a snapshot of the given state, evicting the oldest beyond
    /// capacity.
    pub fn commit(&mut self, shapes: &[Shape], grid: &LabelGrid) {
        self.snapshots.push_back(Snapshot {
            shapes: shapes.to_vec(),
            grid: grid.snapshot(),
        });
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }
        log::debug!(
            "history: committed snapshot ({} shapes, {} stored)",
            shapes.len(),
            self.snapshots.len()
        );
    }

    /// True iff at least two snapshots are stored.
    pub fn can_undo(&self) -> bool {
        self.snapshots.len() >= 2
    }

    /// Discard the current snapshot and return a copy of the previous one,
    /// which becomes the new top. Returns `None` when nothing is undoable.
    pub fn undo(&mut self) -> Option<Snapshot> {
        if !self.can_undo() {
            return None;
        }
        self.snapshots.pop_back();
        let restored = self.snapshots.back().cloned();
        log::debug!("history: undo, {} snapshots remain", self.snapshots.len());
        restored
    }

    /// Drop the current snapshot without restoring (used when the top entry
    /// is about to be replaced, e.g. relabeling the last shape).
    pub fn pop_latest(&mut self) -> Option<Snapshot> {
        self.snapshots.pop_back()
    }

    pub fn peek_latest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        log::debug!("history: cleared");
    }
}
