//! Clipboard slot for the patch label grid.
//!
//! The grid copy/paste feature needs a slot that outlives a single canvas.
//! Instead of process-global state, the host owns a [`GridClipboard`] and
//! passes it into [`crate::canvas::Canvas::handle_event`]; sharing one slot
//! across canvases is the host's choice.

use crate::patch_grid::LabelGrid;

/// Holds at most one copied label grid.
#[derive(Debug, Clone, Default)]
pub struct GridClipboard {
    slot: Option<LabelGrid>,
}

impl GridClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a deep copy of the grid.
    pub fn copy(&mut self, grid: &LabelGrid) {
        self.slot = Some(grid.snapshot());
    }

    /// The stored grid, if any.
    pub fn contents(&self) -> Option<&LabelGrid> {
        self.slot.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}
