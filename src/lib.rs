//! patchmark - Patch-grid annotation canvas core
//!
//! The interaction engine of an image annotation tool: shapes, a patch label
//! grid, undo history, and a pointer/keyboard state machine, decoupled from
//! any windowing or drawing toolkit. The host adapter feeds [`Event`]s in
//! and applies the returned [`Effect`]s and [`DrawCommand`]s.

mod ai;
mod canvas;
mod clipboard;
mod config;
mod error;
mod event;
mod geometry;
mod history;
mod patch_grid;
mod render;
mod shape;

pub use ai::{AiError, AiModel, crop_mask, mask_to_bbox};
pub use canvas::{Canvas, CreateMode, HoverState, HoverTarget};
pub use clipboard::GridClipboard;
pub use config::{CanvasConfig, ConfigError, CrosshairConfig, DoubleClickMode};
pub use error::CanvasError;
pub use event::{
    CursorIcon, Effect, Event, HeldButtons, Key, Modifiers, Orientation, PointerButton,
};
pub use geometry::{ImageSize, Point, Rect};
pub use history::{History, Snapshot};
pub use patch_grid::{ClassTag, IntensityTag, LabelGrid, PatchLabel, decode_label_code};
pub use render::{Color, DrawCommand, StrokeStyle, VertexStyle, class_color, wants_redraw};
pub use shape::{HighlightKind, Shape, ShapeId, ShapeKind};
