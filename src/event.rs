//! Input events and output effects of the canvas state machine.
//!
//! The adapter layer translates toolkit events into [`Event`] values (with
//! positions already transformed into image coordinates) and applies the
//! returned [`Effect`]s: notifications for the host, cursor changes, and
//! redraw requests. The core itself never touches the windowing system.

use crate::geometry::Point;
use crate::patch_grid::{ClassTag, IntensityTag};
use crate::shape::ShapeId;

/// A pointer button, named by role rather than by physical layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerButton {
    /// Usually the left button: draw and select.
    Primary,
    /// Usually the right button: menus, shadow-copy drag, box annotation.
    Secondary,
    /// The navigation "back" button.
    Back,
}

/// Which buttons are held during a pointer-move event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeldButtons {
    pub primary: bool,
    pub secondary: bool,
}

/// Keyboard modifier state accompanying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers {
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
}

impl Modifiers {
    pub const NONE: Modifiers = Modifiers { shift: false, ctrl: false, alt: false };
    pub const SHIFT: Modifiers = Modifiers { shift: true, ctrl: false, alt: false };
    pub const CTRL: Modifiers = Modifiers { shift: false, ctrl: true, alt: false };
    pub const ALT: Modifiers = Modifiers { shift: false, ctrl: false, alt: true };

    pub fn none(&self) -> bool {
        !self.shift && !self.ctrl && !self.alt
    }
}

/// Keys the canvas reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Escape,
    Return,
    Space,
    Up,
    Down,
    Left,
    Right,
    /// Class selection, digits 1..=6.
    Digit(u8),
    Q,
    W,
    X,
    U,
    C,
    V,
    Shift,
    Alt,
}

/// Scroll orientation for scroll-request effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Horizontal,
    Vertical,
}

/// A pointer or keyboard event, in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    PointerPressed {
        pos: Point,
        button: PointerButton,
        modifiers: Modifiers,
    },
    PointerMoved {
        pos: Point,
        held: HeldButtons,
        modifiers: Modifiers,
    },
    PointerReleased {
        pos: Point,
        button: PointerButton,
        modifiers: Modifiers,
    },
    DoubleClick {
        pos: Point,
        modifiers: Modifiers,
    },
    KeyPressed {
        key: Key,
        modifiers: Modifiers,
    },
    KeyReleased {
        key: Key,
        modifiers: Modifiers,
    },
    Wheel {
        pos: Point,
        delta_x: f32,
        delta_y: f32,
        modifiers: Modifiers,
    },
}

/// Cursor affordance requested by the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorIcon {
    #[default]
    Default,
    /// Pointing hand: a vertex or edge is under the cursor.
    Point,
    /// Crosshair while drawing.
    Draw,
    /// Closed hand while dragging shapes.
    Move,
    /// Open hand over a movable shape.
    Grab,
}

/// Notifications and side requests emitted by event handling, applied by the
/// adapter after the handler returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// The frame is stale and should be re-rendered.
    Redraw,
    /// A shape was finalized and appended. Patch-annotation shapes bypass
    /// the host's label-prompt dialog.
    NewShape { patch_annotation: bool },
    /// The selected set changed; carries the new selection.
    SelectionChanged(Vec<ShapeId>),
    /// A committed move changed shape geometry.
    ShapeMoved,
    /// Drawing started (`true`) or stopped (`false`).
    DrawingChanged(bool),
    /// Whether a vertex is currently hovered.
    VertexHoverChanged(bool),
    /// The pending class/intensity tag pair changed.
    ClassIntensityChanged {
        class: Option<ClassTag>,
        intensity: Option<IntensityTag>,
    },
    /// The label grid was reset to all-unlabeled.
    GridReset,
    /// The label grid was copied to the clipboard.
    GridCopied,
    /// The clipboard grid was pasted over the live grid.
    GridPasted,
    /// The host should scroll its viewport.
    ScrollRequest { delta: f32, orientation: Orientation },
    /// The host should zoom around a position.
    ZoomRequest { delta: f32, pos: Point },
    /// The pointer "back" button was clicked.
    BackButtonClicked,
    /// A secondary-button release wants a context menu; the host resolves a
    /// pending shadow-copy drag via `end_move` / `cancel_shadow_copy`.
    ContextMenuRequested { has_shadow_copy: bool },
    /// The cursor affordance changed.
    SetCursor(CursorIcon),
}
