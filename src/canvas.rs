//! The canvas interaction state machine.
//!
//! [`Canvas`] owns the live shape list, the patch label grid, the undo
//! history, and all transient interaction state (in-progress shape, rubber
//! band, hover target, shadow copies, pending class/intensity tags). Pointer
//! and keyboard events go in through [`Canvas::handle_event`]; notifications
//! for the host come back out as [`Effect`]s. All mutation happens inside
//! event handlers, single-threaded, in arrival order.

use std::collections::HashMap;

use image::RgbaImage;
use ndarray::Array2;

use crate::ai::{self, AiModel};
use crate::clipboard::GridClipboard;
use crate::config::{CanvasConfig, DoubleClickMode};
use crate::error::CanvasError;
use crate::event::{
    CursorIcon, Effect, Event, HeldButtons, Key, Modifiers, Orientation, PointerButton,
};
use crate::geometry::{self, ImageSize, Point};
use crate::history::History;
use crate::patch_grid::{ClassTag, IntensityTag, LabelGrid, label_code_for};
use crate::shape::{HighlightKind, Shape, ShapeId, ShapeKind};

/// Top-level interaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Hovering, selecting, and moving existing shapes.
    Edit,
    /// Drawing a new shape.
    Create,
}

/// What kind of shape a primary-button press starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Polygon,
    Rectangle,
    Circle,
    Line,
    Point,
    LineStrip,
    AiPolygon,
    AiMask,
    PatchAnnotation,
}

impl CreateMode {
    /// The shape kind a new in-progress shape starts with. The AI modes
    /// collect raw point prompts and are refined at finalize time.
    pub fn initial_kind(self) -> ShapeKind {
        match self {
            CreateMode::Polygon => ShapeKind::Polygon,
            CreateMode::Rectangle => ShapeKind::Rectangle,
            CreateMode::Circle => ShapeKind::Circle,
            CreateMode::Line => ShapeKind::Line,
            CreateMode::Point => ShapeKind::Point,
            CreateMode::LineStrip => ShapeKind::LineStrip,
            CreateMode::AiPolygon | CreateMode::AiMask => ShapeKind::Points,
            CreateMode::PatchAnnotation => ShapeKind::PatchAnnotation,
        }
    }

    pub fn is_ai(self) -> bool {
        matches!(self, CreateMode::AiPolygon | CreateMode::AiMask)
    }
}

/// The vertex, edge, or shape currently nearest the pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HoverTarget {
    pub shape: Option<ShapeId>,
    pub vertex: Option<usize>,
    pub edge: Option<usize>,
}

/// Current and previous hover target with a single transition function,
/// replacing scattered two-phase bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HoverState {
    pub current: HoverTarget,
    pub previous: HoverTarget,
}

impl HoverState {
    fn transition(&mut self, next: HoverTarget) {
        self.previous = self.current;
        self.current = next;
    }

    fn clear(&mut self) {
        self.transition(HoverTarget::default());
    }
}

/// The annotation canvas core.
pub struct Canvas {
    pub(crate) config: CanvasConfig,
    mode: Mode,
    create_mode: CreateMode,

    pub(crate) shapes: Vec<Shape>,
    next_id: u64,
    selection: Vec<ShapeId>,
    /// Duplicates of the selection being dragged with the secondary button.
    pub(crate) shadow_copies: Vec<Shape>,
    /// The in-progress shape, if drawing.
    pub(crate) current: Option<Shape>,
    /// Rubber-band preview from the last committed vertex to the pointer.
    pub(crate) line: Shape,

    prev_point: Point,
    pub(crate) prev_move_point: Point,
    /// Selection bounding-box offsets relative to the drag anchor.
    offsets: (Point, Point),
    pub(crate) scale: f32,
    pub(crate) image_size: Option<ImageSize>,

    pub(crate) grid: LabelGrid,
    history: History,
    /// Last rasterized coverage per patch shape, keyed by stable id.
    coverage_cache: HashMap<ShapeId, Array2<bool>>,
    visible: HashMap<ShapeId, bool>,

    hide_background: bool,
    pub(crate) hiding_background: bool,
    pub(crate) shapes_visible: bool,
    pub(crate) hover: HoverState,
    hover_shape_was_selected: bool,
    moving_shape: bool,
    snapping: bool,
    /// Anchor of an active shift+secondary box-annotation drag.
    pub(crate) box_start: Option<Point>,

    class_tag: Option<ClassTag>,
    intensity_tag: Option<IntensityTag>,
    stashed_tags: (Option<ClassTag>, Option<IntensityTag>),

    pub(crate) ai: Option<Box<dyn AiModel>>,
}

impl Canvas {
    pub fn new(config: CanvasConfig) -> Self {
        let grid = LabelGrid::new(config.patch_rows, config.patch_cols);
        let history = History::new(config.num_backups);
        Self {
            mode: Mode::Edit,
            create_mode: CreateMode::PatchAnnotation,
            shapes: Vec::new(),
            next_id: 0,
            selection: Vec::new(),
            shadow_copies: Vec::new(),
            current: None,
            line: Shape::new(ShapeId(0), ShapeKind::Line),
            prev_point: Point::default(),
            prev_move_point: Point::default(),
            offsets: (Point::default(), Point::default()),
            scale: 1.0,
            image_size: None,
            grid,
            history,
            coverage_cache: HashMap::new(),
            visible: HashMap::new(),
            hide_background: false,
            hiding_background: false,
            shapes_visible: true,
            hover: HoverState::default(),
            hover_shape_was_selected: false,
            moving_shape: false,
            snapping: true,
            box_start: None,
            class_tag: None,
            intensity_tag: None,
            stashed_tags: (None, None),
            ai: None,
            config,
        }
    }

    // ========================================================================
    // Host-facing state accessors
    // ========================================================================

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn selection(&self) -> &[ShapeId] {
        &self.selection
    }

    pub fn label_grid(&self) -> &LabelGrid {
        &self.grid
    }

    /// Mutable grid access for host-driven cell edits (e.g. clicking a cell
    /// in a grid inspector). The host is responsible for redrawing.
    pub fn label_grid_mut(&mut self) -> &mut LabelGrid {
        &mut self.grid
    }

    pub fn current_shape(&self) -> Option<&Shape> {
        self.current.as_ref()
    }

    pub fn hover(&self) -> &HoverState {
        &self.hover
    }

    pub fn pending_tags(&self) -> (Option<ClassTag>, Option<IntensityTag>) {
        (self.class_tag, self.intensity_tag)
    }

    pub fn is_drawing(&self) -> bool {
        self.mode == Mode::Create
    }

    pub fn is_editing(&self) -> bool {
        self.mode == Mode::Edit
    }

    pub fn create_mode(&self) -> CreateMode {
        self.create_mode
    }

    pub fn set_create_mode(&mut self, mode: CreateMode) {
        self.create_mode = mode;
    }

    /// Switch between edit and create mode. Leaving edit mode clears the
    /// hover target and the selection.
    pub fn set_editing(&mut self, editing: bool) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.mode = if editing { Mode::Edit } else { Mode::Create };
        if editing {
            effects.push(Effect::Redraw);
        } else {
            self.un_highlight();
            self.deselect_shapes(&mut effects);
        }
        effects
    }

    pub fn set_scale(&mut self, scale: f32) {
        self.scale = scale.max(f32::EPSILON);
    }

    pub fn set_fill_drawing(&mut self, value: bool) {
        self.config.fill_drawing = value;
    }

    pub fn fill_drawing(&self) -> bool {
        self.config.fill_drawing
    }

    pub fn shapes_visible(&self) -> bool {
        self.shapes_visible
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    /// Install the AI capability, pointing it at the current image if one is
    /// already loaded.
    pub fn install_ai_model(
        &mut self,
        mut model: Box<dyn AiModel>,
        image: Option<&RgbaImage>,
    ) -> Result<(), CanvasError> {
        log::debug!("installing AI model: {}", model.name());
        if let Some(image) = image {
            model.set_image(image)?;
        }
        self.ai = Some(model);
        Ok(())
    }

    pub fn is_visible(&self, id: ShapeId) -> bool {
        self.visible.get(&id).copied().unwrap_or(true)
    }

    pub fn set_shape_visible(&mut self, id: ShapeId, value: bool) {
        self.visible.insert(id, value);
    }

    /// Dim non-selected shapes while a selection exists.
    pub fn hide_background_shapes(&mut self, value: bool) {
        self.hide_background = value;
        if !self.selection.is_empty() {
            self.set_hiding(true);
        }
    }

    fn set_hiding(&mut self, enable: bool) {
        self.hiding_background = enable && self.hide_background;
    }

    fn hit_epsilon(&self) -> f32 {
        self.config.epsilon / self.scale
    }

    fn alloc_id(&mut self) -> ShapeId {
        self.next_id += 1;
        ShapeId(self.next_id)
    }

    fn shape_index(&self, id: ShapeId) -> Option<usize> {
        self.shapes.iter().position(|s| s.id() == id)
    }

    fn commit(&mut self) {
        self.history.commit(&self.shapes, &self.grid);
    }

    // ========================================================================
    // Event dispatch
    // ========================================================================

    /// Feed one event through the state machine. Returns the effects the
    /// adapter must apply; errors leave every committed state intact.
    pub fn handle_event(
        &mut self,
        event: Event,
        clipboard: &mut GridClipboard,
    ) -> Result<Vec<Effect>, CanvasError> {
        let mut effects = Vec::new();
        match event {
            Event::PointerPressed { pos, button, modifiers } => {
                self.pointer_pressed(pos, button, modifiers, &mut effects)?;
            }
            Event::PointerMoved { pos, held, modifiers } => {
                self.pointer_moved(pos, held, modifiers, &mut effects)?;
            }
            Event::PointerReleased { pos, button, .. } => {
                self.pointer_released(pos, button, &mut effects)?;
            }
            Event::DoubleClick { .. } => {
                self.double_click(&mut effects)?;
            }
            Event::KeyPressed { key, modifiers } => {
                self.key_pressed(key, modifiers, clipboard, &mut effects)?;
            }
            Event::KeyReleased { key, modifiers } => {
                self.key_released(key, modifiers, &mut effects)?;
            }
            Event::Wheel { pos, delta_x, delta_y, modifiers } => {
                if modifiers.ctrl {
                    effects.push(Effect::ZoomRequest { delta: delta_y, pos });
                } else {
                    if delta_x != 0.0 {
                        effects.push(Effect::ScrollRequest {
                            delta: delta_x,
                            orientation: Orientation::Horizontal,
                        });
                    }
                    if delta_y != 0.0 {
                        let orientation = if modifiers.shift {
                            Orientation::Horizontal
                        } else {
                            Orientation::Vertical
                        };
                        effects.push(Effect::ScrollRequest { delta: delta_y, orientation });
                    }
                }
            }
        }
        Ok(effects)
    }

    // ========================================================================
    // Pointer handling
    // ========================================================================

    fn pointer_pressed(
        &mut self,
        pos: Point,
        button: PointerButton,
        modifiers: Modifiers,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CanvasError> {
        if button == PointerButton::Back {
            effects.push(Effect::BackButtonClicked);
            return Ok(());
        }

        // Shift+secondary starts the box-annotation overlay.
        if button == PointerButton::Secondary && modifiers.shift {
            self.box_start = Some(pos);
            self.line.set_kind(ShapeKind::Rectangle);
            self.line.set_points_with_labels(vec![pos, pos], vec![1, 1]);
            effects.push(Effect::Redraw);
            return Ok(());
        }

        match button {
            PointerButton::Primary if self.is_drawing() => {
                self.press_while_drawing(pos, modifiers, effects)?;
            }
            PointerButton::Primary => {
                if self.hover.current.edge.is_some() {
                    self.add_point_to_edge(effects);
                } else if self.hover.current.vertex.is_some() && modifiers == Modifiers::SHIFT {
                    self.remove_selected_point(effects);
                }
                let group_mode = modifiers == Modifiers::CTRL;
                self.select_shape_at(pos, group_mode, effects);
                self.prev_point = pos;
            }
            PointerButton::Secondary if self.is_editing() => {
                let group_mode = modifiers == Modifiers::CTRL;
                let hovered_outside_selection = self
                    .hover
                    .current
                    .shape
                    .is_some_and(|id| !self.selection.contains(&id));
                if self.selection.is_empty() || hovered_outside_selection {
                    self.select_shape_at(pos, group_mode, effects);
                }
                self.prev_point = pos;
            }
            _ => {}
        }
        Ok(())
    }

    fn press_while_drawing(
        &mut self,
        pos: Point,
        modifiers: Modifiers,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CanvasError> {
        if self.current.is_some() {
            let mut finalize = false;
            let line_end = self.line.points().get(1).copied();
            let line_end_label = self.line.point_labels().get(1).copied().unwrap_or(1);
            if let Some(current) = self.current.as_mut() {
                match self.create_mode {
                    CreateMode::Polygon => {
                        if let Some(p) = line_end {
                            current.add_point(p, 1);
                        }
                        if let Some(last) = current.points().last().copied() {
                            self.line.set_point(0, last);
                        }
                        finalize = current.is_closed();
                    }
                    CreateMode::Rectangle | CreateMode::Circle | CreateMode::Line => {
                        debug_assert_eq!(current.points().len(), 1);
                        current.set_points_with_labels(
                            self.line.points().to_vec(),
                            vec![1; self.line.points().len()],
                        );
                        finalize = true;
                    }
                    CreateMode::LineStrip => {
                        if let Some(p) = line_end {
                            current.add_point(p, 1);
                        }
                        if let Some(last) = current.points().last().copied() {
                            self.line.set_point(0, last);
                        }
                        finalize = modifiers == Modifiers::CTRL;
                    }
                    CreateMode::AiPolygon | CreateMode::AiMask => {
                        if let Some(p) = line_end {
                            current.add_point(p, line_end_label);
                        }
                        if let Some(last) = current.points().last().copied() {
                            self.line.set_point(0, last);
                        }
                        if let Some(label) = current.point_labels().last().copied() {
                            self.line.set_point_label(0, label);
                        }
                        finalize = modifiers.ctrl;
                    }
                    CreateMode::PatchAnnotation if modifiers.shift => {
                        if let Some(p) = line_end {
                            current.add_point(p, 1);
                        }
                        if let Some(last) = current.points().last().copied() {
                            self.line.set_point(0, last);
                        }
                    }
                    CreateMode::PatchAnnotation | CreateMode::Point => {}
                }
            }
            if finalize {
                self.finalise(effects)?;
            }
            effects.push(Effect::Redraw);
            return Ok(());
        }

        let Some(size) = self.image_size else {
            return Ok(());
        };
        if size.out_of_bounds(&pos) {
            return Ok(());
        }

        // Start a new shape.
        let id = self.alloc_id();
        let mut shape = Shape::new(id, self.create_mode.initial_kind());
        shape.add_point(pos, if modifiers.shift { 0 } else { 1 });
        self.current = Some(shape);
        log::debug!("started {:?} shape at ({}, {})", self.create_mode, pos.x, pos.y);

        match self.create_mode {
            CreateMode::Point => {
                self.finalise(effects)?;
            }
            CreateMode::PatchAnnotation => {
                if modifiers.shift {
                    self.line.set_kind(ShapeKind::PatchAnnotation);
                    self.line.set_points_with_labels(vec![pos, pos], vec![1, 1]);
                    self.set_hiding(true);
                    effects.push(Effect::DrawingChanged(true));
                } else {
                    // A plain press stamps a single-patch shape.
                    self.finalise(effects)?;
                }
            }
            CreateMode::AiPolygon | CreateMode::AiMask if modifiers.ctrl => {
                self.finalise(effects)?;
            }
            _ => {
                let labels = if self.create_mode.is_ai() && modifiers.shift {
                    vec![0, 0]
                } else {
                    vec![1, 1]
                };
                self.line.set_kind(self.create_mode.initial_kind());
                self.line.set_points_with_labels(vec![pos, pos], labels);
                self.set_hiding(true);
                effects.push(Effect::DrawingChanged(true));
            }
        }
        effects.push(Effect::Redraw);
        Ok(())
    }

    fn pointer_moved(
        &mut self,
        pos: Point,
        held: HeldButtons,
        modifiers: Modifiers,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CanvasError> {
        self.prev_move_point = pos;

        // Box-annotation overlay: live rectangle preview.
        if let Some(start) = self.box_start {
            self.line.set_kind(ShapeKind::Rectangle);
            self.line.set_points_with_labels(vec![start, pos], vec![1, 1]);
            effects.push(Effect::SetCursor(CursorIcon::Draw));
            effects.push(Effect::Redraw);
            return Ok(());
        }

        // Freehand patch painting while shift is held.
        if self.is_drawing()
            && self.create_mode == CreateMode::PatchAnnotation
            && modifiers.shift
        {
            effects.push(Effect::SetCursor(CursorIcon::Draw));
            if self.current.is_none() {
                return Ok(());
            }
            let pos = self.clamp_to_image(pos)?;
            if let Some(current) = self.current.as_mut() {
                current.add_point(pos, 1);
            }
            effects.push(Effect::Redraw);
            return Ok(());
        }

        if self.is_drawing() {
            self.move_while_drawing(pos, modifiers, effects)?;
            return Ok(());
        }

        // Shadow-copy drag with the secondary button.
        if held.secondary {
            if !self.shadow_copies.is_empty() {
                effects.push(Effect::SetCursor(CursorIcon::Move));
                self.bounded_move_shadow_copies(pos);
                effects.push(Effect::Redraw);
            } else if !self.selection.is_empty() {
                self.shadow_copies = self
                    .selection
                    .iter()
                    .filter_map(|id| self.shape_index(*id))
                    .map(|i| self.shapes[i].clone())
                    .collect();
                effects.push(Effect::Redraw);
            }
            return Ok(());
        }

        // Vertex or selection drag with the primary button.
        if held.primary {
            if self.hover.current.vertex.is_some() {
                self.bounded_move_vertex(pos)?;
                self.moving_shape = true;
                effects.push(Effect::Redraw);
            } else if !self.selection.is_empty() {
                effects.push(Effect::SetCursor(CursorIcon::Move));
                self.bounded_move_selection(pos);
                self.moving_shape = true;
                effects.push(Effect::Redraw);
            }
            return Ok(());
        }

        self.update_hover(pos, effects);
        Ok(())
    }

    fn move_while_drawing(
        &mut self,
        pos: Point,
        modifiers: Modifiers,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CanvasError> {
        let line_kind = if self.create_mode.is_ai() {
            ShapeKind::Points
        } else {
            self.create_mode.initial_kind()
        };
        self.line.set_kind(line_kind);
        effects.push(Effect::SetCursor(CursorIcon::Draw));

        let (first, last, len) = match self.current.as_ref() {
            Some(current) => (
                current.points().first().copied(),
                current.points().last().copied(),
                current.points().len(),
            ),
            None => {
                // Still draws the crosshair.
                effects.push(Effect::Redraw);
                return Ok(());
            }
        };

        let mut pos = pos;
        let mut cursor = CursorIcon::Draw;
        if self.image_size.is_some_and(|size| size.out_of_bounds(&pos)) {
            // Don't allow drawing outside the image; project the point onto
            // its boundary.
            if let Some(last) = last {
                pos = self.project_to_boundary(&last, &pos)?;
            }
        } else if self.snapping && len > 1 && self.create_mode == CreateMode::Polygon {
            if let Some(first) = first {
                if geometry::close_enough(&pos, &first, self.hit_epsilon()) {
                    // Attract the line to the start point and alert the user.
                    pos = first;
                    cursor = CursorIcon::Point;
                    if let Some(current) = self.current.as_mut() {
                        current.highlight_vertex(0, HighlightKind::NearVertex);
                    }
                }
            }
        }

        let last_label = self
            .current
            .as_ref()
            .and_then(|c| c.point_labels().last().copied())
            .unwrap_or(1);
        match self.create_mode {
            CreateMode::Polygon | CreateMode::LineStrip => {
                if let Some(last) = last {
                    self.line.set_points_with_labels(vec![last, pos], vec![1, 1]);
                }
            }
            CreateMode::AiPolygon | CreateMode::AiMask => {
                if let Some(last) = last {
                    let label = if modifiers.shift { 0 } else { 1 };
                    self.line
                        .set_points_with_labels(vec![last, pos], vec![last_label, label]);
                }
            }
            CreateMode::Rectangle | CreateMode::Line => {
                if let Some(first) = first {
                    self.line.set_points_with_labels(vec![first, pos], vec![1, 1]);
                }
            }
            CreateMode::Circle => {
                if let Some(first) = first {
                    self.line.set_points_with_labels(vec![first, pos], vec![1, 1]);
                    self.line.set_kind(ShapeKind::Circle);
                }
            }
            CreateMode::Point => {
                if let Some(first) = first {
                    self.line.set_points_with_labels(vec![first], vec![1]);
                }
            }
            CreateMode::PatchAnnotation => {}
        }

        debug_assert_eq!(self.line.points().len(), self.line.point_labels().len());
        if let Some(current) = self.current.as_mut() {
            if cursor != CursorIcon::Point {
                current.highlight_clear();
            }
        }
        effects.push(Effect::SetCursor(cursor));
        effects.push(Effect::Redraw);
        Ok(())
    }

    /// Hit-test shapes in reverse z-order (topmost last-drawn first) and
    /// update the hover target and cursor affordance.
    fn update_hover(&mut self, pos: Point, effects: &mut Vec<Effect>) {
        enum Hit {
            Vertex(usize, usize),
            Edge(usize, usize),
            Inside(usize),
        }

        let epsilon = self.hit_epsilon();
        let mut hit = None;
        for index in (0..self.shapes.len()).rev() {
            let shape = &self.shapes[index];
            if !self.is_visible(shape.id()) {
                continue;
            }
            if let Some(v) = shape.nearest_vertex(&pos, epsilon) {
                hit = Some(Hit::Vertex(index, v));
                break;
            }
            if let Some(e) = shape.nearest_edge(&pos, epsilon) {
                if shape.can_add_point() {
                    hit = Some(Hit::Edge(index, e));
                    break;
                }
            }
            if shape.contains_point(&pos) {
                hit = Some(Hit::Inside(index));
                break;
            }
        }

        match hit {
            Some(Hit::Vertex(index, v)) => {
                self.clear_hover_highlight();
                let id = self.shapes[index].id();
                self.shapes[index].highlight_vertex(v, HighlightKind::MoveVertex);
                self.hover.transition(HoverTarget {
                    shape: Some(id),
                    vertex: Some(v),
                    edge: None,
                });
                effects.push(Effect::SetCursor(CursorIcon::Point));
                effects.push(Effect::Redraw);
            }
            Some(Hit::Edge(index, e)) => {
                self.clear_hover_highlight();
                let id = self.shapes[index].id();
                self.hover.transition(HoverTarget {
                    shape: Some(id),
                    vertex: None,
                    edge: Some(e),
                });
                effects.push(Effect::SetCursor(CursorIcon::Point));
                effects.push(Effect::Redraw);
            }
            Some(Hit::Inside(index)) => {
                self.clear_hover_highlight();
                let id = self.shapes[index].id();
                self.hover.transition(HoverTarget {
                    shape: Some(id),
                    vertex: None,
                    edge: None,
                });
                effects.push(Effect::SetCursor(CursorIcon::Grab));
                effects.push(Effect::Redraw);
            }
            None => {
                self.un_highlight();
                effects.push(Effect::SetCursor(CursorIcon::Default));
            }
        }
        effects.push(Effect::VertexHoverChanged(self.hover.current.vertex.is_some()));
    }

    fn clear_hover_highlight(&mut self) {
        if let Some(id) = self.hover.current.shape {
            if let Some(index) = self.shape_index(id) {
                self.shapes[index].highlight_clear();
            }
        }
    }

    fn un_highlight(&mut self) {
        self.clear_hover_highlight();
        self.hover.clear();
    }

    fn pointer_released(
        &mut self,
        pos: Point,
        button: PointerButton,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CanvasError> {
        // Resolve the box-annotation overlay.
        if let Some(start) = self.box_start {
            if button == PointerButton::Secondary {
                self.annotate_with_box(start, pos, effects)?;
                self.box_start = None;
                effects.push(Effect::Redraw);
                return Ok(());
            }
        }

        if button == PointerButton::Secondary {
            effects.push(Effect::ContextMenuRequested {
                has_shadow_copy: !self.shadow_copies.is_empty(),
            });
        } else if button == PointerButton::Primary && self.is_editing() {
            // Clicking an already-selected shape without moving it removes
            // it from the selection.
            if let Some(id) = self.hover.current.shape {
                if self.hover_shape_was_selected && !self.moving_shape {
                    self.selection.retain(|s| *s != id);
                    if let Some(index) = self.shape_index(id) {
                        self.shapes[index].selected = false;
                    }
                    effects.push(Effect::SelectionChanged(self.selection.clone()));
                }
            }
        }

        if self.moving_shape {
            if let Some(id) = self.hover.current.shape {
                if self.shape_geometry_changed(id) {
                    self.commit();
                    effects.push(Effect::ShapeMoved);
                }
            }
            self.moving_shape = false;
        }
        Ok(())
    }

    /// Whether a shape's points differ from the top history snapshot.
    fn shape_geometry_changed(&self, id: ShapeId) -> bool {
        let Some(index) = self.shape_index(id) else {
            return false;
        };
        match self.history.peek_latest() {
            Some(snapshot) => snapshot
                .shapes
                .iter()
                .find(|s| s.id() == id)
                .is_none_or(|s| s.points() != self.shapes[index].points()),
            None => true,
        }
    }

    fn double_click(&mut self, effects: &mut Vec<Effect>) -> Result<(), CanvasError> {
        if self.config.double_click != DoubleClickMode::Close {
            return Ok(());
        }
        let closable_polygon =
            self.create_mode == CreateMode::Polygon && self.can_close_shape();
        if (closable_polygon || self.create_mode.is_ai()) && self.current.is_some() {
            self.finalise(effects)?;
        }
        Ok(())
    }

    pub fn can_close_shape(&self) -> bool {
        self.is_drawing()
            && self
                .current
                .as_ref()
                .is_some_and(|c| c.points().len() > 2)
    }

    // ========================================================================
    // Keyboard handling
    // ========================================================================

    fn key_pressed(
        &mut self,
        key: Key,
        modifiers: Modifiers,
        clipboard: &mut GridClipboard,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CanvasError> {
        if key == Key::U {
            self.grid.reset();
            log::debug!("label grid reset");
            effects.push(Effect::GridReset);
            effects.push(Effect::Redraw);
        }
        if modifiers.ctrl {
            match key {
                Key::C => {
                    clipboard.copy(&self.grid);
                    effects.push(Effect::GridCopied);
                }
                Key::V => {
                    if let Some(stored) = clipboard.contents() {
                        self.grid = stored.snapshot();
                        effects.push(Effect::GridPasted);
                        effects.push(Effect::Redraw);
                    }
                }
                _ => {}
            }
        }
        if key == Key::Space {
            self.shapes_visible = !self.shapes_visible;
            effects.push(Effect::Redraw);
        }

        if self.is_drawing() {
            match key {
                Key::Escape if self.current.is_some() => {
                    self.current = None;
                    log::debug!("drawing aborted");
                    effects.push(Effect::DrawingChanged(false));
                    effects.push(Effect::Redraw);
                }
                Key::Return if self.can_close_shape() => {
                    self.finalise(effects)?;
                }
                _ if modifiers.alt => {
                    self.snapping = false;
                }
                _ => {
                    if self.apply_tag_key(key) {
                        self.emit_tags_if_set(effects);
                    }
                }
            }
        } else {
            let step = self.config.move_step;
            match key {
                Key::Up => self.move_by_keyboard(Point::new(0.0, -step), effects),
                Key::Down => self.move_by_keyboard(Point::new(0.0, step), effects),
                Key::Left => self.move_by_keyboard(Point::new(-step, 0.0), effects),
                Key::Right => self.move_by_keyboard(Point::new(step, 0.0), effects),
                _ => {
                    if self.apply_tag_key(key) {
                        self.emit_tags_if_set(effects);
                    }
                }
            }
        }
        Ok(())
    }

    /// Update the pending tag pair. A digit or Q/W only touches its own half
    /// of the pair; X stashes the pair and switches to the eraser until its
    /// release. Returns whether the pair changed.
    fn apply_tag_key(&mut self, key: Key) -> bool {
        match key {
            Key::Digit(n) if (1..=6).contains(&n) => {
                self.class_tag = Some(ClassTag::Class(n));
                true
            }
            Key::Q => {
                self.intensity_tag = Some(IntensityTag::Blurry);
                true
            }
            Key::W => {
                self.intensity_tag = Some(IntensityTag::Blockage);
                true
            }
            Key::X => {
                if self.class_tag.is_some() && self.class_tag != Some(ClassTag::Clean) {
                    self.stashed_tags = (self.class_tag, self.intensity_tag);
                }
                self.class_tag = Some(ClassTag::Clean);
                self.intensity_tag = Some(IntensityTag::Clean);
                true
            }
            _ => false,
        }
    }

    fn emit_tags_if_set(&mut self, effects: &mut Vec<Effect>) {
        if self.class_tag.is_none() && self.intensity_tag.is_none() {
            return;
        }
        // A Clean intensity only makes sense with the Clean class; paired
        // with a real class it degrades to the first tier.
        if self.class_tag != Some(ClassTag::Clean)
            && self.intensity_tag == Some(IntensityTag::Clean)
        {
            self.intensity_tag = Some(IntensityTag::Blurry);
        }
        effects.push(Effect::ClassIntensityChanged {
            class: self.class_tag,
            intensity: self.intensity_tag,
        });
    }

    fn key_released(
        &mut self,
        key: Key,
        modifiers: Modifiers,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CanvasError> {
        if key == Key::Shift {
            if self.box_start.is_some() {
                // Releasing the modifier cancels box-annotation mode.
                self.box_start = None;
                effects.push(Effect::Redraw);
            }
            if self.create_mode == CreateMode::PatchAnnotation && self.current.is_some() {
                self.finalise(effects)?;
            }
        }
        if key == Key::X {
            self.class_tag = self.stashed_tags.0;
            self.intensity_tag = self.stashed_tags.1;
            self.emit_tags_if_set(effects);
        }

        if self.is_drawing() {
            if modifiers.none() {
                self.snapping = true;
            }
        } else if self.moving_shape && !self.selection.is_empty() {
            let first = self.selection[0];
            if self.shape_geometry_changed(first) {
                self.commit();
                effects.push(Effect::ShapeMoved);
            }
            self.moving_shape = false;
        }
        Ok(())
    }

    fn move_by_keyboard(&mut self, offset: Point, effects: &mut Vec<Effect>) {
        if !self.selection.is_empty() {
            self.bounded_move_selection(self.prev_point + offset);
            self.moving_shape = true;
            effects.push(Effect::Redraw);
        }
    }

    // ========================================================================
    // Selection and movement
    // ========================================================================

    /// Select the topmost shape containing `point`. A hovered vertex keeps
    /// the existing selection and only re-highlights the grab target.
    fn select_shape_at(&mut self, point: Point, multiple: bool, effects: &mut Vec<Effect>) {
        if let (Some(id), Some(v)) = (self.hover.current.shape, self.hover.current.vertex) {
            if let Some(index) = self.shape_index(id) {
                self.shapes[index].highlight_vertex(v, HighlightKind::MoveVertex);
            }
            return;
        }
        for index in (0..self.shapes.len()).rev() {
            let id = self.shapes[index].id();
            if !self.is_visible(id) || !self.shapes[index].contains_point(&point) {
                continue;
            }
            self.set_hiding(true);
            if !self.selection.contains(&id) {
                if multiple {
                    self.selection.push(id);
                } else {
                    for sid in std::mem::take(&mut self.selection) {
                        if let Some(i) = self.shape_index(sid) {
                            self.shapes[i].selected = false;
                        }
                    }
                    self.selection = vec![id];
                }
                self.shapes[index].selected = true;
                self.hover_shape_was_selected = false;
                effects.push(Effect::SelectionChanged(self.selection.clone()));
            } else {
                self.hover_shape_was_selected = true;
            }
            self.calculate_offsets(point);
            return;
        }
        self.deselect_shapes(effects);
    }

    /// Select shapes by id (host API, e.g. from a shape list panel).
    pub fn select_shapes(&mut self, ids: &[ShapeId]) -> Vec<Effect> {
        let mut effects = Vec::new();
        for shape in &mut self.shapes {
            shape.selected = ids.contains(&shape.id());
        }
        self.selection = ids.to_vec();
        self.set_hiding(true);
        effects.push(Effect::SelectionChanged(self.selection.clone()));
        effects.push(Effect::Redraw);
        effects
    }

    fn deselect_shapes(&mut self, effects: &mut Vec<Effect>) {
        if self.selection.is_empty() {
            return;
        }
        for sid in std::mem::take(&mut self.selection) {
            if let Some(i) = self.shape_index(sid) {
                self.shapes[i].selected = false;
            }
        }
        self.set_hiding(false);
        self.hover_shape_was_selected = false;
        effects.push(Effect::SelectionChanged(Vec::new()));
        effects.push(Effect::Redraw);
    }

    /// Record the selection bounding box relative to the drag anchor so
    /// later moves can clamp against the image bounds.
    fn calculate_offsets(&mut self, point: Point) {
        let Some(size) = self.image_size else {
            return;
        };
        let mut left = (size.width - 1) as f32;
        let mut right = 0.0f32;
        let mut top = (size.height - 1) as f32;
        let mut bottom = 0.0f32;
        for id in &self.selection {
            let Some(index) = self.shape_index(*id) else {
                continue;
            };
            if let Some(rect) = self.shapes[index].bounding_rect() {
                left = left.min(rect.left());
                right = right.max(rect.right());
                top = top.min(rect.top());
                bottom = bottom.max(rect.bottom());
            }
        }
        self.offsets = (
            Point::new(left - point.x, top - point.y),
            Point::new(right - point.x, bottom - point.y),
        );
    }

    fn project_to_boundary(&self, inside: &Point, outside: &Point) -> Result<Point, CanvasError> {
        let size = self.image_size.ok_or(CanvasError::ImageMissing)?;
        geometry::intersection_point(inside, outside, &size)
            .ok_or(CanvasError::NoBoundaryCrossing)
    }

    fn clamp_to_image(&self, pos: Point) -> Result<Point, CanvasError> {
        match self.image_size {
            Some(size) if size.out_of_bounds(&pos) => {
                let last = self
                    .current
                    .as_ref()
                    .and_then(|c| c.points().last().copied())
                    .unwrap_or(pos);
                self.project_to_boundary(&last, &pos)
            }
            _ => Ok(pos),
        }
    }

    fn bounded_move_vertex(&mut self, pos: Point) -> Result<(), CanvasError> {
        let (Some(id), Some(v)) = (self.hover.current.shape, self.hover.current.vertex) else {
            return Ok(());
        };
        let Some(index) = self.shape_index(id) else {
            return Ok(());
        };
        let Some(point) = self.shapes[index].points().get(v).copied() else {
            return Ok(());
        };
        let pos = if self.image_size.is_some_and(|s| s.out_of_bounds(&pos)) {
            self.project_to_boundary(&point, &pos)?
        } else {
            pos
        };
        self.shapes[index].move_vertex_by(v, pos - point);
        Ok(())
    }

    /// Clamp a drag target so the selection's combined bounding box never
    /// fully leaves the image, then return the applied delta, if any.
    fn bounded_target(&self, pos: Point) -> Option<Point> {
        let size = self.image_size?;
        if size.out_of_bounds(&pos) {
            return None;
        }
        let w = (size.width - 1) as f32;
        let h = (size.height - 1) as f32;
        let mut pos = pos;
        let o1 = pos + self.offsets.0;
        if size.out_of_bounds(&o1) {
            pos = pos - Point::new(o1.x.min(0.0), o1.y.min(0.0));
        }
        let o2 = pos + self.offsets.1;
        if size.out_of_bounds(&o2) {
            pos = pos + Point::new((w - o2.x).min(0.0), (h - o2.y).min(0.0));
        }
        Some(pos)
    }

    fn bounded_move_selection(&mut self, pos: Point) -> bool {
        let Some(pos) = self.bounded_target(pos) else {
            return false;
        };
        let delta = pos - self.prev_point;
        if delta.x == 0.0 && delta.y == 0.0 {
            return false;
        }
        for id in self.selection.clone() {
            if let Some(index) = self.shape_index(id) {
                self.shapes[index].move_by(delta);
            }
        }
        self.prev_point = pos;
        true
    }

    fn bounded_move_shadow_copies(&mut self, pos: Point) -> bool {
        let Some(pos) = self.bounded_target(pos) else {
            return false;
        };
        let delta = pos - self.prev_point;
        if delta.x == 0.0 && delta.y == 0.0 {
            return false;
        }
        for shape in &mut self.shadow_copies {
            shape.move_by(delta);
        }
        self.prev_point = pos;
        true
    }

    /// Resolve a shadow-copy drag: keep the copies as new shapes, or move
    /// the originals onto the copies' geometry.
    pub fn end_move(&mut self, copy: bool) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.shadow_copies.is_empty() || self.selection.is_empty() {
            return effects;
        }
        debug_assert_eq!(self.shadow_copies.len(), self.selection.len());
        let copies = std::mem::take(&mut self.shadow_copies);
        if copy {
            let mut new_selection = Vec::with_capacity(copies.len());
            for (old_id, mut shape) in self.selection.clone().into_iter().zip(copies) {
                if let Some(index) = self.shape_index(old_id) {
                    self.shapes[index].selected = false;
                }
                let id = self.alloc_id();
                shape.set_id(id);
                shape.selected = true;
                new_selection.push(id);
                self.shapes.push(shape);
            }
            self.selection = new_selection;
            effects.push(Effect::SelectionChanged(self.selection.clone()));
        } else {
            for (id, shape) in self.selection.clone().into_iter().zip(copies) {
                if let Some(index) = self.shape_index(id) {
                    self.shapes[index].set_points_with_labels(
                        shape.points().to_vec(),
                        shape.point_labels().to_vec(),
                    );
                }
            }
        }
        self.commit();
        effects.push(Effect::Redraw);
        effects
    }

    /// Discard a shadow-copy drag (context menu dismissed).
    pub fn cancel_shadow_copy(&mut self) -> Vec<Effect> {
        self.shadow_copies.clear();
        vec![Effect::Redraw]
    }

    /// Duplicate the selection in place, shifted by a couple of pixels.
    pub fn duplicate_selected_shapes(&mut self) -> Vec<Effect> {
        if self.selection.is_empty() {
            return Vec::new();
        }
        self.shadow_copies = self
            .selection
            .iter()
            .filter_map(|id| self.shape_index(*id))
            .map(|i| self.shapes[i].clone())
            .collect();
        // Try to shift one way; if the bounds refuse, the other.
        if let Some(first) = self.shadow_copies[0].points().first().copied() {
            let offset = Point::new(2.0, 2.0);
            self.offsets = (Point::default(), Point::default());
            self.prev_point = first;
            if !self.bounded_move_shadow_copies(first - offset) {
                self.bounded_move_shadow_copies(first + offset);
            }
        }
        self.end_move(true)
    }

    // ========================================================================
    // Shape list edits
    // ========================================================================

    fn add_point_to_edge(&mut self, effects: &mut Vec<Effect>) {
        let (Some(id), Some(edge)) = (self.hover.current.shape, self.hover.current.edge) else {
            return;
        };
        let Some(index) = self.shape_index(id) else {
            return;
        };
        let point = self.prev_move_point;
        self.shapes[index].insert_point(edge, point);
        self.shapes[index].highlight_vertex(edge, HighlightKind::MoveVertex);
        self.hover.transition(HoverTarget {
            shape: Some(id),
            vertex: Some(edge),
            edge: None,
        });
        self.moving_shape = true;
        effects.push(Effect::Redraw);
    }

    fn remove_selected_point(&mut self, effects: &mut Vec<Effect>) {
        let (Some(id), Some(vertex)) = (self.hover.current.shape, self.hover.current.vertex)
        else {
            return;
        };
        let Some(index) = self.shape_index(id) else {
            return;
        };
        self.shapes[index].remove_point(vertex);
        self.shapes[index].highlight_clear();
        self.hover.transition(HoverTarget {
            shape: Some(id),
            vertex: None,
            edge: None,
        });
        self.moving_shape = true; // the release commits the change
        effects.push(Effect::Redraw);
    }

    /// Delete all selected shapes, returning them. Commits a snapshot.
    pub fn delete_selected(&mut self) -> (Vec<Shape>, Vec<Effect>) {
        let mut deleted = Vec::new();
        let mut effects = Vec::new();
        if self.selection.is_empty() {
            return (deleted, effects);
        }
        let selection = std::mem::take(&mut self.selection);
        for id in selection {
            if let Some(index) = self.shape_index(id) {
                deleted.push(self.shapes.remove(index));
            }
        }
        self.commit();
        effects.push(Effect::SelectionChanged(Vec::new()));
        effects.push(Effect::Redraw);
        (deleted, effects)
    }

    /// Delete one shape by id. Commits a snapshot.
    pub fn delete_shape(&mut self, id: ShapeId) -> Vec<Effect> {
        self.selection.retain(|s| *s != id);
        if let Some(index) = self.shape_index(id) {
            self.shapes.remove(index);
        }
        self.commit();
        vec![Effect::Redraw]
    }

    // ========================================================================
    // Finalize and undo
    // ========================================================================

    /// Close the in-progress shape, refine it through the AI capability if
    /// needed, append it, and commit a snapshot. An AI failure leaves the
    /// shape in progress so the user can retry or cancel.
    pub fn finalise(&mut self, effects: &mut Vec<Effect>) -> Result<(), CanvasError> {
        let Some(mut current) = self.current.take() else {
            return Ok(());
        };

        match self.create_mode {
            CreateMode::AiPolygon => {
                debug_assert_eq!(current.kind(), ShapeKind::Points);
                match self.refine_polygon(&current) {
                    Ok(points) => {
                        let labels = vec![1; points.len()];
                        current.set_shape_refined(ShapeKind::Polygon, points, labels, None);
                    }
                    Err(err) => {
                        self.current = Some(current);
                        return Err(err);
                    }
                }
            }
            CreateMode::AiMask => {
                debug_assert_eq!(current.kind(), ShapeKind::Points);
                match self.refine_mask(&current) {
                    Ok((points, mask)) => {
                        current.set_shape_refined(
                            ShapeKind::Mask,
                            points,
                            vec![1, 1],
                            Some(mask),
                        );
                    }
                    Err(err) => {
                        self.current = Some(current);
                        return Err(err);
                    }
                }
            }
            CreateMode::PatchAnnotation => {
                if current.label.is_none() {
                    if let Some(code) = label_code_for(self.class_tag, self.intensity_tag) {
                        current.label = Some(code);
                    }
                }
            }
            _ => {}
        }

        current.close();
        let patch_annotation = current.kind() == ShapeKind::PatchAnnotation;
        log::debug!("finalized {} shape {:?}", current.kind().name(), current.id());
        self.shapes.push(current);
        self.commit();
        self.set_hiding(false);
        effects.push(Effect::NewShape { patch_annotation });
        effects.push(Effect::Redraw);
        Ok(())
    }

    fn refine_polygon(&mut self, shape: &Shape) -> Result<Vec<Point>, CanvasError> {
        let ai = self.ai.as_mut().ok_or(CanvasError::AiModelMissing)?;
        let points = ai.predict_polygon_from_points(shape.points(), shape.point_labels())?;
        Ok(points)
    }

    fn refine_mask(&mut self, shape: &Shape) -> Result<(Vec<Point>, Array2<bool>), CanvasError> {
        let model = self.ai.as_mut().ok_or(CanvasError::AiModelMissing)?;
        let mask = model.predict_mask_from_points(shape.points(), shape.point_labels())?;
        let bbox = ai::mask_to_bbox(&mask).ok_or(crate::ai::AiError::EmptyResult)?;
        let (r1, c1, r2, c2) = bbox;
        let cropped = ai::crop_mask(&mask, bbox);
        let points = vec![
            Point::new(c1 as f32, r1 as f32),
            Point::new(c2 as f32, r2 as f32),
        ];
        Ok((points, cropped))
    }

    /// Rasterize a box-annotation drag into a patch shape. A degenerate box
    /// collapses to a single point or a sampled line path.
    fn annotate_with_box(
        &mut self,
        start: Point,
        end: Point,
        effects: &mut Vec<Effect>,
    ) -> Result<(), CanvasError> {
        let id = self.alloc_id();
        let mut shape = Shape::new(id, ShapeKind::PatchAnnotation);

        if start.x == end.x || start.y == end.y {
            if start == end {
                shape.add_point(start, 1);
            } else {
                for p in sample_segment(start, end) {
                    shape.add_point(p, 1);
                }
            }
        } else {
            let x_min = start.x.min(end.x);
            let x_max = start.x.max(end.x);
            let y_min = start.y.min(end.y);
            let y_max = start.y.max(end.y);
            let nx = (self.config.patch_cols as f32 / 2.0).clamp(1.0, 10.0) as usize;
            let ny = (self.config.patch_rows as f32 / 2.0).clamp(1.0, 10.0) as usize;
            for i in 0..=nx {
                let x = x_min + (x_max - x_min) * i as f32 / nx as f32;
                for j in 0..=ny {
                    let y = y_min + (y_max - y_min) * j as f32 / ny as f32;
                    shape.add_point(Point::new(x, y), 1);
                }
            }
        }
        shape.close();

        // Stamp the pending class/intensity, if one is selected.
        match label_code_for(self.class_tag, self.intensity_tag) {
            Some(code) if !code.starts_with('0') => shape.label = Some(code),
            _ => {}
        }

        self.shapes.push(shape);
        self.commit();
        effects.push(Effect::NewShape { patch_annotation: true });
        Ok(())
    }

    /// Restore the previous history snapshot, replacing the live shape list
    /// and label grid. Selection is cleared as part of undo.
    pub fn undo(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(snapshot) = self.history.undo() else {
            return effects;
        };
        self.shapes = snapshot.shapes;
        self.grid = snapshot.grid;
        for shape in &mut self.shapes {
            shape.selected = false;
        }
        self.selection.clear();
        self.hover.clear();
        self.current = None;
        effects.push(Effect::SelectionChanged(Vec::new()));
        effects.push(Effect::Redraw);
        effects
    }

    /// Pop the most recently finalized shape back into drawing, restoring
    /// the label grid to its pre-shape state.
    pub fn undo_last_shape(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(mut shape) = self.shapes.pop() else {
            return effects;
        };
        if let Some(snapshot) = self.history.undo() {
            self.grid = snapshot.grid;
        }
        shape.set_open();
        shape.restore_raw();
        self.mode = Mode::Create;
        match self.create_mode {
            CreateMode::Polygon | CreateMode::LineStrip => {
                let (first, last) = (
                    shape.points().first().copied(),
                    shape.points().last().copied(),
                );
                if let (Some(first), Some(last)) = (first, last) {
                    self.line.set_points_with_labels(vec![last, first], vec![1, 1]);
                }
                self.current = Some(shape);
            }
            CreateMode::Rectangle | CreateMode::Line | CreateMode::Circle => {
                shape.truncate_points(1);
                self.current = Some(shape);
            }
            CreateMode::Point => {
                self.current = None;
            }
            _ => {
                self.current = Some(shape);
            }
        }
        effects.push(Effect::DrawingChanged(true));
        effects.push(Effect::Redraw);
        effects
    }

    /// Remove the last vertex of the in-progress shape; aborts the shape
    /// when no vertex remains.
    pub fn undo_last_point(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(current) = self.current.as_mut() else {
            return effects;
        };
        if current.is_closed() {
            return effects;
        }
        current.pop_point();
        if let Some(last) = current.points().last().copied() {
            self.line.set_point(0, last);
        } else {
            self.current = None;
            effects.push(Effect::DrawingChanged(false));
        }
        if let Some(snapshot) = self.history.peek_latest() {
            self.grid = snapshot.grid.snapshot();
        }
        effects.push(Effect::Redraw);
        effects
    }

    /// Apply the host's label-prompt result to the most recent shape,
    /// replacing the top history snapshot.
    pub fn set_last_label(
        &mut self,
        label: impl Into<String>,
        flags: HashMap<String, bool>,
    ) -> Option<ShapeId> {
        let shape = self.shapes.last_mut()?;
        shape.label = Some(label.into());
        shape.flags = flags;
        let id = shape.id();
        self.history.pop_latest();
        self.commit();
        Some(id)
    }

    // ========================================================================
    // Image, grid, and lifecycle
    // ========================================================================

    /// Point the canvas at a new base image. With `clear_shapes` the shape
    /// list, label grid, and coverage cache are reinitialized; otherwise the
    /// grid is preserved when its dimensions still match and re-derived from
    /// patch shapes when they do not.
    pub fn load_image(
        &mut self,
        image: &RgbaImage,
        clear_shapes: bool,
    ) -> Result<Vec<Effect>, CanvasError> {
        let size = ImageSize::new(image.width(), image.height());
        self.image_size = Some(size);
        if let Some(model) = self.ai.as_mut() {
            model.set_image(image)?;
        }

        let (rows, cols) = (self.config.patch_rows, self.config.patch_cols);
        if clear_shapes {
            self.shapes.clear();
            self.selection.clear();
            self.grid = LabelGrid::new(rows, cols);
            self.coverage_cache.clear();
            self.history.clear();
        } else if self.grid.rows() != rows || self.grid.cols() != cols {
            self.grid = LabelGrid::new(rows, cols);
            self.coverage_cache.clear();
            // Re-derive labels from the surviving patch shapes.
            for index in 0..self.shapes.len() {
                let shape = &self.shapes[index];
                if shape.kind() != ShapeKind::PatchAnnotation {
                    continue;
                }
                let Some(label) = shape.label.clone() else {
                    continue;
                };
                let mask = geometry::shape_to_patch_mask(shape, &size, rows, cols);
                if mask.iter().any(|c| *c) {
                    self.grid.apply_coverage(&mask, &label)?;
                }
                self.coverage_cache.insert(shape.id(), mask);
            }
        }
        // Baseline snapshot so the first edit is undoable.
        self.commit();
        Ok(vec![Effect::Redraw])
    }

    /// Change the patch grid dimensions, reinitializing the label grid.
    pub fn set_patch_size(&mut self, rows: usize, cols: usize) -> Vec<Effect> {
        self.config.patch_rows = rows;
        self.config.patch_cols = cols;
        self.grid = LabelGrid::new(rows, cols);
        self.coverage_cache.clear();
        vec![Effect::Redraw]
    }

    /// Replace or extend the shape list (host API, used after undo or when
    /// loading persisted annotations). Shapes without an id get a fresh one.
    pub fn load_shapes(&mut self, shapes: Vec<Shape>, replace: bool) -> Vec<Effect> {
        let mut incoming = shapes;
        for shape in &mut incoming {
            if shape.id() == ShapeId(0) {
                let id = self.alloc_id();
                shape.set_id(id);
            } else {
                self.next_id = self.next_id.max(shape.id().0);
            }
        }
        if replace {
            self.shapes = incoming;
        } else {
            self.shapes.extend(incoming);
        }
        self.commit();
        self.current = None;
        self.hover.clear();
        vec![Effect::Redraw]
    }

    /// Drop the image and all transient interaction state.
    pub fn reset_state(&mut self) -> Vec<Effect> {
        self.image_size = None;
        self.history.clear();
        self.current = None;
        self.shadow_copies.clear();
        self.box_start = None;
        self.hover.clear();
        vec![Effect::Redraw]
    }

    /// Re-derive label-grid entries for every patch shape whose rasterized
    /// coverage changed since the last call. Cells are never cleared when a
    /// shape shrinks; labels are sticky until overwritten.
    pub fn sync_patch_coverage(&mut self) -> Result<bool, CanvasError> {
        let Some(size) = self.image_size else {
            return Ok(false);
        };
        let (rows, cols) = (self.grid.rows(), self.grid.cols());
        let mut changed = false;
        for index in 0..self.shapes.len() {
            let shape = &self.shapes[index];
            if shape.kind() != ShapeKind::PatchAnnotation {
                continue;
            }
            let id = shape.id();
            let mask = geometry::shape_to_patch_mask(shape, &size, rows, cols);
            if self.coverage_cache.get(&id) == Some(&mask) {
                continue;
            }
            let label = shape.label.clone();
            if let Some(label) = label {
                if mask.iter().any(|c| *c) {
                    self.grid.apply_coverage(&mask, &label)?;
                    changed = true;
                }
            }
            self.coverage_cache.insert(id, mask);
        }
        Ok(changed)
    }
}

/// Points spaced roughly five pixels apart along an axis-aligned segment,
/// endpoints included.
fn sample_segment(start: Point, end: Point) -> Vec<Point> {
    let delta = end - start;
    let length = delta.norm();
    let steps = ((length / 5.0).max(1.0)).round() as usize;
    (0..=steps)
        .map(|i| start + delta * (i as f32 / steps as f32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::AiError;
    use crate::patch_grid::PatchLabel;

    fn test_image(width: u32, height: u32) -> RgbaImage {
        RgbaImage::new(width, height)
    }

    fn canvas_with_image(width: u32, height: u32) -> (Canvas, GridClipboard) {
        let mut canvas = Canvas::new(CanvasConfig::default());
        canvas
            .load_image(&test_image(width, height), true)
            .unwrap();
        (canvas, GridClipboard::new())
    }

    fn press(pos: Point, modifiers: Modifiers) -> Event {
        Event::PointerPressed {
            pos,
            button: PointerButton::Primary,
            modifiers,
        }
    }

    fn moved(pos: Point) -> Event {
        Event::PointerMoved {
            pos,
            held: HeldButtons::default(),
            modifiers: Modifiers::NONE,
        }
    }

    /// Draw and finalize a rectangle via the event interface.
    fn draw_rectangle(canvas: &mut Canvas, clipboard: &mut GridClipboard, a: Point, b: Point) {
        canvas.set_create_mode(CreateMode::Rectangle);
        canvas.set_editing(false);
        canvas.handle_event(press(a, Modifiers::NONE), clipboard).unwrap();
        canvas.handle_event(moved(b), clipboard).unwrap();
        canvas.handle_event(press(b, Modifiers::NONE), clipboard).unwrap();
    }

    #[test]
    fn test_rectangle_two_clicks_finalizes() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        draw_rectangle(
            &mut canvas,
            &mut clipboard,
            Point::new(10.0, 10.0),
            Point::new(100.0, 100.0),
        );
        assert_eq!(canvas.shapes().len(), 1);
        let shape = &canvas.shapes()[0];
        assert_eq!(shape.kind(), ShapeKind::Rectangle);
        assert!(shape.is_closed());
        assert_eq!(shape.points(), &[Point::new(10.0, 10.0), Point::new(100.0, 100.0)]);
        assert!(canvas.current_shape().is_none());
    }

    #[test]
    fn test_new_shape_effect_tags_patch_annotations() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.set_create_mode(CreateMode::PatchAnnotation);
        canvas.set_editing(false);
        let effects = canvas
            .handle_event(press(Point::new(5.0, 5.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        assert!(effects.contains(&Effect::NewShape { patch_annotation: true }));
        assert_eq!(canvas.shapes().len(), 1);
    }

    #[test]
    fn test_point_mode_finalizes_immediately() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.set_create_mode(CreateMode::Point);
        canvas.set_editing(false);
        let effects = canvas
            .handle_event(press(Point::new(50.0, 60.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        assert!(effects.contains(&Effect::NewShape { patch_annotation: false }));
        assert_eq!(canvas.shapes()[0].kind(), ShapeKind::Point);
    }

    #[test]
    fn test_press_outside_image_is_ignored() {
        let (mut canvas, mut clipboard) = canvas_with_image(100, 100);
        canvas.set_create_mode(CreateMode::Polygon);
        canvas.set_editing(false);
        canvas
            .handle_event(press(Point::new(200.0, 50.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        assert!(canvas.current_shape().is_none());
    }

    #[test]
    fn test_polygon_closes_via_snap_to_start() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.set_create_mode(CreateMode::Polygon);
        canvas.set_editing(false);
        for p in [
            Point::new(100.0, 100.0),
            Point::new(200.0, 100.0),
            Point::new(200.0, 200.0),
        ] {
            canvas.handle_event(moved(p), &mut clipboard).unwrap();
            canvas.handle_event(press(p, Modifiers::NONE), &mut clipboard).unwrap();
        }
        // Move near the start point: snapping pulls the rubber band onto it.
        canvas
            .handle_event(moved(Point::new(102.0, 101.0)), &mut clipboard)
            .unwrap();
        let effects = canvas
            .handle_event(press(Point::new(102.0, 101.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        assert!(effects.contains(&Effect::NewShape { patch_annotation: false }));
        let shape = &canvas.shapes()[0];
        assert!(shape.is_closed());
        assert_eq!(shape.points().len(), 3);
    }

    #[test]
    fn test_escape_aborts_drawing() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.set_create_mode(CreateMode::Polygon);
        canvas.set_editing(false);
        canvas
            .handle_event(press(Point::new(10.0, 10.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        assert!(canvas.current_shape().is_some());
        let effects = canvas
            .handle_event(
                Event::KeyPressed { key: Key::Escape, modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        assert!(canvas.current_shape().is_none());
        assert!(effects.contains(&Effect::DrawingChanged(false)));
    }

    #[test]
    fn test_undo_last_shape_reopens_rectangle() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        draw_rectangle(
            &mut canvas,
            &mut clipboard,
            Point::new(10.0, 10.0),
            Point::new(100.0, 100.0),
        );
        assert!(canvas.can_undo());
        canvas.undo_last_shape();
        assert!(canvas.shapes().is_empty());
        let current = canvas.current_shape().expect("shape reopened into current");
        assert!(!current.is_closed());
        assert_eq!(current.points(), &[Point::new(10.0, 10.0)]);
        assert!(canvas.is_drawing());
    }

    #[test]
    fn test_undo_restores_previous_snapshot() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        draw_rectangle(
            &mut canvas,
            &mut clipboard,
            Point::new(10.0, 10.0),
            Point::new(50.0, 50.0),
        );
        draw_rectangle(
            &mut canvas,
            &mut clipboard,
            Point::new(100.0, 100.0),
            Point::new(150.0, 150.0),
        );
        assert_eq!(canvas.shapes().len(), 2);
        canvas.undo();
        assert_eq!(canvas.shapes().len(), 1);
        // A second undo restores the empty baseline from the image load.
        canvas.undo();
        assert!(canvas.shapes().is_empty());
        // Undoing beyond available history is a no-op.
        assert!(!canvas.can_undo());
        assert!(canvas.undo().is_empty());
    }

    #[test]
    fn test_history_capacity() {
        let config = CanvasConfig { num_backups: 2, ..CanvasConfig::default() };
        let mut canvas = Canvas::new(config);
        let mut clipboard = GridClipboard::new();
        canvas.load_image(&test_image(640, 480), true).unwrap();
        for i in 0..5 {
            let o = i as f32 * 20.0;
            draw_rectangle(
                &mut canvas,
                &mut clipboard,
                Point::new(o, o),
                Point::new(o + 10.0, o + 10.0),
            );
        }
        assert_eq!(canvas.history.len(), 3);
    }

    #[test]
    fn test_bounded_move_clamps_selection() {
        let (mut canvas, mut clipboard) = canvas_with_image(200, 200);
        draw_rectangle(
            &mut canvas,
            &mut clipboard,
            Point::new(10.0, 10.0),
            Point::new(50.0, 50.0),
        );
        canvas.set_editing(true);
        // Select by clicking inside the rectangle.
        canvas
            .handle_event(press(Point::new(30.0, 30.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        assert_eq!(canvas.selection().len(), 1);
        // Drag towards the far corner, overshooting both edges.
        canvas
            .handle_event(
                Event::PointerMoved {
                    pos: Point::new(195.0, 195.0),
                    held: HeldButtons { primary: true, secondary: false },
                    modifiers: Modifiers::NONE,
                },
                &mut clipboard,
            )
            .unwrap();
        let rect = canvas.shapes()[0].bounding_rect().unwrap();
        assert!(rect.right() <= 199.0 + 1e-3);
        assert!(rect.bottom() <= 199.0 + 1e-3);
        assert!(rect.left() >= 0.0);
    }

    #[test]
    fn test_box_annotation_degenerate_point() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas
            .handle_event(
                Event::PointerPressed {
                    pos: Point::new(5.0, 5.0),
                    button: PointerButton::Secondary,
                    modifiers: Modifiers::SHIFT,
                },
                &mut clipboard,
            )
            .unwrap();
        let effects = canvas
            .handle_event(
                Event::PointerReleased {
                    pos: Point::new(5.0, 5.0),
                    button: PointerButton::Secondary,
                    modifiers: Modifiers::SHIFT,
                },
                &mut clipboard,
            )
            .unwrap();
        assert!(effects.contains(&Effect::NewShape { patch_annotation: true }));
        let shape = &canvas.shapes()[0];
        assert_eq!(shape.kind(), ShapeKind::PatchAnnotation);
        assert_eq!(shape.points(), &[Point::new(5.0, 5.0)]);
    }

    #[test]
    fn test_box_annotation_stamps_pending_tags() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.set_editing(false);
        canvas
            .handle_event(
                Event::KeyPressed { key: Key::Digit(1), modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        canvas
            .handle_event(
                Event::KeyPressed { key: Key::Q, modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        canvas
            .handle_event(
                Event::PointerPressed {
                    pos: Point::new(0.0, 0.0),
                    button: PointerButton::Secondary,
                    modifiers: Modifiers::SHIFT,
                },
                &mut clipboard,
            )
            .unwrap();
        canvas
            .handle_event(
                Event::PointerReleased {
                    pos: Point::new(319.0, 239.0),
                    button: PointerButton::Secondary,
                    modifiers: Modifiers::SHIFT,
                },
                &mut clipboard,
            )
            .unwrap();
        assert_eq!(canvas.shapes()[0].label.as_deref(), Some("1q"));

        // Coverage sync labels the top-left quadrant cells as (1, 1).
        canvas.sync_patch_coverage().unwrap();
        for r in 0..8 {
            for c in 0..8 {
                assert_eq!(
                    canvas.label_grid().get(r, c),
                    Some(PatchLabel::new(1, 1)),
                    "cell ({r},{c})"
                );
            }
        }
        assert_eq!(canvas.label_grid().get(8, 8), Some(PatchLabel::UNLABELED));
    }

    #[test]
    fn test_digit_q_key_stash_and_x_restore() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.set_editing(false);
        canvas
            .handle_event(
                Event::KeyPressed { key: Key::Digit(3), modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        canvas
            .handle_event(
                Event::KeyPressed { key: Key::W, modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        assert_eq!(
            canvas.pending_tags(),
            (Some(ClassTag::Class(3)), Some(IntensityTag::Blockage))
        );
        // X switches to the eraser and stashes the pair.
        canvas
            .handle_event(
                Event::KeyPressed { key: Key::X, modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        assert_eq!(canvas.pending_tags().0, Some(ClassTag::Clean));
        // Releasing X restores it.
        canvas
            .handle_event(
                Event::KeyReleased { key: Key::X, modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        assert_eq!(
            canvas.pending_tags(),
            (Some(ClassTag::Class(3)), Some(IntensityTag::Blockage))
        );
    }

    #[test]
    fn test_class_key_after_eraser_degrades_intensity() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.set_editing(false);
        canvas
            .handle_event(
                Event::KeyPressed { key: Key::X, modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        // A real class cannot carry the eraser intensity; it falls back to
        // the first tier, both in the state and in the emitted effect.
        let effects = canvas
            .handle_event(
                Event::KeyPressed { key: Key::Digit(1), modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        assert_eq!(
            canvas.pending_tags(),
            (Some(ClassTag::Class(1)), Some(IntensityTag::Blurry))
        );
        assert!(effects.contains(&Effect::ClassIntensityChanged {
            class: Some(ClassTag::Class(1)),
            intensity: Some(IntensityTag::Blurry),
        }));
    }

    #[test]
    fn test_grid_reset_copy_paste() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.grid.set_label(2, 3, "4w").unwrap();
        let effects = canvas
            .handle_event(
                Event::KeyPressed { key: Key::C, modifiers: Modifiers::CTRL },
                &mut clipboard,
            )
            .unwrap();
        assert!(effects.contains(&Effect::GridCopied));

        let effects = canvas
            .handle_event(
                Event::KeyPressed { key: Key::U, modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        assert!(effects.contains(&Effect::GridReset));
        assert_eq!(canvas.label_grid().get(2, 3), Some(PatchLabel::UNLABELED));

        let effects = canvas
            .handle_event(
                Event::KeyPressed { key: Key::V, modifiers: Modifiers::CTRL },
                &mut clipboard,
            )
            .unwrap();
        assert!(effects.contains(&Effect::GridPasted));
        assert_eq!(canvas.label_grid().get(2, 3), Some(PatchLabel::new(4, 2)));
    }

    #[test]
    fn test_space_toggles_visibility() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        assert!(canvas.shapes_visible());
        canvas
            .handle_event(
                Event::KeyPressed { key: Key::Space, modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        assert!(!canvas.shapes_visible());
    }

    #[test]
    fn test_freehand_patch_painting_and_shift_release() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.set_create_mode(CreateMode::PatchAnnotation);
        canvas.set_editing(false);
        canvas
            .handle_event(press(Point::new(10.0, 10.0), Modifiers::SHIFT), &mut clipboard)
            .unwrap();
        assert!(canvas.current_shape().is_some());
        for x in [30.0, 50.0, 70.0] {
            canvas
                .handle_event(
                    Event::PointerMoved {
                        pos: Point::new(x, 10.0),
                        held: HeldButtons { primary: true, secondary: false },
                        modifiers: Modifiers::SHIFT,
                    },
                    &mut clipboard,
                )
                .unwrap();
        }
        assert_eq!(canvas.current_shape().unwrap().points().len(), 4);
        let effects = canvas
            .handle_event(
                Event::KeyReleased { key: Key::Shift, modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        assert!(effects.contains(&Effect::NewShape { patch_annotation: true }));
        assert!(canvas.current_shape().is_none());
    }

    #[test]
    fn test_hover_hits_vertex_then_edge_then_inside() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.set_create_mode(CreateMode::Polygon);
        canvas.set_editing(false);
        for p in [
            Point::new(100.0, 100.0),
            Point::new(200.0, 100.0),
            Point::new(200.0, 200.0),
            Point::new(100.0, 200.0),
        ] {
            canvas.handle_event(moved(p), &mut clipboard).unwrap();
            canvas.handle_event(press(p, Modifiers::NONE), &mut clipboard).unwrap();
        }
        let mut effects = Vec::new();
        canvas.finalise(&mut effects).unwrap();
        canvas.set_editing(true);

        canvas
            .handle_event(moved(Point::new(101.0, 101.0)), &mut clipboard)
            .unwrap();
        assert_eq!(canvas.hover().current.vertex, Some(0));

        canvas
            .handle_event(moved(Point::new(150.0, 99.0)), &mut clipboard)
            .unwrap();
        assert!(canvas.hover().current.vertex.is_none());
        assert_eq!(canvas.hover().current.edge, Some(1));

        canvas
            .handle_event(moved(Point::new(150.0, 150.0)), &mut clipboard)
            .unwrap();
        assert!(canvas.hover().current.edge.is_none());
        assert!(canvas.hover().current.shape.is_some());

        canvas
            .handle_event(moved(Point::new(400.0, 400.0)), &mut clipboard)
            .unwrap();
        assert_eq!(canvas.hover().current, HoverTarget::default());
    }

    #[test]
    fn test_arrow_keys_nudge_selection() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        draw_rectangle(
            &mut canvas,
            &mut clipboard,
            Point::new(10.0, 10.0),
            Point::new(50.0, 50.0),
        );
        canvas.set_editing(true);
        canvas
            .handle_event(press(Point::new(30.0, 30.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        let before = canvas.shapes()[0].points()[0];
        canvas
            .handle_event(
                Event::KeyPressed { key: Key::Right, modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        let after = canvas.shapes()[0].points()[0];
        assert_eq!(after.x, before.x + 5.0);
        assert_eq!(after.y, before.y);
    }

    struct FailingModel;

    impl AiModel for FailingModel {
        fn name(&self) -> &str {
            "failing"
        }
        fn set_image(&mut self, _image: &RgbaImage) -> Result<(), AiError> {
            Ok(())
        }
        fn predict_polygon_from_points(
            &mut self,
            _points: &[Point],
            _point_labels: &[u8],
        ) -> Result<Vec<Point>, AiError> {
            Err(AiError::Prediction("model exploded".into()))
        }
        fn predict_mask_from_points(
            &mut self,
            _points: &[Point],
            _point_labels: &[u8],
        ) -> Result<Array2<bool>, AiError> {
            Err(AiError::Prediction("model exploded".into()))
        }
    }

    struct BoxModel;

    impl AiModel for BoxModel {
        fn name(&self) -> &str {
            "box"
        }
        fn set_image(&mut self, _image: &RgbaImage) -> Result<(), AiError> {
            Ok(())
        }
        fn predict_polygon_from_points(
            &mut self,
            points: &[Point],
            _point_labels: &[u8],
        ) -> Result<Vec<Point>, AiError> {
            // A fixed triangle around the first prompt.
            let p = points.first().copied().ok_or(AiError::EmptyResult)?;
            Ok(vec![
                Point::new(p.x - 10.0, p.y - 10.0),
                Point::new(p.x + 10.0, p.y - 10.0),
                Point::new(p.x, p.y + 10.0),
            ])
        }
        fn predict_mask_from_points(
            &mut self,
            points: &[Point],
            _point_labels: &[u8],
        ) -> Result<Array2<bool>, AiError> {
            let p = points.first().copied().ok_or(AiError::EmptyResult)?;
            let mut mask = Array2::from_elem((480, 640), false);
            for r in (p.y as usize)..(p.y as usize + 4) {
                for c in (p.x as usize)..(p.x as usize + 6) {
                    mask[[r, c]] = true;
                }
            }
            Ok(mask)
        }
    }

    #[test]
    fn test_ai_failure_keeps_shape_in_progress() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas
            .install_ai_model(Box::new(FailingModel), None)
            .unwrap();
        canvas.set_create_mode(CreateMode::AiPolygon);
        canvas.set_editing(false);
        canvas
            .handle_event(press(Point::new(100.0, 100.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        let mut effects = Vec::new();
        let result = canvas.finalise(&mut effects);
        assert!(result.is_err());
        assert!(canvas.current_shape().is_some());
        assert!(canvas.shapes().is_empty());
    }

    #[test]
    fn test_ai_mask_refinement() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.install_ai_model(Box::new(BoxModel), None).unwrap();
        canvas.set_create_mode(CreateMode::AiMask);
        canvas.set_editing(false);
        canvas
            .handle_event(press(Point::new(100.0, 50.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        let mut effects = Vec::new();
        canvas.finalise(&mut effects).unwrap();
        let shape = &canvas.shapes()[0];
        assert_eq!(shape.kind(), ShapeKind::Mask);
        assert_eq!(shape.points()[0], Point::new(100.0, 50.0));
        assert_eq!(shape.points()[1], Point::new(105.0, 53.0));
        let mask = shape.mask().expect("mask payload");
        assert_eq!(mask.dim(), (4, 6));
    }

    #[test]
    fn test_missing_ai_model_errors() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.set_create_mode(CreateMode::AiPolygon);
        canvas.set_editing(false);
        canvas
            .handle_event(press(Point::new(100.0, 100.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        let mut effects = Vec::new();
        assert!(matches!(
            canvas.finalise(&mut effects),
            Err(CanvasError::AiModelMissing)
        ));
    }

    #[test]
    fn test_patch_size_change_reinitializes_grid() {
        let (mut canvas, _clipboard) = canvas_with_image(640, 480);
        canvas.grid.set_label(0, 0, "2q").unwrap();
        canvas.set_patch_size(8, 8);
        assert_eq!(canvas.label_grid().rows(), 8);
        assert_eq!(canvas.label_grid().get(0, 0), Some(PatchLabel::UNLABELED));
    }

    #[test]
    fn test_sticky_cells_survive_shape_shrink() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        canvas.set_editing(false);
        canvas
            .handle_event(
                Event::KeyPressed { key: Key::Digit(2), modifiers: Modifiers::NONE },
                &mut clipboard,
            )
            .unwrap();
        canvas
            .handle_event(
                Event::PointerPressed {
                    pos: Point::new(0.0, 0.0),
                    button: PointerButton::Secondary,
                    modifiers: Modifiers::SHIFT,
                },
                &mut clipboard,
            )
            .unwrap();
        canvas
            .handle_event(
                Event::PointerReleased {
                    pos: Point::new(319.0, 239.0),
                    button: PointerButton::Secondary,
                    modifiers: Modifiers::SHIFT,
                },
                &mut clipboard,
            )
            .unwrap();
        canvas.sync_patch_coverage().unwrap();
        assert!(canvas.label_grid().get(7, 7).unwrap().is_labeled());

        // Deleting the shape leaves the labels in place.
        let id = canvas.shapes()[0].id();
        canvas.delete_shape(id);
        canvas.sync_patch_coverage().unwrap();
        assert!(canvas.label_grid().get(7, 7).unwrap().is_labeled());
    }

    #[test]
    fn test_load_image_preserves_grid() {
        let (mut canvas, _clipboard) = canvas_with_image(640, 480);
        canvas.grid.set_label(1, 1, "5w").unwrap();
        canvas.load_image(&test_image(320, 240), false).unwrap();
        assert_eq!(canvas.label_grid().get(1, 1), Some(PatchLabel::new(5, 2)));
        canvas.load_image(&test_image(640, 480), true).unwrap();
        assert_eq!(canvas.label_grid().get(1, 1), Some(PatchLabel::UNLABELED));
    }

    #[test]
    fn test_duplicate_selected_shapes() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        draw_rectangle(
            &mut canvas,
            &mut clipboard,
            Point::new(10.0, 10.0),
            Point::new(50.0, 50.0),
        );
        canvas.set_editing(true);
        canvas
            .handle_event(press(Point::new(30.0, 30.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        canvas.duplicate_selected_shapes();
        assert_eq!(canvas.shapes().len(), 2);
        // The duplicate carries a fresh id and is now the selection.
        assert_ne!(canvas.shapes()[0].id(), canvas.shapes()[1].id());
        assert_eq!(canvas.selection(), &[canvas.shapes()[1].id()]);
    }

    #[test]
    fn test_delete_selected_commits() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        draw_rectangle(
            &mut canvas,
            &mut clipboard,
            Point::new(10.0, 10.0),
            Point::new(50.0, 50.0),
        );
        canvas.set_editing(true);
        canvas
            .handle_event(press(Point::new(30.0, 30.0), Modifiers::NONE), &mut clipboard)
            .unwrap();
        let (deleted, effects) = canvas.delete_selected();
        assert_eq!(deleted.len(), 1);
        assert!(canvas.shapes().is_empty());
        assert!(effects.contains(&Effect::SelectionChanged(Vec::new())));
        // The deletion is undoable.
        canvas.undo();
        assert_eq!(canvas.shapes().len(), 1);
    }

    #[test]
    fn test_wheel_zoom_and_scroll() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        let effects = canvas
            .handle_event(
                Event::Wheel {
                    pos: Point::new(10.0, 10.0),
                    delta_x: 0.0,
                    delta_y: 120.0,
                    modifiers: Modifiers::CTRL,
                },
                &mut clipboard,
            )
            .unwrap();
        assert!(matches!(effects[0], Effect::ZoomRequest { delta, .. } if delta == 120.0));

        let effects = canvas
            .handle_event(
                Event::Wheel {
                    pos: Point::new(10.0, 10.0),
                    delta_x: 0.0,
                    delta_y: 120.0,
                    modifiers: Modifiers::NONE,
                },
                &mut clipboard,
            )
            .unwrap();
        assert!(matches!(
            effects[0],
            Effect::ScrollRequest { orientation: Orientation::Vertical, .. }
        ));
    }

    #[test]
    fn test_set_last_label_replaces_top_snapshot() {
        let (mut canvas, mut clipboard) = canvas_with_image(640, 480);
        draw_rectangle(
            &mut canvas,
            &mut clipboard,
            Point::new(10.0, 10.0),
            Point::new(50.0, 50.0),
        );
        let depth = canvas.history.len();
        canvas.set_last_label("car", HashMap::new());
        assert_eq!(canvas.history.len(), depth);
        assert_eq!(canvas.shapes()[0].label.as_deref(), Some("car"));
    }
}
