//! Frame composition as a retained display list.
//!
//! [`Canvas::render`] walks the committed state plus the transient drawing
//! state and emits [`DrawCommand`]s back to front: patch-label fills, grid
//! lines, finalized shapes, the in-progress shape with its rubber band,
//! shadow copies, and the crosshair. The adapter replays the list with its
//! own drawing toolkit; no toolkit types appear here.

use crate::ai::mask_to_bbox;
use crate::canvas::{Canvas, CreateMode};
use crate::error::CanvasError;
use crate::event::Effect;
use crate::geometry::{Point, Rect};
use crate::patch_grid::PatchLabel;
use crate::shape::{HighlightKind, Shape, ShapeKind};

/// Straight RGBA, unpremultiplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn with_alpha(self, a: u8) -> Self {
        Self { a, ..self }
    }
}

/// Default shape stroke.
const SHAPE_COLOR: Color = Color::rgba(0, 255, 0, 128);
/// Stroke and fill for selected shapes.
const SELECT_COLOR: Color = Color::rgba(0, 255, 255, 255);
const SELECT_FILL_COLOR: Color = Color::rgba(0, 255, 255, 155);
/// Vertex markers.
const VERTEX_COLOR: Color = Color::rgba(0, 255, 0, 255);
const HOVER_VERTEX_COLOR: Color = Color::rgba(255, 0, 0, 255);
const NEGATIVE_PROMPT_COLOR: Color = Color::rgba(255, 0, 0, 255);
/// Patch grid lines.
const GRID_COLOR: Color = Color::rgba(255, 255, 255, 128);
const GRID_DIM_COLOR: Color = Color::rgba(255, 255, 255, 76);
/// Crosshair spanning the image while drawing.
const CROSSHAIR_COLOR: Color = Color::rgba(255, 255, 255, 100);

const VERTEX_SIZE: f32 = 8.0;
const HOVER_VERTEX_SIZE: f32 = 12.0;

/// Fill alpha for the lighter intensity tier.
const LIGHT_ALPHA: u8 = 90;
/// Fill alpha for the heavier tiers.
const HEAVY_ALPHA: u8 = 180;

/// Marker style for a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexStyle {
    /// Square marker, the regular case.
    Square,
    /// Round marker for the highlighted vertex.
    Round,
}

/// Stroke style for outlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrokeStyle {
    Solid,
    /// Shadow copies are drawn dashed to distinguish them from originals.
    Dashed,
}

/// One drawing primitive, in image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    /// Axis-aligned filled rectangle (patch cells, mask bounding boxes).
    FillRect { rect: Rect, color: Color },
    /// A single line segment.
    Line {
        from: Point,
        to: Point,
        color: Color,
        style: StrokeStyle,
    },
    /// Open or closed path through the given points.
    Path {
        points: Vec<Point>,
        closed: bool,
        color: Color,
        style: StrokeStyle,
    },
    /// Filled polygon interior.
    FillPolygon { points: Vec<Point>, color: Color },
    /// Circle outline given by center and a point on the rim.
    Circle {
        center: Point,
        rim: Point,
        color: Color,
        style: StrokeStyle,
    },
    /// A vertex marker.
    Vertex {
        at: Point,
        style: VertexStyle,
        size: f32,
        color: Color,
    },
}

/// Fill color for a labeled patch cell.
///
/// Classes map onto a fixed palette; the lighter intensity tier renders more
/// transparent than the heavier ones. Eraser-cleared cells are unlabeled and
/// never reach this function.
pub fn class_color(label: PatchLabel) -> Option<Color> {
    let base = match label.class {
        1 => Color::rgba(0, 255, 255, 255),
        2 => Color::rgba(255, 255, 0, 255),
        3 => Color::rgba(0, 0, 255, 255),
        4 => Color::rgba(0, 255, 0, 255),
        5 => Color::rgba(255, 0, 255, 255),
        6 => Color::rgba(255, 0, 0, 255),
        _ => return None,
    };
    let alpha = if label.intensity == 1 { LIGHT_ALPHA } else { HEAVY_ALPHA };
    Some(base.with_alpha(alpha))
}

impl Canvas {
    /// Compose the display list for the current frame.
    ///
    /// When fill rendering is on, patch coverage is re-derived first so the
    /// label fills match the shape list; returns an empty list when no image
    /// is loaded.
    pub fn render(&mut self) -> Result<Vec<DrawCommand>, CanvasError> {
        let Some(size) = self.image_size else {
            return Ok(Vec::new());
        };
        let mut commands = Vec::new();
        let width = size.width as f32;
        let height = size.height as f32;

        // Label fills only render while fill rendering is on; coverage is
        // re-derived with them so the fills always match the shape list.
        if self.config.fill_drawing {
            self.sync_patch_coverage()?;
            self.render_patch_fills(&mut commands);
        }
        self.render_grid_lines(width, height, &mut commands);

        if self.shapes_visible {
            for index in 0..self.shapes.len() {
                let shape = &self.shapes[index];
                if !self.is_visible(shape.id()) {
                    continue;
                }
                if self.hiding_background && !shape.selected {
                    continue;
                }
                render_shape(shape, &mut commands);
            }
            for shape in &self.shadow_copies {
                render_outline(shape, SHAPE_COLOR, StrokeStyle::Dashed, &mut commands);
            }
            self.render_drawing_state(&mut commands);
            self.render_ai_preview(&mut commands)?;
        }

        if self.is_drawing()
            && self.config.crosshair.enabled_for(self.create_mode())
            && !size.out_of_bounds(&self.prev_move_point)
        {
            let p = self.prev_move_point;
            commands.push(DrawCommand::Line {
                from: Point::new(0.0, p.y),
                to: Point::new(width - 1.0, p.y),
                color: CROSSHAIR_COLOR,
                style: StrokeStyle::Solid,
            });
            commands.push(DrawCommand::Line {
                from: Point::new(p.x, 0.0),
                to: Point::new(p.x, height - 1.0),
                color: CROSSHAIR_COLOR,
                style: StrokeStyle::Solid,
            });
        }
        Ok(commands)
    }

    fn render_patch_fills(&self, commands: &mut Vec<DrawCommand>) {
        let Some(size) = self.image_size else {
            return;
        };
        let cell_w = size.width as f32 / self.grid.cols() as f32;
        let cell_h = size.height as f32 / self.grid.rows() as f32;
        for ((row, col), label) in self.grid.labeled_cells() {
            let Some(color) = class_color(label) else {
                continue;
            };
            commands.push(DrawCommand::FillRect {
                rect: Rect::new(col as f32 * cell_w, row as f32 * cell_h, cell_w, cell_h),
                color,
            });
        }
    }

    fn render_grid_lines(&self, width: f32, height: f32, commands: &mut Vec<DrawCommand>) {
        let color = if self.shapes_visible { GRID_COLOR } else { GRID_DIM_COLOR };
        let cols = self.grid.cols();
        let rows = self.grid.rows();
        let cell_w = width / cols as f32;
        let cell_h = height / rows as f32;
        // Interior lines only, the image border frames the outermost cells.
        for c in 1..cols {
            let x = c as f32 * cell_w;
            commands.push(DrawCommand::Line {
                from: Point::new(x, 0.0),
                to: Point::new(x, height - 1.0),
                color,
                style: StrokeStyle::Solid,
            });
        }
        for r in 1..rows {
            let y = r as f32 * cell_h;
            commands.push(DrawCommand::Line {
                from: Point::new(0.0, y),
                to: Point::new(width - 1.0, y),
                color,
                style: StrokeStyle::Solid,
            });
        }
    }

    /// The in-progress shape and its rubber band, including the live
    /// box-annotation rectangle.
    fn render_drawing_state(&self, commands: &mut Vec<DrawCommand>) {
        if self.box_start.is_some() {
            render_outline(&self.line, SELECT_COLOR, StrokeStyle::Solid, commands);
            return;
        }
        let Some(current) = self.current.as_ref() else {
            return;
        };
        render_outline(current, SHAPE_COLOR, StrokeStyle::Solid, commands);
        let prompt_markers = current.kind() == ShapeKind::Points;
        for (p, label) in current.points().iter().zip(current.point_labels()) {
            // Negative AI prompts are drawn red, positive green.
            let color = if prompt_markers && *label == 0 {
                NEGATIVE_PROMPT_COLOR
            } else {
                VERTEX_COLOR
            };
            commands.push(DrawCommand::Vertex {
                at: *p,
                style: VertexStyle::Square,
                size: VERTEX_SIZE / self.scale,
                color,
            });
        }
        if self.line.points().len() >= 2 && !matches!(current.kind(), ShapeKind::PatchAnnotation)
        {
            render_outline(&self.line, SHAPE_COLOR, StrokeStyle::Solid, commands);
        }
        if self.config.fill_drawing && current.points().len() >= 3 {
            let mut preview: Vec<Point> = current.points().to_vec();
            if let Some(rubber_end) = self.line.points().get(1) {
                preview.push(*rubber_end);
            }
            commands.push(DrawCommand::FillPolygon {
                points: preview,
                color: SHAPE_COLOR.with_alpha(64),
            });
        }
    }

    /// Live refinement of an in-progress AI shape: the current prompts plus
    /// the rubber-band point are run through the model every frame.
    fn render_ai_preview(&mut self, commands: &mut Vec<DrawCommand>) -> Result<(), CanvasError> {
        let mode = self.create_mode();
        if !self.is_drawing() || !mode.is_ai() {
            return Ok(());
        }
        let fill = self.config.fill_drawing;
        let (mut points, mut labels) = match self.current.as_ref() {
            Some(current) => (current.points().to_vec(), current.point_labels().to_vec()),
            None => return Ok(()),
        };
        if let Some(p) = self.line.points().get(1) {
            points.push(*p);
            labels.push(self.line.point_labels().get(1).copied().unwrap_or(1));
        }
        if points.is_empty() {
            return Ok(());
        }
        let Some(model) = self.ai.as_mut() else {
            return Ok(());
        };
        match mode {
            CreateMode::AiPolygon => {
                let outline = model.predict_polygon_from_points(&points, &labels)?;
                if outline.len() > 2 {
                    commands.push(DrawCommand::Path {
                        points: outline.clone(),
                        closed: true,
                        color: SELECT_COLOR,
                        style: StrokeStyle::Solid,
                    });
                    if fill {
                        commands.push(DrawCommand::FillPolygon {
                            points: outline,
                            color: SELECT_FILL_COLOR,
                        });
                    }
                }
            }
            CreateMode::AiMask => {
                let mask = model.predict_mask_from_points(&points, &labels)?;
                if let Some((r1, c1, r2, c2)) = mask_to_bbox(&mask) {
                    let rect = Rect::from_corners(
                        Point::new(c1 as f32, r1 as f32),
                        Point::new(c2 as f32, r2 as f32),
                    );
                    commands.push(DrawCommand::Path {
                        points: vec![
                            Point::new(rect.left(), rect.top()),
                            Point::new(rect.right(), rect.top()),
                            Point::new(rect.right(), rect.bottom()),
                            Point::new(rect.left(), rect.bottom()),
                        ],
                        closed: true,
                        color: SELECT_COLOR,
                        style: StrokeStyle::Solid,
                    });
                    commands.push(DrawCommand::FillRect { rect, color: SELECT_FILL_COLOR });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// A finalized shape: outline or bounding box, selection fill, and vertex
/// markers.
fn render_shape(shape: &Shape, commands: &mut Vec<DrawCommand>) {
    // Patch shapes exist to label grid cells; their own geometry is never
    // outlined, the cell fills are their visualization.
    if shape.kind() == ShapeKind::PatchAnnotation {
        return;
    }

    let color = if shape.selected { SELECT_COLOR } else { SHAPE_COLOR };
    render_outline(shape, color, StrokeStyle::Solid, commands);

    if shape.selected {
        match shape.kind() {
            ShapeKind::Polygon | ShapeKind::LineStrip if shape.points().len() >= 3 => {
                commands.push(DrawCommand::FillPolygon {
                    points: shape.points().to_vec(),
                    color: SELECT_FILL_COLOR,
                });
            }
            ShapeKind::Rectangle | ShapeKind::Mask => {
                if let Some(rect) = shape.bounding_rect() {
                    commands.push(DrawCommand::FillRect { rect, color: SELECT_FILL_COLOR });
                }
            }
            _ => {}
        }
    }

    let highlighted = shape.highlighted_vertex();
    for (i, p) in shape.points().iter().enumerate() {
        let (style, size, color) = match highlighted {
            Some((h, kind)) if h == i => {
                let style = match kind {
                    HighlightKind::NearVertex => VertexStyle::Round,
                    HighlightKind::MoveVertex => VertexStyle::Square,
                };
                (style, HOVER_VERTEX_SIZE, HOVER_VERTEX_COLOR)
            }
            _ => (VertexStyle::Square, VERTEX_SIZE, VERTEX_COLOR),
        };
        commands.push(DrawCommand::Vertex { at: *p, style, size, color });
    }
}

/// The bare outline of a shape, by kind.
fn render_outline(shape: &Shape, color: Color, style: StrokeStyle, commands: &mut Vec<DrawCommand>) {
    let points = shape.points();
    match shape.kind() {
        ShapeKind::Rectangle | ShapeKind::Mask => {
            if let Some(rect) = shape.bounding_rect() {
                let corners = vec![
                    Point::new(rect.left(), rect.top()),
                    Point::new(rect.right(), rect.top()),
                    Point::new(rect.right(), rect.bottom()),
                    Point::new(rect.left(), rect.bottom()),
                ];
                commands.push(DrawCommand::Path { points: corners, closed: true, color, style });
            }
        }
        ShapeKind::Circle => {
            if points.len() >= 2 {
                commands.push(DrawCommand::Circle {
                    center: points[0],
                    rim: points[1],
                    color,
                    style,
                });
            }
        }
        ShapeKind::Point | ShapeKind::Points => {
            // Vertex markers only; Points prompts are drawn by the caller.
        }
        ShapeKind::Line | ShapeKind::Polygon | ShapeKind::LineStrip
        | ShapeKind::PatchAnnotation => {
            if points.len() >= 2 {
                commands.push(DrawCommand::Path {
                    points: points.to_vec(),
                    closed: shape.is_closed(),
                    color,
                    style,
                });
            }
        }
    }
}

/// Convenience check used by adapters: whether any effect in a batch asks
/// for a redraw.
pub fn wants_redraw(effects: &[Effect]) -> bool {
    effects.iter().any(|e| matches!(e, Effect::Redraw))
}
