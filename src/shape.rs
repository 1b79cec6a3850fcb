//! The annotation shape entity.
//!
//! A [`Shape`] is one annotation: an ordered list of points plus a kind tag,
//! an optional label, per-point prompt labels for the AI-assisted modes, and
//! transient selection/highlight state. Side effects are confined to the
//! shape's own state; no shape mutates another.

use std::collections::HashMap;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Rect, polygon_contains};

/// Hit radius in image pixels for point-kind shapes.
const POINT_HIT_RADIUS: f32 = 5.0;

/// Stable handle for a shape, assigned by the canvas arena.
///
/// Identity-keyed side tables (the patch coverage cache, per-shape
/// visibility) key on this instead of on references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ShapeId(pub u64);

/// The geometric kind of a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Polygon,
    Rectangle,
    Circle,
    Line,
    Point,
    LineStrip,
    /// Raw point prompts collected for the AI modes, before refinement.
    Points,
    /// AI-refined raster mask; the two points are the bounding-box corners.
    Mask,
    /// Grid-labeling shape; covered patch cells inherit its label.
    PatchAnnotation,
}

impl ShapeKind {
    /// Get the serialized name for this kind.
    pub fn name(&self) -> &'static str {
        match self {
            ShapeKind::Polygon => "polygon",
            ShapeKind::Rectangle => "rectangle",
            ShapeKind::Circle => "circle",
            ShapeKind::Line => "line",
            ShapeKind::Point => "point",
            ShapeKind::LineStrip => "linestrip",
            ShapeKind::Points => "points",
            ShapeKind::Mask => "mask",
            ShapeKind::PatchAnnotation => "patch_annotation",
        }
    }
}

/// How a highlighted vertex should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HighlightKind {
    /// The pointer is near the vertex (e.g. snapping to the start point).
    NearVertex,
    /// The vertex is grabbed for moving.
    MoveVertex,
}

/// Geometry stashed before AI refinement so the shape can be reopened.
#[derive(Debug, Clone)]
struct RawGeometry {
    kind: ShapeKind,
    points: Vec<Point>,
    point_labels: Vec<u8>,
}

/// A single annotation on an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shape {
    #[serde(skip)]
    id: ShapeId,
    kind: ShapeKind,
    points: Vec<Point>,
    /// Per-point prompt labels, 0 = negative, 1 = positive. Invariant:
    /// same length as `points` after every mutation.
    point_labels: Vec<u8>,
    /// Annotation label; patch-annotation shapes carry a grid label code.
    pub label: Option<String>,
    #[serde(default)]
    pub flags: HashMap<String, bool>,
    closed: bool,
    /// Raster mask payload for AI-mask shapes, cropped to the bounding box
    /// spanned by the two points.
    mask: Option<Array2<bool>>,
    #[serde(skip)]
    pub selected: bool,
    #[serde(skip)]
    highlight: Option<(usize, HighlightKind)>,
    #[serde(skip)]
    raw: Option<Box<RawGeometry>>,
}

impl Shape {
    pub fn new(id: ShapeId, kind: ShapeKind) -> Self {
        Self {
            id,
            kind,
            points: Vec::new(),
            point_labels: Vec::new(),
            label: None,
            flags: HashMap::new(),
            closed: false,
            mask: None,
            selected: false,
            highlight: None,
            raw: None,
        }
    }

    pub fn id(&self) -> ShapeId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: ShapeId) {
        self.id = id;
    }

    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn point_labels(&self) -> &[u8] {
        &self.point_labels
    }

    pub fn mask(&self) -> Option<&Array2<bool>> {
        self.mask.as_ref()
    }

    /// Append a point. Only open shapes accept new points; appending to a
    /// closed shape is a no-op returning `false`. Appending the polygon's
    /// own start point closes it instead.
    pub fn add_point(&mut self, point: Point, label: u8) -> bool {
        if self.closed {
            return false;
        }
        if self.kind == ShapeKind::Polygon && self.points.first() == Some(&point) {
            self.close();
        } else {
            self.points.push(point);
            self.point_labels.push(label);
        }
        debug_assert_eq!(self.points.len(), self.point_labels.len());
        true
    }

    /// Remove and return the last point.
    pub fn pop_point(&mut self) -> Option<Point> {
        let p = self.points.pop();
        if p.is_some() {
            self.point_labels.pop();
        }
        p
    }

    /// Split edge `index` by inserting a point before the vertex at `index`.
    pub fn insert_point(&mut self, index: usize, point: Point) {
        let index = index.min(self.points.len());
        self.points.insert(index, point);
        self.point_labels.insert(index, 1);
    }

    /// Delete the vertex at `index`. Fails (no-op, returns `false`) when the
    /// shape would become degenerate or the kind has fixed arity.
    pub fn remove_point(&mut self, index: usize) -> bool {
        if index >= self.points.len() {
            return false;
        }
        let min_len = match self.kind {
            ShapeKind::Polygon => 3,
            ShapeKind::LineStrip => 2,
            _ => return false,
        };
        if self.points.len() <= min_len {
            return false;
        }
        self.points.remove(index);
        self.point_labels.remove(index);
        true
    }

    /// Whether edge hovering may insert points into this shape.
    pub fn can_add_point(&self) -> bool {
        matches!(self.kind, ShapeKind::Polygon | ShapeKind::LineStrip)
    }

    /// Translate every point by `delta`.
    pub fn move_by(&mut self, delta: Point) {
        for p in &mut self.points {
            *p = *p + delta;
        }
    }

    /// Translate a single vertex by `delta`.
    pub fn move_vertex_by(&mut self, index: usize, delta: Point) {
        if let Some(p) = self.points.get_mut(index) {
            *p = *p + delta;
        }
    }

    /// Index of the closest vertex within `epsilon`, if any.
    pub fn nearest_vertex(&self, point: &Point, epsilon: f32) -> Option<usize> {
        let mut best: Option<(f32, usize)> = None;
        for (i, p) in self.points.iter().enumerate() {
            let d = p.distance_to(point);
            if d < epsilon && best.is_none_or(|(bd, _)| d < bd) {
                best = Some((d, i));
            }
        }
        best.map(|(_, i)| i)
    }

    /// Index of the closest edge within `epsilon`, if any. Edge `i` connects
    /// vertices `i-1` and `i` (wrapping), so inserting at `i` splits it.
    pub fn nearest_edge(&self, point: &Point, epsilon: f32) -> Option<usize> {
        if self.points.len() < 2 {
            return None;
        }
        let mut best: Option<(f32, usize)> = None;
        for i in 0..self.points.len() {
            let a = self.points[if i == 0 { self.points.len() - 1 } else { i - 1 }];
            let b = self.points[i];
            let d = distance_to_segment(point, &a, &b);
            if d <= epsilon && best.is_none_or(|(bd, _)| d < bd) {
                best = Some((d, i));
            }
        }
        best.map(|(_, i)| i)
    }

    /// Hit test for hover and selection.
    pub fn contains_point(&self, point: &Point) -> bool {
        match self.kind {
            ShapeKind::Rectangle | ShapeKind::Mask => self
                .bounding_rect()
                .is_some_and(|r| r.contains(point)),
            ShapeKind::Circle => {
                if self.points.len() < 2 {
                    return false;
                }
                let radius = self.points[0].distance_to(&self.points[1]);
                self.points[0].distance_to(point) <= radius
            }
            ShapeKind::Point => self
                .points
                .first()
                .is_some_and(|p| p.distance_to(point) < POINT_HIT_RADIUS),
            ShapeKind::Points => false,
            ShapeKind::Line => false,
            ShapeKind::Polygon | ShapeKind::LineStrip | ShapeKind::PatchAnnotation => {
                self.closed && polygon_contains(&self.points, point)
            }
        }
    }

    pub fn bounding_rect(&self) -> Option<Rect> {
        let first = self.points.first()?;
        let mut min = *first;
        let mut max = *first;
        for p in &self.points {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        Some(Rect::from_corners(min, max))
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_open(&mut self) {
        self.closed = false;
    }

    pub fn highlight_vertex(&mut self, index: usize, kind: HighlightKind) {
        if index < self.points.len() {
            self.highlight = Some((index, kind));
        }
    }

    pub fn highlight_clear(&mut self) {
        self.highlight = None;
    }

    pub fn highlighted_vertex(&self) -> Option<(usize, HighlightKind)> {
        self.highlight
    }

    /// Replace the geometry after AI refinement, stashing the raw point
    /// prompts so [`Shape::restore_raw`] can reopen the shape for editing.
    pub fn set_shape_refined(
        &mut self,
        kind: ShapeKind,
        points: Vec<Point>,
        point_labels: Vec<u8>,
        mask: Option<Array2<bool>>,
    ) {
        debug_assert_eq!(points.len(), point_labels.len());
        self.raw = Some(Box::new(RawGeometry {
            kind: self.kind,
            points: std::mem::take(&mut self.points),
            point_labels: std::mem::take(&mut self.point_labels),
        }));
        self.kind = kind;
        self.points = points;
        self.point_labels = point_labels;
        self.mask = mask;
    }

    pub(crate) fn set_kind(&mut self, kind: ShapeKind) {
        self.kind = kind;
    }

    pub(crate) fn set_points_with_labels(&mut self, points: Vec<Point>, labels: Vec<u8>) {
        debug_assert_eq!(points.len(), labels.len());
        self.points = points;
        self.point_labels = labels;
    }

    pub(crate) fn set_point(&mut self, index: usize, point: Point) {
        if let Some(p) = self.points.get_mut(index) {
            *p = point;
        }
    }

    pub(crate) fn set_point_label(&mut self, index: usize, label: u8) {
        if let Some(l) = self.point_labels.get_mut(index) {
            *l = label;
        }
    }

    pub(crate) fn truncate_points(&mut self, len: usize) {
        self.points.truncate(len);
        self.point_labels.truncate(len);
    }

    /// Undo an AI refinement, restoring the raw point prompts.
    pub fn restore_raw(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.kind = raw.kind;
            self.points = raw.points;
            self.point_labels = raw.point_labels;
            self.mask = None;
        }
    }
}

/// Distance from `point` to the segment `a-b`.
fn distance_to_segment(point: &Point, a: &Point, b: &Point) -> f32 {
    let ab = *b - *a;
    let len_sq = ab.x * ab.x + ab.y * ab.y;
    if len_sq == 0.0 {
        return point.distance_to(a);
    }
    let ap = *point - *a;
    let t = ((ap.x * ab.x + ap.y * ab.y) / len_sq).clamp(0.0, 1.0);
    point.distance_to(&(*a + ab * t))
}
