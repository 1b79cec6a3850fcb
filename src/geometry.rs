//! Geometry primitives for the annotation canvas.
//!
//! This module provides the core geometric types and algorithms:
//! - 2D points and axis-aligned rectangles in image coordinates
//! - Proximity tests with zoom-scaled thresholds
//! - Segment intersection against the image boundary rectangle
//! - Rasterization of shapes onto the patch grid

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::shape::Shape;

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean norm of this point interpreted as a vector.
    pub fn norm(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Calculate distance to another point.
    pub fn distance_to(&self, other: &Point) -> f32 {
        (*self - *other).norm()
    }
}

impl std::ops::Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Mul<f32> for Point {
    type Output = Point;
    fn mul(self, rhs: f32) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

/// An axis-aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Top-left corner X coordinate
    pub x: f32,
    /// Top-left corner Y coordinate
    pub y: f32,
    /// Width of the rectangle
    pub width: f32,
    /// Height of the rectangle
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Create a rectangle from two corner points (any opposing pair).
    pub fn from_corners(p1: Point, p2: Point) -> Self {
        let x = p1.x.min(p2.x);
        let y = p1.y.min(p2.y);
        Self {
            x,
            y,
            width: (p1.x - p2.x).abs(),
            height: (p1.y - p2.y).abs(),
        }
    }

    pub fn left(&self) -> f32 {
        self.x
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn top(&self) -> f32 {
        self.y
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Check if a point is inside the rectangle (edges inclusive).
    pub fn contains(&self, point: &Point) -> bool {
        point.x >= self.x
            && point.x <= self.x + self.width
            && point.y >= self.y
            && point.y <= self.y + self.height
    }
}

/// Pixel dimensions of the annotated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True if the point lies outside the image pixel rectangle.
    /// Valid coordinates span `0..=width-1` and `0..=height-1`.
    pub fn out_of_bounds(&self, p: &Point) -> bool {
        !(0.0 <= p.x
            && p.x <= (self.width - 1) as f32
            && 0.0 <= p.y
            && p.y <= (self.height - 1) as f32)
    }
}

/// True iff the two points are closer than `threshold`.
///
/// The caller divides the configured epsilon by the current zoom scale so
/// that snapping gets more precise when zoomed in.
pub fn close_enough(p1: &Point, p2: &Point, threshold: f32) -> bool {
    p1.distance_to(p2) < threshold
}

/// Where the segment `p1 -> p2` crosses the image boundary rectangle.
///
/// `p1` is expected to lie within the image and `p2` outside it. All four
/// boundary edges are tested for segment intersection; among the crossings
/// the one whose edge midpoint is closest to `p2` wins, ties broken by edge
/// order (clockwise from the top edge). Parallel or coincident edges have a
/// zero determinant and are skipped.
///
/// Returns `None` when no crossing exists, which callers must treat as a
/// violated precondition.
pub fn intersection_point(p1: &Point, p2: &Point, size: &ImageSize) -> Option<Point> {
    let w = (size.width - 1) as f32;
    let h = (size.height - 1) as f32;
    let corners = [
        Point::new(0.0, 0.0),
        Point::new(w, 0.0),
        Point::new(w, h),
        Point::new(0.0, h),
    ];

    // Clamp the inside endpoint onto the image in case of float drift.
    let a = Point::new(p1.x.clamp(0.0, w), p1.y.clamp(0.0, h));

    let mut best: Option<(f32, usize, Point)> = None;
    for i in 0..4 {
        let e1 = corners[i];
        let e2 = corners[(i + 1) % 4];
        let Some(hit) = segment_intersection(&a, p2, &e1, &e2) else {
            continue;
        };
        let mid = (e1 + e2) * 0.5;
        let d = mid.distance_to(p2);
        let better = match &best {
            None => true,
            Some((bd, bi, _)) => d < *bd || (d == *bd && i < *bi),
        };
        if better {
            best = Some((d, i, hit));
        }
    }

    let (_, i, hit) = best?;
    if hit == a {
        // The inside point already sits on an edge; project the outside
        // point onto that edge instead of returning the degenerate hit.
        let e1 = corners[i];
        let e2 = corners[(i + 1) % 4];
        if e1.x == e2.x {
            return Some(Point::new(e1.x, p2.y.clamp(0.0, e1.y.max(e2.y))));
        }
        return Some(Point::new(p2.x.clamp(0.0, e1.x.max(e2.x)), e1.y));
    }
    Some(hit)
}

/// Intersection of segments `a1-a2` and `b1-b2` via the parametric
/// determinant form. Returns `None` for parallel/coincident segments or when
/// the crossing falls outside either segment.
fn segment_intersection(a1: &Point, a2: &Point, b1: &Point, b2: &Point) -> Option<Point> {
    let denom = (b2.y - b1.y) * (a2.x - a1.x) - (b2.x - b1.x) * (a2.y - a1.y);
    if denom == 0.0 {
        return None;
    }
    let nua = (b2.x - b1.x) * (a1.y - b1.y) - (b2.y - b1.y) * (a1.x - b1.x);
    let nub = (a2.x - a1.x) * (a1.y - b1.y) - (a2.y - a1.y) * (a1.x - b1.x);
    let ua = nua / denom;
    let ub = nub / denom;
    if (0.0..=1.0).contains(&ua) && (0.0..=1.0).contains(&ub) {
        Some(Point::new(
            a1.x + ua * (a2.x - a1.x),
            a1.y + ua * (a2.y - a1.y),
        ))
    } else {
        None
    }
}

/// Ray-cast point-in-polygon test over an ordered vertex list.
pub fn polygon_contains(vertices: &[Point], point: &Point) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let n = vertices.len();
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let vi = &vertices[i];
        let vj = &vertices[j];
        if ((vi.y > point.y) != (vj.y > point.y))
            && (point.x < (vj.x - vi.x) * (point.y - vi.y) / (vj.y - vi.y) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// The patch cell containing a point, clamped to the grid.
pub fn patch_cell(
    point: &Point,
    size: &ImageSize,
    rows: usize,
    cols: usize,
) -> (usize, usize) {
    let cell_w = (size.width as f32 / cols as f32).max(1.0);
    let cell_h = (size.height as f32 / rows as f32).max(1.0);
    let col = ((point.x / cell_w) as usize).min(cols.saturating_sub(1));
    let row = ((point.y / cell_h) as usize).min(rows.saturating_sub(1));
    (row, col)
}

/// Rasterize a shape onto the patch grid as a boolean coverage mask.
///
/// A cell is covered when one of the shape's points falls inside it, or,
/// for closed shapes with at least three points, when the cell center lies
/// inside the polygon. Used only for patch-annotation shapes.
pub fn shape_to_patch_mask(
    shape: &Shape,
    size: &ImageSize,
    rows: usize,
    cols: usize,
) -> Array2<bool> {
    let mut mask = Array2::from_elem((rows, cols), false);
    for p in shape.points() {
        let (r, c) = patch_cell(p, size, rows, cols);
        mask[[r, c]] = true;
    }
    if shape.is_closed() && shape.points().len() >= 3 {
        let cell_w = size.width as f32 / cols as f32;
        let cell_h = size.height as f32 / rows as f32;
        for r in 0..rows {
            for c in 0..cols {
                if mask[[r, c]] {
                    continue;
                }
                let center = Point::new(
                    (c as f32 + 0.5) * cell_w,
                    (r as f32 + 0.5) * cell_h,
                );
                if polygon_contains(shape.points(), &center) {
                    mask[[r, c]] = true;
                }
            }
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{Shape, ShapeId, ShapeKind};

    #[test]
    fn test_point_distance() {
        let p1 = Point::new(0.0, 0.0);
        let p2 = Point::new(3.0, 4.0);
        assert!((p1.distance_to(&p2) - 5.0).abs() < 0.001);
    }

    #[test]
    fn test_close_enough_threshold() {
        let p1 = Point::new(0.0, 0.0);
        let p2 = Point::new(3.0, 4.0);
        assert!(close_enough(&p1, &p2, 5.1));
        assert!(!close_enough(&p1, &p2, 5.0));
    }

    #[test]
    fn test_rect_from_corners_order_independent() {
        let a = Rect::from_corners(Point::new(10.0, 20.0), Point::new(50.0, 80.0));
        let b = Rect::from_corners(Point::new(50.0, 80.0), Point::new(10.0, 20.0));
        assert_eq!(a, b);
        assert_eq!(a.width, 40.0);
        assert_eq!(a.height, 60.0);
    }

    #[test]
    fn test_out_of_bounds() {
        let size = ImageSize::new(100, 50);
        assert!(!size.out_of_bounds(&Point::new(0.0, 0.0)));
        assert!(!size.out_of_bounds(&Point::new(99.0, 49.0)));
        assert!(size.out_of_bounds(&Point::new(100.0, 10.0)));
        assert!(size.out_of_bounds(&Point::new(-0.5, 10.0)));
    }

    fn on_boundary(p: &Point, size: &ImageSize) -> bool {
        let w = (size.width - 1) as f32;
        let h = (size.height - 1) as f32;
        let eps = 1e-3;
        (p.x.abs() < eps || (p.x - w).abs() < eps || p.y.abs() < eps || (p.y - h).abs() < eps)
            && (-eps..=w + eps).contains(&p.x)
            && (-eps..=h + eps).contains(&p.y)
    }

    #[test]
    fn test_intersection_lands_on_boundary() {
        let size = ImageSize::new(640, 480);
        let inside = Point::new(320.0, 240.0);
        for outside in [
            Point::new(1000.0, 240.0),
            Point::new(-50.0, 10.0),
            Point::new(320.0, -90.0),
            Point::new(700.0, 700.0),
            Point::new(-30.0, 500.0),
        ] {
            let hit = intersection_point(&inside, &outside, &size)
                .expect("segment from center must cross the boundary");
            assert!(on_boundary(&hit, &size), "{hit:?} not on boundary");
        }
    }

    #[test]
    fn test_intersection_from_edge_point() {
        // Inside point already on the left edge, dragging further left.
        let size = ImageSize::new(100, 100);
        let inside = Point::new(0.0, 50.0);
        let outside = Point::new(-20.0, 60.0);
        let hit = intersection_point(&inside, &outside, &size).unwrap();
        assert_eq!(hit.x, 0.0);
        assert_eq!(hit.y, 60.0);
    }

    #[test]
    fn test_polygon_contains_square() {
        let square = [
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(100.0, 100.0),
            Point::new(0.0, 100.0),
        ];
        assert!(polygon_contains(&square, &Point::new(50.0, 50.0)));
        assert!(!polygon_contains(&square, &Point::new(150.0, 50.0)));
    }

    #[test]
    fn test_patch_mask_quadrant() {
        let size = ImageSize::new(640, 480);
        let mut shape = Shape::new(ShapeId(0), ShapeKind::PatchAnnotation);
        shape.add_point(Point::new(0.0, 0.0), 1);
        shape.add_point(Point::new(319.0, 0.0), 1);
        shape.add_point(Point::new(319.0, 239.0), 1);
        shape.add_point(Point::new(0.0, 239.0), 1);
        shape.close();

        let mask = shape_to_patch_mask(&shape, &size, 16, 16);
        for r in 0..16 {
            for c in 0..16 {
                let expected = r < 8 && c < 8;
                assert_eq!(mask[[r, c]], expected, "cell ({r},{c})");
            }
        }
    }
}
