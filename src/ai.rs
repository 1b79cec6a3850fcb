//! The AI-assisted refinement capability.
//!
//! The canvas treats the model as opaque: given point prompts it returns a
//! polygon or a boolean raster mask. Model loading, weights, and inference
//! internals live behind this trait in the host application.

use image::RgbaImage;
use ndarray::Array2;
use thiserror::Error;

use crate::geometry::Point;

/// Errors from the AI capability. Failures are terminal for the refinement
/// attempt and are propagated, never silently swallowed.
#[derive(Error, Debug)]
pub enum AiError {
    /// The model has no image to predict against.
    #[error("no image set on the AI model")]
    ImageNotSet,

    /// Inference failed.
    #[error("AI prediction failed: {0}")]
    Prediction(String),

    /// The prediction produced an empty or unusable result.
    #[error("AI prediction returned an empty result")]
    EmptyResult,
}

/// An AI model that refines point prompts into shapes.
///
/// Point labels use 0 for negative prompts and 1 for positive prompts, one
/// per point.
pub trait AiModel {
    /// Model identifier for logging and configuration.
    fn name(&self) -> &str;

    /// Point the model at a new base image.
    fn set_image(&mut self, image: &RgbaImage) -> Result<(), AiError>;

    /// Refine point prompts into a polygon outline.
    fn predict_polygon_from_points(
        &mut self,
        points: &[Point],
        point_labels: &[u8],
    ) -> Result<Vec<Point>, AiError>;

    /// Refine point prompts into a full-image boolean mask.
    fn predict_mask_from_points(
        &mut self,
        points: &[Point],
        point_labels: &[u8],
    ) -> Result<Array2<bool>, AiError>;
}

/// Tight bounding box of the true cells of a mask as
/// `(row_min, col_min, row_max, col_max)`, inclusive.
pub fn mask_to_bbox(mask: &Array2<bool>) -> Option<(usize, usize, usize, usize)> {
    let mut bbox: Option<(usize, usize, usize, usize)> = None;
    for ((r, c), set) in mask.indexed_iter() {
        if !*set {
            continue;
        }
        bbox = Some(match bbox {
            None => (r, c, r, c),
            Some((r1, c1, r2, c2)) => (r1.min(r), c1.min(c), r2.max(r), c2.max(c)),
        });
    }
    bbox
}

/// Crop a mask to an inclusive bounding box.
pub fn crop_mask(
    mask: &Array2<bool>,
    bbox: (usize, usize, usize, usize),
) -> Array2<bool> {
    let (r1, c1, r2, c2) = bbox;
    Array2::from_shape_fn((r2 - r1 + 1, c2 - c1 + 1), |(r, c)| mask[[r1 + r, c1 + c]])
}
