//! Error types for the annotation canvas core.

use thiserror::Error;

use crate::ai::AiError;

/// Errors that can surface from canvas operations.
///
/// No operation silently drops a user edit: every committed mutation is
/// paired with a history snapshot, so recovery is always "undo".
#[derive(Error, Debug)]
pub enum CanvasError {
    /// Label code did not decode to a (class, intensity) pair.
    /// The targeted grid cell keeps its previous value.
    #[error("invalid label code: {code:?}")]
    InvalidLabelCode {
        /// The code that failed to decode
        code: String,
    },

    /// A boundary projection was requested for a segment that never crosses
    /// the image rectangle. Callers must only project segments with one
    /// endpoint inside the image.
    #[error("segment does not cross the image boundary")]
    NoBoundaryCrossing,

    /// An AI-assisted mode was used without an installed AI capability.
    #[error("no AI model is installed")]
    AiModelMissing,

    /// The AI capability failed; the in-progress shape is left uncommitted
    /// so the user can retry or cancel.
    #[error(transparent)]
    Ai(#[from] AiError),

    /// An operation needed an image but none is loaded.
    #[error("no image is loaded")]
    ImageMissing,
}
