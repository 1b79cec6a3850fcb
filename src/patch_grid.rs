//! The per-patch label grid.
//!
//! A [`LabelGrid`] is a `rows × cols` array of `(class, intensity)` pairs
//! aligned to the image's patch grid. It is owned by the canvas and has a
//! lifecycle independent from the shapes: it is re-derived from
//! patch-annotation shapes when their coverage changes, reinitialized when
//! the grid dimensions change or shapes are cleared, and otherwise preserved
//! across image reloads.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::CanvasError;

/// One grid cell: class digit 0..=6 and intensity digit 0..=4.
/// `(0, 0)` means unlabeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatchLabel {
    pub class: u8,
    pub intensity: u8,
}

impl PatchLabel {
    pub const UNLABELED: PatchLabel = PatchLabel { class: 0, intensity: 0 };

    pub fn new(class: u8, intensity: u8) -> Self {
        Self { class, intensity }
    }

    pub fn is_labeled(&self) -> bool {
        self.class != 0
    }
}

/// Decode a label code of the form `"<class_digit><intensity_char>"`.
///
/// The intensity character maps q→1, w→2, e→3, r→4. A leading `'0'` decodes
/// to the unlabeled cell regardless of what follows. Anything else is an
/// invalid code.
pub fn decode_label_code(code: &str) -> Result<PatchLabel, CanvasError> {
    let invalid = || CanvasError::InvalidLabelCode { code: code.to_string() };
    let mut chars = code.chars();
    let class_char = chars.next().ok_or_else(invalid)?;
    if class_char == '0' {
        return Ok(PatchLabel::UNLABELED);
    }
    let class = class_char.to_digit(10).ok_or_else(invalid)? as u8;
    if !(1..=6).contains(&class) {
        return Err(invalid());
    }
    let intensity = match chars.next() {
        Some('q') => 1,
        Some('w') => 2,
        Some('e') => 3,
        Some('r') => 4,
        _ => return Err(invalid()),
    };
    Ok(PatchLabel::new(class, intensity))
}

/// Pending class tag selected via the digit keys (or X for the eraser).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassTag {
    /// One of the six annotation classes.
    Class(u8),
    /// The eraser: stamped cells are cleared.
    Clean,
}

/// Pending intensity tag selected via Q/W (or X for the eraser).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntensityTag {
    Blurry,
    Blockage,
    Clean,
}

impl IntensityTag {
    fn code_char(&self) -> char {
        match self {
            // Clean is normalized to Blurry before a code is built; the
            // class digit 0 clears the cell regardless.
            IntensityTag::Blurry | IntensityTag::Clean => 'q',
            IntensityTag::Blockage => 'w',
        }
    }
}

/// Build the label code stamped onto a freshly created patch shape from the
/// pending tag pair. A class without an explicit intensity defaults to the
/// first tier; no class means no code.
pub fn label_code_for(class: Option<ClassTag>, intensity: Option<IntensityTag>) -> Option<String> {
    match class? {
        ClassTag::Clean => Some("0q".to_string()),
        ClassTag::Class(n) if (1..=6).contains(&n) => {
            let intensity = intensity.unwrap_or(IntensityTag::Blurry);
            Some(format!("{n}{}", intensity.code_char()))
        }
        ClassTag::Class(_) => None,
    }
}

/// The patch label grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelGrid {
    cells: Array2<PatchLabel>,
}

impl LabelGrid {
    /// Create an all-unlabeled grid of `rows × cols` cells.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            cells: Array2::from_elem((rows, cols), PatchLabel::UNLABELED),
        }
    }

    pub fn rows(&self) -> usize {
        self.cells.nrows()
    }

    pub fn cols(&self) -> usize {
        self.cells.ncols()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<PatchLabel> {
        self.cells.get([row, col]).copied()
    }

    /// Decode `code` and store it at `(row, col)`. An invalid code fails the
    /// operation and the previous cell value is retained.
    pub fn set_label(&mut self, row: usize, col: usize, code: &str) -> Result<(), CanvasError> {
        let label = decode_label_code(code)?;
        if let Some(cell) = self.cells.get_mut([row, col]) {
            *cell = label;
        }
        Ok(())
    }

    /// Relabel every covered cell from a coverage mask. Cells outside the
    /// mask are left untouched (labels are sticky until overwritten).
    pub fn apply_coverage(&mut self, coverage: &Array2<bool>, code: &str) -> Result<(), CanvasError> {
        let label = decode_label_code(code)?;
        for ((r, c), covered) in coverage.indexed_iter() {
            if *covered {
                if let Some(cell) = self.cells.get_mut([r, c]) {
                    *cell = label;
                }
            }
        }
        Ok(())
    }

    /// Reset every cell to unlabeled.
    pub fn reset(&mut self) {
        self.cells.fill(PatchLabel::UNLABELED);
    }

    /// Iterate labeled cells as `((row, col), label)`.
    pub fn labeled_cells(&self) -> impl Iterator<Item = ((usize, usize), PatchLabel)> + '_ {
        self.cells
            .indexed_iter()
            .filter(|(_, label)| label.is_labeled())
            .map(|(idx, label)| (idx, *label))
    }

    /// Deep copy for the history and clipboard. `LabelGrid` is `Clone`; this
    /// alias exists to make the no-aliasing intent explicit at call sites.
    pub fn snapshot(&self) -> LabelGrid {
        self.clone()
    }

    /// Replace the live cells with a stored snapshot.
    pub fn restore(&mut self, snapshot: &LabelGrid) {
        self.cells = snapshot.cells.clone();
    }
}
