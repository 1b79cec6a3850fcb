//! Canvas configuration.
//!
//! Host-provided knobs for the interaction core, serializable so the host
//! can persist them alongside its own settings.

use serde::{Deserialize, Serialize};

use crate::canvas::CreateMode;

/// Current configuration file format version.
/// Increment this when making breaking changes to the config format.
pub const CONFIG_VERSION: u32 = 1;

/// What a double click does while drawing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoubleClickMode {
    /// Double click is ignored.
    None,
    /// Double click closes a closable polygon / finalizes AI shapes.
    #[default]
    Close,
}

/// Per-creation-mode crosshair toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrosshairConfig {
    pub polygon: bool,
    pub rectangle: bool,
    pub circle: bool,
    pub line: bool,
    pub point: bool,
    pub linestrip: bool,
    pub ai_polygon: bool,
    pub ai_mask: bool,
    pub patch_annotation: bool,
}

impl Default for CrosshairConfig {
    fn default() -> Self {
        Self {
            polygon: false,
            rectangle: true,
            circle: false,
            line: false,
            point: false,
            linestrip: false,
            ai_polygon: false,
            ai_mask: false,
            patch_annotation: false,
        }
    }
}

impl CrosshairConfig {
    /// Whether the crosshair is enabled for a creation mode.
    pub fn enabled_for(&self, mode: CreateMode) -> bool {
        match mode {
            CreateMode::Polygon => self.polygon,
            CreateMode::Rectangle => self.rectangle,
            CreateMode::Circle => self.circle,
            CreateMode::Line => self.line,
            CreateMode::Point => self.point,
            CreateMode::LineStrip => self.linestrip,
            CreateMode::AiPolygon => self.ai_polygon,
            CreateMode::AiMask => self.ai_mask,
            CreateMode::PatchAnnotation => self.patch_annotation,
        }
    }
}

/// Configuration for a [`crate::canvas::Canvas`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasConfig {
    /// Version of the configuration format
    #[serde(default = "default_version")]
    pub version: u32,

    /// Vertex-snap tolerance in screen pixels; divided by the zoom scale at
    /// hit-test time.
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,

    /// Undo depth: the history keeps `num_backups + 1` snapshots.
    #[serde(default = "default_num_backups")]
    pub num_backups: usize,

    /// Double-click behavior while drawing.
    #[serde(default)]
    pub double_click: DoubleClickMode,

    /// Crosshair toggles per creation mode.
    #[serde(default)]
    pub crosshair: CrosshairConfig,

    /// Patch grid rows (vertical cell count).
    #[serde(default = "default_patch_dim")]
    pub patch_rows: usize,

    /// Patch grid columns (horizontal cell count).
    #[serde(default = "default_patch_dim")]
    pub patch_cols: usize,

    /// Arrow-key nudge step in image pixels.
    #[serde(default = "default_move_step")]
    pub move_step: f32,

    /// Whether in-progress shapes and patch labels are rendered filled.
    #[serde(default)]
    pub fill_drawing: bool,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_epsilon() -> f32 {
    10.0
}

fn default_num_backups() -> usize {
    10
}

fn default_patch_dim() -> usize {
    16
}

fn default_move_step() -> f32 {
    5.0
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            epsilon: default_epsilon(),
            num_backups: default_num_backups(),
            double_click: DoubleClickMode::default(),
            crosshair: CrosshairConfig::default(),
            patch_rows: default_patch_dim(),
            patch_cols: default_patch_dim(),
            move_step: default_move_step(),
            fill_drawing: false,
        }
    }
}

impl CanvasConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize the configuration to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize configuration from JSON, rejecting newer format versions.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        if config.version > CONFIG_VERSION {
            return Err(ConfigError::VersionTooNew {
                file_version: config.version,
                supported_version: CONFIG_VERSION,
            });
        }
        Ok(config)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// JSON parsing error
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Configuration version is newer than supported
    #[error(
        "configuration version {file_version} is newer than supported version {supported_version}"
    )]
    VersionTooNew {
        file_version: u32,
        supported_version: u32,
    },
}
