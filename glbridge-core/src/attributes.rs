//! WebGL context creation attributes as an explicit record.
//!
//! Unknown fields are rejected instead of silently ignored.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    #[default]
    Default,
    LowPower,
    HighPerformance,
}

/// Attributes requested when a surface registers a context.
///
/// | field | default |
/// |-------|---------|
/// | `alpha` | `true` |
/// | `depth` | `true` |
/// | `stencil` | `false` |
/// | `antialias` | `true` |
/// | `premultipliedAlpha` | `true` |
/// | `preserveDrawingBuffer` | `false` |
/// | `powerPreference` | `"default"` |
/// | `failIfMajorPerformanceCaveat` | `false` |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ContextAttributes {
    pub alpha: bool,
    pub depth: bool,
    pub stencil: bool,
    pub antialias: bool,
    pub premultiplied_alpha: bool,
    /// Keep the drawing buffer contents across presents.
    pub preserve_drawing_buffer: bool,
    pub power_preference: PowerPreference,
    pub fail_if_major_performance_caveat: bool,
}

impl Default for ContextAttributes {
    fn default() -> Self {
        Self {
            alpha: true,
            depth: true,
            stencil: false,
            antialias: true,
            premultiplied_alpha: true,
            preserve_drawing_buffer: false,
            power_preference: PowerPreference::Default,
            fail_if_major_performance_caveat: false,
        }
    }
}

impl ContextAttributes {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}
