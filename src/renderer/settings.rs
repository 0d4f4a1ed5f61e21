//! Renderer Settings & Color Management
//!
//! Configuration is explicit: a [`RendererSettings`] value is handed to
//! [`Renderer::new`] and can be changed later through the renderer's
//! setters. Nothing is read from global state.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use myth_forward::renderer::{RendererSettings, ToneMapping};
//!
//! let settings = RendererSettings {
//!     tone_mapping: ToneMapping::AcesFilmic,
//!     shadow_map_enabled: true,
//!     ..Default::default()
//! };
//!
//! // Or from a config file
//! let settings = RendererSettings::from_json(r#"{ "output_color_space": "srgb-linear" }"#)?;
//! ```
//!
//! [`Renderer::new`]: crate::renderer::Renderer::new

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::renderer::program::{ShadowMapType, ToneMapping};
use crate::resources::ColorSpace;

// ---------------------------------------------------------------------------
// ColorManagement
// ---------------------------------------------------------------------------

/// Color conversion policy.
///
/// Colors handed to the renderer (clear color, material colors) are in the
/// working color space. When enabled, values written without shading (the
/// clear color) are converted to the output color space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorManagement {
    pub enabled: bool,
    pub working_color_space: ColorSpace,
}

impl Default for ColorManagement {
    fn default() -> Self {
        Self {
            enabled: true,
            working_color_space: ColorSpace::LinearSrgb,
        }
    }
}

#[must_use]
pub fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

#[must_use]
pub fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

impl ColorManagement {
    /// Converts `color` between color spaces. Identity when disabled.
    #[must_use]
    pub fn convert(&self, color: Vec3, from: ColorSpace, to: ColorSpace) -> Vec3 {
        if !self.enabled || from == to {
            return color;
        }
        match (from, to) {
            (ColorSpace::Srgb, ColorSpace::LinearSrgb) => color.to_array().map(srgb_to_linear).into(),
            (ColorSpace::LinearSrgb, ColorSpace::Srgb) => color.to_array().map(linear_to_srgb).into(),
            _ => color,
        }
    }

    #[must_use]
    pub fn to_working(&self, color: Vec3, from: ColorSpace) -> Vec3 {
        self.convert(color, from, self.working_color_space)
    }

    #[must_use]
    pub fn from_working(&self, color: Vec3, to: ColorSpace) -> Vec3 {
        self.convert(color, self.working_color_space, to)
    }
}

// ---------------------------------------------------------------------------
// RendererSettings
// ---------------------------------------------------------------------------

/// Renderer configuration.
///
/// | Field                            | Description                                  | Default        |
/// |----------------------------------|----------------------------------------------|----------------|
/// | `width`, `height`                | Drawing buffer size in CSS pixels            | 800 x 600      |
/// | `pixel_ratio`                    | Device pixels per CSS pixel                  | 1.0            |
/// | `clear_color`, `clear_alpha`     | Default clear, working color space           | black, 1.0     |
/// | `auto_clear`                     | Clear the target at the start of `render`    | `true`         |
/// | `sort_objects`                   | Sort render lists                            | `true`         |
/// | `output_color_space`             | Encoding of the default framebuffer          | `srgb`         |
/// | `tone_mapping`                   | Tone mapping operator for screen output      | `none`         |
/// | `tone_mapping_exposure`          | Exposure applied before tone mapping         | 1.0            |
/// | `shadow_map_enabled`             | Render shadow maps                           | `false`        |
/// | `shadow_map_type`                | Shadow filtering                             | `pcf`          |
/// | `transmission_resolution_scale`  | Size of the transmission target vs. viewport | 1.0            |
/// | `transmission_samples`           | MSAA samples of the transmission target      | 4              |
/// | `max_fence_polls`                | Poll budget of async readback                | 120            |
/// | `max_texture_size`               | Caps the backend's texture limit             | `None`         |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    // === Drawing Buffer ===
    pub width: u32,
    pub height: u32,
    pub pixel_ratio: f32,

    // === Clearing ===
    pub clear_color: [f32; 3],
    pub clear_alpha: f32,
    pub auto_clear: bool,

    // === Lists ===
    pub sort_objects: bool,

    // === Output ===
    pub output_color_space: ColorSpace,
    pub tone_mapping: ToneMapping,
    pub tone_mapping_exposure: f32,
    pub color_management: ColorManagement,

    // === Shadows ===
    pub shadow_map_enabled: bool,
    pub shadow_map_type: ShadowMapType,

    // === Transmission ===
    pub transmission_resolution_scale: f32,
    pub transmission_samples: u32,

    // === Readback ===
    pub max_fence_polls: u32,

    /// Lowers `max_texture_dimension_2d` below what the backend reports.
    pub max_texture_size: Option<u32>,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            pixel_ratio: 1.0,
            clear_color: [0.0, 0.0, 0.0],
            clear_alpha: 1.0,
            auto_clear: true,
            sort_objects: true,
            output_color_space: ColorSpace::Srgb,
            tone_mapping: ToneMapping::None,
            tone_mapping_exposure: 1.0,
            color_management: ColorManagement::default(),
            shadow_map_enabled: false,
            shadow_map_type: ShadowMapType::Pcf,
            transmission_resolution_scale: 1.0,
            transmission_samples: 4,
            max_fence_polls: 120,
            max_texture_size: None,
        }
    }
}

impl RendererSettings {
    /// Parses settings from JSON. Missing fields take their defaults.
    ///
    /// Color space names are checked first so that an unknown name is
    /// reported as [`EngineError::UnknownColorSpace`].
    ///
    /// [`EngineError::UnknownColorSpace`]: crate::errors::EngineError::UnknownColorSpace
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if let Some(name) = value.get("output_color_space").and_then(|v| v.as_str()) {
            ColorSpace::from_name(name)?;
        }
        if let Some(name) = value
            .get("color_management")
            .and_then(|cm| cm.get("working_color_space"))
            .and_then(|v| v.as_str())
        {
            ColorSpace::from_name(name)?;
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Drawing buffer size in device pixels.
    #[must_use]
    pub fn drawing_buffer_size(&self) -> (u32, u32) {
        (
            ((self.width as f32 * self.pixel_ratio).floor() as u32).max(1),
            ((self.height as f32 * self.pixel_ratio).floor() as u32).max(1),
        )
    }
}
