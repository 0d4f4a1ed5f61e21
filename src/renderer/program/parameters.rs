//! Program Parameters
//!
//! The semantic configuration a program is compiled from. Two parameter sets
//! with the same [`ProgramParameters::cache_key`] produce the same program;
//! the key never contains object identity.

use std::fmt::Write as _;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::resources::material::{Blending, MaterialKind, ShaderSource, Side};
use crate::resources::{ColorSpace, Material, ShaderDefines};
use crate::scene::DrawMode;

bitflags! {
    /// Shader variant switches.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ProgramFeatures: u32 {
        const USE_MAP             = 1 << 0;
        const USE_ALPHA_TEST      = 1 << 1;
        const USE_VERTEX_COLORS   = 1 << 2;
        const USE_TRANSMISSION    = 1 << 3;
        const USE_SHADOWMAP       = 1 << 4;
        const DOUBLE_SIDED        = 1 << 5;
        const FLIP_SIDED          = 1 << 6;
        const PREMULTIPLIED_ALPHA = 1 << 7;
        const TONE_MAPPED         = 1 << 8;
        const USE_POINTS          = 1 << 9;
        const USE_SPRITE          = 1 << 10;
        const USE_LINES           = 1 << 11;
        /// Depth programs write (depth, depth²) moments.
        const VSM_OUTPUT          = 1 << 12;
    }
}

impl ProgramFeatures {
    /// Define names injected into shader templates, in bit order.
    pub(crate) const DEFINE_NAMES: [(Self, &'static str); 13] = [
        (Self::USE_MAP, "USE_MAP"),
        (Self::USE_ALPHA_TEST, "USE_ALPHA_TEST"),
        (Self::USE_VERTEX_COLORS, "USE_VERTEX_COLORS"),
        (Self::USE_TRANSMISSION, "USE_TRANSMISSION"),
        (Self::USE_SHADOWMAP, "USE_SHADOWMAP"),
        (Self::DOUBLE_SIDED, "DOUBLE_SIDED"),
        (Self::FLIP_SIDED, "FLIP_SIDED"),
        (Self::PREMULTIPLIED_ALPHA, "PREMULTIPLIED_ALPHA"),
        (Self::TONE_MAPPED, "TONE_MAPPING"),
        (Self::USE_POINTS, "USE_POINTS"),
        (Self::USE_SPRITE, "USE_SPRITE"),
        (Self::USE_LINES, "USE_LINES"),
        (Self::VSM_OUTPUT, "VSM_OUTPUT"),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadingModel {
    Basic,
    Lambert,
    Phong,
    Depth,
    Distance,
    /// Separable Gaussian blur over VSM moments.
    VsmBlur,
    Custom,
}

impl ShadingModel {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Lambert => "lambert",
            Self::Phong => "phong",
            Self::Depth => "depth",
            Self::Distance => "distance",
            Self::VsmBlur => "vsm_blur",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowMapType {
    Basic,
    #[default]
    Pcf,
    Vsm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneMapping {
    #[default]
    None,
    Linear,
    Reinhard,
    AcesFilmic,
}

/// Light and shadow counts a program is specialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LightCounts {
    pub directional: u32,
    pub point: u32,
    pub spot: u32,
    pub directional_shadows: u32,
    pub point_shadows: u32,
    pub spot_shadows: u32,
}

impl LightCounts {
    #[must_use]
    pub fn shadow_count(&self) -> u32 {
        self.directional_shadows + self.point_shadows + self.spot_shadows
    }

    /// Same counts with every shadow removed.
    #[must_use]
    pub fn without_shadows(self) -> Self {
        Self {
            directional_shadows: 0,
            point_shadows: 0,
            spot_shadows: 0,
            ..self
        }
    }
}

/// Frame-level inputs to parameter derivation.
#[derive(Debug, Clone, Copy)]
pub struct ProgramEnvironment {
    pub lights: LightCounts,
    pub shadow_map_type: ShadowMapType,
    pub tone_mapping: ToneMapping,
    /// Color space of the bound target. Offscreen targets are linear.
    pub output_color_space: ColorSpace,
    pub receive_shadow: bool,
    pub has_vertex_colors: bool,
    pub draw_mode: DrawMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramParameters {
    pub template: &'static str,
    pub shading: ShadingModel,
    pub features: ProgramFeatures,
    pub lights: LightCounts,
    pub shadow_map_type: ShadowMapType,
    pub tone_mapping: ToneMapping,
    pub output_color_space: ColorSpace,
    pub defines: ShaderDefines,
    pub custom_source: Option<ShaderSource>,
    pub custom_hash: u64,
}

impl ProgramParameters {
    /// A bare parameter set for built-in utility programs.
    #[must_use]
    pub fn utility(template: &'static str, shading: ShadingModel) -> Self {
        Self {
            template,
            shading,
            features: ProgramFeatures::empty(),
            lights: LightCounts::default(),
            shadow_map_type: ShadowMapType::default(),
            tone_mapping: ToneMapping::None,
            output_color_space: ColorSpace::LinearSrgb,
            defines: ShaderDefines::new(),
            custom_source: None,
            custom_hash: 0,
        }
    }

    /// Derives the parameters a material needs in the given environment.
    #[must_use]
    pub fn for_material(material: &Material, env: &ProgramEnvironment) -> Self {
        let kind = material.kind();
        let shading = match kind {
            MaterialKind::Basic
            | MaterialKind::Line { .. }
            | MaterialKind::Points { .. }
            | MaterialKind::Sprite { .. } => ShadingModel::Basic,
            MaterialKind::Lambert => ShadingModel::Lambert,
            MaterialKind::Phong { .. } => ShadingModel::Phong,
            MaterialKind::Depth => ShadingModel::Depth,
            MaterialKind::Distance => ShadingModel::Distance,
            MaterialKind::Shader(_) => ShadingModel::Custom,
        };

        let state = material.render_state();
        let mut features = ProgramFeatures::empty();
        features.set(ProgramFeatures::USE_MAP, material.map().is_some());
        features.set(ProgramFeatures::USE_ALPHA_TEST, material.alpha_test() > 0.0);
        features.set(
            ProgramFeatures::USE_VERTEX_COLORS,
            material.vertex_colors() && env.has_vertex_colors,
        );
        features.set(ProgramFeatures::USE_TRANSMISSION, material.transmission() > 0.0);
        features.set(ProgramFeatures::DOUBLE_SIDED, state.side == Side::Double);
        features.set(ProgramFeatures::FLIP_SIDED, state.side == Side::Back);
        features.set(
            ProgramFeatures::PREMULTIPLIED_ALPHA,
            state.premultiplied_alpha && state.blending != Blending::None,
        );
        features.set(
            ProgramFeatures::TONE_MAPPED,
            material.tone_mapped() && env.tone_mapping != ToneMapping::None,
        );
        features.set(ProgramFeatures::USE_POINTS, env.draw_mode == DrawMode::Points);
        features.set(ProgramFeatures::USE_SPRITE, env.draw_mode == DrawMode::Sprite);
        features.set(
            ProgramFeatures::USE_LINES,
            matches!(env.draw_mode, DrawMode::Lines | DrawMode::LineStrip),
        );

        let lit = kind.is_lit() || shading == ShadingModel::Custom;
        let lights = if lit {
            if env.receive_shadow {
                env.lights
            } else {
                env.lights.without_shadows()
            }
        } else {
            LightCounts::default()
        };
        features.set(ProgramFeatures::USE_SHADOWMAP, lights.shadow_count() > 0);

        let (custom_source, custom_hash) = match kind {
            MaterialKind::Shader(source) => (Some(source.clone()), source.content_hash()),
            _ => (None, 0),
        };

        Self {
            template: kind.template_name(),
            shading,
            features,
            lights,
            shadow_map_type: env.shadow_map_type,
            tone_mapping: if features.contains(ProgramFeatures::TONE_MAPPED) {
                env.tone_mapping
            } else {
                ToneMapping::None
            },
            output_color_space: env.output_color_space,
            defines: material.defines().clone(),
            custom_source,
            custom_hash,
        }
    }

    /// Deterministic key: equal semantic configuration, equal key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let l = &self.lights;
        let mut key = format!(
            "{}|{}|{:04x}|{},{},{}|{},{},{}|{:?}|{:?}|{}",
            self.template,
            self.shading.name(),
            self.features.bits(),
            l.directional,
            l.point,
            l.spot,
            l.directional_shadows,
            l.point_shadows,
            l.spot_shadows,
            self.shadow_map_type,
            self.tone_mapping,
            self.output_color_space.name(),
        );
        for (name, value) in self.defines.to_map() {
            let _ = write!(key, "|{name}={value}");
        }
        if self.custom_source.is_some() {
            let _ = write!(key, "|src:{:016x}", self.custom_hash);
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> ProgramEnvironment {
        ProgramEnvironment {
            lights: LightCounts {
                directional: 1,
                directional_shadows: 1,
                ..LightCounts::default()
            },
            shadow_map_type: ShadowMapType::Pcf,
            tone_mapping: ToneMapping::None,
            output_color_space: ColorSpace::Srgb,
            receive_shadow: true,
            has_vertex_colors: false,
            draw_mode: DrawMode::Triangles,
        }
    }

    #[test]
    fn unlit_materials_ignore_lights() {
        let params = ProgramParameters::for_material(&Material::new_basic(glam::Vec3::ONE), &env());
        assert_eq!(params.lights, LightCounts::default());
        assert!(!params.features.contains(ProgramFeatures::USE_SHADOWMAP));
    }

    #[test]
    fn shadow_receiving_is_per_node() {
        let material = Material::new_lambert(glam::Vec3::ONE);
        let mut e = env();
        let with = ProgramParameters::for_material(&material, &e);
        e.receive_shadow = false;
        let without = ProgramParameters::for_material(&material, &e);
        assert!(with.features.contains(ProgramFeatures::USE_SHADOWMAP));
        assert!(!without.features.contains(ProgramFeatures::USE_SHADOWMAP));
        assert_ne!(with.cache_key(), without.cache_key());
    }

    #[test]
    fn define_order_does_not_change_key() {
        let mut a = Material::new_basic(glam::Vec3::ONE);
        a.defines_mut().set("A_FLAG", "1");
        a.defines_mut().set("B_FLAG", "2");
        let mut b = Material::new_basic(glam::Vec3::ONE);
        b.defines_mut().set("B_FLAG", "2");
        b.defines_mut().set("A_FLAG", "1");

        let ka = ProgramParameters::for_material(&a, &env()).cache_key();
        let kb = ProgramParameters::for_material(&b, &env()).cache_key();
        assert_eq!(ka, kb);
    }
}
