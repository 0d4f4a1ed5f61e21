//! Material Description
//!
//! A declarative bag of shading parameters. Plain uniform values (`color`,
//! `opacity`, ...) are public fields and are read every draw. Everything that
//! selects a different program or pipeline state sits behind a setter or a
//! [`MutGuard`] so that [`Material::version`] moves with it; the renderer
//! re-derives the program cache key only when the version changes.

use std::sync::atomic::{AtomicU64, Ordering};

use glam::Vec3;
use wgpu::{BlendFactor, BlendOperation, CompareFunction, StencilOperation};
use xxhash_rust::xxh3::xxh3_64;

use crate::resources::TextureHandle;
use crate::resources::shader_defines::ShaderDefines;
use crate::resources::version_tracker::{ChangeTracker, MutGuard};

static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Pipeline state descriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Side {
    #[default]
    Front,
    Back,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendEquation {
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub operation: BlendOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Blending {
    None,
    #[default]
    Normal,
    Additive,
    Subtractive,
    Multiply,
    Custom {
        color: BlendEquation,
        alpha: BlendEquation,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilSettings {
    pub func: CompareFunction,
    pub reference: u32,
    pub read_mask: u32,
    pub write_mask: u32,
    pub fail: StencilOperation,
    pub depth_fail: StencilOperation,
    pub pass: StencilOperation,
}

impl Default for StencilSettings {
    fn default() -> Self {
        Self {
            func: CompareFunction::Always,
            reference: 0,
            read_mask: 0xff,
            write_mask: 0xff,
            fail: StencilOperation::Keep,
            depth_fail: StencilOperation::Keep,
            pass: StencilOperation::Keep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolygonOffset {
    pub factor: f32,
    pub units: f32,
}

/// Pipeline toggles requested by a material. Applied through the state
/// tracker before each draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderState {
    pub blending: Blending,
    pub premultiplied_alpha: bool,
    pub side: Side,
    /// Side rendered into shadow maps; `None` renders the opposite of `side`
    /// for single-sided materials.
    pub shadow_side: Option<Side>,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunction,
    pub color_write: bool,
    pub stencil: Option<StencilSettings>,
    pub polygon_offset: Option<PolygonOffset>,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            blending: Blending::Normal,
            premultiplied_alpha: false,
            side: Side::Front,
            shadow_side: None,
            depth_test: true,
            depth_write: true,
            depth_func: CompareFunction::LessEqual,
            color_write: true,
            stencil: None,
            polygon_offset: None,
        }
    }
}

// ============================================================================
// Material kinds
// ============================================================================

/// Custom shader source. Both stages are minijinja templates rendered with
/// the same context as built-in templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub vertex: String,
    pub fragment: String,
}

impl ShaderSource {
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        xxh3_64(self.vertex.as_bytes()) ^ xxh3_64(self.fragment.as_bytes()).rotate_left(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MaterialKind {
    /// Unlit.
    Basic,
    /// Per-fragment diffuse.
    Lambert,
    /// Diffuse plus Blinn-Phong specular.
    Phong { specular: Vec3, shininess: f32 },
    /// Writes depth only; used for shadow maps.
    Depth,
    /// Writes normalized distance to a point; used for point light shadows.
    Distance,
    Line { width: f32 },
    Points { size: f32 },
    Sprite { rotation: f32 },
    Shader(ShaderSource),
}

impl MaterialKind {
    /// Name of the fragment template used for this kind.
    #[must_use]
    pub fn template_name(&self) -> &'static str {
        match self {
            Self::Basic | Self::Line { .. } | Self::Points { .. } | Self::Sprite { .. } => "basic",
            Self::Lambert | Self::Phong { .. } => "lit",
            Self::Depth | Self::Distance => "depth",
            Self::Shader(_) => "custom",
        }
    }

    #[must_use]
    pub fn is_lit(&self) -> bool {
        matches!(self, Self::Lambert | Self::Phong { .. })
    }
}

// ============================================================================
// Material
// ============================================================================

#[derive(Debug)]
pub struct Material {
    id: u64,
    pub name: String,
    tracker: ChangeTracker,

    // === Uniform values ===
    pub color: Vec3,
    pub opacity: f32,
    pub emissive: Vec3,
    /// Hides every renderable using this material.
    pub visible: bool,

    // === Program-affecting values ===
    kind: MaterialKind,
    transparent: bool,
    alpha_test: f32,
    transmission: f32,
    map: Option<TextureHandle>,
    vertex_colors: bool,
    tone_mapped: bool,
    defines: ShaderDefines,

    render_state: RenderState,
}

impl Material {
    #[must_use]
    pub fn new(kind: MaterialKind) -> Self {
        Self {
            id: NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed),
            name: String::new(),
            tracker: ChangeTracker::new(),
            color: Vec3::ONE,
            opacity: 1.0,
            emissive: Vec3::ZERO,
            visible: true,
            kind,
            transparent: false,
            alpha_test: 0.0,
            transmission: 0.0,
            map: None,
            vertex_colors: false,
            tone_mapped: true,
            defines: ShaderDefines::new(),
            render_state: RenderState::default(),
        }
    }

    #[must_use]
    pub fn new_basic(color: Vec3) -> Self {
        Self::new(MaterialKind::Basic).with_color(color)
    }

    #[must_use]
    pub fn new_lambert(color: Vec3) -> Self {
        Self::new(MaterialKind::Lambert).with_color(color)
    }

    #[must_use]
    pub fn new_phong(color: Vec3, shininess: f32) -> Self {
        Self::new(MaterialKind::Phong {
            specular: Vec3::splat(0.067),
            shininess,
        })
        .with_color(color)
    }

    /// Depth-only material used as a shadow pass override.
    #[must_use]
    pub fn new_depth() -> Self {
        let mut m = Self::new(MaterialKind::Depth);
        m.render_state.blending = Blending::None;
        m
    }

    #[must_use]
    pub fn new_distance() -> Self {
        let mut m = Self::new(MaterialKind::Distance);
        m.render_state.blending = Blending::None;
        m
    }

    #[must_use]
    pub fn new_shader(vertex: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self::new(MaterialKind::Shader(ShaderSource {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }))
    }

    #[must_use]
    pub fn with_color(mut self, color: Vec3) -> Self {
        self.color = color;
        self
    }

    #[must_use]
    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self
    }

    /// Identity used as the material-id sort key and for cache maps.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.tracker.version()
    }

    /// Forces dependents to re-derive programs and pipeline state.
    pub fn needs_update(&mut self) {
        self.tracker.changed();
    }

    // === Kind ===

    #[must_use]
    pub fn kind(&self) -> &MaterialKind {
        &self.kind
    }

    pub fn set_kind(&mut self, kind: MaterialKind) {
        if self.kind != kind {
            self.kind = kind;
            self.tracker.changed();
        }
    }

    /// Mutable access to kind parameters (e.g. shininess). Bumps the version.
    pub fn kind_mut(&mut self) -> MutGuard<'_, MaterialKind> {
        MutGuard::new(&mut self.kind, &mut self.tracker)
    }

    // === Transparency ===

    #[must_use]
    pub fn transparent(&self) -> bool {
        self.transparent
    }

    pub fn set_transparent(&mut self, transparent: bool) {
        if self.transparent != transparent {
            self.transparent = transparent;
            self.tracker.changed();
        }
    }

    #[must_use]
    pub fn alpha_test(&self) -> f32 {
        self.alpha_test
    }

    /// Only toggling alpha testing on or off changes the program.
    pub fn set_alpha_test(&mut self, value: f32) {
        if (self.alpha_test > 0.0) != (value > 0.0) {
            self.tracker.changed();
        }
        self.alpha_test = value;
    }

    #[must_use]
    pub fn transmission(&self) -> f32 {
        self.transmission
    }

    /// Crossing zero moves the material between the opaque and transmissive
    /// buckets and changes the program.
    pub fn set_transmission(&mut self, value: f32) {
        if (self.transmission > 0.0) != (value > 0.0) {
            self.tracker.changed();
        }
        self.transmission = value;
    }

    // === Maps & Features ===

    #[must_use]
    pub fn map(&self) -> Option<TextureHandle> {
        self.map
    }

    pub fn set_map(&mut self, map: Option<TextureHandle>) {
        if self.map.is_some() != map.is_some() {
            self.tracker.changed();
        }
        self.map = map;
    }

    #[must_use]
    pub fn vertex_colors(&self) -> bool {
        self.vertex_colors
    }

    pub fn set_vertex_colors(&mut self, enabled: bool) {
        if self.vertex_colors != enabled {
            self.vertex_colors = enabled;
            self.tracker.changed();
        }
    }

    #[must_use]
    pub fn tone_mapped(&self) -> bool {
        self.tone_mapped
    }

    pub fn set_tone_mapped(&mut self, enabled: bool) {
        if self.tone_mapped != enabled {
            self.tone_mapped = enabled;
            self.tracker.changed();
        }
    }

    #[must_use]
    pub fn defines(&self) -> &ShaderDefines {
        &self.defines
    }

    pub fn defines_mut(&mut self) -> MutGuard<'_, ShaderDefines> {
        MutGuard::new(&mut self.defines, &mut self.tracker)
    }

    // === Pipeline State ===

    #[must_use]
    pub fn render_state(&self) -> &RenderState {
        &self.render_state
    }

    pub fn render_state_mut(&mut self) -> MutGuard<'_, RenderState> {
        MutGuard::new(&mut self.render_state, &mut self.tracker)
    }

    /// Side used when rendering into a shadow map.
    #[must_use]
    pub fn resolved_shadow_side(&self) -> Side {
        match (self.render_state.shadow_side, self.render_state.side) {
            (Some(side), _) => side,
            (None, Side::Front) => Side::Back,
            (None, Side::Back) => Side::Front,
            (None, Side::Double) => Side::Double,
        }
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::new(MaterialKind::Basic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_test_bumps_only_when_crossing_zero() {
        let mut m = Material::default();
        let v0 = m.version();

        m.set_alpha_test(0.5);
        let v1 = m.version();
        assert!(v1 > v0);

        m.set_alpha_test(0.7);
        assert_eq!(m.version(), v1);

        m.set_alpha_test(0.0);
        assert!(m.version() > v1);
    }

    #[test]
    fn uniform_changes_keep_version() {
        let mut m = Material::new_lambert(Vec3::ONE);
        let v0 = m.version();
        m.color = Vec3::X;
        m.opacity = 0.25;
        assert_eq!(m.version(), v0);
    }

    #[test]
    fn render_state_guard_bumps_version() {
        let mut m = Material::default();
        let v0 = m.version();
        m.render_state_mut().side = Side::Double;
        assert!(m.version() > v0);
        assert_eq!(m.resolved_shadow_side(), Side::Double);
    }
}
