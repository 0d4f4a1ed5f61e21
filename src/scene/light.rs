use glam::{Mat4, Vec3};

/// Per-light shadow update state.
///
/// `NeedsUpdate → Rendering → Idle`; a light returns to `NeedsUpdate`
/// whenever it is flagged (`needs_update`) or `auto_update` is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShadowState {
    #[default]
    NeedsUpdate,
    Rendering,
    Idle,
}

#[derive(Debug, Clone)]
pub struct LightShadow {
    /// Requested map edge length; clamped to the backend's texture limit.
    pub map_size: u32,
    pub bias: f32,
    pub normal_bias: f32,
    /// Blur radius in texels, VSM only.
    pub radius: f32,
    pub near: f32,
    pub far: f32,
    /// Half extent of the orthographic box of a directional light.
    pub extent: f32,

    /// Re-render every frame.
    pub auto_update: bool,
    /// One-shot re-render request; cleared once rendered.
    pub needs_update: bool,

    pub(crate) state: ShadowState,
    /// One matrix for directional/spot, six for point lights.
    pub(crate) view_projections: Vec<Mat4>,
    pub(crate) rendered_size: u32,
}

impl Default for LightShadow {
    fn default() -> Self {
        Self {
            map_size: 512,
            bias: 0.005,
            normal_bias: 0.0,
            radius: 1.0,
            near: 0.5,
            far: 500.0,
            extent: 5.0,
            auto_update: true,
            needs_update: false,
            state: ShadowState::NeedsUpdate,
            view_projections: Vec::new(),
            rendered_size: 0,
        }
    }
}

impl LightShadow {
    #[must_use]
    pub fn state(&self) -> ShadowState {
        self.state
    }

    #[must_use]
    pub fn view_projections(&self) -> &[Mat4] {
        &self.view_projections
    }

    /// Map size used by the last render, after clamping.
    #[must_use]
    pub fn rendered_size(&self) -> u32 {
        self.rendered_size
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LightKind {
    Ambient,
    /// Shines from the node's world position towards `target`.
    Directional { target: Vec3 },
    Point { distance: f32, decay: f32 },
    Spot {
        target: Vec3,
        distance: f32,
        /// Outer cone half angle in radians.
        angle: f32,
        penumbra: f32,
        decay: f32,
    },
}

/// Light component. Shadow casting is controlled by the owning node's
/// `cast_shadow` flag together with `shadow`.
#[derive(Debug, Clone)]
pub struct Light {
    pub color: Vec3,
    pub intensity: f32,
    pub kind: LightKind,
    pub shadow: Option<LightShadow>,
}

impl Light {
    #[must_use]
    pub fn new_ambient(color: Vec3, intensity: f32) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Ambient,
            shadow: None,
        }
    }

    #[must_use]
    pub fn new_directional(color: Vec3, intensity: f32) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Directional { target: Vec3::ZERO },
            shadow: Some(LightShadow::default()),
        }
    }

    #[must_use]
    pub fn new_point(color: Vec3, intensity: f32, distance: f32) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Point {
                distance,
                decay: 2.0,
            },
            shadow: Some(LightShadow::default()),
        }
    }

    #[must_use]
    pub fn new_spot(color: Vec3, intensity: f32, distance: f32, angle: f32, penumbra: f32) -> Self {
        Self {
            color,
            intensity,
            kind: LightKind::Spot {
                target: Vec3::ZERO,
                distance,
                angle,
                penumbra,
                decay: 2.0,
            },
            shadow: Some(LightShadow::default()),
        }
    }

    #[must_use]
    pub fn shadow_mut(&mut self) -> Option<&mut LightShadow> {
        self.shadow.as_mut()
    }
}
