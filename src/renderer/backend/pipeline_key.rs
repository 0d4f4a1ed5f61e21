//! Render pipeline keys.
//!
//! The GPU backend receives pipeline state as individual toggles from the
//! [`StateTracker`] and folds them, together with the program, the vertex
//! layout and the bound attachments, into one [`PipelineKey`] per draw.
//! `wgpu` descriptor types do not all implement `Hash`, so the key holds
//! hashable mirrors of the fields that matter for pipeline identity.
//!
//! [`StateTracker`]: crate::renderer::state::StateTracker

use std::hash::{Hash, Hasher};

use smallvec::SmallVec;

use super::StencilConfig;
use super::raster::FixedState;
use crate::scene::DrawMode;

// ─── Hashable Mirror Types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponentKey {
    pub src_factor: wgpu::BlendFactor,
    pub dst_factor: wgpu::BlendFactor,
    pub operation: wgpu::BlendOperation,
}

impl From<wgpu::BlendComponent> for BlendComponentKey {
    fn from(b: wgpu::BlendComponent) -> Self {
        Self {
            src_factor: b.src_factor,
            dst_factor: b.dst_factor,
            operation: b.operation,
        }
    }
}

impl From<BlendComponentKey> for wgpu::BlendComponent {
    fn from(b: BlendComponentKey) -> Self {
        Self {
            src_factor: b.src_factor,
            dst_factor: b.dst_factor,
            operation: b.operation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendStateKey {
    pub color: BlendComponentKey,
    pub alpha: BlendComponentKey,
}

impl From<wgpu::BlendState> for BlendStateKey {
    fn from(b: wgpu::BlendState) -> Self {
        Self {
            color: b.color.into(),
            alpha: b.alpha.into(),
        }
    }
}

impl From<BlendStateKey> for wgpu::BlendState {
    fn from(b: BlendStateKey) -> Self {
        Self {
            color: b.color.into(),
            alpha: b.alpha.into(),
        }
    }
}

/// Mirror of `wgpu::ColorTargetState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorTargetKey {
    pub format: wgpu::TextureFormat,
    pub blend: Option<BlendStateKey>,
    /// `wgpu::ColorWrites` bits
    pub write_mask: u32,
}

impl ColorTargetKey {
    #[must_use]
    pub fn state(&self) -> wgpu::ColorTargetState {
        wgpu::ColorTargetState {
            format: self.format,
            blend: self.blend.map(Into::into),
            write_mask: wgpu::ColorWrites::from_bits_truncate(self.write_mask),
        }
    }
}

/// Mirror of `wgpu::StencilState`; both faces share one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StencilStateKey {
    pub face: Option<wgpu::StencilFaceState>,
    pub read_mask: u32,
    pub write_mask: u32,
}

impl From<Option<StencilConfig>> for StencilStateKey {
    fn from(config: Option<StencilConfig>) -> Self {
        config.map_or_else(Self::default, |c| Self {
            face: Some(c.face),
            read_mask: c.read_mask,
            write_mask: c.write_mask,
        })
    }
}

impl StencilStateKey {
    #[must_use]
    pub fn state(&self) -> wgpu::StencilState {
        let face = self.face.unwrap_or(wgpu::StencilFaceState::IGNORE);
        wgpu::StencilState {
            front: face,
            back: face,
            read_mask: self.read_mask,
            write_mask: self.write_mask,
        }
    }
}

/// Mirror of `wgpu::DepthBiasState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthBiasKey {
    pub constant: i32,
    pub slope_scale_bits: u32,
}

/// Mirror of `wgpu::DepthStencilState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilKey {
    pub format: wgpu::TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: wgpu::CompareFunction,
    pub stencil: StencilStateKey,
    pub bias: DepthBiasKey,
}

impl DepthStencilKey {
    #[must_use]
    pub fn state(&self) -> wgpu::DepthStencilState {
        wgpu::DepthStencilState {
            format: self.format,
            depth_write_enabled: Some(self.depth_write_enabled),
            depth_compare: Some(self.depth_compare),
            stencil: self.stencil.state(),
            bias: wgpu::DepthBiasState {
                constant: self.bias.constant,
                slope_scale: f32::from_bits(self.bias.slope_scale_bits),
                clamp: 0.0,
            },
        }
    }
}

/// One vertex buffer slot. `stride == 0` feeds a constant default value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexSlotKey {
    pub location: u32,
    pub format: wgpu::VertexFormat,
    pub stride: u64,
}

// ─── Pipeline Key ─────────────────────────────────────────────────────────────

/// Attachments a draw renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetFormats {
    pub color: wgpu::TextureFormat,
    pub depth: Option<wgpu::TextureFormat>,
    pub samples: u32,
}

/// Everything that identifies a render pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub program: u64,
    pub vertex: SmallVec<[VertexSlotKey; 4]>,
    pub topology: wgpu::PrimitiveTopology,
    pub cull_mode: Option<wgpu::Face>,
    pub front_face: wgpu::FrontFace,
    pub color: ColorTargetKey,
    pub depth_stencil: Option<DepthStencilKey>,
    pub samples: u32,
}

#[must_use]
pub fn topology(mode: DrawMode) -> wgpu::PrimitiveTopology {
    match mode {
        DrawMode::Triangles | DrawMode::Sprite => wgpu::PrimitiveTopology::TriangleList,
        DrawMode::Lines => wgpu::PrimitiveTopology::LineList,
        DrawMode::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        DrawMode::Points => wgpu::PrimitiveTopology::PointList,
    }
}

/// Float32 color targets cannot blend without an optional device feature.
fn blendable(format: wgpu::TextureFormat) -> bool {
    !matches!(
        format,
        wgpu::TextureFormat::R32Float | wgpu::TextureFormat::Rg32Float | wgpu::TextureFormat::Rgba32Float
    )
}

impl PipelineKey {
    /// Folds the fixed-function toggles into a key.
    ///
    /// A disabled depth test compares `Always` and never writes. Depth bias
    /// only applies to triangles.
    #[must_use]
    pub fn new(
        program: u64,
        vertex: SmallVec<[VertexSlotKey; 4]>,
        mode: DrawMode,
        fixed: &FixedState,
        target: TargetFormats,
    ) -> Self {
        let topology = topology(mode);
        let triangles = topology == wgpu::PrimitiveTopology::TriangleList;

        let depth_stencil = target.depth.map(|format| {
            let (depth_write_enabled, depth_compare) = if fixed.depth_test {
                (fixed.depth_write, fixed.depth_func)
            } else {
                (false, wgpu::CompareFunction::Always)
            };
            let bias = match fixed.polygon_offset {
                Some((factor, units)) if triangles => DepthBiasKey {
                    constant: units.round() as i32,
                    slope_scale_bits: factor.to_bits(),
                },
                _ => DepthBiasKey::default(),
            };
            DepthStencilKey {
                format,
                depth_write_enabled,
                depth_compare,
                stencil: fixed.stencil.into(),
                bias,
            }
        });

        Self {
            program,
            vertex,
            topology,
            cull_mode: if triangles { fixed.cull_face } else { None },
            front_face: fixed.front_face,
            color: ColorTargetKey {
                format: target.color,
                blend: fixed.blend.filter(|_| blendable(target.color)).map(Into::into),
                write_mask: fixed.color_mask.bits(),
            },
            depth_stencil,
            samples: target.samples.max(1),
        }
    }
}

/// `u64` hash of any `Hash`-able key.
#[inline]
#[must_use]
pub fn fx_hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::Viewport;

    fn fixed() -> FixedState {
        FixedState {
            blend: None,
            depth_test: true,
            depth_write: true,
            depth_func: wgpu::CompareFunction::LessEqual,
            color_mask: wgpu::ColorWrites::ALL,
            cull_face: Some(wgpu::Face::Back),
            front_face: wgpu::FrontFace::Ccw,
            stencil: None,
            polygon_offset: None,
            viewport: Viewport::new(0, 0, 4, 4),
            scissor: None,
        }
    }

    const TARGET: TargetFormats = TargetFormats {
        color: wgpu::TextureFormat::Rgba8Unorm,
        depth: Some(wgpu::TextureFormat::Depth24PlusStencil8),
        samples: 1,
    };

    fn key(fixed: &FixedState, mode: DrawMode, target: TargetFormats) -> PipelineKey {
        PipelineKey::new(7, SmallVec::new(), mode, fixed, target)
    }

    #[test]
    fn every_toggle_changes_the_key() {
        let base = key(&fixed(), DrawMode::Triangles, TARGET);
        let variants: [fn(&mut FixedState); 6] = [
            |f| f.depth_write = false,
            |f| f.depth_func = wgpu::CompareFunction::Greater,
            |f| f.cull_face = None,
            |f| f.front_face = wgpu::FrontFace::Cw,
            |f| f.blend = Some(wgpu::BlendState::ALPHA_BLENDING),
            |f| f.color_mask = wgpu::ColorWrites::COLOR,
        ];
        for change in variants {
            let mut f = fixed();
            change(&mut f);
            assert_ne!(fx_hash_key(&key(&f, DrawMode::Triangles, TARGET)), fx_hash_key(&base));
        }
        // Viewport and scissor are dynamic state.
        let mut f = fixed();
        f.viewport = Viewport::new(1, 1, 2, 2);
        f.scissor = Some(Viewport::new(0, 0, 1, 1));
        assert_eq!(key(&f, DrawMode::Triangles, TARGET), base);
    }

    #[test]
    fn disabled_depth_test_never_writes() {
        let mut f = fixed();
        f.depth_test = false;
        let ds = key(&f, DrawMode::Triangles, TARGET).depth_stencil.unwrap();
        assert!(!ds.depth_write_enabled);
        assert_eq!(ds.depth_compare, wgpu::CompareFunction::Always);
    }

    #[test]
    fn lines_drop_bias_and_culling() {
        let mut f = fixed();
        f.polygon_offset = Some((1.0, 2.0));
        let triangles = key(&f, DrawMode::Triangles, TARGET);
        let lines = key(&f, DrawMode::Lines, TARGET);

        assert_eq!(triangles.depth_stencil.unwrap().bias.constant, 2);
        assert_eq!(lines.depth_stencil.unwrap().bias, DepthBiasKey::default());
        assert_eq!(lines.cull_mode, None);
        assert_eq!(lines.topology, wgpu::PrimitiveTopology::LineList);
    }

    #[test]
    fn float32_targets_do_not_blend() {
        let mut f = fixed();
        f.blend = Some(wgpu::BlendState::ALPHA_BLENDING);
        let target = TargetFormats {
            color: wgpu::TextureFormat::Rgba32Float,
            ..TARGET
        };
        assert!(key(&f, DrawMode::Triangles, target).color.blend.is_none());
        assert!(key(&f, DrawMode::Triangles, TARGET).color.blend.is_some());
    }

    #[test]
    fn targets_without_depth_have_no_depth_state() {
        let target = TargetFormats { depth: None, ..TARGET };
        assert!(key(&fixed(), DrawMode::Triangles, target).depth_stencil.is_none());
    }
}
