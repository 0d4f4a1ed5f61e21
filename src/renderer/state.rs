//! State Tracker
//!
//! Mirrors the backend's pipeline state and forwards a change only when the
//! requested value differs from the mirrored one. The renderer never calls a
//! pipeline toggle on the backend directly.

use wgpu::{BlendComponent, BlendFactor, BlendOperation, BlendState, ColorWrites, CompareFunction, Face, FrontFace};

use crate::renderer::backend::{
    ProgramId, RenderBackend, RenderTargetId, StencilConfig, TextureId, Viewport, units,
};
use crate::resources::material::{Blending, RenderState, Side};

/// Pipeline state of a freshly created context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineState {
    pub program: Option<ProgramId>,
    pub render_target: Option<RenderTargetId>,
    pub blend: Option<BlendState>,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunction,
    pub color_mask: ColorWrites,
    pub cull_face: Option<Face>,
    pub front_face: FrontFace,
    pub stencil: Option<StencilConfig>,
    pub polygon_offset: Option<(f32, f32)>,
    /// `None` until first set; the backend treats it as the full target.
    pub viewport: Option<Viewport>,
    pub scissor: Option<Viewport>,
    pub active_unit: u32,
    pub textures: [Option<TextureId>; units::MAX_UNITS as usize],
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            program: None,
            render_target: None,
            blend: None,
            depth_test: false,
            depth_write: true,
            depth_func: CompareFunction::Less,
            color_mask: ColorWrites::ALL,
            cull_face: None,
            front_face: FrontFace::Ccw,
            stencil: None,
            polygon_offset: None,
            viewport: None,
            scissor: None,
            active_unit: 0,
            textures: [None; units::MAX_UNITS as usize],
        }
    }
}

/// Maps a material blending mode to a blend state. `None` disables blending.
#[must_use]
pub fn blend_state(blending: Blending, premultiplied_alpha: bool) -> Option<BlendState> {
    let component = |src_factor, dst_factor| BlendComponent {
        src_factor,
        dst_factor,
        operation: BlendOperation::Add,
    };

    let state = match (blending, premultiplied_alpha) {
        (Blending::None, _) => return None,
        (Blending::Normal, false) => BlendState {
            color: component(BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha),
            alpha: component(BlendFactor::One, BlendFactor::OneMinusSrcAlpha),
        },
        (Blending::Normal, true) => BlendState::PREMULTIPLIED_ALPHA_BLENDING,
        (Blending::Additive, false) => BlendState {
            color: component(BlendFactor::SrcAlpha, BlendFactor::One),
            alpha: component(BlendFactor::One, BlendFactor::One),
        },
        (Blending::Additive, true) => BlendState {
            color: component(BlendFactor::One, BlendFactor::One),
            alpha: component(BlendFactor::One, BlendFactor::One),
        },
        (Blending::Subtractive, _) => BlendState {
            color: component(BlendFactor::Zero, BlendFactor::OneMinusSrc),
            alpha: component(BlendFactor::Zero, BlendFactor::One),
        },
        (Blending::Multiply, _) => BlendState {
            color: component(BlendFactor::Zero, BlendFactor::Src),
            alpha: component(BlendFactor::Zero, BlendFactor::SrcAlpha),
        },
        (Blending::Custom { color, alpha }, _) => BlendState {
            color: BlendComponent {
                src_factor: color.src,
                dst_factor: color.dst,
                operation: color.operation,
            },
            alpha: BlendComponent {
                src_factor: alpha.src,
                dst_factor: alpha.dst,
                operation: alpha.operation,
            },
        },
    };
    Some(state)
}

#[derive(Debug, Default)]
pub struct StateTracker {
    current: PipelineState,
    issued: u64,
    skipped: u64,
}

macro_rules! tracked_setter {
    ($(#[$meta:meta])* $name:ident, $field:ident: $ty:ty => $call:ident) => {
        $(#[$meta])*
        pub fn $name<B: RenderBackend>(&mut self, backend: &mut B, value: $ty) {
            if self.current.$field == value {
                self.skipped += 1;
                return;
            }
            self.current.$field = value;
            self.issued += 1;
            backend.$call(value);
        }
    };
}

impl StateTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything and assumes a fresh context.
    pub fn reset(&mut self) {
        self.current = PipelineState::default();
    }

    #[must_use]
    pub fn current(&self) -> &PipelineState {
        &self.current
    }

    /// Backend calls forwarded since creation.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Requests absorbed because the value was already current.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn use_program<B: RenderBackend>(&mut self, backend: &mut B, program: ProgramId) {
        if self.current.program == Some(program) {
            self.skipped += 1;
            return;
        }
        self.current.program = Some(program);
        self.issued += 1;
        backend.use_program(program);
    }

    tracked_setter!(bind_render_target, render_target: Option<RenderTargetId> => bind_render_target);
    tracked_setter!(set_blend, blend: Option<BlendState> => set_blend);
    tracked_setter!(set_depth_test, depth_test: bool => set_depth_test);
    tracked_setter!(set_depth_write, depth_write: bool => set_depth_write);
    tracked_setter!(set_depth_func, depth_func: CompareFunction => set_depth_func);
    tracked_setter!(set_color_mask, color_mask: ColorWrites => set_color_mask);
    tracked_setter!(set_cull_face, cull_face: Option<Face> => set_cull_face);
    tracked_setter!(set_front_face, front_face: FrontFace => set_front_face);
    tracked_setter!(set_stencil, stencil: Option<StencilConfig> => set_stencil);
    tracked_setter!(set_polygon_offset, polygon_offset: Option<(f32, f32)> => set_polygon_offset);
    tracked_setter!(set_scissor, scissor: Option<Viewport> => set_scissor);
    tracked_setter!(active_texture, active_unit: u32 => set_active_texture_unit);

    pub fn set_viewport<B: RenderBackend>(&mut self, backend: &mut B, viewport: Viewport) {
        if self.current.viewport == Some(viewport) {
            self.skipped += 1;
            return;
        }
        self.current.viewport = Some(viewport);
        self.issued += 1;
        backend.set_viewport(viewport);
    }

    /// Binds `texture` to `unit`, switching the active unit only if needed.
    pub fn bind_texture<B: RenderBackend>(&mut self, backend: &mut B, unit: u32, texture: Option<TextureId>) {
        let Some(slot) = self.current.textures.get(unit as usize).copied() else {
            log::warn!("Texture unit {unit} exceeds the supported {} units", units::MAX_UNITS);
            return;
        };
        if slot == texture {
            self.skipped += 1;
            return;
        }
        self.active_texture(backend, unit);
        self.current.textures[unit as usize] = texture;
        self.issued += 1;
        backend.bind_texture(texture);
    }

    /// Forgets a texture that was deleted so a recycled id rebinds.
    pub fn forget_texture(&mut self, texture: TextureId) {
        for slot in &mut self.current.textures {
            if *slot == Some(texture) {
                *slot = None;
            }
        }
    }

    /// Applies the pipeline state of a material.
    ///
    /// `side` overrides the material side (shadow passes); `flip_sided`
    /// flips the front face for mirrored world transforms.
    pub fn set_material<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        state: &RenderState,
        transparent: bool,
        side: Option<Side>,
        flip_sided: bool,
    ) {
        let side = side.unwrap_or(state.side);
        let cull = match side {
            Side::Front => Some(Face::Back),
            Side::Back => Some(Face::Front),
            Side::Double => None,
        };
        self.set_cull_face(backend, cull);
        self.set_front_face(backend, if flip_sided { FrontFace::Cw } else { FrontFace::Ccw });

        let blend = if state.blending == Blending::Normal && !transparent {
            None
        } else {
            blend_state(state.blending, state.premultiplied_alpha)
        };
        self.set_blend(backend, blend);

        self.set_depth_test(backend, state.depth_test);
        self.set_depth_write(backend, state.depth_write);
        self.set_depth_func(backend, state.depth_func);
        self.set_color_mask(
            backend,
            if state.color_write {
                ColorWrites::ALL
            } else {
                ColorWrites::empty()
            },
        );

        let stencil = state.stencil.map(|s| StencilConfig {
            face: wgpu::StencilFaceState {
                compare: s.func,
                fail_op: s.fail,
                depth_fail_op: s.depth_fail,
                pass_op: s.pass,
            },
            reference: s.reference,
            read_mask: s.read_mask,
            write_mask: s.write_mask,
        });
        self.set_stencil(backend, stencil);
        self.set_polygon_offset(backend, state.polygon_offset.map(|o| (o.factor, o.units)));
    }
}
