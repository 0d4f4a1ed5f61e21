//! Software Backend
//!
//! A headless [`RenderBackend`] that rasterizes on the CPU. Programs are
//! validated with naga (see the `wgsl` module) and then shaded from their
//! [`ProgramParameters`] (see the `raster` module), which mirrors the WGSL
//! templates. Custom shader materials are shaded unlit.
//!
//! Besides rendering, the backend is the test double for the engine: it can
//! lose and restore its context, delay fences, and records statistics and a
//! per-draw log.

use glam::{Vec2, Vec3, Vec4};
use log::{debug, info, warn};
use rustc_hash::FxHashMap;

use super::raster::{self, Attachments, FixedState, Shader, TexelView, VertexInput};
use super::wgsl;
use super::{
    BufferId, BufferKind, DrawCall, FenceId, FenceStatus, ProgramDescriptor, ProgramDiagnostics, ProgramId,
    RenderBackend, RenderTargetDescriptor, RenderTargetId, StencilConfig, TextureDescriptor, TextureId, VertexSemantic,
    Viewport, units,
};
use crate::errors::{EngineError, Result};
use crate::renderer::lights::LightsState;
use crate::renderer::program::ProgramParameters;
use crate::renderer::settings::srgb_to_linear;
use crate::resources::TextureSampler;
use crate::scene::DrawMode;

const FRAMEBUFFER_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

// ============================================================================
// Storage
// ============================================================================

struct SoftProgram {
    label: String,
    parameters: ProgramParameters,
}

struct SoftTexture {
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    sampler: TextureSampler,
    /// Level 0 first; linear values.
    levels: Vec<Vec<Vec4>>,
}

impl SoftTexture {
    fn view(&self) -> TexelView<'_> {
        TexelView {
            width: self.width,
            height: self.height,
            data: self.levels.first().map_or(&[], Vec::as_slice),
            sampler: self.sampler,
        }
    }
}

struct SoftTarget {
    texture: TextureId,
    samples: u32,
    /// Multisampled color, resolved into `texture` on demand. Single-sampled
    /// targets render straight into the texture.
    color: Option<Vec<Vec4>>,
    depth: Option<Vec<f32>>,
    stencil: Option<Vec<u8>>,
}

struct Framebuffer {
    width: u32,
    height: u32,
    color: Vec<Vec4>,
    depth: Vec<f32>,
    stencil: Vec<u8>,
}

impl Framebuffer {
    fn new(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize;
        Self {
            width,
            height,
            color: vec![Vec4::ZERO; len],
            depth: vec![1.0; len],
            stencil: vec![0; len],
        }
    }
}

/// Attachments moved out of storage for the duration of a draw.
struct Bound {
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    color: Vec<Vec4>,
    depth: Option<Vec<f32>>,
    stencil: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
struct Pipeline {
    program: Option<ProgramId>,
    target: Option<RenderTargetId>,
    fixed: FixedState,
    viewport: Option<Viewport>,
    active_unit: u32,
    units: [Option<TextureId>; units::MAX_UNITS as usize],
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            program: None,
            target: None,
            fixed: FixedState::default(),
            viewport: None,
            active_unit: 0,
            units: [None; units::MAX_UNITS as usize],
        }
    }
}

/// Counters since creation. Survive context loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub draw_calls: u64,
    pub fragments: u64,
    pub state_changes: u64,
    pub programs_created: u64,
    pub programs_deleted: u64,
    pub buffers_created: u64,
    pub buffer_updates: u64,
    pub textures_created: u64,
    pub texture_updates: u64,
    pub render_targets_created: u64,
    pub clears: u64,
    pub mipmap_generations: u64,
    pub resolves: u64,
}

/// One submitted draw.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub program: ProgramId,
    pub label: String,
    pub target: Option<RenderTargetId>,
    pub mode: DrawMode,
    pub elements: u32,
    /// Fragments that reached the color attachment.
    pub fragments: u64,
}

// ============================================================================
// Backend
// ============================================================================

pub struct SoftwareBackend {
    limits: wgpu::Limits,
    generation: u64,
    lost: bool,
    next_id: u64,

    framebuffer: Framebuffer,
    programs: FxHashMap<u64, SoftProgram>,
    buffers: FxHashMap<u64, Vec<u8>>,
    textures: FxHashMap<u64, SoftTexture>,
    targets: FxHashMap<u64, SoftTarget>,
    /// Remaining polls before each fence signals.
    fences: FxHashMap<u64, u32>,

    pipeline: Pipeline,
    lights: LightsState,

    /// Polls a fence stays pending for. `u32::MAX` never signals.
    pub fence_latency: u32,
    /// Keep a [`DrawRecord`] per draw.
    pub record_draws: bool,
    draw_log: Vec<DrawRecord>,
    stats: BackendStats,
}

impl SoftwareBackend {
    /// Creates a context with WebGL2-class limits.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        Self::with_limits(width, height, wgpu::Limits::downlevel_webgl2_defaults())
    }

    pub fn with_limits(width: u32, height: u32, limits: wgpu::Limits) -> Result<Self> {
        let max = limits.max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(EngineError::ContextCreationFailed(format!(
                "drawing buffer {width}x{height} outside 1..={max}"
            )));
        }
        info!("Software context created ({width}x{height}, max texture {max})");
        Ok(Self {
            limits,
            generation: 1,
            lost: false,
            next_id: 1,
            framebuffer: Framebuffer::new(width, height),
            programs: FxHashMap::default(),
            buffers: FxHashMap::default(),
            textures: FxHashMap::default(),
            targets: FxHashMap::default(),
            fences: FxHashMap::default(),
            pipeline: Pipeline::default(),
            lights: LightsState::default(),
            fence_latency: 1,
            record_draws: true,
            draw_log: Vec::new(),
            stats: BackendStats::default(),
        })
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // === Context loss simulation ===

    /// Drops every resource; all calls become no-ops until
    /// [`Self::restore_context`].
    pub fn lose_context(&mut self) {
        if self.lost {
            return;
        }
        warn!("Software context lost");
        self.lost = true;
        self.programs.clear();
        self.buffers.clear();
        self.textures.clear();
        self.targets.clear();
        self.fences.clear();
        self.pipeline = Pipeline::default();
    }

    /// Recreates the context with a fresh, empty state.
    pub fn restore_context(&mut self) {
        if !self.lost {
            return;
        }
        self.lost = false;
        self.generation += 1;
        self.framebuffer = Framebuffer::new(self.framebuffer.width, self.framebuffer.height);
        self.pipeline = Pipeline::default();
        info!("Software context restored (generation {})", self.generation);
    }

    // === Inspection ===

    #[must_use]
    pub fn stats(&self) -> &BackendStats {
        &self.stats
    }

    #[must_use]
    pub fn draw_log(&self) -> &[DrawRecord] {
        &self.draw_log
    }

    pub fn clear_draw_log(&mut self) {
        self.draw_log.clear();
    }

    #[must_use]
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn render_target_count(&self) -> usize {
        self.targets.len()
    }

    /// Mip levels currently stored for a texture.
    #[must_use]
    pub fn texture_levels(&self, texture: TextureId) -> usize {
        self.textures.get(&texture.0).map_or(0, |t| t.levels.len())
    }

    /// Texture bound to a unit.
    #[must_use]
    pub fn bound_texture(&self, unit: u32) -> Option<TextureId> {
        self.pipeline.units.get(unit as usize).copied().flatten()
    }

    /// Currently bound render target (`None`: default framebuffer).
    #[must_use]
    pub fn bound_render_target(&self) -> Option<RenderTargetId> {
        self.pipeline.target
    }

    /// Linear texel of a texture's level 0.
    #[must_use]
    pub fn texel(&self, texture: TextureId, x: u32, y: u32) -> Option<Vec4> {
        let t = self.textures.get(&texture.0)?;
        t.levels.first()?.get((y * t.width + x) as usize).copied()
    }

    // === Internals ===

    fn take_bound(&mut self) -> Option<Bound> {
        match self.pipeline.target {
            None => {
                let fb = &mut self.framebuffer;
                Some(Bound {
                    width: fb.width,
                    height: fb.height,
                    format: FRAMEBUFFER_FORMAT,
                    color: std::mem::take(&mut fb.color),
                    depth: Some(std::mem::take(&mut fb.depth)),
                    stencil: Some(std::mem::take(&mut fb.stencil)),
                })
            }
            Some(id) => {
                let target = self.targets.get_mut(&id.0)?;
                let texture = self.textures.get_mut(&target.texture.0)?;
                let color = match target.color.as_mut() {
                    Some(msaa) => std::mem::take(msaa),
                    None => texture.levels.first_mut().map(std::mem::take).unwrap_or_default(),
                };
                Some(Bound {
                    width: texture.width,
                    height: texture.height,
                    format: texture.format,
                    color,
                    depth: target.depth.take(),
                    stencil: target.stencil.take(),
                })
            }
        }
    }

    fn restore_bound(&mut self, bound: Bound) {
        match self.pipeline.target {
            None => {
                let fb = &mut self.framebuffer;
                fb.color = bound.color;
                fb.depth = bound.depth.unwrap_or_default();
                fb.stencil = bound.stencil.unwrap_or_default();
            }
            Some(id) => {
                let Some(target) = self.targets.get_mut(&id.0) else {
                    return;
                };
                target.depth = bound.depth;
                target.stencil = bound.stencil;
                match target.color.as_mut() {
                    Some(msaa) => *msaa = bound.color,
                    None => {
                        if let Some(level) = self
                            .textures
                            .get_mut(&target.texture.0)
                            .and_then(|t| t.levels.first_mut())
                        {
                            *level = bound.color;
                        }
                    }
                }
            }
        }
    }

    fn fixed_state(&self, width: u32, height: u32) -> FixedState {
        FixedState {
            viewport: self.pipeline.viewport.unwrap_or(Viewport::new(0, 0, width, height)),
            ..self.pipeline.fixed
        }
    }

    fn decode_texels(format: wgpu::TextureFormat, data: &[u8], len: usize) -> Vec<Vec4> {
        let srgb = format == wgpu::TextureFormat::Rgba8UnormSrgb;
        let mut texels: Vec<Vec4> = data
            .chunks_exact(4)
            .take(len)
            .map(|p| {
                let c = |b: u8| f32::from(b) / 255.0;
                let rgb = Vec3::new(c(p[0]), c(p[1]), c(p[2]));
                let rgb = if srgb {
                    Vec3::new(srgb_to_linear(rgb.x), srgb_to_linear(rgb.y), srgb_to_linear(rgb.z))
                } else {
                    rgb
                };
                rgb.extend(c(p[3]))
            })
            .collect();
        texels.resize(len, Vec4::ZERO);
        texels
    }

    fn read_floats(&self, buffer: BufferId) -> Vec<f32> {
        self.buffers.get(&buffer.0).map_or_else(Vec::new, |bytes| {
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        })
    }

    fn read_indices(&self, buffer: BufferId) -> Vec<u32> {
        self.buffers.get(&buffer.0).map_or_else(Vec::new, |bytes| {
            bytes
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        })
    }

    fn vertex_inputs(&self, call: &DrawCall<'_>) -> Vec<VertexInput> {
        let mut streams: [(Vec<f32>, u32); 4] = Default::default();
        for binding in call.attributes {
            let slot = match binding.semantic {
                VertexSemantic::Position => 0,
                VertexSemantic::Normal => 1,
                VertexSemantic::Uv => 2,
                VertexSemantic::Color => 3,
            };
            streams[slot] = (self.read_floats(binding.buffer), binding.item_size.max(1));
        }
        let count = streams[0].0.len() / streams[0].1.max(1) as usize;
        let get = |slot, i, n| component(&streams, slot, i, n);

        (0..count)
            .map(|i| VertexInput {
                position: get(0, i, 3).map_or(Vec3::ZERO, |p| {
                    Vec3::new(p[0], p.get(1).copied().unwrap_or(0.0), p.get(2).copied().unwrap_or(0.0))
                }),
                normal: get(1, i, 3)
                    .filter(|n| n.len() == 3)
                    .map_or(Vec3::Z, |n| Vec3::new(n[0], n[1], n[2])),
                uv: get(2, i, 2)
                    .filter(|u| u.len() == 2)
                    .map_or(Vec2::ZERO, |u| Vec2::new(u[0], u[1])),
                color: get(3, i, 4).map(|c| match c.len() {
                    3 => Vec4::new(c[0], c[1], c[2], 1.0),
                    4 => Vec4::new(c[0], c[1], c[2], c[3]),
                    _ => Vec4::ONE,
                }),
            })
            .collect()
    }
}

impl RenderBackend for SoftwareBackend {
    fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    fn is_context_lost(&self) -> bool {
        self.lost
    }

    fn context_generation(&self) -> u64 {
        self.generation
    }

    fn drawing_buffer_size(&self) -> (u32, u32) {
        (self.framebuffer.width, self.framebuffer.height)
    }

    fn set_drawing_buffer_size(&mut self, width: u32, height: u32) {
        let max = self.limits.max_texture_dimension_2d;
        let (width, height) = (width.clamp(1, max), height.clamp(1, max));
        if (width, height) != (self.framebuffer.width, self.framebuffer.height) {
            self.framebuffer = Framebuffer::new(width, height);
        }
    }

    fn create_program(&mut self, descriptor: &ProgramDescriptor<'_>) -> std::result::Result<ProgramId, ProgramDiagnostics> {
        if self.lost {
            return Err(ProgramDiagnostics {
                runnable: false,
                program_log: "context lost".to_owned(),
                ..Default::default()
            });
        }
        wgsl::check_program(descriptor)?;

        let id = self.next_id();
        self.programs.insert(
            id,
            SoftProgram {
                label: descriptor.label.to_owned(),
                parameters: descriptor.parameters.clone(),
            },
        );
        self.stats.programs_created += 1;
        debug!("Linked program '{}' as {id}", descriptor.label);
        Ok(ProgramId(id))
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program.0).is_some() {
            self.stats.programs_deleted += 1;
        }
        if self.pipeline.program == Some(program) {
            self.pipeline.program = None;
        }
    }

    fn use_program(&mut self, program: ProgramId) {
        self.pipeline.program = Some(program);
        self.stats.state_changes += 1;
    }

    fn create_buffer(&mut self, _kind: BufferKind, data: &[u8]) -> BufferId {
        let id = self.next_id();
        if !self.lost {
            self.buffers.insert(id, data.to_vec());
            self.stats.buffers_created += 1;
        }
        BufferId(id)
    }

    fn update_buffer(&mut self, buffer: BufferId, data: &[u8]) {
        if let Some(bytes) = self.buffers.get_mut(&buffer.0) {
            bytes.clear();
            bytes.extend_from_slice(data);
            self.stats.buffer_updates += 1;
        }
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor<'_>) -> TextureId {
        let id = self.next_id();
        if !self.lost {
            let len = descriptor.width as usize * descriptor.height as usize;
            self.textures.insert(
                id,
                SoftTexture {
                    width: descriptor.width,
                    height: descriptor.height,
                    format: descriptor.format,
                    sampler: descriptor.sampler,
                    levels: vec![Self::decode_texels(descriptor.format, descriptor.data, len)],
                },
            );
            self.stats.textures_created += 1;
        }
        TextureId(id)
    }

    fn update_texture(&mut self, texture: TextureId, descriptor: &TextureDescriptor<'_>) {
        if let Some(t) = self.textures.get_mut(&texture.0) {
            let len = descriptor.width as usize * descriptor.height as usize;
            t.width = descriptor.width;
            t.height = descriptor.height;
            t.format = descriptor.format;
            t.sampler = descriptor.sampler;
            t.levels = vec![Self::decode_texels(descriptor.format, descriptor.data, len)];
            self.stats.texture_updates += 1;
        }
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture.0);
        for unit in &mut self.pipeline.units {
            if *unit == Some(texture) {
                *unit = None;
            }
        }
    }

    fn generate_mipmaps(&mut self, texture: TextureId) {
        let Some(t) = self.textures.get_mut(&texture.0) else {
            return;
        };
        t.levels.truncate(1);
        let (mut w, mut h) = (t.width, t.height);
        while w > 1 || h > 1 {
            let (nw, nh) = ((w / 2).max(1), (h / 2).max(1));
            let Some(src) = t.levels.last() else {
                break;
            };
            let at = |x: u32, y: u32| src[(y.min(h - 1) * w + x.min(w - 1)) as usize];
            let mut level = Vec::with_capacity((nw * nh) as usize);
            for y in 0..nh {
                for x in 0..nw {
                    let (sx, sy) = (x * 2, y * 2);
                    level.push((at(sx, sy) + at(sx + 1, sy) + at(sx, sy + 1) + at(sx + 1, sy + 1)) * 0.25);
                }
            }
            t.levels.push(level);
            (w, h) = (nw, nh);
        }
        self.stats.mipmap_generations += 1;
    }

    fn create_render_target(&mut self, descriptor: &RenderTargetDescriptor) -> RenderTargetId {
        let texture = self.create_texture(&TextureDescriptor {
            label: "render target",
            width: descriptor.width,
            height: descriptor.height,
            format: descriptor.format,
            sampler: descriptor.sampler,
            data: &[],
        });
        let id = self.next_id();
        if !self.lost {
            let len = descriptor.width as usize * descriptor.height as usize;
            self.targets.insert(
                id,
                SoftTarget {
                    texture,
                    samples: descriptor.samples,
                    color: (descriptor.samples > 1).then(|| vec![Vec4::ZERO; len]),
                    depth: descriptor.depth.then(|| vec![1.0; len]),
                    stencil: descriptor.stencil.then(|| vec![0; len]),
                },
            );
            self.stats.render_targets_created += 1;
        }
        RenderTargetId(id)
    }

    fn delete_render_target(&mut self, target: RenderTargetId) {
        if let Some(t) = self.targets.remove(&target.0) {
            self.delete_texture(t.texture);
        }
        if self.pipeline.target == Some(target) {
            self.pipeline.target = None;
        }
    }

    fn render_target_texture(&self, target: RenderTargetId) -> Option<TextureId> {
        self.targets.get(&target.0).map(|t| t.texture)
    }

    fn bind_render_target(&mut self, target: Option<RenderTargetId>) {
        self.pipeline.target = target;
        self.stats.state_changes += 1;
    }

    fn resolve_render_target(&mut self, target: RenderTargetId) {
        let Some(t) = self.targets.get(&target.0) else {
            return;
        };
        self.stats.resolves += 1;
        if t.samples <= 1 {
            return;
        }
        let (Some(color), texture) = (t.color.clone(), t.texture) else {
            return;
        };
        if let Some(level) = self.textures.get_mut(&texture.0).and_then(|t| t.levels.first_mut()) {
            *level = color;
        }
    }

    fn set_blend(&mut self, blend: Option<wgpu::BlendState>) {
        self.pipeline.fixed.blend = blend;
        self.stats.state_changes += 1;
    }

    fn set_depth_test(&mut self, enabled: bool) {
        self.pipeline.fixed.depth_test = enabled;
        self.stats.state_changes += 1;
    }

    fn set_depth_write(&mut self, enabled: bool) {
        self.pipeline.fixed.depth_write = enabled;
        self.stats.state_changes += 1;
    }

    fn set_depth_func(&mut self, func: wgpu::CompareFunction) {
        self.pipeline.fixed.depth_func = func;
        self.stats.state_changes += 1;
    }

    fn set_color_mask(&mut self, mask: wgpu::ColorWrites) {
        self.pipeline.fixed.color_mask = mask;
        self.stats.state_changes += 1;
    }

    fn set_cull_face(&mut self, face: Option<wgpu::Face>) {
        self.pipeline.fixed.cull_face = face;
        self.stats.state_changes += 1;
    }

    fn set_front_face(&mut self, front_face: wgpu::FrontFace) {
        self.pipeline.fixed.front_face = front_face;
        self.stats.state_changes += 1;
    }

    fn set_stencil(&mut self, stencil: Option<StencilConfig>) {
        self.pipeline.fixed.stencil = stencil;
        self.stats.state_changes += 1;
    }

    fn set_polygon_offset(&mut self, offset: Option<(f32, f32)>) {
        self.pipeline.fixed.polygon_offset = offset;
        self.stats.state_changes += 1;
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.pipeline.viewport = Some(viewport);
        self.stats.state_changes += 1;
    }

    fn set_scissor(&mut self, scissor: Option<Viewport>) {
        self.pipeline.fixed.scissor = scissor;
        self.stats.state_changes += 1;
    }

    fn set_active_texture_unit(&mut self, unit: u32) {
        self.pipeline.active_unit = unit.min(units::MAX_UNITS - 1);
        self.stats.state_changes += 1;
    }

    fn bind_texture(&mut self, texture: Option<TextureId>) {
        self.pipeline.units[self.pipeline.active_unit as usize] = texture;
        self.stats.state_changes += 1;
    }

    fn set_lights(&mut self, lights: &LightsState) {
        self.lights.clone_from(lights);
    }

    fn clear(&mut self, color: Option<Vec4>, depth: Option<f32>, stencil: Option<u32>) {
        if self.lost {
            return;
        }
        let Some(mut bound) = self.take_bound() else {
            return;
        };
        let fixed = self.fixed_state(bound.width, bound.height);
        let mut attachments = Attachments {
            width: bound.width,
            height: bound.height,
            format: bound.format,
            color: &mut bound.color,
            depth: bound.depth.as_deref_mut(),
            stencil: bound.stencil.as_deref_mut(),
        };
        raster::clear(&fixed, &mut attachments, color, depth, stencil);
        self.restore_bound(bound);
        self.stats.clears += 1;
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        if self.lost {
            return;
        }
        let Some(program) = self.programs.get(&call.program.0) else {
            warn!("Draw with unknown program {:?}", call.program);
            return;
        };
        let label = program.label.clone();
        let inputs = self.vertex_inputs(call);
        let elements: Vec<u32> = match call.index {
            Some(index) => {
                let data = self.read_indices(index);
                let end = (call.range.end as usize).min(data.len());
                let start = (call.range.start as usize).min(end);
                data[start..end].to_vec()
            }
            None => call.range.clone().collect(),
        };
        let Some(mut bound) = self.take_bound() else {
            return;
        };
        let fixed = self.fixed_state(bound.width, bound.height);

        let fragments = {
            let Some(program) = self.programs.get(&call.program.0) else {
                self.restore_bound(bound);
                return;
            };
            let shader = Shader {
                params: &program.parameters,
                uniforms: call.uniforms,
                lights: &self.lights,
                units: std::array::from_fn(|unit| {
                    self.pipeline.units[unit]
                        .and_then(|id| self.textures.get(&id.0))
                        .map(SoftTexture::view)
                }),
            };
            let varyings: Vec<_> = inputs.iter().map(|input| shader.vertex(input)).collect();
            let vertex = |i: u32| varyings.get(i as usize).copied();
            let mut target = Attachments {
                width: bound.width,
                height: bound.height,
                format: bound.format,
                color: &mut bound.color,
                depth: bound.depth.as_deref_mut(),
                stencil: bound.stencil.as_deref_mut(),
            };

            let mut fragments = 0;
            match call.mode {
                DrawMode::Triangles | DrawMode::Sprite => {
                    for tri in elements.chunks_exact(3) {
                        if let (Some(a), Some(b), Some(c)) = (vertex(tri[0]), vertex(tri[1]), vertex(tri[2])) {
                            fragments += raster::draw_triangle(&shader, &fixed, &mut target, [a, b, c]);
                        }
                    }
                }
                DrawMode::Lines => {
                    for line in elements.chunks_exact(2) {
                        if let (Some(a), Some(b)) = (vertex(line[0]), vertex(line[1])) {
                            fragments += raster::draw_line(&shader, &fixed, &mut target, a, b);
                        }
                    }
                }
                DrawMode::LineStrip => {
                    for line in elements.windows(2) {
                        if let (Some(a), Some(b)) = (vertex(line[0]), vertex(line[1])) {
                            fragments += raster::draw_line(&shader, &fixed, &mut target, a, b);
                        }
                    }
                }
                DrawMode::Points => {
                    for &i in &elements {
                        if let Some(v) = vertex(i) {
                            fragments += raster::draw_point(&shader, &fixed, &mut target, v);
                        }
                    }
                }
            }
            fragments
        };

        self.restore_bound(bound);
        self.stats.draw_calls += 1;
        self.stats.fragments += fragments;
        if self.record_draws {
            self.draw_log.push(DrawRecord {
                program: call.program,
                label,
                target: self.pipeline.target,
                mode: call.mode,
                elements: elements.len() as u32,
                fragments,
            });
        }
    }

    fn insert_fence(&mut self) -> FenceId {
        let id = self.next_id();
        if !self.lost {
            self.fences.insert(id, self.fence_latency);
        }
        FenceId(id)
    }

    fn poll_fence(&mut self, fence: FenceId) -> FenceStatus {
        if self.lost {
            return FenceStatus::ContextLost;
        }
        match self.fences.get_mut(&fence.0) {
            Some(0) | None => FenceStatus::Signaled,
            Some(remaining) => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                FenceStatus::Pending
            }
        }
    }

    fn delete_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence.0);
    }

    fn read_pixels(&mut self, target: Option<RenderTargetId>, rect: Viewport) -> Result<Vec<u8>> {
        if self.lost {
            return Err(EngineError::ContextLost);
        }
        let (width, height, format, color): (u32, u32, wgpu::TextureFormat, &[Vec4]) = match target {
            None => (
                self.framebuffer.width,
                self.framebuffer.height,
                FRAMEBUFFER_FORMAT,
                self.framebuffer.color.as_slice(),
            ),
            Some(id) => {
                let t = self
                    .targets
                    .get(&id.0)
                    .ok_or_else(|| EngineError::ResourceNotFound(format!("render target {}", id.0)))?;
                let texture = self
                    .textures
                    .get(&t.texture.0)
                    .ok_or_else(|| EngineError::ResourceNotFound(format!("texture {}", t.texture.0)))?;
                let data = t.color.as_deref().or(texture.levels.first().map(Vec::as_slice)).unwrap_or(&[]);
                (texture.width, texture.height, texture.format, data)
            }
        };

        if rect.x.saturating_add(rect.width) > width || rect.y.saturating_add(rect.height) > height {
            return Err(EngineError::InvalidParameter {
                context: format!(
                    "read rect {}x{}+{}+{} outside {width}x{height}",
                    rect.width, rect.height, rect.x, rect.y
                ),
                index: 0,
            });
        }

        let mut pixels = Vec::with_capacity(rect.width as usize * rect.height as usize * 4);
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                let texel = color.get((y * width + x) as usize).copied().unwrap_or(Vec4::ZERO);
                pixels.extend_from_slice(&raster::encode_rgba8(texel, format));
            }
        }
        Ok(pixels)
    }
}

/// First `n` components of vertex `i` in attribute stream `slot`.
fn component(streams: &[(Vec<f32>, u32); 4], slot: usize, i: usize, n: usize) -> Option<&[f32]> {
    let (data, size) = &streams[slot];
    let size = *size as usize;
    data.get(i * size..i * size + n.min(size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_context_fails() {
        assert!(matches!(
            SoftwareBackend::new(0, 10),
            Err(EngineError::ContextCreationFailed(_))
        ));
    }

    #[test]
    fn clear_respects_scissor() {
        let mut backend = SoftwareBackend::new(4, 4).unwrap();
        backend.set_scissor(Some(Viewport::new(2, 0, 2, 4)));
        backend.clear(Some(Vec4::new(1.0, 0.0, 0.0, 1.0)), Some(1.0), None);
        let pixels = backend.read_pixels(None, Viewport::new(0, 0, 4, 1)).unwrap();
        assert_eq!(&pixels[0..4], &[0, 0, 0, 0]);
        assert_eq!(&pixels[8..12], &[255, 0, 0, 255]);
    }

    #[test]
    fn fences_signal_after_latency() {
        let mut backend = SoftwareBackend::new(1, 1).unwrap();
        backend.fence_latency = 2;
        let fence = backend.insert_fence();
        assert_eq!(backend.poll_fence(fence), FenceStatus::Pending);
        assert_eq!(backend.poll_fence(fence), FenceStatus::Pending);
        assert_eq!(backend.poll_fence(fence), FenceStatus::Signaled);
        backend.lose_context();
        assert_eq!(backend.poll_fence(fence), FenceStatus::ContextLost);
    }

    #[test]
    fn mip_chain_reaches_one_texel() {
        let mut backend = SoftwareBackend::new(1, 1).unwrap();
        let data = vec![255_u8; 8 * 4 * 4];
        let texture = backend.create_texture(&TextureDescriptor {
            label: "t",
            width: 8,
            height: 4,
            format: wgpu::TextureFormat::Rgba8Unorm,
            sampler: TextureSampler::default(),
            data: &data,
        });
        backend.generate_mipmaps(texture);
        assert_eq!(backend.texture_levels(texture), 4);
    }

    #[test]
    fn invalid_fragment_yields_no_program() {
        let mut backend = SoftwareBackend::new(1, 1).unwrap();
        let parameters = ProgramParameters::utility("custom", crate::renderer::program::ShadingModel::Custom);
        let diagnostics = backend
            .create_program(&ProgramDescriptor {
                label: "undefined",
                vertex_source: "@vertex\nfn vs_main() -> @builtin(position) vec4<f32> {\n    return vec4<f32>(0.0);\n}\n",
                fragment_source: "@fragment\nfn fs_main() -> @location(0) vec4<f32> {\n    let x: i32 = undefined_symbol * true;\n    return vec4<f32>(x);\n}\n",
                parameters: &parameters,
            })
            .unwrap_err();

        assert!(!diagnostics.runnable);
        assert!(diagnostics.vertex_log.is_empty());
        assert!(diagnostics.fragment_log.contains("undefined_symbol"));
        assert_eq!(backend.program_count(), 0);
        assert_eq!(backend.stats().programs_created, 0);
    }
}
