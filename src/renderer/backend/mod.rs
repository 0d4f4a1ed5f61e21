//! Render Backend
//!
//! The seam between the engine and a graphics API. Everything the renderer
//! does to the GPU goes through [`RenderBackend`]; pipeline toggles are only
//! ever issued by the [`StateTracker`], which mirrors their current values.
//!
//! Pipeline state values reuse `wgpu`'s state types so that a wgpu-backed
//! implementation maps one-to-one. [`wgpu_backend::WgpuBackend`] renders on a
//! GPU device; [`software::SoftwareBackend`] is a headless CPU implementation
//! used as the test double and for offline rendering.
//!
//! [`StateTracker`]: crate::renderer::state::StateTracker

mod gpu_lights;
mod mipmap;
mod pipeline_key;
mod raster;
pub mod software;
pub mod wgpu_backend;
pub mod wgsl;

pub use raster::cube_face;

use std::fmt::Write as _;
use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::errors::Result;
use crate::renderer::lights::LightsState;
use crate::renderer::program::ProgramParameters;
use crate::resources::TextureSampler;
use crate::scene::DrawMode;

macro_rules! backend_id {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

backend_id! {
    /// Linked shader program.
    ProgramId;
    BufferId;
    TextureId;
    /// Offscreen color (+ depth/stencil) attachment set.
    RenderTargetId;
    FenceId;
}

/// Texture unit conventions shared by programs and the renderer.
pub mod units {
    pub const MAP: u32 = 0;
    pub const TRANSMISSION: u32 = 1;
    /// Shadow map `i` is bound to `SHADOW_BASE + i`.
    pub const SHADOW_BASE: u32 = 2;
    pub const MAX_UNITS: u32 = 16;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

/// Attribute slots understood by the built-in programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexSemantic {
    Position,
    Normal,
    Uv,
    Color,
}

impl VertexSemantic {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "position" => Some(Self::Position),
            "normal" => Some(Self::Normal),
            "uv" => Some(Self::Uv),
            "color" => Some(Self::Color),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub semantic: VertexSemantic,
    pub buffer: BufferId,
    pub item_size: u32,
}

/// Pixel rectangle, origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    #[must_use]
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TextureDescriptor<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub sampler: TextureSampler,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub depth: bool,
    pub stencil: bool,
    pub samples: u32,
    pub sampler: TextureSampler,
}

/// Full stencil configuration for front and back faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilConfig {
    pub face: wgpu::StencilFaceState,
    pub reference: u32,
    pub read_mask: u32,
    pub write_mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Signaled,
    ContextLost,
}

pub struct ProgramDescriptor<'a> {
    pub label: &'a str,
    pub vertex_source: &'a str,
    pub fragment_source: &'a str,
    pub parameters: &'a ProgramParameters,
}

/// Per-draw uniform block. Laid out for direct upload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DrawUniforms {
    pub model: Mat4,
    pub view: Mat4,
    pub projection: Mat4,
    pub normal_matrix: Mat4,
    /// rgb, opacity
    pub color: Vec4,
    /// rgb, alpha test threshold
    pub emissive: Vec4,
    /// xyz, transmission
    pub camera_position: Vec4,
    /// rgb, shininess
    pub specular: Vec4,
    /// point size / line width, tone mapping exposure, sprite rotation, unused
    pub params: Vec4,
    /// Distance material reference point (xyz) and far distance (w).
    pub reference_point: Vec4,
    /// Viewport size in pixels (xy) and its origin (zw).
    pub viewport: Vec4,
}

/// One draw submission.
pub struct DrawCall<'a> {
    pub program: ProgramId,
    pub attributes: &'a [VertexBinding],
    pub index: Option<BufferId>,
    /// Element range: indices when indexed, vertices otherwise.
    pub range: Range<u32>,
    pub mode: DrawMode,
    pub uniforms: &'a DrawUniforms,
}

/// Compile/link output of a program that failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramDiagnostics {
    pub runnable: bool,
    pub vertex_log: String,
    pub fragment_log: String,
    pub program_log: String,
}

impl ProgramDiagnostics {
    /// Numbered source lines around `line` (1-based), with the offending
    /// line marked.
    #[must_use]
    pub fn source_context(source: &str, line: usize) -> String {
        let lines: Vec<&str> = source.lines().collect();
        let from = line.saturating_sub(6);
        let to = (line + 6).min(lines.len());
        let mut out = String::new();
        for (i, text) in lines.iter().enumerate().take(to).skip(from) {
            let marker = if i + 1 == line { ">" } else { " " };
            let _ = writeln!(out, "{marker}{:>4}: {text}", i + 1);
        }
        out
    }
}

/// Everything the engine needs from a graphics API.
pub trait RenderBackend {
    // === Context ===

    fn limits(&self) -> &wgpu::Limits;

    fn is_context_lost(&self) -> bool;

    /// Increments every time the context is (re)created. A change means all
    /// previously returned ids are void.
    fn context_generation(&self) -> u64;

    /// Size of the default framebuffer.
    fn drawing_buffer_size(&self) -> (u32, u32);

    fn set_drawing_buffer_size(&mut self, width: u32, height: u32);

    // === Programs ===

    fn create_program(
        &mut self,
        descriptor: &ProgramDescriptor<'_>,
    ) -> std::result::Result<ProgramId, ProgramDiagnostics>;

    fn delete_program(&mut self, program: ProgramId);

    fn use_program(&mut self, program: ProgramId);

    // === Buffers ===

    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> BufferId;

    fn update_buffer(&mut self, buffer: BufferId, data: &[u8]);

    fn delete_buffer(&mut self, buffer: BufferId);

    // === Textures & Render Targets ===

    fn create_texture(&mut self, descriptor: &TextureDescriptor<'_>) -> TextureId;

    fn update_texture(&mut self, texture: TextureId, descriptor: &TextureDescriptor<'_>);

    fn delete_texture(&mut self, texture: TextureId);

    fn generate_mipmaps(&mut self, texture: TextureId);

    fn create_render_target(&mut self, descriptor: &RenderTargetDescriptor) -> RenderTargetId;

    fn delete_render_target(&mut self, target: RenderTargetId);

    /// Color attachment of a render target, sampleable once resolved.
    fn render_target_texture(&self, target: RenderTargetId) -> Option<TextureId>;

    /// `None` binds the default framebuffer.
    fn bind_render_target(&mut self, target: Option<RenderTargetId>);

    /// Resolves multisampled color into the sampleable texture.
    fn resolve_render_target(&mut self, target: RenderTargetId);

    // === Pipeline State ===

    fn set_blend(&mut self, blend: Option<wgpu::BlendState>);

    fn set_depth_test(&mut self, enabled: bool);

    fn set_depth_write(&mut self, enabled: bool);

    fn set_depth_func(&mut self, func: wgpu::CompareFunction);

    fn set_color_mask(&mut self, mask: wgpu::ColorWrites);

    fn set_cull_face(&mut self, face: Option<wgpu::Face>);

    fn set_front_face(&mut self, front_face: wgpu::FrontFace);

    fn set_stencil(&mut self, stencil: Option<StencilConfig>);

    fn set_polygon_offset(&mut self, offset: Option<(f32, f32)>);

    fn set_viewport(&mut self, viewport: Viewport);

    fn set_scissor(&mut self, scissor: Option<Viewport>);

    fn set_active_texture_unit(&mut self, unit: u32);

    /// Binds to the active unit.
    fn bind_texture(&mut self, texture: Option<TextureId>);

    // === Frame Data ===

    /// Per-frame light uniforms.
    fn set_lights(&mut self, lights: &LightsState);

    fn clear(&mut self, color: Option<Vec4>, depth: Option<f32>, stencil: Option<u32>);

    fn draw(&mut self, call: &DrawCall<'_>);

    // === Synchronization ===

    fn insert_fence(&mut self) -> FenceId;

    /// Non-blocking.
    fn poll_fence(&mut self, fence: FenceId) -> FenceStatus;

    fn delete_fence(&mut self, fence: FenceId);

    /// RGBA8 pixels of a rectangle of the given target.
    fn read_pixels(&mut self, target: Option<RenderTargetId>, rect: Viewport) -> Result<Vec<u8>>;
}
