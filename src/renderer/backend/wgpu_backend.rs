//! wgpu Backend
//!
//! A [`RenderBackend`] on a `wgpu` device. Programs are validated and
//! reflected with naga (see the `wgsl` module); their bind group layouts and
//! vertex inputs come from that reflection. Each draw folds the tracked
//! toggles into a [`PipelineKey`] and reuses the render pipeline cached for
//! it. Bind groups are cached per program, group and bound textures.
//!
//! Commands are recorded into one pending encoder, submitted before any
//! queue write that earlier commands could observe, before fences and
//! before readback. The default framebuffer is an offscreen `Rgba8Unorm`
//! texture with a `Depth24PlusStencil8` attachment.

use std::borrow::Cow;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use glam::Vec4;
use log::{debug, error, info, warn};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::gpu_lights;
use super::mipmap::MipmapGenerator;
use super::pipeline_key::{PipelineKey, TargetFormats, VertexSlotKey};
use super::raster::FixedState;
use super::wgsl::{self, Resource, ResourceKind};
use super::{
    BufferId, BufferKind, DrawCall, DrawUniforms, FenceId, FenceStatus, ProgramDescriptor, ProgramDiagnostics,
    ProgramId, RenderBackend, RenderTargetDescriptor, RenderTargetId, StencilConfig, TextureDescriptor, TextureId,
    VertexSemantic, Viewport, units,
};
use crate::errors::{EngineError, Result};
use crate::renderer::lights::LightsState;
use crate::resources::TextureSampler;

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;
const DRAW_UNIFORMS_SIZE: u64 = size_of::<DrawUniforms>() as u64;
const CLEAR_UNIFORMS_SIZE: u64 = 32;
/// Uniform slots per submission.
const RING_SLOTS: u64 = 1024;

/// Values fed to vertex inputs without a bound attribute: zeros at 0,
/// `+Z` normal at 16, opaque white at 32.
const DEFAULT_VERTEX: [f32; 12] = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0];

fn default_vertex_offset(location: u32) -> u64 {
    match location {
        1 => 16,
        3 => 32,
        _ => 0,
    }
}

fn semantic(location: u32) -> Option<VertexSemantic> {
    match location {
        0 => Some(VertexSemantic::Position),
        1 => Some(VertexSemantic::Normal),
        2 => Some(VertexSemantic::Uv),
        3 => Some(VertexSemantic::Color),
        _ => None,
    }
}

fn vertex_format(item_size: u32) -> Option<wgpu::VertexFormat> {
    match item_size {
        1 => Some(wgpu::VertexFormat::Float32),
        2 => Some(wgpu::VertexFormat::Float32x2),
        3 => Some(wgpu::VertexFormat::Float32x3),
        4 => Some(wgpu::VertexFormat::Float32x4),
        _ => None,
    }
}

fn filterable(format: wgpu::TextureFormat) -> bool {
    !matches!(
        format,
        wgpu::TextureFormat::R32Float | wgpu::TextureFormat::Rg32Float | wgpu::TextureFormat::Rgba32Float
    )
}

/// Scissor (or the whole target) clipped to the target; `None` when empty.
fn clip_rect(rect: Option<Viewport>, width: u32, height: u32) -> Option<Viewport> {
    let r = rect.unwrap_or(Viewport::new(0, 0, width, height));
    let (x0, y0) = (r.x.min(width), r.y.min(height));
    let x1 = r.x.saturating_add(r.width).min(width);
    let y1 = r.y.saturating_add(r.height).min(height);
    (x1 > x0 && y1 > y0).then(|| Viewport::new(x0, y0, x1 - x0, y1 - y0))
}

/// Pads to the copy alignment.
fn padded(data: &[u8]) -> Cow<'_, [u8]> {
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    if data.len() % align == 0 {
        Cow::Borrowed(data)
    } else {
        let mut bytes = data.to_vec();
        bytes.resize(data.len().next_multiple_of(align), 0);
        Cow::Owned(bytes)
    }
}

/// One texel of a readback row as RGBA8.
fn texel_rgba8(texel: &[u8], format: wgpu::TextureFormat) -> [u8; 4] {
    let byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    match format {
        wgpu::TextureFormat::Rgba16Float => {
            let c = |i: usize| byte(half::f16::from_le_bytes([texel[i * 2], texel[i * 2 + 1]]).to_f32());
            [c(0), c(1), c(2), c(3)]
        }
        wgpu::TextureFormat::Rgba32Float => {
            let c = |i: usize| {
                byte(f32::from_le_bytes([
                    texel[i * 4],
                    texel[i * 4 + 1],
                    texel[i * 4 + 2],
                    texel[i * 4 + 3],
                ]))
            };
            [c(0), c(1), c(2), c(3)]
        }
        wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb => [texel[2], texel[1], texel[0], texel[3]],
        _ => [texel[0], texel[1], texel[2], texel[3]],
    }
}

fn to_color(c: Vec4) -> wgpu::Color {
    wgpu::Color {
        r: f64::from(c.x),
        g: f64::from(c.y),
        b: f64::from(c.z),
        a: f64::from(c.w),
    }
}

/// Replaces `buffer` with a larger one; returns whether it did.
fn ensure_capacity(device: &wgpu::Device, buffer: &mut wgpu::Buffer, size: u64, label: &str) -> bool {
    if buffer.size() >= size {
        return false;
    }
    *buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size.next_power_of_two(),
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    true
}

// ============================================================================
// Storage
// ============================================================================

struct ProgramGroup {
    index: u32,
    layout: wgpu::BindGroupLayout,
    /// Resources with their uniform size (0 for handles).
    entries: Vec<(Resource, u64)>,
    /// Binding 0 is the per-draw uniform block at a dynamic offset.
    dynamic: bool,
}

struct GpuProgram {
    label: String,
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    layout: wgpu::PipelineLayout,
    groups: Vec<ProgramGroup>,
    inputs: Vec<wgsl::VertexInput>,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    len: u64,
    kind: BufferKind,
}

struct GpuTexture {
    texture: wgpu::Texture,
    /// Level 0 only; attachment view and sampling view until mipmapped.
    base_view: wgpu::TextureView,
    full_view: wgpu::TextureView,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    sampler: TextureSampler,
    mipmapped: bool,
}

impl GpuTexture {
    fn view(&self) -> &wgpu::TextureView {
        if self.mipmapped { &self.full_view } else { &self.base_view }
    }
}

struct GpuTarget {
    texture: TextureId,
    samples: u32,
    msaa: Option<wgpu::TextureView>,
    depth: Option<wgpu::TextureView>,
}

struct Framebuffer {
    color: wgpu::Texture,
    view: wgpu::TextureView,
    depth: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl Framebuffer {
    fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let color = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Default Framebuffer"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = color.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            color,
            view,
            depth: depth_view(device, width, height, 1),
            width,
            height,
        }
    }
}

fn depth_view(device: &wgpu::Device, width: u32, height: u32, samples: u32) -> wgpu::TextureView {
    device
        .create_texture(&wgpu::TextureDescriptor {
            label: Some("Depth Stencil"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: samples,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        })
        .create_view(&wgpu::TextureViewDescriptor::default())
}

/// Dynamic-offset uniform slots, reset after every submission.
struct UniformRing {
    buffer: wgpu::Buffer,
    stride: u64,
    cursor: u64,
}

struct ClearResources {
    shader: wgpu::ShaderModule,
    pipeline_layout: wgpu::PipelineLayout,
    bind_group: wgpu::BindGroup,
}

/// Device objects recreated with the context.
struct Core {
    framebuffer: Framebuffer,
    mipmaps: MipmapGenerator,
    ring: UniformRing,
    lights: wgpu::Buffer,
    shadows: wgpu::Buffer,
    /// Backs uniforms the engine does not feed.
    zeros: wgpu::Buffer,
    default_vertex: wgpu::Buffer,
    dummy: wgpu::TextureView,
    dummy_sampler: wgpu::Sampler,
    clear: ClearResources,
}

impl Core {
    fn new(device: &wgpu::Device, queue: &wgpu::Queue, width: u32, height: u32) -> Self {
        let uniform = |label: &str, size: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };

        let stride = DRAW_UNIFORMS_SIZE.next_multiple_of(u64::from(device.limits().min_uniform_buffer_offset_alignment));
        let ring = UniformRing {
            buffer: uniform("Draw Uniform Ring", stride * RING_SLOTS),
            stride,
            cursor: 0,
        };

        let default_vertex = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Default Vertex"),
            size: size_of_val(&DEFAULT_VERTEX) as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&default_vertex, 0, bytemuck::cast_slice(&DEFAULT_VERTEX));

        let dummy = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Dummy Texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            dummy.as_image_copy(),
            &[255; 4],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            dummy.size(),
        );

        let clear_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Clear Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(CLEAR_UNIFORMS_SIZE),
                },
                count: None,
            }],
        });
        let clear = ClearResources {
            shader: device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Clear Shader"),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/clear.wgsl"))),
            }),
            pipeline_layout: device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Clear Pipeline Layout"),
                bind_group_layouts: &[Some(&clear_layout)],
                immediate_size: 0,
            }),
            bind_group: device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Clear BG"),
                layout: &clear_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &ring.buffer,
                        offset: 0,
                        size: NonZeroU64::new(CLEAR_UNIFORMS_SIZE),
                    }),
                }],
            }),
        };

        Self {
            framebuffer: Framebuffer::new(device, width, height),
            mipmaps: MipmapGenerator::new(device),
            ring,
            lights: uniform("Lights", 256),
            shadows: uniform("Shadows", 256),
            zeros: uniform("Zero Uniforms", 256),
            default_vertex,
            dummy: dummy.create_view(&wgpu::TextureViewDescriptor::default()),
            dummy_sampler: device.create_sampler(&wgpu::SamplerDescriptor::default()),
            clear,
        }
    }
}

/// Attachments of the bound framebuffer.
struct Attachments {
    color: wgpu::TextureView,
    depth: Option<wgpu::TextureView>,
    format: wgpu::TextureFormat,
    samples: u32,
    width: u32,
    height: u32,
    /// Texture rendered into directly; it cannot be sampled by the same draw.
    feedback: Option<TextureId>,
}

impl Attachments {
    fn formats(&self) -> TargetFormats {
        TargetFormats {
            color: self.format,
            depth: self.depth.is_some().then_some(DEPTH_FORMAT),
            samples: self.samples,
        }
    }
}

/// Begins a pass that loads every attachment unless a clear value is given.
fn begin_pass<'e>(
    encoder: &'e mut wgpu::CommandEncoder,
    attachments: &Attachments,
    color: Option<wgpu::Color>,
    depth: Option<f32>,
    stencil: Option<u32>,
) -> wgpu::RenderPass<'e> {
    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("Forward Pass"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: &attachments.color,
            depth_slice: None,
            resolve_target: None,
            ops: wgpu::Operations {
                load: color.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: attachments.depth.as_ref().map(|view| wgpu::RenderPassDepthStencilAttachment {
            view,
            depth_ops: Some(wgpu::Operations {
                load: depth.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                store: wgpu::StoreOp::Store,
            }),
            stencil_ops: Some(wgpu::Operations {
                load: stencil.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                store: wgpu::StoreOp::Store,
            }),
        }),
        ..Default::default()
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindGroupKey {
    program: u64,
    group: u32,
    /// Texture per handle binding; 0 is the dummy texture.
    textures: SmallVec<[u64; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClearKey {
    format: wgpu::TextureFormat,
    samples: u32,
    color_mask: u32,
    depth: bool,
    depth_write: bool,
    stencil_mask: u32,
}

#[derive(Debug, Clone, Copy)]
struct BoundState {
    program: Option<ProgramId>,
    target: Option<RenderTargetId>,
    fixed: FixedState,
    viewport: Option<Viewport>,
    active_unit: u32,
    units: [Option<TextureId>; units::MAX_UNITS as usize],
}

impl Default for BoundState {
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

/// Counters since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuStats {
    pub draw_calls: u64,
    pub clears: u64,
    pub pipelines_created: u64,
    pub bind_groups_created: u64,
    pub submissions: u64,
    pub mipmap_generations: u64,
    pub resolves: u64,
}

// ============================================================================
// Backend
// ============================================================================

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: wgpu::Limits,
    generation: u64,
    lost: Arc<AtomicBool>,
    errors: Arc<AtomicU64>,
    next_id: u64,

    core: Core,
    programs: FxHashMap<u64, Arc<GpuProgram>>,
    buffers: FxHashMap<u64, GpuBuffer>,
    textures: FxHashMap<u64, GpuTexture>,
    targets: FxHashMap<u64, GpuTarget>,
    fences: FxHashMap<u64, Arc<AtomicBool>>,

    pipelines: FxHashMap<PipelineKey, wgpu::RenderPipeline>,
    clear_pipelines: FxHashMap<ClearKey, wgpu::RenderPipeline>,
    bind_groups: FxHashMap<BindGroupKey, wgpu::BindGroup>,
    samplers: FxHashMap<(TextureSampler, bool), wgpu::Sampler>,

    state: BoundState,
    encoder: Option<wgpu::CommandEncoder>,
    stats: GpuStats,
}

impl WgpuBackend {
    /// Requests an adapter and device with WebGL2-class limits raised to
    /// the adapter's resolution limits.
    pub async fn request(width: u32, height: u32) -> Result<Self> {
        let (device, queue) = Self::request_device().await?;
        Self::new(device, queue, width, height)
    }

    /// A fresh device for [`Self::new`] or [`Self::restore`].
    pub async fn request_device() -> Result<(wgpu::Device, wgpu::Queue)> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| EngineError::ContextCreationFailed(e.to_string()))?;
        adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("myth-forward"),
                required_limits: wgpu::Limits::downlevel_webgl2_defaults().using_resolution(adapter.limits()),
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::ContextCreationFailed(e.to_string()))
    }

    pub fn new(device: wgpu::Device, queue: wgpu::Queue, width: u32, height: u32) -> Result<Self> {
        let limits = device.limits();
        let max = limits.max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(EngineError::ContextCreationFailed(format!(
                "drawing buffer {width}x{height} outside 1..={max}"
            )));
        }
        let lost = Arc::new(AtomicBool::new(false));
        let errors = Arc::new(AtomicU64::new(0));
        install_callbacks(&device, &lost, &errors);
        let core = Core::new(&device, &queue, width, height);
        info!("wgpu context created ({width}x{height}, max texture {max})");

        Ok(Self {
            device,
            queue,
            limits,
            generation: 1,
            lost,
            errors,
            next_id: 1,
            core,
            programs: FxHashMap::default(),
            buffers: FxHashMap::default(),
            textures: FxHashMap::default(),
            targets: FxHashMap::default(),
            fences: FxHashMap::default(),
            pipelines: FxHashMap::default(),
            clear_pipelines: FxHashMap::default(),
            bind_groups: FxHashMap::default(),
            samplers: FxHashMap::default(),
            state: BoundState::default(),
            encoder: None,
            stats: GpuStats::default(),
        })
    }

    #[must_use]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[must_use]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    #[must_use]
    pub fn stats(&self) -> &GpuStats {
        &self.stats
    }

    /// Validation errors the device reported outside any error scope.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    #[must_use]
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    #[must_use]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn render_target_count(&self) -> usize {
        self.targets.len()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // === Context loss ===

    /// Destroys the device. Every call is a no-op until [`Self::restore`].
    pub fn lose_context(&mut self) {
        if self.is_context_lost() {
            return;
        }
        warn!("wgpu device destroyed; context lost");
        self.encoder = None;
        self.device.destroy();
        self.lost.store(true, Ordering::Release);
        self.drop_resources();
    }

    /// Continues on a new device with a fresh, empty state.
    pub fn restore(&mut self, device: wgpu::Device, queue: wgpu::Queue) {
        let (width, height) = (self.core.framebuffer.width, self.core.framebuffer.height);
        self.drop_resources();
        self.lost = Arc::new(AtomicBool::new(false));
        install_callbacks(&device, &self.lost, &self.errors);
        self.core = Core::new(&device, &queue, width, height);
        self.limits = device.limits();
        self.device = device;
        self.queue = queue;
        self.generation += 1;
        info!("wgpu context restored (generation {})", self.generation);
    }

    fn drop_resources(&mut self) {
        self.encoder = None;
        self.programs.clear();
        self.buffers.clear();
        self.textures.clear();
        self.targets.clear();
        self.fences.clear();
        self.pipelines.clear();
        self.clear_pipelines.clear();
        self.bind_groups.clear();
        self.samplers.clear();
        self.state = BoundState::default();
    }

    // === Recording ===

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        self.encoder.get_or_insert_with(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        })
    }

    /// Submits pending commands.
    fn flush(&mut self) -> Option<wgpu::SubmissionIndex> {
        let encoder = self.encoder.take()?;
        let index = self.queue.submit(Some(encoder.finish()));
        self.core.ring.cursor = 0;
        self.stats.submissions += 1;
        Some(index)
    }

    /// Writes one uniform slot; returns its dynamic offset.
    fn push_uniforms(&mut self, data: &[u8]) -> u32 {
        if self.core.ring.cursor + self.core.ring.stride > self.core.ring.buffer.size() {
            self.flush();
        }
        let offset = self.core.ring.cursor;
        self.queue.write_buffer(&self.core.ring.buffer, offset, &padded(data));
        self.core.ring.cursor += self.core.ring.stride;
        offset as u32
    }

    fn fixed_state(&self, width: u32, height: u32) -> FixedState {
        FixedState {
            viewport: self.state.viewport.unwrap_or(Viewport::new(0, 0, width, height)),
            ..self.state.fixed
        }
    }

    fn attachments(&self) -> Option<Attachments> {
        match self.state.target {
            None => {
                let fb = &self.core.framebuffer;
                Some(Attachments {
                    color: fb.view.clone(),
                    depth: Some(fb.depth.clone()),
                    format: COLOR_FORMAT,
                    samples: 1,
                    width: fb.width,
                    height: fb.height,
                    feedback: None,
                })
            }
            Some(id) => {
                let target = self.targets.get(&id.0)?;
                let texture = self.textures.get(&target.texture.0)?;
                Some(Attachments {
                    color: target.msaa.clone().unwrap_or_else(|| texture.base_view.clone()),
                    depth: target.depth.clone(),
                    format: texture.format,
                    samples: target.samples,
                    width: texture.width,
                    height: texture.height,
                    feedback: target.msaa.is_none().then_some(target.texture),
                })
            }
        }
    }

    fn new_texture(
        &self,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        sampler: TextureSampler,
    ) -> GpuTexture {
        let size = wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        };
        let mip_level_count = if filterable(format) {
            size.max_mips(wgpu::TextureDimension::D2)
        } else {
            1
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let base_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Base Level"),
            mip_level_count: Some(1),
            ..Default::default()
        });
        let full_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        GpuTexture {
            texture,
            base_view,
            full_view,
            width: size.width,
            height: size.height,
            format,
            sampler,
            mipmapped: false,
        }
    }

    /// Uploads level 0; short data is zero-padded.
    fn upload(&self, texture: &GpuTexture, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let row = texture.width * texture.format.block_copy_size(None).unwrap_or(4);
        let needed = row as usize * texture.height as usize;
        let bytes: Cow<'_, [u8]> = if data.len() >= needed {
            Cow::Borrowed(&data[..needed])
        } else {
            let mut bytes = data.to_vec();
            bytes.resize(needed, 0);
            Cow::Owned(bytes)
        };
        self.queue.write_texture(
            texture.texture.as_image_copy(),
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(row),
                rows_per_image: Some(texture.height),
            },
            wgpu::Extent3d {
                width: texture.width,
                height: texture.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn sampler(&mut self, sampler: TextureSampler, mipmapped: bool) -> wgpu::Sampler {
        self.samplers
            .entry((sampler, mipmapped))
            .or_insert_with(|| {
                self.device.create_sampler(&wgpu::SamplerDescriptor {
                    label: Some("Texture Sampler"),
                    address_mode_u: sampler.address_mode_u,
                    address_mode_v: sampler.address_mode_v,
                    mag_filter: sampler.mag_filter,
                    min_filter: sampler.min_filter,
                    mipmap_filter: if mipmapped {
                        wgpu::MipmapFilterMode::Linear
                    } else {
                        wgpu::MipmapFilterMode::Nearest
                    },
                    ..Default::default()
                })
            })
            .clone()
    }

    // === Programs ===

    fn build_program(&self, descriptor: &ProgramDescriptor<'_>, checked: &wgsl::CheckedProgram) -> GpuProgram {
        let mut grouped: Vec<(u32, Vec<(Resource, u64)>)> = Vec::new();
        for resource in wgsl::resources(checked) {
            let size = match resource.kind {
                ResourceKind::Uniform => wgsl::uniform_size(checked, resource.group, resource.binding).unwrap_or(16),
                _ => 0,
            };
            match grouped.last_mut() {
                Some((group, entries)) if *group == resource.group => entries.push((resource, size)),
                _ => grouped.push((resource.group, vec![(resource, size)])),
            }
        }

        let stride = self.core.ring.stride;
        let groups: Vec<ProgramGroup> = grouped
            .into_iter()
            .map(|(index, entries)| {
                let dynamic = index == 0
                    && entries
                        .iter()
                        .any(|(r, size)| r.binding == 0 && r.kind == ResourceKind::Uniform && *size <= stride);
                let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = entries
                    .iter()
                    .map(|(resource, size)| wgpu::BindGroupLayoutEntry {
                        binding: resource.binding,
                        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                        ty: match resource.kind {
                            ResourceKind::Uniform => wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: dynamic && resource.binding == 0,
                                min_binding_size: NonZeroU64::new(*size),
                            },
                            ResourceKind::Texture { filterable } => wgpu::BindingType::Texture {
                                sample_type: wgpu::TextureSampleType::Float { filterable },
                                view_dimension: wgpu::TextureViewDimension::D2,
                                multisampled: false,
                            },
                            ResourceKind::Sampler => wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        },
                        count: None,
                    })
                    .collect();
                let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(&format!("{} Group {index}", descriptor.label)),
                    entries: &layout_entries,
                });
                ProgramGroup {
                    index,
                    layout,
                    entries,
                    dynamic,
                }
            })
            .collect();

        let slots = groups.last().map_or(0, |g| g.index as usize + 1);
        let mut layouts: Vec<Option<&wgpu::BindGroupLayout>> = vec![None; slots];
        for group in &groups {
            layouts[group.index as usize] = Some(&group.layout);
        }
        let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(descriptor.label),
            bind_group_layouts: &layouts,
            immediate_size: 0,
        });

        let module = |source: &str, stage: &str| {
            self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&format!("{} {stage}", descriptor.label)),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source.to_owned())),
            })
        };

        GpuProgram {
            label: descriptor.label.to_owned(),
            vertex: module(descriptor.vertex_source, "vertex"),
            fragment: module(descriptor.fragment_source, "fragment"),
            layout,
            inputs: wgsl::vertex_inputs(&checked.vertex),
            groups,
        }
    }

    fn render_pipeline(&mut self, key: &PipelineKey, program: &GpuProgram) -> wgpu::RenderPipeline {
        if let Some(pipeline) = self.pipelines.get(key) {
            return pipeline.clone();
        }
        let attributes: SmallVec<[[wgpu::VertexAttribute; 1]; 4]> = key
            .vertex
            .iter()
            .map(|slot| {
                [wgpu::VertexAttribute {
                    format: slot.format,
                    offset: 0,
                    shader_location: slot.location,
                }]
            })
            .collect();
        let buffers: SmallVec<[wgpu::VertexBufferLayout<'_>; 4]> = key
            .vertex
            .iter()
            .zip(&attributes)
            .map(|(slot, attributes)| wgpu::VertexBufferLayout {
                array_stride: slot.stride,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes,
            })
            .collect();

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&program.label),
            layout: Some(&program.layout),
            vertex: wgpu::VertexState {
                module: &program.vertex,
                entry_point: Some(wgsl::VERTEX_ENTRY),
                buffers: &buffers,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &program.fragment,
                entry_point: Some(wgsl::FRAGMENT_ENTRY),
                targets: &[Some(key.color.state())],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: key.topology,
                strip_index_format: (key.topology == wgpu::PrimitiveTopology::LineStrip)
                    .then_some(wgpu::IndexFormat::Uint32),
                front_face: key.front_face,
                cull_mode: key.cull_mode,
                ..Default::default()
            },
            depth_stencil: key.depth_stencil.map(|ds| ds.state()),
            multisample: wgpu::MultisampleState {
                count: key.samples,
                ..Default::default()
            },
            multiview_mask: None,
            cache: None,
        });
        self.stats.pipelines_created += 1;
        debug!("Created pipeline {} for '{}'", self.pipelines.len(), program.label);
        self.pipelines.insert(key.clone(), pipeline.clone());
        pipeline
    }

    fn clear_pipeline(&mut self, key: ClearKey) -> wgpu::RenderPipeline {
        if let Some(pipeline) = self.clear_pipelines.get(&key) {
            return pipeline.clone();
        }
        let replace = wgpu::StencilFaceState {
            compare: wgpu::CompareFunction::Always,
            fail_op: wgpu::StencilOperation::Keep,
            depth_fail_op: wgpu::StencilOperation::Keep,
            pass_op: wgpu::StencilOperation::Replace,
        };
        let clear = &self.core.clear;
        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Clear Pipeline"),
            layout: Some(&clear.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &clear.shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &clear.shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: key.format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::from_bits_truncate(key.color_mask),
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: key.depth.then(|| wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: Some(key.depth_write),
                depth_compare: Some(wgpu::CompareFunction::Always),
                stencil: wgpu::StencilState {
                    front: replace,
                    back: replace,
                    read_mask: 0xff,
                    write_mask: key.stencil_mask,
                },
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState {
                count: key.samples,
                ..Default::default()
            },
            multiview_mask: None,
            cache: None,
        });
        self.clear_pipelines.insert(key, pipeline.clone());
        pipeline
    }

    // === Bind groups ===

    /// Texture id feeding a handle binding; 0 selects the dummy texture.
    fn unit_texture(&self, resource: &Resource, feedback: Option<TextureId>) -> u64 {
        let unit = match resource.group {
            2 => resource.binding / 2,
            3 => units::SHADOW_BASE + resource.binding,
            _ => return 0,
        };
        let Some(id) = self.state.units.get(unit as usize).copied().flatten() else {
            return 0;
        };
        let Some(texture) = self.textures.get(&id.0) else {
            return 0;
        };
        let needs_filtering = matches!(resource.kind, ResourceKind::Texture { filterable: true } | ResourceKind::Sampler);
        if Some(id) == feedback || (needs_filtering && !filterable(texture.format)) {
            0
        } else {
            id.0
        }
    }

    fn bind_group(&mut self, program: u64, group: &ProgramGroup, feedback: Option<TextureId>) -> wgpu::BindGroup {
        let textures: SmallVec<[u64; 4]> = group
            .entries
            .iter()
            .filter(|(r, _)| r.kind != ResourceKind::Uniform)
            .map(|(r, _)| self.unit_texture(r, feedback))
            .collect();

        let largest = group.entries.iter().map(|(_, size)| *size).max().unwrap_or(0);
        if ensure_capacity(&self.device, &mut self.core.zeros, largest, "Zero Uniforms") {
            self.bind_groups.clear();
        }

        let key = BindGroupKey {
            program,
            group: group.index,
            textures,
        };
        if let Some(bind_group) = self.bind_groups.get(&key) {
            return bind_group.clone();
        }

        enum Bound {
            Buffer(wgpu::Buffer, u64),
            View(wgpu::TextureView),
            Sampler(wgpu::Sampler),
        }

        let mut handles = key.textures.iter();
        let mut bound: Vec<(u32, Bound)> = Vec::with_capacity(group.entries.len());
        for (resource, size) in &group.entries {
            let resource_bound = match resource.kind {
                ResourceKind::Uniform => {
                    let buffer = match (resource.group, resource.binding) {
                        (0, 0) if group.dynamic => &self.core.ring.buffer,
                        (1, 0) if self.core.lights.size() >= *size => &self.core.lights,
                        (1, 1) if self.core.shadows.size() >= *size => &self.core.shadows,
                        _ => &self.core.zeros,
                    };
                    Bound::Buffer(buffer.clone(), *size)
                }
                ResourceKind::Texture { .. } => {
                    let id = handles.next().copied().unwrap_or(0);
                    Bound::View(
                        self.textures
                            .get(&id)
                            .map_or_else(|| self.core.dummy.clone(), |t| t.view().clone()),
                    )
                }
                ResourceKind::Sampler => {
                    let id = handles.next().copied().unwrap_or(0);
                    match self.textures.get(&id).map(|t| (t.sampler, t.mipmapped)) {
                        Some((sampler, mipmapped)) => Bound::Sampler(self.sampler(sampler, mipmapped)),
                        None => Bound::Sampler(self.core.dummy_sampler.clone()),
                    }
                }
            };
            bound.push((resource.binding, resource_bound));
        }

        let entries: Vec<wgpu::BindGroupEntry<'_>> = bound
            .iter()
            .map(|(binding, b)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: match b {
                    Bound::Buffer(buffer, size) => wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: 0,
                        size: NonZeroU64::new(*size),
                    }),
                    Bound::View(view) => wgpu::BindingResource::TextureView(view),
                    Bound::Sampler(sampler) => wgpu::BindingResource::Sampler(sampler),
                },
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Program BG"),
            layout: &group.layout,
            entries: &entries,
        });
        self.stats.bind_groups_created += 1;
        self.bind_groups.insert(key, bind_group.clone());
        bind_group
    }

    /// Bind groups reference texture views and buffers by value.
    fn invalidate_bind_groups(&mut self) {
        self.bind_groups.clear();
    }
}

fn install_callbacks(device: &wgpu::Device, lost: &Arc<AtomicBool>, errors: &Arc<AtomicU64>) {
    let flag = Arc::clone(lost);
    device.set_device_lost_callback(move |reason, message| {
        flag.store(true, Ordering::Release);
        warn!("wgpu device lost ({reason:?}): {message}");
    });
    let count = Arc::clone(errors);
    device.on_uncaptured_error(Arc::new(move |e: wgpu::Error| {
        count.fetch_add(1, Ordering::Relaxed);
        error!("wgpu error: {e}");
    }));
}

impl RenderBackend for WgpuBackend {
    fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    fn is_context_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn context_generation(&self) -> u64 {
        self.generation
    }

    fn drawing_buffer_size(&self) -> (u32, u32) {
        (self.core.framebuffer.width, self.core.framebuffer.height)
    }

    fn set_drawing_buffer_size(&mut self, width: u32, height: u32) {
        let max = self.limits.max_texture_dimension_2d;
        let (width, height) = (width.clamp(1, max), height.clamp(1, max));
        if (width, height) != self.drawing_buffer_size() && !self.is_context_lost() {
            self.core.framebuffer = Framebuffer::new(&self.device, width, height);
        }
    }

    fn create_program(&mut self, descriptor: &ProgramDescriptor<'_>) -> std::result::Result<ProgramId, ProgramDiagnostics> {
        if self.is_context_lost() {
            return Err(ProgramDiagnostics {
                runnable: false,
                program_log: "context lost".to_owned(),
                ..Default::default()
            });
        }
        let checked = wgsl::check_program(descriptor)?;
        let program = self.build_program(descriptor, &checked);

        let id = self.next_id();
        self.programs.insert(id, Arc::new(program));
        debug!("Linked program '{}' as {id}", descriptor.label);
        Ok(ProgramId(id))
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program.0);
        self.pipelines.retain(|key, _| key.program != program.0);
        self.bind_groups.retain(|key, _| key.program != program.0);
        if self.state.program == Some(program) {
            self.state.program = None;
        }
    }

    fn use_program(&mut self, program: ProgramId) {
        self.state.program = Some(program);
    }

    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> BufferId {
        let id = self.next_id();
        if !self.is_context_lost() {
            let usage = match kind {
                BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
                BufferKind::Index => wgpu::BufferUsages::INDEX,
            } | wgpu::BufferUsages::COPY_DST;
            let bytes = padded(data);
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(match kind {
                    BufferKind::Vertex => "Vertex Buffer",
                    BufferKind::Index => "Index Buffer",
                }),
                size: (bytes.len() as u64).max(wgpu::COPY_BUFFER_ALIGNMENT),
                usage,
                mapped_at_creation: false,
            });
            if !bytes.is_empty() {
                self.queue.write_buffer(&buffer, 0, &bytes);
            }
            self.buffers.insert(
                id,
                GpuBuffer {
                    buffer,
                    len: data.len() as u64,
                    kind,
                },
            );
        }
        BufferId(id)
    }

    fn update_buffer(&mut self, buffer: BufferId, data: &[u8]) {
        let Some(kind) = self.buffers.get(&buffer.0).map(|b| b.kind) else {
            return;
        };
        self.flush();
        let bytes = padded(data);
        let fits = self.buffers.get(&buffer.0).is_some_and(|b| b.buffer.size() >= bytes.len() as u64);
        if !fits {
            let id = BufferId(buffer.0);
            self.buffers.remove(&id.0);
            let replacement = self.create_buffer(kind, data);
            if let Some(b) = self.buffers.remove(&replacement.0) {
                self.buffers.insert(id.0, b);
            }
            return;
        }
        if let Some(b) = self.buffers.get_mut(&buffer.0) {
            if !bytes.is_empty() {
                self.queue.write_buffer(&b.buffer, 0, &bytes);
            }
            b.len = data.len() as u64;
        }
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor<'_>) -> TextureId {
        let id = self.next_id();
        if !self.is_context_lost() {
            let texture = self.new_texture(
                descriptor.label,
                descriptor.width,
                descriptor.height,
                descriptor.format,
                descriptor.sampler,
            );
            self.upload(&texture, descriptor.data);
            self.textures.insert(id, texture);
        }
        TextureId(id)
    }

    fn update_texture(&mut self, texture: TextureId, descriptor: &TextureDescriptor<'_>) {
        let Some(current) = self.textures.get(&texture.0) else {
            return;
        };
        let same_shape = (current.width, current.height, current.format)
            == (descriptor.width.max(1), descriptor.height.max(1), descriptor.format);
        self.flush();
        if same_shape {
            if let Some(t) = self.textures.get_mut(&texture.0) {
                t.sampler = descriptor.sampler;
                t.mipmapped = false;
            }
        } else {
            let replacement = self.new_texture(
                descriptor.label,
                descriptor.width,
                descriptor.height,
                descriptor.format,
                descriptor.sampler,
            );
            self.textures.insert(texture.0, replacement);
        }
        if let Some(t) = self.textures.get(&texture.0) {
            self.upload(t, descriptor.data);
        }
        self.invalidate_bind_groups();
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture.0).is_some() {
            self.invalidate_bind_groups();
        }
        for unit in &mut self.state.units {
            if *unit == Some(texture) {
                *unit = None;
            }
        }
    }

    fn generate_mipmaps(&mut self, texture: TextureId) {
        if self.is_context_lost() {
            return;
        }
        let Some(t) = self.textures.get_mut(&texture.0) else {
            return;
        };
        if t.texture.mip_level_count() < 2 {
            return;
        }
        t.mipmapped = true;
        let texture = t.texture.clone();
        let encoder = self.encoder.get_or_insert_with(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        });
        self.core.mipmaps.generate(&self.device, encoder, &texture);
        self.stats.mipmap_generations += 1;
        self.invalidate_bind_groups();
    }

    fn create_render_target(&mut self, descriptor: &RenderTargetDescriptor) -> RenderTargetId {
        let texture = self.next_id();
        let id = self.next_id();
        if self.is_context_lost() {
            return RenderTargetId(id);
        }
        let samples = if descriptor.samples > 1 && filterable(descriptor.format) {
            4
        } else {
            1
        };
        if samples != descriptor.samples.max(1) {
            debug!("Render target uses {samples} samples instead of {}", descriptor.samples);
        }
        let color = self.new_texture(
            "Render Target",
            descriptor.width,
            descriptor.height,
            descriptor.format,
            descriptor.sampler,
        );
        let (width, height) = (color.width, color.height);
        let msaa = (samples > 1).then(|| {
            self.device
                .create_texture(&wgpu::TextureDescriptor {
                    label: Some("Render Target MSAA"),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: samples,
                    dimension: wgpu::TextureDimension::D2,
                    format: descriptor.format,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    view_formats: &[],
                })
                .create_view(&wgpu::TextureViewDescriptor::default())
        });
        let depth = (descriptor.depth || descriptor.stencil).then(|| depth_view(&self.device, width, height, samples));

        self.textures.insert(texture, color);
        self.targets.insert(
            id,
            GpuTarget {
                texture: TextureId(texture),
                samples,
                msaa,
                depth,
            },
        );
        RenderTargetId(id)
    }

    fn delete_render_target(&mut self, target: RenderTargetId) {
        if let Some(t) = self.targets.remove(&target.0) {
            self.delete_texture(t.texture);
        }
        if self.state.target == Some(target) {
            self.state.target = None;
        }
    }

    fn render_target_texture(&self, target: RenderTargetId) -> Option<TextureId> {
        self.targets.get(&target.0).map(|t| t.texture)
    }

    fn bind_render_target(&mut self, target: Option<RenderTargetId>) {
        self.state.target = target;
    }

    fn resolve_render_target(&mut self, target: RenderTargetId) {
        let Some(t) = self.targets.get(&target.0) else {
            return;
        };
        self.stats.resolves += 1;
        let (Some(msaa), Some(texture)) = (t.msaa.clone(), self.textures.get(&t.texture.0)) else {
            return;
        };
        let resolve = texture.base_view.clone();
        drop(self.encoder().begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Resolve"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &msaa,
                depth_slice: None,
                resolve_target: Some(&resolve),
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            ..Default::default()
        }));
    }

    fn set_blend(&mut self, blend: Option<wgpu::BlendState>) {
        self.state.fixed.blend = blend;
    }

    fn set_depth_test(&mut self, enabled: bool) {
        self.state.fixed.depth_test = enabled;
    }

    fn set_depth_write(&mut self, enabled: bool) {
        self.state.fixed.depth_write = enabled;
    }

    fn set_depth_func(&mut self, func: wgpu::CompareFunction) {
        self.state.fixed.depth_func = func;
    }

    fn set_color_mask(&mut self, mask: wgpu::ColorWrites) {
        self.state.fixed.color_mask = mask;
    }

    fn set_cull_face(&mut self, face: Option<wgpu::Face>) {
        self.state.fixed.cull_face = face;
    }

    fn set_front_face(&mut self, front_face: wgpu::FrontFace) {
        self.state.fixed.front_face = front_face;
    }

    fn set_stencil(&mut self, stencil: Option<StencilConfig>) {
        self.state.fixed.stencil = stencil;
    }

    fn set_polygon_offset(&mut self, offset: Option<(f32, f32)>) {
        self.state.fixed.polygon_offset = offset;
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.state.viewport = Some(viewport);
    }

    fn set_scissor(&mut self, scissor: Option<Viewport>) {
        self.state.fixed.scissor = scissor;
    }

    fn set_active_texture_unit(&mut self, unit: u32) {
        self.state.active_unit = unit.min(units::MAX_UNITS - 1);
    }

    fn bind_texture(&mut self, texture: Option<TextureId>) {
        self.state.units[self.state.active_unit as usize] = texture;
    }

    fn set_lights(&mut self, lights: &LightsState) {
        if self.is_context_lost() {
            return;
        }
        self.flush();
        let light_bytes = gpu_lights::pack_lights(lights);
        let shadow_bytes = gpu_lights::pack_shadows(lights);
        let grown = ensure_capacity(&self.device, &mut self.core.lights, light_bytes.len() as u64, "Lights")
            | ensure_capacity(&self.device, &mut self.core.shadows, shadow_bytes.len() as u64, "Shadows");
        if grown {
            self.invalidate_bind_groups();
        }
        self.queue.write_buffer(&self.core.lights, 0, &light_bytes);
        if !shadow_bytes.is_empty() {
            self.queue.write_buffer(&self.core.shadows, 0, &shadow_bytes);
        }
    }

    fn clear(&mut self, color: Option<Vec4>, depth: Option<f32>, stencil: Option<u32>) {
        if self.is_context_lost() {
            return;
        }
        let Some(attachments) = self.attachments() else {
            return;
        };
        let fixed = self.fixed_state(attachments.width, attachments.height);
        let has_depth = attachments.depth.is_some();
        let color = color.filter(|_| !fixed.color_mask.is_empty());
        let depth = depth.filter(|_| has_depth && fixed.depth_write);
        let stencil_mask = fixed.stencil.map_or(0xff, |s| s.write_mask) & 0xff;
        let stencil = stencil.filter(|_| has_depth && stencil_mask != 0);
        if color.is_none() && depth.is_none() && stencil.is_none() {
            return;
        }
        let Some(rect) = clip_rect(fixed.scissor, attachments.width, attachments.height) else {
            return;
        };
        self.stats.clears += 1;

        let whole = rect == Viewport::new(0, 0, attachments.width, attachments.height);
        if whole
            && (color.is_none() || fixed.color_mask == wgpu::ColorWrites::ALL)
            && (stencil.is_none() || stencil_mask == 0xff)
        {
            drop(begin_pass(
                self.encoder(),
                &attachments,
                color.map(to_color),
                depth,
                stencil,
            ));
            return;
        }

        let pipeline = self.clear_pipeline(ClearKey {
            format: attachments.format,
            samples: attachments.samples,
            color_mask: if color.is_some() { fixed.color_mask.bits() } else { 0 },
            depth: has_depth,
            depth_write: depth.is_some(),
            stencil_mask: if stencil.is_some() { stencil_mask } else { 0 },
        });
        let c = color.unwrap_or(Vec4::ZERO);
        let uniforms: [f32; 8] = [c.x, c.y, c.z, c.w, depth.unwrap_or(0.0), 0.0, 0.0, 0.0];
        let offset = self.push_uniforms(bytemuck::cast_slice(&uniforms));
        let bind_group = self.core.clear.bind_group.clone();

        let mut pass = begin_pass(self.encoder(), &attachments, None, None, None);
        pass.set_pipeline(&pipeline);
        pass.set_scissor_rect(rect.x, rect.y, rect.width, rect.height);
        pass.set_stencil_reference(stencil.unwrap_or(0));
        pass.set_bind_group(0, &bind_group, &[offset]);
        pass.draw(0..3, 0..1);
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        if self.is_context_lost() {
            return;
        }
        let Some(program) = self.programs.get(&call.program.0).cloned() else {
            warn!("Draw with unknown program {:?}", call.program);
            return;
        };
        let Some(attachments) = self.attachments() else {
            return;
        };
        let fixed = self.fixed_state(attachments.width, attachments.height);
        let Some(scissor) = clip_rect(fixed.scissor, attachments.width, attachments.height) else {
            return;
        };
        let max = self.limits.max_texture_dimension_2d;
        let viewport = fixed.viewport;
        if viewport.width == 0 || viewport.height == 0 {
            return;
        }

        // Vertex streams in program input order.
        let mut slots: SmallVec<[(VertexSlotKey, wgpu::Buffer, u64); 4]> = SmallVec::new();
        let mut vertex_count = u32::MAX;
        for input in &program.inputs {
            let bound = semantic(input.location)
                .and_then(|s| call.attributes.iter().find(|a| a.semantic == s))
                .and_then(|a| Some((a.item_size, vertex_format(a.item_size)?, self.buffers.get(&a.buffer.0)?)));
            match bound {
                Some((item_size, format, buffer)) => {
                    let stride = u64::from(item_size) * 4;
                    vertex_count = vertex_count.min((buffer.len / stride) as u32);
                    slots.push((
                        VertexSlotKey {
                            location: input.location,
                            format,
                            stride,
                        },
                        buffer.buffer.clone(),
                        0,
                    ));
                }
                None => slots.push((
                    VertexSlotKey {
                        location: input.location,
                        format: input.format,
                        stride: 0,
                    },
                    self.core.default_vertex.clone(),
                    default_vertex_offset(input.location),
                )),
            }
        }

        let (index, range) = match call.index {
            Some(index) => {
                let Some(buffer) = self.buffers.get(&index.0) else {
                    return;
                };
                let count = (buffer.len / 4) as u32;
                (Some(buffer.buffer.clone()), call.range.start.min(count)..call.range.end.min(count))
            }
            None => (None, call.range.start.min(vertex_count)..call.range.end.min(vertex_count)),
        };
        if range.is_empty() {
            return;
        }

        let key = PipelineKey::new(
            call.program.0,
            slots.iter().map(|(key, _, _)| *key).collect(),
            call.mode,
            &fixed,
            attachments.formats(),
        );
        let pipeline = self.render_pipeline(&key, &program);
        let bind_groups: SmallVec<[(u32, wgpu::BindGroup, bool); 4]> = program
            .groups
            .iter()
            .map(|group| {
                (
                    group.index,
                    self.bind_group(call.program.0, group, attachments.feedback),
                    group.dynamic,
                )
            })
            .collect();
        let offset = self.push_uniforms(bytemuck::bytes_of(call.uniforms));

        let mut pass = begin_pass(self.encoder(), &attachments, None, None, None);
        pass.set_pipeline(&pipeline);
        pass.set_viewport(
            viewport.x as f32,
            viewport.y as f32,
            viewport.width.min(max) as f32,
            viewport.height.min(max) as f32,
            0.0,
            1.0,
        );
        pass.set_scissor_rect(scissor.x, scissor.y, scissor.width, scissor.height);
        if let Some(stencil) = fixed.stencil {
            pass.set_stencil_reference(stencil.reference);
        }
        let dynamic_offsets = [offset];
        for (group, bind_group, dynamic) in &bind_groups {
            pass.set_bind_group(*group, bind_group, if *dynamic { &dynamic_offsets[..] } else { &[] });
        }
        for (slot, (_, buffer, offset)) in slots.iter().enumerate() {
            pass.set_vertex_buffer(slot as u32, buffer.slice(*offset..));
        }
        match index {
            Some(buffer) => {
                pass.set_index_buffer(buffer.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(range, 0, 0..1);
            }
            None => pass.draw(range, 0..1),
        }
        drop(pass);
        self.stats.draw_calls += 1;
    }

    fn insert_fence(&mut self) -> FenceId {
        let id = self.next_id();
        if !self.is_context_lost() {
            self.flush();
            let signaled = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&signaled);
            self.queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));
            self.fences.insert(id, signaled);
        }
        FenceId(id)
    }

    fn poll_fence(&mut self, fence: FenceId) -> FenceStatus {
        if self.is_context_lost() {
            return FenceStatus::ContextLost;
        }
        if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
            debug!("Device poll failed: {e}");
        }
        match self.fences.get(&fence.0) {
            Some(signaled) if !signaled.load(Ordering::Acquire) => FenceStatus::Pending,
            _ => FenceStatus::Signaled,
        }
    }

    fn delete_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence.0);
    }

    fn read_pixels(&mut self, target: Option<RenderTargetId>, rect: Viewport) -> Result<Vec<u8>> {
        if self.is_context_lost() {
            return Err(EngineError::ContextLost);
        }
        let (texture, width, height, format) = match target {
            None => {
                let fb = &self.core.framebuffer;
                (fb.color.clone(), fb.width, fb.height, COLOR_FORMAT)
            }
            Some(id) => {
                let t = self
                    .targets
                    .get(&id.0)
                    .ok_or_else(|| EngineError::ResourceNotFound(format!("render target {}", id.0)))?;
                let multisampled = t.msaa.is_some();
                let texture = self
                    .textures
                    .get(&t.texture.0)
                    .ok_or_else(|| EngineError::ResourceNotFound(format!("texture {}", t.texture.0)))?;
                let found = (texture.texture.clone(), texture.width, texture.height, texture.format);
                if multisampled {
                    self.resolve_render_target(id);
                }
                found
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
        if rect.width == 0 || rect.height == 0 {
            return Ok(Vec::new());
        }

        let texel_size = format.block_copy_size(None).unwrap_or(4);
        let unpadded = rect.width * texel_size;
        let row = unpadded.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback"),
            size: u64::from(row) * u64::from(rect.height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        self.encoder().copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: rect.x,
                    y: rect.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(row),
                    rows_per_image: Some(rect.height),
                },
            },
            wgpu::Extent3d {
                width: rect.width,
                height: rect.height,
                depth_or_array_layers: 1,
            },
        );
        let submission = self.flush();

        let slice = buffer.slice(..);
        let (tx, rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: submission,
                timeout: None,
            })
            .map_err(|e| {
                warn!("Readback wait failed: {e}");
                EngineError::ContextLost
            })?;
        futures::executor::block_on(rx)
            .map_err(|_| EngineError::ContextLost)?
            .map_err(|e| {
                warn!("Readback mapping failed: {e}");
                EngineError::ContextLost
            })?;

        let pixels = {
            let data = slice.get_mapped_range();
            let mut pixels = Vec::with_capacity(rect.width as usize * rect.height as usize * 4);
            for line in data.chunks(row as usize).take(rect.height as usize) {
                for texel in line[..unpadded as usize].chunks_exact(texel_size as usize) {
                    pixels.extend_from_slice(&texel_rgba8(texel, format));
                }
            }
            pixels
        };
        buffer.unmap();
        Ok(pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scissor_is_clipped_to_the_target() {
        assert_eq!(clip_rect(None, 8, 4), Some(Viewport::new(0, 0, 8, 4)));
        assert_eq!(
            clip_rect(Some(Viewport::new(6, 2, 10, 10)), 8, 4),
            Some(Viewport::new(6, 2, 2, 2))
        );
        assert_eq!(clip_rect(Some(Viewport::new(9, 0, 2, 2)), 8, 4), None);
    }

    #[test]
    fn float_texels_are_clamped_to_bytes() {
        let half_texel: Vec<u8> = [0.5f32, 2.0, -1.0, 1.0]
            .iter()
            .flat_map(|c| half::f16::from_f32(*c).to_le_bytes())
            .collect();
        assert_eq!(texel_rgba8(&half_texel, wgpu::TextureFormat::Rgba16Float), [128, 255, 0, 255]);

        let float_texel: Vec<u8> = [0.0f32, 1.0, 0.25, 1.0].iter().flat_map(|c| c.to_le_bytes()).collect();
        assert_eq!(texel_rgba8(&float_texel, wgpu::TextureFormat::Rgba32Float), [0, 255, 64, 255]);

        assert_eq!(texel_rgba8(&[1, 2, 3, 4], wgpu::TextureFormat::Bgra8Unorm), [3, 2, 1, 4]);
    }

    #[test]
    fn missing_attributes_read_defaults() {
        let at = |location| {
            let offset = default_vertex_offset(location) as usize / 4;
            &DEFAULT_VERTEX[offset..offset + 4]
        };
        assert_eq!(at(0), &[0.0; 4]);
        assert_eq!(at(1), &[0.0, 0.0, 1.0, 0.0]);
        assert_eq!(at(3), &[1.0; 4]);
        assert_eq!(vertex_format(3), Some(wgpu::VertexFormat::Float32x3));
        assert_eq!(vertex_format(5), None);
    }

    #[test]
    fn odd_sized_data_is_padded() {
        assert_eq!(padded(&[1, 2, 3, 4]).len(), 4);
        assert_eq!(padded(&[1, 2, 3, 4, 5]).as_ref(), &[1, 2, 3, 4, 5, 0, 0, 0]);
    }
}
