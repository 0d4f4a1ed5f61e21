//! Frame Renderer
//!
//! [`Renderer`] turns a scene and a camera node into draw calls on a
//! [`RenderBackend`]. Every frame runs in a fixed order:
//!
//! 1. Process pending disposals; update world matrices.
//! 2. Collect lights and shadow frustums.
//! 3. Render the shadow maps that are due.
//! 4. Build the render lists for the camera.
//! 5. If anything is transmissive, render the opaque list into the
//!    transmission target and mip it.
//! 6. Draw opaque, then transmissive, then transparent into the output.
//! 7. Resolve the output when it is an offscreen target.
//!
//! A single renderable with a broken resource is skipped with a warning;
//! the frame always continues. While the backend context is lost `render`
//! returns [`EngineError::ContextLost`]; once it is restored every GPU-side
//! cache is rebuilt lazily from the untouched scene and assets.

pub mod animation_loop;
pub mod backend;
pub mod draw;
pub mod geometries;
pub mod hooks;
pub mod info;
pub mod lights;
pub mod program;
pub mod readback;
pub mod render_list;
pub mod settings;
pub mod shadow;
pub mod state;
pub mod textures;

pub use animation_loop::{AnimationLoop, FrameCallback, FrameState};
pub use backend::software::SoftwareBackend;
pub use backend::wgpu_backend::WgpuBackend;
pub use backend::{RenderBackend, RenderTargetDescriptor, RenderTargetId, TextureId, Viewport};
pub use hooks::{RenderHookContext, RenderHooks, RenderPass};
pub use info::RenderInfo;
pub use render_list::{RenderItem, RenderList, SortFn};
pub use settings::{ColorManagement, RendererSettings};
pub use shadow::ShadowController;

use glam::{Vec3, Vec4};
use log::{debug, info, warn};
use slotmap::{SlotMap, new_key_type};
use wgpu::ColorWrites;

use crate::errors::{EngineError, Result};
use crate::resources::{
    Assets, ColorSpace, Disposal, Geometry, GeometryHandle, Material, MaterialHandle, Texture, TextureHandle,
    TextureSampler,
};
use crate::scene::{Camera, NodeHandle, Scene};

use self::draw::{DrawContext, MaterialBindings, PassParams};
use self::geometries::GeometryCache;
use self::lights::LightsState;
use self::program::{ProgramCache, ProgramFeatures, ProgramHandle, ToneMapping};
use self::state::StateTracker;
use self::textures::TextureCache;

new_key_type! {
    /// Renderer-owned offscreen target; survives context loss.
    pub struct RenderTargetHandle;
}

/// An offscreen target as seen by the application.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    pub descriptor: RenderTargetDescriptor,
    /// Regenerate the color texture's mip chain after each frame.
    pub generate_mipmaps: bool,
    backend: Option<RenderTargetId>,
}

/// Where the current frame draws.
#[derive(Debug, Clone, Copy)]
struct Output {
    target: Option<RenderTargetId>,
    viewport: Viewport,
    color_space: ColorSpace,
    tone_mapping: ToneMapping,
}

/// Builds a [`DrawContext`] from disjoint renderer fields so that other
/// fields (render lists, shadow controller) stay borrowable.
macro_rules! draw_context {
    ($self:ident) => {
        DrawContext {
            backend: &mut $self.backend,
            state: &mut $self.state,
            programs: &mut $self.programs,
            bindings: &mut $self.bindings,
            geometries: &mut $self.geometries,
            textures: &mut $self.textures,
            info: &mut $self.info,
            hooks: $self.hooks.as_mut(),
            lights: &$self.lights,
        }
    };
}

pub struct Renderer<B: RenderBackend> {
    backend: B,
    settings: RendererSettings,

    state: StateTracker,
    programs: ProgramCache,
    bindings: MaterialBindings,
    geometries: GeometryCache,
    textures: TextureCache,
    info: RenderInfo,
    hooks: Option<Box<dyn RenderHooks>>,

    lights: LightsState,
    render_list: RenderList,
    shadow: ShadowController,
    animation: AnimationLoop<Self>,

    targets: SlotMap<RenderTargetHandle, RenderTarget>,
    current_target: Option<RenderTargetHandle>,
    /// Drawing-buffer pixels; `None` covers the whole buffer.
    viewport: Option<Viewport>,
    scissor: Option<Viewport>,
    /// Transmission target and its size.
    transmission: Option<(RenderTargetId, u32, u32)>,

    context_generation: u64,
    context_lost: bool,
}

impl<B: RenderBackend> Renderer<B> {
    /// Fails only when the backend has no usable context.
    pub fn new(mut backend: B, settings: RendererSettings) -> Result<Self> {
        if backend.is_context_lost() {
            return Err(EngineError::ContextCreationFailed(
                "backend context is lost at creation".to_owned(),
            ));
        }
        let (width, height) = settings.drawing_buffer_size();
        backend.set_drawing_buffer_size(width, height);
        info!("Renderer created ({width}x{height}, {:?} output)", settings.output_color_space);

        let mut render_list = RenderList::new();
        render_list.sort_objects = settings.sort_objects;

        Ok(Self {
            context_generation: backend.context_generation(),
            backend,
            state: StateTracker::new(),
            programs: ProgramCache::new(),
            bindings: MaterialBindings::new(),
            geometries: GeometryCache::new(),
            textures: TextureCache::new(),
            info: RenderInfo::default(),
            hooks: None,
            lights: LightsState::default(),
            render_list,
            shadow: ShadowController::new(settings.shadow_map_enabled, settings.shadow_map_type),
            animation: AnimationLoop::new(),
            targets: SlotMap::with_key(),
            current_target: None,
            viewport: None,
            scissor: None,
            transmission: None,
            context_lost: false,
            settings,
        })
    }

    // ========================================================================
    // Frame
    // ========================================================================

    /// Renders `scene` as seen by the camera on `camera_node`.
    pub fn render(&mut self, scene: &mut Scene, assets: &mut Assets, camera_node: NodeHandle) -> Result<()> {
        self.check_context()?;
        self.process_disposals(assets);
        if self.info.auto_reset {
            self.info.reset();
        }
        self.info.render.frame += 1;

        scene.update_matrix_world();
        let camera_layers = Self::camera_layers(scene, camera_node)?;

        self.lights.setup(scene, camera_layers, self.shadow.enabled, self.shadow.shadow_type);
        let max_texture_size = self.max_texture_size();
        self.textures.set_max_size(max_texture_size);
        self.shadow.prepare(&mut self.backend, &mut self.state, scene, &mut self.lights, max_texture_size);
        self.shadow.render(&mut draw_context!(self), scene, assets);
        self.shadow.finish(scene);
        self.backend.set_lights(&self.lights);

        let scene: &Scene = scene;
        let assets: &Assets = assets;
        let camera = scene
            .camera(camera_node)
            .ok_or(EngineError::MissingComponent("camera"))?;

        self.render_list.sort_objects = self.settings.sort_objects;
        self.render_list.build(scene, assets, camera, camera_layers);

        let output = self.resolve_output();
        self.bind_shadow_maps();
        let transmission = if self.render_list.transmissive.is_empty() {
            None
        } else {
            self.render_transmission(scene, assets, camera, output.viewport)
        };

        self.bind_output(&output);
        if self.settings.auto_clear {
            self.clear_bound(output.color_space, true, true, true);
        }

        let pass = PassParams {
            pass: RenderPass::Main,
            scene,
            assets,
            camera,
            output_color_space: output.color_space,
            tone_mapping: output.tone_mapping,
            exposure: self.settings.tone_mapping_exposure,
            viewport: output.viewport,
            overrides: None,
            extra_features: ProgramFeatures::empty(),
            reference_point: Vec4::ZERO,
            transmission,
        };
        let mut ctx = draw_context!(self);
        ctx.draw_items(&pass, &self.render_list.opaque);
        ctx.draw_items(&pass, &self.render_list.transmissive);
        ctx.draw_items(&pass, &self.render_list.transparent);

        if let Some(target) = output.target {
            self.finish_target(target);
        }
        self.update_memory_info();
        debug!(
            "Frame {}: {} calls, {} triangles",
            self.info.render.frame, self.info.render.calls, self.info.render.triangles
        );
        Ok(())
    }

    fn camera_layers(scene: &Scene, camera_node: NodeHandle) -> Result<crate::scene::Layers> {
        let Some(node) = scene.get_node(camera_node) else {
            warn!("Camera node {camera_node:?} does not exist; nothing rendered");
            return Err(EngineError::NodeNotFound(format!("{camera_node:?}")));
        };
        if scene.camera(camera_node).is_none() {
            warn!("Node '{}' has no camera; nothing rendered", node.name);
            return Err(EngineError::MissingComponent("camera"));
        }
        Ok(node.layers)
    }

    /// Opaque objects into the transmission target; returns its texture.
    fn render_transmission(
        &mut self,
        scene: &Scene,
        assets: &Assets,
        camera: &Camera,
        viewport: Viewport,
    ) -> Option<TextureId> {
        let scale = self.settings.transmission_resolution_scale.max(0.01);
        let max = self.max_texture_size();
        let width = ((viewport.width as f32 * scale) as u32).clamp(1, max);
        let height = ((viewport.height as f32 * scale) as u32).clamp(1, max);

        let target = match self.transmission {
            Some((id, w, h)) if (w, h) == (width, height) => id,
            previous => {
                if let Some((old, ..)) = previous {
                    self.delete_backend_target(old);
                }
                let id = self.backend.create_render_target(&RenderTargetDescriptor {
                    width,
                    height,
                    format: wgpu::TextureFormat::Rgba16Float,
                    depth: true,
                    stencil: false,
                    samples: self.settings.transmission_samples.max(1),
                    sampler: TextureSampler {
                        address_mode_u: wgpu::AddressMode::ClampToEdge,
                        address_mode_v: wgpu::AddressMode::ClampToEdge,
                        ..TextureSampler::default()
                    },
                });
                debug!("Created {width}x{height} transmission target");
                self.transmission = Some((id, width, height));
                id
            }
        };

        let output = Output {
            target: Some(target),
            viewport: Viewport::new(0, 0, width, height),
            color_space: ColorSpace::LinearSrgb,
            tone_mapping: ToneMapping::None,
        };
        self.bind_output(&output);
        self.clear_bound(ColorSpace::LinearSrgb, true, true, false);

        let pass = PassParams {
            pass: RenderPass::Transmission,
            scene,
            assets,
            camera,
            output_color_space: output.color_space,
            tone_mapping: output.tone_mapping,
            exposure: self.settings.tone_mapping_exposure,
            viewport: output.viewport,
            overrides: None,
            extra_features: ProgramFeatures::empty(),
            reference_point: Vec4::ZERO,
            transmission: None,
        };
        draw_context!(self).draw_items(&pass, &self.render_list.opaque);

        self.backend.resolve_render_target(target);
        let texture = self.backend.render_target_texture(target)?;
        self.backend.generate_mipmaps(texture);
        Some(texture)
    }

    fn bind_shadow_maps(&mut self) {
        for (i, shadow) in self.lights.shadows.iter().enumerate() {
            self.state
                .bind_texture(&mut self.backend, LightsState::shadow_unit(i), shadow.texture);
        }
    }

    fn finish_target(&mut self, target: RenderTargetId) {
        self.backend.resolve_render_target(target);
        let mipmaps = self
            .current_target
            .and_then(|h| self.targets.get(h))
            .is_some_and(|t| t.generate_mipmaps);
        if mipmaps && let Some(texture) = self.backend.render_target_texture(target) {
            self.backend.generate_mipmaps(texture);
        }
    }

    fn update_memory_info(&mut self) {
        self.info.memory.geometries = self.geometries.len();
        self.info.memory.textures = self.textures.len();
        self.info.programs = self.programs.program_count();
    }

    // ========================================================================
    // Output target
    // ========================================================================

    /// Backend id of a renderer target, created on first use.
    fn ensure_target(&mut self, handle: RenderTargetHandle) -> Option<RenderTargetId> {
        let target = self.targets.get_mut(handle)?;
        if target.backend.is_none() {
            target.backend = Some(self.backend.create_render_target(&target.descriptor));
        }
        target.backend
    }

    fn resolve_output(&mut self) -> Output {
        let offscreen = self.current_target.and_then(|h| {
            let id = self.ensure_target(h)?;
            let d = &self.targets.get(h)?.descriptor;
            Some((id, d.width, d.height))
        });
        match offscreen {
            Some((id, width, height)) => Output {
                target: Some(id),
                viewport: Viewport::new(0, 0, width, height),
                color_space: ColorSpace::LinearSrgb,
                tone_mapping: ToneMapping::None,
            },
            None => {
                let (width, height) = self.backend.drawing_buffer_size();
                Output {
                    target: None,
                    viewport: self.viewport.unwrap_or(Viewport::new(0, 0, width, height)),
                    color_space: self.settings.output_color_space,
                    tone_mapping: self.settings.tone_mapping,
                }
            }
        }
    }

    fn bind_output(&mut self, output: &Output) {
        self.state.bind_render_target(&mut self.backend, output.target);
        self.state.set_viewport(&mut self.backend, output.viewport);
        let scissor = if output.target.is_none() { self.scissor } else { None };
        self.state.set_scissor(&mut self.backend, scissor);
    }

    /// Clears whatever is bound. The clear color is encoded for `color_space`.
    fn clear_bound(&mut self, color_space: ColorSpace, color: bool, depth: bool, stencil: bool) {
        let clear_color = color.then(|| {
            let rgb = self
                .settings
                .color_management
                .from_working(Vec3::from(self.settings.clear_color), color_space);
            rgb.extend(self.settings.clear_alpha)
        });
        if color {
            self.state.set_color_mask(&mut self.backend, ColorWrites::ALL);
        }
        if depth {
            self.state.set_depth_write(&mut self.backend, true);
        }
        if stencil {
            self.state.set_stencil(&mut self.backend, None);
        }
        self.backend
            .clear(clear_color, depth.then_some(1.0), stencil.then_some(0));
    }

    /// Clears the current output target.
    pub fn clear(&mut self, color: bool, depth: bool, stencil: bool) -> Result<()> {
        self.check_context()?;
        let output = self.resolve_output();
        self.bind_output(&output);
        self.clear_bound(output.color_space, color, depth, stencil);
        Ok(())
    }

    /// Registers an offscreen target. Sizes above the texture limit are
    /// clamped.
    pub fn create_render_target(&mut self, mut descriptor: RenderTargetDescriptor) -> RenderTargetHandle {
        let max = self.max_texture_size();
        if descriptor.width > max || descriptor.height > max {
            warn!(
                "Render target {}x{} exceeds the texture limit; clamping to {max}",
                descriptor.width, descriptor.height
            );
            descriptor.width = descriptor.width.min(max);
            descriptor.height = descriptor.height.min(max);
        }
        descriptor.width = descriptor.width.max(1);
        descriptor.height = descriptor.height.max(1);
        self.targets.insert(RenderTarget {
            descriptor,
            generate_mipmaps: false,
            backend: None,
        })
    }

    #[must_use]
    pub fn render_target(&self, handle: RenderTargetHandle) -> Option<&RenderTarget> {
        self.targets.get(handle)
    }

    pub fn render_target_mut(&mut self, handle: RenderTargetHandle) -> Option<&mut RenderTarget> {
        self.targets.get_mut(handle)
    }

    /// Color texture of a target that has been rendered to.
    #[must_use]
    pub fn render_target_texture(&self, handle: RenderTargetHandle) -> Option<TextureId> {
        let id = self.targets.get(handle)?.backend?;
        self.backend.render_target_texture(id)
    }

    pub fn delete_render_target(&mut self, handle: RenderTargetHandle) {
        if self.current_target == Some(handle) {
            self.current_target = None;
        }
        if let Some(id) = self.targets.remove(handle).and_then(|t| t.backend) {
            self.delete_backend_target(id);
        }
    }

    fn delete_backend_target(&mut self, id: RenderTargetId) {
        if let Some(texture) = self.backend.render_target_texture(id) {
            self.state.forget_texture(texture);
        }
        if self.state.current().render_target == Some(id) {
            self.state.bind_render_target(&mut self.backend, None);
        }
        self.backend.delete_render_target(id);
    }

    /// `None` renders to the default framebuffer.
    pub fn set_render_target(&mut self, target: Option<RenderTargetHandle>) {
        self.current_target = target.filter(|h| self.targets.contains_key(*h));
    }

    #[must_use]
    pub fn render_target_handle(&self) -> Option<RenderTargetHandle> {
        self.current_target
    }

    // ========================================================================
    // Size, viewport and clearing
    // ========================================================================

    /// Resizes the drawing buffer (CSS pixels).
    pub fn set_size(&mut self, width: u32, height: u32) {
        self.settings.width = width;
        self.settings.height = height;
        self.apply_size();
    }

    pub fn set_pixel_ratio(&mut self, pixel_ratio: f32) {
        self.settings.pixel_ratio = pixel_ratio.max(f32::EPSILON);
        self.apply_size();
    }

    fn apply_size(&mut self) {
        let (width, height) = self.settings.drawing_buffer_size();
        let max = self.max_texture_size();
        if width > max || height > max {
            warn!("Drawing buffer {width}x{height} exceeds the texture limit; clamping to {max}");
        }
        self.backend.set_drawing_buffer_size(width.min(max), height.min(max));
    }

    #[must_use]
    pub fn drawing_buffer_size(&self) -> (u32, u32) {
        self.backend.drawing_buffer_size()
    }

    fn scale(&self, rect: Viewport) -> Viewport {
        let r = self.settings.pixel_ratio;
        let px = |v: u32| (v as f32 * r).floor() as u32;
        Viewport::new(px(rect.x), px(rect.y), px(rect.width), px(rect.height))
    }

    /// Screen viewport in CSS pixels; `None` covers the drawing buffer.
    pub fn set_viewport(&mut self, viewport: Option<Viewport>) {
        self.viewport = viewport.map(|v| self.scale(v));
    }

    /// Screen scissor rectangle in CSS pixels; `None` disables it.
    pub fn set_scissor(&mut self, scissor: Option<Viewport>) {
        self.scissor = scissor.map(|s| self.scale(s));
    }

    /// Clear color in the working color space.
    pub fn set_clear_color(&mut self, color: Vec3, alpha: f32) {
        self.settings.clear_color = color.to_array();
        self.settings.clear_alpha = alpha;
    }

    /// Effective `max_texture_dimension_2d`.
    #[must_use]
    pub fn max_texture_size(&self) -> u32 {
        let limit = self.backend.limits().max_texture_dimension_2d;
        self.settings.max_texture_size.map_or(limit, |m| m.min(limit)).max(1)
    }

    // ========================================================================
    // Programs and disposal
    // ========================================================================

    /// Acquires every program the scene needs from `camera_node` without
    /// drawing. Returns the number of live programs.
    pub fn compile(&mut self, scene: &mut Scene, assets: &Assets, camera_node: NodeHandle) -> Result<usize> {
        self.check_context()?;
        scene.update_matrix_world();
        let camera_layers = Self::camera_layers(scene, camera_node)?;
        self.lights.setup(scene, camera_layers, self.shadow.enabled, self.shadow.shadow_type);

        let scene: &Scene = scene;
        let camera = scene
            .camera(camera_node)
            .ok_or(EngineError::MissingComponent("camera"))?;
        self.render_list.build(scene, assets, camera, camera_layers);
        let output = self.resolve_output();

        let pass = PassParams {
            pass: RenderPass::Main,
            scene,
            assets,
            camera,
            output_color_space: output.color_space,
            tone_mapping: output.tone_mapping,
            exposure: self.settings.tone_mapping_exposure,
            viewport: output.viewport,
            overrides: None,
            extra_features: ProgramFeatures::empty(),
            reference_point: Vec4::ZERO,
            transmission: None,
        };
        let mut ctx = draw_context!(self);
        let buckets = [
            &self.render_list.opaque,
            &self.render_list.transmissive,
            &self.render_list.transparent,
        ];
        for item in buckets.into_iter().flatten() {
            let (Some(node), Some(material), Some(geometry)) = (
                scene.get_node(item.node),
                assets.materials.get(item.material),
                assets.geometries.get(item.geometry),
            ) else {
                continue;
            };
            let handle = ctx.prepare_program(
                material,
                &pass,
                node.receive_shadow,
                geometry.attribute("color").is_some(),
                item.draw_mode,
            );
            ctx.programs.program_id(&mut *ctx.backend, handle);
        }
        let count = self.programs.program_count();
        info!("Compiled scene: {count} programs live");
        Ok(count)
    }

    fn process_disposals(&mut self, assets: &mut Assets) {
        for disposal in assets.drain_disposals() {
            match disposal {
                Disposal::Geometry(id) => self.geometries.dispose(&mut self.backend, id),
                Disposal::Texture(id) => {
                    if let Some(texture) = self.textures.dispose(&mut self.backend, id) {
                        self.state.forget_texture(texture);
                    }
                }
                Disposal::Material(id) => self.bindings.dispose(&mut self.backend, &mut self.programs, id),
            }
        }
    }

    /// Removes a geometry and frees its buffers now.
    pub fn dispose_geometry(&mut self, assets: &mut Assets, handle: GeometryHandle) -> Option<Geometry> {
        let geometry = assets.dispose_geometry(handle);
        self.process_disposals(assets);
        geometry
    }

    /// Removes a texture and frees its GPU copy now.
    pub fn dispose_texture(&mut self, assets: &mut Assets, handle: TextureHandle) -> Option<Texture> {
        let texture = assets.dispose_texture(handle);
        self.process_disposals(assets);
        texture
    }

    /// Removes a material and releases its programs now.
    pub fn dispose_material(&mut self, assets: &mut Assets, handle: MaterialHandle) -> Option<Material> {
        let material = assets.dispose_material(handle);
        self.process_disposals(assets);
        material
    }

    // ========================================================================
    // Context loss
    // ========================================================================

    /// Fails while the context is lost; rebuilds caches after a restore.
    fn check_context(&mut self) -> Result<()> {
        if self.backend.is_context_lost() {
            if !self.context_lost {
                warn!("Rendering context lost; frames are skipped until it is restored");
                self.context_lost = true;
            }
            return Err(EngineError::ContextLost);
        }
        let generation = self.backend.context_generation();
        if self.context_lost || generation != self.context_generation {
            self.context_lost = false;
            self.context_generation = generation;
            self.rebuild_after_restore();
        }
        Ok(())
    }

    fn rebuild_after_restore(&mut self) {
        info!("Rendering context restored; GPU caches are rebuilt on demand");
        self.state.reset();
        self.programs.invalidate();
        self.geometries.clear();
        self.textures.clear();
        self.shadow.invalidate();
        self.transmission = None;
        for target in self.targets.values_mut() {
            target.backend = None;
        }
        self.apply_size();
    }

    #[must_use]
    pub fn is_context_lost(&self) -> bool {
        self.backend.is_context_lost()
    }

    // ========================================================================
    // Animation loop and readback
    // ========================================================================

    /// Replaces the frame callback; `None` stops the loop.
    pub fn set_animation_loop(&mut self, callback: Option<FrameCallback<Self>>) {
        self.animation.set(callback);
    }

    #[must_use]
    pub fn is_animating(&self) -> bool {
        self.animation.is_running()
    }

    /// Runs the frame callback for a host refresh at `timestamp` (ms).
    /// Returns whether a callback ran; nothing runs while the context is
    /// lost.
    pub fn tick(&mut self, timestamp: f64) -> bool {
        if self.backend.is_context_lost() {
            return false;
        }
        let Some((mut callback, frame, generation)) = self.animation.begin(timestamp) else {
            return false;
        };
        callback(self, &frame);
        self.animation.finish(callback, generation);
        true
    }

    /// Reads an RGBA8 rectangle of `target` (`None`: default framebuffer)
    /// once the commands issued so far have completed.
    pub async fn read_render_target_pixels_async(
        &mut self,
        target: Option<RenderTargetHandle>,
        rect: Viewport,
    ) -> Result<Vec<u8>> {
        let id = match target {
            Some(handle) => Some(
                self.targets
                    .get(handle)
                    .and_then(|t| t.backend)
                    .ok_or_else(|| EngineError::ResourceNotFound(format!("render target {handle:?}")))?,
            ),
            None => None,
        };
        let max_polls = self.settings.max_fence_polls;
        readback::read_pixels_async(&mut self.backend, id, rect, max_polls).await
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[must_use]
    pub fn info(&self) -> &RenderInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut RenderInfo {
        &mut self.info
    }

    #[must_use]
    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    /// Output, tone mapping and clearing settings. Size changes go through
    /// [`Self::set_size`], shadow switches through [`Self::shadow_mut`].
    pub fn settings_mut(&mut self) -> &mut RendererSettings {
        &mut self.settings
    }

    pub fn set_hooks(&mut self, hooks: Option<Box<dyn RenderHooks>>) {
        self.hooks = hooks;
    }

    pub fn set_opaque_sort(&mut self, sort: Option<SortFn>) {
        self.render_list.set_opaque_sort(sort);
    }

    pub fn set_transparent_sort(&mut self, sort: Option<SortFn>) {
        self.render_list.set_transparent_sort(sort);
    }

    #[must_use]
    pub fn render_list(&self) -> &RenderList {
        &self.render_list
    }

    #[must_use]
    pub fn lights(&self) -> &LightsState {
        &self.lights
    }

    #[must_use]
    pub fn shadow(&self) -> &ShadowController {
        &self.shadow
    }

    pub fn shadow_mut(&mut self) -> &mut ShadowController {
        &mut self.shadow
    }

    #[must_use]
    pub fn program_cache(&self) -> &ProgramCache {
        &self.programs
    }

    /// Programs currently held by a material.
    #[must_use]
    pub fn material_programs(&self, material: &Material) -> Vec<ProgramHandle> {
        self.bindings.programs_of(material.id())
    }

    #[must_use]
    pub fn state(&self) -> &StateTracker {
        &self.state
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}
