//! Draw Submission
//!
//! The routine shared by the shadow, transmission and main passes: resolve
//! the material (or its shadow override), upload the geometry, derive the
//! program, apply pipeline state through the tracker, bind textures, fill
//! the per-draw uniforms and submit.
//!
//! Anything wrong with a single renderable (missing resource, invalid
//! geometry, failed program) skips that renderable only.

use glam::{Mat4, Vec4};
use log::warn;
use rustc_hash::FxHashMap;

use crate::renderer::backend::{DrawCall, DrawUniforms, RenderBackend, TextureId, VertexSemantic, Viewport, units};
use crate::renderer::geometries::GeometryCache;
use crate::renderer::hooks::{RenderHookContext, RenderHooks, RenderPass};
use crate::renderer::info::RenderInfo;
use crate::renderer::lights::LightsState;
use crate::renderer::program::{ProgramCache, ProgramEnvironment, ProgramFeatures, ProgramHandle, ProgramParameters, ToneMapping};
use crate::renderer::render_list::RenderItem;
use crate::renderer::state::StateTracker;
use crate::renderer::textures::TextureCache;
use crate::resources::material::MaterialKind;
use crate::resources::{Assets, ColorSpace, Material, Side};
use crate::scene::{Camera, DrawMode, Scene};

// ============================================================================
// Material → program bindings
// ============================================================================

#[derive(Debug)]
struct MaterialPrograms {
    version: u64,
    environment: u64,
    programs: FxHashMap<String, ProgramHandle>,
}

/// Programs held by each material, keyed by material id.
///
/// A material can hold several programs at once (screen and offscreen
/// output, shadow receiving and not). When its version or the light
/// configuration moves, every program whose key no longer matches is
/// released.
#[derive(Debug, Default)]
pub struct MaterialBindings {
    materials: FxHashMap<u64, MaterialPrograms>,
}

impl MaterialBindings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Program for `material` with `parameters`, acquiring it on first use.
    pub fn resolve<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        cache: &mut ProgramCache,
        material: &Material,
        parameters: &ProgramParameters,
        environment: u64,
    ) -> ProgramHandle {
        let key = parameters.cache_key();
        let entry = self
            .materials
            .entry(material.id())
            .or_insert_with(|| MaterialPrograms {
                version: material.version(),
                environment,
                programs: FxHashMap::default(),
            });

        if entry.version != material.version() || entry.environment != environment {
            entry.programs.retain(|k, handle| {
                if *k == key {
                    true
                } else {
                    cache.release_program(backend, *handle);
                    false
                }
            });
            entry.version = material.version();
            entry.environment = environment;
        }

        if let Some(&handle) = entry.programs.get(&key) {
            return handle;
        }
        let handle = cache.acquire_program(backend, parameters, &key);
        entry.programs.insert(key, handle);
        handle
    }

    /// Releases every program of a disposed material.
    pub fn dispose<B: RenderBackend>(&mut self, backend: &mut B, cache: &mut ProgramCache, material_id: u64) {
        if let Some(entry) = self.materials.remove(&material_id) {
            for handle in entry.programs.into_values() {
                cache.release_program(backend, handle);
            }
        }
    }

    /// Program handles currently held by a material.
    #[must_use]
    pub fn programs_of(&self, material_id: u64) -> Vec<ProgramHandle> {
        self.materials
            .get(&material_id)
            .map(|e| e.programs.values().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.materials.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

// ============================================================================
// Shadow overrides
// ============================================================================

/// One override material per rendered side.
#[derive(Debug)]
pub struct OverrideMaterials {
    front: Material,
    back: Material,
    double: Material,
}

impl OverrideMaterials {
    #[must_use]
    pub fn new(make: impl Fn() -> Material) -> Self {
        let with_side = |side| {
            let mut m = make();
            m.render_state_mut().side = side;
            m
        };
        Self {
            front: with_side(Side::Front),
            back: with_side(Side::Back),
            double: with_side(Side::Double),
        }
    }

    #[must_use]
    pub fn select(&self, side: Side) -> &Material {
        match side {
            Side::Front => &self.front,
            Side::Back => &self.back,
            Side::Double => &self.double,
        }
    }
}

// ============================================================================
// Draw context
// ============================================================================

/// Renderer state borrowed for the duration of a pass.
pub struct DrawContext<'a, B: RenderBackend> {
    pub backend: &'a mut B,
    pub state: &'a mut StateTracker,
    pub programs: &'a mut ProgramCache,
    pub bindings: &'a mut MaterialBindings,
    pub geometries: &'a mut GeometryCache,
    pub textures: &'a mut TextureCache,
    pub info: &'a mut RenderInfo,
    pub hooks: Option<&'a mut Box<dyn RenderHooks>>,
    pub lights: &'a LightsState,
}

/// Per-pass inputs.
pub struct PassParams<'a> {
    pub pass: RenderPass,
    pub scene: &'a Scene,
    pub assets: &'a Assets,
    pub camera: &'a Camera,
    pub output_color_space: ColorSpace,
    pub tone_mapping: ToneMapping,
    pub exposure: f32,
    pub viewport: Viewport,
    pub overrides: Option<&'a OverrideMaterials>,
    pub extra_features: ProgramFeatures,
    /// Reference point (xyz) and far distance (w) for distance materials.
    pub reference_point: Vec4,
    pub transmission: Option<TextureId>,
}

impl<B: RenderBackend> DrawContext<'_, B> {
    /// Program for a material in the given pass, without drawing.
    pub fn prepare_program(
        &mut self,
        material: &Material,
        pass: &PassParams<'_>,
        receive_shadow: bool,
        has_vertex_colors: bool,
        draw_mode: DrawMode,
    ) -> ProgramHandle {
        let env = ProgramEnvironment {
            lights: self.lights.counts(),
            shadow_map_type: self.lights.shadow_map_type,
            tone_mapping: pass.tone_mapping,
            output_color_space: pass.output_color_space,
            receive_shadow,
            has_vertex_colors,
            draw_mode,
        };
        let mut parameters = ProgramParameters::for_material(material, &env);
        parameters.features |= pass.extra_features;
        self.bindings.resolve(
            self.backend,
            self.programs,
            material,
            &parameters,
            self.lights.config_hash(),
        )
    }

    pub fn draw_items(&mut self, pass: &PassParams<'_>, items: &[RenderItem]) {
        for item in items {
            self.draw_item(pass, item);
        }
    }

    /// Draws one render item. Returns whether a draw call was submitted.
    pub fn draw_item(&mut self, pass: &PassParams<'_>, item: &RenderItem) -> bool {
        let assets = pass.assets;
        let Some(source) = assets.materials.get(item.material) else {
            return false;
        };
        let material = match pass.overrides {
            Some(overrides) => overrides.select(source.resolved_shadow_side()),
            None => source,
        };
        let Some(node) = pass.scene.get_node(item.node) else {
            return false;
        };
        let Some(geometry) = assets.geometries.get(item.geometry) else {
            warn!("Skipping '{}': geometry {:?} is gone", node.name, item.geometry);
            return false;
        };
        if let Err(e) = self.geometries.validate(geometry) {
            warn!("Skipping '{}': {e}", node.name);
            return false;
        }

        let range = geometry.resolve_range(item.group.as_ref());
        if range.is_empty() {
            return false;
        }

        let gpu = self.geometries.update(self.backend, geometry);
        let attributes = gpu.attributes.clone();
        let index = gpu.index;
        let has_vertex_colors = gpu.has(VertexSemantic::Color);

        let handle = self.prepare_program(material, pass, node.receive_shadow, has_vertex_colors, item.draw_mode);
        let Some(program) = self.programs.program_id(self.backend, handle) else {
            return false;
        };

        let model = Mat4::from(*node.world_matrix());
        self.state.use_program(self.backend, program);
        self.state.set_material(
            self.backend,
            material.render_state(),
            material.transparent(),
            None,
            model.determinant() < 0.0,
        );

        let map = material
            .map()
            .and_then(|h| assets.textures.get(h))
            .map(|texture| self.textures.update(self.backend, texture));
        if material.map().is_some() && map.is_none() {
            warn!("Material '{}' references a missing texture", material.name);
        }
        self.state.bind_texture(self.backend, units::MAP, map);
        if material.transmission() > 0.0 {
            self.state.bind_texture(self.backend, units::TRANSMISSION, pass.transmission);
        }

        let uniforms = draw_uniforms(material, pass, model);
        let call = DrawCall {
            program,
            attributes: &attributes,
            index,
            range: range.clone(),
            mode: item.draw_mode,
            uniforms: &uniforms,
        };

        let hook_ctx = RenderHookContext {
            scene: pass.scene,
            camera: pass.camera,
            node: item.node,
            geometry,
            material,
            group: item.group,
            pass: pass.pass,
        };
        if let Some(hooks) = self.hooks.as_mut() {
            match pass.pass {
                RenderPass::Shadow => hooks.on_before_shadow(&hook_ctx),
                RenderPass::Main | RenderPass::Transmission => hooks.on_before_render(&hook_ctx),
            }
        }

        self.backend.draw(&call);
        self.info.update(range.len() as u32, item.draw_mode);

        if let Some(hooks) = self.hooks.as_mut() {
            match pass.pass {
                RenderPass::Shadow => hooks.on_after_shadow(&hook_ctx),
                RenderPass::Main | RenderPass::Transmission => hooks.on_after_render(&hook_ctx),
            }
        }
        true
    }
}

fn draw_uniforms(material: &Material, pass: &PassParams<'_>, model: Mat4) -> DrawUniforms {
    let (specular, size, rotation) = match material.kind() {
        MaterialKind::Phong { specular, shininess } => (specular.extend(*shininess), 0.0, 0.0),
        MaterialKind::Line { width } => (Vec4::ZERO, *width, 0.0),
        MaterialKind::Points { size } => (Vec4::ZERO, *size, 0.0),
        MaterialKind::Sprite { rotation } => (Vec4::ZERO, model.x_axis.truncate().length(), *rotation),
        _ => (Vec4::ZERO, 0.0, 0.0),
    };
    let vp = pass.viewport;

    DrawUniforms {
        model,
        view: *pass.camera.view_matrix(),
        projection: *pass.camera.projection_matrix(),
        normal_matrix: model.inverse().transpose(),
        color: material.color.extend(material.opacity),
        emissive: material.emissive.extend(material.alpha_test()),
        camera_position: pass.camera.world_position().extend(material.transmission()),
        specular,
        params: Vec4::new(size, pass.exposure, rotation, 0.0),
        reference_point: pass.reference_point,
        viewport: Vec4::new(vp.width as f32, vp.height as f32, vp.x as f32, vp.y as f32),
    }
}
