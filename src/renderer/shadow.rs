//! Shadow Pass Controller
//!
//! Renders one shadow map per shadow-casting light, before the main camera's
//! lists are built. Each light walks `NeedsUpdate → Rendering → Idle`:
//!
//! | light type   | camera                                  | map layout              |
//! |--------------|-----------------------------------------|-------------------------|
//! | directional  | orthographic box of half size `extent`  | `size x size`           |
//! | spot         | perspective, `fov = 2 * angle`          | `size x size`           |
//! | point        | six 90° perspective faces               | 3x2 atlas of faces      |
//!
//! Directional and spot maps store clip depth; point maps store distance to
//! the light divided by the far plane. With [`ShadowMapType::Vsm`] both
//! moments are written and blurred with a separable Gaussian pass.

use glam::{Affine3A, Mat4, Vec3, Vec4};
use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use wgpu::{ColorWrites, TextureFormat};

use crate::renderer::backend::{
    DrawCall, DrawUniforms, RenderBackend, RenderTargetDescriptor, RenderTargetId, Viewport, units,
};
use crate::renderer::draw::{DrawContext, OverrideMaterials, PassParams};
use crate::renderer::hooks::RenderPass;
use crate::renderer::lights::{LightsState, ShadowLightKind};
use crate::renderer::program::{ProgramFeatures, ProgramHandle, ProgramParameters, ShadingModel, ShadowMapType, ToneMapping};
use crate::renderer::render_list::{RenderItem, collect_shadow_casters};
use crate::renderer::state::StateTracker;
use crate::resources::primitives::create_plane;
use crate::resources::{Assets, ColorSpace, Geometry, Material, TextureSampler};
use crate::scene::{Camera, LightKind, LightShadow, NodeHandle, Projection, Scene, ShadowState};

const SHADOW_FORMAT: TextureFormat = TextureFormat::Rgba32Float;

/// Face order +X, -X, +Y, -Y, +Z, -Z with their up vectors.
const CUBE_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::NEG_Y),
    (Vec3::NEG_X, Vec3::NEG_Y),
    (Vec3::Y, Vec3::Z),
    (Vec3::NEG_Y, Vec3::NEG_Z),
    (Vec3::Z, Vec3::NEG_Y),
    (Vec3::NEG_Z, Vec3::NEG_Y),
];

// ============================================================================
// Light Cameras
// ============================================================================

fn up_for(direction: Vec3) -> Vec3 {
    if direction.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y }
}

/// Camera at `eye` looking along `direction`.
fn look_camera(projection: Projection, eye: Vec3, direction: Vec3, up: Vec3) -> Camera {
    let mut camera = Camera::with_projection(projection);
    let view = Mat4::look_at_rh(eye, eye + direction, up);
    camera.update_view_projection(&Affine3A::from_mat4(view.inverse()));
    camera
}

/// Shadow cameras of a light at `position`, one per rendered face.
#[must_use]
pub fn shadow_cameras(kind: &LightKind, position: Vec3, shadow: &LightShadow, far: f32) -> SmallVec<[Camera; 6]> {
    let near = shadow.near;
    match kind {
        LightKind::Directional { target } => {
            let direction = (*target - position).try_normalize().unwrap_or(Vec3::NEG_Y);
            let e = shadow.extent;
            let projection = Projection::Orthographic {
                left: -e,
                right: e,
                bottom: -e,
                top: e,
                near,
                far,
            };
            SmallVec::from_elem(look_camera(projection, position, direction, up_for(direction)), 1)
        }
        LightKind::Spot { target, angle, .. } => {
            let direction = (*target - position).try_normalize().unwrap_or(Vec3::NEG_Y);
            let projection = Projection::Perspective {
                fov_y: (angle * 2.0).clamp(0.1, std::f32::consts::PI - 0.01),
                aspect: 1.0,
                near,
                far,
            };
            SmallVec::from_elem(look_camera(projection, position, direction, up_for(direction)), 1)
        }
        LightKind::Point { .. } => {
            let projection = Projection::Perspective {
                fov_y: std::f32::consts::FRAC_PI_2,
                aspect: 1.0,
                near,
                far,
            };
            CUBE_FACES
                .iter()
                .map(|&(direction, up)| look_camera(projection, position, direction, up))
                .collect()
        }
        LightKind::Ambient => SmallVec::new(),
    }
}

/// Far plane of a light's shadow camera: the light's cutoff distance when
/// it has one.
fn shadow_far(kind: &LightKind, shadow: &LightShadow) -> f32 {
    match kind {
        LightKind::Point { distance, .. } | LightKind::Spot { distance, .. } if *distance > 0.0 => *distance,
        _ => shadow.far,
    }
}

/// Atlas tile of cube face `face`.
#[must_use]
pub fn face_viewport(face: usize, size: u32) -> Viewport {
    Viewport::new((face % 3) as u32 * size, (face / 3) as u32 * size, size, size)
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ShadowTarget {
    target: RenderTargetId,
    blur: Option<RenderTargetId>,
    width: u32,
    height: u32,
}

/// Deletes a shadow map and its blur target. Their textures may still be
/// bound, so the tracker forgets them first.
fn release_target<B: RenderBackend>(backend: &mut B, state: &mut StateTracker, target: ShadowTarget) {
    for id in std::iter::once(target.target).chain(target.blur) {
        if let Some(texture) = backend.render_target_texture(id) {
            state.forget_texture(texture);
        }
        backend.delete_render_target(id);
    }
}

struct PendingShadow {
    node: NodeHandle,
    cameras: SmallVec<[Camera; 6]>,
    face_size: u32,
    point: bool,
    reference_point: Vec4,
    radius: f32,
}

pub struct ShadowController {
    /// Render shadow maps at all.
    pub enabled: bool,
    /// Off: keep every map as is unless `needs_update` is set.
    pub auto_update: bool,
    /// Re-render every map once.
    pub needs_update: bool,
    pub shadow_type: ShadowMapType,

    targets: FxHashMap<NodeHandle, ShadowTarget>,
    targets_vsm: bool,
    pending: Vec<PendingShadow>,
    depth_materials: OverrideMaterials,
    distance_materials: OverrideMaterials,
    blur_geometry: Geometry,
    blur_program: Option<ProgramHandle>,
    casters: Vec<RenderItem>,
    renders: u64,
}

impl ShadowController {
    #[must_use]
    pub fn new(enabled: bool, shadow_type: ShadowMapType) -> Self {
        Self {
            enabled,
            auto_update: true,
            needs_update: false,
            shadow_type,
            targets: FxHashMap::default(),
            targets_vsm: shadow_type == ShadowMapType::Vsm,
            pending: Vec::new(),
            depth_materials: OverrideMaterials::new(Material::new_depth),
            distance_materials: OverrideMaterials::new(Material::new_distance),
            blur_geometry: create_plane(2.0, 2.0),
            blur_program: None,
            casters: Vec::new(),
            renders: 0,
        }
    }

    /// Shadow maps rendered since creation.
    #[must_use]
    pub fn renders(&self) -> u64 {
        self.renders
    }

    /// Light-space matrices, target sizes and the lights due for rendering.
    ///
    /// Fills the matrices, far planes and map textures of `lights.shadows`
    /// and moves every due light to [`ShadowState::Rendering`].
    pub fn prepare<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        state: &mut StateTracker,
        scene: &mut Scene,
        lights: &mut LightsState,
        max_texture_size: u32,
    ) {
        self.pending.clear();

        let vsm = self.shadow_type == ShadowMapType::Vsm;
        if vsm != self.targets_vsm {
            self.release_targets(backend, state);
            self.targets_vsm = vsm;
        }
        let live: FxHashSet<NodeHandle> = lights.shadows.iter().map(|s| s.node).collect();
        self.targets.retain(|node, target| {
            if live.contains(node) {
                return true;
            }
            release_target(backend, state, *target);
            false
        });

        let paused = !self.auto_update && !self.needs_update;

        for data in &mut lights.shadows {
            let Some(world) = scene.world_matrix(data.node).copied() else {
                continue;
            };
            let Some(light) = scene.light_mut(data.node) else {
                continue;
            };
            let kind = light.kind.clone();
            let Some(shadow) = light.shadow.as_mut() else {
                continue;
            };

            let point = data.kind == ShadowLightKind::Point;
            let limit = if point { max_texture_size / 3 } else { max_texture_size }.max(1);
            let face_size = if shadow.map_size > limit {
                warn!(
                    "Shadow map size {} exceeds the texture limit; clamping to {limit}",
                    shadow.map_size
                );
                limit
            } else {
                shadow.map_size.max(1)
            };
            let (width, height) = if point { (face_size * 3, face_size * 2) } else { (face_size, face_size) };

            let recreated = !self
                .targets
                .get(&data.node)
                .is_some_and(|t| t.width == width && t.height == height);
            if recreated {
                if let Some(old) = self.targets.remove(&data.node) {
                    release_target(backend, state, old);
                }
                let descriptor = RenderTargetDescriptor {
                    width,
                    height,
                    format: SHADOW_FORMAT,
                    depth: true,
                    stencil: false,
                    samples: 1,
                    sampler: TextureSampler {
                        mag_filter: wgpu::FilterMode::Nearest,
                        min_filter: wgpu::FilterMode::Nearest,
                        address_mode_u: wgpu::AddressMode::ClampToEdge,
                        address_mode_v: wgpu::AddressMode::ClampToEdge,
                    },
                };
                let target = backend.create_render_target(&descriptor);
                let blur = vsm.then(|| backend.create_render_target(&RenderTargetDescriptor { depth: false, ..descriptor }));
                self.targets.insert(
                    data.node,
                    ShadowTarget {
                        target,
                        blur,
                        width,
                        height,
                    },
                );
                debug!("Created {width}x{height} shadow map for {:?}", data.node);
            }
            let target = self.targets[&data.node];

            let position: Vec3 = world.translation.into();
            let far = shadow_far(&kind, shadow);
            let cameras = shadow_cameras(&kind, position, shadow, far);

            data.view_projections = cameras.iter().map(|c| *c.view_projection_matrix()).collect();
            data.light_position = position;
            data.map_size = face_size;
            data.far = far;
            data.texture = backend.render_target_texture(target.target);
            shadow.view_projections = data.view_projections.to_vec();

            if shadow.auto_update || shadow.needs_update || self.needs_update || recreated {
                shadow.state = ShadowState::NeedsUpdate;
            }
            if shadow.state != ShadowState::NeedsUpdate || (paused && !recreated) {
                continue;
            }
            shadow.state = ShadowState::Rendering;
            shadow.rendered_size = face_size;

            self.pending.push(PendingShadow {
                node: data.node,
                cameras,
                face_size,
                point,
                reference_point: position.extend(far),
                radius: shadow.radius,
            });
        }
    }

    /// Renders every light moved to `Rendering` by [`Self::prepare`].
    pub fn render<B: RenderBackend>(&mut self, ctx: &mut DrawContext<'_, B>, scene: &Scene, assets: &Assets) {
        let vsm = self.shadow_type == ShadowMapType::Vsm;
        let extra_features = if vsm { ProgramFeatures::VSM_OUTPUT } else { ProgramFeatures::empty() };

        for job in &self.pending {
            let Some(target) = self.targets.get(&job.node).copied() else {
                continue;
            };

            ctx.state.bind_render_target(ctx.backend, Some(target.target));
            ctx.state.set_scissor(ctx.backend, None);
            ctx.state.set_color_mask(ctx.backend, ColorWrites::ALL);
            ctx.state.set_depth_write(ctx.backend, true);
            ctx.backend.clear(Some(Vec4::ONE), Some(1.0), None);

            let overrides = if job.point { &self.distance_materials } else { &self.depth_materials };
            for (face, camera) in job.cameras.iter().enumerate() {
                let viewport = if job.point {
                    face_viewport(face, job.face_size)
                } else {
                    Viewport::new(0, 0, target.width, target.height)
                };
                ctx.state.set_viewport(ctx.backend, viewport);

                collect_shadow_casters(scene, assets, camera.frustum(), &mut self.casters);
                let pass = PassParams {
                    pass: RenderPass::Shadow,
                    scene,
                    assets,
                    camera,
                    output_color_space: ColorSpace::LinearSrgb,
                    tone_mapping: ToneMapping::None,
                    exposure: 1.0,
                    viewport,
                    overrides: Some(overrides),
                    extra_features,
                    reference_point: job.reference_point,
                    transmission: None,
                };
                ctx.draw_items(&pass, &self.casters);
            }

            if let Some(blur) = target.blur {
                Self::blur(ctx, &mut self.blur_program, &self.blur_geometry, &target, blur, job.radius);
            }
            self.renders += 1;
            ctx.info.shadow_renders += 1;
        }
    }

    /// Two separable passes: target → blur (horizontal), blur → target
    /// (vertical).
    fn blur<B: RenderBackend>(
        ctx: &mut DrawContext<'_, B>,
        program: &mut Option<ProgramHandle>,
        geometry: &Geometry,
        target: &ShadowTarget,
        blur: RenderTargetId,
        radius: f32,
    ) {
        let handle = *program.get_or_insert_with(|| {
            let parameters = ProgramParameters::utility("vsm_blur", ShadingModel::VsmBlur);
            ctx.programs.acquire_program(ctx.backend, &parameters, &parameters.cache_key())
        });
        let Some(program_id) = ctx.programs.program_id(ctx.backend, handle) else {
            return;
        };
        let gpu = ctx.geometries.update(ctx.backend, geometry);
        let attributes = gpu.attributes.clone();
        let index = gpu.index;

        ctx.state.use_program(ctx.backend, program_id);
        ctx.state.set_blend(ctx.backend, None);
        ctx.state.set_depth_test(ctx.backend, false);
        ctx.state.set_depth_write(ctx.backend, false);
        ctx.state.set_cull_face(ctx.backend, None);
        ctx.state.set_color_mask(ctx.backend, ColorWrites::ALL);
        ctx.state.set_stencil(ctx.backend, None);
        ctx.state.set_polygon_offset(ctx.backend, None);

        let viewport = Viewport::new(0, 0, target.width, target.height);
        for (axis, source, dest) in [(0.0, target.target, blur), (1.0, blur, target.target)] {
            ctx.state.bind_render_target(ctx.backend, Some(dest));
            ctx.state.set_viewport(ctx.backend, viewport);
            let texture = ctx.backend.render_target_texture(source);
            ctx.state.bind_texture(ctx.backend, units::MAP, texture);

            let uniforms = DrawUniforms {
                model: Mat4::IDENTITY,
                view: Mat4::IDENTITY,
                projection: Mat4::IDENTITY,
                normal_matrix: Mat4::IDENTITY,
                color: Vec4::ONE,
                emissive: Vec4::ZERO,
                camera_position: Vec4::ZERO,
                specular: Vec4::ZERO,
                params: Vec4::new(radius, 1.0, 0.0, axis),
                reference_point: Vec4::ZERO,
                viewport: Vec4::new(viewport.width as f32, viewport.height as f32, 0.0, 0.0),
            };
            ctx.backend.draw(&DrawCall {
                program: program_id,
                attributes: &attributes,
                index,
                range: geometry.resolve_range(None),
                mode: crate::scene::DrawMode::Triangles,
                uniforms: &uniforms,
            });
        }
    }

    /// Moves rendered lights to `Idle` and clears the one-shot triggers.
    pub fn finish(&mut self, scene: &mut Scene) {
        for job in self.pending.drain(..) {
            if let Some(shadow) = scene.light_mut(job.node).and_then(|l| l.shadow.as_mut()) {
                shadow.state = ShadowState::Idle;
                shadow.needs_update = false;
            }
        }
        self.needs_update = false;
    }

    /// Forgets every backend object after a context loss; maps are
    /// recreated and re-rendered on the next frame.
    pub fn invalidate(&mut self) {
        self.targets.clear();
        self.pending.clear();
    }

    fn release_targets<B: RenderBackend>(&mut self, backend: &mut B, state: &mut StateTracker) {
        for (_, target) in self.targets.drain() {
            release_target(backend, state, target);
        }
    }

    /// Number of lights that currently own a shadow map.
    #[must_use]
    pub fn map_count(&self) -> usize {
        self.targets.len()
    }
}
