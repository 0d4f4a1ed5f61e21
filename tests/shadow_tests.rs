//! Shadow Tests
//!
//! Tests for:
//! - Light cameras (directional box, spot cone, six point faces)
//! - Point light atlas layout and cube face selection
//! - Per-light update state (NeedsUpdate → Rendering → Idle)
//! - Global and per-light update triggers
//! - Map size clamping to the texture limit

use glam::Vec3;
use myth_forward::SoftwareBackend;
use myth_forward::renderer::backend::{Viewport, cube_face};
use myth_forward::renderer::lights::{LightsState, ShadowLightKind};
use myth_forward::renderer::program::ShadowMapType;
use myth_forward::renderer::shadow::{ShadowController, face_viewport, shadow_cameras};
use myth_forward::renderer::state::StateTracker;
use myth_forward::scene::{Layers, Light, LightKind, LightShadow, NodeHandle, Projection, Scene, ShadowState};

const EPSILON: f32 = 1e-4;

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

fn project(camera: &myth_forward::scene::Camera, point: Vec3) -> Vec3 {
    let clip = *camera.view_projection_matrix() * point.extend(1.0);
    clip.truncate() / clip.w
}

/// Scene with one shadow-casting light at `position`.
fn light_scene(light: Light, position: Vec3) -> (Scene, NodeHandle) {
    let mut scene = Scene::new();
    let node = scene.add_light(light);
    {
        let n = scene.get_node_mut(node).unwrap();
        n.transform.position = position;
        n.cast_shadow = true;
    }
    scene.update_matrix_world();
    (scene, node)
}

fn collect(scene: &Scene, lights: &mut LightsState) {
    lights.setup(scene, Layers::ALL, true, ShadowMapType::Pcf);
}

// ============================================================================
// Light cameras
// ============================================================================

#[test]
fn directional_camera_looks_at_target() {
    let mut shadow = LightShadow::default();
    shadow.far = 20.0;
    let kind = LightKind::Directional { target: Vec3::ZERO };
    let cameras = shadow_cameras(&kind, Vec3::new(0.0, 10.0, 0.0), &shadow, shadow.far);

    assert_eq!(cameras.len(), 1);
    let ndc = project(&cameras[0], Vec3::ZERO);
    assert!(approx(ndc.x, 0.0) && approx(ndc.y, 0.0));
    // Orthographic depth is linear between near and far.
    assert!(approx(ndc.z, (10.0 - 0.5) / (20.0 - 0.5)));

    // The box is `extent` wide in each direction.
    let edge = project(&cameras[0], Vec3::new(shadow.extent, 0.0, 0.0));
    assert!(approx(edge.x.abs(), 1.0));
    assert!(matches!(cameras[0].projection, Projection::Orthographic { .. }));
}

#[test]
fn spot_camera_covers_the_cone() {
    let angle = 0.4_f32;
    let kind = LightKind::Spot {
        target: Vec3::ZERO,
        distance: 0.0,
        angle,
        penumbra: 0.0,
        decay: 2.0,
    };
    let shadow = LightShadow::default();
    let cameras = shadow_cameras(&kind, Vec3::new(0.0, 0.0, 5.0), &shadow, shadow.far);

    let Projection::Perspective { fov_y, .. } = cameras[0].projection else {
        panic!("expected perspective projection");
    };
    assert!(approx(fov_y, angle * 2.0));

    // A point on the cone edge lands on the frustum border.
    let on_edge = Vec3::new(angle.tan() * 5.0, 0.0, 0.0);
    assert!(approx(project(&cameras[0], on_edge).x.abs(), 1.0));
}

#[test]
fn point_light_has_six_faces_matching_cube_order() {
    let kind = LightKind::Point {
        distance: 0.0,
        decay: 2.0,
    };
    let shadow = LightShadow::default();
    let position = Vec3::new(1.0, 2.0, 3.0);
    let cameras = shadow_cameras(&kind, position, &shadow, 50.0);

    assert_eq!(cameras.len(), 6);
    let directions = [Vec3::X, Vec3::NEG_X, Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z];
    for (face, direction) in directions.into_iter().enumerate() {
        let ndc = project(&cameras[face], position + direction * 4.0);
        assert!(approx(ndc.x, 0.0) && approx(ndc.y, 0.0), "face {face}");
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
        assert_eq!(cube_face(direction), face);
    }
}

#[test]
fn ambient_lights_have_no_cameras() {
    let cameras = shadow_cameras(&LightKind::Ambient, Vec3::ZERO, &LightShadow::default(), 10.0);
    assert!(cameras.is_empty());
}

#[test]
fn cube_face_picks_dominant_axis() {
    assert_eq!(cube_face(Vec3::new(0.9, 0.5, -0.2)), 0);
    assert_eq!(cube_face(Vec3::new(-0.1, -0.8, 0.3)), 3);
    assert_eq!(cube_face(Vec3::new(0.2, 0.1, -0.7)), 5);
}

#[test]
fn atlas_tiles_are_three_by_two() {
    assert_eq!(face_viewport(0, 64), Viewport::new(0, 0, 64, 64));
    assert_eq!(face_viewport(2, 64), Viewport::new(128, 0, 64, 64));
    assert_eq!(face_viewport(4, 64), Viewport::new(64, 64, 64, 64));
    assert_eq!(face_viewport(5, 64), Viewport::new(128, 64, 64, 64));
}

// ============================================================================
// Light collection
// ============================================================================

#[test]
fn shadows_need_caster_flag_and_global_switch() {
    let (mut scene, node) = light_scene(Light::new_directional(Vec3::ONE, 1.0), Vec3::new(0.0, 10.0, 0.0));
    let mut lights = LightsState::default();

    lights.setup(&scene, Layers::ALL, false, ShadowMapType::Pcf);
    assert_eq!(lights.directional.len(), 1);
    assert!(lights.shadows.is_empty());

    collect(&scene, &mut lights);
    assert_eq!(lights.shadows.len(), 1);
    assert_eq!(lights.shadows[0].kind, ShadowLightKind::Directional);
    assert_eq!(lights.directional[0].shadow, Some(0));

    scene.get_node_mut(node).unwrap().cast_shadow = false;
    collect(&scene, &mut lights);
    assert!(lights.shadows.is_empty());
}

// ============================================================================
// Update state
// ============================================================================

#[test]
fn light_walks_through_update_states() -> anyhow::Result<()> {
    let (mut scene, node) = light_scene(Light::new_directional(Vec3::ONE, 1.0), Vec3::new(0.0, 10.0, 0.0));
    let mut backend = SoftwareBackend::new(16, 16)?;
    let mut lights = LightsState::default();
    let mut controller = ShadowController::new(true, ShadowMapType::Pcf);
    let mut tracker = StateTracker::new();
    collect(&scene, &mut lights);

    assert_eq!(scene.light(node).unwrap().shadow.as_ref().unwrap().state(), ShadowState::NeedsUpdate);

    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 2048);
    let shadow = scene.light(node).unwrap().shadow.as_ref().unwrap();
    assert_eq!(shadow.state(), ShadowState::Rendering);
    assert_eq!(shadow.view_projections().len(), 1);
    assert_eq!(shadow.rendered_size(), 512);
    assert!(lights.shadows[0].texture.is_some());
    assert_eq!(controller.map_count(), 1);

    controller.finish(&mut scene);
    assert_eq!(scene.light(node).unwrap().shadow.as_ref().unwrap().state(), ShadowState::Idle);
    Ok(())
}

#[test]
fn paused_light_renders_only_on_request() -> anyhow::Result<()> {
    let mut light = Light::new_directional(Vec3::ONE, 1.0);
    light.shadow_mut().unwrap().auto_update = false;
    let (mut scene, node) = light_scene(light, Vec3::new(0.0, 10.0, 0.0));
    let mut backend = SoftwareBackend::new(16, 16)?;
    let mut lights = LightsState::default();
    let mut controller = ShadowController::new(true, ShadowMapType::Pcf);
    let mut tracker = StateTracker::new();
    let state = |scene: &Scene| scene.light(node).unwrap().shadow.as_ref().unwrap().state();

    // A fresh map renders once regardless.
    collect(&scene, &mut lights);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 2048);
    assert_eq!(state(&scene), ShadowState::Rendering);
    controller.finish(&mut scene);

    collect(&scene, &mut lights);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 2048);
    assert_eq!(state(&scene), ShadowState::Idle);
    controller.finish(&mut scene);

    scene.light_mut(node).unwrap().shadow_mut().unwrap().needs_update = true;
    collect(&scene, &mut lights);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 2048);
    assert_eq!(state(&scene), ShadowState::Rendering);
    controller.finish(&mut scene);
    assert!(!scene.light(node).unwrap().shadow.as_ref().unwrap().needs_update);
    Ok(())
}

#[test]
fn global_pause_holds_every_map() -> anyhow::Result<()> {
    let (mut scene, node) = light_scene(Light::new_directional(Vec3::ONE, 1.0), Vec3::new(0.0, 10.0, 0.0));
    let mut backend = SoftwareBackend::new(16, 16)?;
    let mut lights = LightsState::default();
    let mut controller = ShadowController::new(true, ShadowMapType::Pcf);
    let mut tracker = StateTracker::new();
    let state = |scene: &Scene| scene.light(node).unwrap().shadow.as_ref().unwrap().state();

    collect(&scene, &mut lights);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 2048);
    controller.finish(&mut scene);

    controller.auto_update = false;
    collect(&scene, &mut lights);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 2048);
    assert_ne!(state(&scene), ShadowState::Rendering);
    controller.finish(&mut scene);

    controller.needs_update = true;
    collect(&scene, &mut lights);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 2048);
    assert_eq!(state(&scene), ShadowState::Rendering);
    controller.finish(&mut scene);
    assert!(!controller.needs_update);
    Ok(())
}

// ============================================================================
// Map sizes
// ============================================================================

#[test]
fn oversized_maps_are_clamped() -> anyhow::Result<()> {
    let mut light = Light::new_directional(Vec3::ONE, 1.0);
    light.shadow_mut().unwrap().map_size = 4096;
    let (mut scene, node) = light_scene(light, Vec3::new(0.0, 10.0, 0.0));
    let mut backend = SoftwareBackend::new(16, 16)?;
    let mut lights = LightsState::default();
    let mut controller = ShadowController::new(true, ShadowMapType::Pcf);
    let mut tracker = StateTracker::new();

    collect(&scene, &mut lights);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 1024);

    assert_eq!(scene.light(node).unwrap().shadow.as_ref().unwrap().rendered_size(), 1024);
    assert_eq!(lights.shadows[0].map_size, 1024);
    Ok(())
}

#[test]
fn point_atlas_fits_the_limit() -> anyhow::Result<()> {
    let mut light = Light::new_point(Vec3::ONE, 1.0, 25.0);
    light.shadow_mut().unwrap().map_size = 1024;
    let (mut scene, node) = light_scene(light, Vec3::new(0.0, 3.0, 0.0));
    let mut backend = SoftwareBackend::new(16, 16)?;
    let mut lights = LightsState::default();
    let mut controller = ShadowController::new(true, ShadowMapType::Pcf);
    let mut tracker = StateTracker::new();

    collect(&scene, &mut lights);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 1536);

    let data = &lights.shadows[0];
    assert_eq!(data.kind, ShadowLightKind::Point);
    assert_eq!(data.map_size, 512);
    assert_eq!(data.view_projections.len(), 6);
    // Cutoff distance replaces the shadow far plane.
    assert!(approx(data.far, 25.0));
    assert_eq!(data.light_position, Vec3::new(0.0, 3.0, 0.0));
    assert_eq!(scene.light(node).unwrap().shadow.as_ref().unwrap().view_projections().len(), 6);
    Ok(())
}

#[test]
fn switching_to_vsm_recreates_maps() -> anyhow::Result<()> {
    let (mut scene, _) = light_scene(Light::new_directional(Vec3::ONE, 1.0), Vec3::new(0.0, 10.0, 0.0));
    let mut backend = SoftwareBackend::new(16, 16)?;
    let mut lights = LightsState::default();
    let mut controller = ShadowController::new(true, ShadowMapType::Pcf);
    let mut tracker = StateTracker::new();

    collect(&scene, &mut lights);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 2048);
    controller.finish(&mut scene);
    assert_eq!(backend.render_target_count(), 1);

    controller.shadow_type = ShadowMapType::Vsm;
    lights.setup(&scene, Layers::ALL, true, ShadowMapType::Vsm);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 2048);

    // Moments target plus its blur target.
    assert_eq!(backend.render_target_count(), 2);
    assert_eq!(lights.shadow_map_type, ShadowMapType::Vsm);
    Ok(())
}

#[test]
fn released_maps_are_unbound_from_the_tracker() -> anyhow::Result<()> {
    let (mut scene, node) = light_scene(Light::new_directional(Vec3::ONE, 1.0), Vec3::new(0.0, 10.0, 0.0));
    let mut backend = SoftwareBackend::new(16, 16)?;
    let mut lights = LightsState::default();
    let mut controller = ShadowController::new(true, ShadowMapType::Pcf);
    let mut tracker = StateTracker::new();

    collect(&scene, &mut lights);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 2048);
    controller.finish(&mut scene);
    let map = lights.shadows[0].texture.unwrap();
    tracker.bind_texture(&mut backend, 2, Some(map));
    assert_eq!(tracker.current().textures[2], Some(map));

    scene.get_node_mut(node).unwrap().cast_shadow = false;
    collect(&scene, &mut lights);
    controller.prepare(&mut backend, &mut tracker, &mut scene, &mut lights, 2048);

    assert_eq!(controller.map_count(), 0);
    assert_eq!(backend.render_target_count(), 0);
    assert_eq!(tracker.current().textures[2], None);
    Ok(())
}
