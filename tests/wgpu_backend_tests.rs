//! wgpu Backend Tests
//!
//! Frames on a real device. Each test returns early when the machine has
//! no adapter.
//! - Clears and blocking readback
//! - Pipeline cache reuse across frames
//! - Blending and shadow passes through the renderer

use glam::{Vec3, Vec4};
use myth_forward::errors::EngineError;
use myth_forward::renderer::RenderBackend;
use myth_forward::renderer::backend::Viewport;
use myth_forward::resources::{Assets, ColorSpace, Material};
use myth_forward::scene::{Camera, Light, Mesh, NodeHandle, Scene};
use myth_forward::{Renderer, RendererSettings, WgpuBackend, create_box, create_plane};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn backend(size: u32) -> anyhow::Result<Option<WgpuBackend>> {
    init_logger();
    match pollster::block_on(WgpuBackend::request(size, size)) {
        Ok(backend) => Ok(Some(backend)),
        Err(EngineError::ContextCreationFailed(reason)) => {
            log::warn!("Skipping: no wgpu adapter ({reason})");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn renderer(size: u32, settings: RendererSettings) -> anyhow::Result<Option<Renderer<WgpuBackend>>> {
    let Some(backend) = backend(size)? else {
        return Ok(None);
    };
    let settings = RendererSettings {
        width: size,
        height: size,
        output_color_space: ColorSpace::LinearSrgb,
        ..settings
    };
    Ok(Some(Renderer::new(backend, settings)?))
}

fn scene_with_camera() -> (Scene, Assets, NodeHandle) {
    let mut scene = Scene::new();
    let camera = scene.add_camera(Camera::new_perspective(60.0, 1.0, 0.1, 100.0));
    scene.get_node_mut(camera).unwrap().transform.position = Vec3::new(0.0, 0.0, 5.0);
    (scene, Assets::new(), camera)
}

fn pixel(backend: &mut WgpuBackend, x: u32, y: u32) -> anyhow::Result<[u8; 4]> {
    let data = backend.read_pixels(None, Viewport::new(x, y, 1, 1))?;
    Ok([data[0], data[1], data[2], data[3]])
}

fn close(actual: [u8; 4], expected: [u8; 4]) -> bool {
    actual.iter().zip(expected).all(|(a, e)| a.abs_diff(e) <= 1)
}

#[test]
fn clear_reads_back_through_the_device() -> anyhow::Result<()> {
    let Some(mut backend) = backend(8)? else {
        return Ok(());
    };

    backend.clear(Some(Vec4::new(1.0, 0.0, 0.0, 1.0)), Some(1.0), Some(0));
    let pixels = backend.read_pixels(None, Viewport::new(2, 2, 4, 4))?;

    assert_eq!(pixels.len(), 4 * 4 * 4);
    assert!(pixels.chunks(4).all(|p| p == [255, 0, 0, 255]));
    assert!(matches!(
        backend.read_pixels(None, Viewport::new(6, 6, 4, 4)),
        Err(EngineError::InvalidParameter { .. })
    ));
    assert_eq!(backend.error_count(), 0);
    Ok(())
}

#[test]
fn scissored_clear_keeps_the_rest() -> anyhow::Result<()> {
    let Some(mut backend) = backend(8)? else {
        return Ok(());
    };

    backend.clear(Some(Vec4::new(0.0, 0.0, 1.0, 1.0)), None, None);
    backend.set_scissor(Some(Viewport::new(0, 0, 4, 8)));
    backend.clear(Some(Vec4::new(0.0, 1.0, 0.0, 1.0)), None, None);

    assert_eq!(pixel(&mut backend, 1, 1)?, [0, 255, 0, 255]);
    assert_eq!(pixel(&mut backend, 6, 1)?, [0, 0, 255, 255]);
    Ok(())
}

#[test]
fn repeated_frames_reuse_pipelines() -> anyhow::Result<()> {
    let Some(mut renderer) = renderer(16, RendererSettings::default())? else {
        return Ok(());
    };
    let (mut scene, mut assets, camera) = scene_with_camera();
    let geometry = assets.add_geometry(create_box(1.0, 1.0, 1.0));
    for x in [-1.0, 1.0] {
        let material = assets.add_material(Material::new_basic(Vec3::ONE));
        let node = scene.add_mesh(Mesh::new(geometry, material));
        scene.get_node_mut(node).unwrap().transform.position = Vec3::new(x, 0.0, 0.0);
    }

    renderer.render(&mut scene, &mut assets, camera)?;
    let pipelines = renderer.backend().pipeline_count();
    assert_eq!(pipelines, 1);

    renderer.render(&mut scene, &mut assets, camera)?;
    assert_eq!(renderer.backend().pipeline_count(), pipelines);
    assert_eq!(renderer.backend().stats().pipelines_created, 1);
    assert_eq!(renderer.backend().stats().draw_calls, 4);
    assert_eq!(renderer.backend().error_count(), 0);
    Ok(())
}

#[test]
fn transparent_plane_blends_over_shadow_casting_cube() -> anyhow::Result<()> {
    let settings = RendererSettings {
        shadow_map_enabled: true,
        ..RendererSettings::default()
    };
    let Some(mut renderer) = renderer(32, settings)? else {
        return Ok(());
    };
    let (mut scene, mut assets, camera) = scene_with_camera();

    let sun = scene.add_light(Light::new_directional(Vec3::ONE, 1.0));
    {
        let n = scene.get_node_mut(sun).unwrap();
        n.transform.position = Vec3::new(0.0, 10.0, 0.0);
        n.cast_shadow = true;
    }
    let cube_geometry = assets.add_geometry(create_box(1.0, 1.0, 1.0));
    let red = assets.add_material(Material::new_basic(Vec3::X));
    let cube = scene.add_mesh(Mesh::new(cube_geometry, red));
    scene.get_node_mut(cube).unwrap().cast_shadow = true;

    let mut blue = Material::new_basic(Vec3::Z).with_opacity(0.5);
    blue.set_transparent(true);
    let plane = assets.add_geometry(create_plane(2.0, 2.0));
    let blue = assets.add_material(blue);
    let pane = scene.add_mesh(Mesh::new(plane, blue));
    scene.get_node_mut(pane).unwrap().transform.position = Vec3::new(0.0, 0.0, 1.0);

    renderer.render(&mut scene, &mut assets, camera)?;

    assert_eq!(renderer.shadow().renders(), 1);
    let center = pixel(renderer.backend_mut(), 16, 16)?;
    assert!(close(center, [128, 0, 128, 255]), "blended pixel {center:?}");
    assert_eq!(pixel(renderer.backend_mut(), 0, 0)?, [0, 0, 0, 255]);
    assert_eq!(renderer.backend().error_count(), 0);
    Ok(())
}

#[test]
fn lost_device_stops_rendering() -> anyhow::Result<()> {
    let Some(mut renderer) = renderer(8, RendererSettings::default())? else {
        return Ok(());
    };
    let (mut scene, mut assets, camera) = scene_with_camera();

    renderer.backend_mut().lose_context();

    assert!(renderer.is_context_lost());
    assert!(matches!(
        renderer.render(&mut scene, &mut assets, camera),
        Err(EngineError::ContextLost)
    ));

    let (device, queue) = pollster::block_on(WgpuBackend::request_device())?;
    renderer.backend_mut().restore(device, queue);
    assert_eq!(renderer.backend().context_generation(), 2);
    renderer.render(&mut scene, &mut assets, camera)?;
    Ok(())
}
