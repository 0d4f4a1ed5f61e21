//! Readback Tests
//!
//! Tests for:
//! - Async pixel reads resolving once the fence signals
//! - Poll budget surfacing as a timeout
//! - Context loss and invalid rectangles

use glam::Vec3;
use myth_forward::errors::EngineError;
use myth_forward::renderer::backend::{RenderBackend, Viewport};
use myth_forward::renderer::readback::read_pixels_async;
use myth_forward::resources::{Assets, ColorSpace};
use myth_forward::scene::{Camera, Scene};
use myth_forward::{Renderer, RendererSettings, SoftwareBackend};

fn cleared_renderer(color: Vec3) -> anyhow::Result<Renderer<SoftwareBackend>> {
    let settings = RendererSettings {
        width: 4,
        height: 4,
        output_color_space: ColorSpace::LinearSrgb,
        ..RendererSettings::default()
    };
    let mut renderer = Renderer::new(SoftwareBackend::new(4, 4)?, settings)?;
    renderer.set_clear_color(color, 1.0);
    renderer.clear(true, true, true)?;
    Ok(renderer)
}

#[test]
fn reads_resolve_after_fence_latency() -> anyhow::Result<()> {
    let mut renderer = cleared_renderer(Vec3::new(1.0, 0.0, 0.0))?;
    renderer.backend_mut().fence_latency = 3;

    let pixels = pollster::block_on(renderer.read_render_target_pixels_async(None, Viewport::new(1, 1, 2, 2)))?;

    assert_eq!(pixels.len(), 2 * 2 * 4);
    assert!(pixels.chunks(4).all(|p| p == [255, 0, 0, 255]));
    Ok(())
}

#[test]
fn stuck_fence_times_out() -> anyhow::Result<()> {
    let mut renderer = cleared_renderer(Vec3::ZERO)?;
    renderer.backend_mut().fence_latency = u32::MAX;
    renderer.settings_mut().max_fence_polls = 5;

    let result = pollster::block_on(renderer.read_render_target_pixels_async(None, Viewport::new(0, 0, 1, 1)));

    assert!(matches!(result, Err(EngineError::ReadbackTimeout(5))));
    Ok(())
}

#[test]
fn lost_context_fails_the_read() -> anyhow::Result<()> {
    let mut backend = SoftwareBackend::new(4, 4)?;
    backend.fence_latency = 2;
    backend.lose_context();

    let result = pollster::block_on(read_pixels_async(&mut backend, None, Viewport::new(0, 0, 1, 1), 10));
    assert!(matches!(result, Err(EngineError::ContextLost)));
    assert!(backend.is_context_lost());
    Ok(())
}

#[test]
fn rectangle_outside_the_buffer_is_rejected() -> anyhow::Result<()> {
    let mut renderer = cleared_renderer(Vec3::ZERO)?;

    let result = pollster::block_on(renderer.read_render_target_pixels_async(None, Viewport::new(2, 2, 4, 4)));

    assert!(matches!(result, Err(EngineError::InvalidParameter { .. })));
    Ok(())
}

#[test]
fn unrendered_target_is_not_found() -> anyhow::Result<()> {
    let mut renderer = cleared_renderer(Vec3::ZERO)?;
    let target = renderer.create_render_target(myth_forward::renderer::RenderTargetDescriptor {
        width: 2,
        height: 2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        depth: false,
        stencil: false,
        samples: 1,
        sampler: myth_forward::resources::TextureSampler::default(),
    });

    let result = pollster::block_on(renderer.read_render_target_pixels_async(Some(target), Viewport::new(0, 0, 1, 1)));
    assert!(matches!(result, Err(EngineError::ResourceNotFound(_))));

    // Rendering into it creates the backend target.
    let mut scene = Scene::new();
    let camera = scene.add_camera(Camera::new_perspective(50.0, 1.0, 0.1, 10.0));
    renderer.set_render_target(Some(target));
    renderer.render(&mut scene, &mut Assets::new(), camera)?;
    let pixels = pollster::block_on(renderer.read_render_target_pixels_async(Some(target), Viewport::new(0, 0, 2, 2)))?;
    assert_eq!(pixels, [0, 0, 0, 255].repeat(4));
    Ok(())
}
