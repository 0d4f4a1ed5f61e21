//! Render Hooks
//!
//! Per-draw callbacks invoked by the renderer around every submission. A
//! single [`RenderHooks`] implementation is installed with
//! [`Renderer::set_hooks`]; every method has an empty default so an
//! implementation only overrides what it needs.
//!
//! Hooks observe the frame; they receive shared references and cannot
//! mutate the scene while it is being drawn.
//!
//! [`Renderer::set_hooks`]: crate::renderer::Renderer::set_hooks

use crate::resources::{Geometry, GeometryGroup, Material};
use crate::scene::{Camera, NodeHandle, Scene};

/// Which pass a draw belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPass {
    /// Shadow map of a light; the camera is the light's shadow camera.
    Shadow,
    /// Opaque objects drawn into the transmission target.
    Transmission,
    Main,
}

pub struct RenderHookContext<'a> {
    pub scene: &'a Scene,
    pub camera: &'a Camera,
    pub node: NodeHandle,
    pub geometry: &'a Geometry,
    /// The material actually used, which is the override in shadow passes.
    pub material: &'a Material,
    pub group: Option<GeometryGroup>,
    pub pass: RenderPass,
}

pub trait RenderHooks {
    /// Before a renderable is drawn in the transmission or main pass.
    #[allow(unused_variables)]
    fn on_before_render(&mut self, ctx: &RenderHookContext<'_>) {}

    #[allow(unused_variables)]
    fn on_after_render(&mut self, ctx: &RenderHookContext<'_>) {}

    /// Before a shadow caster is drawn into a shadow map.
    #[allow(unused_variables)]
    fn on_before_shadow(&mut self, ctx: &RenderHookContext<'_>) {}

    #[allow(unused_variables)]
    fn on_after_shadow(&mut self, ctx: &RenderHookContext<'_>) {}
}
