//! Scene Graph
//!
//! - [`Node`]: hierarchy links, transform and render flags
//! - [`Transform`]: TRS with lazily derived local/world matrices
//! - [`Scene`]: node arena, component maps, traversal
//! - [`Camera`] / [`Light`] / [`Mesh`]: node components
//! - [`transform_system`]: world matrix propagation, decoupled from `Scene`

pub mod camera;
pub mod light;
pub mod mesh;
pub mod node;
#[allow(clippy::module_inception)]
pub mod scene;
pub mod transform;
pub mod transform_system;

pub use camera::{Camera, Frustum, Projection};
pub use light::{Light, LightKind, LightShadow, ShadowState};
pub use mesh::{DrawMode, Mesh};
pub use node::Node;
pub use scene::Scene;
pub use transform::Transform;

use slotmap::new_key_type;

new_key_type! {
    pub struct NodeHandle;
}

/// Closed set of node kinds. Renderer logic switches on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Group,
    Mesh,
    Light,
    Camera,
    Bone,
}

/// 32-bit layer mask. A camera renders a node when their masks intersect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layers(pub u32);

impl Layers {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(u32::MAX);

    /// Only the given layer. Layers past 31 wrap modulo 32 in release
    /// builds and panic in debug builds.
    #[must_use]
    pub fn only(layer: u32) -> Self {
        Self(Self::bit(layer))
    }

    pub fn enable(&mut self, layer: u32) {
        self.0 |= Self::bit(layer);
    }

    pub fn disable(&mut self, layer: u32) {
        self.0 &= !Self::bit(layer);
    }

    #[inline]
    fn bit(layer: u32) -> u32 {
        debug_assert!(layer < 32, "layer {layer} out of range 0..32");
        1 << (layer & 31)
    }

    #[inline]
    #[must_use]
    pub fn test(self, other: Layers) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for Layers {
    fn default() -> Self {
        Self(1)
    }
}
