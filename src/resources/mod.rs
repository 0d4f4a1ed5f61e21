//! CPU-side Resources
//!
//! - [`Geometry`]: vertex attributes, index, groups, bounds
//! - [`Material`]: shading parameters and pipeline state
//! - [`Texture`]: RGBA8 image with sampler and color space
//! - [`Assets`]: handle-based storage with explicit disposal
//!
//! Resources are not reference counted. A geometry, material or texture
//! lives until [`Assets`] is asked to dispose it; the disposal is queued so
//! the renderer can release the matching GPU objects on its next frame.

pub mod geometry;
pub mod material;
pub mod primitives;
pub mod shader_defines;
pub mod texture;
pub mod version_tracker;

pub use geometry::{Attribute, BoundingBox, BoundingSphere, Geometry, GeometryGroup};
pub use material::{Blending, Material, MaterialKind, RenderState, Side};
pub use shader_defines::ShaderDefines;
pub use texture::{ColorSpace, Texture, TextureSampler};

use log::debug;
use slotmap::{SlotMap, new_key_type};

new_key_type! {
    pub struct GeometryHandle;
    pub struct MaterialHandle;
    pub struct TextureHandle;
}

/// A disposed resource whose GPU counterpart must be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    Geometry(u64),
    Material(u64),
    Texture(u64),
}

#[derive(Debug, Default)]
pub struct Assets {
    pub geometries: SlotMap<GeometryHandle, Geometry>,
    pub materials: SlotMap<MaterialHandle, Material>,
    pub textures: SlotMap<TextureHandle, Texture>,
    disposals: Vec<Disposal>,
}

impl Assets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_geometry(&mut self, geometry: Geometry) -> GeometryHandle {
        self.geometries.insert(geometry)
    }

    pub fn add_material(&mut self, material: Material) -> MaterialHandle {
        self.materials.insert(material)
    }

    pub fn add_texture(&mut self, texture: Texture) -> TextureHandle {
        self.textures.insert(texture)
    }

    pub fn dispose_geometry(&mut self, handle: GeometryHandle) -> Option<Geometry> {
        let geometry = self.geometries.remove(handle)?;
        debug!("Disposing geometry {}", geometry.id());
        self.disposals.push(Disposal::Geometry(geometry.id()));
        Some(geometry)
    }

    pub fn dispose_material(&mut self, handle: MaterialHandle) -> Option<Material> {
        let material = self.materials.remove(handle)?;
        debug!("Disposing material {}", material.id());
        self.disposals.push(Disposal::Material(material.id()));
        Some(material)
    }

    pub fn dispose_texture(&mut self, handle: TextureHandle) -> Option<Texture> {
        let texture = self.textures.remove(handle)?;
        debug!("Disposing texture {}", texture.id());
        self.disposals.push(Disposal::Texture(texture.id()));
        Some(texture)
    }

    /// Takes the queued disposals, oldest first.
    pub fn drain_disposals(&mut self) -> std::vec::Drain<'_, Disposal> {
        self.disposals.drain(..)
    }

    #[must_use]
    pub fn pending_disposals(&self) -> usize {
        self.disposals.len()
    }
}
