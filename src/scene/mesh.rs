use smallvec::{SmallVec, smallvec};

use crate::errors::{EngineError, Result};
use crate::resources::{GeometryHandle, MaterialHandle};

/// Primitive assembly used for a renderable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DrawMode {
    #[default]
    Triangles,
    Lines,
    LineStrip,
    Points,
    /// Camera-facing quad per vertex.
    Sprite,
}

/// Renderable component: one geometry and one or more materials.
///
/// With several materials, each geometry group selects its material through
/// `material_index`. The mesh only references its resources; several meshes
/// may share one geometry.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub geometry: GeometryHandle,
    pub materials: SmallVec<[MaterialHandle; 1]>,
    pub draw_mode: DrawMode,
}

impl Mesh {
    #[must_use]
    pub fn new(geometry: GeometryHandle, material: MaterialHandle) -> Self {
        Self {
            geometry,
            materials: smallvec![material],
            draw_mode: DrawMode::Triangles,
        }
    }

    #[must_use]
    pub fn with_materials(geometry: GeometryHandle, materials: &[MaterialHandle]) -> Self {
        Self {
            geometry,
            materials: SmallVec::from_slice(materials),
            draw_mode: DrawMode::Triangles,
        }
    }

    #[must_use]
    pub fn with_draw_mode(mut self, draw_mode: DrawMode) -> Self {
        self.draw_mode = draw_mode;
        self
    }

    /// Material for a geometry group's `material_index`.
    pub fn material(&self, index: usize) -> Result<MaterialHandle> {
        self.materials
            .get(index)
            .copied()
            .ok_or_else(|| EngineError::InvalidParameter {
                context: format!("mesh material slot ({} slots)", self.materials.len()),
                index,
            })
    }

    #[must_use]
    pub fn is_multi_material(&self) -> bool {
        self.materials.len() > 1
    }
}
