//! GPU geometry cache.
//!
//! Keyed by geometry identity. A geometry is re-uploaded only when its
//! version moved past the one recorded at the last upload, and then only
//! the attributes (or index) whose own version changed. Validation results
//! are cached by the same version.

use log::debug;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::renderer::backend::{BufferId, BufferKind, RenderBackend, VertexBinding, VertexSemantic};
use crate::resources::Geometry;

#[derive(Debug, Clone)]
pub struct GpuGeometry {
    pub attributes: SmallVec<[VertexBinding; 4]>,
    pub index: Option<BufferId>,
    attribute_versions: SmallVec<[(u64, u64); 4]>,
    index_version: u64,
    version: u64,
}

impl GpuGeometry {
    #[must_use]
    pub fn has(&self, semantic: VertexSemantic) -> bool {
        self.attributes.iter().any(|a| a.semantic == semantic)
    }
}

/// Outcome of [`Geometry::validate`] at one version.
#[derive(Debug, Clone)]
struct Validation {
    version: u64,
    error: Option<String>,
}

#[derive(Debug, Default)]
pub struct GeometryCache {
    entries: FxHashMap<u64, GpuGeometry>,
    validations: FxHashMap<u64, Validation>,
    uploads: u64,
    checks: u64,
}

impl GeometryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks `geometry` once per version. `Err` carries the message of the
    /// first problem found.
    pub fn validate(&mut self, geometry: &Geometry) -> std::result::Result<(), &str> {
        let id = geometry.id();
        let stale = self
            .validations
            .get(&id)
            .is_none_or(|v| v.version != geometry.version());
        if stale {
            self.checks += 1;
            let error = geometry.validate().err().map(|e| e.to_string());
            self.validations.insert(
                id,
                Validation {
                    version: geometry.version(),
                    error,
                },
            );
        }
        match self.validations.get(&id).and_then(|v| v.error.as_deref()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Uploads whatever changed and returns the GPU view of `geometry`.
    pub fn update<B: RenderBackend>(&mut self, backend: &mut B, geometry: &Geometry) -> &GpuGeometry {
        let id = geometry.id();
        let fresh = self
            .entries
            .get(&id)
            .is_some_and(|gpu| gpu.version == geometry.version());
        if !fresh {
            let previous = self.entries.remove(&id);
            let gpu = self.upload(backend, geometry, previous);
            self.entries.insert(id, gpu);
        }
        &self.entries[&id]
    }

    fn upload<B: RenderBackend>(&mut self, backend: &mut B, geometry: &Geometry, previous: Option<GpuGeometry>) -> GpuGeometry {
        let mut attributes: SmallVec<[VertexBinding; 4]> = SmallVec::new();
        let mut attribute_versions: SmallVec<[(u64, u64); 4]> = SmallVec::new();

        let (mut old_attributes, mut old_versions, old_index, old_index_version) = match previous {
            Some(p) => (p.attributes, p.attribute_versions, p.index, p.index_version),
            None => (SmallVec::new(), SmallVec::new(), None, 0),
        };

        for (name, attribute) in geometry.attributes() {
            let Some(semantic) = VertexSemantic::from_name(name) else {
                continue;
            };
            let reused = old_attributes
                .iter()
                .position(|b| b.semantic == semantic)
                .map(|i| (old_attributes.remove(i), old_versions.remove(i)));

            let buffer = match reused {
                Some((binding, stamp)) if stamp == (attribute.id(), attribute.version()) => binding.buffer,
                Some((binding, _)) => {
                    backend.update_buffer(binding.buffer, attribute.as_bytes());
                    self.uploads += 1;
                    binding.buffer
                }
                None => {
                    self.uploads += 1;
                    backend.create_buffer(BufferKind::Vertex, attribute.as_bytes())
                }
            };
            attributes.push(VertexBinding {
                semantic,
                buffer,
                item_size: attribute.item_size,
            });
            attribute_versions.push((attribute.id(), attribute.version()));
        }

        // Attributes that disappeared from the geometry.
        for binding in old_attributes {
            backend.delete_buffer(binding.buffer);
        }

        let index = match (geometry.index(), old_index) {
            (Some(_), Some(buffer)) if old_index_version == geometry.index_version() => Some(buffer),
            (Some(data), Some(buffer)) => {
                backend.update_buffer(buffer, bytemuck::cast_slice(data));
                self.uploads += 1;
                Some(buffer)
            }
            (Some(data), None) => {
                self.uploads += 1;
                Some(backend.create_buffer(BufferKind::Index, bytemuck::cast_slice(data)))
            }
            (None, Some(buffer)) => {
                backend.delete_buffer(buffer);
                None
            }
            (None, None) => None,
        };

        debug!("Uploaded geometry {} (version {})", geometry.id(), geometry.version());
        GpuGeometry {
            attributes,
            index,
            attribute_versions,
            index_version: geometry.index_version(),
            version: geometry.version(),
        }
    }

    /// Releases the buffers of a disposed geometry.
    pub fn dispose<B: RenderBackend>(&mut self, backend: &mut B, geometry_id: u64) {
        self.validations.remove(&geometry_id);
        if let Some(gpu) = self.entries.remove(&geometry_id) {
            for binding in gpu.attributes {
                backend.delete_buffer(binding.buffer);
            }
            if let Some(index) = gpu.index {
                backend.delete_buffer(index);
            }
        }
    }

    /// Drops every entry without touching the backend; used after the
    /// context, and every buffer with it, was lost.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.validations.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffer uploads performed so far.
    #[must_use]
    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    /// Geometry validations actually run, cache hits excluded.
    #[must_use]
    pub fn validations(&self) -> u64 {
        self.checks
    }
}
