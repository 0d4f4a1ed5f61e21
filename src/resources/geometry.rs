//! Geometry Resource
//!
//! CPU-side vertex attributes, optional index data, sub-mesh groups and
//! bounding volumes. Every mutation bumps [`Geometry::version`]; the renderer
//! compares it with the version it last uploaded and re-uploads on mismatch.

use std::cell::Cell;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::{Affine3A, Vec3};
use rustc_hash::FxHashMap;

use crate::errors::{EngineError, Result};
use crate::resources::version_tracker::{ChangeTracker, MutGuard};

pub const ATTR_POSITION: &str = "position";
pub const ATTR_NORMAL: &str = "normal";
pub const ATTR_UV: &str = "uv";
pub const ATTR_COLOR: &str = "color";

static NEXT_GEOMETRY_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_ATTRIBUTE_ID: AtomicU64 = AtomicU64::new(1);

/// A tightly packed float attribute (`item_size` floats per vertex).
#[derive(Debug, Clone)]
pub struct Attribute {
    pub data: Vec<f32>,
    pub item_size: u32,
    id: u64,
    tracker: ChangeTracker,
}

impl Attribute {
    #[must_use]
    pub fn new(data: Vec<f32>, item_size: u32) -> Self {
        Self {
            data,
            item_size,
            id: NEXT_ATTRIBUTE_ID.fetch_add(1, Ordering::Relaxed),
            tracker: ChangeTracker::new(),
        }
    }

    #[must_use]
    pub fn from_vec3(values: &[Vec3]) -> Self {
        Self::new(values.iter().flat_map(|v| v.to_array()).collect(), 3)
    }

    /// Number of vertices; trailing partial items are ignored.
    #[inline]
    #[must_use]
    pub fn count(&self) -> u32 {
        if self.item_size == 0 {
            return 0;
        }
        (self.data.len() / self.item_size as usize) as u32
    }

    /// Identity of the buffer; replacing an attribute changes it.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.tracker.version()
    }

    #[must_use]
    pub fn get_vec3(&self, i: u32) -> Option<Vec3> {
        if self.item_size < 3 {
            return None;
        }
        let start = i as usize * self.item_size as usize;
        let s = self.data.get(start..start + 3)?;
        Some(Vec3::new(s[0], s[1], s[2]))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }
}

/// Sub-range of the index (or vertex) stream drawn with one material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryGroup {
    pub start: u32,
    pub count: u32,
    pub material_index: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.max.x < self.min.x || self.max.y < self.min.y || self.max.z < self.min.z
    }

    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[must_use]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn expand_by_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    #[must_use]
    pub fn transform(&self, matrix: &Affine3A) -> Self {
        let mut out = Self::empty();
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.expand_by_point(matrix.transform_point3(corner));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    /// World-space sphere: center transformed, radius scaled by the largest
    /// axis scale.
    #[must_use]
    pub fn transform(&self, matrix: &Affine3A) -> Self {
        let m = matrix.matrix3;
        let max_scale = m
            .x_axis
            .length_squared()
            .max(m.y_axis.length_squared())
            .max(m.z_axis.length_squared())
            .sqrt();
        Self {
            center: matrix.transform_point3(self.center),
            radius: self.radius * max_scale,
        }
    }
}

#[derive(Debug)]
pub struct Geometry {
    id: u64,
    pub name: String,

    tracker: ChangeTracker,
    attributes: FxHashMap<String, Attribute>,
    index: Option<Vec<u32>>,
    index_tracker: ChangeTracker,
    groups: Vec<GeometryGroup>,
    draw_range: Range<u32>,

    bounding_box: Cell<Option<BoundingBox>>,
    bounding_sphere: Cell<Option<BoundingSphere>>,
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new()
    }
}

impl Geometry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_GEOMETRY_ID.fetch_add(1, Ordering::Relaxed),
            name: String::new(),
            tracker: ChangeTracker::new(),
            attributes: FxHashMap::default(),
            index: None,
            index_tracker: ChangeTracker::new(),
            groups: Vec::new(),
            draw_range: 0..u32::MAX,
            bounding_box: Cell::new(None),
            bounding_sphere: Cell::new(None),
        }
    }

    /// Process-unique identity, stable for the lifetime of the resource.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.tracker.version()
    }

    fn changed(&mut self, bounds: bool) {
        self.tracker.changed();
        if bounds {
            self.bounding_box.set(None);
            self.bounding_sphere.set(None);
        }
    }

    // === Attributes ===

    pub fn set_attribute(&mut self, name: &str, attr: Attribute) {
        self.attributes.insert(name.to_string(), attr);
        self.changed(name == ATTR_POSITION);
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        let removed = self.attributes.remove(name);
        if removed.is_some() {
            self.changed(name == ATTR_POSITION);
        }
        removed
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Mutable access to an attribute; its version is bumped when the guard
    /// drops.
    pub fn attribute_mut(&mut self, name: &str) -> Option<MutGuard<'_, Vec<f32>>> {
        if !self.attributes.contains_key(name) {
            return None;
        }
        self.changed(name == ATTR_POSITION);
        let attr = self.attributes.get_mut(name)?;
        Some(MutGuard::new(&mut attr.data, &mut attr.tracker))
    }

    #[must_use]
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Attribute)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    // === Index ===

    pub fn set_index(&mut self, index: Vec<u32>) {
        self.index = Some(index);
        self.index_tracker.changed();
        self.changed(false);
    }

    pub fn clear_index(&mut self) {
        if self.index.take().is_some() {
            self.index_tracker.changed();
            self.changed(false);
        }
    }

    #[must_use]
    pub fn index(&self) -> Option<&[u32]> {
        self.index.as_deref()
    }

    #[must_use]
    pub fn index_version(&self) -> u64 {
        self.index_tracker.version()
    }

    // === Groups & Draw Range ===

    pub fn add_group(&mut self, start: u32, count: u32, material_index: usize) {
        self.groups.push(GeometryGroup {
            start,
            count,
            material_index,
        });
        self.changed(false);
    }

    pub fn clear_groups(&mut self) {
        self.groups.clear();
        self.changed(false);
    }

    #[must_use]
    pub fn groups(&self) -> &[GeometryGroup] {
        &self.groups
    }

    pub fn set_draw_range(&mut self, start: u32, count: u32) {
        self.draw_range = start..start.saturating_add(count);
        self.changed(false);
    }

    #[must_use]
    pub fn draw_range(&self) -> Range<u32> {
        self.draw_range.clone()
    }

    /// Number of elements drawable: indices when indexed, else vertices.
    #[must_use]
    pub fn element_count(&self) -> u32 {
        match &self.index {
            Some(index) => index.len() as u32,
            None => self
                .attributes
                .get(ATTR_POSITION)
                .map_or(0, Attribute::count),
        }
    }

    /// Element range actually submitted for `group`, clipped by the draw
    /// range and the element count.
    #[must_use]
    pub fn resolve_range(&self, group: Option<&GeometryGroup>) -> Range<u32> {
        let total = self.element_count();
        let mut start = self.draw_range.start;
        let mut end = self.draw_range.end.min(total);
        if let Some(g) = group {
            start = start.max(g.start);
            end = end.min(g.start.saturating_add(g.count));
        }
        if start >= end {
            return 0..0;
        }
        start..end
    }

    // === Validation ===

    /// Checks attribute sizes and index bounds.
    pub fn validate(&self) -> Result<()> {
        let position = self.attributes.get(ATTR_POSITION).ok_or_else(|| {
            EngineError::InvalidGeometry(format!("geometry {} has no position attribute", self.id))
        })?;
        if position.item_size != 3 || position.data.len() % 3 != 0 {
            return Err(EngineError::InvalidGeometry(format!(
                "geometry {} position attribute is not a packed vec3",
                self.id
            )));
        }
        let count = position.count();
        for (name, attr) in &self.attributes {
            if attr.item_size == 0 || attr.count() != count {
                return Err(EngineError::InvalidGeometry(format!(
                    "geometry {} attribute '{name}' has {} items, expected {count}",
                    self.id,
                    attr.count()
                )));
            }
        }
        if let Some(index) = &self.index
            && let Some(&bad) = index.iter().find(|&&i| i >= count)
        {
            return Err(EngineError::InvalidGeometry(format!(
                "geometry {} index {bad} out of range ({count} vertices)",
                self.id
            )));
        }
        Ok(())
    }

    // === Bounding Volumes ===

    /// Bounding box of the position attribute, cached until positions change.
    #[must_use]
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        if let Some(bb) = self.bounding_box.get() {
            return Some(bb);
        }
        let position = self.attributes.get(ATTR_POSITION)?;
        let mut bb = BoundingBox::empty();
        for i in 0..position.count() {
            if let Some(p) = position.get_vec3(i) {
                bb.expand_by_point(p);
            }
        }
        if bb.is_empty() {
            return None;
        }
        self.bounding_box.set(Some(bb));
        Some(bb)
    }

    /// Sphere centred on the bounding box centre, enclosing every position.
    #[must_use]
    pub fn bounding_sphere(&self) -> Option<BoundingSphere> {
        if let Some(bs) = self.bounding_sphere.get() {
            return Some(bs);
        }
        let bb = self.bounding_box()?;
        let center = bb.center();
        let position = self.attributes.get(ATTR_POSITION)?;
        let mut max_sq = 0.0_f32;
        for i in 0..position.count() {
            if let Some(p) = position.get_vec3(i) {
                max_sq = max_sq.max(center.distance_squared(p));
            }
        }
        let bs = BoundingSphere {
            center,
            radius: max_sq.sqrt(),
        };
        self.bounding_sphere.set(Some(bs));
        Some(bs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Geometry {
        let mut g = Geometry::new();
        g.set_attribute(
            ATTR_POSITION,
            Attribute::new(vec![0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0, 0.0], 3),
        );
        g
    }

    #[test]
    fn mutation_through_guard_bumps_versions() {
        let mut g = triangle();
        let v0 = g.version();
        let a0 = g.attribute(ATTR_POSITION).map(Attribute::version);
        {
            let mut data = g.attribute_mut(ATTR_POSITION).unwrap();
            data[0] = -2.0;
        }
        assert!(g.version() > v0);
        assert!(g.attribute(ATTR_POSITION).map(Attribute::version) > a0);
        assert_eq!(g.bounding_box().unwrap().min.x, -2.0);
    }

    #[test]
    fn resolve_range_clips_group_and_draw_range() {
        let mut g = triangle();
        g.set_index(vec![0, 1, 2, 0, 2, 1]);
        g.set_draw_range(1, 4);

        let group = GeometryGroup {
            start: 3,
            count: 3,
            material_index: 0,
        };
        assert_eq!(g.resolve_range(None), 1..5);
        assert_eq!(g.resolve_range(Some(&group)), 3..5);
    }
}
