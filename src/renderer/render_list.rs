//! Render List Builder
//!
//! One traversal per frame turns the scene into three sorted buckets:
//!
//! | bucket        | routed when          | order                                      |
//! |---------------|----------------------|--------------------------------------------|
//! | opaque        | otherwise            | group order, render order, material, near→far |
//! | transmissive  | `transmission > 0`   | group order, render order, far→near         |
//! | transparent   | `transparent`        | group order, render order, far→near         |
//!
//! All sorts are stable, so entries that compare equal keep traversal order.

use std::cmp::Ordering;

use glam::Vec3;
use log::warn;

use crate::resources::{Assets, GeometryGroup, GeometryHandle, MaterialHandle};
use crate::scene::{Camera, DrawMode, Frustum, Layers, NodeHandle, NodeKind, Scene};

#[derive(Debug, Clone, PartialEq)]
pub struct RenderItem {
    pub id: u32,
    pub node: NodeHandle,
    pub geometry: GeometryHandle,
    pub material: MaterialHandle,
    pub material_id: u64,
    pub group: Option<GeometryGroup>,
    pub draw_mode: DrawMode,
    /// `render_order` of the nearest enclosing group that sets one.
    pub group_order: i32,
    pub render_order: i32,
    /// Distance in front of the camera, along the view axis.
    pub z: f32,
}

pub type SortFn = Box<dyn Fn(&RenderItem, &RenderItem) -> Ordering>;

#[must_use]
pub fn painter_sort_stable(a: &RenderItem, b: &RenderItem) -> Ordering {
    a.group_order
        .cmp(&b.group_order)
        .then(a.render_order.cmp(&b.render_order))
        .then(a.material_id.cmp(&b.material_id))
        .then(a.z.total_cmp(&b.z))
}

#[must_use]
pub fn reverse_painter_sort_stable(a: &RenderItem, b: &RenderItem) -> Ordering {
    a.group_order
        .cmp(&b.group_order)
        .then(a.render_order.cmp(&b.render_order))
        .then(b.z.total_cmp(&a.z))
}

pub struct RenderList {
    /// Sort after building; off keeps traversal order.
    pub sort_objects: bool,
    pub opaque: Vec<RenderItem>,
    pub transmissive: Vec<RenderItem>,
    pub transparent: Vec<RenderItem>,
    opaque_sort: Option<SortFn>,
    transparent_sort: Option<SortFn>,
    next_id: u32,
}

impl Default for RenderList {
    fn default() -> Self {
        Self {
            sort_objects: true,
            opaque: Vec::new(),
            transmissive: Vec::new(),
            transparent: Vec::new(),
            opaque_sort: None,
            transparent_sort: None,
            next_id: 0,
        }
    }
}

impl RenderList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.opaque.clear();
        self.transmissive.clear();
        self.transparent.clear();
        self.next_id = 0;
    }

    /// Replaces the opaque comparator; `None` restores the default.
    pub fn set_opaque_sort(&mut self, sort: Option<SortFn>) {
        self.opaque_sort = sort;
    }

    /// Replaces the comparator of the transmissive and transparent buckets.
    pub fn set_transparent_sort(&mut self, sort: Option<SortFn>) {
        self.transparent_sort = sort;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.opaque.len() + self.transmissive.len() + self.transparent.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuilds the buckets for `camera`. World matrices must be current.
    pub fn build(&mut self, scene: &Scene, assets: &Assets, camera: &Camera, camera_layers: Layers) {
        self.clear();

        let frustum = camera.frustum();
        let view = *camera.view_matrix();

        // (node, inherited group order)
        let mut stack: Vec<(NodeHandle, i32)> = scene.roots().iter().rev().map(|&h| (h, 0)).collect();

        while let Some((handle, group_order)) = stack.pop() {
            let Some(node) = scene.get_node(handle) else {
                continue;
            };
            if !node.visible {
                continue;
            }

            let child_group_order = if node.kind() == NodeKind::Group && node.render_order != 0 {
                node.render_order
            } else {
                group_order
            };
            for &child in node.children().iter().rev() {
                stack.push((child, child_group_order));
            }

            if !node.layers.test(camera_layers) {
                continue;
            }
            let Some(mesh) = scene.mesh(handle) else {
                continue;
            };
            let Some(geometry) = assets.geometries.get(mesh.geometry) else {
                warn!("Geometry {:?} missing for node '{}'", mesh.geometry, node.name);
                continue;
            };

            let world = node.world_matrix();
            let sphere = geometry.bounding_sphere().map(|s| s.transform(world));
            if (node.frustum_culled || mesh.draw_mode == DrawMode::Sprite)
                && let Some(s) = sphere
                && !frustum.intersects_sphere(s.center, s.radius)
            {
                continue;
            }

            let center = sphere.map_or_else(|| Vec3::from(world.translation), |s| s.center);
            let z = -view.transform_point3(center).z;

            if mesh.is_multi_material() {
                for group in geometry.groups() {
                    let Some(&material) = mesh.materials.get(group.material_index) else {
                        continue;
                    };
                    self.push(assets, handle, node.render_order, group_order, mesh.geometry, material, Some(*group), mesh.draw_mode, z);
                }
            } else if let Some(&material) = mesh.materials.first() {
                self.push(assets, handle, node.render_order, group_order, mesh.geometry, material, None, mesh.draw_mode, z);
            }
        }

        if self.sort_objects {
            self.sort();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        assets: &Assets,
        node: NodeHandle,
        render_order: i32,
        group_order: i32,
        geometry: GeometryHandle,
        material: MaterialHandle,
        group: Option<GeometryGroup>,
        draw_mode: DrawMode,
        z: f32,
    ) {
        let Some(mat) = assets.materials.get(material) else {
            warn!("Material {material:?} missing");
            return;
        };
        if !mat.visible {
            return;
        }

        let item = RenderItem {
            id: self.next_id,
            node,
            geometry,
            material,
            material_id: mat.id(),
            group,
            draw_mode,
            group_order,
            render_order,
            z,
        };
        self.next_id += 1;

        if mat.transmission() > 0.0 {
            self.transmissive.push(item);
        } else if mat.transparent() {
            self.transparent.push(item);
        } else {
            self.opaque.push(item);
        }
    }

    /// Stable sorts with the configured comparators.
    pub fn sort(&mut self) {
        match &self.opaque_sort {
            Some(f) => self.opaque.sort_by(|a, b| f(a, b)),
            None => self.opaque.sort_by(painter_sort_stable),
        }
        match &self.transparent_sort {
            Some(f) => {
                self.transmissive.sort_by(|a, b| f(a, b));
                self.transparent.sort_by(|a, b| f(a, b));
            }
            None => {
                self.transmissive.sort_by(reverse_painter_sort_stable);
                self.transparent.sort_by(reverse_painter_sort_stable);
            }
        }
    }
}

/// Shadow casters visible to a light frustum, in traversal order.
pub fn collect_shadow_casters(scene: &Scene, assets: &Assets, frustum: &Frustum, out: &mut Vec<RenderItem>) {
    out.clear();
    let mut id = 0;
    scene.traverse_all_visible(|handle, node| {
        if !node.cast_shadow {
            return;
        }
        let Some(mesh) = scene.mesh(handle) else {
            return;
        };
        let Some(geometry) = assets.geometries.get(mesh.geometry) else {
            return;
        };
        if node.frustum_culled
            && let Some(s) = geometry.bounding_sphere().map(|s| s.transform(node.world_matrix()))
            && !frustum.intersects_sphere(s.center, s.radius)
        {
            return;
        }

        let mut emit = |material: MaterialHandle, group: Option<GeometryGroup>| {
            let Some(mat) = assets.materials.get(material) else {
                return;
            };
            if !mat.visible {
                return;
            }
            out.push(RenderItem {
                id,
                node: handle,
                geometry: mesh.geometry,
                material,
                material_id: mat.id(),
                group,
                draw_mode: mesh.draw_mode,
                group_order: 0,
                render_order: node.render_order,
                z: 0.0,
            });
            id += 1;
        };

        if mesh.is_multi_material() {
            for group in geometry.groups() {
                if let Some(&material) = mesh.materials.get(group.material_index) {
                    emit(material, Some(*group));
                }
            }
        } else if let Some(&material) = mesh.materials.first() {
            emit(material, None);
        }
    });
}
