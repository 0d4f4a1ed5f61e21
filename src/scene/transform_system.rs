//! Transform System
//!
//! World matrix propagation, kept apart from [`Scene`] so that it only
//! borrows the node arena and the camera map.
//!
//! Two entry points:
//! - [`update_hierarchy_iterative`]: scene-wide, dirty driven. A node's world
//!   matrix is recomputed when its local matrix changed, when it was flagged
//!   `world_needs_update`, or when an ancestor's world matrix changed.
//! - [`update_world_matrix`]: per node, unconditional, optionally walking up
//!   to the root first and/or down through the subtree.
//!
//! [`Scene`]: crate::scene::Scene

use glam::Affine3A;
use slotmap::{SlotMap, SparseSecondaryMap};

use crate::scene::NodeHandle;
use crate::scene::camera::Camera;
use crate::scene::node::Node;

fn sync_camera(
    cameras: &mut SparseSecondaryMap<NodeHandle, Camera>,
    handle: NodeHandle,
    world: &Affine3A,
) {
    if let Some(camera) = cameras.get_mut(handle) {
        camera.update_view_projection(world);
    }
}

/// Updates every subtree reachable from `roots`, depth-first with an explicit
/// stack. Subtrees rooted at a node with `matrix_world_auto_update == false`
/// are skipped.
pub fn update_hierarchy_iterative(
    nodes: &mut SlotMap<NodeHandle, Node>,
    cameras: &mut SparseSecondaryMap<NodeHandle, Camera>,
    roots: &[NodeHandle],
) {
    // (node, parent world matrix, parent changed)
    let mut stack: Vec<(NodeHandle, Affine3A, bool)> = Vec::with_capacity(64);

    for &root_handle in roots.iter().rev() {
        stack.push((root_handle, Affine3A::IDENTITY, false));
    }

    while let Some((node_handle, parent_world, parent_changed)) = stack.pop() {
        let Some(node) = nodes.get_mut(node_handle) else {
            continue;
        };
        if !node.transform.matrix_world_auto_update {
            continue;
        }

        let local_changed = node.transform.update_local_matrix();
        let world_changed = local_changed || parent_changed || node.transform.world_needs_update;

        if world_changed {
            let new_world = parent_world * node.transform.local_matrix;
            node.transform.set_world_matrix(new_world);
            sync_camera(cameras, node_handle, &new_world);
        }

        let current_world = node.transform.world_matrix;
        for &child in node.children.iter().rev() {
            stack.push((child, current_world, world_changed));
        }
    }
}

/// Recomputes `handle`'s world matrix regardless of dirty state.
///
/// With `update_parents`, ancestors are refreshed root-first so the result
/// does not depend on earlier scene updates. With `update_children`, the
/// whole subtree is recomputed as well.
pub fn update_world_matrix(
    nodes: &mut SlotMap<NodeHandle, Node>,
    cameras: &mut SparseSecondaryMap<NodeHandle, Camera>,
    handle: NodeHandle,
    update_parents: bool,
    update_children: bool,
) {
    if !nodes.contains_key(handle) {
        return;
    }

    if update_parents {
        let mut chain = Vec::new();
        let mut cursor = nodes.get(handle).and_then(|n| n.parent);
        while let Some(h) = cursor {
            chain.push(h);
            cursor = nodes.get(h).and_then(|n| n.parent);
        }
        for &ancestor in chain.iter().rev() {
            refresh_node(nodes, cameras, ancestor);
        }
    }

    refresh_node(nodes, cameras, handle);

    if update_children {
        let mut stack: Vec<NodeHandle> = nodes
            .get(handle)
            .map(|n| n.children.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(h) = stack.pop() {
            refresh_node(nodes, cameras, h);
            if let Some(node) = nodes.get(h) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
    }
}

/// parent.world * local, reading the parent's cached world matrix.
fn refresh_node(
    nodes: &mut SlotMap<NodeHandle, Node>,
    cameras: &mut SparseSecondaryMap<NodeHandle, Camera>,
    handle: NodeHandle,
) {
    let parent_world = nodes
        .get(handle)
        .and_then(|n| n.parent)
        .and_then(|p| nodes.get(p))
        .map_or(Affine3A::IDENTITY, |p| p.transform.world_matrix);

    let Some(node) = nodes.get_mut(handle) else {
        return;
    };
    node.transform.refresh_local_matrix();
    let world = parent_world * node.transform.local_matrix;
    node.transform.set_world_matrix(world);

    // Children now hold a stale product.
    let children = node.children.clone();
    for child in children {
        if let Some(c) = nodes.get_mut(child) {
            c.transform.world_needs_update = true;
        }
    }
    sync_camera(cameras, handle, &world);
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn child_inherits_parent_translation() {
        let mut nodes: SlotMap<NodeHandle, Node> = SlotMap::with_key();
        let mut cameras: SparseSecondaryMap<NodeHandle, Camera> = SparseSecondaryMap::new();

        let mut parent = Node::default();
        parent.transform.position = Vec3::new(1.0, 0.0, 0.0);
        let parent_handle = nodes.insert(parent);

        let mut child = Node::default();
        child.transform.position = Vec3::new(0.0, 1.0, 0.0);
        child.parent = Some(parent_handle);
        let child_handle = nodes.insert(child);
        nodes[parent_handle].children.push(child_handle);

        update_hierarchy_iterative(&mut nodes, &mut cameras, &[parent_handle]);

        let p = nodes[child_handle].transform.world_matrix.translation;
        assert!((p.x - 1.0).abs() < 1e-5);
        assert!((p.y - 1.0).abs() < 1e-5);
        assert!(!nodes[child_handle].transform.world_needs_update());
    }
}
