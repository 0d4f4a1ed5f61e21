use std::borrow::Cow;

use glam::{Affine3A, Vec3};
use log::warn;
use slotmap::{SlotMap, SparseSecondaryMap};

use crate::errors::{EngineError, Result};
use crate::scene::camera::Camera;
use crate::scene::light::Light;
use crate::scene::mesh::Mesh;
use crate::scene::node::Node;
use crate::scene::{NodeHandle, NodeKind, transform_system};

/// Scene container.
///
/// Nodes live in a [`SlotMap`] arena and reference each other by handle;
/// kind-specific data lives in sparse component maps keyed by the owning
/// node. A node is either a root or the child of exactly one parent.
pub struct Scene {
    pub(crate) nodes: SlotMap<NodeHandle, Node>,
    pub(crate) root_nodes: Vec<NodeHandle>,

    pub(crate) meshes: SparseSecondaryMap<NodeHandle, Mesh>,
    pub(crate) cameras: SparseSecondaryMap<NodeHandle, Camera>,
    pub(crate) lights: SparseSecondaryMap<NodeHandle, Light>,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            root_nodes: Vec::new(),
            meshes: SparseSecondaryMap::new(),
            cameras: SparseSecondaryMap::new(),
            lights: SparseSecondaryMap::new(),
        }
    }

    // ========================================================================
    // Node creation
    // ========================================================================

    /// Inserts a node at root level.
    pub fn add_node(&mut self, node: Node) -> NodeHandle {
        let handle = self.nodes.insert(node);
        self.root_nodes.push(handle);
        handle
    }

    pub fn add_group(&mut self, name: &str) -> NodeHandle {
        let mut node = Node::new(NodeKind::Group);
        node.name = Cow::Owned(name.to_string());
        self.add_node(node)
    }

    pub fn add_bone(&mut self, name: &str) -> NodeHandle {
        let mut node = Node::new(NodeKind::Bone);
        node.name = Cow::Owned(name.to_string());
        self.add_node(node)
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> NodeHandle {
        let handle = self.add_node(Node::new(NodeKind::Mesh));
        self.meshes.insert(handle, mesh);
        handle
    }

    pub fn add_camera(&mut self, camera: Camera) -> NodeHandle {
        let handle = self.add_node(Node::new(NodeKind::Camera));
        self.cameras.insert(handle, camera);
        handle
    }

    pub fn add_light(&mut self, light: Light) -> NodeHandle {
        let handle = self.add_node(Node::new(NodeKind::Light));
        self.lights.insert(handle, light);
        handle
    }

    // ========================================================================
    // Hierarchy
    // ========================================================================

    /// Makes `child` a child of `parent`.
    ///
    /// The child is detached from its previous parent first, so it is never
    /// listed twice; adding an existing child again moves it to the end of
    /// the child list. The child's subtree is flagged for a world update.
    /// Invalid requests are logged and leave the graph untouched.
    pub fn add(&mut self, parent: NodeHandle, child: NodeHandle) -> Result<()> {
        if parent == child {
            warn!("Cannot add a node as a child of itself");
            return Err(EngineError::AttachToSelf);
        }
        if !self.nodes.contains_key(parent) || !self.nodes.contains_key(child) {
            warn!("Scene::add called with a handle that is not a scene node");
            return Err(EngineError::NodeNotFound(format!("{parent:?} / {child:?}")));
        }
        if self.is_ancestor(child, parent) {
            warn!("Cannot add a node under its own descendant");
            return Err(EngineError::AttachToDescendant);
        }

        self.detach(child);

        self.nodes[parent].children.push(child);
        let node = &mut self.nodes[child];
        node.parent = Some(parent);
        node.transform.world_needs_update = true;
        Ok(())
    }

    /// Like [`Self::add`], but keeps the child's current world transform.
    pub fn attach(&mut self, parent: NodeHandle, child: NodeHandle) -> Result<()> {
        self.update_world_matrix(parent, true, false);
        self.update_world_matrix(child, true, false);

        let parent_world = self.nodes.get(parent).map(|n| n.transform.world_matrix);
        let child_world = self.nodes.get(child).map(|n| n.transform.world_matrix);

        self.add(parent, child)?;

        if let (Some(pw), Some(cw)) = (parent_world, child_world) {
            self.nodes[child].transform.apply_local_matrix(pw.inverse() * cw);
        }
        Ok(())
    }

    /// Detaches `child` from its parent, making it a root.
    pub fn remove(&mut self, child: NodeHandle) -> Result<()> {
        if !self.nodes.contains_key(child) {
            return Err(EngineError::NodeNotFound(format!("{child:?}")));
        }
        if self.nodes[child].parent.is_some() {
            self.detach(child);
            self.root_nodes.push(child);
            self.nodes[child].transform.world_needs_update = true;
        }
        Ok(())
    }

    /// Deletes a node, its whole subtree and their components.
    pub fn remove_node(&mut self, handle: NodeHandle) {
        if !self.nodes.contains_key(handle) {
            return;
        }
        self.detach(handle);

        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            if let Some(node) = self.nodes.remove(h) {
                stack.extend(node.children);
            }
            self.meshes.remove(h);
            self.cameras.remove(h);
            self.lights.remove(h);
        }
    }

    /// Unlinks `child` from its parent's child list (or from the roots).
    fn detach(&mut self, child: NodeHandle) {
        let old_parent = self.nodes.get(child).and_then(|n| n.parent);
        if let Some(p) = old_parent {
            if let Some(n) = self.nodes.get_mut(p)
                && let Some(i) = n.children.iter().position(|&x| x == child)
            {
                n.children.remove(i);
            }
        } else if let Some(i) = self.root_nodes.iter().position(|&x| x == child) {
            self.root_nodes.remove(i);
        }
        if let Some(n) = self.nodes.get_mut(child) {
            n.parent = None;
        }
    }

    /// Whether `ancestor` appears on the parent chain of `node`.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: NodeHandle, node: NodeHandle) -> bool {
        let mut cursor = self.nodes.get(node).and_then(|n| n.parent);
        while let Some(h) = cursor {
            if h == ancestor {
                return true;
            }
            cursor = self.nodes.get(h).and_then(|n| n.parent);
        }
        false
    }

    // ========================================================================
    // Access
    // ========================================================================

    #[must_use]
    pub fn get_node(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(handle)
    }

    pub fn get_node_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.nodes.get_mut(handle)
    }

    #[must_use]
    pub fn roots(&self) -> &[NodeHandle] {
        &self.root_nodes
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn mesh(&self, handle: NodeHandle) -> Option<&Mesh> {
        self.meshes.get(handle)
    }

    pub fn mesh_mut(&mut self, handle: NodeHandle) -> Option<&mut Mesh> {
        self.meshes.get_mut(handle)
    }

    #[must_use]
    pub fn camera(&self, handle: NodeHandle) -> Option<&Camera> {
        self.cameras.get(handle)
    }

    pub fn camera_mut(&mut self, handle: NodeHandle) -> Option<&mut Camera> {
        self.cameras.get_mut(handle)
    }

    #[must_use]
    pub fn light(&self, handle: NodeHandle) -> Option<&Light> {
        self.lights.get(handle)
    }

    pub fn light_mut(&mut self, handle: NodeHandle) -> Option<&mut Light> {
        self.lights.get_mut(handle)
    }

    /// First node with the given name, in pre-order.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<NodeHandle> {
        let mut found = None;
        for &root in &self.root_nodes {
            self.traverse(root, |h, n| {
                if found.is_none() && n.name == name {
                    found = Some(h);
                }
            });
            if found.is_some() {
                break;
            }
        }
        found
    }

    // ========================================================================
    // Transforms
    // ========================================================================

    /// Updates world matrices of every dirty subtree.
    pub fn update_matrix_world(&mut self) {
        transform_system::update_hierarchy_iterative(&mut self.nodes, &mut self.cameras, &self.root_nodes);
    }

    /// Recomputes one node's world matrix; see
    /// [`transform_system::update_world_matrix`].
    pub fn update_world_matrix(&mut self, handle: NodeHandle, update_parents: bool, update_children: bool) {
        transform_system::update_world_matrix(
            &mut self.nodes,
            &mut self.cameras,
            handle,
            update_parents,
            update_children,
        );
    }

    #[must_use]
    pub fn world_matrix(&self, handle: NodeHandle) -> Option<&Affine3A> {
        self.nodes.get(handle).map(|n| &n.transform.world_matrix)
    }

    /// World position after refreshing the ancestor chain.
    pub fn get_world_position(&mut self, handle: NodeHandle) -> Option<Vec3> {
        self.update_world_matrix(handle, true, false);
        self.nodes.get(handle).map(|n| n.transform.world_matrix.translation.into())
    }

    /// Rotates a node so its -Z axis points at a world-space `target`.
    pub fn look_at(&mut self, handle: NodeHandle, target: Vec3) {
        self.update_world_matrix(handle, true, false);
        let parent_world = self
            .nodes
            .get(handle)
            .and_then(|n| n.parent)
            .and_then(|p| self.nodes.get(p))
            .map_or(Affine3A::IDENTITY, |p| p.transform.world_matrix);
        let local_target = parent_world.inverse().transform_point3(target);
        if let Some(node) = self.nodes.get_mut(handle) {
            node.transform.look_at(local_target, Vec3::Y);
        }
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Pre-order visit of `root` and all its descendants.
    pub fn traverse(&self, root: NodeHandle, mut visitor: impl FnMut(NodeHandle, &Node)) {
        self.walk(root, false, &mut visitor);
    }

    /// Pre-order visit that does not descend into invisible nodes.
    pub fn traverse_visible(&self, root: NodeHandle, mut visitor: impl FnMut(NodeHandle, &Node)) {
        self.walk(root, true, &mut visitor);
    }

    /// Visits the parent chain of `handle`, nearest first.
    pub fn traverse_ancestors(&self, handle: NodeHandle, mut visitor: impl FnMut(NodeHandle, &Node)) {
        let mut cursor = self.nodes.get(handle).and_then(|n| n.parent);
        while let Some(h) = cursor {
            let Some(node) = self.nodes.get(h) else {
                break;
            };
            visitor(h, node);
            cursor = node.parent;
        }
    }

    fn walk(&self, root: NodeHandle, visible_only: bool, visitor: &mut impl FnMut(NodeHandle, &Node)) {
        let mut stack = vec![root];
        while let Some(h) = stack.pop() {
            let Some(node) = self.nodes.get(h) else {
                continue;
            };
            if visible_only && !node.visible {
                continue;
            }
            visitor(h, node);
            stack.extend(node.children.iter().rev().copied());
        }
    }

    /// Pre-order visit of every root subtree.
    pub fn traverse_all(&self, mut visitor: impl FnMut(NodeHandle, &Node)) {
        for &root in &self.root_nodes {
            self.walk(root, false, &mut visitor);
        }
    }

    /// Pre-order visit of every visible root subtree.
    pub fn traverse_all_visible(&self, mut visitor: impl FnMut(NodeHandle, &Node)) {
        for &root in &self.root_nodes {
            self.walk(root, true, &mut visitor);
        }
    }
}
