use std::borrow::Cow;

use glam::Affine3A;

use crate::scene::transform::Transform;
use crate::scene::{Layers, NodeHandle, NodeKind};

/// A scene node: hierarchy links, transform and per-object render flags.
///
/// Kind-specific data (mesh, camera, light) lives in the [`Scene`]'s
/// component maps; [`Node::kind`] tells which map to look in.
///
/// [`Scene`]: crate::scene::Scene
#[derive(Debug, Clone)]
pub struct Node {
    pub name: Cow<'static, str>,

    // === Core Hierarchy ===
    pub(crate) parent: Option<NodeHandle>,
    pub(crate) children: Vec<NodeHandle>,
    pub(crate) kind: NodeKind,

    // === Core Spatial Data ===
    pub transform: Transform,

    // === Render Flags ===
    /// Invisible nodes hide their whole subtree.
    pub visible: bool,
    /// Secondary sort key; lower values are drawn first within a bucket.
    pub render_order: i32,
    /// Test the bounding sphere against the camera frustum.
    pub frustum_culled: bool,
    pub cast_shadow: bool,
    pub receive_shadow: bool,
    pub layers: Layers,
}

impl Node {
    #[must_use]
    pub fn new(kind: NodeKind) -> Self {
        Self {
            name: Cow::Borrowed(""),
            parent: None,
            children: Vec::new(),
            kind,
            transform: Transform::new(),
            visible: true,
            render_order: 0,
            frustum_culled: true,
            cast_shadow: false,
            receive_shadow: false,
            layers: Layers::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<NodeHandle> {
        self.parent
    }

    #[inline]
    #[must_use]
    pub fn children(&self) -> &[NodeHandle] {
        &self.children
    }

    #[inline]
    #[must_use]
    pub fn world_matrix(&self) -> &Affine3A {
        &self.transform.world_matrix
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new(NodeKind::Group)
    }
}
