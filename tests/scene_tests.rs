//! Scene Graph Tests
//!
//! Tests for:
//! - Parent/child links (add, attach, remove, remove_node)
//! - Rejection of cyclic attachments
//! - Pre-order traversal (all, visible-only, ancestors)
//! - Lookup by name and component access
//! - Layer masks

use glam::{Quat, Vec3};
use myth_forward::errors::EngineError;
use myth_forward::resources::{Assets, Material};
use myth_forward::scene::{Camera, Layers, Light, Mesh, NodeKind, Scene};
use myth_forward::create_box;

const EPSILON: f32 = 1e-5;

fn vec3_approx(a: Vec3, b: Vec3) -> bool {
    (a - b).abs().max_element() < EPSILON
}

// ============================================================================
// Hierarchy
// ============================================================================

#[test]
fn add_links_parent_and_child() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let parent = scene.add_group("parent");
    let child = scene.add_group("child");

    scene.add(parent, child)?;

    assert_eq!(scene.get_node(child).unwrap().parent(), Some(parent));
    assert_eq!(scene.get_node(parent).unwrap().children(), &[child]);
    assert_eq!(scene.roots(), &[parent]);
    Ok(())
}

#[test]
fn readding_a_child_moves_it_to_the_end() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let parent = scene.add_group("parent");
    let a = scene.add_group("a");
    let b = scene.add_group("b");
    scene.add(parent, a)?;
    scene.add(parent, b)?;

    scene.add(parent, a)?;

    assert_eq!(scene.get_node(parent).unwrap().children(), &[b, a]);
    Ok(())
}

#[test]
fn reparenting_detaches_from_previous_parent() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let first = scene.add_group("first");
    let second = scene.add_group("second");
    let child = scene.add_group("child");
    scene.add(first, child)?;

    scene.add(second, child)?;

    assert!(scene.get_node(first).unwrap().children().is_empty());
    assert_eq!(scene.get_node(second).unwrap().children(), &[child]);
    assert_eq!(scene.get_node(child).unwrap().parent(), Some(second));
    Ok(())
}

#[test]
fn adding_node_to_itself_is_rejected() {
    let mut scene = Scene::new();
    let node = scene.add_group("node");

    let err = scene.add(node, node).unwrap_err();

    assert!(matches!(err, EngineError::AttachToSelf));
    assert!(scene.get_node(node).unwrap().parent().is_none());
    assert_eq!(scene.roots(), &[node]);
}

#[test]
fn adding_ancestor_under_descendant_is_rejected() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let root = scene.add_group("root");
    let mid = scene.add_group("mid");
    let leaf = scene.add_group("leaf");
    scene.add(root, mid)?;
    scene.add(mid, leaf)?;

    let err = scene.add(leaf, root).unwrap_err();

    assert!(matches!(err, EngineError::AttachToDescendant));
    assert!(scene.get_node(root).unwrap().parent().is_none());
    assert_eq!(scene.get_node(leaf).unwrap().children().len(), 0);
    Ok(())
}

#[test]
fn remove_makes_child_a_root() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let parent = scene.add_group("parent");
    let child = scene.add_group("child");
    scene.add(parent, child)?;

    scene.remove(child)?;

    assert!(scene.get_node(child).unwrap().parent().is_none());
    assert!(scene.roots().contains(&child));
    assert!(scene.get_node(parent).unwrap().children().is_empty());
    Ok(())
}

#[test]
fn remove_node_deletes_subtree_and_components() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let mut assets = Assets::new();
    let geometry = assets.add_geometry(create_box(1.0, 1.0, 1.0));
    let material = assets.add_material(Material::new_basic(Vec3::ONE));

    let root = scene.add_group("root");
    let mesh = scene.add_mesh(Mesh::new(geometry, material));
    let light = scene.add_light(Light::new_point(Vec3::ONE, 1.0, 0.0));
    scene.add(root, mesh)?;
    scene.add(mesh, light)?;

    scene.remove_node(root);

    assert_eq!(scene.node_count(), 0);
    assert!(scene.mesh(mesh).is_none());
    assert!(scene.light(light).is_none());
    assert!(scene.roots().is_empty());
    Ok(())
}

#[test]
fn attach_preserves_world_position() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let parent = scene.add_group("parent");
    let child = scene.add_group("child");
    {
        let p = scene.get_node_mut(parent).unwrap();
        p.transform.position = Vec3::new(4.0, 0.0, 0.0);
        p.transform.rotation = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2);
    }
    scene.get_node_mut(child).unwrap().transform.position = Vec3::new(1.0, 2.0, 3.0);
    scene.update_matrix_world();

    scene.attach(parent, child)?;
    scene.update_matrix_world();

    let world = scene.get_world_position(child).unwrap();
    assert!(vec3_approx(world, Vec3::new(1.0, 2.0, 3.0)), "got {world}");
    assert_eq!(scene.get_node(child).unwrap().parent(), Some(parent));
    Ok(())
}

// ============================================================================
// Traversal
// ============================================================================

#[test]
fn traverse_is_pre_order_in_child_order() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let root = scene.add_group("root");
    let a = scene.add_group("a");
    let a1 = scene.add_group("a1");
    let b = scene.add_group("b");
    scene.add(root, a)?;
    scene.add(a, a1)?;
    scene.add(root, b)?;

    let mut order = Vec::new();
    scene.traverse(root, |_, node| order.push(node.name.to_string()));

    assert_eq!(order, ["root", "a", "a1", "b"]);
    Ok(())
}

#[test]
fn invisible_node_hides_its_subtree() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let root = scene.add_group("root");
    let hidden = scene.add_group("hidden");
    let below = scene.add_group("below");
    let shown = scene.add_group("shown");
    scene.add(root, hidden)?;
    scene.add(hidden, below)?;
    scene.add(root, shown)?;
    scene.get_node_mut(hidden).unwrap().visible = false;

    let mut visible = Vec::new();
    scene.traverse_visible(root, |_, node| visible.push(node.name.to_string()));
    let mut all = 0;
    scene.traverse_all(|_, _| all += 1);

    assert_eq!(visible, ["root", "shown"]);
    assert_eq!(all, 4);
    Ok(())
}

#[test]
fn traverse_ancestors_walks_nearest_first() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let root = scene.add_group("root");
    let mid = scene.add_group("mid");
    let leaf = scene.add_group("leaf");
    scene.add(root, mid)?;
    scene.add(mid, leaf)?;

    let mut chain = Vec::new();
    scene.traverse_ancestors(leaf, |h, _| chain.push(h));

    assert_eq!(chain, [mid, root]);
    assert!(scene.is_ancestor(root, leaf));
    assert!(!scene.is_ancestor(leaf, root));
    Ok(())
}

#[test]
fn find_by_name_returns_first_match() -> anyhow::Result<()> {
    let mut scene = Scene::new();
    let root = scene.add_group("root");
    let first = scene.add_group("target");
    let second = scene.add_group("target");
    scene.add(root, first)?;
    scene.add(root, second)?;

    assert_eq!(scene.find_by_name("target"), Some(first));
    assert_eq!(scene.find_by_name("missing"), None);
    Ok(())
}

// ============================================================================
// Components
// ============================================================================

#[test]
fn components_are_reachable_by_node_handle() {
    let mut scene = Scene::new();
    let camera = scene.add_camera(Camera::new_perspective(45.0, 1.0, 0.1, 100.0));
    let light = scene.add_light(Light::new_directional(Vec3::ONE, 2.0));

    assert_eq!(scene.get_node(camera).unwrap().kind(), NodeKind::Camera);
    assert!(scene.camera(camera).is_some());
    assert!(scene.light(camera).is_none());
    assert_eq!(scene.light(light).unwrap().intensity, 2.0);

    scene.light_mut(light).unwrap().intensity = 0.5;
    assert_eq!(scene.light(light).unwrap().intensity, 0.5);
}

#[test]
fn look_at_points_negative_z_at_target() {
    let mut scene = Scene::new();
    let camera = scene.add_camera(Camera::new_perspective(45.0, 1.0, 0.1, 100.0));
    scene.get_node_mut(camera).unwrap().transform.position = Vec3::new(0.0, 0.0, 5.0);

    scene.look_at(camera, Vec3::new(3.0, 0.0, 5.0));
    scene.update_matrix_world();

    let view = *scene.camera(camera).unwrap().view_matrix();
    let target_in_view = view.transform_point3(Vec3::new(3.0, 0.0, 5.0));
    assert!(vec3_approx(target_in_view, Vec3::new(0.0, 0.0, -3.0)), "got {target_in_view}");
}

// ============================================================================
// Layers
// ============================================================================

#[test]
fn layers_intersect_by_bit() {
    let mut layers = Layers::default();
    assert!(layers.test(Layers::only(0)));
    assert!(!layers.test(Layers::only(3)));

    layers.enable(3);
    assert!(layers.test(Layers::only(3)));

    layers.disable(0);
    assert!(!layers.test(Layers::only(0)));
    assert!(Layers::ALL.test(layers));
    assert!(!Layers::NONE.test(Layers::ALL));
}

#[test]
fn highest_layer_is_bit_31() {
    assert_eq!(Layers::only(31), Layers(1 << 31));
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "out of range")]
fn layer_past_31_panics_in_debug() {
    let _ = Layers::only(32);
}
