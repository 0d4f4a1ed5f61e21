//! Render List Tests
//!
//! Tests for:
//! - Bucketing into opaque / transmissive / transparent
//! - Default ordering (front-to-back opaque, back-to-front blended)
//! - render_order and group render_order precedence
//! - Frustum culling, layers and visibility filtering
//! - Multi-material meshes (one item per geometry group)
//! - Custom comparators and unsorted mode
//! - Shadow caster collection

use std::cmp::Ordering;

use glam::Vec3;
use myth_forward::renderer::render_list::{RenderItem, RenderList, collect_shadow_casters};
use myth_forward::resources::{Assets, GeometryHandle, Material, MaterialHandle};
use myth_forward::scene::{Camera, Layers, Mesh, NodeHandle, Scene};
use myth_forward::create_box;

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    scene: Scene,
    assets: Assets,
    camera: NodeHandle,
    cube: GeometryHandle,
}

impl Fixture {
    /// Camera at the origin looking down -Z.
    fn new() -> Self {
        let mut scene = Scene::new();
        let mut assets = Assets::new();
        let camera = scene.add_camera(Camera::new_perspective(60.0, 1.0, 0.1, 100.0));
        let cube = assets.add_geometry(create_box(1.0, 1.0, 1.0));
        Self {
            scene,
            assets,
            camera,
            cube,
        }
    }

    fn material(&mut self, material: Material) -> MaterialHandle {
        self.assets.add_material(material)
    }

    fn mesh_at(&mut self, material: MaterialHandle, z: f32) -> NodeHandle {
        let node = self.scene.add_mesh(Mesh::new(self.cube, material));
        self.scene.get_node_mut(node).unwrap().transform.position = Vec3::new(0.0, 0.0, z);
        node
    }

    fn build(&mut self, list: &mut RenderList) {
        self.scene.update_matrix_world();
        let camera = self.scene.camera(self.camera).unwrap();
        list.build(&self.scene, &self.assets, camera, Layers::default());
    }
}

fn transparent(opacity: f32) -> Material {
    let mut m = Material::new_basic(Vec3::ONE).with_opacity(opacity);
    m.set_transparent(true);
    m
}

// ============================================================================
// Bucketing and ordering
// ============================================================================

#[test]
fn materials_select_buckets() {
    let mut fx = Fixture::new();
    let opaque = fx.material(Material::new_basic(Vec3::ONE));
    let blended = fx.material(transparent(0.5));
    let mut glass = Material::new_basic(Vec3::ONE);
    glass.set_transmission(1.0);
    glass.set_transparent(true);
    let glass = fx.material(glass);

    fx.mesh_at(opaque, -5.0);
    fx.mesh_at(blended, -5.0);
    fx.mesh_at(glass, -5.0);

    let mut list = RenderList::new();
    fx.build(&mut list);

    assert_eq!(list.opaque.len(), 1);
    assert_eq!(list.transparent.len(), 1);
    // Transmission wins over the transparent flag.
    assert_eq!(list.transmissive.len(), 1);
    assert_eq!(list.transmissive[0].material, glass);
}

#[test]
fn opaque_draws_front_to_back() {
    let mut fx = Fixture::new();
    let material = fx.material(Material::new_basic(Vec3::ONE));
    let far = fx.mesh_at(material, -20.0);
    let near = fx.mesh_at(material, -5.0);
    let mid = fx.mesh_at(material, -10.0);

    let mut list = RenderList::new();
    fx.build(&mut list);

    let order: Vec<NodeHandle> = list.opaque.iter().map(|i| i.node).collect();
    assert_eq!(order, [near, mid, far]);
    assert!((list.opaque[0].z - 5.0).abs() < 1e-4);
}

#[test]
fn transparent_draws_back_to_front() {
    let mut fx = Fixture::new();
    let material = fx.material(transparent(0.5));
    let near = fx.mesh_at(material, -5.0);
    let far = fx.mesh_at(material, -20.0);

    let mut list = RenderList::new();
    fx.build(&mut list);

    let order: Vec<NodeHandle> = list.transparent.iter().map(|i| i.node).collect();
    assert_eq!(order, [far, near]);
}

#[test]
fn render_order_beats_depth() {
    let mut fx = Fixture::new();
    let material = fx.material(transparent(0.5));
    let near = fx.mesh_at(material, -5.0);
    let far = fx.mesh_at(material, -20.0);
    fx.scene.get_node_mut(far).unwrap().render_order = 1;

    let mut list = RenderList::new();
    fx.build(&mut list);

    let order: Vec<NodeHandle> = list.transparent.iter().map(|i| i.node).collect();
    assert_eq!(order, [near, far]);
}

#[test]
fn group_render_order_applies_to_descendants() -> anyhow::Result<()> {
    let mut fx = Fixture::new();
    let material = fx.material(Material::new_basic(Vec3::ONE));
    let outside = fx.mesh_at(material, -20.0);
    let group = fx.scene.add_group("overlay");
    fx.scene.get_node_mut(group).unwrap().render_order = -1;
    let inside = fx.mesh_at(material, -30.0);
    fx.scene.add(group, inside)?;

    let mut list = RenderList::new();
    fx.build(&mut list);

    assert_eq!(list.opaque[0].node, inside);
    assert_eq!(list.opaque[0].group_order, -1);
    assert_eq!(list.opaque[1].node, outside);
    Ok(())
}

#[test]
fn equal_keys_keep_traversal_order() {
    let mut fx = Fixture::new();
    let material = fx.material(transparent(0.5));
    let first = fx.mesh_at(material, -5.0);
    let second = fx.mesh_at(material, -5.0);

    let mut list = RenderList::new();
    fx.build(&mut list);

    let order: Vec<NodeHandle> = list.transparent.iter().map(|i| i.node).collect();
    assert_eq!(order, [first, second]);
    assert!(list.transparent[0].id < list.transparent[1].id);
}

// ============================================================================
// Filtering
// ============================================================================

#[test]
fn culled_and_hidden_meshes_are_skipped() {
    let mut fx = Fixture::new();
    let material = fx.material(Material::new_basic(Vec3::ONE));
    let hidden_material = fx.material({
        let mut m = Material::new_basic(Vec3::ONE);
        m.visible = false;
        m
    });

    let visible = fx.mesh_at(material, -5.0);
    fx.mesh_at(material, 10.0); // behind the camera
    let unculled = fx.mesh_at(material, 10.0);
    fx.scene.get_node_mut(unculled).unwrap().frustum_culled = false;
    let invisible = fx.mesh_at(material, -5.0);
    fx.scene.get_node_mut(invisible).unwrap().visible = false;
    let other_layer = fx.mesh_at(material, -5.0);
    fx.scene.get_node_mut(other_layer).unwrap().layers = Layers::only(4);
    fx.mesh_at(hidden_material, -5.0);

    let mut list = RenderList::new();
    fx.build(&mut list);

    let mut nodes: Vec<NodeHandle> = list.opaque.iter().map(|i| i.node).collect();
    nodes.sort();
    let mut expected = vec![visible, unculled];
    expected.sort();
    assert_eq!(nodes, expected);
}

#[test]
fn blended_items_outside_frustum_are_culled() {
    let mut fx = Fixture::new();
    let blended = fx.material(transparent(0.5));
    let mut glass = Material::new_basic(Vec3::ONE);
    glass.set_transmission(1.0);
    let glass = fx.material(glass);

    fx.mesh_at(blended, 10.0);
    fx.mesh_at(glass, 10.0);
    let inside = fx.mesh_at(glass, -5.0);

    let mut list = RenderList::new();
    fx.build(&mut list);

    assert!(list.opaque.is_empty());
    assert!(list.transparent.is_empty());
    assert_eq!(list.transmissive.len(), 1);
    assert_eq!(list.transmissive[0].node, inside);
}

#[test]
fn missing_geometry_is_skipped() {
    let mut fx = Fixture::new();
    let material = fx.material(Material::new_basic(Vec3::ONE));
    fx.mesh_at(material, -5.0);
    fx.assets.dispose_geometry(fx.cube);

    let mut list = RenderList::new();
    fx.build(&mut list);

    assert!(list.is_empty());
}

#[test]
fn multi_material_mesh_yields_item_per_group() {
    let mut fx = Fixture::new();
    let red = fx.material(Material::new_basic(Vec3::X));
    let green = fx.material(Material::new_basic(Vec3::Y));

    let mut geometry = create_box(1.0, 1.0, 1.0);
    geometry.add_group(0, 18, 0);
    geometry.add_group(18, 18, 1);
    let geometry = fx.assets.add_geometry(geometry);
    let node = fx.scene.add_mesh(Mesh::with_materials(geometry, &[red, green]));
    fx.scene.get_node_mut(node).unwrap().transform.position = Vec3::new(0.0, 0.0, -5.0);

    let mut list = RenderList::new();
    fx.build(&mut list);

    assert_eq!(list.opaque.len(), 2);
    let mut starts: Vec<u32> = list.opaque.iter().map(|i| i.group.unwrap().start).collect();
    starts.sort_unstable();
    assert_eq!(starts, [0, 18]);
}

// ============================================================================
// Custom ordering
// ============================================================================

#[test]
fn custom_comparator_replaces_default() {
    let mut fx = Fixture::new();
    let material = fx.material(Material::new_basic(Vec3::ONE));
    let near = fx.mesh_at(material, -5.0);
    let far = fx.mesh_at(material, -20.0);

    let mut list = RenderList::new();
    list.set_opaque_sort(Some(Box::new(|a: &RenderItem, b: &RenderItem| b.z.total_cmp(&a.z))));
    fx.build(&mut list);
    assert_eq!(list.opaque[0].node, far);

    list.set_opaque_sort(None);
    fx.build(&mut list);
    assert_eq!(list.opaque[0].node, near);
}

#[test]
fn unsorted_lists_keep_traversal_order() {
    let mut fx = Fixture::new();
    let material = fx.material(Material::new_basic(Vec3::ONE));
    let far = fx.mesh_at(material, -20.0);
    let near = fx.mesh_at(material, -5.0);

    let mut list = RenderList::new();
    list.sort_objects = false;
    fx.build(&mut list);

    let order: Vec<NodeHandle> = list.opaque.iter().map(|i| i.node).collect();
    assert_eq!(order, [far, near]);
    assert_eq!(
        myth_forward::renderer::render_list::painter_sort_stable(&list.opaque[1], &list.opaque[0]),
        Ordering::Less
    );
}

// ============================================================================
// Shadow casters
// ============================================================================

#[test]
fn shadow_casters_are_flagged_nodes_in_light_frustum() {
    let mut fx = Fixture::new();
    let material = fx.material(Material::new_basic(Vec3::ONE));
    let caster = fx.mesh_at(material, -5.0);
    fx.scene.get_node_mut(caster).unwrap().cast_shadow = true;
    fx.mesh_at(material, -6.0);
    let outside = fx.mesh_at(material, 50.0);
    fx.scene.get_node_mut(outside).unwrap().cast_shadow = true;
    fx.scene.update_matrix_world();

    let camera = fx.scene.camera(fx.camera).unwrap();
    let mut casters = Vec::new();
    collect_shadow_casters(&fx.scene, &fx.assets, camera.frustum(), &mut casters);

    assert_eq!(casters.len(), 1);
    assert_eq!(casters[0].node, caster);
}
