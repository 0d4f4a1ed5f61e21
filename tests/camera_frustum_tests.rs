//! Camera and Frustum Tests
//!
//! Tests for:
//! - Perspective/orthographic projection with a [0, 1] depth range
//! - Aspect updates
//! - Frustum plane extraction and sphere/point tests

use glam::{Affine3A, Mat4, Vec3, Vec4};
use myth_forward::scene::{Camera, Frustum, Projection};

const EPSILON: f32 = 1e-4;

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

fn ndc_z(projection: &Mat4, view_z: f32) -> f32 {
    let clip = *projection * Vec4::new(0.0, 0.0, view_z, 1.0);
    clip.z / clip.w
}

// ============================================================================
// Projection
// ============================================================================

#[test]
fn perspective_maps_near_and_far_to_unit_depth_range() {
    let cam = Camera::new_perspective(60.0, 1.0, 0.5, 50.0);
    let p = cam.projection_matrix();

    assert!(approx(ndc_z(p, -0.5), 0.0));
    assert!(approx(ndc_z(p, -50.0), 1.0));
}

#[test]
fn orthographic_depth_is_linear() {
    let cam = Camera::new_orthographic(-1.0, 1.0, -1.0, 1.0, 1.0, 11.0);
    let p = cam.projection_matrix();

    assert!(approx(ndc_z(p, -1.0), 0.0));
    assert!(approx(ndc_z(p, -6.0), 0.5));
    assert!(approx(ndc_z(p, -11.0), 1.0));
}

#[test]
fn perspective_fov_is_given_in_degrees() {
    let cam = Camera::new_perspective(90.0, 1.0, 0.1, 10.0);
    let Projection::Perspective { fov_y, .. } = cam.projection else {
        panic!("expected perspective projection");
    };
    assert!(approx(fov_y, std::f32::consts::FRAC_PI_2));

    // Edge of a 90° frustum at distance 1 lands on NDC y = 1.
    let clip = *cam.projection_matrix() * Vec4::new(0.0, 1.0, -1.0, 1.0);
    assert!(approx(clip.y / clip.w, 1.0));
}

#[test]
fn set_aspect_rebuilds_projection() {
    let mut cam = Camera::new_perspective(60.0, 1.0, 0.1, 10.0);
    let square = *cam.projection_matrix();
    cam.set_aspect(2.0);

    assert!(approx(cam.projection_matrix().x_axis.x * 2.0, square.x_axis.x));
    assert!(approx(cam.projection_matrix().y_axis.y, square.y_axis.y));
}

#[test]
fn set_aspect_ignores_orthographic_cameras() {
    let mut cam = Camera::new_orthographic(-2.0, 2.0, -1.0, 1.0, 0.1, 10.0);
    let before = *cam.projection_matrix();
    cam.set_aspect(3.0);
    assert_eq!(*cam.projection_matrix(), before);
}

#[test]
fn near_far_reports_projection_planes() {
    assert_eq!(Camera::new_perspective(45.0, 1.0, 0.25, 40.0).near_far(), (0.25, 40.0));
    assert_eq!(
        Camera::new_orthographic(-1.0, 1.0, -1.0, 1.0, 2.0, 8.0).near_far(),
        (2.0, 8.0)
    );
}

// ============================================================================
// Frustum
// ============================================================================

#[test]
fn frustum_planes_are_normalized() {
    let cam = Camera::new_perspective(70.0, 1.5, 0.1, 100.0);
    for plane in cam.frustum().planes() {
        assert!(approx(plane.truncate().length(), 1.0));
    }
}

#[test]
fn frustum_contains_points_between_planes() {
    let cam = Camera::new_perspective(60.0, 1.0, 1.0, 10.0);
    let frustum = cam.frustum();

    assert!(frustum.contains_point(Vec3::new(0.0, 0.0, -5.0)));
    assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, -0.5)));
    assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, -11.0)));
    assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, 5.0)));
    assert!(!frustum.contains_point(Vec3::new(100.0, 0.0, -5.0)));
}

#[test]
fn sphere_straddling_a_plane_intersects() {
    let cam = Camera::new_perspective(60.0, 1.0, 1.0, 10.0);
    let frustum = cam.frustum();

    // Center behind the far plane, radius reaching into the frustum.
    assert!(frustum.intersects_sphere(Vec3::new(0.0, 0.0, -10.5), 1.0));
    assert!(!frustum.intersects_sphere(Vec3::new(0.0, 0.0, -12.0), 1.0));
}

#[test]
fn frustum_follows_camera_transform() {
    let mut cam = Camera::new_orthographic(-1.0, 1.0, -1.0, 1.0, 0.1, 10.0);
    cam.update_view_projection(&Affine3A::from_translation(Vec3::new(20.0, 0.0, 0.0)));

    assert!(cam.frustum().contains_point(Vec3::new(20.0, 0.0, -5.0)));
    assert!(!cam.frustum().contains_point(Vec3::new(0.0, 0.0, -5.0)));
    assert_eq!(*cam.frustum(), Frustum::from_matrix(*cam.view_projection_matrix()));
}
