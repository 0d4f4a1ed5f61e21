//! Minimal geometry generators (box and plane) producing indexed geometry
//! with `position`, `normal` and `uv` attributes.

use glam::Vec3;

use crate::resources::geometry::{ATTR_NORMAL, ATTR_POSITION, ATTR_UV, Attribute, Geometry};

/// Appends one quad face. `u` and `v` span the face, `normal` faces out.
fn push_face(
    positions: &mut Vec<f32>,
    normals: &mut Vec<f32>,
    uvs: &mut Vec<f32>,
    indices: &mut Vec<u32>,
    center: Vec3,
    u: Vec3,
    v: Vec3,
    normal: Vec3,
) {
    let base = (positions.len() / 3) as u32;
    let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
    for (su, sv) in corners {
        let p = center + u * su + v * sv;
        positions.extend_from_slice(&p.to_array());
        normals.extend_from_slice(&normal.to_array());
        uvs.extend_from_slice(&[(su + 1.0) * 0.5, (sv + 1.0) * 0.5]);
    }
    indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
}

fn build(faces: &[(Vec3, Vec3, Vec3, Vec3)], name: &str) -> Geometry {
    let mut positions = Vec::with_capacity(faces.len() * 12);
    let mut normals = Vec::with_capacity(faces.len() * 12);
    let mut uvs = Vec::with_capacity(faces.len() * 8);
    let mut indices = Vec::with_capacity(faces.len() * 6);

    for &(center, u, v, normal) in faces {
        push_face(&mut positions, &mut normals, &mut uvs, &mut indices, center, u, v, normal);
    }

    let mut geometry = Geometry::new();
    geometry.name = name.to_string();
    geometry.set_attribute(ATTR_POSITION, Attribute::new(positions, 3));
    geometry.set_attribute(ATTR_NORMAL, Attribute::new(normals, 3));
    geometry.set_attribute(ATTR_UV, Attribute::new(uvs, 2));
    geometry.set_index(indices);
    geometry
}

/// Axis-aligned box centred on the origin. Faces wind counter-clockwise
/// seen from outside.
#[must_use]
pub fn create_box(width: f32, height: f32, depth: f32) -> Geometry {
    let (w, h, d) = (width * 0.5, height * 0.5, depth * 0.5);
    let (x, y, z) = (Vec3::X, Vec3::Y, Vec3::Z);
    build(
        &[
            (z * d, x * w, y * h, z),
            (-z * d, -x * w, y * h, -z),
            (x * w, -z * d, y * h, x),
            (-x * w, z * d, y * h, -x),
            (y * h, x * w, -z * d, y),
            (-y * h, x * w, z * d, -y),
        ],
        "box",
    )
}

/// Plane in the XY plane facing +Z.
#[must_use]
pub fn create_plane(width: f32, height: f32) -> Geometry {
    build(
        &[(Vec3::ZERO, Vec3::X * width * 0.5, Vec3::Y * height * 0.5, Vec3::Z)],
        "plane",
    )
}
