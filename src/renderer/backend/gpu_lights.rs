//! GPU layout of the light and shadow uniforms.
//!
//! Mirrors `Lights` and `ShadowData` in the light and shadow shader chunks.
//! Arrays are only declared for light kinds that are present, so the packed
//! buffers are exactly as large as the programs compiled for the same
//! [`LightsState`] expect.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};

use crate::renderer::lights::LightsState;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuDirectionalLight {
    pub direction: Vec3,
    pub shadow_index: i32,
    pub color: Vec3,
    pub _pad: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuPointLight {
    pub position: Vec3,
    pub shadow_index: i32,
    pub color: Vec3,
    pub distance: f32,
    pub decay: f32,
    pub _pad0: [f32; 3],
    pub _pad1: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuSpotLight {
    pub position: Vec3,
    pub shadow_index: i32,
    pub direction: Vec3,
    pub distance: f32,
    pub color: Vec3,
    pub decay: f32,
    pub cone_cos: f32,
    pub penumbra_cos: f32,
    pub _pad: Vec2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuShadow {
    pub view_projection: [Mat4; 6],
    pub bias: f32,
    pub normal_bias: f32,
    pub map_size: f32,
    pub far: f32,
}

fn shadow_index(shadow: Option<usize>) -> i32 {
    shadow.map_or(-1, |i| i as i32)
}

/// `Lights` uniform contents.
#[must_use]
pub fn pack_lights(lights: &LightsState) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + lights.directional.len() * 32 + (lights.point.len() + lights.spot.len()) * 64);
    out.extend_from_slice(bytemuck::bytes_of(&lights.ambient.extend(0.0)));
    for l in &lights.directional {
        out.extend_from_slice(bytemuck::bytes_of(&GpuDirectionalLight {
            direction: l.direction,
            shadow_index: shadow_index(l.shadow),
            color: l.color,
            _pad: 0.0,
        }));
    }
    for l in &lights.point {
        out.extend_from_slice(bytemuck::bytes_of(&GpuPointLight {
            position: l.position,
            shadow_index: shadow_index(l.shadow),
            color: l.color,
            distance: l.distance,
            decay: l.decay,
            _pad0: [0.0; 3],
            _pad1: [0.0; 4],
        }));
    }
    for l in &lights.spot {
        out.extend_from_slice(bytemuck::bytes_of(&GpuSpotLight {
            position: l.position,
            shadow_index: shadow_index(l.shadow),
            direction: l.direction,
            distance: l.distance,
            color: l.color,
            decay: l.decay,
            cone_cos: l.cone_cos,
            penumbra_cos: l.penumbra_cos,
            _pad: Vec2::ZERO,
        }));
    }
    out
}

/// `array<ShadowData, N>` uniform contents. Unused cube faces repeat the
/// first matrix.
#[must_use]
pub fn pack_shadows(lights: &LightsState) -> Vec<u8> {
    let shadows: Vec<GpuShadow> = lights
        .shadows
        .iter()
        .map(|s| {
            let first = s.view_projections.first().copied().unwrap_or(Mat4::IDENTITY);
            let mut view_projection = [first; 6];
            for (slot, m) in view_projection.iter_mut().zip(&s.view_projections) {
                *slot = *m;
            }
            GpuShadow {
                view_projection,
                bias: s.bias,
                normal_bias: s.normal_bias,
                map_size: s.map_size as f32,
                far: s.far,
            }
        })
        .collect();
    bytemuck::cast_slice(&shadows).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::ProgramDescriptor;
    use crate::renderer::backend::wgsl;
    use crate::renderer::lights::{DirectionalLightData, PointLightData, ShadowData, ShadowLightKind, SpotLightData};
    use crate::renderer::program::{
        LightCounts, ProgramEnvironment, ProgramParameters, ShaderGenerator, ShadowMapType, ToneMapping,
    };
    use crate::resources::{ColorSpace, Material};
    use crate::scene::{DrawMode, NodeHandle};
    use smallvec::smallvec;

    fn state() -> LightsState {
        let node = NodeHandle::default();
        LightsState {
            ambient: Vec3::splat(0.1),
            directional: vec![DirectionalLightData {
                node,
                direction: Vec3::NEG_Y,
                color: Vec3::ONE,
                shadow: Some(0),
            }],
            point: vec![PointLightData {
                node,
                position: Vec3::Y,
                color: Vec3::X,
                distance: 10.0,
                decay: 2.0,
                shadow: None,
            }],
            spot: vec![SpotLightData {
                node,
                position: Vec3::Z,
                direction: Vec3::NEG_Z,
                color: Vec3::Z,
                distance: 0.0,
                decay: 2.0,
                cone_cos: 0.8,
                penumbra_cos: 0.9,
                shadow: None,
            }],
            shadows: vec![ShadowData {
                node,
                kind: ShadowLightKind::Directional,
                light_position: Vec3::Y,
                view_projections: smallvec![Mat4::from_scale(Vec3::splat(2.0))],
                map_size: 512,
                bias: 0.001,
                normal_bias: 0.0,
                radius: 1.0,
                near: 0.5,
                far: 50.0,
                texture: None,
            }],
            shadow_map_type: ShadowMapType::Pcf,
        }
    }

    #[test]
    fn struct_sizes_match_std140_arrays() {
        assert_eq!(size_of::<GpuDirectionalLight>(), 32);
        assert_eq!(size_of::<GpuPointLight>(), 64);
        assert_eq!(size_of::<GpuSpotLight>(), 64);
        assert_eq!(size_of::<GpuShadow>(), 400);
    }

    #[test]
    fn packed_buffers_match_generated_shader_layout() {
        let lights = state();
        let env = ProgramEnvironment {
            lights: lights.counts(),
            shadow_map_type: ShadowMapType::Pcf,
            tone_mapping: ToneMapping::None,
            output_color_space: ColorSpace::Srgb,
            receive_shadow: true,
            has_vertex_colors: false,
            draw_mode: DrawMode::Triangles,
        };
        assert_ne!(env.lights, LightCounts::default());
        let params = ProgramParameters::for_material(&Material::new_lambert(Vec3::ONE), &env);
        let shader = ShaderGenerator::generate(&params).unwrap();
        let program = wgsl::check_program(&ProgramDescriptor {
            label: "lit",
            vertex_source: &shader.vertex,
            fragment_source: &shader.fragment,
            parameters: &params,
        })
        .unwrap();

        assert_eq!(wgsl::uniform_size(&program, 1, 0), Some(pack_lights(&lights).len() as u64));
        assert_eq!(wgsl::uniform_size(&program, 1, 1), Some(pack_shadows(&lights).len() as u64));
    }

    #[test]
    fn lights_without_shadow_use_negative_index() {
        let bytes = pack_lights(&state());
        let dir: GpuDirectionalLight = bytemuck::pod_read_unaligned(&bytes[16..48]);
        let point: GpuPointLight = bytemuck::pod_read_unaligned(&bytes[48..112]);
        assert_eq!(dir.shadow_index, 0);
        assert_eq!(point.shadow_index, -1);
        assert_eq!(point.distance, 10.0);
    }

    #[test]
    fn unused_cube_faces_repeat_the_first_matrix() {
        let bytes = pack_shadows(&state());
        let shadow: GpuShadow = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(shadow.view_projection[5], Mat4::from_scale(Vec3::splat(2.0)));
        assert_eq!(shadow.map_size, 512.0);
        assert_eq!(shadow.far, 50.0);
    }
}
