//! Per-frame light state.
//!
//! Collected once per frame from visible light nodes. Program parameters
//! only depend on [`LightsState::counts`], so changing a light's color never
//! recompiles anything while adding a light does.

use std::hash::BuildHasher;

use glam::{Mat4, Vec3};
use log::warn;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::renderer::backend::{TextureId, units};
use crate::renderer::program::{LightCounts, ShadowMapType};
use crate::scene::{Layers, LightKind, NodeHandle, Scene};

const MAX_SHADOWS: usize = (units::MAX_UNITS - units::SHADOW_BASE) as usize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLightData {
    pub node: NodeHandle,
    /// Direction the light travels.
    pub direction: Vec3,
    pub color: Vec3,
    pub shadow: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLightData {
    pub node: NodeHandle,
    pub position: Vec3,
    pub color: Vec3,
    pub distance: f32,
    pub decay: f32,
    pub shadow: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotLightData {
    pub node: NodeHandle,
    pub position: Vec3,
    pub direction: Vec3,
    pub color: Vec3,
    pub distance: f32,
    pub decay: f32,
    /// cos of the outer cone angle
    pub cone_cos: f32,
    /// cos of the angle where the penumbra starts
    pub penumbra_cos: f32,
    pub shadow: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowLightKind {
    Directional,
    Point,
    Spot,
}

/// One shadow map as seen by receiving programs.
#[derive(Debug, Clone)]
pub struct ShadowData {
    pub node: NodeHandle,
    pub kind: ShadowLightKind,
    pub light_position: Vec3,
    /// One matrix, or six cube faces for point lights.
    pub view_projections: SmallVec<[Mat4; 6]>,
    /// Edge length of one face after clamping.
    pub map_size: u32,
    pub bias: f32,
    pub normal_bias: f32,
    pub radius: f32,
    pub near: f32,
    pub far: f32,
    /// Set once the map has been rendered.
    pub texture: Option<TextureId>,
}

#[derive(Debug, Clone, Default)]
pub struct LightsState {
    pub ambient: Vec3,
    pub directional: Vec<DirectionalLightData>,
    pub point: Vec<PointLightData>,
    pub spot: Vec<SpotLightData>,
    pub shadows: Vec<ShadowData>,
    pub shadow_map_type: ShadowMapType,
}

impl LightsState {
    /// Collects every visible light whose layers the camera sees.
    ///
    /// World matrices must be current. Shadow entries are created for
    /// shadow-casting lights when `shadows_enabled`; their matrices are
    /// filled in by the shadow controller.
    pub fn setup(&mut self, scene: &Scene, camera_layers: Layers, shadows_enabled: bool, shadow_map_type: ShadowMapType) {
        self.ambient = Vec3::ZERO;
        self.directional.clear();
        self.point.clear();
        self.spot.clear();
        self.shadows.clear();
        self.shadow_map_type = shadow_map_type;

        let mut found: Vec<NodeHandle> = Vec::new();
        scene.traverse_all_visible(|handle, node| {
            if scene.light(handle).is_some() && node.layers.test(camera_layers) {
                found.push(handle);
            }
        });

        for handle in found {
            let (Some(node), Some(light)) = (scene.get_node(handle), scene.light(handle)) else {
                continue;
            };
            let position: Vec3 = node.world_matrix().translation.into();
            let color = light.color * light.intensity;

            let shadow = match (&light.shadow, shadows_enabled && node.cast_shadow) {
                (Some(settings), true) if !matches!(light.kind, LightKind::Ambient) => {
                    if self.shadows.len() >= MAX_SHADOWS {
                        warn!("Shadow limit of {MAX_SHADOWS} reached; light renders without shadow");
                        None
                    } else {
                        let kind = match light.kind {
                            LightKind::Point { .. } => ShadowLightKind::Point,
                            LightKind::Spot { .. } => ShadowLightKind::Spot,
                            _ => ShadowLightKind::Directional,
                        };
                        self.shadows.push(ShadowData {
                            node: handle,
                            kind,
                            light_position: position,
                            view_projections: SmallVec::new(),
                            map_size: settings.map_size,
                            bias: settings.bias,
                            normal_bias: settings.normal_bias,
                            radius: settings.radius,
                            near: settings.near,
                            far: settings.far,
                            texture: None,
                        });
                        Some(self.shadows.len() - 1)
                    }
                }
                _ => None,
            };

            match light.kind {
                LightKind::Ambient => self.ambient += color,
                LightKind::Directional { target } => self.directional.push(DirectionalLightData {
                    node: handle,
                    direction: (target - position).try_normalize().unwrap_or(Vec3::NEG_Y),
                    color,
                    shadow,
                }),
                LightKind::Point { distance, decay } => self.point.push(PointLightData {
                    node: handle,
                    position,
                    color,
                    distance,
                    decay,
                    shadow,
                }),
                LightKind::Spot {
                    target,
                    distance,
                    angle,
                    penumbra,
                    decay,
                } => self.spot.push(SpotLightData {
                    node: handle,
                    position,
                    direction: (target - position).try_normalize().unwrap_or(Vec3::NEG_Y),
                    color,
                    distance,
                    decay,
                    cone_cos: angle.cos(),
                    penumbra_cos: (angle * (1.0 - penumbra)).cos(),
                    shadow,
                }),
            }
        }
    }

    #[must_use]
    pub fn counts(&self) -> LightCounts {
        let shadows_of = |kind| self.shadows.iter().filter(|s| s.kind == kind).count() as u32;
        LightCounts {
            directional: self.directional.len() as u32,
            point: self.point.len() as u32,
            spot: self.spot.len() as u32,
            directional_shadows: shadows_of(ShadowLightKind::Directional),
            point_shadows: shadows_of(ShadowLightKind::Point),
            spot_shadows: shadows_of(ShadowLightKind::Spot),
        }
    }

    /// Hash of everything that feeds program parameters.
    #[must_use]
    pub fn config_hash(&self) -> u64 {
        FxBuildHasher.hash_one((self.counts(), self.shadow_map_type))
    }

    #[must_use]
    pub fn shadow_unit(index: usize) -> u32 {
        units::SHADOW_BASE + index as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Light;

    #[test]
    fn ambient_lights_accumulate() {
        let mut scene = Scene::new();
        scene.add_light(Light::new_ambient(Vec3::ONE, 0.25));
        scene.add_light(Light::new_ambient(Vec3::ONE, 0.5));
        scene.update_matrix_world();

        let mut lights = LightsState::default();
        lights.setup(&scene, Layers::default(), true, ShadowMapType::Pcf);
        assert!((lights.ambient.x - 0.75).abs() < 1e-6);
        assert_eq!(lights.counts(), LightCounts::default());
    }

    #[test]
    fn shadows_need_a_casting_node() {
        let mut scene = Scene::new();
        let sun = scene.add_light(Light::new_directional(Vec3::ONE, 1.0));
        scene.update_matrix_world();

        let mut lights = LightsState::default();
        lights.setup(&scene, Layers::default(), true, ShadowMapType::Pcf);
        assert!(lights.shadows.is_empty());

        scene.get_node_mut(sun).unwrap().cast_shadow = true;
        lights.setup(&scene, Layers::default(), true, ShadowMapType::Pcf);
        assert_eq!(lights.shadows.len(), 1);
        assert_eq!(lights.directional[0].shadow, Some(0));
    }
}
