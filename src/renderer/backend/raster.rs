//! CPU rasterization and shading for the software backend.
//!
//! Conventions follow wgpu: clip-space depth in `[0, 1]`, window origin at
//! the top-left corner, pixel centers at `+0.5`. Triangles are clipped
//! against the near plane, covered with the top-left fill rule and
//! interpolated perspective-correctly.
//!
//! Fragments are shaded from the program's parameters with the same math as
//! the WGSL templates, so a scene renders identically here and on a GPU.

use glam::{IVec2, Vec2, Vec3, Vec3Swizzles, Vec4, Vec4Swizzles};
use smallvec::SmallVec;
use wgpu::{
    AddressMode, BlendComponent, BlendFactor, BlendOperation, BlendState, ColorWrites, CompareFunction, Face,
    FilterMode, FrontFace, StencilOperation, TextureFormat,
};

use crate::renderer::backend::{DrawUniforms, StencilConfig, Viewport, units};
use crate::renderer::lights::LightsState;
use crate::renderer::program::{ProgramFeatures, ProgramParameters, ShadingModel, ShadowMapType, ToneMapping};
use crate::renderer::settings::{linear_to_srgb, srgb_to_linear};
use crate::resources::{ColorSpace, TextureSampler};

/// Minimum resolvable depth difference used by polygon offset units.
const DEPTH_UNIT: f32 = 1.0 / 16_777_216.0;

// ============================================================================
// Texel access
// ============================================================================

/// Level 0 of a texture as seen by a shader.
#[derive(Debug, Clone, Copy)]
pub(super) struct TexelView<'a> {
    pub width: u32,
    pub height: u32,
    pub data: &'a [Vec4],
    pub sampler: TextureSampler,
}

impl TexelView<'_> {
    /// `textureLoad`: clamped to the texture edges.
    pub fn load(&self, x: i32, y: i32) -> Vec4 {
        if self.width == 0 || self.height == 0 {
            return Vec4::ZERO;
        }
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.data.get(y * self.width as usize + x).copied().unwrap_or(Vec4::ZERO)
    }

    fn wrap(coord: i32, size: u32, mode: AddressMode) -> i32 {
        let size = size.max(1) as i32;
        match mode {
            AddressMode::Repeat => coord.rem_euclid(size),
            AddressMode::MirrorRepeat => {
                let period = size * 2;
                let c = coord.rem_euclid(period);
                if c >= size { period - 1 - c } else { c }
            }
            _ => coord.clamp(0, size - 1),
        }
    }

    fn fetch(&self, x: i32, y: i32) -> Vec4 {
        self.load(
            Self::wrap(x, self.width, self.sampler.address_mode_u),
            Self::wrap(y, self.height, self.sampler.address_mode_v),
        )
    }

    /// `textureSample` at level 0.
    pub fn sample(&self, uv: Vec2) -> Vec4 {
        let x = uv.x * self.width as f32;
        let y = uv.y * self.height as f32;
        match self.sampler.mag_filter {
            FilterMode::Nearest => self.fetch(x.floor() as i32, y.floor() as i32),
            FilterMode::Linear => {
                let (fx, fy) = (x - 0.5, y - 0.5);
                let (x0, y0) = (fx.floor(), fy.floor());
                let (tx, ty) = (fx - x0, fy - y0);
                let (x0, y0) = (x0 as i32, y0 as i32);
                let top = self.fetch(x0, y0).lerp(self.fetch(x0 + 1, y0), tx);
                let bottom = self.fetch(x0, y0 + 1).lerp(self.fetch(x0 + 1, y0 + 1), tx);
                top.lerp(bottom, ty)
            }
        }
    }
}

// ============================================================================
// Shading
// ============================================================================

/// Vertex stage outputs.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct Varyings {
    pub clip: Vec4,
    pub world: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub color: Vec4,
}

impl Varyings {
    fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            clip: self.clip.lerp(other.clip, t),
            world: self.world.lerp(other.world, t),
            normal: self.normal.lerp(other.normal, t),
            uv: self.uv.lerp(other.uv, t),
            color: self.color.lerp(other.color, t),
        }
    }

    fn weighted(v: [&Self; 3], w: [f32; 3]) -> Self {
        Self {
            clip: v[0].clip * w[0] + v[1].clip * w[1] + v[2].clip * w[2],
            world: v[0].world * w[0] + v[1].world * w[1] + v[2].world * w[2],
            normal: v[0].normal * w[0] + v[1].normal * w[1] + v[2].normal * w[2],
            uv: v[0].uv * w[0] + v[1].uv * w[1] + v[2].uv * w[2],
            color: v[0].color * w[0] + v[1].color * w[1] + v[2].color * w[2],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) struct VertexInput {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub color: Option<Vec4>,
}

/// Everything a draw's shader stages read.
pub(super) struct Shader<'a> {
    pub params: &'a ProgramParameters,
    pub uniforms: &'a DrawUniforms,
    pub lights: &'a LightsState,
    pub units: [Option<TexelView<'a>>; units::MAX_UNITS as usize],
}

/// Cube face (+X, -X, +Y, -Y, +Z, -Z) a direction points into.
#[must_use]
pub fn cube_face(direction: Vec3) -> usize {
    let a = direction.abs();
    if a.x >= a.y && a.x >= a.z {
        if direction.x > 0.0 { 0 } else { 1 }
    } else if a.y >= a.z {
        if direction.y > 0.0 { 2 } else { 3 }
    } else if direction.z > 0.0 {
        4
    } else {
        5
    }
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    if edge1 <= edge0 {
        return if x >= edge0 { 1.0 } else { 0.0 };
    }
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn distance_attenuation(d: f32, cutoff: f32, decay: f32) -> f32 {
    let mut falloff = 1.0 / d.powf(decay).max(0.01);
    if cutoff > 0.0 {
        let window = (1.0 - (d / cutoff).powi(4)).clamp(0.0, 1.0);
        falloff *= window * window;
    }
    falloff
}

fn tone_map(color: Vec3, mapping: ToneMapping) -> Vec3 {
    match mapping {
        ToneMapping::None => color,
        ToneMapping::Linear => color.clamp(Vec3::ZERO, Vec3::ONE),
        ToneMapping::Reinhard => (color / (Vec3::ONE + color)).clamp(Vec3::ZERO, Vec3::ONE),
        ToneMapping::AcesFilmic => {
            let a = color * (2.51 * color + 0.03);
            let b = color * (2.43 * color + 0.59) + 0.14;
            (a / b).clamp(Vec3::ZERO, Vec3::ONE)
        }
    }
}

fn shadow_compare(map: &TexelView<'_>, uv: Vec2, depth: f32, kind: ShadowMapType) -> f32 {
    let texel = (uv * Vec2::new(map.width as f32, map.height as f32)).as_ivec2();
    match kind {
        ShadowMapType::Basic => {
            if depth <= map.load(texel.x, texel.y).x { 1.0 } else { 0.0 }
        }
        ShadowMapType::Pcf => {
            let mut lit = 0.0;
            for y in -1..=1 {
                for x in -1..=1 {
                    if depth <= map.load(texel.x + x, texel.y + y).x {
                        lit += 1.0;
                    }
                }
            }
            lit / 9.0
        }
        ShadowMapType::Vsm => {
            let moments = map.load(texel.x, texel.y);
            if depth <= moments.x {
                return 1.0;
            }
            let variance = (moments.y - moments.x * moments.x).max(0.000_001);
            let d = depth - moments.x;
            let p = variance / (variance + d * d);
            ((p - 0.3) / 0.7).clamp(0.0, 1.0)
        }
    }
}

impl Shader<'_> {
    fn unit(&self, unit: u32) -> Option<&TexelView<'_>> {
        self.units.get(unit as usize).and_then(Option::as_ref)
    }

    fn has(&self, feature: ProgramFeatures) -> bool {
        self.params.features.contains(feature)
    }

    pub fn vertex(&self, input: &VertexInput) -> Varyings {
        let u = self.uniforms;
        let world = u.model * input.position.extend(1.0);
        let normal = (u.normal_matrix * input.normal.extend(0.0)).truncate().normalize_or_zero();
        let color = if self.has(ProgramFeatures::USE_VERTEX_COLORS) {
            input.color.unwrap_or(Vec4::ONE)
        } else {
            Vec4::ONE
        };
        let clip = if self.has(ProgramFeatures::USE_SPRITE) {
            let center = u.view * u.model * Vec4::W;
            let corner = (input.uv - Vec2::splat(0.5)) * u.params.x;
            let (s, c) = u.params.z.sin_cos();
            let rotated = Vec2::new(c * corner.x - s * corner.y, s * corner.x + c * corner.y);
            u.projection * (center + Vec4::new(rotated.x, rotated.y, 0.0, 0.0))
        } else {
            u.projection * u.view * world
        };
        Varyings {
            clip,
            world: world.truncate(),
            normal,
            uv: input.uv,
            color,
        }
    }

    /// `frag` is the window position (xy) and depth (z). `None` discards.
    pub fn fragment(&self, v: &Varyings, frag: Vec3, front_facing: bool) -> Option<Vec4> {
        let u = self.uniforms;
        if self.params.shading == ShadingModel::VsmBlur {
            return Some(self.blur(frag));
        }

        let mut diffuse = u.color;
        if self.has(ProgramFeatures::USE_MAP)
            && let Some(map) = self.unit(units::MAP)
        {
            diffuse *= map.sample(v.uv);
        }
        if self.has(ProgramFeatures::USE_VERTEX_COLORS) {
            diffuse *= v.color;
        }
        if self.has(ProgramFeatures::USE_ALPHA_TEST) && diffuse.w < u.emissive.w {
            return None;
        }

        let color = match self.params.shading {
            ShadingModel::Depth | ShadingModel::Distance => {
                let d = if self.params.shading == ShadingModel::Distance {
                    (v.world - u.reference_point.xyz()).length() / u.reference_point.w
                } else {
                    frag.z
                };
                return Some(if self.has(ProgramFeatures::VSM_OUTPUT) {
                    Vec4::new(d, d * d, 0.0, 1.0)
                } else {
                    Vec4::new(d, 0.0, 0.0, 1.0)
                });
            }
            ShadingModel::Lambert | ShadingModel::Phong => self.lit(v, diffuse, front_facing),
            ShadingModel::Basic | ShadingModel::Custom | ShadingModel::VsmBlur => diffuse.xyz() + u.emissive.xyz(),
        };
        Some(self.output(color, diffuse, frag))
    }

    fn specular_term(&self, normal: Vec3, light_dir: Vec3, view_dir: Vec3) -> f32 {
        if self.params.shading != ShadingModel::Phong {
            return 0.0;
        }
        let half_dir = (light_dir + view_dir).normalize_or_zero();
        normal.dot(half_dir).max(0.0).powf(self.uniforms.specular.w)
    }

    fn lit(&self, v: &Varyings, diffuse: Vec4, front_facing: bool) -> Vec3 {
        let u = self.uniforms;
        let counts = self.params.lights;
        let mut normal = v.normal.normalize_or_zero();
        if self.has(ProgramFeatures::DOUBLE_SIDED) {
            if !front_facing {
                normal = -normal;
            }
        } else if self.has(ProgramFeatures::FLIP_SIDED) {
            normal = -normal;
        }
        let view_dir = (u.camera_position.xyz() - v.world).normalize_or_zero();
        let mut irradiance = self.lights.ambient;
        let mut specular = Vec3::ZERO;

        for light in self.lights.directional.iter().take(counts.directional as usize) {
            let light_dir = -light.direction;
            let radiance = light.color * self.shadow(light.shadow, v.world, normal, None);
            irradiance += radiance * normal.dot(light_dir).max(0.0);
            specular += radiance * self.specular_term(normal, light_dir, view_dir);
        }
        for light in self.lights.point.iter().take(counts.point as usize) {
            let to_light = light.position - v.world;
            let d = to_light.length();
            let light_dir = to_light.normalize_or_zero();
            let shadow = self.shadow(light.shadow, v.world, normal, Some((cube_face(-to_light), d)));
            let radiance = light.color * distance_attenuation(d, light.distance, light.decay) * shadow;
            irradiance += radiance * normal.dot(light_dir).max(0.0);
            specular += radiance * self.specular_term(normal, light_dir, view_dir);
        }
        for light in self.lights.spot.iter().take(counts.spot as usize) {
            let to_light = light.position - v.world;
            let d = to_light.length();
            let light_dir = to_light.normalize_or_zero();
            let cone = smoothstep(light.cone_cos, light.penumbra_cos, (-light_dir).dot(light.direction));
            let shadow = self.shadow(light.shadow, v.world, normal, None);
            let radiance = light.color * cone * distance_attenuation(d, light.distance, light.decay) * shadow;
            irradiance += radiance * normal.dot(light_dir).max(0.0);
            specular += radiance * self.specular_term(normal, light_dir, view_dir);
        }

        diffuse.xyz() * irradiance + specular * u.specular.xyz() + u.emissive.xyz()
    }

    /// `point`: cube face and distance to the light for point lights.
    fn shadow(&self, index: Option<usize>, world: Vec3, normal: Vec3, point: Option<(usize, f32)>) -> f32 {
        if !self.has(ProgramFeatures::USE_SHADOWMAP) {
            return 1.0;
        }
        let Some(i) = index else {
            return 1.0;
        };
        let (Some(data), Some(map)) = (self.lights.shadows.get(i), self.unit(units::SHADOW_BASE + i as u32)) else {
            return 1.0;
        };
        let face = point.map_or(0, |(face, _)| face);
        let Some(view_projection) = data.view_projections.get(face) else {
            return 1.0;
        };

        let clip = *view_projection * (world + normal * data.normal_bias).extend(1.0);
        let ndc = clip.xyz() / clip.w;
        let mut uv = Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
        let mut depth = ndc.z;
        if let Some((face, distance)) = point {
            uv = (uv + Vec2::new((face % 3) as f32, (face / 3) as f32)) / Vec2::new(3.0, 2.0);
            depth = distance / data.far;
        }
        if uv.cmplt(Vec2::ZERO).any() || uv.cmpgt(Vec2::ONE).any() || depth > 1.0 {
            return 1.0;
        }
        shadow_compare(map, uv, depth - data.bias, self.params.shadow_map_type)
    }

    fn output(&self, mut color: Vec3, diffuse: Vec4, frag: Vec3) -> Vec4 {
        let u = self.uniforms;
        if self.has(ProgramFeatures::USE_TRANSMISSION)
            && let Some(behind) = self.unit(units::TRANSMISSION)
        {
            let screen_uv = (frag.xy() - u.viewport.zw()) / u.viewport.xy();
            let behind = behind.sample(screen_uv).xyz();
            color = color.lerp(behind * diffuse.xyz(), u.camera_position.w);
        }
        if self.has(ProgramFeatures::TONE_MAPPED) {
            color = tone_map(color * u.params.y, self.params.tone_mapping);
        }
        if self.params.output_color_space == ColorSpace::Srgb {
            color = Vec3::new(linear_to_srgb(color.x), linear_to_srgb(color.y), linear_to_srgb(color.z));
        }
        if self.has(ProgramFeatures::PREMULTIPLIED_ALPHA) {
            color *= diffuse.w;
        }
        color.extend(diffuse.w)
    }

    /// Separable Gaussian over the moments on unit 0.
    fn blur(&self, frag: Vec3) -> Vec4 {
        let Some(source) = self.unit(units::MAP) else {
            return Vec4::ZERO;
        };
        let u = self.uniforms;
        let center = IVec2::new(frag.x as i32, frag.y as i32);
        let axis = if u.params.w > 0.5 { IVec2::Y } else { IVec2::X };
        let radius = (u.params.x as i32).max(1);
        let sigma = u.params.x.max(1.0) * 0.5;

        let mut sum = Vec2::ZERO;
        let mut weight = 0.0;
        for i in -radius..=radius {
            let texel = center + axis * i;
            let w = (-((i * i) as f32) / (2.0 * sigma * sigma)).exp();
            sum += source.load(texel.x, texel.y).xy() * w;
            weight += w;
        }
        let moments = sum / weight;
        Vec4::new(moments.x, moments.y, 0.0, 1.0)
    }
}

// ============================================================================
// Fixed-function state and attachments
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub(super) struct FixedState {
    pub blend: Option<BlendState>,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunction,
    pub color_mask: ColorWrites,
    pub cull_face: Option<Face>,
    pub front_face: FrontFace,
    pub stencil: Option<StencilConfig>,
    pub polygon_offset: Option<(f32, f32)>,
    pub viewport: Viewport,
    pub scissor: Option<Viewport>,
}

impl Default for FixedState {
    fn default() -> Self {
        Self {
            blend: None,
            depth_test: false,
            depth_write: true,
            depth_func: CompareFunction::Less,
            color_mask: ColorWrites::ALL,
            cull_face: None,
            front_face: FrontFace::Ccw,
            stencil: None,
            polygon_offset: None,
            viewport: Viewport::default(),
            scissor: None,
        }
    }
}

/// Attachments of the bound framebuffer.
pub(super) struct Attachments<'a> {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub color: &'a mut [Vec4],
    pub depth: Option<&'a mut [f32]>,
    pub stencil: Option<&'a mut [u8]>,
}

/// Rounds a color to what `format` can store. Values stay linear.
#[must_use]
pub(super) fn quantize(color: Vec4, format: TextureFormat) -> Vec4 {
    let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() / 255.0;
    match format {
        TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm => {
            Vec4::new(unorm(color.x), unorm(color.y), unorm(color.z), unorm(color.w))
        }
        TextureFormat::Rgba8UnormSrgb | TextureFormat::Bgra8UnormSrgb => {
            let srgb = |c: f32| srgb_to_linear(unorm(linear_to_srgb(c.clamp(0.0, 1.0))));
            Vec4::new(srgb(color.x), srgb(color.y), srgb(color.z), unorm(color.w))
        }
        _ => color,
    }
}

/// 8-bit encoding of a stored color for readback.
#[must_use]
pub(super) fn encode_rgba8(color: Vec4, format: TextureFormat) -> [u8; 4] {
    let byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    let srgb = matches!(format, TextureFormat::Rgba8UnormSrgb | TextureFormat::Bgra8UnormSrgb);
    let channel = |c: f32| if srgb { byte(linear_to_srgb(c.clamp(0.0, 1.0))) } else { byte(c) };
    [channel(color.x), channel(color.y), channel(color.z), byte(color.w)]
}

fn passes<T: PartialOrd>(func: CompareFunction, incoming: T, stored: T) -> bool {
    match func {
        CompareFunction::Never => false,
        CompareFunction::Less => incoming < stored,
        CompareFunction::Equal => incoming == stored,
        CompareFunction::LessEqual => incoming <= stored,
        CompareFunction::Greater => incoming > stored,
        CompareFunction::NotEqual => incoming != stored,
        CompareFunction::GreaterEqual => incoming >= stored,
        CompareFunction::Always => true,
    }
}

fn stencil_op(op: StencilOperation, current: u8, reference: u8) -> u8 {
    match op {
        StencilOperation::Keep => current,
        StencilOperation::Zero => 0,
        StencilOperation::Replace => reference,
        StencilOperation::Invert => !current,
        StencilOperation::IncrementClamp => current.saturating_add(1),
        StencilOperation::DecrementClamp => current.saturating_sub(1),
        StencilOperation::IncrementWrap => current.wrapping_add(1),
        StencilOperation::DecrementWrap => current.wrapping_sub(1),
    }
}

fn blend_factor(factor: BlendFactor, src: Vec4, dst: Vec4) -> Vec4 {
    match factor {
        BlendFactor::Zero => Vec4::ZERO,
        BlendFactor::One => Vec4::ONE,
        BlendFactor::Src => src,
        BlendFactor::OneMinusSrc => Vec4::ONE - src,
        BlendFactor::SrcAlpha => Vec4::splat(src.w),
        BlendFactor::OneMinusSrcAlpha => Vec4::splat(1.0 - src.w),
        BlendFactor::Dst => dst,
        BlendFactor::OneMinusDst => Vec4::ONE - dst,
        BlendFactor::DstAlpha => Vec4::splat(dst.w),
        BlendFactor::OneMinusDstAlpha => Vec4::splat(1.0 - dst.w),
        BlendFactor::SrcAlphaSaturated => {
            let f = src.w.min(1.0 - dst.w);
            Vec4::new(f, f, f, 1.0)
        }
        // Blend constant is black; dual-source factors are not emulated.
        _ => Vec4::ZERO,
    }
}

fn blend_component(component: BlendComponent, src: Vec4, dst: Vec4) -> Vec4 {
    let s = src * blend_factor(component.src_factor, src, dst);
    let d = dst * blend_factor(component.dst_factor, src, dst);
    match component.operation {
        BlendOperation::Add => s + d,
        BlendOperation::Subtract => s - d,
        BlendOperation::ReverseSubtract => d - s,
        BlendOperation::Min => src.min(dst),
        BlendOperation::Max => src.max(dst),
    }
}

#[must_use]
pub(super) fn blend(state: BlendState, src: Vec4, dst: Vec4) -> Vec4 {
    let color = blend_component(state.color, src, dst);
    let alpha = blend_component(state.alpha, src, dst);
    color.xyz().extend(alpha.w)
}

fn intersect(a: (u32, u32, u32, u32), rect: Viewport) -> (u32, u32, u32, u32) {
    (
        a.0.max(rect.x),
        a.1.max(rect.y),
        a.2.min(rect.x.saturating_add(rect.width)),
        a.3.min(rect.y.saturating_add(rect.height)),
    )
}

/// Pixel bounds `(x0, y0, x1, y1)`, exclusive end, fragments may touch.
fn draw_bounds(fixed: &FixedState, target: &Attachments<'_>) -> (u32, u32, u32, u32) {
    let mut bounds = intersect((0, 0, target.width, target.height), fixed.viewport);
    if let Some(scissor) = fixed.scissor {
        bounds = intersect(bounds, scissor);
    }
    bounds
}

/// Clears the bound attachments, honoring the scissor and write masks.
pub(super) fn clear(
    fixed: &FixedState,
    target: &mut Attachments<'_>,
    color: Option<Vec4>,
    depth: Option<f32>,
    stencil: Option<u32>,
) {
    let mut bounds = (0, 0, target.width, target.height);
    if let Some(scissor) = fixed.scissor {
        bounds = intersect(bounds, scissor);
    }
    let color = color.map(|c| quantize(c, target.format));
    let stencil_mask = fixed.stencil.map_or(0xff, |s| s.write_mask) as u8;

    for y in bounds.1..bounds.3 {
        for x in bounds.0..bounds.2 {
            let i = (y * target.width + x) as usize;
            if let Some(c) = color {
                write_masked(&mut target.color[i], c, fixed.color_mask);
            }
            if let (Some(d), Some(buffer)) = (depth, target.depth.as_deref_mut())
                && fixed.depth_write
            {
                buffer[i] = d;
            }
            if let (Some(s), Some(buffer)) = (stencil, target.stencil.as_deref_mut()) {
                buffer[i] = (s as u8 & stencil_mask) | (buffer[i] & !stencil_mask);
            }
        }
    }
}

fn write_masked(dst: &mut Vec4, value: Vec4, mask: ColorWrites) {
    if mask.contains(ColorWrites::RED) {
        dst.x = value.x;
    }
    if mask.contains(ColorWrites::GREEN) {
        dst.y = value.y;
    }
    if mask.contains(ColorWrites::BLUE) {
        dst.z = value.z;
    }
    if mask.contains(ColorWrites::ALPHA) {
        dst.w = value.w;
    }
}

// ============================================================================
// Fragment operations
// ============================================================================

/// Shades one fragment and runs stencil, depth, blend and write. Returns
/// whether the color attachment was written.
fn process_fragment(
    shader: &Shader<'_>,
    fixed: &FixedState,
    target: &mut Attachments<'_>,
    (x, y): (u32, u32),
    depth: f32,
    varyings: &Varyings,
    front_facing: bool,
) -> bool {
    let i = (y * target.width + x) as usize;
    let frag = Vec3::new(x as f32 + 0.5, y as f32 + 0.5, depth);
    let Some(color) = shader.fragment(varyings, frag, front_facing) else {
        return false;
    };

    let stencil = fixed.stencil.zip(target.stencil.as_deref_mut());
    if let Some((config, buffer)) = stencil {
        let reference = config.reference as u8;
        let read = config.read_mask as u8;
        let write = config.write_mask as u8;
        let current = buffer[i];
        let update = |op: StencilOperation| {
            let next = stencil_op(op, current, reference);
            (next & write) | (current & !write)
        };

        if !passes(config.face.compare, reference & read, current & read) {
            buffer[i] = update(config.face.fail_op);
            return false;
        }
        let depth_ok = !fixed.depth_test
            || target
                .depth
                .as_deref()
                .is_none_or(|d| passes(fixed.depth_func, depth, d[i]));
        if !depth_ok {
            buffer[i] = update(config.face.depth_fail_op);
            return false;
        }
        buffer[i] = update(config.face.pass_op);
    } else if fixed.depth_test
        && let Some(d) = target.depth.as_deref()
        && !passes(fixed.depth_func, depth, d[i])
    {
        return false;
    }

    if fixed.depth_test
        && fixed.depth_write
        && let Some(d) = target.depth.as_deref_mut()
    {
        d[i] = depth;
    }

    let dst = target.color[i];
    let out = match fixed.blend {
        Some(state) => blend(state, color, dst),
        None => color,
    };
    write_masked(&mut target.color[i], quantize(out, target.format), fixed.color_mask);
    true
}

// ============================================================================
// Primitive assembly
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ScreenVertex {
    /// Window x, y and depth.
    pos: Vec3,
    inv_w: f32,
    varyings: Varyings,
}

fn to_screen(v: &Varyings, vp: Viewport) -> ScreenVertex {
    let inv_w = 1.0 / v.clip.w;
    let ndc = v.clip.xyz() * inv_w;
    ScreenVertex {
        pos: Vec3::new(
            vp.x as f32 + (ndc.x * 0.5 + 0.5) * vp.width as f32,
            vp.y as f32 + (0.5 - ndc.y * 0.5) * vp.height as f32,
            ndc.z,
        ),
        inv_w,
        varyings: *v,
    }
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

/// Top-left rule for a positively oriented triangle in window space.
fn is_top_left(a: Vec2, b: Vec2) -> bool {
    (a.y == b.y && b.x > a.x) || b.y < a.y
}

fn covers(w: f32, a: Vec2, b: Vec2) -> bool {
    w > 0.0 || (w == 0.0 && is_top_left(a, b))
}

/// Sutherland-Hodgman against the `z >= 0` near plane.
fn clip_near(triangle: [Varyings; 3]) -> SmallVec<[Varyings; 4]> {
    let mut out = SmallVec::new();
    for i in 0..3 {
        let a = &triangle[i];
        let b = &triangle[(i + 1) % 3];
        let (da, db) = (a.clip.z, b.clip.z);
        if da >= 0.0 {
            out.push(*a);
        }
        if (da >= 0.0) != (db >= 0.0) {
            out.push(a.lerp(b, da / (da - db)));
        }
    }
    out
}

pub(super) fn draw_triangle(
    shader: &Shader<'_>,
    fixed: &FixedState,
    target: &mut Attachments<'_>,
    triangle: [Varyings; 3],
) -> u64 {
    let polygon = clip_near(triangle);
    if polygon.len() < 3 {
        return 0;
    }
    let screen: SmallVec<[ScreenVertex; 4]> = polygon.iter().map(|v| to_screen(v, fixed.viewport)).collect();
    (1..screen.len() - 1)
        .map(|i| raster_triangle(shader, fixed, target, [&screen[0], &screen[i], &screen[i + 1]]))
        .sum()
}

fn raster_triangle(
    shader: &Shader<'_>,
    fixed: &FixedState,
    target: &mut Attachments<'_>,
    v: [&ScreenVertex; 3],
) -> u64 {
    let area = edge(v[0].pos.xy(), v[1].pos.xy(), v[2].pos.xy());
    if area == 0.0 || !area.is_finite() {
        return 0;
    }
    // Window y points down, so counter-clockwise in NDC is negative here.
    let front = match fixed.front_face {
        FrontFace::Ccw => area < 0.0,
        FrontFace::Cw => area > 0.0,
    };
    match fixed.cull_face {
        Some(Face::Back) if !front => return 0,
        Some(Face::Front) if front => return 0,
        _ => {}
    }
    let v = if area < 0.0 { [v[0], v[2], v[1]] } else { v };
    let area = area.abs();

    let bounds = draw_bounds(fixed, target);
    let xs = v.map(|s| s.pos.x);
    let ys = v.map(|s| s.pos.y);
    let min_x = (xs.iter().copied().fold(f32::INFINITY, f32::min).floor().max(0.0) as u32).max(bounds.0);
    let max_x = (xs.iter().copied().fold(f32::NEG_INFINITY, f32::max).ceil().max(0.0) as u32).min(bounds.2);
    let min_y = (ys.iter().copied().fold(f32::INFINITY, f32::min).floor().max(0.0) as u32).max(bounds.1);
    let max_y = (ys.iter().copied().fold(f32::NEG_INFINITY, f32::max).ceil().max(0.0) as u32).min(bounds.3);

    let offset = fixed.polygon_offset.map_or(0.0, |(factor, units)| {
        let e1 = v[1].pos - v[0].pos;
        let e2 = v[2].pos - v[0].pos;
        let dzdx = (e1.z * e2.y - e2.z * e1.y) / area;
        let dzdy = (e2.z * e1.x - e1.z * e2.x) / area;
        factor * dzdx.abs().max(dzdy.abs()) + units * DEPTH_UNIT
    });

    let (p0, p1, p2) = (v[0].pos.xy(), v[1].pos.xy(), v[2].pos.xy());
    let mut written = 0;
    for y in min_y..max_y {
        for x in min_x..max_x {
            let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let w0 = edge(p1, p2, p);
            let w1 = edge(p2, p0, p);
            let w2 = edge(p0, p1, p);
            if !(covers(w0, p1, p2) && covers(w1, p2, p0) && covers(w2, p0, p1)) {
                continue;
            }
            let b = [w0 / area, w1 / area, w2 / area];
            let depth = b[0] * v[0].pos.z + b[1] * v[1].pos.z + b[2] * v[2].pos.z + offset;
            if !(0.0..=1.0).contains(&depth) {
                continue;
            }
            let pw = [b[0] * v[0].inv_w, b[1] * v[1].inv_w, b[2] * v[2].inv_w];
            let sum = pw[0] + pw[1] + pw[2];
            if sum == 0.0 {
                continue;
            }
            let varyings = Varyings::weighted(
                [&v[0].varyings, &v[1].varyings, &v[2].varyings],
                [pw[0] / sum, pw[1] / sum, pw[2] / sum],
            );
            if process_fragment(shader, fixed, target, (x, y), depth, &varyings, front) {
                written += 1;
            }
        }
    }
    written
}

pub(super) fn draw_line(
    shader: &Shader<'_>,
    fixed: &FixedState,
    target: &mut Attachments<'_>,
    a: Varyings,
    b: Varyings,
) -> u64 {
    let (da, db) = (a.clip.z, b.clip.z);
    if da < 0.0 && db < 0.0 {
        return 0;
    }
    let (a, b) = match (da >= 0.0, db >= 0.0) {
        (true, false) => (a, a.lerp(&b, da / (da - db))),
        (false, true) => (a.lerp(&b, da / (da - db)), b),
        _ => (a, b),
    };

    let bounds = draw_bounds(fixed, target);
    let sa = to_screen(&a, fixed.viewport);
    let sb = to_screen(&b, fixed.viewport);
    let delta = sb.pos - sa.pos;
    let steps = delta.x.abs().max(delta.y.abs()).ceil().max(1.0) as u32;

    let mut written = 0;
    let mut last = None;
    for step in 0..steps {
        let t = step as f32 / steps as f32;
        let p = sa.pos + delta * t;
        if p.x < 0.0 || p.y < 0.0 {
            continue;
        }
        let (x, y) = (p.x as u32, p.y as u32);
        if last == Some((x, y)) || x < bounds.0 || x >= bounds.2 || y < bounds.1 || y >= bounds.3 {
            continue;
        }
        last = Some((x, y));
        if !(0.0..=1.0).contains(&p.z) {
            continue;
        }
        let wa = (1.0 - t) * sa.inv_w;
        let wb = t * sb.inv_w;
        let varyings = sa.varyings.lerp(&sb.varyings, wb / (wa + wb));
        if process_fragment(shader, fixed, target, (x, y), p.z, &varyings, true) {
            written += 1;
        }
    }
    written
}

pub(super) fn draw_point(shader: &Shader<'_>, fixed: &FixedState, target: &mut Attachments<'_>, v: Varyings) -> u64 {
    if v.clip.z < 0.0 || v.clip.w <= 0.0 {
        return 0;
    }
    let s = to_screen(&v, fixed.viewport);
    if !(0.0..=1.0).contains(&s.pos.z) {
        return 0;
    }
    let bounds = draw_bounds(fixed, target);
    let size = shader.uniforms.params.x.max(1.0);
    let x0 = (s.pos.x - size * 0.5).round() as i64;
    let y0 = (s.pos.y - size * 0.5).round() as i64;
    let extent = size.round() as i64;

    let mut written = 0;
    for y in y0.max(i64::from(bounds.1))..(y0 + extent).min(i64::from(bounds.3)) {
        for x in x0.max(i64::from(bounds.0))..(x0 + extent).min(i64::from(bounds.2)) {
            if process_fragment(shader, fixed, target, (x as u32, y as u32), s.pos.z, &v, true) {
                written += 1;
            }
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_faces_follow_major_axis() {
        assert_eq!(cube_face(Vec3::new(2.0, 1.0, 0.0)), 0);
        assert_eq!(cube_face(Vec3::new(-2.0, 1.0, 0.0)), 1);
        assert_eq!(cube_face(Vec3::new(0.0, 3.0, 1.0)), 2);
        assert_eq!(cube_face(Vec3::new(0.0, -3.0, 1.0)), 3);
        assert_eq!(cube_face(Vec3::new(0.0, 0.5, 1.0)), 4);
        assert_eq!(cube_face(Vec3::new(0.0, 0.5, -1.0)), 5);
    }

    #[test]
    fn unorm_targets_store_bytes() {
        let q = quantize(Vec4::new(0.5, 1.5, -0.2, 1.0), TextureFormat::Rgba8Unorm);
        assert_eq!(encode_rgba8(q, TextureFormat::Rgba8Unorm), [128, 255, 0, 255]);
    }

    #[test]
    fn source_over_blend_mixes_halfway() {
        let state = BlendState::ALPHA_BLENDING;
        let out = blend(state, Vec4::new(1.0, 1.0, 1.0, 0.5), Vec4::new(1.0, 0.0, 0.0, 1.0));
        assert!((out.x - 1.0).abs() < 1e-6);
        assert!((out.y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn adjacent_triangles_share_no_pixels() {
        // Two triangles covering a 4x4 quad: every pixel is hit exactly once.
        let a = Vec2::new(0.0, 0.0);
        let b = Vec2::new(4.0, 0.0);
        let c = Vec2::new(4.0, 4.0);
        let d = Vec2::new(0.0, 4.0);
        let mut hits = [[0_u8; 4]; 4];
        for tri in [[a, b, c], [a, c, d]] {
            for (y, row) in hits.iter_mut().enumerate() {
                for (x, hit) in row.iter_mut().enumerate() {
                    let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                    let inside = covers(edge(tri[1], tri[2], p), tri[1], tri[2])
                        && covers(edge(tri[2], tri[0], p), tri[2], tri[0])
                        && covers(edge(tri[0], tri[1], p), tri[0], tri[1]);
                    if inside {
                        *hit += 1;
                    }
                }
            }
        }
        assert!(hits.iter().flatten().all(|&h| h == 1));
    }
}
