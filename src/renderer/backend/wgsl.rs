//! WGSL front end shared by the backends.
//!
//! Each stage is parsed and validated with naga before a program id is
//! handed out. A failing stage reports naga's diagnostic followed by the
//! numbered source around the offending line. Validated modules are also
//! reflected: the GPU backend builds its bind group and vertex layouts from
//! the resources and inputs found here.

use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, Binding, ImageClass, Module, ScalarKind, ShaderStage, TypeInner, VectorSize};

use super::{ProgramDescriptor, ProgramDiagnostics};

pub const VERTEX_ENTRY: &str = "vs_main";
pub const FRAGMENT_ENTRY: &str = "fs_main";

/// Both stages of a program that passed validation and linking.
#[derive(Debug)]
pub struct CheckedProgram {
    pub vertex: Module,
    pub fragment: Module,
}

/// What a `@group(g) @binding(b)` global holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Uniform,
    /// Float texture. Filterable when a sampler is declared at the next
    /// binding of the same group; textures read with `textureLoad` only
    /// accept unfilterable formats such as shadow maps.
    Texture { filterable: bool },
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resource {
    pub group: u32,
    pub binding: u32,
    pub kind: ResourceKind,
}

/// A `@location` input of the vertex entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexInput {
    pub location: u32,
    pub format: wgpu::VertexFormat,
}

/// naga's report plus the source lines around the first span.
fn report(source: &str, emitted: String, line: Option<u32>) -> String {
    let mut log = emitted;
    if let Some(line) = line {
        if !log.ends_with('\n') {
            log.push('\n');
        }
        log.push_str(&ProgramDiagnostics::source_context(source, line as usize));
    }
    log
}

/// Parses and validates one stage, which must define `entry` for `stage`.
pub fn check_stage(source: &str, stage: ShaderStage, entry: &str) -> Result<Module, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| {
        let line = e.location(source).map(|l| l.line_number);
        report(source, e.emit_to_string(source), line)
    })?;

    Validator::new(ValidationFlags::all(), Capabilities::default())
        .validate(&module)
        .map_err(|e| {
            let line = e.location(source).map(|l| l.line_number);
            report(source, e.emit_to_string(source), line)
        })?;

    if !module.entry_points.iter().any(|ep| ep.name == entry && ep.stage == stage) {
        return Err(format!("error: entry point '{entry}' not found for the {stage:?} stage\n"));
    }
    Ok(module)
}

/// Validates both stages and checks that every fragment input is written by
/// the vertex stage.
pub fn check_program(descriptor: &ProgramDescriptor<'_>) -> Result<CheckedProgram, ProgramDiagnostics> {
    let vertex = check_stage(descriptor.vertex_source, ShaderStage::Vertex, VERTEX_ENTRY);
    let fragment = check_stage(descriptor.fragment_source, ShaderStage::Fragment, FRAGMENT_ENTRY);

    let (vertex, fragment) = match (vertex, fragment) {
        (Ok(vertex), Ok(fragment)) => (vertex, fragment),
        (vertex, fragment) => {
            return Err(ProgramDiagnostics {
                runnable: false,
                vertex_log: vertex.err().unwrap_or_default(),
                fragment_log: fragment.err().unwrap_or_default(),
                program_log: format!("program '{}' failed to compile", descriptor.label),
            });
        }
    };

    let written = stage_locations(&vertex, VERTEX_ENTRY, false);
    let missing: Vec<u32> = stage_locations(&fragment, FRAGMENT_ENTRY, true)
        .into_iter()
        .filter(|location| !written.contains(location))
        .collect();
    if !missing.is_empty() {
        return Err(ProgramDiagnostics {
            runnable: false,
            program_log: format!(
                "program '{}' failed to link: fragment inputs {missing:?} are not written by the vertex stage",
                descriptor.label
            ),
            ..Default::default()
        });
    }

    Ok(CheckedProgram { vertex, fragment })
}

/// `@location`s of an entry point's inputs, or of its result.
fn stage_locations(module: &Module, entry: &str, inputs: bool) -> Vec<u32> {
    let Some(ep) = module.entry_points.iter().find(|ep| ep.name == entry) else {
        return Vec::new();
    };
    let mut locations = Vec::new();
    let mut visit = |binding: Option<&Binding>, ty: naga::Handle<naga::Type>| match binding {
        Some(Binding::Location { location, .. }) => locations.push(*location),
        Some(Binding::BuiltIn(_)) => {}
        None => {
            if let TypeInner::Struct { members, .. } = &module.types[ty].inner {
                locations.extend(members.iter().filter_map(|m| match m.binding {
                    Some(Binding::Location { location, .. }) => Some(location),
                    _ => None,
                }));
            }
        }
    };
    if inputs {
        for arg in &ep.function.arguments {
            visit(arg.binding.as_ref(), arg.ty);
        }
    } else if let Some(result) = &ep.function.result {
        visit(result.binding.as_ref(), result.ty);
    }
    locations.sort_unstable();
    locations.dedup();
    locations
}

/// Resource bindings of both stages, sorted by group and binding.
#[must_use]
pub fn resources(program: &CheckedProgram) -> Vec<Resource> {
    let mut found: Vec<(u32, u32, bool)> = Vec::new();
    let mut textures: Vec<(u32, u32)> = Vec::new();
    let mut samplers: Vec<(u32, u32)> = Vec::new();

    for module in [&program.vertex, &program.fragment] {
        for (_, global) in module.global_variables.iter() {
            let Some(binding) = &global.binding else {
                continue;
            };
            let key = (binding.group, binding.binding);
            match (&global.space, &module.types[global.ty].inner) {
                (AddressSpace::Uniform, _) => found.push((key.0, key.1, false)),
                (AddressSpace::Handle, TypeInner::Image { class, .. }) => {
                    if matches!(class, ImageClass::Sampled { .. } | ImageClass::Depth { .. }) {
                        textures.push(key);
                        found.push((key.0, key.1, true));
                    }
                }
                (AddressSpace::Handle, TypeInner::Sampler { .. }) => {
                    samplers.push(key);
                    found.push((key.0, key.1, true));
                }
                _ => {}
            }
        }
    }

    found.sort_unstable();
    found.dedup();
    found
        .into_iter()
        .map(|(group, binding, handle)| {
            let kind = if !handle {
                ResourceKind::Uniform
            } else if textures.contains(&(group, binding)) {
                ResourceKind::Texture {
                    filterable: samplers.contains(&(group, binding + 1)),
                }
            } else {
                ResourceKind::Sampler
            };
            Resource { group, binding, kind }
        })
        .collect()
}

/// Byte size of the uniform declared at `@group(group) @binding(binding)`
/// in either stage.
#[must_use]
pub fn uniform_size(program: &CheckedProgram, group: u32, binding: u32) -> Option<u64> {
    [&program.vertex, &program.fragment].into_iter().find_map(|module| {
        let (_, global) = module.global_variables.iter().find(|(_, g)| {
            g.space == AddressSpace::Uniform
                && g.binding.as_ref().is_some_and(|b| b.group == group && b.binding == binding)
        })?;
        let mut layouter = naga::proc::Layouter::default();
        layouter.update(module.to_ctx()).ok()?;
        Some(u64::from(layouter[global.ty].size))
    })
}

/// Float `@location` inputs of the vertex entry point, sorted by location.
#[must_use]
pub fn vertex_inputs(module: &Module) -> Vec<VertexInput> {
    let Some(ep) = module.entry_points.iter().find(|ep| ep.name == VERTEX_ENTRY) else {
        return Vec::new();
    };
    let mut inputs = Vec::new();
    let mut push = |location: u32, ty: naga::Handle<naga::Type>| {
        let format = match module.types[ty].inner {
            TypeInner::Scalar(s) if s.kind == ScalarKind::Float => wgpu::VertexFormat::Float32,
            TypeInner::Vector { size, scalar } if scalar.kind == ScalarKind::Float => match size {
                VectorSize::Bi => wgpu::VertexFormat::Float32x2,
                VectorSize::Tri => wgpu::VertexFormat::Float32x3,
                VectorSize::Quad => wgpu::VertexFormat::Float32x4,
            },
            _ => return,
        };
        inputs.push(VertexInput { location, format });
    };
    for arg in &ep.function.arguments {
        match &arg.binding {
            Some(Binding::Location { location, .. }) => push(*location, arg.ty),
            Some(Binding::BuiltIn(_)) => {}
            None => {
                if let TypeInner::Struct { members, .. } = &module.types[arg.ty].inner {
                    for member in members {
                        if let Some(Binding::Location { location, .. }) = member.binding {
                            push(location, member.ty);
                        }
                    }
                }
            }
        }
    }
    inputs.sort_unstable_by_key(|i| i.location);
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::program::{
        LightCounts, ProgramEnvironment, ProgramParameters, ShaderGenerator, ShadowMapType, ToneMapping,
    };
    use crate::resources::{ColorSpace, Material};
    use crate::scene::DrawMode;

    fn generated(material: &Material, lights: LightCounts) -> CheckedProgram {
        let env = ProgramEnvironment {
            lights,
            shadow_map_type: ShadowMapType::Pcf,
            tone_mapping: ToneMapping::None,
            output_color_space: ColorSpace::Srgb,
            receive_shadow: true,
            has_vertex_colors: false,
            draw_mode: DrawMode::Triangles,
        };
        let params = ProgramParameters::for_material(material, &env);
        let shader = ShaderGenerator::generate(&params).unwrap();
        check_program(&ProgramDescriptor {
            label: "generated",
            vertex_source: &shader.vertex,
            fragment_source: &shader.fragment,
            parameters: &params,
        })
        .unwrap()
    }

    #[test]
    fn type_errors_are_rejected_with_context() {
        let source = "@fragment\nfn fs_main() -> @location(0) vec4<f32> {\n    let x: i32 = undefined_symbol * true;\n    return vec4<f32>(x);\n}\n";
        let log = check_stage(source, ShaderStage::Fragment, FRAGMENT_ENTRY).unwrap_err();
        assert!(log.contains("undefined_symbol"), "{log}");
        assert!(log.contains(">   3:     let x: i32"), "{log}");
    }

    #[test]
    fn missing_entry_point_is_reported() {
        let source = "@fragment\nfn main() -> @location(0) vec4<f32> {\n    return vec4<f32>(1.0);\n}\n";
        let log = check_stage(source, ShaderStage::Fragment, FRAGMENT_ENTRY).unwrap_err();
        assert!(log.contains("'fs_main' not found"), "{log}");
    }

    #[test]
    fn unwritten_fragment_input_fails_to_link() {
        let parameters = ProgramParameters::utility("custom", crate::renderer::program::ShadingModel::Custom);
        let diagnostics = check_program(&ProgramDescriptor {
            label: "varyings",
            vertex_source: "@vertex\nfn vs_main() -> @builtin(position) vec4<f32> {\n    return vec4<f32>(0.0);\n}\n",
            fragment_source: "@fragment\nfn fs_main(@location(2) uv: vec2<f32>) -> @location(0) vec4<f32> {\n    return vec4<f32>(uv, 0.0, 1.0);\n}\n",
            parameters: &parameters,
        })
        .unwrap_err();
        assert!(diagnostics.vertex_log.is_empty() && diagnostics.fragment_log.is_empty());
        assert!(diagnostics.program_log.contains("[2]"), "{}", diagnostics.program_log);
    }

    #[test]
    fn lit_program_reflects_lights_and_shadow_maps() {
        let lights = LightCounts {
            directional: 1,
            directional_shadows: 1,
            ..LightCounts::default()
        };
        let program = generated(&Material::new_lambert(glam::Vec3::ONE), lights);
        let resources = resources(&program);

        assert!(resources.contains(&Resource {
            group: 0,
            binding: 0,
            kind: ResourceKind::Uniform
        }));
        assert!(resources.contains(&Resource {
            group: 1,
            binding: 1,
            kind: ResourceKind::Uniform
        }));
        // Shadow maps are read with textureLoad and have no sampler.
        assert!(resources.contains(&Resource {
            group: 3,
            binding: 0,
            kind: ResourceKind::Texture { filterable: false }
        }));

        let inputs = vertex_inputs(&program.vertex);
        assert_eq!(inputs.iter().map(|i| i.location).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(inputs[0].format, wgpu::VertexFormat::Float32x3);
        assert_eq!(inputs[2].format, wgpu::VertexFormat::Float32x2);
    }

    #[test]
    fn sampled_map_is_filterable() {
        let mut material = Material::new_basic(glam::Vec3::ONE);
        material.set_map(Some(crate::resources::TextureHandle::default()));
        let program = generated(&material, LightCounts::default());

        let resources = resources(&program);
        assert!(resources.contains(&Resource {
            group: 2,
            binding: 0,
            kind: ResourceKind::Texture { filterable: true }
        }));
        assert!(resources.contains(&Resource {
            group: 2,
            binding: 1,
            kind: ResourceKind::Sampler
        }));
    }
}
