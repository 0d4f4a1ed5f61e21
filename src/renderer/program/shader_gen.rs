//! Shader Code Generator
//!
//! Renders WGSL from minijinja templates embedded in the binary. Program
//! parameters become the template context: feature bits and material
//! defines are flattened into top-level variables, light counts are exposed
//! as numbers.
//!
//! Template syntax: blocks use `{$ ... $}`, expressions `{{ ... }}`, and a
//! line starting with `$$` is a statement. `{$ include "name" $}` resolves to
//! `chunks/name.wgsl`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use minijinja::value::{Object, Value};
use minijinja::{Environment, Error, ErrorKind, syntax::SyntaxConfig};
use rust_embed::RustEmbed;
use serde::Serialize;

use crate::errors::Result;
use crate::renderer::program::parameters::{ProgramFeatures, ProgramParameters};

static SHADER_ENV: OnceLock<Environment<'static>> = OnceLock::new();

#[derive(RustEmbed)]
#[folder = "src/renderer/program/shaders"]
struct ShaderAssets;

fn syntax() -> std::result::Result<SyntaxConfig, Error> {
    SyntaxConfig::builder()
        .block_delimiters("{$", "$}")
        .variable_delimiters("{{", "}}")
        .line_statement_prefix("$$")
        .build()
}

pub(crate) fn get_env() -> &'static Environment<'static> {
    SHADER_ENV.get_or_init(|| {
        let mut env = Environment::new();

        match syntax() {
            Ok(syntax) => env.set_syntax(syntax),
            Err(e) => log::error!("Invalid shader template syntax: {e}"),
        }
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_undefined_behavior(minijinja::UndefinedBehavior::SemiStrict);

        env.set_loader(shader_loader);
        env.set_path_join_callback(|name, _parent| format!("chunks/{name}").into());

        env
    })
}

fn shader_loader(name: &str) -> std::result::Result<Option<String>, Error> {
    let filename = if std::path::Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wgsl"))
    {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("{name}.wgsl"))
    };

    #[cfg(debug_assertions)]
    {
        let path = std::path::Path::new("src/renderer/program/shaders").join(filename.as_ref());
        if path.exists() {
            return std::fs::read_to_string(&path).map(Some).map_err(|e| {
                Error::new(ErrorKind::TemplateNotFound, format!("Failed to read file: {e}"))
            });
        }
    }

    if let Some(file) = ShaderAssets::get(&filename)
        && let Ok(source) = std::str::from_utf8(file.data.as_ref())
    {
        return Ok(Some(source.to_string()));
    }

    Ok(None)
}

/// Hands out sequential `@location` indices during one render.
#[derive(Debug, Default)]
pub struct LocationAllocator {
    counter: AtomicU32,
}

impl LocationAllocator {
    pub fn next(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Object for LocationAllocator {
    fn call_method(
        self: &Arc<Self>,
        _state: &minijinja::State,
        name: &str,
        _args: &[Value],
    ) -> std::result::Result<Value, Error> {
        if name == "next" {
            Ok(Value::from(self.next()))
        } else {
            Err(Error::new(ErrorKind::UnknownMethod, format!("method {name} not found")))
        }
    }
}

#[derive(Serialize)]
struct ShaderContext<'a> {
    #[serde(flatten)]
    defines: BTreeMap<&'a str, &'a str>,
    shading: &'static str,
    num_dir_lights: u32,
    num_point_lights: u32,
    num_spot_lights: u32,
    num_dir_shadows: u32,
    num_point_shadows: u32,
    num_spot_shadows: u32,
    num_shadows: u32,
    shadow_map_type: String,
    tone_mapping: String,
    output_srgb: bool,
    loc: Value,
}

/// Vertex and fragment source of one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedShader {
    pub vertex: String,
    pub fragment: String,
}

pub struct ShaderGenerator;

impl ShaderGenerator {
    fn context(params: &ProgramParameters) -> ShaderContext<'static> {
        let mut defines: BTreeMap<&'static str, &'static str> = params.defines.to_map();
        for (flag, name) in ProgramFeatures::DEFINE_NAMES {
            if params.features.contains(flag) {
                defines.insert(name, "1");
            }
        }
        let l = &params.lights;

        ShaderContext {
            defines,
            shading: params.shading.name(),
            num_dir_lights: l.directional,
            num_point_lights: l.point,
            num_spot_lights: l.spot,
            num_dir_shadows: l.directional_shadows,
            num_point_shadows: l.point_shadows,
            num_spot_shadows: l.spot_shadows,
            num_shadows: l.shadow_count(),
            shadow_map_type: format!("{:?}", params.shadow_map_type).to_lowercase(),
            tone_mapping: format!("{:?}", params.tone_mapping).to_lowercase(),
            output_srgb: params.output_color_space == crate::resources::ColorSpace::Srgb,
            loc: Value::from_object(LocationAllocator::default()),
        }
    }

    /// Renders both stages. Custom materials render their own sources with
    /// the same context, so they can include chunks.
    pub fn generate(params: &ProgramParameters) -> Result<GeneratedShader> {
        let env = get_env();

        let (vertex, fragment) = if let Some(custom) = &params.custom_source {
            (
                env.render_str(&custom.vertex, Self::context(params))?,
                env.render_str(&custom.fragment, Self::context(params))?,
            )
        } else {
            (
                env.get_template("vertex")?.render(Self::context(params))?,
                env.get_template(params.template)?.render(Self::context(params))?,
            )
        };

        Ok(GeneratedShader {
            vertex: format!("// === Auto-generated vertex stage ({}) ===\n{vertex}", params.template),
            fragment: format!("// === Auto-generated fragment stage ({}) ===\n{fragment}", params.template),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::program::parameters::{LightCounts, ShadingModel};

    #[test]
    fn features_reach_the_template() {
        let mut params = ProgramParameters::utility("basic", ShadingModel::Basic);
        params.features = ProgramFeatures::USE_MAP;
        let shader = ShaderGenerator::generate(&params).unwrap();
        assert!(shader.fragment.contains("t_map"));
        assert!(shader.fragment.contains("fn fs_main"));
        assert!(shader.vertex.contains("fn vs_main"));
    }

    #[test]
    fn light_arrays_follow_counts() {
        let mut params = ProgramParameters::utility("lit", ShadingModel::Lambert);
        params.lights = LightCounts {
            directional: 2,
            ..LightCounts::default()
        };
        let shader = ShaderGenerator::generate(&params).unwrap();
        assert!(shader.fragment.contains("array<DirectionalLight, 2>"));
        assert!(!shader.fragment.contains("array<PointLight"));
    }
}
