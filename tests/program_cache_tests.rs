//! Program Cache Tests
//!
//! Tests for:
//! - Cache keys derived from semantic configuration only
//! - Sharing and reference counting of programs
//! - Failed compiles kept with diagnostics
//! - Recompilation after invalidation (context restore)

use glam::Vec3;
use myth_forward::SoftwareBackend;
use myth_forward::renderer::program::{
    LightCounts, ProgramCache, ProgramEnvironment, ProgramFeatures, ProgramParameters, ShadingModel, ShadowMapType,
    ToneMapping,
};
use myth_forward::resources::{ColorSpace, Material, Side};
use myth_forward::scene::DrawMode;

const VERTEX: &str = "@vertex\nfn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {\n    return vec4<f32>(position, 1.0);\n}\n";
const FRAGMENT: &str = "@fragment\nfn fs_main() -> @location(0) vec4<f32> {\n    return vec4<f32>(1.0, 0.0, 1.0, 1.0);\n}\n";

fn env() -> ProgramEnvironment {
    ProgramEnvironment {
        lights: LightCounts {
            directional: 1,
            directional_shadows: 1,
            ..LightCounts::default()
        },
        shadow_map_type: ShadowMapType::Pcf,
        tone_mapping: ToneMapping::None,
        output_color_space: ColorSpace::Srgb,
        receive_shadow: true,
        has_vertex_colors: false,
        draw_mode: DrawMode::Triangles,
    }
}

fn backend() -> SoftwareBackend {
    SoftwareBackend::new(16, 16).unwrap()
}

// ============================================================================
// Cache keys
// ============================================================================

#[test]
fn identical_materials_share_a_key() {
    let a = Material::new_lambert(Vec3::X);
    let b = Material::new_lambert(Vec3::Y);

    let ka = ProgramParameters::for_material(&a, &env()).cache_key();
    let kb = ProgramParameters::for_material(&b, &env()).cache_key();

    assert_eq!(ka, kb);
}

#[test]
fn program_affecting_settings_change_the_key() {
    let base = Material::new_lambert(Vec3::ONE);
    let base_key = ProgramParameters::for_material(&base, &env()).cache_key();

    let mut double = Material::new_lambert(Vec3::ONE);
    double.render_state_mut().side = Side::Double;
    assert_ne!(ProgramParameters::for_material(&double, &env()).cache_key(), base_key);

    let mut srgb_out = env();
    srgb_out.output_color_space = ColorSpace::LinearSrgb;
    assert_ne!(ProgramParameters::for_material(&base, &srgb_out).cache_key(), base_key);

    let mut defined = Material::new_lambert(Vec3::ONE);
    defined.defines_mut().set("QUALITY", "2");
    assert_ne!(ProgramParameters::for_material(&defined, &env()).cache_key(), base_key);
}

#[test]
fn unlit_materials_ignore_lights() {
    let basic = Material::new_basic(Vec3::ONE);
    let params = ProgramParameters::for_material(&basic, &env());

    assert_eq!(params.lights, LightCounts::default());
    assert!(!params.features.contains(ProgramFeatures::USE_SHADOWMAP));
}

#[test]
fn shadows_only_for_receivers() {
    let lambert = Material::new_lambert(Vec3::ONE);
    let receiving = ProgramParameters::for_material(&lambert, &env());
    let mut no_receive = env();
    no_receive.receive_shadow = false;
    let not_receiving = ProgramParameters::for_material(&lambert, &no_receive);

    assert!(receiving.features.contains(ProgramFeatures::USE_SHADOWMAP));
    assert!(!not_receiving.features.contains(ProgramFeatures::USE_SHADOWMAP));
    assert_eq!(not_receiving.lights.directional, 1);
}

#[test]
fn tone_mapping_respects_material_opt_out() {
    let mut tone_env = env();
    tone_env.tone_mapping = ToneMapping::AcesFilmic;

    let mapped = ProgramParameters::for_material(&Material::new_basic(Vec3::ONE), &tone_env);
    let mut raw = Material::new_basic(Vec3::ONE);
    raw.set_tone_mapped(false);
    let unmapped = ProgramParameters::for_material(&raw, &tone_env);

    assert_eq!(mapped.tone_mapping, ToneMapping::AcesFilmic);
    assert_eq!(unmapped.tone_mapping, ToneMapping::None);
}

#[test]
fn custom_sources_enter_the_key() {
    let a = Material::new_shader(VERTEX, FRAGMENT);
    let b = Material::new_shader(VERTEX, FRAGMENT.replace("0.0, 1.0, 1.0", "1.0, 1.0, 1.0"));

    let ka = ProgramParameters::for_material(&a, &env()).cache_key();
    let kb = ProgramParameters::for_material(&b, &env()).cache_key();

    assert_ne!(ka, kb);
    assert_eq!(ProgramParameters::for_material(&a, &env()).shading, ShadingModel::Custom);
}

// ============================================================================
// Reference counting
// ============================================================================

#[test]
fn acquire_shares_and_release_destroys() {
    let mut backend = backend();
    let mut cache = ProgramCache::new();
    let params = ProgramParameters::for_material(&Material::new_phong(Vec3::ONE, 20.0), &env());
    let key = params.cache_key();

    let first = cache.acquire_program(&mut backend, &params, &key);
    let second = cache.acquire_program(&mut backend, &params, &key);

    assert_eq!(first, second);
    assert_eq!(cache.program_count(), 1);
    assert_eq!(cache.compile_count(), 1);
    assert_eq!(cache.get(first).unwrap().used_times, 2);
    assert_eq!(backend.program_count(), 1);

    cache.release_program(&mut backend, first);
    assert_eq!(cache.program_count(), 1);
    assert!(cache.program_id(&mut backend, first).is_some());

    cache.release_program(&mut backend, second);
    assert_eq!(cache.program_count(), 0);
    assert_eq!(backend.program_count(), 0);
    assert!(cache.handle_for_key(&key).is_none());
}

#[test]
fn reacquire_after_release_compiles_again() {
    let mut backend = backend();
    let mut cache = ProgramCache::new();
    let params = ProgramParameters::for_material(&Material::new_basic(Vec3::ONE), &env());
    let key = params.cache_key();

    let handle = cache.acquire_program(&mut backend, &params, &key);
    cache.release_program(&mut backend, handle);
    let again = cache.acquire_program(&mut backend, &params, &key);

    assert_eq!(cache.compile_count(), 2);
    assert!(cache.program_id(&mut backend, again).is_some());
}

// ============================================================================
// Failures and invalidation
// ============================================================================

#[test]
fn failed_program_keeps_diagnostics_and_yields_no_id() {
    let mut backend = backend();
    let mut cache = ProgramCache::new();
    let broken = Material::new_shader(VERTEX, "@fragment\nfn fs_main( -> @location(0) vec4<f32> {\n");
    let params = ProgramParameters::for_material(&broken, &env());
    let key = params.cache_key();

    let handle = cache.acquire_program(&mut backend, &params, &key);

    assert!(cache.program_id(&mut backend, handle).is_none());
    let diagnostics = cache.diagnostics(handle).unwrap();
    assert!(!diagnostics.runnable);
    assert!(diagnostics.vertex_log.is_empty());
    // The parser's report is followed by the numbered source, error line
    // marked. Line 1 is the generated header.
    assert!(
        diagnostics.fragment_log.contains(">   3: fn fs_main( -> @location(0) vec4<f32> {"),
        "{}",
        diagnostics.fragment_log
    );
    assert_eq!(cache.failures().count(), 1);

    // Reported once: further lookups do not retry.
    cache.program_id(&mut backend, handle);
    assert_eq!(cache.compile_count(), 1);
}

#[test]
fn type_errors_fail_validation() {
    let mut backend = backend();
    let mut cache = ProgramCache::new();
    let fragment = "@fragment\nfn fs_main() -> @location(0) vec4<f32> {\n    let x: i32 = undefined_symbol * true;\n    return vec4<f32>(x);\n}\n";
    let params = ProgramParameters::for_material(&Material::new_shader(VERTEX, fragment), &env());
    let key = params.cache_key();

    let handle = cache.acquire_program(&mut backend, &params, &key);

    assert!(cache.program_id(&mut backend, handle).is_none());
    let log = &cache.diagnostics(handle).unwrap().fragment_log;
    assert!(log.contains("undefined_symbol"), "{log}");
    assert!(log.contains(">   4:     let x: i32"), "{log}");
    assert_eq!(backend.program_count(), 0);
}

#[test]
fn invalidate_recompiles_on_next_use() {
    let mut backend = backend();
    let mut cache = ProgramCache::new();
    let params = ProgramParameters::for_material(&Material::new_lambert(Vec3::ONE), &env());
    let key = params.cache_key();
    let handle = cache.acquire_program(&mut backend, &params, &key);

    cache.invalidate();
    assert!(cache.get(handle).unwrap().backend_id().is_none());

    assert!(cache.program_id(&mut backend, handle).is_some());
    assert_eq!(cache.compile_count(), 2);
    assert_eq!(cache.get(handle).unwrap().used_times, 1);
}
