//! Programs: parameter derivation, WGSL generation and the shared cache.

pub mod cache;
pub mod parameters;
pub mod shader_gen;

pub use cache::{CachedProgram, ProgramCache, ProgramHandle};
pub use parameters::{
    LightCounts, ProgramEnvironment, ProgramFeatures, ProgramParameters, ShadingModel, ShadowMapType,
    ToneMapping,
};
pub use shader_gen::{GeneratedShader, ShaderGenerator};
