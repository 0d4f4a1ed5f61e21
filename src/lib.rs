#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::too_many_lines)]

//! Retained-mode scene graph with a forward renderer.
//!
//! A [`Scene`] owns nodes and their components, [`Assets`] owns geometries,
//! materials and textures, and a [`Renderer`] draws both through any
//! [`RenderBackend`]: [`WgpuBackend`] on a GPU device, or
//! [`SoftwareBackend`], a CPU rasterizer that executes the same state and
//! draw calls headlessly.

pub mod errors;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod utils;

pub use errors::{EngineError, Result};
pub use renderer::backend::RenderBackend;
pub use renderer::{Renderer, RendererSettings, SoftwareBackend, WgpuBackend};
pub use resources::primitives::*;
pub use resources::{Assets, ColorSpace, Geometry, Material, MaterialKind, Side, Texture};
pub use scene::{Camera, Light, Mesh, Node, NodeHandle, Scene};
pub use utils::interner;
