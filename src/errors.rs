//! Error Types
//!
//! This module defines the error types used throughout the engine.
//!
//! # Overview
//!
//! The main error type [`EngineError`] covers every failure mode the core can
//! report:
//! - Scene graph misuse (attaching a node to itself, stale handles)
//! - Resource configuration errors (bad parameter index, unknown color space)
//! - Shader template generation failures
//! - Backend context creation and readback failures
//!
//! Most of these are recoverable: the layer that detects them logs and
//! absorbs them. Only [`EngineError::ContextCreationFailed`] is expected to
//! reach the host as a fatal startup error.
//!
//! # Usage
//!
//! ```rust,ignore
//! use myth_forward::errors::{EngineError, Result};
//!
//! fn configure() -> Result<()> {
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    // ========================================================================
    // Scene Graph Errors
    // ========================================================================
    /// A node was added as a child of itself.
    #[error("Cannot add a node as a child of itself")]
    AttachToSelf,

    /// A node was added under one of its own descendants.
    #[error("Cannot add a node under its own descendant")]
    AttachToDescendant,

    /// A handle does not refer to a live scene node.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// The node exists but does not carry the requested component.
    #[error("Node has no {0} component")]
    MissingComponent(&'static str),

    // ========================================================================
    // Resource Configuration Errors
    // ========================================================================
    /// A resource handle is stale or was disposed.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Index-based parameter access out of range.
    #[error("Invalid parameter index: {context} (index: {index})")]
    InvalidParameter {
        /// Description of what was being accessed
        context: String,
        /// The invalid index
        index: usize,
    },

    /// A color space name that the color management table does not know.
    #[error("Unknown color space: {0}")]
    UnknownColorSpace(String),

    /// Texture format not usable for the requested purpose.
    #[error("Invalid texture format: {0:?}")]
    InvalidTextureFormat(wgpu::TextureFormat),

    /// Geometry data is inconsistent (attribute sizes, index range).
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Settings file could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    // ========================================================================
    // Shader Errors
    // ========================================================================
    /// Shader template rendering failed.
    #[error("Shader template error: {0}")]
    ShaderTemplate(#[from] minijinja::Error),

    /// The backend rejected a program.
    #[error("Shader compile error ({stage}): {log}")]
    ShaderCompile {
        /// `vertex` or `fragment`
        stage: &'static str,
        /// Compiler output
        log: String,
    },

    // ========================================================================
    // Context Errors
    // ========================================================================
    /// The rendering context could not be created. Fatal at startup.
    #[error("Failed to create rendering context: {0}")]
    ContextCreationFailed(String),

    /// The rendering context is lost; GPU handles are void.
    #[error("Rendering context lost")]
    ContextLost,

    /// A fence did not signal within the allowed number of polls.
    #[error("Readback timed out after {0} polls")]
    ReadbackTimeout(u32),
}

/// Alias for `Result<T, EngineError>`.
pub type Result<T> = std::result::Result<T, EngineError>;
