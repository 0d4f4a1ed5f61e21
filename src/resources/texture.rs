//! Texture Resource
//!
//! A CPU-side RGBA8 image with sampler state and a color space tag.
//! [`Texture::version`] is bumped whenever pixels or sampling change; loaders
//! populate data asynchronously and the renderer re-uploads on the next frame
//! it observes a new version.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::resources::version_tracker::ChangeTracker;

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

/// Color space of texel or output data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ColorSpace {
    #[default]
    #[serde(rename = "srgb")]
    Srgb,
    #[serde(rename = "srgb-linear")]
    LinearSrgb,
}

impl ColorSpace {
    /// Parses the canonical name (`"srgb"`, `"srgb-linear"`).
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "srgb" => Ok(Self::Srgb),
            "srgb-linear" | "linear" => Ok(Self::LinearSrgb),
            other => Err(EngineError::UnknownColorSpace(other.to_string())),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Srgb => "srgb",
            Self::LinearSrgb => "srgb-linear",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSampler {
    pub address_mode_u: wgpu::AddressMode,
    pub address_mode_v: wgpu::AddressMode,
    pub mag_filter: wgpu::FilterMode,
    pub min_filter: wgpu::FilterMode,
}

impl Default for TextureSampler {
    fn default() -> Self {
        Self {
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
        }
    }
}

#[derive(Debug)]
pub struct Texture {
    id: u64,
    pub name: String,

    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    data: Vec<u8>,

    pub color_space: ColorSpace,
    pub sampler: TextureSampler,
    pub generate_mipmaps: bool,

    tracker: ChangeTracker,
}

impl Texture {
    /// Creates a texture from tightly packed RGBA8 pixels.
    ///
    /// Only `Rgba8Unorm` and `Rgba8UnormSrgb` are accepted; the `Srgb`
    /// variant tags the texture as sRGB encoded.
    pub fn new(width: u32, height: u32, format: wgpu::TextureFormat, data: Vec<u8>) -> Result<Self> {
        let color_space = match format {
            wgpu::TextureFormat::Rgba8Unorm => ColorSpace::LinearSrgb,
            wgpu::TextureFormat::Rgba8UnormSrgb => ColorSpace::Srgb,
            other => return Err(EngineError::InvalidTextureFormat(other)),
        };
        Self::check_len(width, height, &data)?;

        Ok(Self {
            id: NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed),
            name: String::new(),
            width,
            height,
            format,
            data,
            color_space,
            sampler: TextureSampler::default(),
            generate_mipmaps: true,
            tracker: ChangeTracker::new(),
        })
    }

    /// A 1x1 texture of the given color, useful as a placeholder while a
    /// loader is still running.
    #[must_use]
    pub fn solid(rgba: [u8; 4]) -> Self {
        Self {
            id: NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed),
            name: String::new(),
            width: 1,
            height: 1,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            data: rgba.to_vec(),
            color_space: ColorSpace::Srgb,
            sampler: TextureSampler::default(),
            generate_mipmaps: false,
            tracker: ChangeTracker::new(),
        }
    }

    fn check_len(width: u32, height: u32, data: &[u8]) -> Result<()> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected || width == 0 || height == 0 {
            return Err(EngineError::InvalidParameter {
                context: format!("texture data for {width}x{height} RGBA8"),
                index: data.len(),
            });
        }
        Ok(())
    }

    /// Replaces the pixels (loader completion path).
    pub fn set_data(&mut self, width: u32, height: u32, data: Vec<u8>) -> Result<()> {
        Self::check_len(width, height, &data)?;
        self.width = width;
        self.height = height;
        self.data = data;
        self.tracker.changed();
        Ok(())
    }

    /// Call after changing `sampler`, `color_space` or `generate_mipmaps`.
    pub fn needs_update(&mut self) {
        self.tracker.changed();
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.tracker.version()
    }

    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_format() {
        let err = Texture::new(1, 1, wgpu::TextureFormat::R32Float, vec![0; 4]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTextureFormat(_)));
    }

    #[test]
    fn color_space_names_round_trip() {
        for cs in [ColorSpace::Srgb, ColorSpace::LinearSrgb] {
            assert_eq!(ColorSpace::from_name(cs.name()).unwrap(), cs);
        }
        assert!(ColorSpace::from_name("display-p3").is_err());
    }
}
