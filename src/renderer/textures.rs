//! GPU texture cache.
//!
//! Keyed by texture identity and refreshed when [`Texture::version`] moves.
//! Images larger than the backend's `max_texture_dimension_2d` are
//! downsampled before upload.

use image::RgbaImage;
use image::imageops::{self, FilterType};
use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::renderer::backend::{RenderBackend, TextureDescriptor, TextureId};
use crate::resources::{ColorSpace, Texture};

#[derive(Debug, Clone, Copy)]
struct GpuTexture {
    id: TextureId,
    version: u64,
}

#[derive(Debug, Default)]
pub struct TextureCache {
    entries: FxHashMap<u64, GpuTexture>,
    uploads: u64,
    max_size: Option<u32>,
}

/// Largest size with the same aspect ratio that fits in `max` on both axes.
#[must_use]
pub fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width <= max && height <= max {
        return (width, height);
    }
    let scale = max as f32 / width.max(height) as f32;
    let w = ((width as f32 * scale).floor() as u32).clamp(1, max);
    let h = ((height as f32 * scale).floor() as u32).clamp(1, max);
    (w, h)
}

impl TextureCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps uploads below the backend limit.
    pub fn set_max_size(&mut self, max: u32) {
        self.max_size = Some(max);
    }

    /// Uploads `texture` if its version changed and returns its GPU id.
    pub fn update<B: RenderBackend>(&mut self, backend: &mut B, texture: &Texture) -> TextureId {
        let key = texture.id();
        if let Some(gpu) = self.entries.get(&key)
            && gpu.version == texture.version()
        {
            return gpu.id;
        }

        let limit = backend.limits().max_texture_dimension_2d;
        let max = self.max_size.map_or(limit, |m| m.min(limit)).max(1);
        let (width, height) = texture.size();
        let (fit_w, fit_h) = fit_within(width, height, max);

        let resized;
        let data: &[u8] = if (fit_w, fit_h) == (width, height) {
            texture.data()
        } else {
            warn!(
                "Texture '{}' is {width}x{height}, larger than the maximum of {max}; resizing to {fit_w}x{fit_h}",
                texture.name
            );
            resized = RgbaImage::from_raw(width, height, texture.data().to_vec())
                .map(|img| imageops::resize(&img, fit_w, fit_h, FilterType::Triangle).into_raw())
                .unwrap_or_else(|| vec![0; fit_w as usize * fit_h as usize * 4]);
            &resized
        };

        let descriptor = TextureDescriptor {
            label: &texture.name,
            width: fit_w,
            height: fit_h,
            format: match texture.color_space {
                ColorSpace::Srgb => wgpu::TextureFormat::Rgba8UnormSrgb,
                ColorSpace::LinearSrgb => wgpu::TextureFormat::Rgba8Unorm,
            },
            sampler: texture.sampler,
            data,
        };

        let id = match self.entries.get(&key) {
            Some(gpu) => {
                backend.update_texture(gpu.id, &descriptor);
                gpu.id
            }
            None => backend.create_texture(&descriptor),
        };
        if texture.generate_mipmaps {
            backend.generate_mipmaps(id);
        }
        self.uploads += 1;
        debug!("Uploaded texture {} (version {})", texture.id(), texture.version());

        self.entries.insert(
            key,
            GpuTexture {
                id,
                version: texture.version(),
            },
        );
        id
    }

    /// Deletes the GPU texture of a disposed texture; returns its id so
    /// bindings can be forgotten.
    pub fn dispose<B: RenderBackend>(&mut self, backend: &mut B, texture_id: u64) -> Option<TextureId> {
        let gpu = self.entries.remove(&texture_id)?;
        backend.delete_texture(gpu.id);
        Some(gpu.id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn uploads(&self) -> u64 {
        self.uploads
    }
}
