//! Render statistics.

use crate::scene::DrawMode;

/// Counters of the current frame. Reset at the start of each
/// [`Renderer::render`] when [`RenderInfo::auto_reset`] is on.
///
/// [`Renderer::render`]: crate::renderer::Renderer::render
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frames rendered since creation. Never reset.
    pub frame: u64,
    pub calls: u32,
    pub triangles: u32,
    pub lines: u32,
    pub points: u32,
}

/// GPU resources currently alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub geometries: usize,
    pub textures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderInfo {
    pub render: FrameInfo,
    pub memory: MemoryInfo,
    /// Live programs in the cache.
    pub programs: usize,
    /// Shadow maps rendered since creation.
    pub shadow_renders: u64,
    pub auto_reset: bool,
}

impl Default for RenderInfo {
    fn default() -> Self {
        Self {
            render: FrameInfo::default(),
            memory: MemoryInfo::default(),
            programs: 0,
            shadow_renders: 0,
            auto_reset: true,
        }
    }
}

impl RenderInfo {
    /// Clears per-frame counters.
    pub fn reset(&mut self) {
        self.render.calls = 0;
        self.render.triangles = 0;
        self.render.lines = 0;
        self.render.points = 0;
    }

    /// Accounts one draw of `count` elements.
    pub fn update(&mut self, count: u32, mode: DrawMode) {
        self.render.calls += 1;
        match mode {
            DrawMode::Triangles | DrawMode::Sprite => self.render.triangles += count / 3,
            DrawMode::Lines => self.render.lines += count / 2,
            DrawMode::LineStrip => self.render.lines += count.saturating_sub(1),
            DrawMode::Points => self.render.points += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_counted_per_mode() {
        let mut info = RenderInfo::default();
        info.update(36, DrawMode::Triangles);
        info.update(4, DrawMode::LineStrip);
        info.update(5, DrawMode::Points);
        assert_eq!(info.render.calls, 3);
        assert_eq!(info.render.triangles, 12);
        assert_eq!(info.render.lines, 3);
        assert_eq!(info.render.points, 5);

        info.reset();
        assert_eq!(info.render.calls, 0);
    }
}
