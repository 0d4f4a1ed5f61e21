//! Animation Loop
//!
//! Host-driven frame scheduling. The host forwards its display refresh
//! callbacks to [`Renderer::tick`] with a timestamp in milliseconds; the
//! renderer runs the single installed callback with a [`FrameState`].
//! Replacing the callback takes effect on the next tick, `None` stops the
//! loop.
//!
//! [`Renderer::tick`]: crate::renderer::Renderer::tick

/// Timing information handed to the frame callback.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameState {
    /// Seconds since the first tick of the current callback.
    pub time: f32,
    /// Seconds since the previous tick.
    pub dt: f32,
    /// Frames run by the current callback, starting at 1.
    pub frame_count: u64,
    /// Host timestamp in milliseconds.
    pub timestamp: f64,
}

pub type FrameCallback<C> = Box<dyn FnMut(&mut C, &FrameState)>;

/// Holds the active callback and its timing. `C` is the value the callback
/// receives, usually the renderer that owns the loop.
pub struct AnimationLoop<C> {
    callback: Option<FrameCallback<C>>,
    /// Bumped by every `set`; detects replacement during a callback.
    generation: u64,
    start: Option<f64>,
    last: Option<f64>,
    frame_count: u64,
}

impl<C> Default for AnimationLoop<C> {
    fn default() -> Self {
        Self {
            callback: None,
            generation: 0,
            start: None,
            last: None,
            frame_count: 0,
        }
    }
}

impl<C> AnimationLoop<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the callback and restarts timing.
    pub fn set(&mut self, callback: Option<FrameCallback<C>>) {
        self.callback = callback;
        self.generation += 1;
        self.start = None;
        self.last = None;
        self.frame_count = 0;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.callback.is_some()
    }

    /// Takes the callback out for one frame. Must be followed by
    /// [`Self::finish`] with the returned generation.
    pub fn begin(&mut self, timestamp: f64) -> Option<(FrameCallback<C>, FrameState, u64)> {
        let callback = self.callback.take()?;
        let start = *self.start.get_or_insert(timestamp);
        let dt = self.last.map_or(0.0, |last| ((timestamp - last) / 1000.0).max(0.0));
        self.last = Some(timestamp);
        self.frame_count += 1;

        let frame = FrameState {
            time: ((timestamp - start) / 1000.0) as f32,
            dt: dt as f32,
            frame_count: self.frame_count,
            timestamp,
        };
        Some((callback, frame, self.generation))
    }

    /// Puts the callback back unless it was replaced while running.
    pub fn finish(&mut self, callback: FrameCallback<C>, generation: u64) {
        if self.generation == generation {
            self.callback = Some(callback);
        }
    }
}
