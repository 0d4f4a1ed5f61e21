//! Async pixel readback.
//!
//! A fence is inserted after the commands that produce the pixels; the
//! returned future polls it without blocking, yielding between polls, and
//! copies the pixels out once it signals. The number of polls is bounded so
//! a stuck fence surfaces as [`EngineError::ReadbackTimeout`] instead of a
//! future that never resolves.

use std::future::Future;
use std::task::Poll;

use log::{debug, warn};

use crate::errors::{EngineError, Result};
use crate::renderer::backend::{FenceStatus, RenderBackend, RenderTargetId, Viewport};

/// Reads an RGBA8 rectangle of `target` (`None`: default framebuffer).
///
/// The future borrows the backend until it resolves.
pub fn read_pixels_async<B: RenderBackend>(
    backend: &mut B,
    target: Option<RenderTargetId>,
    rect: Viewport,
    max_polls: u32,
) -> impl Future<Output = Result<Vec<u8>>> + '_ {
    let fence = backend.insert_fence();
    let mut polls = 0_u32;

    futures::future::poll_fn(move |cx| {
        polls += 1;
        match backend.poll_fence(fence) {
            FenceStatus::Signaled => {
                backend.delete_fence(fence);
                debug!("Readback fence signaled after {polls} polls");
                Poll::Ready(backend.read_pixels(target, rect))
            }
            FenceStatus::ContextLost => Poll::Ready(Err(EngineError::ContextLost)),
            FenceStatus::Pending if polls >= max_polls => {
                backend.delete_fence(fence);
                warn!("Readback fence still pending after {polls} polls");
                Poll::Ready(Err(EngineError::ReadbackTimeout(polls)))
            }
            FenceStatus::Pending => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    })
}
