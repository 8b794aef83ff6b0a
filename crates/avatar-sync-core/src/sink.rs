//! Outbound surface: what the engine hands to the renderer and audio player.

use std::sync::Arc;

use bytes::Bytes;

use crate::diagnostics::DiagnosticEvent;
use crate::types::{CacheKey, ImageHandle, Rect};

/// Where a presentation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Idle,
    Overlay { chunk_index: u32, frame_index: usize },
}

/// One overlay image and where to draw it, in screen space.
#[derive(Debug, Clone)]
pub struct OverlayPlacement {
    pub image: ImageHandle,
    pub rect: Rect,
    pub key: CacheKey,
}

/// Everything needed to draw one frame.
#[derive(Debug, Clone)]
pub struct Presentation {
    /// Logical step that produced this presentation. Repeats while the
    /// previous visual is held.
    pub step: u64,
    pub animation_name: Arc<str>,
    pub base_index: usize,
    pub base_image: ImageHandle,
    pub overlays: Vec<OverlayPlacement>,
    pub source: FrameSource,
}

impl Presentation {
    pub fn is_overlay(&self) -> bool {
        matches!(self.source, FrameSource::Overlay { .. })
    }

    pub fn chunk_index(&self) -> Option<u32> {
        match self.source {
            FrameSource::Overlay { chunk_index, .. } => Some(chunk_index),
            FrameSource::Idle => None,
        }
    }
}

/// Receiver of engine output. Called only from the thread that ticks the
/// engine, and never while an engine lock is held.
pub trait PresentationSink {
    /// Called once per presentation tick with the frame to show.
    fn present_frame(&mut self, presentation: &Presentation);

    /// Start playing a chunk's audio now. At most once per chunk.
    fn start_audio(&mut self, chunk_index: u32, payload: &Bytes);

    /// The stream ended and every chunk has played.
    fn on_all_chunks_complete(&mut self) {}

    fn on_diagnostic(&mut self, _event: &DiagnosticEvent) {}
}
