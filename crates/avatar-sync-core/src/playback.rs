//! Per-chunk playback state machine.
//!
//! `Waiting -> Playing -> HoldingLast -> Done`, or `Playing -> Done` when
//! nothing follows. The frame index only ever moves forward by one per
//! logical step.

use std::time::{Duration, Instant};

use crate::image_cache::{FrameStatus, ImageCache};
use crate::types::OverlayChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    /// Released from the queue, first frame not yet presented
    Waiting,
    Playing,
    /// Parked on the last frame until the next chunk can start
    HoldingLast,
    Done,
}

impl PlaybackPhase {
    /// True while the chunk owns the screen.
    pub fn is_active(self) -> bool {
        matches!(self, PlaybackPhase::Playing | PlaybackPhase::HoldingLast)
    }
}

/// What follows the current chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Successor {
    /// Queue is empty
    None,
    /// Next chunk's buffer is ready (or timed out)
    Ready,
    /// Next chunk is queued but still buffering
    Pending,
}

/// Result of one logical step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Moved to the next frame
    Stepped,
    /// Moved onto a frame whose decode failed; it is shown with no overlay
    SteppedOntoFailed,
    /// Next frame missing or still decoding; previous visual stays up
    SkipDraw,
    /// Moved past a frame that stayed unresolved too long
    StallSkipped { stalled_for: Duration },
    /// Holding the last frame for the next chunk
    Holding,
    /// Playback of this chunk is over
    Finished,
}

#[derive(Debug, Clone)]
pub struct PlaybackState {
    pub phase: PlaybackPhase,
    pub current_index: usize,
    pub enqueued_at: Instant,
    pub started_at: Option<Instant>,
    /// When the current skip-draw run began
    pub stalled_since: Option<Instant>,
    /// Released from the queue by buffer timeout rather than readiness
    pub forced: bool,
}

impl PlaybackState {
    pub fn new(enqueued_at: Instant, forced: bool) -> Self {
        Self {
            phase: PlaybackPhase::Waiting,
            current_index: 0,
            enqueued_at,
            started_at: None,
            stalled_since: None,
            forced,
        }
    }

    /// Waiting -> Playing on frame 0.
    pub fn start(&mut self, now: Instant) {
        self.phase = PlaybackPhase::Playing;
        self.current_index = 0;
        self.started_at = Some(now);
        self.stalled_since = None;
    }

    /// Advances by one logical step.
    ///
    /// A frame that is missing or still decoding is not stepped onto; the
    /// previous visual is held instead. After `max_stall` of holding, the
    /// frame is stepped onto anyway so one lost payload cannot wedge the
    /// chunk. A failed frame will never become drawable, so it is stepped
    /// onto on schedule and drawn without its overlay.
    pub fn advance(
        &mut self,
        chunk: &OverlayChunk,
        cache: &ImageCache,
        successor: Successor,
        now: Instant,
        max_stall: Duration,
    ) -> Advance {
        match self.phase {
            PlaybackPhase::Playing if self.current_index < chunk.last_index() => {
                let next = &chunk.frames[self.current_index + 1];
                match cache.status(&next.cache_key) {
                    FrameStatus::Ready => {
                        self.current_index += 1;
                        self.stalled_since = None;
                        return Advance::Stepped;
                    }
                    FrameStatus::Failed => {
                        self.current_index += 1;
                        self.stalled_since = None;
                        return Advance::SteppedOntoFailed;
                    }
                    FrameStatus::Missing | FrameStatus::Decoding => {}
                }
                let since = *self.stalled_since.get_or_insert(now);
                let stalled_for = now.saturating_duration_since(since);
                if stalled_for >= max_stall {
                    self.current_index += 1;
                    self.stalled_since = None;
                    Advance::StallSkipped { stalled_for }
                } else {
                    Advance::SkipDraw
                }
            }
            PlaybackPhase::Playing | PlaybackPhase::HoldingLast => match successor {
                Successor::Pending => {
                    self.phase = PlaybackPhase::HoldingLast;
                    Advance::Holding
                }
                Successor::None | Successor::Ready => {
                    self.phase = PlaybackPhase::Done;
                    Advance::Finished
                }
            },
            PlaybackPhase::Waiting => Advance::Holding,
            PlaybackPhase::Done => Advance::Finished,
        }
    }
}
