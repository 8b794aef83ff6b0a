//! Playback health counters and diagnostic events.
//!
//! Counters are atomics behind an `Arc` so the tick thread, decode workers
//! and any observer can share one [`EngineMetrics`] without locking.
//! [`DiagnosticEvent`]s are the degradations worth surfacing to the host
//! (buffer timeouts, dropped chunks, decode failures); they are delivered
//! to the sink on the tick thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::types::CacheKey;

/// Something the host may want to log or report.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    /// A chunk started before its buffer filled
    BufferTimeout {
        chunk_index: u32,
        resolved_frames: usize,
        required_frames: usize,
        waited: Duration,
    },
    /// A chunk was discarded without playing
    ChunkDropped {
        chunk_index: Option<u32>,
        reason: String,
    },
    /// Image bytes for a key failed to decode; the frame will never be drawn
    DecodeFailed { key: CacheKey, reason: String },
    /// Playback stepped past a frame that never resolved
    FrameStallSkipped {
        chunk_index: u32,
        frame_index: usize,
        stalled_for: Duration,
    },
    /// Playback reached a frame whose image failed to decode and showed the
    /// base frame alone
    FailedFrameShown { chunk_index: u32, frame_index: usize },
    /// A frame referenced a base animation that was never loaded
    MissingBaseAnimation { name: String },
}

/// Engine-wide counters.
#[derive(Clone, Default)]
pub struct EngineMetrics {
    inner: Arc<EngineMetricsInner>,
}

#[derive(Default)]
struct EngineMetricsInner {
    ticks: AtomicU64,
    logical_steps: AtomicU64,
    overlay_frames_presented: AtomicU64,
    idle_frames_presented: AtomicU64,
    /// Logical steps that held the previous visual because the next frame
    /// was unresolved
    skip_draws: AtomicU64,
    hold_last_ticks: AtomicU64,
    buffer_timeouts: AtomicU64,
    frame_stall_skips: AtomicU64,
    failed_frames_shown: AtomicU64,
    chunks_started: AtomicU64,
    chunks_completed: AtomicU64,
    chunks_dropped: AtomicU64,
    decode_failures: AtomicU64,
    /// Decode completions discarded because their entry was evicted or reset
    stale_completions: AtomicU64,
    pressure_evictions: AtomicU64,
    audio_started: AtomicU64,
    resets: AtomicU64,
}

macro_rules! counters {
    ($($record:ident => $field:ident),* $(,)?) => {
        impl EngineMetrics {
            $(
                pub fn $record(&self) {
                    self.inner.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counters! {
    record_tick => ticks,
    record_logical_step => logical_steps,
    record_overlay_frame => overlay_frames_presented,
    record_idle_frame => idle_frames_presented,
    record_skip_draw => skip_draws,
    record_hold_last => hold_last_ticks,
    record_buffer_timeout => buffer_timeouts,
    record_frame_stall_skip => frame_stall_skips,
    record_failed_frame_shown => failed_frames_shown,
    record_chunk_started => chunks_started,
    record_chunk_completed => chunks_completed,
    record_chunk_dropped => chunks_dropped,
    record_decode_failure => decode_failures,
    record_stale_completion => stale_completions,
    record_pressure_eviction => pressure_evictions,
    record_audio_started => audio_started,
    record_reset => resets,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let i = &self.inner;
        MetricsSnapshot {
            ticks: load(&i.ticks),
            logical_steps: load(&i.logical_steps),
            overlay_frames_presented: load(&i.overlay_frames_presented),
            idle_frames_presented: load(&i.idle_frames_presented),
            skip_draws: load(&i.skip_draws),
            hold_last_ticks: load(&i.hold_last_ticks),
            buffer_timeouts: load(&i.buffer_timeouts),
            frame_stall_skips: load(&i.frame_stall_skips),
            failed_frames_shown: load(&i.failed_frames_shown),
            chunks_started: load(&i.chunks_started),
            chunks_completed: load(&i.chunks_completed),
            chunks_dropped: load(&i.chunks_dropped),
            decode_failures: load(&i.decode_failures),
            stale_completions: load(&i.stale_completions),
            pressure_evictions: load(&i.pressure_evictions),
            audio_started: load(&i.audio_started),
            resets: load(&i.resets),
        }
    }
}

/// Copy of [`EngineMetrics`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub logical_steps: u64,
    pub overlay_frames_presented: u64,
    pub idle_frames_presented: u64,
    pub skip_draws: u64,
    pub hold_last_ticks: u64,
    pub buffer_timeouts: u64,
    pub frame_stall_skips: u64,
    pub failed_frames_shown: u64,
    pub chunks_started: u64,
    pub chunks_completed: u64,
    pub chunks_dropped: u64,
    pub decode_failures: u64,
    pub stale_completions: u64,
    pub pressure_evictions: u64,
    pub audio_started: u64,
    pub resets: u64,
}

impl MetricsSnapshot {
    /// Fraction of overlay steps that had to hold the previous visual.
    pub fn skip_draw_ratio(&self) -> f64 {
        let attempted = self.overlay_frames_presented + self.skip_draws;
        if attempted == 0 {
            0.0
        } else {
            self.skip_draws as f64 / attempted as f64
        }
    }
}
