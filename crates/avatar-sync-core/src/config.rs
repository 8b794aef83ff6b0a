//! Engine configuration.

use std::time::Duration;

/// Frame duration used when a configured rate is zero.
const FALLBACK_FRAME_DURATION: Duration = Duration::from_millis(33);

/// Tuning knobs for buffering, pacing and the image cache.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Frames (in sequence order, no gaps) that must be resolved before a
    /// chunk may start. Clamped to the chunk length. Default: 10.
    pub min_frames_before_start: usize,
    /// Longest a queued chunk waits for its buffer before starting anyway.
    /// Default: 3000ms.
    pub max_buffer_wait: Duration,
    /// How often an unready head chunk is re-checked when no decode event
    /// arrives. Default: 100ms.
    pub buffer_retry_interval: Duration,
    /// Longest a playing chunk skip-draws on one unresolved frame before
    /// stepping past it. Default: 3000ms.
    pub max_frame_stall: Duration,
    /// Logical frame rate of the idle loop. Default: 30.
    pub idle_fps: u32,
    /// Logical frame rate of overlay playback. Default: 30.
    pub overlay_fps: u32,
    /// Base animation looped while no chunk is playing.
    pub idle_animation: String,
    /// Played after each wrap of the idle animation, if loaded.
    pub idle_alternate_animation: Option<String>,
    /// Cache bound by entry count. Default: 512.
    pub cache_max_entries: usize,
    /// Cache bound by approximate decoded size. Default: 256 MiB.
    pub cache_max_bytes: usize,
    /// Background decode threads. Default: 2.
    pub decode_workers: usize,
}

impl EngineConfig {
    /// Starts chunks on a shorter buffer. Suited to fast local backends.
    pub fn low_latency() -> Self {
        Self {
            min_frames_before_start: 5,
            max_buffer_wait: Duration::from_millis(1000),
            buffer_retry_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }

    /// Returns a copy with values clamped into workable ranges.
    pub fn validated(mut self) -> Self {
        self.min_frames_before_start = self.min_frames_before_start.max(1);
        self.buffer_retry_interval = self.buffer_retry_interval.max(Duration::from_millis(1));
        self.idle_fps = self.idle_fps.min(240);
        self.overlay_fps = self.overlay_fps.min(240);
        self.cache_max_entries = self.cache_max_entries.max(1);
        self.cache_max_bytes = self.cache_max_bytes.max(1);
        self.decode_workers = self.decode_workers.clamp(1, 16);
        self
    }

    pub fn idle_frame_duration(&self) -> Duration {
        frame_duration(self.idle_fps)
    }

    pub fn overlay_frame_duration(&self) -> Duration {
        frame_duration(self.overlay_fps)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_frames_before_start: 10,
            max_buffer_wait: Duration::from_millis(3000),
            buffer_retry_interval: Duration::from_millis(100),
            max_frame_stall: Duration::from_millis(3000),
            idle_fps: 30,
            overlay_fps: 30,
            idle_animation: "idle".to_string(),
            idle_alternate_animation: Some("idle_reverse".to_string()),
            cache_max_entries: 512,
            cache_max_bytes: 256 * 1024 * 1024,
            decode_workers: 2,
        }
    }
}

fn frame_duration(fps: u32) -> Duration {
    if fps > 0 {
        Duration::from_nanos(1_000_000_000 / u64::from(fps))
    } else {
        FALLBACK_FRAME_DURATION
    }
}
