//! Decouples the logical animation rate from the presentation rate.
//!
//! The host may tick at 60 Hz or faster while animations advance at 30 Hz.
//! Each mode keeps its own time accumulator. A presentation tick adds the
//! elapsed wall time to the active mode's accumulator and takes at most one
//! logical step from it, so a stall never turns into a burst of catch-up
//! frames.
//!
//! When the active mode changes, the banked time moves to the new mode's
//! accumulator. The logical cadence therefore carries straight across
//! idle/overlay transitions instead of restarting at each one.

use std::time::{Duration, Instant};

use crate::config::EngineConfig;

/// Accumulator ceiling, in frame durations.
pub const MAX_ACCUMULATED_FRAMES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Idle,
    Overlay,
}

/// Time bank for one mode.
#[derive(Debug, Clone)]
pub struct FrameAccumulator {
    frame_duration: Duration,
    accumulated: Duration,
}

impl FrameAccumulator {
    pub fn new(frame_duration: Duration) -> Self {
        Self {
            frame_duration,
            accumulated: Duration::ZERO,
        }
    }

    pub fn add(&mut self, elapsed: Duration) {
        self.accumulated =
            (self.accumulated + elapsed).min(self.frame_duration * MAX_ACCUMULATED_FRAMES);
    }

    /// Spends one frame duration if available.
    pub fn try_step(&mut self) -> bool {
        if self.accumulated >= self.frame_duration {
            self.accumulated -= self.frame_duration;
            true
        } else {
            false
        }
    }

    /// Ensures the next `try_step` succeeds.
    pub fn prime(&mut self) {
        self.accumulated = self.accumulated.max(self.frame_duration);
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
    }

    pub fn accumulated(&self) -> Duration {
        self.accumulated
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }
}

#[derive(Debug, Clone)]
pub struct RenderClock {
    idle: FrameAccumulator,
    overlay: FrameAccumulator,
    active: Option<RenderMode>,
    last_tick: Option<Instant>,
}

impl RenderClock {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            idle: FrameAccumulator::new(config.idle_frame_duration()),
            overlay: FrameAccumulator::new(config.overlay_frame_duration()),
            active: None,
            last_tick: None,
        }
    }

    /// Accounts one presentation tick in `mode`. Returns true if a logical
    /// step should be taken.
    ///
    /// The first tick after construction or [`reset`](Self::reset) always
    /// steps.
    pub fn tick(&mut self, mode: RenderMode, now: Instant) -> bool {
        let elapsed = self
            .last_tick
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        self.last_tick = Some(now);

        if self.active.is_none() {
            tracing::debug!("Render mode {:?} (first tick)", mode);
            self.active = Some(mode);
            let accumulator = self.accumulator(mode);
            accumulator.reset();
            accumulator.prime();
            return accumulator.try_step();
        }

        self.hand_over(mode);
        let accumulator = self.accumulator(mode);
        accumulator.add(elapsed);
        accumulator.try_step()
    }

    /// Records the mode a logical step actually rendered.
    ///
    /// A step that finishes a chunk can fall through to idle, and a step
    /// taken in idle mode can start a chunk. Handing over here keeps the next
    /// tick from treating the mode as newly activated.
    pub fn presented(&mut self, mode: RenderMode) {
        if self.active.is_some() {
            self.hand_over(mode);
        }
    }

    /// Moves banked time from the active mode to `mode`.
    fn hand_over(&mut self, mode: RenderMode) {
        let Some(previous) = self.active.filter(|&previous| previous != mode) else {
            return;
        };
        let banked = self.accumulator(previous).accumulated();
        self.accumulator(previous).reset();
        let accumulator = self.accumulator(mode);
        accumulator.reset();
        accumulator.add(banked);
        tracing::debug!("Render mode {:?} -> {:?} ({:?} banked)", previous, mode, banked);
        self.active = Some(mode);
    }

    /// Forgets the active mode and all banked time.
    pub fn reset(&mut self) {
        self.idle.reset();
        self.overlay.reset();
        self.active = None;
        self.last_tick = None;
    }

    pub fn active_mode(&self) -> Option<RenderMode> {
        self.active
    }

    fn accumulator(&mut self, mode: RenderMode) -> &mut FrameAccumulator {
        match mode {
            RenderMode::Idle => &mut self.idle,
            RenderMode::Overlay => &mut self.overlay,
        }
    }
}
