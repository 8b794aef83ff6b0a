//! Per-step decision: which base frame and which overlays to show.
//!
//! Each logical step runs three checks in order:
//!
//! 1. If a chunk is playing (or holding its last frame), advance it and
//!    present its current frame. When it finishes, the next queued chunk is
//!    promoted and the remaining checks run in the same step.
//! 2. If the tracked chunk is waiting and its first frame has resolved (or
//!    its buffer timed out), start it and present frame 0 right away.
//! 3. Otherwise advance the idle loop.
//!
//! The base frame always follows the *current overlay frame's* animation,
//! so a chunk may switch base animations mid-sequence.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::animation::{AnimationFrameSet, AnimationLibrary};
use crate::chunk_queue::{BufferReadiness, ChunkQueue};
use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticEvent, EngineMetrics};
use crate::image_cache::{FrameStatus, ImageCache};
use crate::playback::{Advance, PlaybackPhase, PlaybackState, Successor};
use crate::sink::{FrameSource, OverlayPlacement, Presentation};
use crate::types::OverlayChunk;

/// Everything a step reads or mutates outside the synchronizer itself.
pub struct SyncContext<'a> {
    pub queue: &'a mut ChunkQueue,
    pub cache: &'a ImageCache,
    pub library: &'a AnimationLibrary,
    pub metrics: &'a EngineMetrics,
    pub config: &'a EngineConfig,
    pub now: Instant,
}

/// Output of one logical step.
#[derive(Debug, Default)]
pub struct TickDecision {
    /// `None` means keep showing the previous presentation
    pub presentation: Option<Presentation>,
    /// Chunk whose first frame this step presents
    pub started_chunk: Option<u32>,
    pub finished_chunks: Vec<u32>,
    pub diagnostics: Vec<DiagnosticEvent>,
}

/// The chunk released from the queue and its playback state.
#[derive(Debug)]
pub struct TrackedChunk {
    pub chunk: Arc<OverlayChunk>,
    pub state: PlaybackState,
}

/// Loops the idle animation, alternating with its reverse after each wrap.
#[derive(Debug)]
struct IdleLoop {
    primary: String,
    alternate: Option<String>,
    on_alternate: bool,
    position: usize,
}

impl IdleLoop {
    fn new(config: &EngineConfig) -> Self {
        Self {
            primary: config.idle_animation.clone(),
            alternate: config.idle_alternate_animation.clone(),
            on_alternate: false,
            position: 0,
        }
    }

    fn alternate_set<'a>(&self, library: &'a AnimationLibrary) -> Option<&'a Arc<AnimationFrameSet>> {
        self.alternate.as_deref().and_then(|name| library.get(name))
    }

    fn current_set<'a>(&self, library: &'a AnimationLibrary) -> Option<&'a Arc<AnimationFrameSet>> {
        if self.on_alternate {
            if let Some(set) = self.alternate_set(library) {
                return Some(set);
            }
        }
        library.get(&self.primary)
    }

    /// Returns the frame to show and moves the counter forward.
    fn step(&mut self, library: &AnimationLibrary) -> Option<(Arc<AnimationFrameSet>, usize)> {
        let set = Arc::clone(self.current_set(library)?);
        if self.position >= set.frame_count() {
            self.position = 0;
        }
        let index = self.position;
        self.position += 1;
        if self.position >= set.frame_count() {
            self.position = 0;
            if self.alternate_set(library).is_some() {
                self.on_alternate = !self.on_alternate;
            }
        }
        Some((set, index))
    }

    fn reset(&mut self) {
        self.on_alternate = false;
        self.position = 0;
    }
}

#[derive(Debug)]
pub struct FrameSynchronizer {
    tracked: Option<TrackedChunk>,
    idle: IdleLoop,
    step: u64,
    warned_missing: HashSet<Arc<str>>,
}

impl FrameSynchronizer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            tracked: None,
            idle: IdleLoop::new(config),
            step: 0,
            warned_missing: HashSet::new(),
        }
    }

    /// Releases the queue head into tracking if nothing is tracked and its
    /// buffer allows it.
    pub fn promote_queued(&mut self, ctx: &mut SyncContext<'_>) -> Vec<DiagnosticEvent> {
        let mut diagnostics = Vec::new();
        if self.tracked.is_some() {
            return diagnostics;
        }
        let readiness = match ctx.queue.head_readiness(ctx.cache, ctx.now) {
            Some(readiness) if readiness.can_start() => readiness,
            _ => return diagnostics,
        };
        let Some(queued) = ctx.queue.pop_front() else {
            return diagnostics;
        };
        let chunk_index = queued.chunk_index();

        let forced = match readiness {
            BufferReadiness::TimedOut {
                resolved,
                required,
                waited,
            } => {
                tracing::warn!(
                    "Chunk {} buffer timed out after {:?} ({}/{} frames), starting anyway",
                    chunk_index,
                    waited,
                    resolved,
                    required
                );
                ctx.metrics.record_buffer_timeout();
                diagnostics.push(DiagnosticEvent::BufferTimeout {
                    chunk_index,
                    resolved_frames: resolved,
                    required_frames: required,
                    waited,
                });
                true
            }
            _ => false,
        };

        tracing::debug!("Chunk {} released from queue", chunk_index);
        self.tracked = Some(TrackedChunk {
            state: PlaybackState::new(queued.queued_at, forced),
            chunk: queued.chunk,
        });
        diagnostics
    }

    /// True if the next step will present overlay content.
    pub fn wants_overlay(&self, ctx: &SyncContext<'_>) -> bool {
        self.tracked
            .as_ref()
            .is_some_and(|t| t.state.phase.is_active() || can_start(t, ctx))
    }

    /// Runs one logical step.
    pub fn decide(&mut self, ctx: &mut SyncContext<'_>) -> TickDecision {
        self.step += 1;
        let mut decision = TickDecision {
            diagnostics: self.promote_queued(ctx),
            ..Default::default()
        };

        if let Some((advance, chunk, index)) = self.advance_active(ctx) {
            match advance {
                Advance::Stepped => {
                    decision.presentation =
                        self.compose_overlay(&chunk, index, ctx, &mut decision.diagnostics);
                    return decision;
                }
                Advance::SteppedOntoFailed => {
                    note_failed_frame(&chunk, index, ctx, &mut decision.diagnostics);
                    decision.presentation =
                        self.compose_overlay(&chunk, index, ctx, &mut decision.diagnostics);
                    return decision;
                }
                Advance::StallSkipped { stalled_for } => {
                    tracing::warn!(
                        "Chunk {} frame {} unresolved for {:?}, skipping",
                        chunk.chunk_index,
                        index,
                        stalled_for
                    );
                    ctx.metrics.record_frame_stall_skip();
                    decision.diagnostics.push(DiagnosticEvent::FrameStallSkipped {
                        chunk_index: chunk.chunk_index,
                        frame_index: index,
                        stalled_for,
                    });
                    decision.presentation =
                        self.compose_overlay(&chunk, index, ctx, &mut decision.diagnostics);
                    return decision;
                }
                Advance::SkipDraw => {
                    tracing::trace!(
                        "Chunk {} skip-draw at frame {}",
                        chunk.chunk_index,
                        index
                    );
                    ctx.metrics.record_skip_draw();
                    return decision;
                }
                Advance::Holding => {
                    ctx.metrics.record_hold_last();
                    return decision;
                }
                Advance::Finished => {
                    tracing::info!("Chunk {} finished", chunk.chunk_index);
                    ctx.metrics.record_chunk_completed();
                    decision.finished_chunks.push(chunk.chunk_index);
                    self.tracked = None;
                    let diagnostics = self.promote_queued(ctx);
                    decision.diagnostics.extend(diagnostics);
                }
            }
        }

        if let Some(chunk) = self.try_start(ctx) {
            decision.started_chunk = Some(chunk.chunk_index);
            let first_failed = chunk
                .frame(0)
                .is_some_and(|f| ctx.cache.status(&f.cache_key) == FrameStatus::Failed);
            if first_failed {
                note_failed_frame(&chunk, 0, ctx, &mut decision.diagnostics);
            }
            decision.presentation = self.compose_overlay(&chunk, 0, ctx, &mut decision.diagnostics);
            return decision;
        }

        decision.presentation = self.present_idle(ctx, &mut decision.diagnostics);
        decision
    }

    fn advance_active(
        &mut self,
        ctx: &mut SyncContext<'_>,
    ) -> Option<(Advance, Arc<OverlayChunk>, usize)> {
        let tracked = self.tracked.as_mut().filter(|t| t.state.phase.is_active())?;
        let successor = match ctx.queue.head_readiness(ctx.cache, ctx.now) {
            None => Successor::None,
            Some(readiness) if readiness.can_start() => Successor::Ready,
            Some(_) => Successor::Pending,
        };
        let advance = tracked.state.advance(
            &tracked.chunk,
            ctx.cache,
            successor,
            ctx.now,
            ctx.config.max_frame_stall,
        );
        Some((
            advance,
            Arc::clone(&tracked.chunk),
            tracked.state.current_index,
        ))
    }

    /// Waiting -> Playing for the tracked chunk, if it can start.
    fn try_start(&mut self, ctx: &SyncContext<'_>) -> Option<Arc<OverlayChunk>> {
        let tracked = self.tracked.as_mut()?;
        if tracked.state.phase != PlaybackPhase::Waiting || !can_start(tracked, ctx) {
            return None;
        }
        tracked.state.start(ctx.now);
        ctx.metrics.record_chunk_started();
        tracing::info!(
            "Chunk {} playing ({} frames, {:?} after enqueue)",
            tracked.chunk.chunk_index,
            tracked.chunk.len(),
            ctx.now.saturating_duration_since(tracked.state.enqueued_at)
        );
        Some(Arc::clone(&tracked.chunk))
    }

    fn compose_overlay(
        &mut self,
        chunk: &OverlayChunk,
        index: usize,
        ctx: &SyncContext<'_>,
        diagnostics: &mut Vec<DiagnosticEvent>,
    ) -> Option<Presentation> {
        let frame = chunk.frame(index)?;
        let set = match ctx.library.get(&frame.animation_name) {
            Some(set) => Arc::clone(set),
            None => {
                if self.warned_missing.insert(Arc::clone(&frame.animation_name)) {
                    tracing::warn!(
                        "Base animation '{}' not loaded, falling back to idle",
                        frame.animation_name
                    );
                    diagnostics.push(DiagnosticEvent::MissingBaseAnimation {
                        name: frame.animation_name.to_string(),
                    });
                }
                Arc::clone(self.idle.current_set(ctx.library)?)
            }
        };
        let base_index = set.wrap_index(frame.matched_base_frame);
        let base_image = Arc::clone(set.frame(base_index)?);

        let overlays = ctx
            .cache
            .get(&frame.cache_key)
            .map(|image| OverlayPlacement {
                image,
                rect: frame.coordinates.translated(chunk.zone_top_left),
                key: frame.cache_key.clone(),
            })
            .into_iter()
            .collect();

        ctx.metrics.record_overlay_frame();
        tracing::trace!(
            "Chunk {} frame {} on {}[{}]",
            chunk.chunk_index,
            index,
            set.name(),
            base_index
        );
        Some(Presentation {
            step: self.step,
            animation_name: Arc::clone(set.name()),
            base_index,
            base_image,
            overlays,
            source: FrameSource::Overlay {
                chunk_index: chunk.chunk_index,
                frame_index: index,
            },
        })
    }

    fn present_idle(
        &mut self,
        ctx: &SyncContext<'_>,
        diagnostics: &mut Vec<DiagnosticEvent>,
    ) -> Option<Presentation> {
        let Some((set, base_index)) = self.idle.step(ctx.library) else {
            let name: Arc<str> = self.idle.primary.as_str().into();
            if self.warned_missing.insert(Arc::clone(&name)) {
                tracing::warn!("Idle animation '{}' not loaded", name);
                diagnostics.push(DiagnosticEvent::MissingBaseAnimation {
                    name: name.to_string(),
                });
            }
            return None;
        };
        let base_image = Arc::clone(set.frame(base_index)?);
        ctx.metrics.record_idle_frame();
        Some(Presentation {
            step: self.step,
            animation_name: Arc::clone(set.name()),
            base_index,
            base_image,
            overlays: Vec::new(),
            source: FrameSource::Idle,
        })
    }

    /// Drops tracked playback and rewinds the idle loop.
    pub fn reset(&mut self) {
        self.tracked = None;
        self.idle.reset();
        self.warned_missing.clear();
    }

    /// Index and state of the tracked chunk, if any.
    pub fn tracked(&self) -> Option<(u32, &PlaybackState)> {
        self.tracked
            .as_ref()
            .map(|t| (t.chunk.chunk_index, &t.state))
    }

    /// True while no chunk owns the screen.
    pub fn is_idle(&self) -> bool {
        !self
            .tracked
            .as_ref()
            .is_some_and(|t| t.state.phase.is_active())
    }

    pub fn has_tracked(&self) -> bool {
        self.tracked.is_some()
    }
}

/// A waiting chunk may start once frame 0 has resolved, or unconditionally
/// if it was released by timeout or has waited out the buffer limit.
///
/// A failed frame 0 counts as resolved: the chunk starts on schedule and
/// its first frame is the base frame with no overlay.
fn can_start(tracked: &TrackedChunk, ctx: &SyncContext<'_>) -> bool {
    if tracked.state.phase != PlaybackPhase::Waiting {
        return false;
    }
    if tracked.state.forced
        || ctx.now.saturating_duration_since(tracked.state.enqueued_at) >= ctx.config.max_buffer_wait
    {
        return true;
    }
    tracked
        .chunk
        .frame(0)
        .is_some_and(|f| ctx.cache.status(&f.cache_key).is_resolved())
}

fn note_failed_frame(
    chunk: &OverlayChunk,
    index: usize,
    ctx: &SyncContext<'_>,
    diagnostics: &mut Vec<DiagnosticEvent>,
) {
    tracing::debug!(
        "Chunk {} frame {} failed to decode, showing base frame only",
        chunk.chunk_index,
        index
    );
    ctx.metrics.record_failed_frame_shown();
    diagnostics.push(DiagnosticEvent::FailedFrameShown {
        chunk_index: chunk.chunk_index,
        frame_index: index,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::image_cache::ImageDecoder;
    use crate::types::{DecodedImage, ImageHandle, OverlayFrame, Point, RawOverlayFrame, Rect};

    struct NullDecoder;

    impl ImageDecoder for NullDecoder {
        fn decode(&self, _bytes: &[u8]) -> Result<DecodedImage, EngineError> {
            Ok(DecodedImage::new(1, 1, vec![0; 4]))
        }
    }

    fn images(n: usize) -> Vec<ImageHandle> {
        (0..n)
            .map(|i| Arc::new(DecodedImage::new(1, 1, vec![i as u8, 0, 0, 255])))
            .collect()
    }

    struct Fixture {
        config: EngineConfig,
        queue: ChunkQueue,
        cache: ImageCache,
        library: AnimationLibrary,
        metrics: EngineMetrics,
        now: Instant,
    }

    impl Fixture {
        fn new() -> Self {
            let config = EngineConfig {
                min_frames_before_start: 2,
                ..Default::default()
            };
            let metrics = EngineMetrics::new();
            let mut library = AnimationLibrary::new();
            library.load("idle", images(3), None).unwrap();
            library.load("talk", images(24), None).unwrap();
            Self {
                queue: ChunkQueue::new(&config),
                cache: ImageCache::new(&config, Arc::new(NullDecoder), metrics.clone()),
                library,
                metrics,
                now: Instant::now(),
                config,
            }
        }

        fn decide(&mut self, sync: &mut FrameSynchronizer) -> TickDecision {
            let mut ctx = SyncContext {
                queue: &mut self.queue,
                cache: &self.cache,
                library: &self.library,
                metrics: &self.metrics,
                config: &self.config,
                now: self.now,
            };
            sync.decide(&mut ctx)
        }

        fn enqueue(&mut self, index: u32, matched: &[u32], animation: Option<&str>) -> Arc<OverlayChunk> {
            let frames = matched
                .iter()
                .enumerate()
                .map(|(seq, &m)| {
                    let raw = RawOverlayFrame {
                        matched_base_frame: Some(i64::from(m)),
                        sheet_id: Some(format!("c{index}")),
                        sequence_index: Some(seq as i64),
                        coordinates: Some(Rect::new(1.0, 2.0, 8.0, 8.0)),
                        animation_name: animation.map(str::to_string),
                        ..Default::default()
                    };
                    OverlayFrame::from_raw(&raw, index, "talk").unwrap()
                })
                .collect();
            let chunk =
                Arc::new(OverlayChunk::new(index, "talk", Point::new(100.0, 50.0), frames).unwrap());
            self.queue.enqueue(Arc::clone(&chunk), self.now);
            chunk
        }

        fn ready_all(&self, chunk: &OverlayChunk) {
            for frame in &chunk.frames {
                self.cache.put_decoded(
                    frame.cache_key.clone(),
                    Arc::new(DecodedImage::new(2, 2, vec![0; 16])),
                    chunk.chunk_index,
                );
            }
        }
    }

    #[test]
    fn test_idle_alternates_on_wrap() {
        let mut fx = Fixture::new();
        fx.library.load("idle_reverse", images(2), None).unwrap();
        let mut sync = FrameSynchronizer::new(&fx.config);

        let seen: Vec<(String, usize)> = (0..7)
            .map(|_| {
                let p = fx.decide(&mut sync).presentation.unwrap();
                (p.animation_name.to_string(), p.base_index)
            })
            .collect();
        let expected = [
            ("idle", 0),
            ("idle", 1),
            ("idle", 2),
            ("idle_reverse", 0),
            ("idle_reverse", 1),
            ("idle", 0),
            ("idle", 1),
        ];
        assert_eq!(
            seen,
            expected
                .iter()
                .map(|(n, i)| (n.to_string(), *i))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_idle_wraps_in_place_without_alternate() {
        let mut fx = Fixture::new();
        let mut sync = FrameSynchronizer::new(&fx.config);
        let indices: Vec<usize> = (0..5)
            .map(|_| fx.decide(&mut sync).presentation.unwrap().base_index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_start_presents_frame_zero_same_step() {
        let mut fx = Fixture::new();
        let mut sync = FrameSynchronizer::new(&fx.config);
        let chunk = fx.enqueue(0, &[30, 31, 32], None);
        fx.ready_all(&chunk);

        let decision = fx.decide(&mut sync);
        assert_eq!(decision.started_chunk, Some(0));
        let p = decision.presentation.unwrap();
        assert_eq!(
            p.source,
            FrameSource::Overlay {
                chunk_index: 0,
                frame_index: 0
            }
        );
        // 30 mod 24
        assert_eq!(p.base_index, 6);
        assert_eq!(p.overlays.len(), 1);
        assert_eq!(p.overlays[0].rect, Rect::new(101.0, 52.0, 8.0, 8.0));

        let next = fx.decide(&mut sync);
        assert_eq!(next.started_chunk, None);
        assert_eq!(next.presentation.unwrap().base_index, 7);
    }

    #[test]
    fn test_skip_draw_holds_previous() {
        let mut fx = Fixture::new();
        let mut sync = FrameSynchronizer::new(&fx.config);
        let chunk = fx.enqueue(0, &[0, 1, 2, 3], None);
        for frame in &chunk.frames[..2] {
            fx.cache.put_decoded(
                frame.cache_key.clone(),
                Arc::new(DecodedImage::new(1, 1, vec![0; 4])),
                0,
            );
        }

        assert!(fx.decide(&mut sync).presentation.is_some());
        assert!(fx.decide(&mut sync).presentation.is_some());
        let held = fx.decide(&mut sync);
        assert!(held.presentation.is_none());
        assert_eq!(sync.tracked().unwrap().1.current_index, 1);
        assert_eq!(fx.metrics.snapshot().skip_draws, 1);
    }

    #[test]
    fn test_per_frame_animation_and_missing_fallback() {
        let mut fx = Fixture::new();
        let mut sync = FrameSynchronizer::new(&fx.config);
        let chunk = fx.enqueue(0, &[4, 5], Some("nod"));
        fx.ready_all(&chunk);

        let decision = fx.decide(&mut sync);
        assert_eq!(
            decision.diagnostics,
            vec![DiagnosticEvent::MissingBaseAnimation {
                name: "nod".to_string()
            }]
        );
        let p = decision.presentation.unwrap();
        assert_eq!(&*p.animation_name, "idle");
        assert_eq!(p.base_index, 4 % 3);

        // Warned once only.
        assert!(fx.decide(&mut sync).diagnostics.is_empty());
    }

    #[test]
    fn test_finish_falls_through_to_idle() {
        let mut fx = Fixture::new();
        let mut sync = FrameSynchronizer::new(&fx.config);
        let chunk = fx.enqueue(0, &[0], None);
        fx.ready_all(&chunk);

        assert_eq!(fx.decide(&mut sync).started_chunk, Some(0));
        let decision = fx.decide(&mut sync);
        assert_eq!(decision.finished_chunks, vec![0]);
        assert_eq!(decision.presentation.unwrap().source, FrameSource::Idle);
        assert!(sync.is_idle());
        assert!(!sync.has_tracked());
    }
}
