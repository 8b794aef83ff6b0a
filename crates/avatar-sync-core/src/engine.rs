//! The engine instance and its cross-thread handle.
//!
//! [`AvatarEngine`] owns all playback state and is driven by calling
//! [`AvatarEngine::tick`] from one thread at the presentation rate.
//! [`EngineHandle`] is the `Send + Sync` inbound surface for transport
//! threads: image bytes go straight into the shared cache, everything else
//! is delivered to the tick as a command tagged with the reset generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::animation::AnimationLibrary;
use crate::assembler::{AssemblyOutcome, AssemblyStep, ChunkAssembler, FrameBatch};
use crate::audio_sync::{AudioStart, AudioSyncCoordinator, PendingAudio};
use crate::chunk_queue::ChunkQueue;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticEvent, EngineMetrics};
use crate::error::EngineError;
use crate::image_cache::{CacheEvent, ImageCache, ImageDecoder, RasterDecoder};
use crate::playback::PlaybackState;
use crate::render_clock::{RenderClock, RenderMode};
use crate::sink::{Presentation, PresentationSink};
use crate::synchronizer::{FrameSynchronizer, SyncContext};
use crate::types::{CacheKey, ImageHandle, OverlayChunk, OverlayFrame, Point, RawChunkMetadata, RawOverlayFrame};

/// Inbound data delivered to the tick thread.
#[derive(Debug)]
enum Inbound {
    EnqueueChunk(OverlayChunk),
    QueueAudio { chunk_index: u32, payload: Bytes },
    StreamEnd,
    Diagnostic(DiagnosticEvent),
}

#[derive(Debug)]
struct Command {
    generation: u64,
    inbound: Inbound,
}

/// State shared between the engine and its handles.
struct EngineShared {
    /// Bumped by every reset; commands from older generations are discarded
    generation: AtomicU64,
    cache: ImageCache,
    assembler: Mutex<ChunkAssembler>,
    commands: Sender<Command>,
    metrics: EngineMetrics,
}

impl EngineShared {
    fn send(&self, generation: u64, inbound: Inbound) -> Result<(), EngineError> {
        self.commands
            .send(Command {
                generation,
                inbound,
            })
            .map_err(|_| EngineError::Disconnected)
    }

    /// Invalidates everything queued so far and empties the cache and
    /// assembler. The tick clears its own state when it sees the new
    /// generation.
    fn reset(&self) -> u64 {
        let mut assembler = self.assembler.lock();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        assembler.clear();
        self.cache.clear_all();
        generation
    }

    /// Closes the batch assembly path for the current response. Chunks that
    /// never completed are reported as dropped.
    fn end_response(&self) -> Vec<DiagnosticEvent> {
        let abandoned = self.assembler.lock().end_response();
        abandoned
            .into_iter()
            .map(|chunk_index| {
                tracing::warn!("Chunk {} incomplete at stream end, dropping", chunk_index);
                self.metrics.record_chunk_dropped();
                DiagnosticEvent::ChunkDropped {
                    chunk_index: Some(chunk_index),
                    reason: "stream ended before chunk was complete".to_string(),
                }
            })
            .collect()
    }

    fn apply_assembly(&self, step: AssemblyStep, generation: u64) -> Result<(), EngineError> {
        for (key, bytes) in step.images {
            self.cache.put(key, bytes, step.chunk_index);
        }
        match step.outcome {
            AssemblyOutcome::Pending => Ok(()),
            AssemblyOutcome::Complete(chunk) => self.send(generation, Inbound::EnqueueChunk(chunk)),
            AssemblyOutcome::Dropped(event) => {
                self.metrics.record_chunk_dropped();
                self.send(generation, Inbound::Diagnostic(event))
            }
        }
    }
}

/// Validates raw frames into a chunk. Any malformed frame rejects the chunk.
fn build_chunk(
    chunk_index: u32,
    animation_name: &str,
    zone_top_left: Point,
    frames: &[RawOverlayFrame],
) -> Result<OverlayChunk, EngineError> {
    let frames = frames
        .iter()
        .map(|raw| OverlayFrame::from_raw(raw, chunk_index, animation_name))
        .collect::<Result<Vec<_>, _>>()?;
    OverlayChunk::new(chunk_index, animation_name, zone_top_left, frames)
}

/// Cloneable, thread-safe inbound surface of an [`AvatarEngine`].
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Queues one complete chunk for playback.
    pub fn enqueue_chunk(
        &self,
        chunk_index: u32,
        animation_name: &str,
        zone_top_left: Point,
        frames: &[RawOverlayFrame],
    ) -> Result<(), EngineError> {
        let generation = self.generation();
        match build_chunk(chunk_index, animation_name, zone_top_left, frames) {
            Ok(chunk) => self.shared.send(generation, Inbound::EnqueueChunk(chunk)),
            Err(e) => {
                tracing::warn!("Rejected chunk {}: {}", chunk_index, e);
                self.shared.metrics.record_chunk_dropped();
                self.shared.send(
                    generation,
                    Inbound::Diagnostic(DiagnosticEvent::ChunkDropped {
                        chunk_index: Some(chunk_index),
                        reason: e.to_string(),
                    }),
                )?;
                Err(e)
            }
        }
    }

    /// Hands encoded image bytes to the cache for background decode.
    pub fn cache_overlay_image(&self, key: CacheKey, bytes: Bytes, chunk_index: u32) {
        self.shared.cache.put(key, bytes, chunk_index);
    }

    pub fn queue_audio(&self, chunk_index: u32, payload: Bytes) -> Result<(), EngineError> {
        self.shared.send(
            self.generation(),
            Inbound::QueueAudio {
                chunk_index,
                payload,
            },
        )
    }

    /// No more chunks will arrive for the current response. Chunk indices
    /// may be reused by the next response from here on.
    pub fn signal_stream_end(&self) -> Result<(), EngineError> {
        let generation = self.generation();
        for event in self.shared.end_response() {
            self.shared.send(generation, Inbound::Diagnostic(event))?;
        }
        self.shared.send(generation, Inbound::StreamEnd)
    }

    /// Cancels all playback. The cache and assembler are cleared now; the
    /// engine drops its queue and playback state on its next tick.
    pub fn force_reset(&self) {
        let generation = self.shared.reset();
        tracing::info!("Reset requested (generation {})", generation);
    }

    /// Records chunk metadata on the batch assembly path.
    pub fn begin_chunk(&self, metadata: &RawChunkMetadata) -> Result<(), EngineError> {
        let mut assembler = self.shared.assembler.lock();
        let step = assembler.begin_chunk(metadata)?;
        self.shared.apply_assembly(step, self.generation())
    }

    /// Records a batch of frames (and inline images) for a chunk.
    pub fn submit_batch(&self, batch: FrameBatch) -> Result<(), EngineError> {
        let mut assembler = self.shared.assembler.lock();
        let step = assembler.add_batch(batch)?;
        self.shared.apply_assembly(step, self.generation())
    }

    /// Signals that every batch of a chunk has been sent.
    pub fn mark_chunk_ready(&self, chunk_index: u32) -> Result<(), EngineError> {
        let mut assembler = self.shared.assembler.lock();
        let step = assembler.mark_ready(chunk_index)?;
        self.shared.apply_assembly(step, self.generation())
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.shared.metrics
    }
}

/// The animation synchronization engine.
pub struct AvatarEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    shared: Arc<EngineShared>,
    commands: Receiver<Command>,
    applied_generation: u64,
    library: AnimationLibrary,
    queue: ChunkQueue,
    synchronizer: FrameSynchronizer,
    audio: AudioSyncCoordinator,
    render_clock: RenderClock,
    current: Option<Presentation>,
    audio_starts: Vec<AudioStart>,
    diagnostics: Vec<DiagnosticEvent>,
    stream_ended: bool,
}

impl AvatarEngine {
    /// Creates an engine that decodes PNG/JPEG overlays and runs on wall time.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(config, Arc::new(RasterDecoder), Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: EngineConfig,
        decoder: Arc<dyn ImageDecoder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = config.validated();
        let metrics = EngineMetrics::new();
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(EngineShared {
            generation: AtomicU64::new(0),
            cache: ImageCache::new(&config, decoder, metrics.clone()),
            assembler: Mutex::new(ChunkAssembler::new()),
            commands: commands_tx,
            metrics,
        });
        tracing::info!(
            "Engine created (min buffer {} frames, overlay {} fps, idle {} fps)",
            config.min_frames_before_start,
            config.overlay_fps,
            config.idle_fps
        );
        Self {
            queue: ChunkQueue::new(&config),
            synchronizer: FrameSynchronizer::new(&config),
            render_clock: RenderClock::new(&config),
            config,
            clock,
            shared,
            commands: commands_rx,
            applied_generation: 0,
            library: AnimationLibrary::new(),
            audio: AudioSyncCoordinator::new(),
            current: None,
            audio_starts: Vec::new(),
            diagnostics: Vec::new(),
            stream_ended: false,
        }
    }

    /// Returns a handle for feeding the engine from other threads.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn load_base_animation(
        &mut self,
        name: &str,
        frames: Vec<ImageHandle>,
        expected_count: Option<usize>,
    ) -> Result<(), EngineError> {
        self.library.load(name, frames, expected_count).map(|_| ())
    }

    /// Queues one complete chunk for playback.
    pub fn enqueue_chunk(
        &mut self,
        chunk_index: u32,
        animation_name: &str,
        zone_top_left: Point,
        frames: &[RawOverlayFrame],
    ) -> Result<(), EngineError> {
        match build_chunk(chunk_index, animation_name, zone_top_left, frames) {
            Ok(chunk) => {
                let now = self.clock.now();
                self.accept_chunk(chunk, now);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Rejected chunk {}: {}", chunk_index, e);
                self.shared.metrics.record_chunk_dropped();
                self.diagnostics.push(DiagnosticEvent::ChunkDropped {
                    chunk_index: Some(chunk_index),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn cache_overlay_image(&self, key: CacheKey, bytes: Bytes, chunk_index: u32) {
        self.shared.cache.put(key, bytes, chunk_index);
    }

    /// Holds audio until the chunk's first frame is presented.
    pub fn queue_audio(&mut self, chunk_index: u32, payload: Bytes) {
        if let Some(start) = self.audio.queue_audio(chunk_index, payload) {
            self.audio_starts.push(start);
        }
    }

    /// No more chunks will arrive for the current response.
    pub fn signal_stream_end(&mut self) {
        let diagnostics = self.shared.end_response();
        self.diagnostics.extend(diagnostics);
        self.mark_stream_ended();
    }

    fn mark_stream_ended(&mut self) {
        tracing::debug!("Stream end signalled");
        self.stream_ended = true;
    }

    /// Cancels all playback and returns to idle immediately.
    pub fn force_reset(&mut self) {
        self.shared.reset();
        self.apply_reset();
    }

    /// Advances the engine by one presentation tick.
    pub fn tick<S: PresentationSink + ?Sized>(&mut self, sink: &mut S) {
        let now = self.clock.now();
        self.shared.metrics.record_tick();

        if self.shared.generation.load(Ordering::Acquire) != self.applied_generation {
            self.apply_reset();
        }
        self.drain_commands(now);
        self.drain_cache_events();

        let mut ctx = SyncContext {
            queue: &mut self.queue,
            cache: &self.shared.cache,
            library: &self.library,
            metrics: &self.shared.metrics,
            config: &self.config,
            now,
        };
        let promoted = self.synchronizer.promote_queued(&mut ctx);
        let mode = if self.synchronizer.wants_overlay(&ctx) {
            RenderMode::Overlay
        } else {
            RenderMode::Idle
        };
        let decision = if self.render_clock.tick(mode, now) {
            ctx.metrics.record_logical_step();
            Some(self.synchronizer.decide(&mut ctx))
        } else {
            None
        };
        self.diagnostics.extend(promoted);

        if let Some(decision) = decision {
            if let Some(presentation) = decision.presentation {
                self.render_clock.presented(if presentation.is_overlay() {
                    RenderMode::Overlay
                } else {
                    RenderMode::Idle
                });
                self.current = Some(presentation);
            }
            for chunk_index in decision.finished_chunks {
                self.shared.cache.evict_async(vec![chunk_index]);
                self.audio.finish_chunk(chunk_index);
            }
            if let Some(chunk_index) = decision.started_chunk {
                if let Some(start) = self.audio.notify_chunk_started(chunk_index) {
                    self.audio_starts.push(start);
                }
            }
            self.diagnostics.extend(decision.diagnostics);
        }

        if let Some(presentation) = &self.current {
            sink.present_frame(presentation);
        }
        for start in self.audio_starts.drain(..) {
            tracing::info!("Starting audio for chunk {}", start.chunk_index);
            self.shared.metrics.record_audio_started();
            sink.start_audio(start.chunk_index, &start.payload);
        }
        for event in self.diagnostics.drain(..) {
            sink.on_diagnostic(&event);
        }

        if self.stream_ended && !self.synchronizer.has_tracked() && self.queue.is_empty() {
            self.stream_ended = false;
            self.audio.end_response();
            tracing::info!("All chunks complete");
            sink.on_all_chunks_complete();
        }
    }

    fn accept_chunk(&mut self, chunk: OverlayChunk, now: Instant) {
        tracing::info!(
            "Chunk {} queued ({} frames, '{}')",
            chunk.chunk_index,
            chunk.len(),
            chunk.animation_name
        );
        self.shared.cache.watch_chunk(chunk.chunk_index, chunk.keys());
        self.queue.enqueue(Arc::new(chunk), now);

        if self.synchronizer.is_idle() {
            let mut ctx = SyncContext {
                queue: &mut self.queue,
                cache: &self.shared.cache,
                library: &self.library,
                metrics: &self.shared.metrics,
                config: &self.config,
                now,
            };
            let diagnostics = self.synchronizer.promote_queued(&mut ctx);
            self.diagnostics.extend(diagnostics);
        }
    }

    fn drain_commands(&mut self, now: Instant) {
        while let Ok(Command {
            generation,
            inbound,
        }) = self.commands.try_recv()
        {
            if generation < self.applied_generation {
                tracing::debug!("Discarding {:?} from generation {}", inbound, generation);
                continue;
            }
            if generation > self.applied_generation {
                self.apply_reset();
            }
            match inbound {
                Inbound::EnqueueChunk(chunk) => self.accept_chunk(chunk, now),
                Inbound::QueueAudio {
                    chunk_index,
                    payload,
                } => self.queue_audio(chunk_index, payload),
                Inbound::StreamEnd => self.mark_stream_ended(),
                Inbound::Diagnostic(event) => self.diagnostics.push(event),
            }
        }
    }

    fn drain_cache_events(&mut self) {
        for event in self.shared.cache.drain_events() {
            match event {
                CacheEvent::Decoded { .. } => self.queue.mark_head_dirty(),
                CacheEvent::DecodeFailed { key, reason } => {
                    self.queue.mark_head_dirty();
                    self.diagnostics
                        .push(DiagnosticEvent::DecodeFailed { key, reason });
                }
                CacheEvent::ChunkPopulated { chunk_index } => {
                    if self.queue.mark_prefetched(chunk_index) {
                        tracing::debug!("Chunk {} fully prefetched", chunk_index);
                    }
                }
            }
        }
    }

    /// Clears tick-side state to match the shared generation.
    fn apply_reset(&mut self) {
        self.applied_generation = self.shared.generation.load(Ordering::Acquire);
        let dropped = self.queue.clear();
        self.synchronizer.reset();
        self.audio.clear();
        self.render_clock.reset();
        self.current = None;
        self.audio_starts.clear();
        self.diagnostics.clear();
        self.stream_ended = false;
        self.shared.metrics.record_reset();
        tracing::info!(
            "Engine reset to idle (generation {}, dropped queued chunks {:?})",
            self.applied_generation,
            dropped
        );
    }

    /// Index and playback state of the chunk that left the queue, if any.
    pub fn active_playback(&self) -> Option<(u32, &PlaybackState)> {
        self.synchronizer.tracked()
    }

    pub fn queued_chunks(&self) -> Vec<u32> {
        self.queue.chunk_indices()
    }

    /// True while no chunk owns the screen.
    pub fn is_idle(&self) -> bool {
        self.synchronizer.is_idle()
    }

    pub fn pending_audio(&self, chunk_index: u32) -> Option<&PendingAudio> {
        self.audio.pending(chunk_index)
    }

    pub fn pending_audio_count(&self) -> usize {
        self.audio.pending_count()
    }

    pub fn cache(&self) -> &ImageCache {
        &self.shared.cache
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.shared.metrics
    }

    /// The presentation last handed to the sink.
    pub fn current_presentation(&self) -> Option<&Presentation> {
        self.current.as_ref()
    }

    pub fn library(&self) -> &AnimationLibrary {
        &self.library
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
