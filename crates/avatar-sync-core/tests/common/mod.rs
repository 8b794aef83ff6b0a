//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use avatar_sync_core::{
    AvatarEngine, DecodedImage, DiagnosticEvent, EngineConfig, EngineError, FrameSource,
    ImageDecoder, ImageHandle, ManualClock, Point, Presentation, PresentationSink,
    RawOverlayFrame, Rect,
};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

/// Everything the engine emitted, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Present { step: u64, source: FrameSource },
    Audio(u32),
    AllComplete,
    Diagnostic(DiagnosticEvent),
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<SinkEvent>,
    pub presentations: Vec<Presentation>,
}

impl RecordingSink {
    pub fn audio_starts(&self, chunk_index: u32) -> usize {
        self.events
            .iter()
            .filter(|e| **e == SinkEvent::Audio(chunk_index))
            .count()
    }

    pub fn all_complete_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| **e == SinkEvent::AllComplete)
            .count()
    }

    pub fn diagnostics(&self) -> Vec<&DiagnosticEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Diagnostic(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn last_source(&self) -> Option<FrameSource> {
        self.presentations.last().map(|p| p.source)
    }

    /// Distinct logical frames shown, in order (held frames collapse).
    pub fn shown_steps(&self) -> Vec<(u64, FrameSource)> {
        let mut steps: Vec<(u64, FrameSource)> = Vec::new();
        for p in &self.presentations {
            if steps.last().map(|(s, _)| *s) != Some(p.step) {
                steps.push((p.step, p.source));
            }
        }
        steps
    }

    /// Chunks in the order their first frame was shown.
    pub fn started_chunks(&self) -> Vec<u32> {
        let mut order = Vec::new();
        for (_, source) in self.shown_steps() {
            if let FrameSource::Overlay { chunk_index, .. } = source {
                if order.last() != Some(&chunk_index) {
                    order.push(chunk_index);
                }
            }
        }
        order
    }
}

impl PresentationSink for RecordingSink {
    fn present_frame(&mut self, presentation: &Presentation) {
        self.events.push(SinkEvent::Present {
            step: presentation.step,
            source: presentation.source,
        });
        self.presentations.push(presentation.clone());
    }

    fn start_audio(&mut self, chunk_index: u32, _payload: &Bytes) {
        self.events.push(SinkEvent::Audio(chunk_index));
    }

    fn on_all_chunks_complete(&mut self) {
        self.events.push(SinkEvent::AllComplete);
    }

    fn on_diagnostic(&mut self, event: &DiagnosticEvent) {
        self.events.push(SinkEvent::Diagnostic(event.clone()));
    }
}

/// Decodes any payload to a 1x1 image. Payloads starting with `b"bad"` fail.
pub struct TestDecoder;

impl ImageDecoder for TestDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, EngineError> {
        if bytes.starts_with(b"bad") {
            return Err(EngineError::DecodeFailed("corrupt payload".to_string()));
        }
        Ok(DecodedImage::new(
            1,
            1,
            vec![bytes.first().copied().unwrap_or(0), 0, 0, 255],
        ))
    }
}

/// Decoder that blocks every decode until the gate is opened.
#[derive(Clone, Default)]
pub struct GatedDecoder {
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl GatedDecoder {
    pub fn open(&self) {
        let (open, cvar) = &*self.gate;
        *open.lock() = true;
        cvar.notify_all();
    }
}

impl ImageDecoder for GatedDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, EngineError> {
        let (open, cvar) = &*self.gate;
        let mut guard = open.lock();
        while !*guard {
            cvar.wait(&mut guard);
        }
        TestDecoder.decode(bytes)
    }
}

pub fn base_frames(n: usize) -> Vec<ImageHandle> {
    (0..n)
        .map(|i| Arc::new(DecodedImage::new(1, 1, vec![i as u8, 0, 0, 255])))
        .collect()
}

/// Raw frames with sequence indices `0..matched.len()` and content keys.
pub fn raw_frames(sheet: &str, matched: &[u32]) -> Vec<RawOverlayFrame> {
    matched
        .iter()
        .enumerate()
        .map(|(seq, &m)| RawOverlayFrame {
            matched_base_frame: Some(i64::from(m)),
            sheet_id: Some(sheet.to_string()),
            sequence_index: Some(seq as i64),
            coordinates: Some(Rect::new(0.0, 0.0, 16.0, 16.0)),
            ..Default::default()
        })
        .collect()
}

/// Engine on a manual clock. Ticks advance one overlay frame unless a
/// different presentation interval is set.
pub struct Harness {
    pub engine: AvatarEngine,
    pub clock: ManualClock,
    pub sink: RecordingSink,
    interval: Duration,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_decoder(config, Arc::new(TestDecoder))
    }

    pub fn with_decoder(config: EngineConfig, decoder: Arc<dyn ImageDecoder>) -> Self {
        let clock = ManualClock::new();
        let frame = config.overlay_frame_duration();
        let mut engine = AvatarEngine::with_parts(config, decoder, Arc::new(clock.clone()));
        engine.load_base_animation("idle", base_frames(4), Some(4)).unwrap();
        engine.load_base_animation("talk", base_frames(24), Some(24)).unwrap();
        Self {
            engine,
            clock,
            sink: RecordingSink::default(),
            interval: frame,
        }
    }

    /// Presents at `hz` instead of at the overlay rate.
    pub fn presenting_at(mut self, hz: u64) -> Self {
        self.interval = Duration::from_nanos(1_000_000_000_u64.div_ceil(hz));
        self
    }

    pub fn tick(&mut self) {
        self.tick_after(self.interval);
    }

    pub fn tick_after(&mut self, elapsed: Duration) {
        self.clock.advance(elapsed);
        self.engine.tick(&mut self.sink);
    }

    /// Ticks once and reports whether a logical step was taken.
    pub fn tick_stepped(&mut self) -> bool {
        let before = self.engine.metrics().snapshot().logical_steps;
        self.tick();
        self.engine.metrics().snapshot().logical_steps > before
    }

    pub fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    pub fn enqueue(&mut self, chunk_index: u32, frames: &[RawOverlayFrame]) {
        self.engine
            .enqueue_chunk(chunk_index, "talk", Point::default(), frames)
            .unwrap();
    }

    /// Makes frames decoded without going through a worker.
    pub fn ready(&self, chunk_index: u32, frames: &[RawOverlayFrame]) {
        for raw in frames {
            self.engine.cache().put_decoded(
                raw.cache_key(chunk_index, "talk"),
                Arc::new(DecodedImage::new(1, 1, vec![0; 4])),
                chunk_index,
            );
        }
    }

    pub fn settle(&self) {
        wait_for_decodes(|| self.engine.cache().pending_decodes());
    }
}

pub fn wait_for_decodes(pending: impl Fn() -> usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while pending() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(pending(), 0, "decodes did not settle");
}
