//! Cross-thread handoff of engine output.
//!
//! The engine ticks on one thread; a platform renderer usually draws on
//! another. [`presentation_handoff`] returns a writer that implements
//! [`PresentationSink`] and a cloneable reader. The reader always sees the
//! latest presentation and never blocks the tick for longer than a pointer
//! swap. Audio starts and diagnostics are queued so none are lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::audio_sync::AudioStart;
use crate::diagnostics::DiagnosticEvent;
use crate::sink::{Presentation, PresentationSink};

struct HandoffInner {
    latest: Mutex<Option<Presentation>>,
    /// A presentation with a newer step was written since the last read
    fresh: AtomicBool,
    all_complete: AtomicBool,
    last_step: Mutex<Option<u64>>,
}

/// Tick-side end. Pass it to `AvatarEngine::tick`.
pub struct HandoffSink {
    inner: Arc<HandoffInner>,
    audio: Sender<AudioStart>,
    diagnostics: Sender<DiagnosticEvent>,
}

/// Render-side end.
#[derive(Clone)]
pub struct HandoffReader {
    inner: Arc<HandoffInner>,
    audio: Receiver<AudioStart>,
    diagnostics: Receiver<DiagnosticEvent>,
}

impl PresentationSink for HandoffSink {
    fn present_frame(&mut self, presentation: &Presentation) {
        // Held frames repeat the same step; only publish real changes.
        {
            let mut last_step = self.inner.last_step.lock();
            if *last_step == Some(presentation.step) {
                return;
            }
            *last_step = Some(presentation.step);
        }
        *self.inner.latest.lock() = Some(presentation.clone());
        self.inner.fresh.store(true, Ordering::Release);
    }

    fn start_audio(&mut self, chunk_index: u32, payload: &Bytes) {
        let _ = self.audio.send(AudioStart {
            chunk_index,
            payload: payload.clone(),
        });
    }

    fn on_all_chunks_complete(&mut self) {
        self.inner.all_complete.store(true, Ordering::Release);
    }

    fn on_diagnostic(&mut self, event: &DiagnosticEvent) {
        let _ = self.diagnostics.send(event.clone());
    }
}

impl HandoffReader {
    /// Returns the latest presentation if it changed since the last read.
    pub fn read(&self) -> Option<Presentation> {
        if !self.inner.fresh.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.inner.latest.lock().clone()
    }

    /// Returns the latest presentation regardless of freshness.
    pub fn peek(&self) -> Option<Presentation> {
        self.inner.latest.lock().clone()
    }

    pub fn has_new_frame(&self) -> bool {
        self.inner.fresh.load(Ordering::Acquire)
    }

    /// Audio starts issued since the last call, in order.
    pub fn take_audio_starts(&self) -> Vec<AudioStart> {
        self.audio.try_iter().collect()
    }

    pub fn take_diagnostics(&self) -> Vec<DiagnosticEvent> {
        self.diagnostics.try_iter().collect()
    }

    /// True once per all-chunks-complete notification.
    pub fn take_all_complete(&self) -> bool {
        self.inner.all_complete.swap(false, Ordering::AcqRel)
    }
}

/// Creates a connected (sink, reader) pair.
pub fn presentation_handoff() -> (HandoffSink, HandoffReader) {
    let inner = Arc::new(HandoffInner {
        latest: Mutex::new(None),
        fresh: AtomicBool::new(false),
        all_complete: AtomicBool::new(false),
        last_step: Mutex::new(None),
    });
    let (audio_tx, audio_rx) = crossbeam_channel::unbounded();
    let (diag_tx, diag_rx) = crossbeam_channel::unbounded();
    (
        HandoffSink {
            inner: Arc::clone(&inner),
            audio: audio_tx,
            diagnostics: diag_tx,
        },
        HandoffReader {
            inner,
            audio: audio_rx,
            diagnostics: diag_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::FrameSource;
    use crate::types::DecodedImage;

    fn presentation(step: u64, base_index: usize) -> Presentation {
        Presentation {
            step,
            animation_name: "idle".into(),
            base_index,
            base_image: Arc::new(DecodedImage::new(1, 1, vec![0; 4])),
            overlays: Vec::new(),
            source: FrameSource::Idle,
        }
    }

    #[test]
    fn test_latest_wins() {
        let (mut sink, reader) = presentation_handoff();
        assert!(reader.read().is_none());

        sink.present_frame(&presentation(1, 1));
        sink.present_frame(&presentation(2, 2));
        assert!(reader.has_new_frame());
        assert_eq!(reader.read().unwrap().base_index, 2);
        assert!(reader.read().is_none());
        assert_eq!(reader.peek().unwrap().base_index, 2);
    }

    #[test]
    fn test_repeated_step_not_fresh() {
        let (mut sink, reader) = presentation_handoff();
        sink.present_frame(&presentation(7, 3));
        reader.read();
        sink.present_frame(&presentation(7, 3));
        assert!(!reader.has_new_frame());
    }

    #[test]
    fn test_audio_and_completion_queued() {
        let (mut sink, reader) = presentation_handoff();
        sink.start_audio(0, &Bytes::from_static(b"a"));
        sink.start_audio(1, &Bytes::from_static(b"b"));
        sink.on_all_chunks_complete();

        let starts = reader.take_audio_starts();
        assert_eq!(
            starts.iter().map(|s| s.chunk_index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert!(reader.take_all_complete());
        assert!(!reader.take_all_complete());
    }
}
