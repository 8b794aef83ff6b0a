//! Gates speech audio on the first visual frame of its chunk.
//!
//! Audio bytes usually arrive well before the chunk's overlays have decoded.
//! Playing them on arrival puts the voice ahead of the lips, so payloads are
//! held here until the synchronizer presents the chunk's first frame.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use crate::types::ChunkHistory;

/// Audio received for a chunk.
#[derive(Debug, Clone)]
pub struct PendingAudio {
    pub chunk_index: u32,
    pub payload: Bytes,
    pub started: bool,
}

/// A "play this now" signal for the audio layer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStart {
    pub chunk_index: u32,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
pub struct AudioSyncCoordinator {
    pending: HashMap<u32, PendingAudio>,
    /// Chunks whose first frame has been presented
    visual_started: HashSet<u32>,
    /// Bounded even when the stream never signals its end
    finished: ChunkHistory,
}

impl AudioSyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores audio for a chunk.
    ///
    /// Returns a start signal only if the chunk's first frame was already
    /// presented (audio arrived late). Audio for a finished chunk, or a
    /// second payload for a started one, is ignored.
    pub fn queue_audio(&mut self, chunk_index: u32, payload: Bytes) -> Option<AudioStart> {
        if self.finished.contains(chunk_index) {
            tracing::debug!("Ignoring audio for finished chunk {}", chunk_index);
            return None;
        }
        if let Some(existing) = self.pending.get_mut(&chunk_index) {
            if existing.started {
                tracing::warn!(
                    "Chunk {} audio already started, ignoring new payload",
                    chunk_index
                );
                return None;
            }
            existing.payload = payload;
        } else {
            self.pending.insert(
                chunk_index,
                PendingAudio {
                    chunk_index,
                    payload,
                    started: false,
                },
            );
        }

        if self.visual_started.contains(&chunk_index) {
            tracing::debug!("Late audio for chunk {}, starting now", chunk_index);
            return self.fire(chunk_index);
        }
        None
    }

    /// Records that the chunk's first frame is on screen. Returns the start
    /// signal the first time, if audio is queued. Repeat calls are no-ops.
    pub fn notify_chunk_started(&mut self, chunk_index: u32) -> Option<AudioStart> {
        if !self.visual_started.insert(chunk_index) {
            return None;
        }
        self.fire(chunk_index)
    }

    fn fire(&mut self, chunk_index: u32) -> Option<AudioStart> {
        let entry = self.pending.get_mut(&chunk_index)?;
        if entry.started {
            return None;
        }
        entry.started = true;
        Some(AudioStart {
            chunk_index,
            payload: entry.payload.clone(),
        })
    }

    /// Releases everything held for a chunk that finished playing.
    pub fn finish_chunk(&mut self, chunk_index: u32) {
        self.pending.remove(&chunk_index);
        self.visual_started.remove(&chunk_index);
        self.finished.insert(chunk_index);
    }

    /// Forgets finished-chunk history so indices can be reused by the next
    /// response.
    pub fn end_response(&mut self) {
        self.finished.clear();
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.visual_started.clear();
        self.finished.clear();
    }

    pub fn pending(&self, chunk_index: u32) -> Option<&PendingAudio> {
        self.pending.get(&chunk_index)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_finished(&self, chunk_index: u32) -> bool {
        self.finished.contains(chunk_index)
    }
}
