//! FIFO queue of chunks waiting for playback, with adaptive buffer gating.
//!
//! A chunk may leave the queue once the first `min_frames_before_start`
//! frames, taken in sequence order and without skipping an unresolved one,
//! have resolved in the cache. Readiness is re-checked on a fixed interval,
//! or immediately after the cache reports progress. A chunk that waits past
//! `max_buffer_wait` is released anyway.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::image_cache::ImageCache;
use crate::types::OverlayChunk;

/// Outcome of a buffer check on the head chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferReadiness {
    Ready,
    /// Waited too long; start with whatever has resolved
    TimedOut {
        resolved: usize,
        required: usize,
        waited: Duration,
    },
    NotReady {
        resolved: usize,
        required: usize,
    },
}

impl BufferReadiness {
    /// True if the chunk may leave the queue.
    pub fn can_start(&self) -> bool {
        !matches!(self, BufferReadiness::NotReady { .. })
    }
}

/// A chunk in the queue plus its buffering bookkeeping.
#[derive(Debug)]
pub struct QueuedChunk {
    pub chunk: Arc<OverlayChunk>,
    pub queued_at: Instant,
    /// The cache reported every key of this chunk resolved
    prefetched: bool,
    /// Cache progress since the last check
    dirty: bool,
    next_check: Instant,
    resolved: usize,
}

impl QueuedChunk {
    pub fn chunk_index(&self) -> u32 {
        self.chunk.chunk_index
    }

    pub fn is_prefetched(&self) -> bool {
        self.prefetched
    }
}

/// FIFO of chunks awaiting playback.
#[derive(Debug)]
pub struct ChunkQueue {
    chunks: VecDeque<QueuedChunk>,
    min_frames_before_start: usize,
    max_buffer_wait: Duration,
    retry_interval: Duration,
}

impl ChunkQueue {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            chunks: VecDeque::new(),
            min_frames_before_start: config.min_frames_before_start.max(1),
            max_buffer_wait: config.max_buffer_wait,
            retry_interval: config.buffer_retry_interval,
        }
    }

    pub fn enqueue(&mut self, chunk: Arc<OverlayChunk>, now: Instant) {
        if chunk.contiguous_prefix() < chunk.len() {
            tracing::debug!(
                "Chunk {} has gaps in its sequence indices",
                chunk.chunk_index
            );
        }
        self.chunks.push_back(QueuedChunk {
            chunk,
            queued_at: now,
            prefetched: false,
            dirty: true,
            next_check: now,
            resolved: 0,
        });
    }

    pub fn head(&self) -> Option<&QueuedChunk> {
        self.chunks.front()
    }

    /// Checks whether the head chunk's buffer allows it to start.
    ///
    /// The cache is only consulted when the head is dirty or its retry
    /// interval has elapsed; otherwise the last count is reused.
    pub fn head_readiness(&mut self, cache: &ImageCache, now: Instant) -> Option<BufferReadiness> {
        let head = self.chunks.front_mut()?;
        let required = self.min_frames_before_start.min(head.chunk.len());
        if head.prefetched {
            return Some(BufferReadiness::Ready);
        }

        if head.dirty || now >= head.next_check {
            head.resolved = head
                .chunk
                .frames
                .iter()
                .take(required)
                .take_while(|frame| cache.status(&frame.cache_key).is_resolved())
                .count();
            head.dirty = false;
            head.next_check = now + self.retry_interval;
            tracing::trace!(
                "Chunk {} buffer: {}/{} frames resolved",
                head.chunk.chunk_index,
                head.resolved,
                required
            );
        }

        if head.resolved >= required {
            return Some(BufferReadiness::Ready);
        }
        let waited = now.saturating_duration_since(head.queued_at);
        if waited >= self.max_buffer_wait {
            return Some(BufferReadiness::TimedOut {
                resolved: head.resolved,
                required,
                waited,
            });
        }
        Some(BufferReadiness::NotReady {
            resolved: head.resolved,
            required,
        })
    }

    /// Records that every key of `chunk_index` has resolved. Returns false if
    /// the chunk is not queued.
    pub fn mark_prefetched(&mut self, chunk_index: u32) -> bool {
        match self
            .chunks
            .iter_mut()
            .find(|q| q.chunk.chunk_index == chunk_index)
        {
            Some(queued) => {
                queued.prefetched = true;
                true
            }
            None => false,
        }
    }

    /// Forces the next readiness check on the head to consult the cache.
    pub fn mark_head_dirty(&mut self) {
        if let Some(head) = self.chunks.front_mut() {
            head.dirty = true;
        }
    }

    pub fn pop_front(&mut self) -> Option<QueuedChunk> {
        self.chunks.pop_front()
    }

    /// Empties the queue, returning the indices that were dropped.
    pub fn clear(&mut self) -> Vec<u32> {
        self.chunks.drain(..).map(|q| q.chunk.chunk_index).collect()
    }

    pub fn chunk_indices(&self) -> Vec<u32> {
        self.chunks.iter().map(|q| q.chunk.chunk_index).collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
