//! Assembles chunks from metadata and frame batches that may arrive out of
//! order.
//!
//! A chunk is finalized only when its metadata is known, the transport has
//! signalled it ready, and every announced batch has arrived. Image bytes are
//! handed to the cache as soon as their key can be computed, so individual
//! frames can become ready long before the chunk itself is finalized.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use crate::diagnostics::DiagnosticEvent;
use crate::error::EngineError;
use crate::types::{
    CacheKey, ChunkHistory, ChunkMetadata, OverlayChunk, OverlayFrame, RawChunkMetadata,
    RawOverlayFrame,
};

/// One overlay frame as delivered in a batch, with its image if sent inline.
#[derive(Debug, Clone, Default)]
pub struct BatchFrame {
    pub frame: RawOverlayFrame,
    pub image: Option<Bytes>,
}

/// A group of frames for one chunk section.
#[derive(Debug, Clone, Default)]
pub struct FrameBatch {
    pub chunk_index: u32,
    pub batch_index: u32,
    /// Applied to frames that do not carry their own section index
    pub section_index: u32,
    pub frames: Vec<BatchFrame>,
}

#[derive(Debug)]
pub enum AssemblyOutcome {
    /// Still waiting on metadata, batches or the ready signal
    Pending,
    Complete(OverlayChunk),
    Dropped(DiagnosticEvent),
}

/// Result of feeding one message to the assembler.
#[derive(Debug)]
pub struct AssemblyStep {
    pub chunk_index: u32,
    /// Images whose keys are now known, to be put in the cache
    pub images: Vec<(CacheKey, Bytes)>,
    pub outcome: AssemblyOutcome,
}

#[derive(Debug, Default)]
struct PartialChunk {
    metadata: Option<ChunkMetadata>,
    frames: Vec<RawOverlayFrame>,
    /// Images that arrived before the metadata needed to key them
    unkeyed_images: Vec<(RawOverlayFrame, Bytes)>,
    batches: HashSet<u32>,
    ready: bool,
}

impl PartialChunk {
    fn is_complete(&self) -> bool {
        match &self.metadata {
            Some(meta) => {
                self.ready
                    && meta
                        .expected_batches
                        .map_or(true, |n| self.batches.len() >= n as usize)
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChunkAssembler {
    partial: HashMap<u32, PartialChunk>,
    finalized: ChunkHistory,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records chunk metadata.
    pub fn begin_chunk(&mut self, raw: &RawChunkMetadata) -> Result<AssemblyStep, EngineError> {
        let metadata = ChunkMetadata::from_raw(raw)?;
        let chunk_index = metadata.chunk_index;
        self.reject_finalized(chunk_index)?;

        let partial = self.partial.entry(chunk_index).or_default();
        if partial.metadata.is_some() {
            tracing::warn!("Chunk {} metadata received twice, replacing", chunk_index);
        }
        tracing::debug!(
            "Chunk {} metadata: '{}', {:?} batches",
            chunk_index,
            metadata.animation_name,
            metadata.expected_batches
        );
        let images = partial
            .unkeyed_images
            .drain(..)
            .map(|(frame, bytes)| (frame.cache_key(chunk_index, &metadata.animation_name), bytes))
            .collect();
        partial.metadata = Some(metadata);
        Ok(self.step(chunk_index, images))
    }

    /// Records a frame batch.
    pub fn add_batch(&mut self, batch: FrameBatch) -> Result<AssemblyStep, EngineError> {
        let chunk_index = batch.chunk_index;
        self.reject_finalized(chunk_index)?;

        let partial = self.partial.entry(chunk_index).or_default();
        if !partial.batches.insert(batch.batch_index) {
            tracing::warn!(
                "Chunk {} batch {} received twice, ignoring",
                chunk_index,
                batch.batch_index
            );
            return Ok(AssemblyStep {
                chunk_index,
                images: Vec::new(),
                outcome: AssemblyOutcome::Pending,
            });
        }

        let mut images = Vec::new();
        for BatchFrame { mut frame, image } in batch.frames {
            if frame.section_index.is_none() {
                frame.section_index = Some(i64::from(batch.section_index));
            }
            if let Some(bytes) = image {
                match &partial.metadata {
                    Some(meta) => {
                        images.push((frame.cache_key(chunk_index, &meta.animation_name), bytes))
                    }
                    None => partial.unkeyed_images.push((frame.clone(), bytes)),
                }
            }
            partial.frames.push(frame);
        }
        tracing::trace!(
            "Chunk {} batch {} ({} frames so far)",
            chunk_index,
            batch.batch_index,
            partial.frames.len()
        );
        Ok(self.step(chunk_index, images))
    }

    /// Records the transport's "all frames sent" signal for a chunk.
    pub fn mark_ready(&mut self, chunk_index: u32) -> Result<AssemblyStep, EngineError> {
        self.reject_finalized(chunk_index)?;
        self.partial.entry(chunk_index).or_default().ready = true;
        Ok(self.step(chunk_index, Vec::new()))
    }

    /// Closes the current response so the next one can reuse chunk indices.
    ///
    /// Chunks still incomplete can no longer finish; their indices are
    /// returned in ascending order.
    pub fn end_response(&mut self) -> Vec<u32> {
        let mut abandoned: Vec<u32> = self.partial.drain().map(|(index, _)| index).collect();
        abandoned.sort_unstable();
        self.finalized.clear();
        abandoned
    }

    /// Forgets all partial and finalized chunks.
    pub fn clear(&mut self) {
        self.partial.clear();
        self.finalized.clear();
    }

    /// Chunks with at least one message received and not yet finalized.
    pub fn in_progress(&self) -> usize {
        self.partial.len()
    }

    fn reject_finalized(&self, chunk_index: u32) -> Result<(), EngineError> {
        if self.finalized.contains(chunk_index) {
            tracing::warn!("Late message for finalized chunk {}", chunk_index);
            return Err(EngineError::MalformedChunk(format!(
                "chunk {chunk_index} already finalized"
            )));
        }
        Ok(())
    }

    fn step(&mut self, chunk_index: u32, images: Vec<(CacheKey, Bytes)>) -> AssemblyStep {
        let complete = self
            .partial
            .get(&chunk_index)
            .is_some_and(PartialChunk::is_complete);
        let outcome = if complete {
            self.finalize(chunk_index)
        } else {
            AssemblyOutcome::Pending
        };
        AssemblyStep {
            chunk_index,
            images,
            outcome,
        }
    }

    fn finalize(&mut self, chunk_index: u32) -> AssemblyOutcome {
        self.finalized.insert(chunk_index);
        let Some(PartialChunk {
            metadata: Some(meta),
            frames: raw_frames,
            ..
        }) = self.partial.remove(&chunk_index)
        else {
            return AssemblyOutcome::Pending;
        };

        let mut frames = Vec::with_capacity(raw_frames.len());
        for raw in &raw_frames {
            match OverlayFrame::from_raw(raw, chunk_index, &meta.animation_name) {
                Ok(frame) => frames.push(frame),
                Err(e) => tracing::warn!("Chunk {}: dropping frame: {}", chunk_index, e),
            }
        }

        if frames.is_empty() {
            tracing::warn!("Chunk {} ready with no usable frames, dropping", chunk_index);
            return AssemblyOutcome::Dropped(DiagnosticEvent::ChunkDropped {
                chunk_index: Some(chunk_index),
                reason: "ready signal received but no frames assembled".to_string(),
            });
        }
        match OverlayChunk::new(
            chunk_index,
            meta.animation_name,
            meta.zone_top_left,
            frames,
        ) {
            Ok(chunk) => {
                tracing::debug!("Chunk {} assembled ({} frames)", chunk_index, chunk.len());
                AssemblyOutcome::Complete(chunk)
            }
            Err(e) => {
                tracing::warn!("Chunk {} rejected: {}", chunk_index, e);
                AssemblyOutcome::Dropped(DiagnosticEvent::ChunkDropped {
                    chunk_index: Some(chunk_index),
                    reason: e.to_string(),
                })
            }
        }
    }
}
