//! Core data model: overlay frames, chunks, cache keys and decoded images.
//!
//! Everything that crosses the transport boundary arrives as a `Raw*` struct
//! (all fields optional, the shape the backend sends) and is validated into
//! an immutable, strongly-typed value before it reaches the engine.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;

use crate::error::EngineError;

/// A 2D point in screen space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Returns this rect moved by `offset`.
    pub fn translated(&self, offset: Point) -> Self {
        Self {
            x: self.x + offset.x,
            y: self.y + offset.y,
            ..*self
        }
    }

    /// True if every component is finite and the size is non-negative.
    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width >= 0.0
            && self.height >= 0.0
    }
}

/// A decoded RGBA8 image.
///
/// Pixel data is reference-counted so presentations can be cloned every tick
/// without copying.
#[derive(Clone)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    pixels: Bytes,
}

impl DecodedImage {
    pub fn new(width: u32, height: u32, pixels: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Raw RGBA8 pixels, row-major, no padding.
    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// Approximate memory cost used for cache accounting.
    pub fn byte_cost(&self) -> usize {
        self.pixels.len().max(1)
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Shared handle to a decoded image.
pub type ImageHandle = Arc<DecodedImage>;

/// Identity of an overlay image in the cache.
///
/// Keys are derived from what the image *is*, not where it sits in the
/// stream, so the same lip shape referenced by two chunks hits the same
/// cache line. Derivation priority:
///
/// 1. an explicit id supplied by the source data,
/// 2. `animation_name + matched_base_frame + sheet_id`,
/// 3. `chunk_index + section_index + sequence_index` as a last resort.
///
/// Positional keys are weaker: two different images that land on the same
/// position in different chunks share a key, so a stale line could be served
/// while the newer payload is still decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    const EXPLICIT_PREFIX: &'static str = "id:";
    const POSITIONAL_PREFIX: &'static str = "pos:";

    pub fn explicit(id: &str) -> Self {
        Self(format!("{}{id}", Self::EXPLICIT_PREFIX).into())
    }

    pub fn content(animation_name: &str, matched_base_frame: u32, sheet_id: &str) -> Self {
        Self(format!("{animation_name}/{matched_base_frame}/{sheet_id}").into())
    }

    pub fn positional(chunk_index: u32, section_index: u32, sequence_index: u32) -> Self {
        Self(
            format!(
                "{}{chunk_index}/{section_index}/{sequence_index}",
                Self::POSITIONAL_PREFIX
            )
            .into(),
        )
    }

    /// Derives a key from whatever identity the source data carries.
    pub fn derive(source: &KeySource<'_>) -> Self {
        if let Some(id) = source.explicit_id.filter(|id| !id.is_empty()) {
            return Self::explicit(id);
        }
        match (
            source.animation_name.filter(|n| !n.is_empty()),
            source.matched_base_frame,
            source.sheet_id.filter(|s| !s.is_empty()),
        ) {
            (Some(animation), Some(matched), Some(sheet)) => {
                Self::content(animation, matched, sheet)
            }
            _ => Self::positional(
                source.chunk_index,
                source.section_index,
                source.sequence_index,
            ),
        }
    }

    /// True if this key fell back to stream position.
    pub fn is_positional(&self) -> bool {
        self.0.starts_with(Self::POSITIONAL_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}

/// Inputs to [`CacheKey::derive`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KeySource<'a> {
    pub explicit_id: Option<&'a str>,
    pub animation_name: Option<&'a str>,
    pub matched_base_frame: Option<u32>,
    pub sheet_id: Option<&'a str>,
    pub chunk_index: u32,
    pub section_index: u32,
    pub sequence_index: u32,
}

/// Overlay frame metadata exactly as the transport hands it over.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOverlayFrame {
    pub id: Option<String>,
    pub matched_base_frame: Option<i64>,
    pub sheet_id: Option<String>,
    pub sequence_index: Option<i64>,
    pub section_index: Option<i64>,
    pub coordinates: Option<Rect>,
    pub animation_name: Option<String>,
    #[serde(rename = "char")]
    pub character: Option<String>,
}

impl RawOverlayFrame {
    /// The key this frame's image is cached under.
    ///
    /// Transports that push images through `cache_overlay_image` must use
    /// this (or [`OverlayFrame::cache_key`]) so writes and lookups agree.
    pub fn cache_key(&self, chunk_index: u32, chunk_animation: &str) -> CacheKey {
        let animation = self
            .animation_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(chunk_animation);
        CacheKey::derive(&KeySource {
            explicit_id: self.id.as_deref(),
            animation_name: Some(animation),
            matched_base_frame: self
                .matched_base_frame
                .and_then(|m| u32::try_from(m).ok()),
            sheet_id: self.sheet_id.as_deref(),
            chunk_index,
            section_index: self
                .section_index
                .and_then(|s| u32::try_from(s).ok())
                .unwrap_or(0),
            sequence_index: self
                .sequence_index
                .and_then(|s| u32::try_from(s).ok())
                .unwrap_or(0),
        })
    }
}

fn non_negative(field: &str, value: Option<i64>) -> Result<u32, EngineError> {
    let value = value.ok_or_else(|| EngineError::MalformedFrame(format!("missing {field}")))?;
    u32::try_from(value)
        .map_err(|_| EngineError::MalformedFrame(format!("{field} out of range: {value}")))
}

/// One overlay (lip-sync) image and the base frame it must be shown with.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayFrame {
    /// Base-animation sprite this overlay belongs on (taken modulo the
    /// animation's length at presentation time)
    pub matched_base_frame: u32,
    pub sheet_id: Arc<str>,
    /// Position of this frame within its chunk
    pub sequence_index: u32,
    /// Placement relative to the chunk's zone
    pub coordinates: Rect,
    pub cache_key: CacheKey,
    /// Base animation this frame is authored against; may differ per frame
    pub animation_name: Arc<str>,
    pub character: Option<String>,
}

impl OverlayFrame {
    /// Validates raw wire metadata into an overlay frame.
    ///
    /// `chunk_animation` is used when the frame does not name its own
    /// base animation.
    pub fn from_raw(
        raw: &RawOverlayFrame,
        chunk_index: u32,
        chunk_animation: &str,
    ) -> Result<Self, EngineError> {
        let matched_base_frame = non_negative("matchedBaseFrame", raw.matched_base_frame)?;
        let sequence_index = non_negative("sequenceIndex", raw.sequence_index)?;
        if let Some(section) = raw.section_index {
            non_negative("sectionIndex", Some(section))?;
        }

        let coordinates = raw
            .coordinates
            .ok_or_else(|| EngineError::MalformedFrame("missing coordinates".to_string()))?;
        if !coordinates.is_valid() {
            return Err(EngineError::MalformedFrame(format!(
                "invalid coordinates {coordinates:?}"
            )));
        }

        let animation_name: Arc<str> = raw
            .animation_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(chunk_animation)
            .into();
        if animation_name.is_empty() {
            return Err(EngineError::MalformedFrame(
                "no animation name on frame or chunk".to_string(),
            ));
        }

        Ok(Self {
            matched_base_frame,
            sheet_id: raw.sheet_id.as_deref().unwrap_or_default().into(),
            sequence_index,
            coordinates,
            cache_key: raw.cache_key(chunk_index, chunk_animation),
            animation_name,
            character: raw.character.clone(),
        })
    }
}

/// Chunk metadata as the transport hands it over.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChunkMetadata {
    pub chunk_index: Option<i64>,
    pub animation_name: Option<String>,
    pub zone_top_left: Option<Point>,
    /// Number of frame batches the chunk will be delivered in, if announced
    pub expected_batches: Option<i64>,
}

/// Validated chunk metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMetadata {
    pub chunk_index: u32,
    pub animation_name: Arc<str>,
    pub zone_top_left: Point,
    pub expected_batches: Option<u32>,
}

impl ChunkMetadata {
    pub fn from_raw(raw: &RawChunkMetadata) -> Result<Self, EngineError> {
        let chunk_index = raw
            .chunk_index
            .ok_or_else(|| EngineError::MalformedChunk("missing chunkIndex".to_string()))?;
        let chunk_index = u32::try_from(chunk_index).map_err(|_| {
            EngineError::MalformedChunk(format!("chunkIndex out of range: {chunk_index}"))
        })?;
        let animation_name = raw
            .animation_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                EngineError::MalformedChunk(format!("chunk {chunk_index} has no animationName"))
            })?;
        let expected_batches = match raw.expected_batches {
            None => None,
            Some(n) => Some(u32::try_from(n).map_err(|_| {
                EngineError::MalformedChunk(format!("expectedBatches out of range: {n}"))
            })?),
        };
        Ok(Self {
            chunk_index,
            animation_name: animation_name.into(),
            zone_top_left: raw.zone_top_left.unwrap_or_default(),
            expected_batches,
        })
    }
}

/// One streamed segment of overlay frames.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayChunk {
    pub chunk_index: u32,
    /// Nominal base animation; individual frames may override it
    pub animation_name: Arc<str>,
    /// Frames ordered by `sequence_index`, never empty
    pub frames: Vec<OverlayFrame>,
    /// Screen position of the overlay zone
    pub zone_top_left: Point,
}

impl OverlayChunk {
    /// Builds a chunk, ordering frames by sequence index.
    ///
    /// Rejects empty chunks and duplicate sequence indices.
    pub fn new(
        chunk_index: u32,
        animation_name: impl Into<Arc<str>>,
        zone_top_left: Point,
        mut frames: Vec<OverlayFrame>,
    ) -> Result<Self, EngineError> {
        if frames.is_empty() {
            return Err(EngineError::MalformedChunk(format!(
                "chunk {chunk_index} has no frames"
            )));
        }
        frames.sort_by_key(|f| f.sequence_index);
        if let Some(pair) = frames
            .windows(2)
            .find(|w| w[0].sequence_index == w[1].sequence_index)
        {
            return Err(EngineError::MalformedChunk(format!(
                "chunk {chunk_index} repeats sequence index {}",
                pair[0].sequence_index
            )));
        }
        Ok(Self {
            chunk_index,
            animation_name: animation_name.into(),
            frames,
            zone_top_left,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&OverlayFrame> {
        self.frames.get(index)
    }

    pub fn last_index(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    /// Length of the leading run of frames whose sequence indices have no gaps.
    pub fn contiguous_prefix(&self) -> usize {
        let Some(first) = self.frames.first() else {
            return 0;
        };
        self.frames
            .iter()
            .enumerate()
            .take_while(|(i, f)| f.sequence_index as usize == first.sequence_index as usize + i)
            .count()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.frames.iter().map(|f| &f.cache_key)
    }
}

/// Explicit indices kept above the floor before the lowest are folded in.
pub const CHUNK_HISTORY_LIMIT: usize = 64;

/// Chunk indices that are done with, for rejecting late messages.
///
/// Indices that complete in order fold into a floor, and every index below
/// the floor counts as a member. If more than [`CHUNK_HISTORY_LIMIT`]
/// indices pile up above a gap, the floor is raised past the lowest of
/// them, so memory stays bounded over a long session.
#[derive(Debug, Clone, Default)]
pub struct ChunkHistory {
    floor: u32,
    above: BTreeSet<u32>,
}

impl ChunkHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chunk_index: u32) {
        if chunk_index < self.floor {
            return;
        }
        self.above.insert(chunk_index);
        self.compact();
        while self.above.len() > CHUNK_HISTORY_LIMIT {
            let Some(lowest) = self.above.pop_first() else {
                break;
            };
            self.floor = lowest.saturating_add(1);
            self.compact();
        }
    }

    pub fn contains(&self, chunk_index: u32) -> bool {
        chunk_index < self.floor || self.above.contains(&chunk_index)
    }

    pub fn clear(&mut self) {
        self.floor = 0;
        self.above.clear();
    }

    /// Indices held explicitly above the floor.
    pub fn tracked(&self) -> usize {
        self.above.len()
    }

    fn compact(&mut self) {
        while self.floor < u32::MAX && self.above.remove(&self.floor) {
            self.floor += 1;
        }
    }
}
