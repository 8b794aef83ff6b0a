//! avatar-sync-core: frame-accurate overlay synchronization for talking avatars.
//!
//! The engine composites a looping base animation with streamed lip-sync
//! overlay frames and starts each chunk's speech audio on the exact tick its
//! first frame is shown. It contains:
//!
//! - Data model and wire validation: [`types`], [`error`], [`config`]
//! - Streaming cache with background decode: [`image_cache`]
//! - Buffering and playback: [`chunk_queue`], [`playback`], [`assembler`]
//! - Per-tick decisions: [`synchronizer`], [`render_clock`], [`audio_sync`]
//! - Output: [`sink`], [`handoff`], [`diagnostics`]
//! - The instance itself: [`engine`]
//!
//! Rendering, audio output and transport are left to the host. A host
//! implements [`PresentationSink`] (or uses [`presentation_handoff`]) and
//! calls [`AvatarEngine::tick`] from its render loop.

pub mod animation;
pub mod assembler;
pub mod audio_sync;
pub mod chunk_queue;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod handoff;
pub mod image_cache;
pub mod playback;
pub mod render_clock;
pub mod sink;
pub mod synchronizer;
pub mod types;

pub use assembler::{BatchFrame, FrameBatch};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use diagnostics::{DiagnosticEvent, EngineMetrics, MetricsSnapshot};
pub use engine::{AvatarEngine, EngineHandle};
pub use error::EngineError;
pub use handoff::{presentation_handoff, HandoffReader, HandoffSink};
pub use image_cache::{FrameStatus, ImageDecoder, RasterDecoder};
pub use playback::PlaybackPhase;
pub use sink::{FrameSource, OverlayPlacement, Presentation, PresentationSink};
pub use types::{
    CacheKey, DecodedImage, ImageHandle, OverlayChunk, OverlayFrame, Point, RawChunkMetadata,
    RawOverlayFrame, Rect,
};
