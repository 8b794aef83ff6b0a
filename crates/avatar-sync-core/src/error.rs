//! Error types for the sync engine.
//!
//! Nothing here is fatal to playback. Errors are returned at the inbound
//! boundary (wire validation, animation loading) so the transport layer can
//! log and drop the offending payload; inside the tick path every failure
//! degrades to a stall, a missing overlay or a late start.

use std::fmt;

/// Errors that can occur while feeding data into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Overlay frame metadata is missing a required field or holds an invalid value
    MalformedFrame(String),
    /// Chunk metadata is inconsistent or the chunk has no usable frames
    MalformedChunk(String),
    /// A base animation was registered without frames
    EmptyAnimation(String),
    /// Image bytes could not be decoded
    DecodeFailed(String),
    /// The engine behind a handle has been dropped
    Disconnected,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::MalformedFrame(msg) => write!(f, "Malformed overlay frame: {msg}"),
            EngineError::MalformedChunk(msg) => write!(f, "Malformed chunk: {msg}"),
            EngineError::EmptyAnimation(name) => {
                write!(f, "Base animation '{name}' has no frames")
            }
            EngineError::DecodeFailed(msg) => write!(f, "Image decode failed: {msg}"),
            EngineError::Disconnected => write!(f, "Engine has been dropped"),
        }
    }
}

impl std::error::Error for EngineError {}
