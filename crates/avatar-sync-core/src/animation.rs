//! Loaded base animations.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineError;
use crate::types::ImageHandle;

/// One looping base animation. Immutable once loaded.
#[derive(Debug)]
pub struct AnimationFrameSet {
    name: Arc<str>,
    frames: Vec<ImageHandle>,
}

impl AnimationFrameSet {
    pub fn new(name: impl Into<Arc<str>>, frames: Vec<ImageHandle>) -> Result<Self, EngineError> {
        let name = name.into();
        if frames.is_empty() {
            return Err(EngineError::EmptyAnimation(name.to_string()));
        }
        Ok(Self { name, frames })
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, index: usize) -> Option<&ImageHandle> {
        self.frames.get(index)
    }

    /// Maps a matched base frame onto this animation.
    ///
    /// Overlay data may reference sprite numbers past the end of the base
    /// animation; those wrap around.
    pub fn wrap_index(&self, matched_base_frame: u32) -> usize {
        matched_base_frame as usize % self.frames.len()
    }
}

/// Base animations by name.
#[derive(Debug, Default)]
pub struct AnimationLibrary {
    sets: HashMap<Arc<str>, Arc<AnimationFrameSet>>,
}

impl AnimationLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a base animation.
    ///
    /// `expected_count` is what the source announced; a mismatch is logged
    /// but the frames that did arrive are used.
    pub fn load(
        &mut self,
        name: &str,
        frames: Vec<ImageHandle>,
        expected_count: Option<usize>,
    ) -> Result<Arc<AnimationFrameSet>, EngineError> {
        if let Some(expected) = expected_count.filter(|&e| e != frames.len()) {
            tracing::warn!(
                "Base animation '{}' expected {} frames, got {}",
                name,
                expected,
                frames.len()
            );
        }
        let set = Arc::new(AnimationFrameSet::new(name, frames)?);
        tracing::info!(
            "Loaded base animation '{}' ({} frames)",
            name,
            set.frame_count()
        );
        self.sets.insert(Arc::clone(set.name()), Arc::clone(&set));
        Ok(set)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AnimationFrameSet>> {
        self.sets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sets.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DecodedImage;

    fn frames(n: usize) -> Vec<ImageHandle> {
        (0..n)
            .map(|i| Arc::new(DecodedImage::new(1, 1, vec![i as u8, 0, 0, 255])))
            .collect()
    }

    #[test]
    fn test_wrap_index() {
        let set = AnimationFrameSet::new("talk", frames(24)).unwrap();
        assert_eq!(set.wrap_index(5), 5);
        assert_eq!(set.wrap_index(24), 0);
        assert_eq!(set.wrap_index(53), 5);
    }

    #[test]
    fn test_load_rejects_empty() {
        let mut library = AnimationLibrary::new();
        assert_eq!(
            library.load("idle", Vec::new(), Some(10)).unwrap_err(),
            EngineError::EmptyAnimation("idle".to_string())
        );
        assert!(library.is_empty());
    }

    #[test]
    fn test_load_tolerates_count_mismatch() {
        let mut library = AnimationLibrary::new();
        let set = library.load("idle", frames(3), Some(5)).unwrap();
        assert_eq!(set.frame_count(), 3);
        assert!(library.contains("idle"));
        assert_eq!(library.get("idle").unwrap().frame_count(), 3);
    }
}
