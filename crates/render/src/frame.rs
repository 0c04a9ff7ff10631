//! Indexed animation frames and the in-place RGB565 cache.
//!
//! Each registered frame owns two buffers, allocated once when the frame is
//! added and never resized: the 8-bit palette-index pixels (immutable after
//! load) and the derived RGB565 pixels. The RGB buffer is repainted in place
//! only when the mood it was last painted for no longer matches the live
//! mood, so steady-state display requests are a snapshot comparison and a
//! slice return. There is no per-tick allocation and therefore no
//! out-of-memory failure mode after registration.

use alloc::{boxed::Box, string::String, vec, vec::Vec};

use animus_mood::MoodVector;

use crate::{PaletteEngine, PALETTE_SIZE};

/// How many animations the table holds. Registration past this is an error.
pub const MAX_ANIMATIONS: usize = 8;

/// Frame slots per animation.
pub const MAX_FRAMES_PER_ANIMATION: usize = 16;

/// Largest frame, in pixels: one full 240×240 eye.
pub const MAX_FRAME_PIXELS: usize = 57_600;

/// Handle returned by [`FrameCache::register_animation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnimationId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("animation table is full ({MAX_ANIMATIONS} slots)")]
    AnimationTableFull,
    #[error("animation is already registered under that name")]
    DuplicateAnimation,
    #[error("no such animation")]
    UnknownAnimation,
    #[error("frame id {0} is out of range (max {MAX_FRAMES_PER_ANIMATION})")]
    FrameIdOutOfRange(usize),
    #[error("no frame loaded in that slot")]
    UnknownFrame,
    #[error("frame of {0} pixels exceeds the per-frame capacity")]
    TooManyPixels(usize),
    #[error("pixel data does not match the declared or existing dimensions")]
    DimensionMismatch,
}

struct Frame {
    indexed: Box<[u8]>,
    rgb: Box<[u16]>,
    width: u16,
    height: u16,
    /// Mood the RGB buffer was last painted for. `None` forces a repaint,
    /// which is the state right after (re)loading pixel data.
    painted_for: Option<MoodVector>,
    repaints: u32,
}

struct Animation {
    name: String,
    frames: Vec<Option<Frame>>,
}

/// Fixed-capacity table of animations and their lazily painted frames.
pub struct FrameCache {
    animations: Vec<Animation>,
}

impl FrameCache {
    pub fn new() -> Self {
        FrameCache {
            animations: Vec::new(),
        }
    }

    /// Reserves an animation slot. Fails when the table is full or the name
    /// is already taken; never silently reuses a slot.
    pub fn register_animation(&mut self, name: &str) -> Result<AnimationId, RenderError> {
        if self.animations.iter().any(|a| a.name == name) {
            return Err(RenderError::DuplicateAnimation);
        }
        if self.animations.len() >= MAX_ANIMATIONS {
            return Err(RenderError::AnimationTableFull);
        }
        let mut frames = Vec::new();
        frames.resize_with(MAX_FRAMES_PER_ANIMATION, || None);
        self.animations.push(Animation {
            name: String::from(name),
            frames,
        });
        Ok(AnimationId(self.animations.len() - 1))
    }

    /// Loads indexed pixel data into a frame slot.
    ///
    /// The two pixel buffers are allocated here, sized to `width × height`,
    /// and reused for the life of the process. Reloading an occupied slot is
    /// allowed only with identical dimensions so the buffers stay put.
    /// Either way the cached mood snapshot is invalidated: the first render
    /// after a load always repaints, even under a neutral mood.
    pub fn add_frame(
        &mut self,
        anim: AnimationId,
        frame_id: usize,
        indexed: &[u8],
        width: u16,
        height: u16,
    ) -> Result<(), RenderError> {
        let pixels = width as usize * height as usize;
        if pixels > MAX_FRAME_PIXELS {
            return Err(RenderError::TooManyPixels(pixels));
        }
        if pixels == 0 || indexed.len() != pixels {
            return Err(RenderError::DimensionMismatch);
        }
        let animation = self
            .animations
            .get_mut(anim.0)
            .ok_or(RenderError::UnknownAnimation)?;
        let slot = animation
            .frames
            .get_mut(frame_id)
            .ok_or(RenderError::FrameIdOutOfRange(frame_id))?;

        match slot {
            Some(frame) => {
                if frame.width != width || frame.height != height {
                    return Err(RenderError::DimensionMismatch);
                }
                frame.indexed.copy_from_slice(indexed);
                frame.painted_for = None;
            }
            None => {
                *slot = Some(Frame {
                    indexed: indexed.into(),
                    rgb: vec![0u16; pixels].into_boxed_slice(),
                    width,
                    height,
                    painted_for: None,
                    repaints: 0,
                });
            }
        }
        Ok(())
    }

    /// The primary read path: the frame's RGB565 pixels, ready to blit.
    ///
    /// Cache hit (the frame was last painted for exactly this mood) returns
    /// the buffer untouched. Cache miss repaints every pixel in place via
    /// the active palette, then records the snapshot. A palette index of 16
    /// or above paints black rather than anything undefined.
    ///
    /// The returned slice is valid until the next mutation of this frame
    /// slot.
    pub fn frame_rgb565(
        &mut self,
        anim: AnimationId,
        frame_id: usize,
        palette: &mut PaletteEngine,
        mood: &MoodVector,
    ) -> Result<(&[u16], u16, u16), RenderError> {
        let frame = self.frame_mut(anim, frame_id)?;
        if frame.painted_for != Some(*mood) {
            let palette = palette.active(mood);
            for (dst, &idx) in frame.rgb.iter_mut().zip(frame.indexed.iter()) {
                *dst = if (idx as usize) < PALETTE_SIZE {
                    palette.0[idx as usize].0
                } else {
                    0x0000
                };
            }
            frame.painted_for = Some(*mood);
            frame.repaints = frame.repaints.wrapping_add(1);
        }
        Ok((&frame.rgb, frame.width, frame.height))
    }

    /// How many times a frame has actually been repainted. Profiling hook
    /// for cache hit/miss accounting.
    pub fn frame_repaints(&self, anim: AnimationId, frame_id: usize) -> Result<u32, RenderError> {
        let animation = self
            .animations
            .get(anim.0)
            .ok_or(RenderError::UnknownAnimation)?;
        let slot = animation
            .frames
            .get(frame_id)
            .ok_or(RenderError::FrameIdOutOfRange(frame_id))?;
        slot.as_ref()
            .map(|f| f.repaints)
            .ok_or(RenderError::UnknownFrame)
    }

    pub fn animation_name(&self, anim: AnimationId) -> Option<&str> {
        self.animations.get(anim.0).map(|a| a.name.as_str())
    }

    pub fn find_animation(&self, name: &str) -> Option<AnimationId> {
        self.animations
            .iter()
            .position(|a| a.name == name)
            .map(AnimationId)
    }

    pub fn animation_count(&self) -> usize {
        self.animations.len()
    }

    fn frame_mut(&mut self, anim: AnimationId, frame_id: usize) -> Result<&mut Frame, RenderError> {
        let animation = self
            .animations
            .get_mut(anim.0)
            .ok_or(RenderError::UnknownAnimation)?;
        let slot = animation
            .frames
            .get_mut(frame_id)
            .ok_or(RenderError::FrameIdOutOfRange(frame_id))?;
        slot.as_mut().ok_or(RenderError::UnknownFrame)
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        FrameCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{blend_palette, NEUTRAL_PALETTE};
    use animus_mood::MoodAxis;

    // A 4x4 test card touching every palette slot.
    fn test_card() -> [u8; 16] {
        core::array::from_fn(|i| i as u8)
    }

    fn cache_with_frame() -> (FrameCache, AnimationId) {
        let mut cache = FrameCache::new();
        let anim = cache.register_animation("blink").unwrap();
        cache.add_frame(anim, 0, &test_card(), 4, 4).unwrap();
        (cache, anim)
    }

    #[test]
    fn first_render_is_a_miss_even_when_neutral() {
        let (mut cache, anim) = cache_with_frame();
        let mut engine = PaletteEngine::new();
        let mood = MoodVector::neutral();

        assert_eq!(cache.frame_repaints(anim, 0).unwrap(), 0);
        let (buf, w, h) = cache.frame_rgb565(anim, 0, &mut engine, &mood).unwrap();
        assert_eq!((w, h), (4, 4));
        assert_eq!(buf[0], NEUTRAL_PALETTE.0[0].0);
        assert_eq!(buf[15], NEUTRAL_PALETTE.0[15].0);
        assert_eq!(cache.frame_repaints(anim, 0).unwrap(), 1);
    }

    #[test]
    fn second_render_is_a_hit() {
        let (mut cache, anim) = cache_with_frame();
        let mut engine = PaletteEngine::new();
        let mood = MoodVector::neutral();

        let first: Vec<u16> = cache
            .frame_rgb565(anim, 0, &mut engine, &mood)
            .unwrap()
            .0
            .to_vec();
        let second: Vec<u16> = cache
            .frame_rgb565(anim, 0, &mut engine, &mood)
            .unwrap()
            .0
            .to_vec();
        assert_eq!(first, second);
        assert_eq!(cache.frame_repaints(anim, 0).unwrap(), 1);
    }

    #[test]
    fn mood_change_repaints_only_affected_slots() {
        let (mut cache, anim) = cache_with_frame();
        let mut engine = PaletteEngine::new();
        let mut mood = MoodVector::neutral();

        let before: Vec<u16> = cache
            .frame_rgb565(anim, 0, &mut engine, &mood)
            .unwrap()
            .0
            .to_vec();

        mood.adjust(MoodAxis::Anger, 80);
        let after: Vec<u16> = cache
            .frame_rgb565(anim, 0, &mut engine, &mood)
            .unwrap()
            .0
            .to_vec();
        assert_eq!(cache.frame_repaints(anim, 0).unwrap(), 2);

        // Pixel i shows palette slot i; it changed iff the blend moved that
        // slot's color.
        let palette = blend_palette(&mood);
        for slot in 0..PALETTE_SIZE {
            let slot_changed = palette.0[slot] != NEUTRAL_PALETTE.0[slot];
            assert_eq!(before[slot] != after[slot], slot_changed, "slot {slot}");
        }
    }

    #[test]
    fn out_of_range_index_paints_black() {
        let mut cache = FrameCache::new();
        let anim = cache.register_animation("glitch").unwrap();
        cache.add_frame(anim, 0, &[200, 3], 2, 1).unwrap();

        let mut engine = PaletteEngine::new();
        let mood = MoodVector::neutral();
        let (buf, _, _) = cache.frame_rgb565(anim, 0, &mut engine, &mood).unwrap();
        assert_eq!(buf[0], 0x0000);
        assert_eq!(buf[1], NEUTRAL_PALETTE.0[3].0);
    }

    #[test]
    fn registration_capacity_is_enforced() {
        let mut cache = FrameCache::new();
        for i in 0..MAX_ANIMATIONS {
            let name = alloc::format!("anim{i}");
            cache.register_animation(&name).unwrap();
        }
        assert_eq!(
            cache.register_animation("overflow"),
            Err(RenderError::AnimationTableFull)
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut cache = FrameCache::new();
        cache.register_animation("blink").unwrap();
        assert_eq!(
            cache.register_animation("blink"),
            Err(RenderError::DuplicateAnimation)
        );
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut cache = FrameCache::new();
        let anim = cache.register_animation("big").unwrap();
        let too_big = vec![0u8; 241 * 240];
        assert_eq!(
            cache.add_frame(anim, 0, &too_big, 241, 240),
            Err(RenderError::TooManyPixels(241 * 240))
        );
    }

    #[test]
    fn reload_requires_matching_dimensions() {
        let (mut cache, anim) = cache_with_frame();
        assert_eq!(
            cache.add_frame(anim, 0, &[0u8; 4], 2, 2),
            Err(RenderError::DimensionMismatch)
        );
        // Same dimensions: allowed, and the cache is invalidated.
        let mut engine = PaletteEngine::new();
        let mood = MoodVector::neutral();
        cache.frame_rgb565(anim, 0, &mut engine, &mood).unwrap();
        cache.add_frame(anim, 0, &test_card(), 4, 4).unwrap();
        cache.frame_rgb565(anim, 0, &mut engine, &mood).unwrap();
        assert_eq!(cache.frame_repaints(anim, 0).unwrap(), 2);
    }

    #[test]
    fn missing_frame_is_reported() {
        let (mut cache, anim) = cache_with_frame();
        let mut engine = PaletteEngine::new();
        let mood = MoodVector::neutral();
        assert!(matches!(
            cache.frame_rgb565(anim, 1, &mut engine, &mood),
            Err(RenderError::UnknownFrame)
        ));
        assert!(matches!(
            cache.frame_rgb565(anim, MAX_FRAMES_PER_ANIMATION, &mut engine, &mood),
            Err(RenderError::FrameIdOutOfRange(_))
        ));
    }
}
