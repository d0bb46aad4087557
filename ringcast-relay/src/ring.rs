//! The fixed-size ring of media tags the relay fans out from.

use crate::flv::Tag;

/// One slot of the ring: a tag plus the sequence number it was ingested
/// under. `number == -1` marks a slot that is being refilled; the sequence
/// number doubles as a generation counter for overrun detection.
#[derive(Debug)]
pub struct RingSlot {
    pub number: i64,
    pub tag: Option<Tag>,
}

impl RingSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            number: -1,
            tag: None,
        }
    }

    /// True when the slot currently holds a video keyframe.
    #[must_use]
    pub fn is_keyframe(&self) -> bool {
        self.tag.as_ref().map_or(false, Tag::is_keyframe)
    }
}

/// Allocates a ring of `count` empty slots (at least one).
#[must_use]
pub fn new_ring(count: usize) -> Vec<RingSlot> {
    (0..count.max(1)).map(|_| RingSlot::new()).collect()
}
