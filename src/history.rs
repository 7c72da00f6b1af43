use crate::message::FrameEvent;
use heapless::HistoryBuffer;

pub const HISTORY_DEPTH: usize = 256;

/// The most recent frames seen on the bus; older frames are overwritten.
pub struct FrameHistory {
    frames: HistoryBuffer<FrameEvent, HISTORY_DEPTH>,
}

impl core::fmt::Debug for FrameHistory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameHistory").field("len", &self.frames.len()).finish()
    }
}

impl FrameHistory {
    pub fn new() -> Self {
        Self {
            frames: HistoryBuffer::new(),
        }
    }

    pub fn push(&mut self, frame: FrameEvent) {
        self.frames.write(frame);
    }

    pub fn latest(&self) -> Option<&FrameEvent> {
        self.frames.recent()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &FrameEvent> {
        self.frames.oldest_ordered()
    }

    /// Last `n` frames, oldest first.
    pub fn tail(&self, n: usize) -> Vec<FrameEvent> {
        let skip = self.frames.len().saturating_sub(n);
        self.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.len() == 0
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl Default for FrameHistory {
    fn default() -> Self {
        Self::new()
    }
}
