//! Sliding conversion window.
//!
//! Holds the three most recent captured blocks with their speech tags,
//! oldest first. The middle block is the one actually re-synthesised each
//! cycle; its neighbours only provide acoustic context. Length is bounded by
//! construction: a cycle fires exactly when the third block arrives, and the
//! orchestrator slides the window before accepting the next block.

use std::collections::VecDeque;

use crate::buffering::block::AudioBlock;
use crate::gate::SpeechStatus;

/// Number of blocks that make one conversion window.
pub const WINDOW_BLOCKS: usize = 3;

struct Entry {
    block: AudioBlock,
    status: SpeechStatus,
}

pub struct SlidingWindow {
    entries: VecDeque<Entry>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(WINDOW_BLOCKS),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when a conversion cycle should fire.
    pub fn is_full(&self) -> bool {
        self.entries.len() == WINDOW_BLOCKS
    }

    /// Append a tagged block. The caller must have slid the window after the
    /// previous cycle; exceeding the bound is a logic error.
    pub fn push(&mut self, block: AudioBlock, status: SpeechStatus) {
        debug_assert!(
            self.entries.len() < WINDOW_BLOCKS,
            "window pushed past capacity"
        );
        self.entries.push_back(Entry { block, status });
    }

    /// Speech status of the middle block. `None` until the window is full.
    pub fn middle_status(&self) -> Option<SpeechStatus> {
        if self.is_full() {
            Some(self.entries[WINDOW_BLOCKS / 2].status)
        } else {
            None
        }
    }

    /// All samples in capture order, concatenated.
    pub fn concat_samples(&self) -> Vec<f32> {
        let total: usize = self.entries.iter().map(|e| e.block.len()).sum();
        let mut out = Vec::with_capacity(total);
        for entry in &self.entries {
            out.extend_from_slice(&entry.block.samples);
        }
        out
    }

    /// Evict the oldest block, returning it. Called exactly once per fired
    /// cycle, regardless of how the cycle ended.
    pub fn slide(&mut self) -> Option<AudioBlock> {
        self.entries.pop_front().map(|e| e.block)
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new()
    }
}
