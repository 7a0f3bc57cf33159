//! Block framing and output rendering at the hardware boundary.
//!
//! Hosts do not always honour a requested fixed buffer size, so the capture
//! callback runs everything through a `BlockFramer` that absorbs whatever
//! frame counts arrive and emits exact pipeline blocks. On the playback side
//! `render_block_into` resizes a popped block to the requested frame count
//! (truncate or zero-pad) and substitutes silence when the egress queue is
//! empty. Both are plain sample shuffling with no device types, so they stay
//! unit-testable without audio hardware.

use crate::buffering::block::AudioBlock;

/// Accumulates capture samples and re-cuts them into fixed-size blocks.
pub struct BlockFramer {
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl BlockFramer {
    pub fn new(block_size: usize, sample_rate: u32) -> Self {
        Self {
            block_size,
            sample_rate,
            // Room for one block plus one oversized callback burst.
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Absorb one callback's worth of mono samples.
    pub fn push_samples(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
    }

    /// Emit the next full block, if one has accumulated. Call in a loop — an
    /// oversized burst can complete more than one block.
    pub fn pop_block(&mut self) -> Option<AudioBlock> {
        if self.pending.len() < self.block_size {
            return None;
        }
        let samples: Vec<f32> = self.pending.drain(..self.block_size).collect();
        Some(AudioBlock::new(samples, self.sample_rate))
    }

    /// Samples buffered but not yet emitted.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Fill `out` from a popped block, scaled by `gain`.
///
/// A block shorter than `out` is zero-padded at the tail; a longer one is
/// truncated. `None` (egress underrun or stopped stream) writes exact zeros,
/// never stale memory.
pub fn render_block_into(out: &mut [f32], block: Option<&AudioBlock>, gain: f32) {
    match block {
        Some(block) => {
            let n = block.len().min(out.len());
            for (dst, src) in out[..n].iter_mut().zip(&block.samples) {
                *dst = src * gain;
            }
            for dst in &mut out[n..] {
                *dst = 0.0;
            }
        }
        None => {
            for dst in out.iter_mut() {
                *dst = 0.0;
            }
        }
    }
}
