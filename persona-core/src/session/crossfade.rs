//! Raised-trig crossfade between consecutive output chunks.
//!
//! Each emitted chunk keeps its last `len` samples as a tail. The next
//! chunk's head is blended against that tail with `sin²`/`cos²` envelopes,
//! which sum to one at every sample, so a constant signal passes through
//! the seam unchanged and silence never gains energy. The blend is applied
//! to every chunk the worker emits, converted or silent, so no transition
//! class gets a special-cased (and audibly different) seam.

use std::f32::consts::FRAC_PI_2;

/// Stitches consecutive chunks with a short equal-power crossfade.
pub struct Crossfade {
    fade_in: Vec<f32>,
    fade_out: Vec<f32>,
    /// Last `len` samples of the previously emitted chunk.
    tail: Option<Vec<f32>>,
}

impl Crossfade {
    /// Build fade tables for a seam of `len` samples.
    pub fn new(len: usize) -> Self {
        let mut fade_in = Vec::with_capacity(len);
        let mut fade_out = Vec::with_capacity(len);
        for i in 0..len {
            let theta = i as f32 * FRAC_PI_2 / len as f32;
            fade_in.push(theta.sin().powi(2));
            fade_out.push(theta.cos().powi(2));
        }
        Self {
            fade_in,
            fade_out,
            tail: None,
        }
    }

    /// Seam length in samples.
    pub fn len(&self) -> usize {
        self.fade_in.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fade_in.is_empty()
    }

    /// Blend the chunk's head against the previous tail, in place.
    ///
    /// The first call has no tail to blend against and leaves the chunk
    /// untouched. Every call stores the chunk's final samples as the tail
    /// for the next seam. Chunks shorter than the seam are blended over
    /// their whole length.
    pub fn smooth(&mut self, chunk: &mut [f32]) {
        if let Some(tail) = &self.tail {
            let n = self.fade_in.len().min(tail.len()).min(chunk.len());
            for i in 0..n {
                chunk[i] = tail[i] * self.fade_out[i] + chunk[i] * self.fade_in[i];
            }
        }
        let keep = self.fade_in.len().min(chunk.len());
        self.tail = Some(chunk[chunk.len() - keep..].to_vec());
    }

    /// Forget the stored tail so the next chunk passes through unblended.
    pub fn reset(&mut self) {
        self.tail = None;
    }
}
