//! Speech activity gating.
//!
//! The `SpeechGate` trait is the extensibility point: swap in `EnergyGate`
//! (default) or any future detector without touching the worker. The status
//! is computed exactly once per captured block, when the worker dequeues it,
//! and travels with the block through the sliding window — it is never
//! recomputed.

pub mod energy;

pub use energy::EnergyGate;

use crate::buffering::block::AudioBlock;

/// Whether a given audio block contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechStatus {
    /// Mean absolute amplitude above threshold.
    Speech,
    /// Below threshold (or empty).
    Silence,
}

impl SpeechStatus {
    pub fn is_speech(self) -> bool {
        self == SpeechStatus::Speech
    }
}

/// Trait for all gate implementations.
///
/// Takes `&mut self` so scripted gates and stateful detectors are possible;
/// the default `EnergyGate` is pure.
pub trait SpeechGate: Send + 'static {
    /// Classify one block. Must depend only on the block contents for a
    /// given configuration (same block ⇒ same verdict).
    fn classify(&mut self, block: &AudioBlock) -> SpeechStatus;
}
