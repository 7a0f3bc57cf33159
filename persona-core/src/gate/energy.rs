//! Mean-absolute-amplitude gate.
//!
//! A block is speech when its mean |sample| is strictly above the threshold.
//! Deliberately simpler than hangover-style detectors: the trailing edge of
//! an utterance is handled downstream by the orchestrator's force-convert
//! rule, so the gate itself stays pure and per-block.

use super::{SpeechGate, SpeechStatus};
use crate::buffering::block::AudioBlock;

/// Mean-abs threshold above which a block counts as speech.
/// Tuned for a close microphone at unity gain; quiet rooms sit well under it.
pub const DEFAULT_SPEECH_THRESHOLD: f32 = 0.015;

/// Energy gate over mean absolute amplitude.
#[derive(Debug, Clone)]
pub struct EnergyGate {
    threshold: f32,
}

impl EnergyGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Mean absolute amplitude of a sample slice. Empty slices read as 0.0.
    pub fn mean_abs(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = samples.iter().map(|s| s.abs()).sum();
        sum / samples.len() as f32
    }
}

impl Default for EnergyGate {
    fn default() -> Self {
        Self::new(DEFAULT_SPEECH_THRESHOLD)
    }
}

impl SpeechGate for EnergyGate {
    fn classify(&mut self, block: &AudioBlock) -> SpeechStatus {
        if Self::mean_abs(&block.samples) > self.threshold {
            SpeechStatus::Speech
        } else {
            SpeechStatus::Silence
        }
    }
}
