//! `StubConverter` — deterministic backend with no model files.
//!
//! Stands in for the real network during development and in tests: the
//! "spectrogram" is a per-hop RMS envelope, the "embedding" a fixed-size
//! summary of it, and the "conversion" a carrier tone shaped by the source
//! envelope. Output length always equals the source length, so the whole
//! window / middle-third / crossfade protocol is exercised for real.

use std::f32::consts::TAU;
use std::path::Path;

use tracing::debug;

use crate::convert::reference::load_reference_waveform;
use crate::convert::{ConvertedAudio, Spectrogram, TargetEmbedding, VoiceConverter};
use crate::error::{PersonaError, Result};

/// Analysis hop (samples per envelope frame).
const HOP: usize = 256;
/// Synthesised carrier frequency in Hz.
const CARRIER_HZ: f32 = 180.0;
/// Embedding width, matching the ONNX export's speaker-embedding size.
const EMBEDDING_DIM: usize = 256;

/// Envelope-carrier stub backend.
pub struct StubConverter {
    sample_rate: u32,
    /// Carrier phase, carried across calls so consecutive chunks line up.
    phase: f32,
    conversion_count: u64,
}

impl StubConverter {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            phase: 0.0,
            conversion_count: 0,
        }
    }

    fn envelope(samples: &[f32]) -> (usize, Vec<f32>) {
        let frames = samples.len().div_ceil(HOP).max(1);
        let mut data = Vec::with_capacity(frames);
        for f in 0..frames {
            let start = f * HOP;
            let end = (start + HOP).min(samples.len());
            let frame = &samples[start..end];
            if frame.is_empty() {
                data.push(0.0);
                continue;
            }
            let sum_sq: f32 = frame.iter().map(|s| s * s).sum();
            data.push((sum_sq / frame.len() as f32).sqrt());
        }
        (frames, data)
    }
}

impl Default for StubConverter {
    fn default() -> Self {
        Self::new(22_050)
    }
}

impl VoiceConverter for StubConverter {
    fn warm_up(&mut self) -> Result<()> {
        debug!("StubConverter::warm_up — no-op");
        Ok(())
    }

    fn spectrogram(&mut self, samples: &[f32]) -> Result<Spectrogram> {
        let (frames, data) = Self::envelope(samples);
        Ok(Spectrogram::new(1, frames, data, samples.len()))
    }

    fn spectrogram_from_file(&mut self, path: &Path) -> Result<Spectrogram> {
        let samples = load_reference_waveform(path, self.sample_rate)?;
        self.spectrogram(&samples)
    }

    fn extract_embedding(&mut self, spectrogram: &Spectrogram) -> Result<TargetEmbedding> {
        if spectrogram.data.is_empty() {
            return Err(PersonaError::Conversion(
                "cannot derive an embedding from an empty spectrogram".into(),
            ));
        }
        let mean = spectrogram.data.iter().sum::<f32>() / spectrogram.data.len() as f32;
        let peak = spectrogram
            .data
            .iter()
            .fold(0.0f32, |acc, &v| acc.max(v.abs()));
        let values = (0..EMBEDDING_DIM)
            .map(|i| {
                let t = i as f32 / EMBEDDING_DIM as f32;
                mean * (1.0 - t) + peak * t
            })
            .collect();
        Ok(TargetEmbedding::new(values))
    }

    fn convert(
        &mut self,
        spectrogram: &Spectrogram,
        target: &TargetEmbedding,
    ) -> Result<ConvertedAudio> {
        self.conversion_count += 1;

        let gain = if target.is_empty() {
            0.5
        } else {
            let mean = target.values().iter().sum::<f32>() / target.len() as f32;
            (0.5 + mean).clamp(0.1, 1.0)
        };

        let step = TAU * CARRIER_HZ / self.sample_rate as f32;
        let mut samples = Vec::with_capacity(spectrogram.source_len);
        for i in 0..spectrogram.source_len {
            let frame = (i / HOP).min(spectrogram.frames - 1);
            let amp = (spectrogram.data[frame * spectrogram.bins] * 2.0).min(0.8);
            samples.push(self.phase.sin() * amp * gain);
            self.phase = (self.phase + step) % TAU;
        }

        debug!(
            conversion = self.conversion_count,
            out_samples = samples.len(),
            "StubConverter::convert"
        );
        Ok(ConvertedAudio {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speech_like(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (TAU * 440.0 * i as f32 / 22_050.0).sin() * 0.4)
            .collect()
    }

    #[test]
    fn spectrogram_covers_source_length() {
        let mut c = StubConverter::default();
        let spec = c.spectrogram(&speech_like(1000)).unwrap();
        assert_eq!(spec.source_len, 1000);
        assert_eq!(spec.frames, 4); // ceil(1000 / 256)
        assert_eq!(spec.data.len(), spec.frames * spec.bins);
    }

    #[test]
    fn convert_output_matches_source_length() {
        let mut c = StubConverter::default();
        let spec = c.spectrogram(&speech_like(9984 * 3)).unwrap();
        let emb = c.extract_embedding(&spec).unwrap();
        let out = c.convert(&spec, &emb).unwrap();
        assert_eq!(out.samples.len(), 9984 * 3);
        assert_eq!(out.sample_rate, 22_050);
    }

    #[test]
    fn converted_samples_are_finite_and_bounded() {
        let mut c = StubConverter::default();
        let spec = c.spectrogram(&speech_like(4096)).unwrap();
        let emb = c.extract_embedding(&spec).unwrap();
        let out = c.convert(&spec, &emb).unwrap();
        assert!(out.samples.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
    }

    #[test]
    fn conversion_is_deterministic_for_fresh_instances() {
        let run = || {
            let mut c = StubConverter::default();
            let spec = c.spectrogram(&speech_like(2048)).unwrap();
            let emb = c.extract_embedding(&spec).unwrap();
            c.convert(&spec, &emb).unwrap().samples
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn silent_input_converts_to_silence() {
        let mut c = StubConverter::default();
        let spec = c.spectrogram(&vec![0.0; 2048]).unwrap();
        let emb = TargetEmbedding::new(vec![0.2; EMBEDDING_DIM]);
        let out = c.convert(&spec, &emb).unwrap();
        assert!(out.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn embedding_has_fixed_width() {
        let mut c = StubConverter::default();
        let spec = c.spectrogram(&speech_like(512)).unwrap();
        let emb = c.extract_embedding(&spec).unwrap();
        assert_eq!(emb.len(), EMBEDDING_DIM);
    }
}
