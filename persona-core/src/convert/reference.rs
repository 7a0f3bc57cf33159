//! Target-voice reference loading.
//!
//! Backends need the reference sample as mono f32 at the pipeline rate.
//! Reference files arrive as arbitrary WAVs (stereo, 44.1/48 kHz, i16/i24/
//! f32), so this module decodes with `hound`, downmixes, and resamples with
//! a one-shot rubato pass. Startup-only code path — never touched while the
//! stream is live.

use std::path::Path;

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::info;

use crate::error::{PersonaError, Result};

/// Input frames per rubato call for the one-shot pass.
const RESAMPLE_CHUNK: usize = 1024;

/// Decode a WAV file to mono f32 at `target_rate`.
///
/// # Errors
/// `PersonaError::ReferenceAudio` on unreadable files, unsupported layouts,
/// or resampler failures.
pub fn load_reference_waveform(path: &Path, target_rate: u32) -> Result<Vec<f32>> {
    let (mono, source_rate) = read_wav_mono(path)?;
    if mono.is_empty() {
        return Err(PersonaError::ReferenceAudio(format!(
            "reference file {} contains no samples",
            path.display()
        )));
    }

    let resampled = resample_to(&mono, source_rate, target_rate)?;
    info!(
        path = %path.display(),
        source_rate,
        target_rate,
        source_samples = mono.len(),
        resampled_samples = resampled.len(),
        "reference waveform loaded"
    );
    Ok(resampled)
}

/// Decode a WAV file to mono f32 at its native rate.
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32)> {
    let reference_err =
        |e: hound::Error| PersonaError::ReferenceAudio(format!("{}: {e}", path.display()));

    let mut reader = hound::WavReader::open(path).map_err(reference_err)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map_err(reference_err))
            .collect::<Result<Vec<_>>>()?,
        hound::SampleFormat::Int => {
            if spec.bits_per_sample <= 16 {
                reader
                    .samples::<i16>()
                    .map(|s| s.map(|v| (v as f32) / (i16::MAX as f32)).map_err(reference_err))
                    .collect::<Result<Vec<_>>>()?
            } else {
                let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| (v as f32) / max).map_err(reference_err))
                    .collect::<Result<Vec<_>>>()?
            }
        }
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }

    let mut mono = Vec::with_capacity(interleaved.len() / channels);
    for frame in interleaved.chunks(channels) {
        let sum = frame.iter().copied().sum::<f32>();
        mono.push(sum / channels as f32);
    }
    Ok((mono, spec.sample_rate))
}

/// One-shot mono resample. Identity when the rates already match.
fn resample_to(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if source_rate == target_rate {
        return Ok(samples.to_vec());
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0, // fixed ratio
        PolynomialDegree::Cubic,
        RESAMPLE_CHUNK,
        1, // mono
    )
    .map_err(|e| PersonaError::ReferenceAudio(format!("resampler init: {e}")))?;

    let max_out = resampler.output_frames_max();
    let mut output_buf = vec![vec![0f32; max_out]; 1];
    let mut out = Vec::with_capacity((samples.len() as f64 * ratio) as usize + RESAMPLE_CHUNK);

    let mut padded = samples.to_vec();
    // Zero-pad the tail so the last partial chunk still goes through rubato.
    let remainder = padded.len() % RESAMPLE_CHUNK;
    if remainder != 0 {
        padded.resize(padded.len() + (RESAMPLE_CHUNK - remainder), 0.0);
    }

    for chunk in padded.chunks(RESAMPLE_CHUNK) {
        let (_consumed, produced) = resampler
            .process_into_buffer(&[chunk], &mut output_buf, None)
            .map_err(|e| PersonaError::ReferenceAudio(format!("resampler process: {e}")))?;
        out.extend_from_slice(&output_buf[0][..produced]);
    }

    // Trim the zero-pad contribution back off.
    let expected = (samples.len() as f64 * ratio).round() as usize;
    out.truncate(expected.min(out.len()));
    Ok(out)
}
