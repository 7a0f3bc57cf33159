//! Voice-conversion model abstraction.
//!
//! The `VoiceConverter` trait decouples the pipeline from any specific
//! backend (deterministic stub, ONNX export, etc.). The worker thread is the
//! only steady-state caller; `prepare()` calls it once at startup to derive
//! the target embedding. The pipeline treats every value produced here as
//! opaque — it looks at lengths and elementwise numeric sanity, nothing else.
//!
//! `&mut self` on the methods expresses that backends are stateful (loaded
//! sessions, FFT plans, scratch buffers). All mutation is serialised through
//! `ConverterHandle`'s `parking_lot::Mutex`.

pub mod reference;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxConverter, OnnxConverterConfig};

pub use stub::StubConverter;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// An acoustic spectrogram as produced by a backend's front end.
///
/// Stored flattened, `bins × frames`, frame-major (`data[f * bins + b]`).
/// `source_len` records how many waveform samples the spectrogram was
/// computed from, so backends can synthesise an output of matching length.
#[derive(Debug, Clone)]
pub struct Spectrogram {
    pub bins: usize,
    pub frames: usize,
    pub data: Vec<f32>,
    pub source_len: usize,
}

impl Spectrogram {
    pub fn new(bins: usize, frames: usize, data: Vec<f32>, source_len: usize) -> Self {
        debug_assert_eq!(data.len(), bins * frames);
        Self {
            bins,
            frames,
            data,
            source_len,
        }
    }
}

/// Fixed-size descriptor of the target speaker's voice. Computed once at
/// startup from the reference sample; immutable for the session lifetime.
#[derive(Debug, Clone)]
pub struct TargetEmbedding(Vec<f32>);

impl TargetEmbedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Waveform returned by a conversion call. May contain non-finite samples;
/// the orchestrator sanitises before use.
#[derive(Debug, Clone)]
pub struct ConvertedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Contract for voice-conversion backends.
pub trait VoiceConverter: Send + 'static {
    /// One-time warm-up: load checkpoints, build sessions, prime caches.
    /// Called once before the stream opens; errors here are fatal.
    fn warm_up(&mut self) -> Result<()>;

    /// Compute a spectrogram from a mono waveform at the pipeline rate.
    fn spectrogram(&mut self, samples: &[f32]) -> Result<Spectrogram>;

    /// Compute a spectrogram from an audio file (startup only — used for the
    /// target-voice reference sample).
    fn spectrogram_from_file(&mut self, path: &Path) -> Result<Spectrogram>;

    /// Derive a speaker embedding from a spectrogram (startup only).
    fn extract_embedding(&mut self, spectrogram: &Spectrogram) -> Result<TargetEmbedding>;

    /// Convert: source spectrogram + target embedding → waveform.
    ///
    /// Blocking and potentially much slower than real time; only ever called
    /// from the worker thread.
    fn convert(
        &mut self,
        spectrogram: &Spectrogram,
        target: &TargetEmbedding,
    ) -> Result<ConvertedAudio>;
}

/// Thread-safe reference-counted handle to any `VoiceConverter` implementor.
///
/// Uses `parking_lot::Mutex` for non-poisoning on panic (a panicking backend
/// must not wedge the session's stop path).
#[derive(Clone)]
pub struct ConverterHandle(pub Arc<Mutex<dyn VoiceConverter>>);

impl ConverterHandle {
    /// Wrap any `VoiceConverter` in a `ConverterHandle`.
    pub fn new<C: VoiceConverter>(converter: C) -> Self {
        Self(Arc::new(Mutex::new(converter)))
    }
}

impl std::fmt::Debug for ConverterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterHandle").finish_non_exhaustive()
    }
}
