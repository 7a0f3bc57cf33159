//! ONNX conversion backend via the `ort` crate.
//!
//! Targets a two-graph export of the conversion network:
//! - `embedder.onnx`    — `spec [1,513,frames]` → `se [1,256,1]`
//! - `synthesizer.onnx` — `spec [1,513,frames]` + `se [1,256,1]`
//!   → `audio [1,samples]`
//!
//! ## Spectrogram front end (must match training)
//!
//! | Parameter      | Value            |
//! |----------------|------------------|
//! | FFT size       | 1024             |
//! | Hann window    | 1024 samples     |
//! | Hop length     | 256              |
//! | Frequency bins | 513 (1024/2 + 1) |
//! | Padding        | reflect, 384     |
//! | Magnitude      | √(re² + im² + ε) |
//!
//! Linear magnitude, not mel — the synthesis network consumes the raw
//! spectral envelope.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array3;
use ort::session::Session;
use ort::value::Value;
use ort::{
    ep,
    session::builder::{GraphOptimizationLevel, SessionBuilder},
};
use rustfft::{num_complex::Complex, FftPlanner};
use tracing::{debug, info, warn};

use crate::convert::reference::load_reference_waveform;
use crate::convert::{ConvertedAudio, Spectrogram, TargetEmbedding, VoiceConverter};
use crate::error::{PersonaError, Result};

const N_FFT: usize = 1024;
const HOP: usize = 256;
const WIN: usize = 1024;
const N_BINS: usize = N_FFT / 2 + 1; // 513
const PAD: usize = (N_FFT - HOP) / 2; // 384
const MAGNITUDE_EPS: f32 = 1e-6;

// ── Model config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OnnxConverterConfig {
    pub embedder_path: PathBuf,
    pub synthesizer_path: PathBuf,
    /// Rate of the synthesised waveform (and of the expected input audio).
    pub sample_rate: u32,
}

impl OnnxConverterConfig {
    /// Conventional layout: `<dir>/embedder.onnx` + `<dir>/synthesizer.onnx`.
    pub fn from_dir(dir: &Path, sample_rate: u32) -> Self {
        Self {
            embedder_path: dir.join("embedder.onnx"),
            synthesizer_path: dir.join("synthesizer.onnx"),
            sample_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrtExecutionPreference {
    Auto,
    Cpu,
    DirectML,
}

fn ort_execution_preference() -> OrtExecutionPreference {
    match std::env::var("PERSONA_ORT_EP")
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "cpu" => OrtExecutionPreference::Cpu,
        "dml" | "directml" => OrtExecutionPreference::DirectML,
        _ => OrtExecutionPreference::Auto,
    }
}

fn create_session(model_path: &Path) -> Result<Session> {
    if !model_path.exists() {
        return Err(PersonaError::CheckpointNotFound {
            path: model_path.to_path_buf(),
        });
    }

    let pref = ort_execution_preference();
    let intra_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(2, 8);

    let mut builder = SessionBuilder::new()
        .map_err(|e| PersonaError::OnnxSession(e.to_string()))?
        .with_intra_threads(intra_threads)
        .map_err(|e| PersonaError::OnnxSession(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| PersonaError::OnnxSession(e.to_string()))?;
    info!(intra_threads, "ONNX session threading configured");

    #[cfg(target_os = "windows")]
    {
        builder = match pref {
            OrtExecutionPreference::Cpu => {
                info!("ONNX EP preference=cpu");
                builder
                    .with_execution_providers([ep::CPU::default().build()])
                    .map_err(|e| PersonaError::OnnxSession(e.to_string()))?
            }
            OrtExecutionPreference::DirectML => {
                info!("ONNX EP preference=directml (strict)");
                builder
                    .with_execution_providers([
                        ep::DirectML::default()
                            .with_device_id(0)
                            .build()
                            .error_on_failure(),
                        ep::CPU::default().build(),
                    ])
                    .map_err(|e| PersonaError::OnnxSession(e.to_string()))?
            }
            OrtExecutionPreference::Auto => {
                info!("ONNX EP preference=auto (directml -> cpu)");
                builder
                    .with_execution_providers([
                        ep::DirectML::default()
                            .with_device_id(0)
                            .build()
                            .fail_silently(),
                        ep::CPU::default().build(),
                    ])
                    .map_err(|e| PersonaError::OnnxSession(e.to_string()))?
            }
        };
    }

    #[cfg(not(target_os = "windows"))]
    {
        if pref == OrtExecutionPreference::DirectML {
            warn!("PERSONA_ORT_EP=directml requested on non-Windows host; using CPU EP");
        }
        builder = builder
            .with_execution_providers([ep::CPU::default().build()])
            .map_err(|e| PersonaError::OnnxSession(e.to_string()))?;
    }

    builder
        .commit_from_file(model_path)
        .map_err(|e| PersonaError::OnnxSession(e.to_string()))
}

// ── OnnxConverter ────────────────────────────────────────────────────────────

pub struct OnnxConverter {
    config: OnnxConverterConfig,
    embedder: Option<Session>,
    synthesizer: Option<Session>,
    hann_window: Vec<f32>,
    fft: Arc<dyn rustfft::Fft<f32>>,
}

impl OnnxConverter {
    pub fn new(config: OnnxConverterConfig) -> Self {
        let hann_window = build_hann_window(WIN);
        let fft = Arc::from(FftPlanner::<f32>::new().plan_fft_forward(N_FFT));
        Self {
            config,
            embedder: None,
            synthesizer: None,
            hann_window,
            fft,
        }
    }

    /// Linear-magnitude STFT, reflect-padded, center=false framing.
    fn stft_magnitudes(&self, samples: &[f32]) -> (usize, Vec<f32>) {
        let padded = reflect_pad(samples, PAD);
        let frames = if padded.len() < N_FFT {
            0
        } else {
            1 + (padded.len() - N_FFT) / HOP
        };

        // Frame-major layout: data[f * N_BINS + b].
        let mut data = vec![0.0f32; frames * N_BINS];
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); N_FFT];

        for f in 0..frames {
            let start = f * HOP;
            for (i, v) in fft_buf.iter_mut().enumerate() {
                *v = Complex::new(padded[start + i] * self.hann_window[i], 0.0);
            }
            self.fft.process(&mut fft_buf);
            for b in 0..N_BINS {
                data[f * N_BINS + b] = (fft_buf[b].norm_sqr() + MAGNITUDE_EPS).sqrt();
            }
        }
        (frames, data)
    }

    /// `[1, N_BINS, frames]` tensor from a frame-major spectrogram.
    fn spec_tensor(spectrogram: &Spectrogram) -> Result<Value> {
        let (bins, frames) = (spectrogram.bins, spectrogram.frames);
        let arr = Array3::from_shape_fn((1, bins, frames), |(_, b, f)| {
            spectrogram.data[f * bins + b]
        });
        Value::from_array(arr).map_err(|e: ort::Error| PersonaError::OnnxSession(e.to_string()))
    }

    fn embedding_tensor(target: &TargetEmbedding) -> Result<Value> {
        let arr = Array3::from_shape_vec((1, target.len(), 1), target.values().to_vec())
            .map_err(|e| PersonaError::OnnxSession(e.to_string()))?;
        Value::from_array(arr).map_err(|e: ort::Error| PersonaError::OnnxSession(e.to_string()))
    }
}

impl VoiceConverter for OnnxConverter {
    fn warm_up(&mut self) -> Result<()> {
        info!("=== OnnxConverter warm-up ===");
        info!("loading embedder from {:?}", self.config.embedder_path);
        self.embedder = Some(create_session(&self.config.embedder_path)?);
        info!(
            "loading synthesizer from {:?}",
            self.config.synthesizer_path
        );
        self.synthesizer = Some(create_session(&self.config.synthesizer_path)?);

        // Dummy forward passes to populate CPU/EP caches before the stream
        // opens; a cold first conversion otherwise lands inside a live cycle.
        let dummy_spec = Array3::<f32>::zeros((1, N_BINS, 16));
        let dummy_val = Value::from_array(dummy_spec)
            .map_err(|e: ort::Error| PersonaError::OnnxSession(e.to_string()))?;
        let embedder = self.embedder.as_mut().ok_or_else(|| {
            PersonaError::OnnxSession("embedder session missing after load".into())
        })?;
        let out = embedder
            .run(ort::inputs!["spec" => dummy_val])
            .map_err(|e| PersonaError::OnnxSession(e.to_string()))?;
        let (_, se_data) = out["se"]
            .try_extract_tensor::<f32>()
            .map_err(|e| PersonaError::OnnxSession(e.to_string()))?;
        debug!(embedding_dim = se_data.len(), "embedder warm pass complete");

        info!("=== OnnxConverter warm-up complete ===");
        Ok(())
    }

    fn spectrogram(&mut self, samples: &[f32]) -> Result<Spectrogram> {
        let (frames, data) = self.stft_magnitudes(samples);
        if frames == 0 {
            return Err(PersonaError::Conversion(format!(
                "input of {} samples is too short for one STFT frame",
                samples.len()
            )));
        }
        Ok(Spectrogram::new(N_BINS, frames, data, samples.len()))
    }

    fn spectrogram_from_file(&mut self, path: &Path) -> Result<Spectrogram> {
        let samples = load_reference_waveform(path, self.config.sample_rate)?;
        self.spectrogram(&samples)
    }

    fn extract_embedding(&mut self, spectrogram: &Spectrogram) -> Result<TargetEmbedding> {
        let spec_val = Self::spec_tensor(spectrogram)?;
        let embedder = self
            .embedder
            .as_mut()
            .ok_or_else(|| PersonaError::OnnxSession("model not loaded — call warm_up()".into()))?;
        let out = embedder
            .run(ort::inputs!["spec" => spec_val])
            .map_err(|e| PersonaError::OnnxSession(e.to_string()))?;
        let (_, se_data) = out["se"]
            .try_extract_tensor::<f32>()
            .map_err(|e| PersonaError::OnnxSession(e.to_string()))?;
        Ok(TargetEmbedding::new(se_data.to_vec()))
    }

    fn convert(
        &mut self,
        spectrogram: &Spectrogram,
        target: &TargetEmbedding,
    ) -> Result<ConvertedAudio> {
        let spec_val = Self::spec_tensor(spectrogram)?;
        let se_val = Self::embedding_tensor(target)?;
        let synthesizer = self
            .synthesizer
            .as_mut()
            .ok_or_else(|| PersonaError::OnnxSession("model not loaded — call warm_up()".into()))?;
        let out = synthesizer
            .run(ort::inputs!["spec" => spec_val, "se" => se_val])
            .map_err(|e| PersonaError::OnnxSession(e.to_string()))?;
        let (_, audio) = out["audio"]
            .try_extract_tensor::<f32>()
            .map_err(|e| PersonaError::OnnxSession(e.to_string()))?;

        Ok(ConvertedAudio {
            samples: audio.to_vec(),
            sample_rate: self.config.sample_rate,
        })
    }
}

// ── DSP helpers ──────────────────────────────────────────────────────────────

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    if pad == 0 {
        return samples.to_vec();
    }
    if samples.is_empty() {
        return vec![0.0; pad * 2];
    }
    if samples.len() == 1 {
        return vec![samples[0]; samples.len() + pad * 2];
    }

    let n = samples.len() as isize;
    let mut out = Vec::with_capacity(samples.len() + 2 * pad);
    for i in -(pad as isize)..(n + pad as isize) {
        let idx = reflect_index(i, samples.len());
        out.push(samples[idx]);
    }
    out
}

fn reflect_index(mut i: isize, len: usize) -> usize {
    let max = len as isize - 1;
    while i < 0 || i > max {
        if i < 0 {
            i = -i;
        } else {
            i = 2 * max - i;
        }
    }
    i as usize
}
