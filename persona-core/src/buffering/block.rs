//! Typed audio block passed between the duplex callbacks and the worker.

/// A fixed-length block of mono PCM samples at a known sample rate.
///
/// Produced once per hardware callback cadence (canonically 9984 samples at
/// 22 050 Hz) and owned by whichever queue currently holds it; ownership
/// transfers on dequeue. Never mutated after capture.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 22050).
    pub sample_rate: u32,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// A block of exact digital silence. Used both for egress-underrun
    /// substitution and for the non-speech orchestrator branch.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self {
            samples: vec![0.0; len],
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the duration of this block in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}
