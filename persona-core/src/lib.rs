//! # persona-core
//!
//! Reusable real-time voice-conversion SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → duplex callback → SPSC block queue → worker thread
//!                                                        │
//!                                                  energy gate
//!                                                        │
//!                                              3-block sliding window
//!                                                        │
//!                                       VoiceConverter::convert (middle third)
//!                                                        │
//!                                         crossfade → SPSC block queue
//!                                                        │
//!                                            duplex callback → Speakers
//! ```
//!
//! The audio callbacks are allocation-light and never block. All model work
//! happens on the worker thread; observers subscribe to broadcast channels
//! for status and per-cycle events.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod convert;
pub mod error;
pub mod events;
pub mod gate;
pub mod session;
pub mod stats;

// Convenience re-exports for downstream crates
pub use audio::device::DeviceInfo;
pub use convert::{ConverterHandle, Spectrogram, StubConverter, TargetEmbedding, VoiceConverter};
pub use error::PersonaError;
pub use events::{CycleEvent, CycleOutcome, SessionStatus, SessionStatusEvent};
pub use gate::{SpeechGate, SpeechStatus};
pub use session::{SessionConfig, VoiceSession};
pub use stats::StatsSnapshot;

#[cfg(feature = "onnx")]
pub use convert::{OnnxConverter, OnnxConverterConfig};
