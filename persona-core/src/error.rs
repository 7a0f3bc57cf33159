use thiserror::Error;

/// All errors produced by persona-core.
#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no usable input device found")]
    NoInputDevice,

    #[error("no usable output device found")]
    NoOutputDevice,

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("reference audio error: {0}")]
    ReferenceAudio(String),

    #[error("model checkpoint not found: {path}")]
    CheckpointNotFound { path: std::path::PathBuf },

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("session is already running")]
    AlreadyRunning,

    #[error("session is not running")]
    NotRunning,

    #[error("session has no target embedding — call prepare() first")]
    NotPrepared,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PersonaError>;
