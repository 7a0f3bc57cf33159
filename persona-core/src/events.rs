//! Event types emitted on the session's broadcast channels.
//!
//! | Event | Channel |
//! |-------|---------|
//! | `SessionStatusEvent` | status changes (`subscribe_status`) |
//! | `CycleEvent` | one per fired conversion cycle (`subscribe_cycles`) |
//!
//! Serialized camelCase so front ends can consume them as JSON unchanged.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session status events
// ---------------------------------------------------------------------------

/// Emitted whenever the session state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of a conversion session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session created but `prepare()` not yet called.
    Idle,
    /// Loading checkpoints / deriving the target embedding.
    WarmingUp,
    /// Streams open, worker live, audio being converted.
    Converting,
    /// Stream stopped; session may be restarted.
    Stopped,
    /// Unrecoverable startup error — restart required.
    Error,
}

// ---------------------------------------------------------------------------
// Conversion cycle events
// ---------------------------------------------------------------------------

/// What the orchestrator did with one full window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    /// Middle block was speech; the model ran.
    Converted,
    /// Middle block was silence right after speech; the model ran anyway.
    Forced,
    /// Neither current nor preceding context was speech; exact silence out.
    Silence,
    /// The model call failed; nothing was emitted for this window.
    Failed,
}

/// Emitted once per fired conversion cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleEvent {
    /// Monotonically increasing cycle sequence number.
    pub seq: u64,
    pub outcome: CycleOutcome,
    /// Wall-clock time the cycle took, in milliseconds.
    pub latency_ms: f32,
    /// Whether the middle block was classified as speech.
    pub middle_speech: bool,
}
