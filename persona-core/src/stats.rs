//! Pipeline telemetry counters.
//!
//! Single-writer-per-field discipline: the hardware callbacks own the drop
//! and underrun counters, the worker owns everything else, and readers take
//! relaxed snapshots. Nothing here blocks, so the status surface can poll at
//! human timescales without touching the audio path.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

pub struct PipelineStats {
    /// Capture blocks rejected by a full ingress queue (hardware thread).
    pub ingress_dropped: AtomicU64,
    /// Playback callbacks served silence for lack of a block (hardware thread).
    pub underruns: AtomicU64,
    /// Output chunks rejected by a full egress queue (worker thread).
    pub egress_dropped: AtomicU64,
    /// Completed conversion cycles (converted, forced, or silence).
    pub cycles: AtomicU64,
    pub converted_cycles: AtomicU64,
    pub forced_cycles: AtomicU64,
    pub silence_cycles: AtomicU64,
    /// Cycles abandoned because the model call failed.
    pub conversion_errors: AtomicU64,
    /// Cumulative wall-clock time of completed cycles, microseconds.
    pub total_latency_us: AtomicU64,
    /// Current sliding-window length (worker-written gauge).
    pub window_len: AtomicUsize,
    /// Last gating decision (worker-written gauge).
    pub last_was_speech: AtomicBool,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            ingress_dropped: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            egress_dropped: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            converted_cycles: AtomicU64::new(0),
            forced_cycles: AtomicU64::new(0),
            silence_cycles: AtomicU64::new(0),
            conversion_errors: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            window_len: AtomicUsize::new(0),
            last_was_speech: AtomicBool::new(false),
        }
    }
}

impl PipelineStats {
    pub fn reset(&self) {
        self.ingress_dropped.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.egress_dropped.store(0, Ordering::Relaxed);
        self.cycles.store(0, Ordering::Relaxed);
        self.converted_cycles.store(0, Ordering::Relaxed);
        self.forced_cycles.store(0, Ordering::Relaxed);
        self.silence_cycles.store(0, Ordering::Relaxed);
        self.conversion_errors.store(0, Ordering::Relaxed);
        self.total_latency_us.store(0, Ordering::Relaxed);
        self.window_len.store(0, Ordering::Relaxed);
        self.last_was_speech.store(false, Ordering::Relaxed);
    }

    /// Relaxed snapshot. Queue depths are read by the session (which owns the
    /// channel handles) and passed in.
    pub fn snapshot(&self, ingress_depth: usize, egress_depth: usize) -> StatsSnapshot {
        let cycles = self.cycles.load(Ordering::Relaxed);
        let total_latency_us = self.total_latency_us.load(Ordering::Relaxed);
        let mean_cycle_ms = if cycles == 0 {
            0.0
        } else {
            total_latency_us as f64 / cycles as f64 / 1_000.0
        };

        StatsSnapshot {
            ingress_dropped: self.ingress_dropped.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
            cycles,
            converted_cycles: self.converted_cycles.load(Ordering::Relaxed),
            forced_cycles: self.forced_cycles.load(Ordering::Relaxed),
            silence_cycles: self.silence_cycles.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            mean_cycle_ms,
            ingress_depth,
            egress_depth,
            window_len: self.window_len.load(Ordering::Relaxed),
            last_was_speech: self.last_was_speech.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the pipeline counters, for polling callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub ingress_dropped: u64,
    pub underruns: u64,
    pub egress_dropped: u64,
    pub cycles: u64,
    pub converted_cycles: u64,
    pub forced_cycles: u64,
    pub silence_cycles: u64,
    pub conversion_errors: u64,
    /// Mean completed-cycle wall time in milliseconds; 0.0 before any cycle.
    pub mean_cycle_ms: f64,
    pub ingress_depth: usize,
    pub egress_depth: usize,
    pub window_len: usize,
    pub last_was_speech: bool,
}
