//! `VoiceSession` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceSession::new()
//!     └─► prepare()          → converter warmed, embedding derived, status = Idle
//!         └─► start()        → duplex stream open, worker spawned, status = Converting
//!             └─► stop()     → running=false, worker joined, stream dropped, Stopped
//! ```
//!
//! `start()`/`stop()` are idempotent: calling them in the wrong state returns
//! an error rather than panicking.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). The duplex pair is therefore opened *inside* the worker's OS
//! thread and dropped there after the loop exits, so the streams never cross
//! a thread boundary. A sync mpsc channel propagates open-device errors back
//! to the `start()` caller, and `stop()` joins the worker so shutdown is
//! bounded by one ingress timeout plus one in-flight conversion.

pub mod crossfade;
pub mod window;
pub mod worker;

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::DuplexIo,
    buffering::{create_block_queue, BlockConsumer, QUEUE_CAPACITY},
    convert::{ConverterHandle, TargetEmbedding},
    error::{PersonaError, Result},
    events::{CycleEvent, SessionStatus, SessionStatusEvent},
    gate::{energy::DEFAULT_SPEECH_THRESHOLD, EnergyGate, SpeechGate},
    stats::{PipelineStats, StatsSnapshot},
};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Canonical block size: 9984 samples ≈ 453 ms at 22050 Hz. An earlier
/// pipeline iteration used 8192; both are configuration values, not protocol
/// invariants.
pub const DEFAULT_BLOCK_SIZE: usize = 9_984;

/// Canonical pipeline sample rate (Hz).
pub const DEFAULT_SAMPLE_RATE: u32 = 22_050;

/// Fixed gain applied to every playback block, leaving headroom for
/// resynthesis artifacts.
pub const DEFAULT_OUTPUT_GAIN: f32 = 0.8;

/// Configuration for a `VoiceSession`. Loaded once before the stream starts;
/// not reloadable mid-session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pipeline sample rate (Hz). The duplex stream must open at exactly
    /// this rate — there is no resampling on the live path. Default: 22050.
    pub sample_rate: u32,
    /// Samples per captured block. Default: 9984.
    pub block_size: usize,
    /// Capacity of the ingress and egress queues, in blocks. Default: 4.
    pub queue_capacity: usize,
    /// Mean-absolute-amplitude threshold for the speech gate. Default: 0.015.
    pub speech_threshold: f32,
    /// Gain applied to each playback block. Default: 0.8.
    pub output_gain: f32,
    /// Crossfade seam duration in seconds. Default: 0.005 (≈5 ms).
    pub crossfade_secs: f32,
    /// Worker's bounded wait on the ingress queue, so it stays responsive
    /// to a stop request. Default: 100 ms.
    pub ingress_timeout: Duration,
    /// Target-voice reference sample, read once by `prepare()`.
    pub reference_path: PathBuf,
    /// Substring match against input device names; `None` = system default.
    pub input_device: Option<String>,
    /// Substring match against output device names; `None` = system default.
    pub output_device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            queue_capacity: QUEUE_CAPACITY,
            speech_threshold: DEFAULT_SPEECH_THRESHOLD,
            output_gain: DEFAULT_OUTPUT_GAIN,
            crossfade_secs: 0.005,
            ingress_timeout: Duration::from_millis(100),
            reference_path: PathBuf::new(),
            input_device: None,
            output_device: None,
        }
    }
}

impl SessionConfig {
    /// Crossfade seam length in samples (110 at the canonical rate).
    pub fn crossfade_len(&self) -> usize {
        (self.crossfade_secs * self.sample_rate as f32) as usize
    }

    /// Wall-clock duration of one block — also the hardware callback cadence.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }
}

/// The top-level session handle.
///
/// `VoiceSession` is `Send + Sync` — all fields use interior mutability.
/// Wrap in `Arc<VoiceSession>` to share between a control surface and
/// event-forwarding tasks.
pub struct VoiceSession {
    config: SessionConfig,
    converter: ConverterHandle,
    /// Derived once by `prepare()`; immutable for the session lifetime.
    target: Mutex<Option<Arc<TargetEmbedding>>>,
    /// `true` while the duplex stream + worker are active.
    running: Arc<AtomicBool>,
    /// Canonical status (written via Mutex, read from polling callers).
    status: Arc<Mutex<SessionStatus>>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    cycle_tx: broadcast::Sender<CycleEvent>,
    stats: Arc<PipelineStats>,
    /// Join handle for the live worker thread.
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Consumer-side clones used for depth gauges; refreshed by `start()`.
    depth_probes: Mutex<Option<(BlockConsumer, BlockConsumer)>>,
}

impl VoiceSession {
    /// Create a new session. Does not touch the model or the audio devices —
    /// call `prepare()` then `start()`.
    pub fn new(config: SessionConfig, converter: ConverterHandle) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (cycle_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            converter,
            target: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(SessionStatus::Idle)),
            status_tx,
            cycle_tx,
            stats: Arc::new(PipelineStats::default()),
            worker: Mutex::new(None),
            depth_probes: Mutex::new(None),
        }
    }

    /// Warm up the converter and derive the target embedding from the
    /// reference sample. Call once before `start()`; errors are fatal.
    pub fn prepare(&self) -> Result<()> {
        self.set_status(SessionStatus::WarmingUp, None);
        info!(
            reference = %self.config.reference_path.display(),
            "preparing voice converter"
        );

        let target = {
            let mut converter = self.converter.0.lock();
            converter.warm_up()?;
            let reference = converter.spectrogram_from_file(&self.config.reference_path)?;
            converter.extract_embedding(&reference)?
        };

        info!(embedding_len = target.len(), "target embedding derived");
        *self.target.lock() = Some(Arc::new(target));
        self.set_status(SessionStatus::Idle, None);
        Ok(())
    }

    /// Open the duplex stream and start the conversion worker.
    ///
    /// Blocks until the audio devices are confirmed open (or fail), then
    /// returns; conversion continues on a background thread.
    ///
    /// # Errors
    /// - [`PersonaError::AlreadyRunning`] if already started.
    /// - [`PersonaError::NotPrepared`] if `prepare()` has not succeeded.
    /// - Device errors from opening the duplex pair.
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PersonaError::AlreadyRunning);
        }
        let target = self
            .target
            .lock()
            .clone()
            .ok_or(PersonaError::NotPrepared)?;

        self.stats.reset();
        self.running.store(true, Ordering::SeqCst);
        self.set_status(SessionStatus::Converting, None);

        let (ingress_tx, ingress_rx) = create_block_queue(self.config.queue_capacity);
        let (egress_tx, egress_rx) = create_block_queue(self.config.queue_capacity);
        *self.depth_probes.lock() = Some((ingress_rx.clone(), egress_rx.clone()));

        // Clone all shared state before moving into the thread.
        let config = self.config.clone();
        let converter = self.converter.clone();
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let cycle_tx = self.cycle_tx.clone();

        // Sync handshake: the worker thread reports duplex-open success or
        // failure back to start() before entering the loop.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        let handle = std::thread::Builder::new()
            .name("persona-worker".into())
            .spawn(move || {
                // Open the duplex pair on THIS thread — the streams live and
                // die here and never cross a thread boundary.
                let io = match DuplexIo::open(
                    &config,
                    ingress_tx,
                    egress_rx,
                    Arc::clone(&running),
                    Arc::clone(&stats),
                ) {
                    Ok(io) => {
                        let _ = open_tx.send(Ok(()));
                        io
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };

                let gate: Box<dyn SpeechGate> =
                    Box::new(EnergyGate::new(config.speech_threshold));

                worker::run(worker::WorkerContext {
                    config,
                    converter,
                    target,
                    gate,
                    ingress: ingress_rx,
                    egress: egress_tx,
                    running,
                    stats,
                    cycle_tx,
                });

                // Streams drop here, releasing the devices on this thread.
                drop(io);
            })?;

        match open_rx.recv() {
            Ok(Ok(())) => {
                *self.worker.lock() = Some(handle);
                info!("session started — converting");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(SessionStatus::Error, Some(e.to_string()));
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent — thread panicked?
                self.running.store(false, Ordering::SeqCst);
                self.set_status(SessionStatus::Error, Some("worker failed to start".into()));
                let _ = handle.join();
                Err(PersonaError::Other(anyhow::anyhow!(
                    "worker thread died before opening the duplex stream"
                )))
            }
        }
    }

    /// Stop the worker and tear down the duplex stream.
    ///
    /// Deterministic and bounded: the worker notices the cleared flag within
    /// one ingress timeout, finishes any in-flight conversion, and is joined
    /// here before the call returns.
    ///
    /// # Errors
    /// - [`PersonaError::NotRunning`] if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(PersonaError::NotRunning);
        }

        self.running.store(false, Ordering::SeqCst);
        info!("session stop requested");

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }

        self.set_status(SessionStatus::Stopped, None);
        Ok(())
    }

    /// Current session status (snapshot).
    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Whether the stream + worker are currently active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to per-cycle conversion events.
    pub fn subscribe_cycles(&self) -> broadcast::Receiver<CycleEvent> {
        self.cycle_tx.subscribe()
    }

    /// Snapshot of the pipeline counters plus live queue depths. Never
    /// blocks either producer side; safe to poll at human timescales.
    pub fn stats(&self) -> StatsSnapshot {
        let (ingress_depth, egress_depth) = match &*self.depth_probes.lock() {
            Some((ingress, egress)) => (ingress.depth(), egress.depth()),
            None => (0, 0),
        };
        self.stats.snapshot(ingress_depth, egress_depth)
    }

    /// The configuration the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn set_status(&self, new_status: SessionStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(SessionStatusEvent {
            status: new_status,
            detail,
        });
    }
}
