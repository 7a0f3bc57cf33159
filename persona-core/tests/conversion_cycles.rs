use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use persona_core::buffering::{block::AudioBlock, create_block_queue};
use persona_core::convert::{ConvertedAudio, Spectrogram};
use persona_core::events::{CycleEvent, CycleOutcome};
use persona_core::gate::EnergyGate;
use persona_core::session::{worker, SessionConfig};
use persona_core::stats::PipelineStats;
use persona_core::{ConverterHandle, PersonaError, TargetEmbedding, VoiceConverter};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

const SAMPLE_RATE: u32 = 22_050;
const BLOCK: usize = 300;

/// Backend that sleeps like a real model and synthesises a constant waveform
/// of the requested length.
struct DelayConverter {
    delay: Duration,
    level: f32,
}

impl DelayConverter {
    fn new(delay: Duration, level: f32) -> Self {
        Self { delay, level }
    }
}

impl VoiceConverter for DelayConverter {
    fn warm_up(&mut self) -> std::result::Result<(), PersonaError> {
        Ok(())
    }

    fn spectrogram(&mut self, samples: &[f32]) -> std::result::Result<Spectrogram, PersonaError> {
        Ok(Spectrogram::new(1, 1, vec![0.0], samples.len()))
    }

    fn spectrogram_from_file(
        &mut self,
        _path: &Path,
    ) -> std::result::Result<Spectrogram, PersonaError> {
        Ok(Spectrogram::new(1, 1, vec![0.0], 0))
    }

    fn extract_embedding(
        &mut self,
        _spectrogram: &Spectrogram,
    ) -> std::result::Result<TargetEmbedding, PersonaError> {
        Ok(TargetEmbedding::new(vec![0.0; 8]))
    }

    fn convert(
        &mut self,
        spectrogram: &Spectrogram,
        _target: &TargetEmbedding,
    ) -> std::result::Result<ConvertedAudio, PersonaError> {
        thread::sleep(self.delay);

        Ok(ConvertedAudio {
            samples: vec![self.level; spectrogram.source_len],
            sample_rate: SAMPLE_RATE,
        })
    }
}

fn recv_cycle_with_timeout(
    rx: &mut broadcast::Receiver<CycleEvent>,
    timeout: Duration,
) -> CycleEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for cycle event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("cycle channel closed unexpectedly"),
        }
    }
}

#[test]
fn first_converted_chunk_latency_under_500ms() {
    let (ingress_tx, ingress_rx) = create_block_queue(8);
    let (egress_tx, egress_rx) = create_block_queue(8);
    for _ in 0..3 {
        assert!(ingress_tx.try_push(AudioBlock::new(vec![0.2; BLOCK], SAMPLE_RATE)));
    }

    let running = Arc::new(AtomicBool::new(true));
    let (cycle_tx, mut cycle_rx) = broadcast::channel(16);

    let mut config = SessionConfig::default();
    config.block_size = BLOCK;
    config.sample_rate = SAMPLE_RATE;

    let ctx = worker::WorkerContext {
        config,
        converter: ConverterHandle::new(DelayConverter::new(Duration::from_millis(20), 0.4)),
        target: Arc::new(TargetEmbedding::new(vec![0.0; 8])),
        gate: Box::new(EnergyGate::default()),
        ingress: ingress_rx,
        egress: egress_tx,
        running: Arc::clone(&running),
        stats: Arc::new(PipelineStats::default()),
        cycle_tx,
    };

    let start = Instant::now();
    let handle = thread::spawn(move || worker::run(ctx));

    let first = recv_cycle_with_timeout(&mut cycle_rx, Duration::from_secs(2));
    let elapsed = start.elapsed();

    running.store(false, Ordering::SeqCst);
    handle.join().expect("worker thread panicked");

    assert_eq!(first.outcome, CycleOutcome::Converted);
    assert!(first.middle_speech);
    assert!(
        elapsed < Duration::from_millis(500),
        "first-chunk latency too high: {:?} (target < 500ms)",
        elapsed
    );

    // The very first chunk has no crossfade tail, so it is the model's middle
    // third verbatim.
    let chunk = egress_rx.try_pop().expect("converted chunk on egress");
    assert_eq!(chunk.len(), BLOCK);
    assert!(chunk.samples.iter().all(|s| (s - 0.4).abs() < 1e-5));
}

#[test]
fn speech_tail_forces_one_conversion_then_goes_silent() {
    let (ingress_tx, ingress_rx) = create_block_queue(8);
    let (egress_tx, egress_rx) = create_block_queue(8);

    // Three loud blocks, then three quiet ones: the windows walk the seam
    // speech → speech → forced boundary → pure silence.
    for _ in 0..3 {
        assert!(ingress_tx.try_push(AudioBlock::new(vec![0.2; BLOCK], SAMPLE_RATE)));
    }
    for _ in 0..3 {
        assert!(ingress_tx.try_push(AudioBlock::new(vec![0.001; BLOCK], SAMPLE_RATE)));
    }

    let running = Arc::new(AtomicBool::new(true));
    let stats = Arc::new(PipelineStats::default());
    let (cycle_tx, mut cycle_rx) = broadcast::channel(16);

    let mut config = SessionConfig::default();
    config.block_size = BLOCK;
    config.sample_rate = SAMPLE_RATE;
    let fade_len = config.crossfade_len();

    let ctx = worker::WorkerContext {
        config,
        converter: ConverterHandle::new(DelayConverter::new(Duration::from_millis(5), 0.5)),
        target: Arc::new(TargetEmbedding::new(vec![0.0; 8])),
        gate: Box::new(EnergyGate::default()),
        ingress: ingress_rx,
        egress: egress_tx,
        running: Arc::clone(&running),
        stats: Arc::clone(&stats),
        cycle_tx,
    };
    let handle = thread::spawn(move || worker::run(ctx));

    let mut events = Vec::new();
    for _ in 0..4 {
        events.push(recv_cycle_with_timeout(&mut cycle_rx, Duration::from_secs(2)));
    }

    running.store(false, Ordering::SeqCst);
    handle.join().expect("worker thread panicked");

    let outcomes: Vec<CycleOutcome> = events.iter().map(|e| e.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            CycleOutcome::Converted,
            CycleOutcome::Converted,
            CycleOutcome::Forced,
            CycleOutcome::Silence,
        ]
    );
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
    assert!(events[1].middle_speech);
    assert!(!events[2].middle_speech);

    // Constant-level speech crosses its own seams without a dip.
    for _ in 0..3 {
        let chunk = egress_rx.try_pop().expect("speech chunk on egress");
        assert_eq!(chunk.len(), BLOCK);
        assert!(chunk.samples.iter().all(|s| (s - 0.5).abs() < 1e-5));
    }

    // The silence chunk fades the last speech tail out over the seam and is
    // exactly zero beyond it.
    let silent = egress_rx.try_pop().expect("silence chunk on egress");
    assert_eq!(silent.len(), BLOCK);
    assert!((silent.samples[0] - 0.5).abs() < 1e-5);
    assert!(silent.samples[fade_len..].iter().all(|&s| s == 0.0));
    assert!(egress_rx.try_pop().is_none());

    let snap = stats.snapshot(0, 0);
    assert_eq!(snap.cycles, 4);
    assert_eq!(snap.converted_cycles, 2);
    assert_eq!(snap.forced_cycles, 1);
    assert_eq!(snap.silence_cycles, 1);
    assert_eq!(snap.conversion_errors, 0);
    assert_eq!(snap.window_len, 2);
    assert!(!snap.last_was_speech);
    assert!(snap.mean_cycle_ms > 0.0);
}
