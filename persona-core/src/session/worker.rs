//! Blocking conversion loop.
//!
//! ## Pipeline stages (per iteration)
//!
//! ```text
//! 1. Pop one captured block from the ingress queue (bounded 100 ms wait)
//! 2. Energy gate classify → Speech | Silence (computed once, kept with block)
//! 3. Append to the 3-block sliding window
//! 4. When the window holds 3 blocks, fire a conversion cycle:
//!    a. middle block is speech, or first silence right after speech → model
//!    b. otherwise → exact-silence chunk, no model call
//!    c. sanitize the model output, take the middle third, crossfade
//! 5. try_push the chunk to egress; evict the oldest block; record the
//!    gating decision for the next cycle's force test
//! ```
//!
//! The loop runs on a dedicated OS thread and is the only caller of the
//! converter, so a slower-than-real-time model costs throughput (drops),
//! never an audio-callback deadline.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::{
    buffering::{block::AudioBlock, BlockConsumer, BlockProducer},
    convert::{ConverterHandle, TargetEmbedding},
    events::{CycleEvent, CycleOutcome},
    gate::{SpeechGate, SpeechStatus},
    session::crossfade::Crossfade,
    session::window::SlidingWindow,
    session::SessionConfig,
    stats::PipelineStats,
};

/// All context the worker needs, passed as one struct so the spawn stays tidy.
pub struct WorkerContext {
    pub config: SessionConfig,
    pub converter: ConverterHandle,
    pub target: Arc<TargetEmbedding>,
    pub gate: Box<dyn SpeechGate>,
    pub ingress: BlockConsumer,
    pub egress: BlockProducer,
    pub running: Arc<AtomicBool>,
    pub stats: Arc<PipelineStats>,
    pub cycle_tx: broadcast::Sender<CycleEvent>,
}

/// Run the blocking conversion loop until `ctx.running` becomes false.
pub fn run(mut ctx: WorkerContext) {
    info!(
        block_size = ctx.config.block_size,
        sample_rate = ctx.config.sample_rate,
        crossfade_len = ctx.config.crossfade_len(),
        "conversion worker started"
    );

    let pop_timeout = ctx.config.ingress_timeout;
    let mut window = SlidingWindow::new();
    let mut crossfade = Crossfade::new(ctx.config.crossfade_len());
    // Previous cycle's gating decision, for the force-convert test.
    let mut last_was_speech = false;
    let mut cycle_seq = 0u64;

    loop {
        // ── 0. Check running flag ─────────────────────────────────────────
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        // ── 1. Pop one captured block (bounded wait) ──────────────────────
        let block = match ctx.ingress.pop_timeout(pop_timeout) {
            Some(block) => block,
            // Timeout — loop back to re-check the running flag.
            None => continue,
        };

        // ── 2. Gate + window ──────────────────────────────────────────────
        let status = ctx.gate.classify(&block);
        window.push(block, status);
        ctx.stats.window_len.store(window.len(), Ordering::Relaxed);

        debug!(
            window_len = window.len(),
            is_speech = status.is_speech(),
            "captured block classified"
        );

        if !window.is_full() {
            continue;
        }

        // ── 3. Conversion cycle ───────────────────────────────────────────
        let middle_speech = matches!(window.middle_status(), Some(SpeechStatus::Speech));
        let force = last_was_speech && !middle_speech;

        let started = Instant::now();
        let outcome = run_cycle(&mut ctx, &window, &mut crossfade, middle_speech, force);
        let elapsed = started.elapsed();

        // Latency statistics cover completed cycles only; failures are
        // visible through their own counter instead of skewing the mean.
        if outcome != CycleOutcome::Failed {
            ctx.stats.cycles.fetch_add(1, Ordering::Relaxed);
            ctx.stats
                .total_latency_us
                .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        }

        let latency_ms = elapsed.as_secs_f32() * 1_000.0;
        let _ = ctx.cycle_tx.send(CycleEvent {
            seq: cycle_seq,
            outcome,
            latency_ms,
            middle_speech,
        });

        debug!(
            seq = cycle_seq,
            outcome = ?outcome,
            latency_ms = format_args!("{:.2}", latency_ms),
            middle_speech,
            "conversion cycle finished"
        );

        if cycle_seq % 50 == 0 {
            debug!(
                ingress_depth = ctx.ingress.depth(),
                egress_depth = ctx.egress.depth(),
                "queue depth check"
            );
        }
        cycle_seq = cycle_seq.wrapping_add(1);

        // ── 4. Slide — exactly one eviction per fired cycle, however it
        //       ended, so a failing model can never wedge the window. ──────
        window.slide();
        last_was_speech = middle_speech;
        ctx.stats.window_len.store(window.len(), Ordering::Relaxed);
        ctx.stats
            .last_was_speech
            .store(middle_speech, Ordering::Relaxed);
    }

    let snap = ctx.stats.snapshot(ctx.ingress.depth(), ctx.egress.depth());
    info!(
        cycles = snap.cycles,
        converted = snap.converted_cycles,
        forced = snap.forced_cycles,
        silence = snap.silence_cycles,
        errors = snap.conversion_errors,
        ingress_dropped = snap.ingress_dropped,
        egress_dropped = snap.egress_dropped,
        underruns = snap.underruns,
        mean_cycle_ms = format_args!("{:.2}", snap.mean_cycle_ms),
        "conversion worker stopped — counters"
    );
}

/// Execute one conversion cycle over a full window and push the resulting
/// chunk to egress. Returns what happened; the caller owns the eviction.
fn run_cycle(
    ctx: &mut WorkerContext,
    window: &SlidingWindow,
    crossfade: &mut Crossfade,
    middle_speech: bool,
    force: bool,
) -> CycleOutcome {
    let (mut chunk, outcome) = if middle_speech || force {
        let samples = window.concat_samples();
        let converted = {
            let mut converter = ctx.converter.0.lock();
            match converter.spectrogram(&samples) {
                Ok(spectrogram) => converter.convert(&spectrogram, &ctx.target),
                Err(e) => Err(e),
            }
        };
        match converted {
            Ok(mut audio) => {
                sanitize(&mut audio.samples);
                let chunk = middle_third(&audio.samples);
                if force {
                    ctx.stats.forced_cycles.fetch_add(1, Ordering::Relaxed);
                    (chunk, CycleOutcome::Forced)
                } else {
                    ctx.stats.converted_cycles.fetch_add(1, Ordering::Relaxed);
                    (chunk, CycleOutcome::Converted)
                }
            }
            Err(e) => {
                ctx.stats.conversion_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, force, "conversion cycle failed — skipping window");
                return CycleOutcome::Failed;
            }
        }
    } else {
        // Neither current nor preceding context was speech: skip the model
        // call entirely and emit exact silence of one block.
        ctx.stats.silence_cycles.fetch_add(1, Ordering::Relaxed);
        (
            vec![0.0f32; ctx.config.block_size],
            CycleOutcome::Silence,
        )
    };

    // Applied uniformly to converted and silent chunks, so every seam class
    // (speech→speech, speech→silence, silence→speech) blends identically.
    crossfade.smooth(&mut chunk);

    if !ctx
        .egress
        .try_push(AudioBlock::new(chunk, ctx.config.sample_rate))
    {
        ctx.stats.egress_dropped.fetch_add(1, Ordering::Relaxed);
        debug!("egress queue full — output chunk dropped");
    }

    outcome
}

/// Replace non-finite samples with zero and clip the rest to [-1, 1].
fn sanitize(samples: &mut [f32]) {
    for sample in samples.iter_mut() {
        *sample = if sample.is_finite() {
            sample.clamp(-1.0, 1.0)
        } else {
            0.0
        };
    }
}

/// Central third of a converted window, `[L/3, 2L/3)`. The edge thirds carry
/// model edge-effects; the centre corresponds to the middle input block with
/// full context on both sides.
fn middle_third(samples: &[f32]) -> Vec<f32> {
    let third = samples.len() / 3;
    samples[third..2 * third].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::buffering::create_block_queue;
    use crate::convert::{ConvertedAudio, Spectrogram, VoiceConverter};
    use crate::error::{PersonaError, Result};

    struct ScriptedGate {
        statuses: Vec<SpeechStatus>,
        idx: usize,
    }

    impl ScriptedGate {
        fn new(statuses: Vec<SpeechStatus>) -> Self {
            Self { statuses, idx: 0 }
        }
    }

    impl SpeechGate for ScriptedGate {
        fn classify(&mut self, _block: &AudioBlock) -> SpeechStatus {
            let status = self
                .statuses
                .get(self.idx)
                .copied()
                .unwrap_or(SpeechStatus::Silence);
            self.idx += 1;
            status
        }
    }

    struct ScriptedConverter {
        calls: Arc<AtomicUsize>,
        source_lens: Arc<Mutex<Vec<usize>>>,
        /// Fail this many convert calls before succeeding.
        fail_remaining: usize,
        /// `None` → ramp output (`samples[i] = i / 100`), sized to the window.
        output: Option<Vec<f32>>,
    }

    impl ScriptedConverter {
        fn new(calls: Arc<AtomicUsize>, source_lens: Arc<Mutex<Vec<usize>>>) -> Self {
            Self {
                calls,
                source_lens,
                fail_remaining: 0,
                output: None,
            }
        }
    }

    impl VoiceConverter for ScriptedConverter {
        fn warm_up(&mut self) -> Result<()> {
            Ok(())
        }

        fn spectrogram(&mut self, samples: &[f32]) -> Result<Spectrogram> {
            self.source_lens.lock().push(samples.len());
            Ok(Spectrogram::new(1, 1, vec![0.0], samples.len()))
        }

        fn spectrogram_from_file(&mut self, _path: &Path) -> Result<Spectrogram> {
            Ok(Spectrogram::new(1, 1, vec![0.0], 0))
        }

        fn extract_embedding(&mut self, _spectrogram: &Spectrogram) -> Result<TargetEmbedding> {
            Ok(TargetEmbedding::new(vec![1.0]))
        }

        fn convert(
            &mut self,
            spectrogram: &Spectrogram,
            _target: &TargetEmbedding,
        ) -> Result<ConvertedAudio> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail_remaining > 0 {
                self.fail_remaining -= 1;
                return Err(PersonaError::Conversion("scripted failure".into()));
            }
            let samples = match &self.output {
                Some(samples) => samples.clone(),
                None => (0..spectrogram.source_len)
                    .map(|i| i as f32 / 100.0)
                    .collect(),
            };
            Ok(ConvertedAudio {
                samples,
                sample_rate: 22_050,
            })
        }
    }

    struct WorkerRig {
        ingress_tx: crate::buffering::BlockProducer,
        egress_rx: BlockConsumer,
        cycle_rx: broadcast::Receiver<CycleEvent>,
        running: Arc<AtomicBool>,
        stats: Arc<PipelineStats>,
        handle: thread::JoinHandle<()>,
    }

    impl WorkerRig {
        fn stop(self) -> Arc<PipelineStats> {
            self.running.store(false, Ordering::SeqCst);
            self.handle.join().expect("worker thread panicked");
            self.stats
        }
    }

    fn test_config(block_size: usize) -> SessionConfig {
        SessionConfig {
            block_size,
            // No seam blending in these tests so chunk contents stay exact;
            // the blend math has its own tests in `crossfade`.
            crossfade_secs: 0.0,
            ..SessionConfig::default()
        }
    }

    fn spawn_worker(
        config: SessionConfig,
        statuses: Vec<SpeechStatus>,
        converter: ScriptedConverter,
    ) -> WorkerRig {
        let (ingress_tx, ingress_rx) = create_block_queue(8);
        let (egress_tx, egress_rx) = create_block_queue(8);
        let (cycle_tx, cycle_rx) = broadcast::channel(16);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(PipelineStats::default());

        let ctx = WorkerContext {
            config,
            converter: ConverterHandle::new(converter),
            target: Arc::new(TargetEmbedding::new(vec![1.0])),
            gate: Box::new(ScriptedGate::new(statuses)),
            ingress: ingress_rx,
            egress: egress_tx,
            running: Arc::clone(&running),
            stats: Arc::clone(&stats),
            cycle_tx,
        };
        let handle = thread::spawn(move || run(ctx));

        WorkerRig {
            ingress_tx,
            egress_rx,
            cycle_rx,
            running,
            stats,
            handle,
        }
    }

    fn push_blocks(rig: &WorkerRig, count: usize, block_size: usize) {
        for _ in 0..count {
            assert!(rig
                .ingress_tx
                .try_push(AudioBlock::new(vec![0.5; block_size], 22_050)));
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
    fn speech_window_emits_sanitized_middle_third() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source_lens = Arc::new(Mutex::new(Vec::new()));
        let converter = ScriptedConverter::new(Arc::clone(&calls), Arc::clone(&source_lens));

        let mut rig = spawn_worker(
            test_config(4),
            vec![SpeechStatus::Speech; 3],
            converter,
        );
        push_blocks(&rig, 3, 4);

        let event = recv_cycle_with_timeout(&mut rig.cycle_rx, Duration::from_secs(1));
        assert_eq!(event.outcome, CycleOutcome::Converted);
        assert!(event.middle_speech);

        // The model saw all 12 samples; the emitted chunk is its middle third.
        let chunk = rig.egress_rx.try_pop().expect("converted chunk on egress");
        let expected: Vec<f32> = (4..8).map(|i| i as f32 / 100.0).collect();
        assert_eq!(chunk.samples, expected);
        assert_eq!(&*source_lens.lock(), &vec![12]);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        rig.stop();
    }

    #[test]
    fn silent_window_skips_model_and_emits_exact_silence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source_lens = Arc::new(Mutex::new(Vec::new()));
        let converter = ScriptedConverter::new(Arc::clone(&calls), source_lens);

        let mut rig = spawn_worker(
            test_config(4),
            vec![SpeechStatus::Silence; 3],
            converter,
        );
        push_blocks(&rig, 3, 4);

        let event = recv_cycle_with_timeout(&mut rig.cycle_rx, Duration::from_secs(1));
        assert_eq!(event.outcome, CycleOutcome::Silence);
        assert!(!event.middle_speech);

        let chunk = rig.egress_rx.try_pop().expect("silence chunk on egress");
        assert_eq!(chunk.len(), 4);
        assert!(chunk.samples.iter().all(|&s| s == 0.0));
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        let stats = rig.stop();
        let snap = stats.snapshot(0, 0);
        assert_eq!(snap.silence_cycles, 1);
        assert_eq!(snap.cycles, 1);
    }

    #[test]
    fn first_silence_after_speech_is_force_converted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source_lens = Arc::new(Mutex::new(Vec::new()));
        let converter = ScriptedConverter::new(Arc::clone(&calls), source_lens);

        let statuses = vec![
            SpeechStatus::Speech,
            SpeechStatus::Speech,
            SpeechStatus::Silence,
            SpeechStatus::Silence,
            SpeechStatus::Silence,
        ];
        let mut rig = spawn_worker(test_config(4), statuses, converter);
        push_blocks(&rig, 5, 4);

        let first = recv_cycle_with_timeout(&mut rig.cycle_rx, Duration::from_secs(1));
        let second = recv_cycle_with_timeout(&mut rig.cycle_rx, Duration::from_secs(1));
        let third = recv_cycle_with_timeout(&mut rig.cycle_rx, Duration::from_secs(1));

        // Middle=speech converts; the boundary cycle is forced; afterwards
        // pure silence with no model call.
        assert_eq!(first.outcome, CycleOutcome::Converted);
        assert_eq!(second.outcome, CycleOutcome::Forced);
        assert!(!second.middle_speech);
        assert_eq!(third.outcome, CycleOutcome::Silence);
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        let stats = rig.stop();
        let snap = stats.snapshot(0, 0);
        assert_eq!(snap.converted_cycles, 1);
        assert_eq!(snap.forced_cycles, 1);
        assert_eq!(snap.silence_cycles, 1);
        assert_eq!(snap.cycles, 3);
        // One eviction per fired cycle leaves the window awaiting one block.
        assert_eq!(snap.window_len, 2);
    }

    #[test]
    fn failed_cycle_is_skipped_and_worker_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source_lens = Arc::new(Mutex::new(Vec::new()));
        let mut converter = ScriptedConverter::new(Arc::clone(&calls), source_lens);
        converter.fail_remaining = 1;

        let mut rig = spawn_worker(
            test_config(4),
            vec![SpeechStatus::Speech; 4],
            converter,
        );
        push_blocks(&rig, 4, 4);

        let first = recv_cycle_with_timeout(&mut rig.cycle_rx, Duration::from_secs(1));
        let second = recv_cycle_with_timeout(&mut rig.cycle_rx, Duration::from_secs(1));
        assert_eq!(first.outcome, CycleOutcome::Failed);
        assert_eq!(second.outcome, CycleOutcome::Converted);

        // The failed cycle emitted nothing, but still slid the window.
        let chunk = rig.egress_rx.try_pop().expect("recovered chunk on egress");
        assert!(!chunk.is_empty());
        assert!(rig.egress_rx.try_pop().is_none());

        let stats = rig.stop();
        let snap = stats.snapshot(0, 0);
        assert_eq!(snap.conversion_errors, 1);
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.converted_cycles, 1);
    }

    #[test]
    fn non_finite_model_output_is_scrubbed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source_lens = Arc::new(Mutex::new(Vec::new()));
        let mut converter = ScriptedConverter::new(calls, source_lens);
        converter.output = Some(vec![
            0.1,
            0.1,
            0.1,
            f32::NAN,
            5.0,
            -5.0,
            0.1,
            0.1,
            0.1,
        ]);

        let mut rig = spawn_worker(
            test_config(3),
            vec![SpeechStatus::Speech; 3],
            converter,
        );
        push_blocks(&rig, 3, 3);

        recv_cycle_with_timeout(&mut rig.cycle_rx, Duration::from_secs(1));
        let chunk = rig.egress_rx.try_pop().expect("scrubbed chunk on egress");
        assert_eq!(chunk.samples, vec![0.0, 1.0, -1.0]);

        rig.stop();
    }

    #[test]
    fn worker_exits_promptly_when_flag_cleared() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source_lens = Arc::new(Mutex::new(Vec::new()));
        let converter = ScriptedConverter::new(calls, source_lens);

        let rig = spawn_worker(test_config(4), vec![], converter);

        let start = Instant::now();
        rig.running.store(false, Ordering::SeqCst);
        rig.handle.join().expect("worker thread panicked");
        // Bounded by one ingress timeout window.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sanitize_zeroes_non_finite_and_clips() {
        let mut samples = vec![0.5, f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 1.5, -2.0];
        sanitize(&mut samples);
        assert_eq!(samples, vec![0.5, 0.0, 0.0, 0.0, 1.0, -1.0]);
    }

    #[test]
    fn middle_third_takes_central_slice() {
        let samples: Vec<f32> = (0..12).map(|i| i as f32).collect();
        assert_eq!(middle_third(&samples), vec![4.0, 5.0, 6.0, 7.0]);
    }
}
