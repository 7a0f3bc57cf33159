//! persona — command-line front end for the voice-conversion engine.
//!
//! Two subcommands: `run` opens a live microphone→speakers conversion
//! session and reports pipeline counters once per second until Ctrl-C;
//! `devices` lists the audio hardware the session could bind to.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use persona_core::audio::device::{list_input_devices, list_output_devices};
use persona_core::gate::energy::DEFAULT_SPEECH_THRESHOLD;
use persona_core::session::{DEFAULT_BLOCK_SIZE, DEFAULT_OUTPUT_GAIN, DEFAULT_SAMPLE_RATE};
use persona_core::{ConverterHandle, DeviceInfo, SessionConfig, StubConverter, VoiceSession};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "persona", version, about = "Real-time voice conversion")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert live microphone input to the target voice until Ctrl-C.
    Run(RunArgs),
    /// List audio capture and playback devices.
    Devices {
        /// Emit the device list as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Reference sample of the target voice (WAV).
    #[arg(long)]
    reference: PathBuf,

    /// Directory holding the ONNX checkpoints (`embedder.onnx` +
    /// `synthesizer.onnx`). Without it the deterministic stub backend runs.
    #[arg(long)]
    models: Option<PathBuf>,

    /// Substring match against input device names; omit for system default.
    #[arg(long)]
    input_device: Option<String>,

    /// Substring match against output device names; omit for system default.
    #[arg(long)]
    output_device: Option<String>,

    /// Samples per captured block.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Pipeline sample rate in Hz.
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    sample_rate: u32,

    /// Mean-absolute-amplitude threshold for the speech gate.
    #[arg(long, default_value_t = DEFAULT_SPEECH_THRESHOLD)]
    speech_threshold: f32,

    /// Gain applied to each playback block.
    #[arg(long, default_value_t = DEFAULT_OUTPUT_GAIN)]
    output_gain: f32,

    /// Emit the per-second stats line as JSON instead of a log record.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "persona=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Devices { json } => devices(json),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    info!(
        reference = %args.reference.display(),
        block_size = args.block_size,
        sample_rate = args.sample_rate,
        speech_threshold = args.speech_threshold,
        output_gain = args.output_gain,
        "starting voice conversion"
    );

    let converter = select_converter(args.models.as_deref(), args.sample_rate);

    let config = SessionConfig {
        sample_rate: args.sample_rate,
        block_size: args.block_size,
        speech_threshold: args.speech_threshold,
        output_gain: args.output_gain,
        reference_path: args.reference.clone(),
        input_device: args.input_device.clone(),
        output_device: args.output_device.clone(),
        ..SessionConfig::default()
    };
    let session = VoiceSession::new(config, converter);

    // Forward status changes to the log as they happen.
    let mut status_rx = session.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => match event.detail {
                    Some(detail) => info!(status = ?event.status, %detail, "session status"),
                    None => info!(status = ?event.status, "session status"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("status receiver lagged by {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    session
        .prepare()
        .context("failed to prepare the voice converter")?;
    session
        .start()
        .context("failed to start the conversion session")?;
    info!("converting — press Ctrl-C to stop");

    let mut timer = tokio::time::interval(Duration::from_secs(1));
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; swallow it so the first stats
    // line lands a full second in.
    timer.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    warn!("ctrl-c handler failed: {e}");
                }
                break;
            }
            _ = timer.tick() => report_stats(&session, args.json),
        }
    }

    info!("stopping session");
    session.stop().context("failed to stop the session")?;
    Ok(())
}

fn report_stats(session: &VoiceSession, json: bool) {
    let snap = session.stats();
    if json {
        match serde_json::to_string(&snap) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("stats serialization failed: {e}"),
        }
        return;
    }

    info!(
        cycles = snap.cycles,
        converted = snap.converted_cycles,
        forced = snap.forced_cycles,
        silence = snap.silence_cycles,
        errors = snap.conversion_errors,
        mean_cycle_ms = format_args!("{:.1}", snap.mean_cycle_ms),
        ingress_depth = snap.ingress_depth,
        egress_depth = snap.egress_depth,
        ingress_dropped = snap.ingress_dropped,
        egress_dropped = snap.egress_dropped,
        underruns = snap.underruns,
        "pipeline stats"
    );
}

#[cfg(feature = "onnx")]
fn select_converter(models: Option<&Path>, sample_rate: u32) -> ConverterHandle {
    use persona_core::convert::onnx::{OnnxConverter, OnnxConverterConfig};

    if let Some(dir) = models {
        let cfg = OnnxConverterConfig::from_dir(dir, sample_rate);
        if cfg.embedder_path.exists() && cfg.synthesizer_path.exists() {
            info!("loading OnnxConverter from {dir:?}");
            return ConverterHandle::new(OnnxConverter::new(cfg));
        }
        warn!("ONNX checkpoints not found in {dir:?} — using StubConverter");
    }
    ConverterHandle::new(StubConverter::new(sample_rate))
}

#[cfg(not(feature = "onnx"))]
fn select_converter(models: Option<&Path>, sample_rate: u32) -> ConverterHandle {
    if models.is_some() {
        warn!("built without the onnx feature — using StubConverter");
    }
    ConverterHandle::new(StubConverter::new(sample_rate))
}

fn devices(json: bool) -> anyhow::Result<()> {
    let inputs = list_input_devices();
    let outputs = list_output_devices();

    if json {
        let listing = serde_json::json!({ "inputs": inputs, "outputs": outputs });
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    println!("Input devices:");
    print_device_list(&inputs);
    println!();
    println!("Output devices:");
    print_device_list(&outputs);
    Ok(())
}

fn print_device_list(devices: &[DeviceInfo]) {
    if devices.is_empty() {
        println!("  (none found)");
        return;
    }
    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  {}{marker}", device.name);
    }
}
