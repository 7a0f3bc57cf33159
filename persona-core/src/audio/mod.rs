//! Duplex audio I/O via the cpal backend.
//!
//! # Design constraints
//!
//! Both cpal callbacks run on OS audio threads at elevated (TIME_CRITICAL on
//! Windows) priority, with a hard deadline of one block duration. They
//! **must not**:
//! - Block on a mutex or condvar
//! - Perform I/O
//! - Call the converter, ever
//!
//! The capture callback downmixes, re-blocks through a [`BlockFramer`] and
//! `try_push`es to the ingress queue (counting a drop on full); the playback
//! callback `try_pop`s from egress and renders the block — or exact silence
//! on underrun — scaled by the output gain. Allocation is limited to one
//! `Vec` per completed block, roughly two per second at the canonical
//! configuration.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `DuplexIo` therefore must be created and dropped on the same
//! thread. The session accomplishes this by calling `open` at the top of the
//! worker thread.
//!
//! # Rate and buffer negotiation
//!
//! The pipeline runs at one fixed rate with no live-path resampling, so a
//! device that cannot open at `config.sample_rate` is a fatal startup error.
//! A fixed hardware buffer of one block is requested on both streams; the
//! input side may fall back to the host's default size (the framer re-cuts
//! whatever arrives), but playback cadence is the output contract, so a host
//! that refuses a fixed output buffer fails `open`.

pub mod device;
pub mod framing;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BufferSize, SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange,
};

use std::sync::{atomic::AtomicBool, Arc};

#[cfg(feature = "audio-cpal")]
use std::sync::atomic::Ordering;

#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
use crate::audio::framing::{render_block_into, BlockFramer};
use crate::{
    buffering::{BlockConsumer, BlockProducer},
    error::{PersonaError, Result},
    session::SessionConfig,
    stats::PipelineStats,
};

/// Sample formats the duplex boundary can speak. Negotiation prefers `F32`
/// (the pipeline's native format) and converts `I16` at the callback edge.
#[cfg(feature = "audio-cpal")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    F32,
    I16,
}

/// Handle to an active duplex stream pair.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct DuplexIo {
    /// Kept alive so the capture stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _input: Stream,
    /// Kept alive so the playback stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _output: Stream,
}

#[cfg(feature = "audio-cpal")]
impl DuplexIo {
    /// Open capture and playback streams at the pipeline rate and start them.
    ///
    /// Device selection: a configured name is matched as a substring against
    /// the host's device list; no match falls back to the system default,
    /// then to the first available device.
    ///
    /// # Errors
    /// [`PersonaError::NoInputDevice`] / [`PersonaError::NoOutputDevice`]
    /// when no device exists, [`PersonaError::AudioDevice`] when no usable
    /// config exists at the pipeline rate, [`PersonaError::AudioStream`] when
    /// stream construction fails.
    pub fn open(
        config: &SessionConfig,
        ingress: BlockProducer,
        egress: BlockConsumer,
        running: Arc<AtomicBool>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let input_device = resolve_input_device(&host, config.input_device.as_deref())?;
        let output_device = resolve_output_device(&host, config.output_device.as_deref())?;

        info!(
            input = input_device.name().unwrap_or_default().as_str(),
            output = output_device.name().unwrap_or_default().as_str(),
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            "opening duplex stream"
        );

        let supported_in = input_device
            .supported_input_configs()
            .map_err(|e| PersonaError::AudioDevice(e.to_string()))?;
        let (in_format, in_channels) =
            negotiate_format(supported_in, config.sample_rate).ok_or_else(|| {
                PersonaError::AudioDevice(format!(
                    "input device '{}' offers no f32/i16 config at {} Hz",
                    input_device.name().unwrap_or_default(),
                    config.sample_rate
                ))
            })?;

        let supported_out = output_device
            .supported_output_configs()
            .map_err(|e| PersonaError::AudioDevice(e.to_string()))?;
        let (out_format, out_channels) =
            negotiate_format(supported_out, config.sample_rate).ok_or_else(|| {
                PersonaError::AudioDevice(format!(
                    "output device '{}' offers no f32/i16 config at {} Hz",
                    output_device.name().unwrap_or_default(),
                    config.sample_rate
                ))
            })?;

        info!(
            in_format = ?in_format,
            in_channels,
            out_format = ?out_format,
            out_channels,
            "duplex config negotiated"
        );

        // ── Capture stream ────────────────────────────────────────────────
        let build_input = |buffer_size: BufferSize| {
            let stream_config = StreamConfig {
                channels: in_channels,
                sample_rate: SampleRate(config.sample_rate),
                buffer_size,
            };
            let running = Arc::clone(&running);
            let ingress = ingress.clone();
            let stats = Arc::clone(&stats);
            let mut framer = BlockFramer::new(config.block_size, config.sample_rate);
            let ch = in_channels as usize;
            let mut mix_buf: Vec<f32> = Vec::new();

            match in_format {
                WireFormat::F32 => input_device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        if ch == 1 {
                            framer.push_samples(data);
                        } else {
                            downmix(data, ch, &mut mix_buf);
                            framer.push_samples(&mix_buf);
                        }
                        drain_framer(&mut framer, &ingress, &stats);
                    },
                    |err| error!("input stream error: {err}"),
                    None,
                ),
                WireFormat::I16 => input_device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _info: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0.0);
                        if ch == 1 {
                            for (dst, sample) in mix_buf.iter_mut().zip(data) {
                                *dst = *sample as f32 / 32768.0;
                            }
                        } else {
                            for f in 0..frames {
                                let base = f * ch;
                                let mut sum = 0f32;
                                for c in 0..ch {
                                    sum += data[base + c] as f32 / 32768.0;
                                }
                                mix_buf[f] = sum / ch as f32;
                            }
                        }
                        framer.push_samples(&mix_buf);
                        drain_framer(&mut framer, &ingress, &stats);
                    },
                    |err| error!("input stream error: {err}"),
                    None,
                ),
            }
        };

        let input_stream = match build_input(BufferSize::Fixed(config.block_size as u32)) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    error = %e,
                    "fixed input buffer rejected — falling back to the host default"
                );
                build_input(BufferSize::Default)
                    .map_err(|e| PersonaError::AudioStream(e.to_string()))?
            }
        };

        // ── Playback stream ───────────────────────────────────────────────
        // No fallback here: one block per callback IS the playback contract.
        let build_output = |buffer_size: BufferSize| {
            let stream_config = StreamConfig {
                channels: out_channels,
                sample_rate: SampleRate(config.sample_rate),
                buffer_size,
            };
            let running = Arc::clone(&running);
            let egress = egress.clone();
            let stats = Arc::clone(&stats);
            let gain = config.output_gain;
            let ch = out_channels as usize;
            let mut render_buf: Vec<f32> = Vec::new();

            match out_format {
                WireFormat::F32 => output_device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            data.fill(0.0);
                            return;
                        }
                        let block = egress.try_pop();
                        if block.is_none() {
                            stats.underruns.fetch_add(1, Ordering::Relaxed);
                        }
                        if ch == 1 {
                            render_block_into(data, block.as_ref(), gain);
                        } else {
                            let frames = data.len() / ch;
                            render_buf.resize(frames, 0.0);
                            render_block_into(&mut render_buf, block.as_ref(), gain);
                            for f in 0..frames {
                                let sample = render_buf[f];
                                for c in 0..ch {
                                    data[f * ch + c] = sample;
                                }
                            }
                        }
                    },
                    |err| error!("output stream error: {err}"),
                    None,
                ),
                WireFormat::I16 => output_device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _info: &cpal::OutputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            data.fill(0);
                            return;
                        }
                        let block = egress.try_pop();
                        if block.is_none() {
                            stats.underruns.fetch_add(1, Ordering::Relaxed);
                        }
                        let frames = data.len() / ch;
                        render_buf.resize(frames, 0.0);
                        render_block_into(&mut render_buf, block.as_ref(), gain);
                        for f in 0..frames {
                            let sample = (render_buf[f].clamp(-1.0, 1.0) * 32767.0) as i16;
                            for c in 0..ch {
                                data[f * ch + c] = sample;
                            }
                        }
                    },
                    |err| error!("output stream error: {err}"),
                    None,
                ),
            }
        };

        let output_stream = build_output(BufferSize::Fixed(config.block_size as u32))
            .map_err(|e| {
                PersonaError::AudioStream(format!(
                    "output stream at a fixed {}-frame buffer: {e}",
                    config.block_size
                ))
            })?;

        input_stream
            .play()
            .map_err(|e| PersonaError::AudioStream(e.to_string()))?;
        output_stream
            .play()
            .map_err(|e| PersonaError::AudioStream(e.to_string()))?;

        info!("duplex stream running");

        Ok(Self {
            _input: input_stream,
            _output: output_stream,
        })
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl DuplexIo {
    pub fn open(
        _config: &SessionConfig,
        _ingress: BlockProducer,
        _egress: BlockConsumer,
        _running: Arc<AtomicBool>,
        _stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        Err(PersonaError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

/// Average interleaved frames down to mono.
#[cfg(feature = "audio-cpal")]
fn downmix(data: &[f32], channels: usize, out: &mut Vec<f32>) {
    let frames = data.len() / channels;
    out.resize(frames, 0.0);
    for f in 0..frames {
        let base = f * channels;
        let mut sum = 0f32;
        for c in 0..channels {
            sum += data[base + c];
        }
        out[f] = sum / channels as f32;
    }
}

/// Push every completed block to ingress, counting drops.
#[cfg(feature = "audio-cpal")]
fn drain_framer(framer: &mut BlockFramer, ingress: &BlockProducer, stats: &PipelineStats) {
    while let Some(block) = framer.pop_block() {
        if !ingress.try_push(block) {
            stats.ingress_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn resolve_input_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    if let Some(wanted) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) = devices.find(|d| device_name_matches(d, wanted)) {
                    return Ok(device);
                }
                warn!("preferred input device '{wanted}' not found, falling back");
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }

    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }

    let mut devices = host
        .input_devices()
        .map_err(|e| PersonaError::AudioDevice(e.to_string()))?;
    let fallback = devices.next().ok_or(PersonaError::NoInputDevice)?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

#[cfg(feature = "audio-cpal")]
fn resolve_output_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    if let Some(wanted) = preferred {
        match host.output_devices() {
            Ok(mut devices) => {
                if let Some(device) = devices.find(|d| device_name_matches(d, wanted)) {
                    return Ok(device);
                }
                warn!("preferred output device '{wanted}' not found, falling back");
            }
            Err(e) => warn!("failed to list output devices while resolving preference: {e}"),
        }
    }

    if let Some(default) = host.default_output_device() {
        return Ok(default);
    }

    let mut devices = host
        .output_devices()
        .map_err(|e| PersonaError::AudioDevice(e.to_string()))?;
    let fallback = devices.next().ok_or(PersonaError::NoOutputDevice)?;
    warn!("no default output device, falling back to first available output");
    Ok(fallback)
}

#[cfg(feature = "audio-cpal")]
fn device_name_matches(device: &cpal::Device, wanted: &str) -> bool {
    device
        .name()
        .map(|name| name.contains(wanted))
        .unwrap_or(false)
}

/// Choose a sample format and channel count usable at `sample_rate`.
///
/// Preference order: f32 over i16 (no conversion at the edge), then the
/// fewest channels (less downmix/upmix work).
#[cfg(feature = "audio-cpal")]
fn negotiate_format<I>(ranges: I, sample_rate: u32) -> Option<(WireFormat, u16)>
where
    I: IntoIterator<Item = SupportedStreamConfigRange>,
{
    let mut best: Option<(WireFormat, u16)> = None;
    for range in ranges {
        if range.min_sample_rate().0 > sample_rate || range.max_sample_rate().0 < sample_rate {
            continue;
        }
        let format = match range.sample_format() {
            SampleFormat::F32 => WireFormat::F32,
            SampleFormat::I16 => WireFormat::I16,
            _ => continue,
        };
        let candidate = (format, range.channels());
        best = Some(match best {
            None => candidate,
            Some(current) => pick_preferred(current, candidate),
        });
    }
    best
}

#[cfg(feature = "audio-cpal")]
fn pick_preferred(a: (WireFormat, u16), b: (WireFormat, u16)) -> (WireFormat, u16) {
    let rank =
        |(format, channels): (WireFormat, u16)| (format == WireFormat::F32, std::cmp::Reverse(channels));
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}
