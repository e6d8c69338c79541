//! Microphone capture pipeline.
//!
//! Pulls raw frames from the default input device on a dedicated thread
//! (cpal streams are not `Send`), downmixes to mono, resamples to 16 kHz,
//! and emits fixed-size PCM16 frames as base64 payloads ready for the wire.
//! A smoothed RMS volume reading is published alongside the frames.

use crate::error::{LiveError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Sample rate of outbound media frames.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;
/// Samples per outbound frame (64 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 1_024;

const VOLUME_SMOOTHING: f32 = 0.2;

/// Output of the capture pipeline.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// One frame of 16 kHz mono PCM16, base64-encoded little-endian bytes.
    Data(String),
    /// Smoothed input level in `0.0..=1.0`.
    Volume(f32),
}

type StartOutcome = std::result::Result<(), String>;

enum State {
    Idle,
    Starting(watch::Receiver<Option<StartOutcome>>),
    Recording { stop: Arc<AtomicBool> },
}

/// Capture device lifecycle and frame producer.
///
/// `start` is reentrant: overlapping calls while the device is opening all
/// resolve with the outcome of the single in-flight open. A `stop` issued
/// while opening is deferred and applied as soon as the open completes.
pub struct AudioCapture {
    state: Mutex<State>,
    pending_stop: AtomicBool,
    sender: mpsc::UnboundedSender<CaptureEvent>,
    volume: Arc<AtomicU32>,
}

impl AudioCapture {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let capture = Arc::new(Self {
            state: Mutex::new(State::Idle),
            pending_stop: AtomicBool::new(false),
            sender,
            volume: Arc::new(AtomicU32::new(0)),
        });
        (capture, receiver)
    }

    /// Open the input device and begin producing frames.
    ///
    /// Returns once the stream is live (or the open failed). Calling while
    /// already recording is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut waiter = {
            let mut state = self.state.lock();
            match &*state {
                State::Recording { .. } => return Ok(()),
                State::Starting(outcome) => outcome.clone(),
                State::Idle => {
                    let (tx, rx) = watch::channel(None);
                    *state = State::Starting(rx.clone());
                    self.begin_open(tx);
                    rx
                }
            }
        };

        loop {
            if let Some(outcome) = waiter.borrow_and_update().clone() {
                return outcome.map_err(LiveError::device);
            }
            if waiter.changed().await.is_err() {
                return Err(LiveError::device("capture open task dropped"));
            }
        }
    }

    /// Stop producing frames and release the device.
    ///
    /// Never raises. If the device is still opening, the stop is deferred
    /// until the open resolves.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        match &*state {
            State::Idle => {}
            State::Starting(_) => {
                self.pending_stop.store(true, Ordering::SeqCst);
            }
            State::Recording { stop } => {
                stop.store(true, Ordering::SeqCst);
                *state = State::Idle;
                tracing::debug!("capture stopped");
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(&*self.state.lock(), State::Recording { .. })
    }

    /// Latest smoothed input level.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn begin_open(self: &Arc<Self>, outcome: watch::Sender<Option<StartOutcome>>) {
        let this = self.clone();
        tokio::spawn(async move {
            let stop = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = oneshot::channel();
            let thread_stop = stop.clone();
            let sender = this.sender.clone();
            let volume = this.volume.clone();
            std::thread::spawn(move || capture_thread(thread_stop, sender, volume, ready_tx));

            match ready_rx.await {
                Ok(Ok(())) => {
                    *this.state.lock() = State::Recording { stop };
                    let _ = outcome.send(Some(Ok(())));
                    if this.pending_stop.swap(false, Ordering::SeqCst) {
                        this.stop();
                    }
                }
                Ok(Err(e)) => {
                    *this.state.lock() = State::Idle;
                    this.pending_stop.store(false, Ordering::SeqCst);
                    tracing::warn!("capture open failed: {e}");
                    let _ = outcome.send(Some(Err(e)));
                }
                Err(_) => {
                    *this.state.lock() = State::Idle;
                    this.pending_stop.store(false, Ordering::SeqCst);
                    let _ = outcome.send(Some(Err("capture thread exited".to_string())));
                }
            }
        });
    }
}

/// Owns the cpal stream for the lifetime of one recording session.
fn capture_thread(
    stop: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<CaptureEvent>,
    volume: Arc<AtomicU32>,
    ready: oneshot::Sender<StartOutcome>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        let _ = ready.send(Err("no input device available".to_string()));
        return;
    };
    let config = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = ready.send(Err(format!("input config unavailable: {e}")));
            return;
        }
    };
    let source_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();

    let mut assembler = FrameAssembler::new();
    let mut level = 0.0f32;
    let mut handle = move |samples: &[f32]| {
        process_input(samples, channels, source_rate, &mut assembler, &mut level, &volume, &sender);
    };

    let err_fn = |e| tracing::warn!("capture stream error: {e}");
    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _| handle(data),
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _| {
                let floats: Vec<f32> = data.iter().map(|&s| s as f32 / 32_768.0).collect();
                handle(&floats);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _| {
                let floats: Vec<f32> =
                    data.iter().map(|&s| (s as f32 - 32_768.0) / 32_768.0).collect();
                handle(&floats);
            },
            err_fn,
            None,
        ),
        other => {
            let _ = ready.send(Err(format!("unsupported sample format: {other:?}")));
            return;
        }
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(format!("input stream failed: {e}")));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(format!("input stream would not play: {e}")));
        return;
    }
    tracing::info!(source_rate, channels, "capture stream live");
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}

/// Process one device callback worth of samples: emit a volume reading for
/// every callback (so the meter moves while a frame is still accumulating)
/// and a data frame for each completed 1024-sample block.
fn process_input(
    samples: &[f32],
    channels: usize,
    source_rate: u32,
    assembler: &mut FrameAssembler,
    level: &mut f32,
    volume: &AtomicU32,
    sender: &mpsc::UnboundedSender<CaptureEvent>,
) {
    let mono = downmix(samples, channels);
    let resampled = resample_linear(&mono, source_rate, TARGET_SAMPLE_RATE);
    let pcm: Vec<i16> = resampled.iter().copied().map(f32_to_i16).collect();

    if !pcm.is_empty() {
        *level = smooth_rms(*level, &pcm);
        volume.store(level.to_bits(), Ordering::Relaxed);
        let _ = sender.send(CaptureEvent::Volume(*level));
    }
    for frame in assembler.push(&pcm) {
        let _ = sender.send(CaptureEvent::Data(BASE64.encode(pcm_bytes(&frame))));
    }
}

/// Accumulates samples across callbacks and yields fixed-size frames.
struct FrameAssembler {
    pending: Vec<i16>,
}

impl FrameAssembler {
    fn new() -> Self {
        Self { pending: Vec::with_capacity(FRAME_SAMPLES * 2) }
    }

    fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= FRAME_SAMPLES {
            let rest = self.pending.split_off(FRAME_SAMPLES);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }
}

fn downmix(input: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return input.to_vec();
    }
    input
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

pub(crate) fn resample_linear(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from as f32 / to as f32;
    let out_len = (input.len() as f32 / ratio) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f32 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f32;
        let a = input[idx.min(input.len() - 1)];
        let b = input[(idx + 1).min(input.len() - 1)];
        out.push(a + (b - a) * frac);
    }
    out
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

fn smooth_rms(previous: f32, frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return previous;
    }
    let sum: f64 = frame.iter().map(|&s| (s as f64 / 32_768.0).powi(2)).sum();
    let rms = (sum / frame.len() as f64).sqrt() as f32;
    previous + VOLUME_SMOOTHING * (rms - previous)
}
