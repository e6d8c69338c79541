//! Model audio playback pipeline.
//!
//! Buffers arrive as 24 kHz mono PCM16 and are scheduled back to back: each
//! buffer starts at whichever is later, the end of the previously scheduled
//! buffer or the current playhead. Consecutive buffers therefore play
//! gapless, and a late arrival after a gap starts immediately rather than in
//! the past. The output device is owned by a dedicated thread.

use crate::capture::resample_linear;
use crate::error::{LiveError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Sample rate of inbound model audio.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

const VOLUME_SMOOTHING: f32 = 0.2;

/// One buffer pinned to an absolute mono-sample position on the output
/// timeline.
struct ScheduledBuffer {
    start: u64,
    samples: Vec<i16>,
}

impl ScheduledBuffer {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Pure scheduling arithmetic, independent of any device.
struct Schedule {
    cursor: u64,
    queue: VecDeque<ScheduledBuffer>,
}

impl Schedule {
    fn new() -> Self {
        Self { cursor: 0, queue: VecDeque::new() }
    }

    /// Place a buffer at `max(cursor, playhead)` and advance the cursor to
    /// its end. Returns the chosen start position.
    fn enqueue(&mut self, playhead: u64, samples: Vec<i16>) -> u64 {
        let start = self.cursor.max(playhead);
        self.cursor = start + samples.len() as u64;
        self.queue.push_back(ScheduledBuffer { start, samples });
        start
    }

    /// Fill `out` with the samples scheduled from `playhead` onward, writing
    /// silence where nothing is scheduled, and drop fully consumed buffers.
    fn fill(&mut self, playhead: u64, out: &mut [i16]) {
        out.fill(0);
        let window_end = playhead + out.len() as u64;
        while let Some(front) = self.queue.front() {
            if front.end() <= playhead {
                self.queue.pop_front();
                continue;
            }
            break;
        }
        for buffer in &self.queue {
            if buffer.start >= window_end {
                break;
            }
            let from = buffer.start.max(playhead);
            let to = buffer.end().min(window_end);
            for pos in from..to {
                out[(pos - playhead) as usize] = buffer.samples[(pos - buffer.start) as usize];
            }
        }
    }

    /// Discard buffers that have not started playing by `playhead` and pull
    /// the cursor back so the next enqueue starts fresh. Buffers already in
    /// flight keep playing to their end. Returns how many were discarded.
    fn clear_pending(&mut self, playhead: u64) -> usize {
        let before = self.queue.len();
        self.queue.retain(|buffer| buffer.start < playhead);
        self.cursor = self
            .queue
            .iter()
            .map(ScheduledBuffer::end)
            .max()
            .unwrap_or(playhead)
            .max(playhead);
        before - self.queue.len()
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

struct Shared {
    schedule: Mutex<Schedule>,
    playhead: AtomicU64,
    volume: AtomicU32,
}

struct Running {
    stop: Arc<AtomicBool>,
    device_rate: u32,
}

/// Playback device lifecycle and buffer scheduler.
pub struct AudioPlayback {
    shared: Arc<Shared>,
    state: Mutex<Option<Running>>,
    start_lock: tokio::sync::Mutex<()>,
}

impl AudioPlayback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                schedule: Mutex::new(Schedule::new()),
                playhead: AtomicU64::new(0),
                volume: AtomicU32::new(0),
            }),
            state: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Open the output device. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        if self.state.lock().is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let thread_stop = stop.clone();
        std::thread::spawn(move || playback_thread(shared, thread_stop, ready_tx));

        match ready_rx.await {
            Ok(Ok(device_rate)) => {
                *self.state.lock() = Some(Running { stop, device_rate });
                tracing::info!(device_rate, "playback stream live");
                Ok(())
            }
            Ok(Err(e)) => Err(LiveError::device(e)),
            Err(_) => Err(LiveError::device("playback thread exited")),
        }
    }

    /// Schedule one PCM16 buffer for gapless playback.
    ///
    /// Dropped with a log when the output device is not running; playback
    /// never raises after startup.
    pub fn play(&self, pcm: &[u8]) {
        let device_rate = {
            let state = self.state.lock();
            let Some(running) = &*state else {
                tracing::debug!("dropping audio buffer: playback not started");
                return;
            };
            running.device_rate
        };

        let samples: Vec<i16> =
            pcm.chunks_exact(2).map(|pair| i16::from_le_bytes([pair[0], pair[1]])).collect();
        if samples.is_empty() {
            return;
        }
        let samples = if device_rate == PLAYBACK_SAMPLE_RATE {
            samples
        } else {
            let floats: Vec<f32> = samples.iter().map(|&s| s as f32 / 32_768.0).collect();
            resample_linear(&floats, PLAYBACK_SAMPLE_RATE, device_rate)
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect()
        };

        let playhead = self.shared.playhead.load(Ordering::Acquire);
        self.shared.schedule.lock().enqueue(playhead, samples);
    }

    /// Discard everything that has not started playing yet. Audio already in
    /// flight finishes its buffer.
    pub fn stop(&self) {
        let playhead = self.shared.playhead.load(Ordering::Acquire);
        let dropped = self.shared.schedule.lock().clear_pending(playhead);
        if dropped > 0 {
            tracing::debug!(dropped, "cleared pending playback buffers");
        }
    }

    /// Release the output device.
    pub fn shutdown(&self) {
        if let Some(running) = self.state.lock().take() {
            running.stop.store(true, Ordering::SeqCst);
        }
        let playhead = self.shared.playhead.load(Ordering::Acquire);
        self.shared.schedule.lock().clear_pending(playhead);
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Latest smoothed output level in `0.0..=1.0`.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared.volume.load(Ordering::Relaxed))
    }
}

fn playback_thread(shared: Arc<Shared>, stop: Arc<AtomicBool>, ready: oneshot::Sender<std::result::Result<u32, String>>) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        let _ = ready.send(Err("no output device available".to_string()));
        return;
    };
    let config = match device.default_output_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = ready.send(Err(format!("output config unavailable: {e}")));
            return;
        }
    };
    let device_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();

    let cb_shared = shared.clone();
    let mut level = 0.0f32;
    let mut mono = Vec::new();
    let mut render = move |out_frames: usize| -> Vec<i16> {
        mono.resize(out_frames, 0);
        let playhead = cb_shared.playhead.load(Ordering::Acquire);
        cb_shared.schedule.lock().fill(playhead, &mut mono);
        cb_shared.playhead.store(playhead + out_frames as u64, Ordering::Release);

        let sum: f64 = mono.iter().map(|&s| (s as f64 / 32_768.0).powi(2)).sum();
        let rms = (sum / out_frames.max(1) as f64).sqrt() as f32;
        level += VOLUME_SMOOTHING * (rms - level);
        cb_shared.volume.store(level.to_bits(), Ordering::Relaxed);
        mono.clone()
    };

    let err_fn = |e| tracing::warn!("playback stream error: {e}");
    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _| {
                let mono = render(data.len() / channels);
                for (frame, &sample) in data.chunks_mut(channels).zip(&mono) {
                    frame.fill(sample as f32 / 32_768.0);
                }
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _| {
                let mono = render(data.len() / channels);
                for (frame, &sample) in data.chunks_mut(channels).zip(&mono) {
                    frame.fill(sample);
                }
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
            let _ = ready.send(Err(format!("output stream failed: {e}")));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(format!("output stream would not play: {e}")));
        return;
    }
    let _ = ready.send(Ok(device_rate));

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}
