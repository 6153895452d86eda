/// Audio input module
///
/// Thin boundary over the capture device: anything that can hand the engine a
/// continuous sequence of mono 16-bit PCM frames at the configured rate.

use crate::config::AudioConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

#[derive(Error, Debug)]
pub enum AudioSourceError {
    #[error("Failed to open audio input: {0}")]
    Open(String),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Unsupported audio format: {0}")]
    Format(String),

    #[error("Audio input unavailable after {attempts} re-open attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("Shutdown requested while re-opening audio input")]
    Cancelled,
}

/// Fixed-size chunk of mono samples, numbered in arrival order
#[derive(Debug, Clone, PartialEq)]
pub struct SampleFrame {
    pub samples: Vec<AudioSample>,
    pub sequence: u64,
}

/// Source of PCM frames
pub trait AudioSource: Send {
    /// Open (or re-open) the underlying input
    fn open(&mut self) -> Result<(), AudioSourceError>;

    /// Next frame; `Ok(None)` marks the end of a finite stream
    fn next_frame(&mut self) -> Result<Option<SampleFrame>, AudioSourceError>;
}

/// Average interleaved channels down to mono
pub fn downmix(interleaved: &[AudioSample], channels: u16) -> Vec<AudioSample> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks_exact(channels as usize)
        .map(|chunk| {
            let sum: i32 = chunk.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as AudioSample
        })
        .collect()
}

impl AudioSourceError {
    /// Whether re-opening the input could make this error go away
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Open(_) | Self::Device(_))
    }
}

/// Samples lost between a device callback and the reader
#[derive(Debug, Clone, Default)]
pub struct LossCounter(Arc<AtomicU64>);

impl LossCounter {
    pub fn record(&self, samples: usize) {
        self.0.fetch_add(samples as u64, Ordering::Relaxed);
    }

    /// Samples lost since the previous call
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// Re-open a source, retrying with a fixed backoff
///
/// Returns `Exhausted` once `attempts` consecutive opens failed; the caller
/// treats that as fatal. Errors that a retry cannot fix (a bad file format)
/// are returned at once.
pub fn reopen_with_backoff(
    source: &mut dyn AudioSource,
    attempts: u32,
    backoff: Duration,
    shutdown: &CancellationToken,
) -> Result<(), AudioSourceError> {
    let mut last = String::from("no attempt made");

    for attempt in 1..=attempts {
        if shutdown.is_cancelled() {
            return Err(AudioSourceError::Cancelled);
        }

        match source.open() {
            Ok(()) => {
                info!("Audio input opened (attempt {}/{})", attempt, attempts);
                return Ok(());
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                warn!("Audio input open failed (attempt {}/{}): {}", attempt, attempts, e);
                last = e.to_string();
            }
        }

        if attempt < attempts && !sleep_unless_cancelled(backoff, shutdown) {
            return Err(AudioSourceError::Cancelled);
        }
    }

    Err(AudioSourceError::Exhausted { attempts, last })
}

/// Blocking sleep that wakes early on shutdown; returns false if cancelled
fn sleep_unless_cancelled(duration: Duration, shutdown: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if shutdown.is_cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(remaining.min(Duration::from_millis(50)));
    }
    !shutdown.is_cancelled()
}

/// Replays a 16-bit PCM WAV file as a frame stream
pub struct WavSource {
    path: PathBuf,
    config: AudioConfig,
    reader: Option<hound::WavReader<std::io::BufReader<std::fs::File>>>,
    channels: u16,
    sequence: u64,
}

impl WavSource {
    pub fn new(path: impl AsRef<Path>, config: AudioConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config,
            reader: None,
            channels: 1,
            sequence: 0,
        }
    }
}

impl AudioSource for WavSource {
    fn open(&mut self) -> Result<(), AudioSourceError> {
        // Re-opening a file replay keeps the current position
        if self.reader.is_some() {
            return Ok(());
        }

        let reader = hound::WavReader::open(&self.path)
            .map_err(|e| AudioSourceError::Open(format!("{}: {}", self.path.display(), e)))?;
        let spec = reader.spec();

        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(AudioSourceError::Format(format!(
                "expected 16-bit integer PCM, got {} bits {:?}",
                spec.bits_per_sample, spec.sample_format
            )));
        }
        if spec.sample_rate != self.config.sample_rate {
            return Err(AudioSourceError::Format(format!(
                "file sample rate {} Hz differs from configured {} Hz",
                spec.sample_rate, self.config.sample_rate
            )));
        }
        if spec.channels != self.config.channels {
            return Err(AudioSourceError::Format(format!(
                "file has {} channel(s), configured for {}",
                spec.channels, self.config.channels
            )));
        }

        info!(
            "Replaying {} ({} Hz, {} channel(s), {} samples)",
            self.path.display(),
            spec.sample_rate,
            spec.channels,
            reader.len()
        );

        self.channels = spec.channels;
        self.reader = Some(reader);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<SampleFrame>, AudioSourceError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| AudioSourceError::Device("WAV source not opened".to_string()))?;

        let wanted = self.config.frame_size * self.channels as usize;
        let mut interleaved = Vec::with_capacity(wanted);

        for sample in reader.samples::<i16>().take(wanted) {
            let sample = sample.map_err(|e| AudioSourceError::Device(e.to_string()))?;
            interleaved.push(sample);
        }

        if interleaved.is_empty() {
            debug!("End of WAV stream after {} frames", self.sequence);
            return Ok(None);
        }

        let frame = SampleFrame {
            samples: downmix(&interleaved, self.channels),
            sequence: self.sequence,
        };
        self.sequence += 1;

        Ok(Some(frame))
    }
}

#[cfg(feature = "capture")]
pub use capture::CpalSource;

#[cfg(feature = "capture")]
mod capture {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use tracing::error;

    /// Callback buffers queued between the device thread and the reader
    const CALLBACK_QUEUE_DEPTH: usize = 64;

    /// Longest wait for device data before reporting a stalled input
    const READ_TIMEOUT: Duration = Duration::from_secs(2);

    type Chunk = Result<Vec<AudioSample>, String>;

    /// Live microphone input via cpal
    ///
    /// The cpal stream lives on its own thread (it is not `Send` on every
    /// platform); buffers cross over through a bounded channel.
    pub struct CpalSource {
        config: AudioConfig,
        rx: Option<Receiver<Chunk>>,
        stop: Arc<AtomicBool>,
        worker: Option<JoinHandle<()>>,
        pending: VecDeque<AudioSample>,
        sequence: u64,
        lost: LossCounter,
        samples_lost: u64,
    }

    impl CpalSource {
        pub fn new(config: AudioConfig) -> Self {
            Self {
                config,
                rx: None,
                stop: Arc::new(AtomicBool::new(false)),
                worker: None,
                pending: VecDeque::new(),
                sequence: 0,
                lost: LossCounter::default(),
                samples_lost: 0,
            }
        }

        /// Samples dropped because the reader fell behind the device
        pub fn samples_lost(&self) -> u64 {
            self.samples_lost
        }

        fn close(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
            self.rx = None;
            self.pending.clear();
        }

        fn select_device(config: &AudioConfig) -> Result<cpal::Device, String> {
            let host = cpal::default_host();
            match config.device_index {
                Some(index) => host
                    .input_devices()
                    .map_err(|e| e.to_string())?
                    .nth(index)
                    .ok_or_else(|| format!("no input device at index {}", index)),
                None => host
                    .default_input_device()
                    .ok_or_else(|| "no audio input device available".to_string()),
            }
        }

        fn run_stream(
            config: AudioConfig,
            tx: mpsc::SyncSender<Chunk>,
            ready: mpsc::Sender<Result<(), String>>,
            stop: Arc<AtomicBool>,
            lost: LossCounter,
        ) {
            let device = match Self::select_device(&config) {
                Ok(device) => device,
                Err(e) => {
                    let _ = ready.send(Err(e));
                    return;
                }
            };

            if let Ok(name) = device.name() {
                info!("Using audio input device: {}", name);
            }

            let stream_config = cpal::StreamConfig {
                channels: config.channels,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let data_tx = tx.clone();
            let stream = device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    // No blocking or logging in the callback; the reader reports losses.
                    if let Err(mpsc::TrySendError::Full(_)) = data_tx.try_send(Ok(data.to_vec())) {
                        lost.record(data.len());
                    }
                },
                move |err| {
                    error!(error = %err, "audio capture error");
                    let _ = tx.try_send(Err(err.to_string()));
                },
                None,
            );

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready.send(Err(format!("failed to build input stream: {}", e)));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready.send(Err(format!("failed to start input stream: {}", e)));
                return;
            }
            let _ = ready.send(Ok(()));

            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
            }
            debug!("Audio capture thread exiting");
        }
    }

    impl AudioSource for CpalSource {
        fn open(&mut self) -> Result<(), AudioSourceError> {
            self.close();
            self.stop = Arc::new(AtomicBool::new(false));

            let (tx, rx) = mpsc::sync_channel(CALLBACK_QUEUE_DEPTH);
            let (ready_tx, ready_rx) = mpsc::channel();
            let config = self.config.clone();
            let stop = self.stop.clone();
            let lost = self.lost.clone();

            let worker = std::thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || Self::run_stream(config, tx, ready_tx, stop, lost))
                .map_err(|e| AudioSourceError::Open(e.to_string()))?;

            match ready_rx.recv() {
                Ok(Ok(())) => {
                    self.rx = Some(rx);
                    self.worker = Some(worker);
                    Ok(())
                }
                Ok(Err(e)) => {
                    let _ = worker.join();
                    Err(AudioSourceError::Open(e))
                }
                Err(_) => {
                    let _ = worker.join();
                    Err(AudioSourceError::Open("capture thread exited".to_string()))
                }
            }
        }

        fn next_frame(&mut self) -> Result<Option<SampleFrame>, AudioSourceError> {
            let wanted = self.config.frame_size * self.config.channels as usize;
            let rx = self
                .rx
                .as_ref()
                .ok_or_else(|| AudioSourceError::Device("capture not opened".to_string()))?;

            while self.pending.len() < wanted {
                match rx.recv_timeout(READ_TIMEOUT) {
                    Ok(Ok(chunk)) => self.pending.extend(chunk),
                    Ok(Err(e)) => return Err(AudioSourceError::Device(e)),
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(AudioSourceError::Device("input stalled".to_string()))
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(AudioSourceError::Device("capture thread exited".to_string()))
                    }
                }
            }

            let lost = self.lost.take();
            if lost > 0 {
                self.samples_lost += lost;
                warn!(
                    "Capture queue full: {} samples lost ({} total)",
                    lost, self.samples_lost
                );
            }

            let interleaved: Vec<AudioSample> = self.pending.drain(..wanted).collect();
            let frame = SampleFrame {
                samples: downmix(&interleaved, self.config.channels),
                sequence: self.sequence,
            };
            self.sequence += 1;

            Ok(Some(frame))
        }
    }

    impl Drop for CpalSource {
        fn drop(&mut self) {
            self.close();
        }
    }
}
