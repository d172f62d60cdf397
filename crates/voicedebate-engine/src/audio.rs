//! Audio capture using CPAL
//!
//! The device stream lives on its own thread and pushes fixed-size 16 kHz mono
//! 16-bit frames into a bounded channel. Nothing on the orchestrator side ever
//! touches the (non-`Send`) CPAL stream.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Samples per frame (default: 480 for 30ms at 16kHz)
    pub frame_samples: usize,

    /// Bounded queue depth between the device thread and the transcription sender
    pub queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_samples: 480,
            queue_capacity: 64,
        }
    }
}

/// One fixed-duration frame of mono 16-bit PCM
#[derive(Debug, Clone)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub captured_at: Instant,
}

impl PcmFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            captured_at: Instant::now(),
        }
    }

    /// A frame of digital silence.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0; len], sample_rate)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.samples.len() as u64 * 1_000_000_000 / self.sample_rate as u64)
    }

    /// Little-endian bytes, the layout streaming recognizers expect.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Releases a running input when dropped or when `release()` is called.
pub struct CaptureGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// A source of PCM frames. Implemented by the microphone and by test doubles.
pub trait AudioInput: Send + Sync {
    /// Begin pushing frames into `frames`. Frames stop when the guard is released.
    fn open(&self, config: &AudioConfig, frames: mpsc::Sender<PcmFrame>) -> VoiceResult<CaptureGuard>;
}

/// Default microphone input via CPAL
#[derive(Debug, Default, Clone)]
pub struct CpalInput;

impl CpalInput {
    pub fn new() -> Self {
        Self
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

impl AudioInput for CpalInput {
    fn open(&self, config: &AudioConfig, frames: mpsc::Sender<PcmFrame>) -> VoiceResult<CaptureGuard> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let config = config.clone();

        // The stream is !Send on some platforms, so it is built, kept and dropped on this thread.
        let handle = thread::Builder::new()
            .name("voicedebate-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(&config, frames) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns on explicit stop or when the guard's sender is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Capture thread released input stream");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(VoiceError::AudioDevice(
                    "capture thread exited before the stream started".to_string(),
                ));
            }
        }

        Ok(CaptureGuard::new(move || {
            let _ = stop_tx.send(());
            if handle.join().is_err() {
                warn!("Capture thread panicked during shutdown");
            }
        }))
    }
}

fn build_input_stream(config: &AudioConfig, frames: mpsc::Sender<PcmFrame>) -> VoiceResult<Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

    info!("🎤 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));
    debug!("Default input config: {:?}", device.default_input_config()?);

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let frame_samples = config.frame_samples.max(1);
    let sample_rate = config.sample_rate;
    let mut pending: Vec<i16> = Vec::with_capacity(frame_samples);
    let mut dropped: u64 = 0;

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                pending.push((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);

                if pending.len() >= frame_samples {
                    let frame = PcmFrame::new(std::mem::take(&mut pending), sample_rate);
                    pending.reserve(frame_samples);
                    match frames.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            dropped += 1;
                            if dropped == 1 || dropped % 50 == 0 {
                                warn!("Audio overrun: frame queue full, {} frames dropped", dropped);
                            }
                        }
                        // Receiver gone: the session is closing.
                        Err(TrySendError::Closed(_)) => {}
                    }
                }
            }
        },
        move |err| {
            warn!("Audio stream status: {}", err);
        },
        None,
    )?;

    stream.play()?;
    info!("✅ Audio capture started ({}Hz mono, {} samples/frame)", sample_rate, frame_samples);

    Ok(stream)
}

/// The single capture stream of a conversation.
///
/// `start()` hands back the receiving end of the frame queue; `stop()` halts
/// the device and is a no-op when nothing is running.
pub struct AudioCaptureStream {
    input: Arc<dyn AudioInput>,
    config: AudioConfig,
    guard: Option<CaptureGuard>,
}

impl AudioCaptureStream {
    pub fn new(input: Arc<dyn AudioInput>, config: AudioConfig) -> Self {
        Self {
            input,
            config,
            guard: None,
        }
    }

    /// Start producing frames. Any previous run is stopped first, so at most one input is ever open.
    pub fn start(&mut self) -> VoiceResult<mpsc::Receiver<PcmFrame>> {
        self.stop();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let guard = self.input.open(&self.config, tx)?;
        self.guard = Some(guard);
        Ok(rx)
    }

    /// Stop producing frames and release the device. Safe to call when not started.
    pub fn stop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.release();
            info!("⏹️ Audio capture stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.guard.is_some()
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }
}

impl Drop for AudioCaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}
