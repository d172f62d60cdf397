//! Voice Activity Detection using WebRTC VAD
//!
//! Classifies 10/20/30ms frames of 16-bit PCM as speech or silence for the
//! local transcription provider.

use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// Detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,

    /// Frame duration in milliseconds (10, 20 or 30)
    pub frame_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 2,
            frame_ms: 30,
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> VoiceResult<()> {
        if !matches!(self.sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VoiceError::Config(format!(
                "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                self.sample_rate
            )));
        }
        if self.mode > 3 {
            return Err(VoiceError::Config(format!("VAD mode must be 0-3, got {}", self.mode)));
        }
        if !matches!(self.frame_ms, 10 | 20 | 30) {
            return Err(VoiceError::Config(format!(
                "VAD frames must be 10, 20 or 30ms, got {}ms",
                self.frame_ms
            )));
        }
        Ok(())
    }

    /// Samples per VAD frame (480 for 30ms at 16kHz)
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

/// Voice Activity Detector using WebRTC VAD.
///
/// Not `Send`: create it on the thread that uses it.
pub struct VadDetector {
    vad: Vad,
    frame_samples: usize,
}

impl VadDetector {
    /// Create a new VAD detector with the given configuration
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        config
            .validate()
            .map_err(|e| VoiceError::VadInit(e.to_string()))?;

        info!(
            "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, mode: {}, {}ms frames)",
            config.sample_rate, config.mode, config.frame_ms
        );

        let frame_samples = config.frame_samples();
        let vad = build_vad(&config);

        Ok(Self {
            vad,
            frame_samples,
        })
    }

    /// Classify one frame. The frame must be exactly `frame_samples()` long.
    pub fn is_speech(&mut self, frame: &[i16]) -> VoiceResult<bool> {
        if frame.len() != self.frame_samples {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.frame_samples,
                frame.len()
            )));
        }

        let is_speech = self
            .vad
            .is_voice_segment(frame)
            .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {:?}", e)))?;

        debug!("VAD result: {}", if is_speech { "SPEECH" } else { "SILENCE" });

        Ok(is_speech)
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}

fn build_vad(config: &VadConfig) -> Vad {
    let vad_mode = match config.mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    };

    let sample_rate = match config.sample_rate {
        8000 => SampleRate::Rate8kHz,
        32000 => SampleRate::Rate32kHz,
        48000 => SampleRate::Rate48kHz,
        _ => SampleRate::Rate16kHz,
    };

    let mut vad = Vad::new();
    vad.set_mode(vad_mode);
    vad.set_sample_rate(sample_rate);
    vad
}
