//! Engine configuration loaded from the environment.
//!
//! Timing and probability knobs for the turn-taking loop. Binaries call
//! `dotenvy::dotenv()` first; the library only reads `std::env`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | VOICEDEBATE_SILENCE_THRESHOLD_SECS | 2.0 | Silence after which a spoken turn ends. |
/// | VOICEDEBATE_RESTART_DELAY_MS | 1000 | Pause between playback completion and re-listening. |
/// | VOICEDEBATE_AUTO_RESTART | true | Re-enter Listening after each reply. |
/// | VOICEDEBATE_SCRIPTED_PROBABILITY | 0.2 | Chance of answering from the scripted bank. |
/// | VOICEDEBATE_STARTER_PROBABILITY | 0.4 | Chance of attaching a response starter hint. |
/// | VOICEDEBATE_FRAME_MS | 30 | Capture frame duration (10, 20 or 30 for WebRTC VAD). |
/// | VOICEDEBATE_FRAME_QUEUE | 64 | Bounded frame queue between capture and transcription. |
/// | VOICEDEBATE_TRANSCRIPTION_FRAMING | false | Wrap user text with the voice-transcription preamble. |
/// | VOICEDEBATE_DATA_DIR | system temp | Directory for scoped playback files. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capture sample rate. Providers receive 16 kHz mono 16-bit PCM.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    #[serde(default = "default_frame_queue")]
    pub frame_queue: usize,
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold_secs: f32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_scripted_probability")]
    pub scripted_probability: f64,
    #[serde(default = "default_starter_probability")]
    pub starter_probability: f64,
    /// Wrap the text sent to the model with a note that it came from speech recognition.
    #[serde(default)]
    pub transcription_framing: bool,
    /// Where scoped playback files are created. `None` = system temp dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Language hint passed to transcription providers.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_true() -> bool {
    true
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_frame_ms() -> u32 {
    30
}

fn default_frame_queue() -> usize {
    64
}

fn default_silence_threshold() -> f32 {
    2.0
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_scripted_probability() -> f64 {
    0.2
}

fn default_starter_probability() -> f64 {
    0.4
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            frame_ms: default_frame_ms(),
            frame_queue: default_frame_queue(),
            silence_threshold_secs: default_silence_threshold(),
            restart_delay_ms: default_restart_delay_ms(),
            auto_restart: true,
            scripted_probability: default_scripted_probability(),
            starter_probability: default_starter_probability(),
            transcription_framing: false,
            data_dir: None,
            language: default_language(),
        }
    }
}

impl EngineConfig {
    /// Load from environment. Unset or invalid => defaults (see table above).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sample_rate: defaults.sample_rate,
            frame_ms: env_u64("VOICEDEBATE_FRAME_MS", defaults.frame_ms as u64) as u32,
            frame_queue: env_u64("VOICEDEBATE_FRAME_QUEUE", defaults.frame_queue as u64) as usize,
            silence_threshold_secs: env_f32(
                "VOICEDEBATE_SILENCE_THRESHOLD_SECS",
                defaults.silence_threshold_secs,
            ),
            restart_delay_ms: env_u64("VOICEDEBATE_RESTART_DELAY_MS", defaults.restart_delay_ms),
            auto_restart: env_bool("VOICEDEBATE_AUTO_RESTART", true),
            scripted_probability: env_probability(
                "VOICEDEBATE_SCRIPTED_PROBABILITY",
                defaults.scripted_probability,
            ),
            starter_probability: env_probability(
                "VOICEDEBATE_STARTER_PROBABILITY",
                defaults.starter_probability,
            ),
            transcription_framing: env_bool("VOICEDEBATE_TRANSCRIPTION_FRAMING", false),
            data_dir: env_opt_string("VOICEDEBATE_DATA_DIR").map(PathBuf::from),
            language: env_opt_string("VOICEDEBATE_LANGUAGE").unwrap_or(defaults.language),
        }
    }

    /// Samples per capture frame (480 for 30ms at 16 kHz).
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    pub fn silence_threshold(&self) -> Duration {
        Duration::from_secs_f32(self.silence_threshold_secs.max(0.0))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Directory for scoped playback files.
    pub fn audio_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// API keys for the provider clients. Missing keys => `None`; the caller decides the fallback.
#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    /// STT_API_KEY, falling back to OPENAI_API_KEY.
    pub stt: Option<String>,
}

impl ProviderKeys {
    pub fn from_env() -> Self {
        let openai = env_opt_string("OPENAI_API_KEY");
        Self {
            anthropic: env_opt_string("ANTHROPIC_API_KEY"),
            elevenlabs: env_opt_string("ELEVENLABS_API_KEY"),
            stt: env_opt_string("STT_API_KEY").or_else(|| openai.clone()),
            openai,
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim();
            if v.is_empty() {
                default
            } else {
                v.eq_ignore_ascii_case("true") || v == "1"
            }
        }
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f32(name: &str, default: f32) -> f32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f32>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

fn env_probability(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| (0.0..=1.0).contains(v))
        .unwrap_or(default)
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
