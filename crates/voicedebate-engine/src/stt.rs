//! **Speech-to-Text** for committed speech segments.
//!
//! The local transcription provider hands each segment to a `SpeechRecognizer`.
//! Implementations: remote OpenAI-compatible transcription API, local Whisper
//! (feature `whisper`), and a placeholder for exercising the loop without either.

use crate::config::ProviderKeys;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info};

/// Converts one utterance of 16-bit mono PCM into text.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Return an empty string when nothing intelligible was said.
    async fn recognize(&self, samples: &[i16], sample_rate: u32) -> VoiceResult<String>;
}

/// Encode 16-bit mono PCM as WAV bytes for API upload.
pub fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Placeholder recognizer: returns a fixed string. Use for testing the voice loop without Whisper/API.
#[derive(Debug, Default)]
pub struct PlaceholderRecognizer {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for PlaceholderRecognizer {
    async fn recognize(&self, samples: &[i16], sample_rate: u32) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        let secs = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f32 / sample_rate as f32
        };
        Ok(format!(
            "[STT placeholder: {} samples, {:.1}s]",
            samples.len(),
            secs
        ))
    }
}

/// OpenAI-compatible transcription API (OpenAI Whisper and compatible hosts).
/// Uses `STT_API_URL` (default https://api.openai.com/v1), `STT_API_KEY` or `OPENAI_API_KEY`, and `STT_MODEL` (default whisper-1).
#[derive(Debug, Clone)]
pub struct WhisperApiRecognizer {
    /// Base URL without trailing slash.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub language: Option<String>,
    client: reqwest::Client,
}

impl WhisperApiRecognizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            language: None,
            client,
        })
    }

    pub fn from_env(keys: &ProviderKeys) -> VoiceResult<Self> {
        let api_key = keys.stt.clone().ok_or_else(|| {
            VoiceError::Config("STT requires STT_API_KEY or OPENAI_API_KEY".to_string())
        })?;
        let base_url = std::env::var("STT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperApiRecognizer {
    async fn recognize(&self, samples: &[i16], sample_rate: u32) -> VoiceResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_to_wav(samples, sample_rate)?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(ref language) = self.language {
            form = form.text("language", language.clone());
        }

        debug!("STT request: {} samples to {}", samples.len(), url);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Transcription(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

// Local Whisper (optional feature). Requires whisper.cpp/ggml at build time.
#[cfg(feature = "whisper")]
mod whisper_local {
    use super::*;
    use std::sync::{Arc, Mutex};
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// On-device Whisper over a ggml model (e.g. ggml-base.en.bin). 16 kHz input only.
    pub struct WhisperLocalRecognizer {
        _context: Arc<WhisperContext>,
        state: Arc<Mutex<whisper_rs::WhisperState>>,
        language: String,
    }

    impl WhisperLocalRecognizer {
        pub fn new(model_path: &str, language: impl Into<String>) -> VoiceResult<Self> {
            let context =
                WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
                    .map_err(|e| VoiceError::Transcription(format!("Whisper load failed: {}", e)))?;
            let state = context.create_state().map_err(|e| {
                VoiceError::Transcription(format!("Whisper state init failed: {}", e))
            })?;
            Ok(Self {
                _context: Arc::new(context),
                state: Arc::new(Mutex::new(state)),
                language: language.into(),
            })
        }

        /// `WHISPER_MODEL_PATH` must point to a .bin model file.
        pub fn from_env(language: impl Into<String>) -> VoiceResult<Self> {
            let path = std::env::var("WHISPER_MODEL_PATH")
                .map_err(|_| VoiceError::Config("WHISPER_MODEL_PATH not set".to_string()))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(VoiceError::Config("WHISPER_MODEL_PATH is empty".to_string()));
            }
            Self::new(path, language)
        }
    }

    #[async_trait]
    impl SpeechRecognizer for WhisperLocalRecognizer {
        async fn recognize(&self, samples: &[i16], sample_rate: u32) -> VoiceResult<String> {
            if samples.is_empty() {
                return Ok(String::new());
            }
            if sample_rate != 16000 {
                return Err(VoiceError::Transcription(format!(
                    "Whisper expects 16 kHz; got {} Hz",
                    sample_rate
                )));
            }
            let audio: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
            let state = Arc::clone(&self.state);
            let language = self.language.clone();

            tokio::task::spawn_blocking(move || {
                let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
                params.set_print_progress(false);
                params.set_print_realtime(false);
                params.set_no_timestamps(true);
                params.set_language(Some(&language));

                let mut state = state.lock().map_err(|e| {
                    VoiceError::Transcription(format!("Whisper lock poisoned: {}", e))
                })?;
                state.full(params, &audio).map_err(|e| {
                    VoiceError::Transcription(format!("Whisper inference failed: {}", e))
                })?;
                Ok(state
                    .as_iter()
                    .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                    .collect::<Vec<_>>()
                    .join(" ")
                    .trim()
                    .to_string())
            })
            .await
            .map_err(|e| VoiceError::Transcription(format!("Whisper task failed: {}", e)))?
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_local::WhisperLocalRecognizer;

/// Pick the best available recognizer.
/// Priority: local Whisper if `WHISPER_MODEL_PATH` loads (feature `whisper`), then the
/// transcription API if a key is configured, then the placeholder.
pub fn create_best_recognizer(keys: &ProviderKeys, language: &str) -> Box<dyn SpeechRecognizer> {
    #[cfg(feature = "whisper")]
    {
        if let Ok(w) = whisper_local::WhisperLocalRecognizer::from_env(language) {
            info!("🗣️ Using local Whisper recognizer");
            return Box::new(w);
        }
    }
    if let Ok(api) = WhisperApiRecognizer::from_env(keys) {
        info!("🗣️ Using transcription API recognizer ({})", api.model);
        return Box::new(api.with_language(language));
    }
    info!("🗣️ No recognizer configured, using placeholder");
    Box::new(PlaceholderRecognizer::new())
}
