//! Collaborators for one conversation engine, built once and handed to the orchestrator.

use crate::audio::{AudioConfig, AudioInput, CpalInput};
use crate::character::{CharacterStore, InMemoryCharacterStore};
use crate::config::{EngineConfig, ProviderKeys};
use crate::llm::LlmRegistry;
use crate::local_transcription::{LocalTranscriptionConfig, VadTranscriptionProvider};
use crate::response::{DecisionFactory, RandomDecisions};
use crate::session_log::{SessionLogger, TracingSessionLogger};
use crate::stt::{create_best_recognizer, SpeechRecognizer};
use crate::transcription::{TranscriptionOptions, TranscriptionProvider};
use crate::voice_output::{AudioPlayer, ElevenLabsTts, PlaceholderTts, RodioPlayer, SynthesisProvider};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything the orchestrator talks to. Swap any field for a test double.
#[derive(Clone)]
pub struct EngineContext {
    pub characters: Arc<dyn CharacterStore>,
    pub llms: LlmRegistry,
    pub transcription: Arc<dyn TranscriptionProvider>,
    pub synthesis: Arc<dyn SynthesisProvider>,
    pub audio_input: Arc<dyn AudioInput>,
    pub player: Arc<dyn AudioPlayer>,
    pub logger: Arc<dyn SessionLogger>,
    pub decisions: DecisionFactory,
    pub config: EngineConfig,
}

impl EngineContext {
    /// A context with the tracing logger, random decisions and default config.
    pub fn new(
        characters: Arc<dyn CharacterStore>,
        llms: LlmRegistry,
        transcription: Arc<dyn TranscriptionProvider>,
        synthesis: Arc<dyn SynthesisProvider>,
        audio_input: Arc<dyn AudioInput>,
        player: Arc<dyn AudioPlayer>,
    ) -> Self {
        Self {
            characters,
            llms,
            transcription,
            synthesis,
            audio_input,
            player,
            logger: Arc::new(TracingSessionLogger),
            decisions: RandomDecisions::factory(),
            config: EngineConfig::default(),
        }
    }

    /// Real devices and whichever providers have keys configured.
    pub fn from_env(config: EngineConfig, keys: &ProviderKeys, characters: Arc<dyn CharacterStore>) -> Self {
        let recognizer: Arc<dyn SpeechRecognizer> = Arc::from(create_best_recognizer(keys, &config.language));
        let transcription = Arc::new(VadTranscriptionProvider::new(
            recognizer,
            LocalTranscriptionConfig::default(),
        ));

        let synthesis: Arc<dyn SynthesisProvider> = match keys.elevenlabs.as_deref().map(ElevenLabsTts::new) {
            Some(Ok(tts)) => {
                info!("🔊 Using ElevenLabs synthesis");
                Arc::new(tts)
            }
            Some(Err(e)) => {
                warn!("ElevenLabs client unavailable, replies will not be voiced: {}", e);
                Arc::new(PlaceholderTts)
            }
            None => {
                warn!("ELEVENLABS_API_KEY not set, replies will not be voiced");
                Arc::new(PlaceholderTts)
            }
        };

        Self {
            config,
            ..Self::new(
                characters,
                LlmRegistry::from_keys(keys),
                transcription,
                synthesis,
                Arc::new(CpalInput::new()),
                Arc::new(RodioPlayer::new()),
            )
        }
    }

    /// Built-in characters plus real providers.
    pub fn with_builtin_characters(config: EngineConfig, keys: &ProviderKeys) -> Self {
        Self::from_env(config, keys, Arc::new(InMemoryCharacterStore::with_builtins()))
    }

    pub fn with_logger(mut self, logger: Arc<dyn SessionLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_decisions(mut self, decisions: DecisionFactory) -> Self {
        self.decisions = decisions;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            sample_rate: self.config.sample_rate,
            frame_samples: self.config.frame_samples(),
            queue_capacity: self.config.frame_queue,
        }
    }

    pub fn transcription_options(&self) -> TranscriptionOptions {
        TranscriptionOptions {
            sample_rate: self.config.sample_rate,
            frame_ms: self.config.frame_ms,
            language: self.config.language.clone(),
            interim_results: true,
        }
    }
}
