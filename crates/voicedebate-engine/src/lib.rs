//! # VoiceDebate Engine - Turn-Taking Voice Conversations
//!
//! Spoken conversations with historical characters. The engine listens, decides
//! when the user has finished a turn, asks the character's model for a reply,
//! voices it, and starts listening again.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                   Conversation Orchestrator                      │
//! │  ┌──────────────┐  ┌───────────────┐  ┌──────────────────┐       │
//! │  │   Audio In   │→ │ Transcription │→ │  Turn Endpointer │       │
//! │  │    (cpal)    │  │ (VAD + STT)   │  │ (silence ≥ 2 s)  │       │
//! │  └──────────────┘  └───────────────┘  └──────────────────┘       │
//! │                                                ↓                 │
//! │  ┌──────────────┐  ┌───────────────┐  ┌──────────────────┐       │
//! │  │  Audio Out   │← │   Synthesis   │← │ Response (LLM /  │       │
//! │  │   (rodio)    │  │ (ElevenLabs)  │  │  scripted bank)  │       │
//! │  └──────────────┘  └───────────────┘  └──────────────────┘       │
//! │         └────── playback complete → restart after delay ──┘      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod character;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod llm;
pub mod local_transcription;
pub mod orchestrator;
pub mod response;
pub mod segment;
pub mod session_log;
pub mod stt;
pub mod transcription;
pub mod turn;
pub mod vad;
pub mod voice_output;

pub use audio::{AudioCaptureStream, AudioConfig, AudioInput, CaptureGuard, CpalInput, PcmFrame};
pub use character::{builtin_profiles, CharacterProfile, CharacterStore, InMemoryCharacterStore, VoiceParams};
pub use config::{EngineConfig, ProviderKeys};
pub use context::EngineContext;
pub use error::{VoiceError, VoiceResult};
pub use history::{ChatMessage, ChatRole, ConversationHistory};
pub use llm::{AnthropicChat, LlmProvider, LlmRegistry, LlmRequest, OpenAiChat};
pub use local_transcription::{LocalTranscriptionConfig, VadTranscriptionProvider};
pub use orchestrator::{ConversationOrchestrator, ConversationState, OrchestratorEvent, OrchestratorHandle};
pub use response::{DecisionFactory, DecisionSource, RandomDecisions, Reply, ReplySource, ResponseGenerator, ResponseSettings};
pub use segment::{SegmentEvent, SegmenterConfig, SpeechSegmenter};
pub use session_log::{ConversationRecord, ConversationTurn, MemorySessionLogger, SessionLogger, TracingSessionLogger};
pub use stt::{create_best_recognizer, PlaceholderRecognizer, SpeechRecognizer, WhisperApiRecognizer};
#[cfg(feature = "whisper")]
pub use stt::WhisperLocalRecognizer;
pub use transcription::{
    TranscriptBuffer, TranscriptEvent, TranscriptSnapshot, TranscriptionLink, TranscriptionMessage,
    TranscriptionOptions, TranscriptionProvider, TranscriptionSession,
};
pub use turn::TurnEndpointer;
pub use vad::{VadConfig, VadDetector};
pub use voice_output::{
    AudioPlayer, ElevenLabsTts, PlaceholderTts, PlaybackComplete, PlaybackOutcome, RodioPlayer, SynthesisPlayer,
    SynthesisProvider, SynthesisRequest,
};
