//! Character profiles and the store they are looked up from.
//!
//! Profiles are parsed and validated once at load time; the engine only ever
//! reads them afterwards.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Provider ids a profile may name.
pub const KNOWN_PROVIDERS: &[&str] = &["claude", "gpt"];

/// Voice settings sent to the synthesis provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub voice_id: String,
    #[serde(default = "default_stability")]
    pub stability: f32,
    #[serde(default = "default_clarity")]
    pub clarity: f32,
    #[serde(default)]
    pub style: f32,
}

fn default_stability() -> f32 {
    0.5
}

fn default_clarity() -> f32 {
    0.75
}

impl VoiceParams {
    pub fn new(voice_id: impl Into<String>, stability: f32, clarity: f32) -> Self {
        Self {
            voice_id: voice_id.into(),
            stability,
            clarity,
            style: 0.0,
        }
    }
}

/// An AI debater: persona, model binding and voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
    /// `claude` or `gpt`.
    pub provider: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub voice: VoiceParams,
    /// Canned replies keyed by category.
    #[serde(default)]
    pub scripted: BTreeMap<String, Vec<String>>,
    /// Short openers offered to the model as a hint.
    #[serde(default)]
    pub starters: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

impl CharacterProfile {
    pub fn validate(&self) -> VoiceResult<()> {
        let invalid = |msg: String| Err(VoiceError::InvalidProfile(format!("{}: {}", self.name, msg)));

        if self.name.trim().is_empty() {
            return Err(VoiceError::InvalidProfile("profile has an empty name".to_string()));
        }
        if self.system_prompt.trim().is_empty() {
            return invalid("empty system prompt".to_string());
        }
        if !KNOWN_PROVIDERS.contains(&self.provider.as_str()) {
            return invalid(format!("unknown provider '{}'", self.provider));
        }
        if self.model.trim().is_empty() {
            return invalid("empty model id".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return invalid(format!("temperature {} outside 0.0..=2.0", self.temperature));
        }
        if self.voice.voice_id.trim().is_empty() {
            return invalid("empty voice id".to_string());
        }
        for (label, value) in [
            ("stability", self.voice.stability),
            ("clarity", self.voice.clarity),
            ("style", self.voice.style),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("voice {} {} outside 0.0..=1.0", label, value));
            }
        }
        Ok(())
    }

    /// Categories that actually hold responses.
    pub fn scripted_categories(&self) -> Vec<&str> {
        self.scripted
            .iter()
            .filter(|(_, responses)| !responses.is_empty())
            .map(|(category, _)| category.as_str())
            .collect()
    }

    /// Label used in conversation logs.
    pub fn speaker_label(&self) -> String {
        format!("{} ({})", self.name, self.model)
    }
}

/// Lookup of profiles by name.
pub trait CharacterStore: Send + Sync {
    fn lookup(&self, name: &str) -> VoiceResult<Arc<CharacterProfile>>;
    fn names(&self) -> Vec<String>;
}

/// Profiles held in memory, validated on insert.
#[derive(Debug, Default)]
pub struct InMemoryCharacterStore {
    profiles: HashMap<String, Arc<CharacterProfile>>,
}

impl InMemoryCharacterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The two built-in debaters.
    pub fn with_builtins() -> Self {
        let mut store = Self::new();
        for profile in builtin_profiles() {
            if let Err(e) = store.insert(profile) {
                warn!("Built-in profile rejected: {}", e);
            }
        }
        store
    }

    pub fn insert(&mut self, profile: CharacterProfile) -> VoiceResult<()> {
        profile.validate()?;
        info!("Loaded character profile: {}", profile.name);
        self.profiles.insert(profile.name.clone(), Arc::new(profile));
        Ok(())
    }

    /// Load every `*.json` character record in `dir`. Bad files are logged and skipped.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> VoiceResult<usize> {
        let mut loaded = 0;
        let mut paths: Vec<_> = std::fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            let result = std::fs::read_to_string(&path)
                .map_err(VoiceError::from)
                .and_then(|raw| parse_character_record(&raw))
                .and_then(|profile| self.insert(profile));
            match result {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Skipping character file {}: {}", path.display(), e),
            }
        }
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl CharacterStore for InMemoryCharacterStore {
    fn lookup(&self, name: &str) -> VoiceResult<Arc<CharacterProfile>> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| VoiceError::CharacterNotFound(name.to_string()))
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Deserialize)]
struct CharacterRecord {
    name: String,
    description: String,
    model_config: ModelConfigRecord,
    voice: VoiceRecord,
    character_definition: DefinitionRecord,
    interaction_guidelines: GuidelinesRecord,
    #[serde(default)]
    scripted_responses: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    response_starters: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ModelConfigRecord {
    provider: String,
    model: String,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct VoiceRecord {
    id: String,
    stability: f32,
    clarity: f32,
    #[serde(default)]
    style: f32,
}

#[derive(Debug, Deserialize)]
struct DefinitionRecord {
    background: String,
    core_traits: Vec<String>,
    speech_style: SpeechStyleRecord,
}

#[derive(Debug, Deserialize)]
struct SpeechStyleRecord {
    vocabulary_level: String,
    tone: String,
    patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GuidelinesRecord {
    primary_goal: String,
    conversation_strategy: String,
    must_rules: Vec<String>,
    must_not_rules: Vec<String>,
}

/// Parse one JSON character record into a validated profile.
pub fn parse_character_record(raw: &str) -> VoiceResult<CharacterProfile> {
    let record: CharacterRecord = serde_json::from_str(raw)?;
    let profile = CharacterProfile {
        system_prompt: compose_system_prompt(&record),
        name: record.name,
        description: record.description,
        provider: record.model_config.provider,
        model: record.model_config.model,
        temperature: record.model_config.temperature,
        voice: VoiceParams {
            voice_id: record.voice.id,
            stability: record.voice.stability,
            clarity: record.voice.clarity,
            style: record.voice.style,
        },
        scripted: record.scripted_responses,
        starters: record.response_starters,
    };
    profile.validate()?;
    Ok(profile)
}

fn bullets(items: &[String], indent: &str) -> String {
    items
        .iter()
        .map(|item| format!("{}- {}", indent, item))
        .collect::<Vec<_>>()
        .join("\n")
}

fn compose_system_prompt(record: &CharacterRecord) -> String {
    let def = &record.character_definition;
    let guide = &record.interaction_guidelines;
    [
        "CORE RESPONSE RULES:".to_string(),
        "- You MUST respond with EXACTLY ONE sentence or question.".to_string(),
        "- Your response MUST NOT be longer than 30 words.".to_string(),
        "- Your response MUST use basic punctuation (period or question mark).".to_string(),
        "- Your response MUST NOT contain multiple sentences or compound sentences.".to_string(),
        "- Your response MUST NOT use semicolons or conjunctions to combine thoughts.".to_string(),
        "\nCHARACTER DEFINITION:".to_string(),
        format!("You are {}, {}.", record.name, record.description),
        def.background.clone(),
        "\nCore Traits:".to_string(),
        bullets(&def.core_traits, ""),
        "\nSpeech Style:".to_string(),
        format!("- Vocabulary: {}", def.speech_style.vocabulary_level),
        format!("- Tone: {}", def.speech_style.tone),
        format!("- Patterns:\n{}", bullets(&def.speech_style.patterns, "  ")),
        "\nInteraction Guidelines:".to_string(),
        format!("Primary Goal: {}", guide.primary_goal),
        format!("Strategy: {}", guide.conversation_strategy),
        "\nMust Rules:".to_string(),
        bullets(&guide.must_rules, ""),
        "\nMust Not Rules:".to_string(),
        bullets(&guide.must_not_rules, ""),
        "\nFINAL REMINDER: Respond with exactly one sentence or question, no more than 30 words."
            .to_string(),
    ]
    .join("\n")
}

/// Default debaters available without any character files.
pub fn builtin_profiles() -> Vec<CharacterProfile> {
    vec![
        CharacterProfile {
            name: "Socrates".to_string(),
            description: "A philosophical debater who uses the Socratic method".to_string(),
            system_prompt: "You are Socrates, the ancient Greek philosopher known for your method of \
                asking probing questions to stimulate critical thinking. Engage in debate \
                by questioning assumptions and helping others examine their beliefs."
                .to_string(),
            provider: "claude".to_string(),
            model: "claude-3-haiku-20240307".to_string(),
            temperature: 0.7,
            voice: VoiceParams::new("ErXwobaYiN019PkySvjV", 0.5, 0.75),
            scripted: BTreeMap::from([
                (
                    "clarify".to_string(),
                    vec![
                        "What exactly do you mean by that?".to_string(),
                        "Can you give me an example of what you mean?".to_string(),
                    ],
                ),
                (
                    "challenge".to_string(),
                    vec![
                        "How do you know that to be true?".to_string(),
                        "Is it possible that the opposite is also true?".to_string(),
                    ],
                ),
            ]),
            starters: vec![
                "Let us examine".to_string(),
                "But tell me".to_string(),
                "I wonder".to_string(),
            ],
        },
        CharacterProfile {
            name: "Aristotle".to_string(),
            description: "A logical and analytical debater".to_string(),
            system_prompt: "You are Aristotle, the ancient Greek philosopher known for systematic \
                logic and empirical observation. Engage in debate by analyzing arguments \
                carefully and drawing on evidence and reason."
                .to_string(),
            provider: "gpt".to_string(),
            model: "gpt-4".to_string(),
            temperature: 0.6,
            voice: VoiceParams::new("VR6AewLTigWG4xSOukaG", 0.6, 0.8),
            scripted: BTreeMap::from([(
                "evidence".to_string(),
                vec![
                    "What evidence supports that claim?".to_string(),
                    "Which premise does your conclusion rest on?".to_string(),
                ],
            )]),
            starters: vec![
                "Consider first".to_string(),
                "Logically speaking".to_string(),
            ],
        },
    ]
}
