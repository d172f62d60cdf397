//! Reply generation for one character.
//!
//! Each call draws two independent decisions: answer from the scripted bank
//! (no model call), or else ask the model, optionally with a starter hint.
//! Provider failures become a fixed apology. History is only touched once the
//! reply is known, and always gains both sides of the exchange together.

use crate::character::CharacterProfile;
use crate::config::EngineConfig;
use crate::history::{ChatMessage, ConversationHistory};
use crate::llm::{LlmProvider, LlmRequest};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Spoken when the model call fails.
pub const APOLOGY: &str = "I apologize, but I encountered an error while processing your input.";

const TRANSCRIPTION_PREAMBLE: &str = "Below is a transcription of what the user said. Since this is from voice \
recognition, some words might be missing or the thought might seem incomplete. \
Please respond naturally as if we're having a conversation - feel free to ask \
clarifying questions if needed. Keep responses concise and conversational.";

/// Source of the random choices made per reply.
pub trait DecisionSource: Send {
    /// True with the given probability.
    fn chance(&mut self, probability: f64) -> bool;
    /// Uniform index in `0..len`. `len` is never zero.
    fn pick(&mut self, len: usize) -> usize;
}

/// Builds a fresh decision source per character selection.
pub type DecisionFactory = Arc<dyn Fn() -> Box<dyn DecisionSource> + Send + Sync>;

pub struct RandomDecisions {
    rng: StdRng,
}

impl RandomDecisions {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn factory() -> DecisionFactory {
        Arc::new(|| Box::new(RandomDecisions::new()) as Box<dyn DecisionSource>)
    }
}

impl Default for RandomDecisions {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionSource for RandomDecisions {
    fn chance(&mut self, probability: f64) -> bool {
        self.rng.gen_bool(probability.clamp(0.0, 1.0))
    }

    fn pick(&mut self, len: usize) -> usize {
        self.rng.gen_range(0..len.max(1))
    }
}

/// How a reply was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplySource {
    Scripted { category: String },
    Model { starter: Option<String> },
    /// The model call failed and the apology was used.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub source: ReplySource,
    /// Model id for log labels; `None` for scripted replies.
    pub model_tag: Option<String>,
}

/// Per-call probabilities and request shaping.
#[derive(Debug, Clone)]
pub struct ResponseSettings {
    pub scripted_probability: f64,
    pub starter_probability: f64,
    pub transcription_framing: bool,
}

impl Default for ResponseSettings {
    fn default() -> Self {
        Self {
            scripted_probability: 0.2,
            starter_probability: 0.4,
            transcription_framing: false,
        }
    }
}

impl From<&EngineConfig> for ResponseSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            scripted_probability: config.scripted_probability,
            starter_probability: config.starter_probability,
            transcription_framing: config.transcription_framing,
        }
    }
}

/// Produces replies for one selected character and owns its history.
pub struct ResponseGenerator {
    profile: Arc<CharacterProfile>,
    llm: Arc<dyn LlmProvider>,
    decisions: Box<dyn DecisionSource>,
    settings: ResponseSettings,
    history: ConversationHistory,
}

impl ResponseGenerator {
    pub fn new(
        profile: Arc<CharacterProfile>,
        llm: Arc<dyn LlmProvider>,
        decisions: Box<dyn DecisionSource>,
        settings: ResponseSettings,
    ) -> Self {
        Self {
            profile,
            llm,
            decisions,
            settings,
            history: ConversationHistory::new(),
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Produce the reply to `user_text` and record the exchange.
    pub async fn respond(&mut self, user_text: &str) -> Reply {
        let reply = self.draft(user_text).await;
        self.commit(user_text, &reply);
        reply
    }

    /// Produce the reply to `user_text` without touching history.
    pub async fn draft(&mut self, user_text: &str) -> Reply {
        match self.scripted_reply() {
            Some(reply) => reply,
            None => self.model_reply(user_text).await,
        }
    }

    /// Record an exchange produced by `draft`.
    pub fn commit(&mut self, user_text: &str, reply: &Reply) {
        self.history.push_exchange(user_text, reply.text.clone());
    }

    fn scripted_reply(&mut self) -> Option<Reply> {
        if !self.decisions.chance(self.settings.scripted_probability) {
            return None;
        }
        let categories = self.profile.scripted_categories();
        if categories.is_empty() {
            debug!("Scripted draw hit but {} has no scripted responses", self.profile.name);
            return None;
        }
        let category = categories[self.decisions.pick(categories.len())].to_string();
        let responses = self.profile.scripted.get(&category)?;
        let text = responses[self.decisions.pick(responses.len())].clone();
        info!("📜 Scripted reply from '{}'", category);
        Some(Reply {
            text,
            source: ReplySource::Scripted { category },
            model_tag: None,
        })
    }

    fn draw_starter(&mut self) -> Option<String> {
        if !self.decisions.chance(self.settings.starter_probability) || self.profile.starters.is_empty() {
            return None;
        }
        let index = self.decisions.pick(self.profile.starters.len());
        self.profile.starters.get(index).cloned()
    }

    /// The exact message list sent to the model.
    pub fn build_messages(&self, user_text: &str, starter: Option<&str>) -> Vec<ChatMessage> {
        let window = self.history.window(self.llm.history_limit());
        let mut messages = Vec::with_capacity(window.len() + 3);
        messages.push(ChatMessage::system(self.profile.system_prompt.clone()));
        messages.extend_from_slice(window);

        let content = if self.settings.transcription_framing {
            format!("{}\n\nTRANSCRIPTION: {}", TRANSCRIPTION_PREAMBLE, user_text)
        } else {
            user_text.to_string()
        };
        messages.push(ChatMessage::user(content));

        if let Some(starter) = starter {
            messages.push(ChatMessage::system(format!(
                "Begin your response with: \"{}\"",
                starter
            )));
        }
        messages
    }

    async fn model_reply(&mut self, user_text: &str) -> Reply {
        let starter = self.draw_starter();
        let request = LlmRequest::new(
            self.profile.model.clone(),
            self.profile.temperature,
            self.build_messages(user_text, starter.as_deref()),
        );
        let model_tag = Some(self.profile.model.clone());
        let llm = Arc::clone(&self.llm);

        match llm.complete(&request).await {
            Ok(text) => Reply {
                text,
                source: ReplySource::Model { starter },
                model_tag,
            },
            Err(e) => {
                error!("Error generating response for {}: {}", self.profile.name, e);
                Reply {
                    text: APOLOGY.to_string(),
                    source: ReplySource::Fallback,
                    model_tag,
                }
            }
        }
    }
}
