//! Conversation logging. Fire-and-forget: loggers never fail the caller.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{info, warn};

/// Label for the human side of the conversation.
pub const USER_SPEAKER: &str = "User";

/// One logged utterance. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub timestamp: DateTime<Local>,
    pub speaker: String,
    pub message: String,
}

impl ConversationTurn {
    /// `HH:MM:SS`, as shown in transcripts.
    pub fn clock(&self) -> String {
        self.timestamp.format("%H:%M:%S").to_string()
    }
}

/// Speaker label with the model tag, e.g. `Socrates (claude-3-haiku-20240307)`.
pub fn speaker_label(speaker: &str, model: Option<&str>) -> String {
    match model {
        Some(model) if speaker != USER_SPEAKER => format!("{} ({})", speaker, model),
        _ => speaker.to_string(),
    }
}

pub trait SessionLogger: Send + Sync {
    /// Begin a conversation with `character`, ending any open one.
    fn start_conversation(&self, character: &str);
    fn append(&self, speaker: &str, text: &str, model: Option<&str>);
    fn end_conversation(&self);
}

/// Writes turns to the tracing log only.
#[derive(Debug, Default)]
pub struct TracingSessionLogger;

impl SessionLogger for TracingSessionLogger {
    fn start_conversation(&self, character: &str) {
        info!("💬 Conversation started with {}", character);
    }

    fn append(&self, speaker: &str, text: &str, model: Option<&str>) {
        info!("💬 {}: {}", speaker_label(speaker, model), text);
    }

    fn end_conversation(&self) {
        info!("💬 Conversation ended");
    }
}

/// A finished or in-progress conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub character: String,
    pub turns: Vec<ConversationTurn>,
}

#[derive(Debug, Default)]
struct MemoryLog {
    current: Option<ConversationRecord>,
    finished: Vec<ConversationRecord>,
}

/// Keeps every conversation in memory.
#[derive(Debug, Default)]
pub struct MemorySessionLogger {
    inner: Mutex<MemoryLog>,
}

impl MemorySessionLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns of the open conversation.
    pub fn current_turns(&self) -> Vec<ConversationTurn> {
        self.inner
            .lock()
            .map(|log| log.current.as_ref().map(|c| c.turns.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn current_character(&self) -> Option<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|log| log.current.as_ref().map(|c| c.character.clone()))
    }

    pub fn finished(&self) -> Vec<ConversationRecord> {
        self.inner
            .lock()
            .map(|log| log.finished.clone())
            .unwrap_or_default()
    }
}

impl SessionLogger for MemorySessionLogger {
    fn start_conversation(&self, character: &str) {
        let Ok(mut log) = self.inner.lock() else {
            warn!("Session log lock poisoned, conversation not recorded");
            return;
        };
        if let Some(previous) = log.current.take() {
            log.finished.push(previous);
        }
        let id = format!(
            "{}_{}",
            character.to_lowercase(),
            Local::now().format("%Y%m%d_%H%M%S")
        );
        info!("Starting new conversation: {}", id);
        log.current = Some(ConversationRecord {
            id,
            character: character.to_string(),
            turns: Vec::new(),
        });
    }

    fn append(&self, speaker: &str, text: &str, model: Option<&str>) {
        let Ok(mut log) = self.inner.lock() else {
            warn!("Session log lock poisoned, turn dropped");
            return;
        };
        match log.current.as_mut() {
            Some(conversation) => conversation.turns.push(ConversationTurn {
                timestamp: Local::now(),
                speaker: speaker_label(speaker, model),
                message: text.to_string(),
            }),
            None => warn!("No active conversation to log turn"),
        }
    }

    fn end_conversation(&self) {
        if let Ok(mut log) = self.inner.lock() {
            if let Some(previous) = log.current.take() {
                info!("Ending conversation: {}", previous.id);
                log.finished.push(previous);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_turns_carry_model_label() {
        let logger = MemorySessionLogger::new();
        logger.append(USER_SPEAKER, "ignored", None);
        assert!(logger.current_turns().is_empty());

        logger.start_conversation("Socrates");
        logger.append(USER_SPEAKER, "Hello", Some("claude-3-haiku-20240307"));
        logger.append("Socrates", "What is virtue?", Some("claude-3-haiku-20240307"));
        logger.append("Socrates", "Indeed.", None);

        let turns = logger.current_turns();
        assert_eq!(turns[0].speaker, "User");
        assert_eq!(turns[1].speaker, "Socrates (claude-3-haiku-20240307)");
        assert_eq!(turns[2].speaker, "Socrates");
        assert_eq!(turns[1].clock().len(), 8);
    }

    #[test]
    fn starting_again_archives_previous() {
        let logger = MemorySessionLogger::new();
        logger.start_conversation("Socrates");
        logger.start_conversation("Aristotle");
        logger.end_conversation();
        logger.end_conversation();

        let finished = logger.finished();
        assert_eq!(finished.len(), 2);
        assert_eq!(finished[0].character, "Socrates");
        assert!(finished[1].id.starts_with("aristotle_"));
        assert!(logger.current_character().is_none());
    }
}
