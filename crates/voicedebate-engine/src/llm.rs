//! Chat-completion providers for character replies.
//!
//! A profile's `provider` id (`claude` or `gpt`) is resolved through the
//! `LlmRegistry`. Providers receive the full role-tagged message list and
//! return the assistant text; failures come back as `VoiceError::Generation`.

use crate::config::ProviderKeys;
use crate::error::{VoiceError, VoiceResult};
use crate::history::{ChatMessage, ChatRole};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1000;
const DEFAULT_HISTORY_LIMIT: usize = 5;

/// One completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// System, history and user messages in order.
    pub messages: Vec<ChatMessage>,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, temperature: f32, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            temperature,
            max_tokens: DEFAULT_MAX_TOKENS,
            messages,
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> VoiceResult<String>;

    /// How many history messages this provider wants. `None` = all.
    fn history_limit(&self) -> Option<usize> {
        None
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

// OpenAI-compatible request/response
#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI chat completions (`gpt` profiles).
pub struct OpenAiChat {
    api_key: String,
    base_url: String,
    history_limit: Option<usize>,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            base_url: OPENAI_API_BASE.to_string(),
            history_limit: Some(DEFAULT_HISTORY_LIMIT),
            client: http_client(Duration::from_secs(60)),
        }
    }

    /// Point at another OpenAI-compatible host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_history_limit(mut self, limit: Option<usize>) -> Self {
        self.history_limit = limit;
        self
    }
}

#[async_trait]
impl LlmProvider for OpenAiChat {
    async fn complete(&self, request: &LlmRequest) -> VoiceResult<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OpenAiRequest {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        debug!("OpenAI request: model={} messages={}", request.model, request.messages.len());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Generation(format!("OpenAI request failed: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Generation(format!("OpenAI API error {}: {}", status, body)));
        }

        let parsed: OpenAiResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::Generation(format!("OpenAI response parse failed: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| VoiceError::Generation("OpenAI returned no choices".to_string()))
    }

    fn history_limit(&self) -> Option<usize> {
        self.history_limit
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

/// Anthropic messages API (`claude` profiles).
pub struct AnthropicChat {
    api_key: String,
    base_url: String,
    history_limit: Option<usize>,
    client: reqwest::Client,
}

impl AnthropicChat {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            base_url: ANTHROPIC_API_BASE.to_string(),
            history_limit: Some(DEFAULT_HISTORY_LIMIT),
            client: http_client(Duration::from_secs(60)),
        }
    }

    pub fn with_history_limit(mut self, limit: Option<usize>) -> Self {
        self.history_limit = limit;
        self
    }
}

/// Split a role-tagged list into the messages API shape: system text in its own
/// field, and a conversation that opens with a user message.
fn anthropic_body(request: &LlmRequest) -> AnthropicRequest<'_> {
    let system = request
        .messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let messages = request
        .messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .skip_while(|m| m.role != ChatRole::User)
        .map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        })
        .collect();

    AnthropicRequest {
        model: &request.model,
        system,
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    }
}

#[async_trait]
impl LlmProvider for AnthropicChat {
    async fn complete(&self, request: &LlmRequest) -> VoiceResult<String> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let body = anthropic_body(request);

        debug!("Anthropic request: model={} messages={}", request.model, body.messages.len());
        let res = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Generation(format!("Anthropic request failed: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Generation(format!(
                "Anthropic API error {}: {}",
                status, body
            )));
        }

        let parsed: AnthropicResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::Generation(format!("Anthropic response parse failed: {}", e)))?;

        parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| VoiceError::Generation("Anthropic returned no text".to_string()))
    }

    fn history_limit(&self) -> Option<usize> {
        self.history_limit
    }
}

/// Provider id -> provider.
#[derive(Clone, Default)]
pub struct LlmRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl LlmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the providers whose API keys are present.
    pub fn from_keys(keys: &ProviderKeys) -> Self {
        let mut registry = Self::new();
        if let Some(ref key) = keys.anthropic {
            registry.register("claude", Arc::new(AnthropicChat::new(key.clone())));
        }
        if let Some(ref key) = keys.openai {
            registry.register("gpt", Arc::new(OpenAiChat::new(key.clone())));
        }
        info!("LLM providers available: {:?}", registry.ids());
        registry
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn resolve(&self, id: &str) -> VoiceResult<Arc<dyn LlmProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| VoiceError::Config(format!("no LLM provider registered for '{}'", id)))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_lifts_system_and_opens_with_user() {
        let request = LlmRequest::new(
            "claude-3-haiku-20240307",
            0.7,
            vec![
                ChatMessage::system("You are Socrates."),
                ChatMessage::assistant("stale reply"),
                ChatMessage::user("Hello"),
                ChatMessage::system("Begin with: I wonder"),
            ],
        );
        let body = anthropic_body(&request);
        assert_eq!(body.system, "You are Socrates.\n\nBegin with: I wonder");
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.messages[0].role, "user");
        assert_eq!(body.max_tokens, 1000);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["content"], "Hello");
    }

    #[test]
    fn registry_resolves_by_key_presence() {
        let keys = ProviderKeys {
            openai: Some("sk-test".to_string()),
            ..Default::default()
        };
        let registry = LlmRegistry::from_keys(&keys);
        assert!(registry.resolve("gpt").is_ok());
        assert!(matches!(registry.resolve("claude"), Err(VoiceError::Config(_))));
        assert_eq!(registry.resolve("gpt").unwrap().history_limit(), Some(5));
    }
}
