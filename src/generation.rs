use crate::history::{Role, Utterance};
use crate::prompts::SystemPrompts;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use strum::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContentGenerationError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Response parsing error: {0}")]
    ParseError(String),
    #[error("Generation timed out after {0}ms")]
    Timeout(u64),
    #[error("Generator returned an empty response")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConversationMode {
    #[default]
    Chat,
    Ideation,
}

/// What the content generator is told about the session besides the history.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub user_id: Option<String>,
    pub mode: ConversationMode,
    pub topic: Option<String>,
    pub persona: String,
    pub energy: String,
    pub speaking_rate: f32,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            mode: ConversationMode::Chat,
            topic: None,
            persona: SystemPrompts::voice_companion().to_string(),
            energy: "medium".to_string(),
            speaking_rate: 1.0,
        }
    }

    pub fn system_prompt(&self) -> String {
        let mut prompt = self.persona.clone();
        if self.mode == ConversationMode::Ideation {
            prompt.push_str("\n\n");
            prompt.push_str(&SystemPrompts::ideation(self.topic.as_deref()));
        }
        prompt.push_str("\n\n");
        prompt.push_str(&SystemPrompts::delivery(&self.energy, self.speaking_rate));
        prompt
    }
}

/// Produces what the assistant says next. Called once per user turn.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        user_text: &str,
        history: &[Utterance],
        context: &SessionContext,
    ) -> Result<String, ContentGenerationError>;
}

#[derive(Debug, Clone)]
pub struct LLMConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub top_p: f32,
    pub request_timeout: Duration,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            model: "llama-3.1-8b-instant".to_string(),
            temperature: 0.6,
            max_tokens: Some(256),
            top_p: 1.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Chat-completions backed generator (Groq, OpenAI-compatible API).
pub struct GroqGenerator {
    client: Client,
    api_key: String,
    base_url: String,
    config: LLMConfig,
}

impl GroqGenerator {
    pub fn new(api_key: String) -> Result<Self, ContentGenerationError> {
        Self::with_config(api_key, LLMConfig::default())
    }

    pub fn with_config(api_key: String, config: LLMConfig) -> Result<Self, ContentGenerationError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            api_key,
            base_url: "https://api.groq.com/openai/v1".to_string(),
            config,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// System prompt, then prior authoritative turns, then the new user text.
fn build_messages(user_text: &str, history: &[Utterance], context: &SessionContext) -> Vec<Value> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(json!({"role": "system", "content": context.system_prompt()}));

    for utterance in history.iter().filter(|u| !u.is_filler) {
        let role = match utterance.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        messages.push(json!({"role": role, "content": utterance.text}));
    }

    messages.push(json!({"role": "user", "content": user_text}));
    messages
}

fn extract_content(body: &Value) -> Result<String, ContentGenerationError> {
    let content = body["choices"]
        .get(0)
        .and_then(|choice| choice["message"]["content"].as_str())
        .ok_or_else(|| ContentGenerationError::ParseError("Missing choices[0].message.content".into()))?;

    let content = content.trim();
    if content.is_empty() {
        return Err(ContentGenerationError::Empty);
    }
    Ok(content.to_string())
}

#[async_trait]
impl ContentGenerator for GroqGenerator {
    async fn generate(
        &self,
        user_text: &str,
        history: &[Utterance],
        context: &SessionContext,
    ) -> Result<String, ContentGenerationError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut payload = json!({
            "model": self.config.model,
            "messages": build_messages(user_text, history, context),
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "stream": false
        });
        if let Some(max_tokens) = self.config.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        log::debug!(
            "[{}] LLM: requesting completion ({} history turns)",
            context.session_id,
            history.len()
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ContentGenerationError::ApiError {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ContentGenerationError::ParseError(e.to_string()))?;
        extract_content(&body)
    }
}
