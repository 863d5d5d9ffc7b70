//! Chat completion adapters.
//!
//! Engines talk to language models through [`CompletionClient`], which
//! takes and returns OpenAI-shaped requests and responses regardless of
//! the vendor API behind it.

mod compatible;
mod text_gen;

pub use compatible::CompatibleClient;
pub use text_gen::TextGenerationClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use zero_common::{LlmConfig, LlmProviderKind};

// ============================================================================
// Client Trait
// ============================================================================

/// A chat completion backend.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn completion(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Errors from completion backends.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API key must be set before making requests")]
    MissingApiKey,

    #[error("No user messages found")]
    NoUserMessage,

    #[error("No base URL configured for the {0} provider")]
    MissingEndpoint(&'static str),

    #[error("HTTP error during API call: {0}")]
    Http(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Http(err.to_string())
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl CompletionResponse {
    /// Content of the first choice, or "" when there is none.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceMessage {
    pub content: String,
    pub function_call: Option<serde_json::Value>,
    pub tool_calls: Option<serde_json::Value>,
}

impl ChoiceMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            function_call: None,
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Build the completion client selected by `llm.provider`.
pub fn build_client(config: &LlmConfig) -> Arc<dyn CompletionClient> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.provider {
        LlmProviderKind::OpenaiCompatible => Arc::new(
            CompatibleClient::new(config.base_url.as_deref(), config.api_key.as_deref())
                .with_timeout(timeout),
        ),
        LlmProviderKind::TextGeneration => {
            let mut client =
                TextGenerationClient::new(config.base_url.as_deref()).with_timeout(timeout);
            if let Some(key) = config.api_key.as_deref() {
                client.set_api_key(key);
            }
            Arc::new(client)
        }
    }
}
