//! Adapter for single-message text generation APIs.
//!
//! The vendor accepts one prompt plus an optional context string and
//! returns `{"generated_text": ...}`. This adapter re-encodes chat
//! requests into that shape and fabricates an OpenAI-style response
//! with length-estimated token usage.

use super::{
    Choice, ChoiceMessage, CompletionClient, CompletionRequest, CompletionResponse, LlmError,
    Message, Usage,
};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Request body sent to the vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct TextGenPayload {
    pub message: String,
    pub code_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextGenResponse {
    #[serde(default)]
    generated_text: Option<String>,
}

/// Lazily connected text generation client.
pub struct TextGenerationClient {
    endpoint: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
    client: OnceCell<Client>,
}

impl TextGenerationClient {
    pub fn new(endpoint: Option<&str>) -> Self {
        Self {
            endpoint: endpoint.map(ToString::to_string),
            api_key: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            client: OnceCell::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_api_key(&mut self, api_key: &str) {
        self.api_key = Some(api_key.to_string());
    }

    /// Whether the HTTP client has been built yet.
    pub fn is_connected(&self) -> bool {
        self.client.get().is_some()
    }

    fn client(&self) -> Result<&Client, LlmError> {
        self.client.get_or_try_init(|| {
            tracing::debug!(timeout_secs = self.timeout.as_secs(), "Building text generation HTTP client");
            Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(LlmError::from)
        })
    }

    /// Last user message becomes the prompt; earlier non-empty user and
    /// assistant messages become the context string.
    pub(crate) fn format_messages(messages: &[Message]) -> Result<TextGenPayload, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .ok_or(LlmError::NoUserMessage)?;

        let earlier = match messages.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        };
        let context: Vec<&str> = earlier
            .iter()
            .filter(|m| m.role == "user" || m.role == "assistant")
            .map(|m| m.content.as_str())
            .filter(|c| !c.is_empty())
            .collect();

        Ok(TextGenPayload {
            message: last_user.content.clone(),
            code_ref: if context.is_empty() {
                None
            } else {
                Some(context.join("\n"))
            },
        })
    }
}

#[async_trait]
impl CompletionClient for TextGenerationClient {
    fn name(&self) -> &str {
        "text_generation"
    }

    async fn completion(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::MissingApiKey)?;
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or(LlmError::MissingEndpoint("text_generation"))?;

        let payload = Self::format_messages(&request.messages)?;
        let payload_text =
            serde_json::to_string(&payload).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        tracing::debug!(model = %request.model, context = payload.code_ref.is_some(), "Sending text generation request");

        let response = self
            .client()?
            .post(endpoint)
            .bearer_auth(api_key)
            .header("Content-Type", "application/json")
            .body(payload_text.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: TextGenResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let text = body.generated_text.unwrap_or_default();

        let payload_len = payload_text.chars().count() as u64;
        let text_len = text.chars().count() as u64;

        Ok(CompletionResponse {
            model: request.model,
            choices: vec![Choice {
                message: ChoiceMessage::text(text),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage {
                prompt_tokens: payload_len / 4,
                completion_tokens: text_len / 4,
                total_tokens: (payload_len + text_len) / 4,
            },
        })
    }
}
