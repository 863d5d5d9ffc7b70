//! OpenAI-compatible chat completions client.

use super::{
    estimate_tokens, Choice, ChoiceMessage, CompletionClient, CompletionRequest,
    CompletionResponse, LlmError, Usage,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Deserialize)]
struct CompatibleResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<CompatibleChoice>,
    #[serde(default)]
    usage: Option<CompatibleUsage>,
}

#[derive(Debug, Deserialize)]
struct CompatibleChoice {
    message: CompatibleResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompatibleResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    function_call: Option<serde_json::Value>,
    #[serde(default)]
    tool_calls: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CompatibleUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

/// Client for any endpoint speaking `/v1/chat/completions`.
pub struct CompatibleClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl CompatibleClient {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .trim_end_matches("/v1")
                .to_string(),
            api_key: api_key.map(ToString::to_string),
            client: Self::http_client(Duration::from_secs(120)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = Self::http_client(timeout);
        self
    }

    fn http_client(timeout: Duration) -> Client {
        Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new())
    }
}

#[async_trait]
impl CompletionClient for CompatibleClient {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    async fn completion(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let start = Instant::now();
        let api_key = self.api_key.as_deref().ok_or(LlmError::MissingApiKey)?;

        let prompt_chars: String = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
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

        let result: CompatibleResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let choices: Vec<Choice> = result
            .choices
            .into_iter()
            .map(|c| Choice {
                message: ChoiceMessage {
                    content: c.message.content.unwrap_or_default(),
                    function_call: c.message.function_call,
                    tool_calls: c.message.tool_calls,
                },
                finish_reason: c.finish_reason,
            })
            .collect();

        let completion_text = choices.first().map(|c| c.message.content.as_str()).unwrap_or_default();
        let estimated_prompt = estimate_tokens(&prompt_chars) as u64;
        let estimated_completion = estimate_tokens(completion_text) as u64;

        let usage = match result.usage {
            Some(u) => {
                let prompt = u.prompt_tokens.unwrap_or(estimated_prompt);
                let completion = u.completion_tokens.unwrap_or(estimated_completion);
                Usage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: u.total_tokens.unwrap_or(prompt + completion),
                }
            }
            None => Usage {
                prompt_tokens: estimated_prompt,
                completion_tokens: estimated_completion,
                total_tokens: estimated_prompt + estimated_completion,
            },
        };

        tracing::debug!(
            model = %request.model,
            total_tokens = usage.total_tokens,
            latency_ms = start.elapsed().as_millis() as u64,
            "Completion finished"
        );

        Ok(CompletionResponse {
            model: result.model.unwrap_or(request.model),
            choices,
            usage,
        })
    }
}
