use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LLMConfig;
use crate::core::turn::Turn;

/// Failure of a single completion attempt.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("rate limited by completion provider")]
    RateLimited,

    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("response decode error: {0}")]
    Decode(String),

    #[error("response contained no reply")]
    EmptyResponse,
}

impl CompletionError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, CompletionError::RateLimited)
    }
}

/// Sends an ordered list of turns to a model and returns its reply text.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, model: &str, messages: &[Turn]) -> Result<String, CompletionError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<Reasoning>,
}

#[derive(Debug, Serialize)]
struct Reasoning {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

/// OpenRouter reports some upstream failures inside a 200 body.
#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<Value>,
    #[serde(default)]
    message: String,
}

/// Chat-completions client for OpenRouter and other OpenAI-compatible endpoints.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    config: LLMConfig,
}

impl OpenRouterClient {
    pub fn new(api_key: String, config: LLMConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl CompletionClient for OpenRouterClient {
    async fn complete(&self, model: &str, messages: &[Turn]) -> Result<String, CompletionError> {
        let request = ChatRequest {
            model,
            messages,
            reasoning: self.config.reasoning.then_some(Reasoning { enabled: true }),
        };

        let mut builder = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");

        if let Some(url) = &self.config.app_url {
            builder = builder.header("HTTP-Referer", url);
        }
        if let Some(name) = &self.config.app_name {
            builder = builder.header("X-Title", name);
        }

        tracing::debug!(
            "[OpenRouterClient] Sending {} messages to model {}",
            messages.len(),
            model
        );

        let response = builder.json(&request).send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CompletionError::RateLimited);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let chat_response: ChatResponse =
            serde_json::from_str(&body).map_err(|e| CompletionError::Decode(e.to_string()))?;

        if let Some(error) = chat_response.error {
            if error.code.as_ref().and_then(Value::as_i64) == Some(429) {
                return Err(CompletionError::RateLimited);
            }
            return Err(CompletionError::Provider(error.message));
        }

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(CompletionError::EmptyResponse)
    }
}
