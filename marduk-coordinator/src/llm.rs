//! LLM client capability and the OpenAI chat-completion provider.
//!
//! The coordinator owns retries: up to three attempts with linear backoff
//! (`retry_delay * attempt`). Every failure surfaces as a typed API error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use marduk_core::config::OpenAiConfig;
use marduk_core::error::{Error, Result};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    /// Ranked context lines, highest relevance first.
    pub context: Vec<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

/// One completion response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// External collaborator producing completions.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

/// OpenAI chat-completion client.
pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAiConfig,
    max_retries: u32,
    retry_delay: Duration,
}

impl OpenAiClient {
    #[must_use]
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    async fn request_once(&self, request: &LlmRequest, context_block: &str) -> Result<LlmResponse> {
        let mut messages = Vec::new();
        if let Some(system_prompt) = &request.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system_prompt,
            });
        }
        if !context_block.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: context_block,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut http = self
            .client
            .post(OPENAI_CHAT_URL)
            .bearer_auth(&self.config.api_key)
            .json(&body);
        if let Some(organization) = &self.config.organization {
            http = http.header("OpenAI-Organization", organization);
        }

        let response = http
            .send()
            .await
            .map_err(|e| Error::Api(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("status {status}: {detail}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Api(format!("malformed completion response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Api("completion returned no choices".to_string()))?;
        let usage = parsed.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(LlmResponse {
            content,
            usage,
            model: parsed.model,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let context_block = if request.context.is_empty() {
            String::new()
        } else {
            format!("Relevant context:\n{}", request.context.join("\n"))
        };

        let mut last_error = Error::Api("no attempts made".to_string());
        for attempt in 1..=self.max_retries {
            match self.request_once(request, &context_block).await {
                Ok(response) => {
                    debug!(attempt, model = %response.model, "completion succeeded");
                    return Ok(response);
                }
                Err(err) => {
                    warn!(attempt, %err, "completion attempt failed");
                    last_error = err;
                    if attempt < self.max_retries {
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                }
            }
        }
        Err(last_error)
    }
}

/// Deterministic in-process client for tests and offline runs.
pub struct MockLlmClient {
    model: String,
    calls: AtomicUsize,
    fail: bool,
}

impl MockLlmClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    /// A client whose every completion fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    /// Number of completions attempted.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Api("mock outage".to_string()));
        }
        let prompt_tokens = (request.prompt.split_whitespace().count()
            + request
                .context
                .iter()
                .map(|c| c.split_whitespace().count())
                .sum::<usize>()) as u32;
        let content = format!("Answering '{}'", request.prompt);
        Ok(LlmResponse {
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens: content.split_whitespace().count() as u32,
                total_tokens: prompt_tokens + content.split_whitespace().count() as u32,
            },
            content,
            model: self.model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_counts_calls() {
        let client = MockLlmClient::new();
        let request = LlmRequest {
            prompt: "hello".to_string(),
            context: vec!["ctx".to_string()],
            temperature: 0.7,
            max_tokens: 64,
            system_prompt: None,
        };
        let response = client.complete(&request).await.unwrap();
        assert!(response.content.contains("hello"));
        assert!(response.usage.total_tokens > 0);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_failing_client_surfaces_api_error() {
        let client = MockLlmClient::failing();
        let request = LlmRequest {
            prompt: "hello".to_string(),
            context: vec![],
            temperature: 0.7,
            max_tokens: 64,
            system_prompt: None,
        };
        let err = client.complete(&request).await.unwrap_err();
        assert!(matches!(err, Error::Api(_)));
    }
}
