//! Opaque LLM client: the runtime behind `config.llm.endpoint` is treated
//! as an external, single-endpoint, OpenAI-chat-compatible text-completion
//! service. No provider branching, no streaming, no local inference —
//! grounded in the request/response shape of the reference HTTP client but
//! drastically narrowed, since everything else it did (provider selection,
//! local ONNX/llama.cpp execution) is out of scope here.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: &'a [ChatMessage],
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Thin client over a single OpenAI-chat-compatible HTTP endpoint.
pub struct LlmClient {
    client: reqwest::Client,
    endpoint: String,
    max_retry: u32,
    max_response_tokens: usize,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build LLM HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            max_retry: config.max_retry,
            max_response_tokens: config.max_response_tokens,
        })
    }

    /// Sends `messages` to the configured endpoint and returns the raw
    /// assistant text. Retries up to `max_retry` times on a transport error
    /// or non-success status; does not retry on a malformed-but-successful
    /// response body (that is the composer's problem, not a transport one).
    pub async fn complete(&self, messages: &[ChatMessage], temperature: f32) -> Result<String> {
        let request = ChatRequest { messages, max_tokens: self.max_response_tokens, temperature };

        let mut last_err = None;
        for attempt in 0..=self.max_retry {
            match self.send_once(&request).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "llm request failed");
                    last_err = Some(e);
                    if attempt < self.max_retry {
                        tokio::time::sleep(Duration::from_millis(300 * (attempt as u64 + 1))).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("llm request failed with no error recorded")))
    }

    async fn send_once(&self, request: &ChatRequest<'_>) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .context("llm endpoint unreachable")?;

        let status = response.status();
        let body = response.text().await.context("failed to read llm response body")?;

        if !status.is_success() {
            bail!("llm endpoint returned HTTP {status}: {}", truncate(&body, 300));
        }

        // A misconfigured endpoint (e.g. pointing at a plain web server)
        // tends to answer with HTML; fail fast with a clearer message than
        // the JSON parser's own error would give.
        let trimmed = body.trim_start();
        if trimmed.starts_with("<!DOCTYPE") || trimmed.starts_with("<html") {
            bail!("llm endpoint returned HTML instead of JSON; check config.llm.endpoint");
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .with_context(|| format!("failed to parse llm response: {}", truncate(&body, 300)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("llm response contained no choices"))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect::<String>() + "..."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors_set_role() {
        let sys = ChatMessage::system("be terse");
        let user = ChatMessage::user("hello");
        assert_eq!(sys.role, "system");
        assert_eq!(user.role, "user");
    }

    #[test]
    fn truncate_preserves_short_strings() {
        assert_eq!(truncate("short", 300), "short");
    }

    #[test]
    fn truncate_shortens_long_strings() {
        let long = "x".repeat(500);
        let truncated = truncate(&long, 10);
        assert!(truncated.ends_with("..."));
        assert!(truncated.chars().count() <= 13);
    }
}
