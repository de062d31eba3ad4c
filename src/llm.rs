//! Completion client
//!
//! The language model is an opaque text-completion service behind
//! [`CompletionProvider`]. [`CompletionClient`] adds the timeout and retry
//! policy on top of whichever provider it wraps.

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A rendered prompt: system instructions plus the user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    /// Rough size in words, used for budget trimming and logging.
    pub fn word_count(&self) -> usize {
        self.system.split_whitespace().count() + self.user.split_whitespace().count()
    }
}

/// Failure reported by a provider. Transient failures are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub transient: bool,
    pub message: String,
}

impl ProviderFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> std::result::Result<String, ProviderFailure>;
}

/// OpenAI-compatible chat completions endpoint.
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(AgentError::Config("OPENAI_API_KEY is not set".to_string()));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, prompt: &Prompt) -> std::result::Result<String, ProviderFailure> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user}
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let message = format!("LLM API call failed: {}", e);
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ProviderFailure::transient(message)
                } else {
                    ProviderFailure::terminal(message)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("LLM API returned {}: {}", status, text.chars().take(500).collect::<String>());
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                ProviderFailure::transient(message)
            } else {
                ProviderFailure::terminal(message)
            });
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderFailure::transient(format!("Failed to parse LLM response: {}", e)))?;

        let choice = &response_json["choices"][0];
        match choice["finish_reason"].as_str() {
            Some("content_filter") => {
                return Err(ProviderFailure::terminal("LLM response was blocked by the content filter"));
            }
            Some("length") => warn!("LLM response hit the token limit and may be truncated"),
            _ => {}
        }

        let content = choice["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderFailure::terminal("No content in LLM response"))?;

        Ok(content.to_string())
    }
}

/// Why one attempt failed.
enum AttemptError {
    TimedOut,
    Failed(ProviderFailure),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::TimedOut => f.write_str("timed out"),
            AttemptError::Failed(failure) => write!(f, "{}", failure),
        }
    }
}

#[derive(Clone)]
pub struct CompletionClient {
    provider: Arc<dyn CompletionProvider>,
    retry: RetryPolicy,
}

impl CompletionClient {
    pub fn new(provider: Arc<dyn CompletionProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Send `prompt` and return the raw completion text.
    ///
    /// Each attempt is bounded by `timeout`; an attempt that runs out of time
    /// fails with `AgentError::Timeout` without further retries. Transient
    /// provider failures are retried with exponential backoff, and
    /// `AgentError::Provider` is returned once the budget is spent.
    pub async fn complete(&self, prompt: &Prompt, timeout: Duration) -> Result<String> {
        debug!("Sending prompt ({} words)", prompt.word_count());
        let outcome = self
            .retry
            .run(
                |attempt| async move {
                    if attempt > 0 {
                        info!("Completion attempt {}", attempt + 1);
                    }
                    match tokio::time::timeout(timeout, self.provider.complete(prompt)).await {
                        Ok(Ok(text)) => Ok(text),
                        Ok(Err(failure)) => Err(AttemptError::Failed(failure)),
                        Err(_) => Err(AttemptError::TimedOut),
                    }
                },
                |err| matches!(err, AttemptError::Failed(failure) if failure.transient),
            )
            .await;

        match outcome {
            Ok(text) => Ok(text),
            Err((AttemptError::TimedOut, _)) => Err(AgentError::Timeout(timeout.as_secs_f64())),
            Err((AttemptError::Failed(failure), attempts)) => Err(AgentError::Provider(format!(
                "{} (after {} attempt{})",
                failure.message,
                attempts,
                if attempts == 1 { "" } else { "s" }
            ))),
        }
    }
}
