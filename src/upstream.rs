//! Upstream completion boundary: wire types, failure classification, and the
//! retrying call wrapper.
//!
//! [`CompletionApi`] is the seam between the pipeline and the network; the
//! HTTP client below targets OpenAI-compatible `/v1/chat/completions`, and
//! tests substitute scripted implementations. [`UpstreamCaller`] wraps any
//! implementation with the retry policy and performs no history or logging
//! side effects.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::{Turn, TurnRole};

/// Role of a wire-format chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in the upstream request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        let role = match turn.role {
            TurnRole::User => Role::User,
            TurnRole::Assistant => Role::Assistant,
        };
        Self {
            role,
            content: turn.content.clone(),
        }
    }
}

/// One completion request: model, ordered message list, sampling parameters.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Token accounting reported by the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// A successful completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// Classified upstream failures.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// HTTP 429. Retryable.
    #[error("upstream rate limited")]
    RateLimited,
    /// HTTP 5xx. Retryable.
    #[error("upstream server error: status {status}")]
    Server { status: u16 },
    /// Any other non-success status. Never retried.
    #[error("upstream client error: status {status}: {body}")]
    Client { status: u16, body: String },
    /// Connection or timeout failure before a status was received. Retryable.
    #[error("upstream transport error: {0}")]
    Transport(String),
    /// A success response that could not be interpreted. Never retried.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    /// The retry budget ran out on a retryable failure class.
    #[error("upstream retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<UpstreamError>,
    },
}

impl UpstreamError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Server { .. } | Self::Transport(_)
        )
    }

    /// Stable class label for event payloads and logs.
    #[must_use]
    pub fn class(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::Client { .. } => "client_error",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Exhausted { .. } => "retries_exhausted",
        }
    }
}

/// One-shot completion operation against the upstream boundary.
#[async_trait::async_trait]
pub trait CompletionApi: Send + Sync {
    /// Issue a single completion attempt.
    ///
    /// # Errors
    ///
    /// Returns a classified [`UpstreamError`]; implementations never retry
    /// internally.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, UpstreamError>;
}

/// Connection settings for the HTTP completion client.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Base URL for the completion API (e.g. `https://api.openai.com`).
    pub base_url: String,
    /// Optional bearer key.
    pub api_key: Option<String>,
}

/// OpenAI-compatible non-streaming Chat Completions client.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    settings: UpstreamSettings,
}

impl std::fmt::Debug for ChatCompletionsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsClient")
            .field("base_url", &self.settings.base_url)
            .finish()
    }
}

impl ChatCompletionsClient {
    #[must_use]
    pub fn new(settings: UpstreamSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait::async_trait]
impl CompletionApi for ChatCompletionsClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, UpstreamError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );

        let mut rb = self.http.post(&url).json(request);
        if let Some(key) = &self.settings.api_key {
            rb = rb.bearer_auth(key);
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(UpstreamError::RateLimited);
        }
        if status.is_server_error() {
            return Err(UpstreamError::Server {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Client {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                UpstreamError::Protocol("response contained no completion text".to_owned())
            })?;

        Ok(Completion {
            text,
            usage: parsed.usage,
        })
    }
}

/// Backoff schedule for retryable upstream failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub max_retries: u32,
    /// Delay before the first retry; doubles each retry.
    pub base_delay: Duration,
    /// Upper bound on the random jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(400),
            max_jitter: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based): exponential backoff
    /// plus bounded random jitter.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.min(16);
        let backoff = self.base_delay.saturating_mul(2u32.saturating_pow(exponent));
        backoff + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let bound = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::random::<u64>() % (bound + 1))
    }
}

/// Outcome of a mediated call, including how many attempts it took.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub completion: Completion,
    pub attempts: u32,
}

/// Retry-with-backoff wrapper around a [`CompletionApi`].
#[derive(Clone)]
pub struct UpstreamCaller {
    api: Arc<dyn CompletionApi>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for UpstreamCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCaller")
            .field("policy", &self.policy)
            .finish()
    }
}

impl UpstreamCaller {
    #[must_use]
    pub fn new(api: Arc<dyn CompletionApi>, policy: RetryPolicy) -> Self {
        Self { api, policy }
    }

    /// Invoke the completion operation, retrying rate-limit, server, and
    /// transport failures up to the policy's budget.
    ///
    /// # Errors
    ///
    /// Non-retryable failures propagate immediately. A retryable failure that
    /// outlives the budget surfaces as [`UpstreamError::Exhausted`] carrying
    /// the final attempt's error.
    pub async fn call(&self, request: &CompletionRequest) -> Result<CallOutcome, UpstreamError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.api.complete(request).await {
                Ok(completion) => {
                    return Ok(CallOutcome {
                        completion,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_retryable() && attempt <= self.policy.max_retries => {
                    let delay = self.policy.delay(attempt - 1);
                    tracing::warn!(
                        name: "upstream.retry",
                        attempt,
                        class = err.class(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Retrying upstream call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_retryable() => {
                    return Err(UpstreamError::Exhausted {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}
