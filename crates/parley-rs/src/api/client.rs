//! HTTP client for the chat completions API with classified retries.
//!
//! [`ResilientClient::send`] is the single choke point for upstream traffic:
//! it injects the bearer credential on every attempt, classifies each
//! failure, and retries transient ones according to its [`RetryConfig`].
//! [`ChatBackend`] is the seam [`ChatSession`](crate::session::ChatSession)
//! and the summarizer talk through, so tests can script completions without
//! a network.

use crate::api::retry::{self, RetryConfig};
use crate::config::ClientConfig;
use crate::error::{Error, RequestError};
use crate::{CHAT_COMPLETIONS_ROUTE, ChatCompletion, ChatRequest, Message, UsageInfo};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Boxed future returned by [`ChatBackend::complete`].
pub type CompletionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ChatCompletion, RequestError>> + Send + 'a>>;

/// Anything that can turn a [`ChatRequest`] into a [`ChatCompletion`].
///
/// Implementations are expected to do their own retrying; errors returned
/// here are final.
pub trait ChatBackend: Send + Sync {
    fn complete<'a>(&'a self, request: &'a ChatRequest) -> CompletionFuture<'a>;
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    #[serde(default)]
    choices: Vec<RawChoice>,
    usage: Option<UsageInfo>,
    #[serde(default)]
    error: Option<ApiErrorResponse>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: Message,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client that retries transient failures.
pub struct ResilientClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl ResilientClient {
    /// Create a client against the default base URL with default retries.
    pub fn new(api_key: impl Into<String>) -> Result<Self, Error> {
        Self::from_config(ClientConfig::new(api_key))
    }

    pub fn from_config(config: ClientConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("parley-rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RequestError::permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: config.api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            retry: config.retry,
        })
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Send a request to `route` and decode the JSON body as `T`.
    ///
    /// Transient failures are retried; the error returned is the one from
    /// the final attempt, with its attempt count filled in.
    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        route: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<T, RequestError> {
        let url = format!("{}{route}", self.base_url);
        if let Some(body) = payload {
            trace!(
                "Request payload size: {} bytes",
                serde_json::to_string(body).map_or(0, |s| s.len())
            );
        }
        let url = url.as_str();
        let method = &method;
        retry::retry_classified(&self.retry, move |attempt| {
            self.attempt(method.clone(), url, payload, attempt)
        })
        .await
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        payload: Option<&serde_json::Value>,
        attempt: u32,
    ) -> Result<T, RequestError> {
        let start = Instant::now();
        let mut request = self
            .client
            .request(method.clone(), url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout);
        if let Some(body) = payload {
            request = request.json(body);
        }

        let resp = request.send().await.map_err(|e| {
            let kind = retry::classify_transport(&e);
            warn!("{method} {url} failed ({kind}): {e}");
            RequestError {
                kind,
                ..RequestError::transient(format!("request failed: {e}"))
            }
        })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            RequestError::transient(format!("failed to read response: {e}"))
                .with_status(status.as_u16())
        })?;

        debug!(
            "{method} {url} returned HTTP {} in {:.1}s ({} bytes, attempt {})",
            status,
            start.elapsed().as_secs_f64(),
            text.len(),
            attempt + 1,
        );

        if let Some(kind) = retry::classify_status(status) {
            warn!("{method} {url} returned HTTP {status}\n{text}");
            return Err(RequestError {
                kind,
                ..RequestError::permanent(format!("HTTP {status}"))
                    .with_status(status.as_u16())
                    .with_body(text)
            });
        }

        serde_json::from_str(&text).map_err(|e| {
            warn!("{method} {url} response could not be deserialized ({e}):\n{text}");
            RequestError::decode(format!("failed to parse response: {e}"), text)
                .with_status(status.as_u16())
        })
    }

    /// Send a chat completion request.
    pub async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, RequestError> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={:?}, temp={:?}",
            body.model,
            body.messages.len(),
            body.hyperparameters.max_tokens,
            body.hyperparameters.temperature,
        );
        let payload = serde_json::to_value(body)
            .map_err(|e| RequestError::permanent(format!("failed to encode request: {e}")))?;

        let body: serde_json::Value = self
            .send(Method::POST, CHAT_COMPLETIONS_ROUTE, Some(&payload))
            .await?;
        let raw = || body.to_string();
        let parsed: RawChatResponse = serde_json::from_value(body.clone()).map_err(|e| {
            warn!("Chat response has unexpected structure ({e}):\n{}", raw());
            RequestError::decode(format!("failed to parse chat response: {e}"), raw())
        })?;

        if let Some(err) = parsed.error {
            return Err(RequestError::permanent(format!("API error: {}", err.message)));
        }

        let Some(usage) = parsed.usage else {
            return Err(RequestError::decode("response has no usage block", raw()));
        };
        debug!(
            "Token usage: prompt={}, completion={}, total={}",
            usage.prompt_tokens,
            usage.completion_tokens,
            usage
                .total_tokens
                .unwrap_or(usage.prompt_tokens + usage.completion_tokens),
        );

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(RequestError::decode("response has no choices", raw()));
        };
        debug!("LLM output: {} chars", choice.message.content().len());

        Ok(ChatCompletion {
            message: choice.message,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            finish_reason: choice.finish_reason,
        })
    }
}

impl ChatBackend for ResilientClient {
    fn complete<'a>(&'a self, request: &'a ChatRequest) -> CompletionFuture<'a> {
        Box::pin(self.chat(request))
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
