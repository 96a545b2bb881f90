//! Model profiles and client configuration.
//!
//! A [`ModelProfile`] is the budget side of a model: its name, how many
//! tokens one request may occupy, and how many of those to keep free for the
//! reply. A [`ClientConfig`] is the transport side: credentials, base URL,
//! per-attempt timeout, and retry policy.

use crate::api::retry::RetryConfig;
use crate::{DEFAULT_BASE_URL, Error, RequestError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Environment variable overriding the API base URL.
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";

/// Reply reserve sized for roughly one chat message.
pub const DEFAULT_REPLY_RESERVE_TOKENS: usize = 450;

/// Token budget of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model: String,
    /// Maximum tokens a single request (prompt + reply) may occupy.
    pub max_context_tokens: usize,
    /// Tokens kept free for the model's reply.
    pub desired_reply_reserve_tokens: usize,
}

impl ModelProfile {
    pub fn new(
        model: impl Into<String>,
        max_context_tokens: usize,
        desired_reply_reserve_tokens: usize,
    ) -> Self {
        Self {
            model: model.into(),
            max_context_tokens,
            desired_reply_reserve_tokens,
        }
    }

    /// `gpt-4` with its 8k window.
    pub fn gpt4() -> Self {
        Self::new("gpt-4", 8_192, DEFAULT_REPLY_RESERVE_TOKENS)
    }

    /// `gpt-4-32k`, the long-context fallback for oversized content.
    pub fn gpt4_32k() -> Self {
        Self::new("gpt-4-32k", 32_768, DEFAULT_REPLY_RESERVE_TOKENS)
    }

    pub fn with_reply_reserve(mut self, tokens: usize) -> Self {
        self.desired_reply_reserve_tokens = tokens;
        self
    }
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self::gpt4()
    }
}

/// Transport configuration for [`ResilientClient`](crate::api::client::ResilientClient).
#[derive(Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: String,
    /// Timeout applied to each attempt individually.
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
        }
    }

    /// Read the API key (required) and base URL (optional) from the environment.
    pub fn from_env() -> Result<Self, Error> {
        let api_key = std::env::var(API_KEY_ENV).map_err(|_| {
            Error::Request(RequestError::permanent(format!("{API_KEY_ENV} not set")))
        })?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var(BASE_URL_ENV)
            && !base_url.trim().is_empty()
        {
            config.base_url = base_url;
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_have_increasing_context() {
        let short = ModelProfile::gpt4();
        let long = ModelProfile::gpt4_32k();
        assert!(short.max_context_tokens < long.max_context_tokens);
        assert_eq!(short.desired_reply_reserve_tokens, 450);
    }

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::new("sk-test");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = ClientConfig::new("sk-very-secret");
        let text = format!("{config:?}");
        assert!(!text.contains("sk-very-secret"));
        assert!(text.contains("redacted"));
    }
}
