//! Token-budgeted conversation context manager for chat-completion APIs.
//!
//! `parley-rs` keeps a multi-turn LLM conversation inside a hard token budget
//! while staying resilient to a flaky upstream API, and can compress
//! arbitrarily large standalone content down to something a model can read.
//!
//! # Getting started
//!
//! ```ignore
//! use parley_rs::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), parley_rs::Error> {
//!     let client = Arc::new(ResilientClient::from_config(ClientConfig::from_env()?)?);
//!     let profile = ModelProfile::gpt4();
//!     let counter = Arc::new(TokenCounter::for_model(&profile.model)?);
//!
//!     let session = ChatSession::new(
//!         client,
//!         counter,
//!         ConversationState::new(&profile, "You are a helpful game master.", vec![]),
//!     );
//!
//!     let reply = session.chat_round("Describe the tavern.").await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Count tokens:** [`TokenCounter`](context::TokenCounter) wraps a
//!   [`Tokenizer`](context::Tokenizer) with a bounded FIFO cache keyed by
//!   [`Message`].
//! - **Pick the in-budget history:** [`ContextWindow`](context::ContextWindow)
//!   selects priming messages plus the newest suffix of the history, never
//!   re-admitting anything it has dropped.
//! - **Talk to the API:** [`ResilientClient`](api::client::ResilientClient)
//!   classifies every failure and retries only transient ones with
//!   exponential backoff. Anything implementing
//!   [`ChatBackend`](api::client::ChatBackend) can stand in for it.
//! - **Run a conversation:** [`ChatSession`](session::ChatSession) serializes
//!   rounds on one conversation and records the transcript.
//! - **Compress big content:** [`RecursiveSummarizer`](context::summarizer::RecursiveSummarizer)
//!   splits oversized content in half until each piece fits a single call.
//! - **Observe rounds:** implement [`EventHandler`](events::EventHandler).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api`] | Resilient HTTP client, failure classification, retry with backoff |
//! | [`context`] | Token counting, context window selection, recursive summarization |
//! | [`session`] | Single-flight chat rounds over one conversation, usage tracking |
//! | [`events`] | Round lifecycle events and handlers (transcript sink) |
//! | [`config`] | Model profiles and client configuration |
//! | [`error`] | Error taxonomy |

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod prelude;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

use serde::{Deserialize, Serialize};

pub use error::{Error, ErrorKind, RequestError};

// ── Constants ──────────────────────────────────────────────────────

/// Default base URL of the completion API.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Route of the chat completions endpoint, relative to the base URL.
pub const CHAT_COMPLETIONS_ROUTE: &str = "/chat/completions";

/// Default model for conversations.
pub const DEFAULT_MODEL: &str = "gpt-4";

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    /// The result of a function call, fed back to the model.
    Function,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Function => write!(f, "function"),
        }
    }
}

/// A function call requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them.
    pub arguments: String,
}

/// A message in the conversation.
///
/// Messages are immutable once built: fields are only reachable through
/// accessors. That is what makes a `Message` usable as a token-cache key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Message {
    role: MessageRole,
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
}

impl Message {
    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            name: None,
            function_call: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    /// An assistant turn that calls a function instead of replying.
    pub fn assistant_function_call(call: FunctionCall) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: None,
            name: None,
            function_call: Some(call),
        }
    }

    /// The result of calling function `name`.
    pub fn function_result(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::with_role(MessageRole::Function, content)
        }
    }

    /// Return a copy of this message attributed to `name`.
    pub fn named(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn role(&self) -> MessageRole {
        self.role
    }

    /// Text content; empty for pure function-call turns.
    pub fn content(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn function_call(&self) -> Option<&FunctionCall> {
        self.function_call.as_ref()
    }
}

/// A function the model may call (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

// ── Request types ──────────────────────────────────────────────────

/// Sampling parameters forwarded with every request. Unset fields are
/// omitted from serialization so the API applies its own defaults.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Hyperparameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Hyperparameters {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_frequency_penalty(mut self, penalty: f32) -> Self {
        self.frequency_penalty = Some(penalty);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Layer `overrides` on top of `self`; any field set in `overrides` wins.
    pub fn merged(&self, overrides: &Hyperparameters) -> Hyperparameters {
        Hyperparameters {
            temperature: overrides.temperature.or(self.temperature),
            top_p: overrides.top_p.or(self.top_p),
            frequency_penalty: overrides.frequency_penalty.or(self.frequency_penalty),
            presence_penalty: overrides.presence_penalty.or(self.presence_penalty),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            stop: overrides.stop.clone().or_else(|| self.stop.clone()),
            seed: overrides.seed.or(self.seed),
        }
    }
}

/// Chat completion request body.
#[derive(Serialize, Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<FunctionDef>>,
    #[serde(flatten)]
    pub hyperparameters: Hyperparameters,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            functions: None,
            hyperparameters: Hyperparameters::default(),
        }
    }

    pub fn with_hyperparameters(mut self, hyperparameters: Hyperparameters) -> Self {
        self.hyperparameters = hyperparameters;
        self
    }

    pub fn with_functions(mut self, functions: Vec<FunctionDef>) -> Self {
        self.functions = if functions.is_empty() {
            None
        } else {
            Some(functions)
        };
        self
    }
}

// ── Response types ─────────────────────────────────────────────────

/// Token usage statistics reported by the API.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageInfo {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: Option<u32>,
}

/// A successful completion: the assistant message plus exact usage.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub message: Message,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: Option<String>,
}

impl ChatCompletion {
    /// Text of the assistant message.
    pub fn text(&self) -> &str {
        self.message.content()
    }
}

/// Outcome of one completion request: the completion, or a classified error.
pub type RequestOutcome = Result<ChatCompletion, RequestError>;
