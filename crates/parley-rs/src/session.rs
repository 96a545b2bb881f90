//! Single-flight chat rounds over one conversation.
//!
//! A [`ChatSession`] owns a [`ConversationState`] behind an async mutex. A
//! round appends the user message, selects the context window, sends it
//! through the [`ChatBackend`], and appends the reply. Concurrent callers on
//! the same session queue behind each other in FIFO order; distinct sessions
//! share nothing but the [`TokenCounter`].
//!
//! The history is append-only. The user message is recorded before the
//! request goes out, so a failed round leaves it in place with no reply; the
//! next round simply sends it again as context.
//!
//! ```ignore
//! let client = Arc::new(ResilientClient::from_config(ClientConfig::from_env()?)?);
//! let counter = Arc::new(TokenCounter::for_model("gpt-4")?);
//! let state = ConversationState::new(&ModelProfile::gpt4(), "You are terse.", vec![]);
//! let session = ChatSession::new(client, counter, state);
//!
//! let reply = session.chat_round("What is a kobold?").await?;
//! ```

use crate::api::client::ChatBackend;
use crate::config::ModelProfile;
use crate::context::tokens::TokenCounter;
use crate::context::window::{ContextWindow, OverflowPolicy};
use crate::error::Error;
use crate::events::{EventHandler, NoopHandler, SessionEvent};
use crate::{ChatRequest, FunctionDef, Hyperparameters, Message, MessageRole};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

// ── State ──────────────────────────────────────────────────────────

/// Everything one conversation owns. Serializable so an external
/// collaborator can persist and restore it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub model: String,
    pub max_context_tokens: usize,
    pub desired_reply_reserve_tokens: usize,
    /// Always sent in full, ahead of the history. Fixed at creation.
    pub priming: Vec<Message>,
    /// Append-only transcript.
    pub history: Vec<Message>,
    /// Index of the oldest history message still eligible for the window.
    /// Never decreases.
    pub oldest_retained_index: usize,
}

impl ConversationState {
    /// A conversation whose priming is the trimmed `system_prompt` (when
    /// non-empty) followed by `extra_priming`.
    pub fn new(profile: &ModelProfile, system_prompt: &str, extra_priming: Vec<Message>) -> Self {
        let system_prompt = system_prompt.trim();
        let mut priming = Vec::with_capacity(extra_priming.len() + 1);
        if !system_prompt.is_empty() {
            priming.push(Message::system(system_prompt));
        }
        priming.extend(extra_priming);
        Self {
            model: profile.model.clone(),
            max_context_tokens: profile.max_context_tokens,
            desired_reply_reserve_tokens: profile.desired_reply_reserve_tokens,
            priming,
            history: Vec::new(),
            oldest_retained_index: 0,
        }
    }

    /// Seed the conversation with an earlier transcript.
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn window(&self, overflow: OverflowPolicy) -> ContextWindow {
        ContextWindow::new(self.max_context_tokens, self.desired_reply_reserve_tokens)
            .with_overflow(overflow)
    }

    /// The most recent user message and the assistant reply that follows it.
    pub fn last_exchange(&self) -> Option<Exchange> {
        let [.., user, assistant] = self.history.as_slice() else {
            return None;
        };
        (user.role() == MessageRole::User && assistant.role() == MessageRole::Assistant).then(
            || Exchange {
                user: user.clone(),
                assistant: assistant.clone(),
            },
        )
    }
}

/// A completed user/assistant pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: Message,
    pub assistant: Message,
}

/// Accumulated usage for one session, as reported by the API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTracker {
    pub rounds: u32,
    pub failed_rounds: u32,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record usage for a successful round.
    pub fn record(&mut self, prompt_tokens: u32, completion_tokens: u32) {
        self.rounds += 1;
        self.total_prompt_tokens += prompt_tokens as u64;
        self.total_completion_tokens += completion_tokens as u64;
    }

    pub fn record_failure(&mut self) {
        self.failed_rounds += 1;
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens + self.total_completion_tokens
    }

    pub fn summary(&self) -> String {
        format!(
            "rounds: {} ok, {} failed; tokens: {} prompt + {} completion = {} total",
            self.rounds,
            self.failed_rounds,
            self.total_prompt_tokens,
            self.total_completion_tokens,
            self.total_tokens(),
        )
    }
}

// ── Session ────────────────────────────────────────────────────────

struct Inner {
    state: ConversationState,
    usage: UsageTracker,
    round: u32,
}

/// Orchestrates chat rounds for one conversation.
pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    counter: Arc<TokenCounter>,
    events: Arc<dyn EventHandler>,
    overflow: OverflowPolicy,
    hyperparameters: Hyperparameters,
    functions: Vec<FunctionDef>,
    inner: Mutex<Inner>,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        counter: Arc<TokenCounter>,
        state: ConversationState,
    ) -> Self {
        Self {
            backend,
            counter,
            events: Arc::new(NoopHandler),
            overflow: OverflowPolicy::default(),
            hyperparameters: Hyperparameters::default(),
            functions: Vec::new(),
            inner: Mutex::new(Inner {
                state,
                usage: UsageTracker::new(),
                round: 0,
            }),
        }
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Session-wide sampling parameters. Per-round overrides go through
    /// [`chat_round_with`](Self::chat_round_with).
    pub fn with_hyperparameters(mut self, hyperparameters: Hyperparameters) -> Self {
        self.hyperparameters = hyperparameters;
        self
    }

    pub fn with_functions(mut self, functions: Vec<FunctionDef>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events = Arc::new(handler);
        self
    }

    /// Share an event handler with other sessions.
    pub fn with_shared_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = handler;
        self
    }

    /// Replace the history with an earlier transcript.
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.inner.get_mut().state.history = history;
        self
    }

    pub fn counter(&self) -> &Arc<TokenCounter> {
        &self.counter
    }

    /// Run one round with the session's hyperparameters.
    pub async fn chat_round(&self, text: &str) -> Result<String, Error> {
        self.chat_round_with(text, &Hyperparameters::default()).await
    }

    /// Run one round, layering `overrides` over the session's hyperparameters.
    ///
    /// On failure the user message stays in the history and no assistant
    /// message is added. The session remains usable.
    pub async fn chat_round_with(
        &self,
        text: &str,
        overrides: &Hyperparameters,
    ) -> Result<String, Error> {
        let mut inner = self.inner.lock().await;
        inner.round += 1;
        let round = inner.round;

        let user = Message::user(text.trim());
        inner.state.history.push(user.clone());
        self.events.on_event(&SessionEvent::RoundStart {
            round,
            history_len: inner.state.history.len(),
        });

        let window = inner.state.window(self.overflow);
        let selected = window.select(
            &self.counter,
            &inner.state.history,
            &inner.state.priming,
            inner.state.oldest_retained_index,
        );
        inner.state.oldest_retained_index = selected.oldest_retained_index;
        self.events.on_event(&SessionEvent::WindowSelected {
            kept: selected.kept,
            prompt_tokens: selected.prompt_tokens,
            oldest_retained_index: selected.oldest_retained_index,
            newly_dropped: selected.newly_dropped,
        });

        if selected.newest_omitted {
            let err = Error::InputExceedsBudget {
                tokens: self.counter.count(&user),
                available: window.history_budget(&self.counter, &inner.state.priming),
            };
            return Err(self.fail(&mut inner, round, err));
        }

        let used = selected.prompt_tokens + window.desired_reply_reserve_tokens;
        if self.overflow == OverflowPolicy::Reject && used > window.max_context_tokens {
            error!("Context window over budget: {used} > {}", window.max_context_tokens);
            let err = Error::BudgetInvariant {
                used,
                budget: window.max_context_tokens,
            };
            return Err(self.fail(&mut inner, round, err));
        }

        let request = ChatRequest::new(inner.state.model.clone(), selected.messages)
            .with_hyperparameters(self.hyperparameters.merged(overrides))
            .with_functions(self.functions.clone());

        let completion = match self.backend.complete(&request).await {
            Ok(completion) => completion,
            Err(e) => return Err(self.fail(&mut inner, round, e.into())),
        };

        self.counter
            .seed(&completion.message, completion.completion_tokens as usize);
        inner
            .usage
            .record(completion.prompt_tokens, completion.completion_tokens);
        inner.state.history.push(completion.message.clone());
        debug!(
            "Round {round}: reply of {} chars, history now {} message(s)",
            completion.text().len(),
            inner.state.history.len()
        );

        self.events.on_event(&SessionEvent::TokenUsage {
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
        });
        self.events.on_event(&SessionEvent::Exchange {
            round,
            user: &user,
            assistant: &completion.message,
        });

        Ok(completion.text().to_string())
    }

    /// Append the result of a function the model asked to call. It is sent
    /// as context with the next round.
    pub async fn push_function_result(&self, name: &str, content: &str) {
        self.inner
            .lock()
            .await
            .state
            .history
            .push(Message::function_result(name, content));
    }

    pub async fn history(&self) -> Vec<Message> {
        self.inner.lock().await.state.history.clone()
    }

    /// Snapshot of the full conversation state.
    pub async fn state(&self) -> ConversationState {
        self.inner.lock().await.state.clone()
    }

    pub async fn last_exchange(&self) -> Option<Exchange> {
        self.inner.lock().await.state.last_exchange()
    }

    pub async fn usage(&self) -> UsageTracker {
        self.inner.lock().await.usage
    }

    fn fail(&self, inner: &mut Inner, round: u32, error: Error) -> Error {
        inner.usage.record_failure();
        self.events
            .on_event(&SessionEvent::RoundFailed { round, error: &error });
        error
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("counter", &self.counter)
            .field("overflow", &self.overflow)
            .field("hyperparameters", &self.hyperparameters)
            .finish_non_exhaustive()
    }
}
