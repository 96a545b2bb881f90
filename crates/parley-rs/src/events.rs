//! Events and handlers for [`ChatSession`](crate::session::ChatSession) rounds.
//!
//! A session reports what it is doing through [`SessionEvent`] variants,
//! from the start of a round through window selection to the recorded
//! exchange or the failure that ended it. Callers implement
//! [`EventHandler`] to observe them for logging, metrics, or transcript
//! persistence.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests, or sessions nobody watches |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures, e.g. appending exchanges to a transcript |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::Message;
use crate::error::Error;
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by a session during a round.
#[derive(Debug)]
pub enum SessionEvent<'a> {
    /// A round is starting. `history_len` includes the new user message.
    RoundStart { round: u32, history_len: usize },
    /// The context window for this round was selected.
    WindowSelected {
        kept: usize,
        prompt_tokens: usize,
        oldest_retained_index: usize,
        newly_dropped: usize,
    },
    /// Token usage reported by the API for this round.
    TokenUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// A round succeeded and both messages are now in the history. This is
    /// the hook for transcript persistence.
    Exchange {
        round: u32,
        user: &'a Message,
        assistant: &'a Message,
    },
    /// A round failed. The user message stays in the history.
    RoundFailed { round: u32, error: &'a Error },
}

impl SessionEvent<'_> {
    /// Total tokens for a `TokenUsage` event, `None` for all others.
    pub fn total_tokens(&self) -> Option<u64> {
        if let SessionEvent::TokenUsage {
            prompt_tokens,
            completion_tokens,
        } = self
        {
            Some(*prompt_tokens as u64 + *completion_tokens as u64)
        } else {
            None
        }
    }
}

/// Handler for session events. The default implementation ignores
/// everything.
///
/// # Example
///
/// ```ignore
/// struct Transcript(std::sync::Mutex<Vec<String>>);
///
/// impl EventHandler for Transcript {
///     fn on_event(&self, event: &SessionEvent<'_>) {
///         if let SessionEvent::Exchange { user, assistant, .. } = event {
///             let mut lines = self.0.lock().unwrap();
///             lines.push(user.content().to_string());
///             lines.push(assistant.content().to_string());
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &SessionEvent<'_>) {
        let _ = event;
    }
}

/// A handler that does nothing.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let Some(total) = event.total_tokens() {
///         eprintln!("[{total} tokens]");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&SessionEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&SessionEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&SessionEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &SessionEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner handler in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(show_usage, usage_printer);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add `handler` only when `condition` holds, keeping the builder chain
    /// intact.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &SessionEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events through `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &SessionEvent<'_>) {
        match event {
            SessionEvent::RoundStart { round, history_len } => {
                debug!("Round {round} starting ({history_len} message(s) in history)");
            }
            SessionEvent::WindowSelected {
                kept,
                prompt_tokens,
                oldest_retained_index,
                newly_dropped,
            } => {
                if *newly_dropped > 0 {
                    info!(
                        "Dropped {newly_dropped} old message(s) from the context window \
                         (cursor now {oldest_retained_index})"
                    );
                }
                debug!("Window: {kept} history message(s), ~{prompt_tokens} tokens");
            }
            SessionEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
            } => {
                debug!("Tokens: prompt={prompt_tokens}, completion={completion_tokens}");
            }
            SessionEvent::Exchange {
                round, assistant, ..
            } => {
                info!(
                    "Round {round} complete ({} chars)",
                    assistant.content().len()
                );
            }
            SessionEvent::RoundFailed { round, error } => {
                warn!("Round {round} failed: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn total_tokens_only_for_usage() {
        let usage = SessionEvent::TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
        };
        assert_eq!(usage.total_tokens(), Some(120));

        let start = SessionEvent::RoundStart {
            round: 1,
            history_len: 1,
        };
        assert_eq!(start.total_tokens(), None);
    }

    #[test]
    fn composite_dispatches_to_every_handler() {
        let count = Arc::new(AtomicUsize::new(0));
        let (a, b) = (count.clone(), count.clone());
        let handler = CompositeEventHandler::new()
            .with(FnEventHandler::new(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            }))
            .with(NoopHandler)
            .with_if(false, LoggingHandler)
            .with(FnEventHandler::new(move |_| {
                b.fetch_add(10, Ordering::SeqCst);
            }));
        assert_eq!(handler.len(), 3);

        handler.on_event(&SessionEvent::RoundStart {
            round: 1,
            history_len: 1,
        });
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn logging_handler_accepts_every_variant() {
        let user = Message::user("hi");
        let assistant = Message::assistant("hello");
        let error = Error::Tokenizer("missing".into());
        let events = [
            SessionEvent::RoundStart {
                round: 1,
                history_len: 1,
            },
            SessionEvent::WindowSelected {
                kept: 1,
                prompt_tokens: 10,
                oldest_retained_index: 0,
                newly_dropped: 2,
            },
            SessionEvent::TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 2,
            },
            SessionEvent::Exchange {
                round: 1,
                user: &user,
                assistant: &assistant,
            },
            SessionEvent::RoundFailed {
                round: 2,
                error: &error,
            },
        ];
        for event in &events {
            LoggingHandler.on_event(event);
        }
    }
}
