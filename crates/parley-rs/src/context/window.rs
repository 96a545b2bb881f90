//! Sliding context-window selection with a monotonic cursor.
//!
//! Every request is built as the priming messages (persona, system
//! instructions; always sent in full) followed by the newest suffix of the
//! history that fits in what is left of the budget after the reply reserve.
//!
//! The scan runs from the newest message back toward the cursor left by the
//! previous selection and stops at the first message that does not fit.
//! Everything older than the last kept message is dropped for good: the
//! cursor only ever moves forward, so each call touches only the messages
//! added since the last one. The trade-off is that the window is not
//! globally optimal; a message evicted during a tight round is not
//! reconsidered when a later round would have room for it.

use crate::Message;
use crate::context::tokens::TokenCounter;
use tracing::{debug, warn};

/// What to do when the newest history message alone does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Omit it. The budget invariant holds for every returned window;
    /// [`SelectedWindow::newest_omitted`] reports the situation so the caller
    /// can refuse to send a request without the latest input.
    #[default]
    Reject,
    /// Include it anyway so the conversation can always proceed. The window
    /// may then exceed `max_context_tokens`.
    IncludeNewest,
}

/// Result of a window selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedWindow {
    /// Priming messages followed by the kept history suffix, oldest first.
    pub messages: Vec<Message>,
    /// Cursor to pass to the next selection.
    pub oldest_retained_index: usize,
    /// Tokens charged for `messages`.
    pub prompt_tokens: usize,
    /// Number of history messages kept.
    pub kept: usize,
    /// History messages dropped by this call (not counting earlier drops).
    pub newly_dropped: usize,
    /// The newest history message did not fit and was left out.
    pub newest_omitted: bool,
}

/// Token budget for one conversation's requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow {
    pub max_context_tokens: usize,
    pub desired_reply_reserve_tokens: usize,
    pub overflow: OverflowPolicy,
}

impl ContextWindow {
    pub fn new(max_context_tokens: usize, desired_reply_reserve_tokens: usize) -> Self {
        Self {
            max_context_tokens,
            desired_reply_reserve_tokens,
            overflow: OverflowPolicy::default(),
        }
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Tokens left for history once `priming` and the reply reserve are paid
    /// for. Negative when the priming alone overruns the budget.
    pub fn history_budget(&self, counter: &TokenCounter, priming: &[Message]) -> i64 {
        self.max_context_tokens as i64
            - counter.count_all(priming) as i64
            - self.desired_reply_reserve_tokens as i64
    }

    /// Select the in-budget window.
    ///
    /// A history message is kept only while the budget remaining after it
    /// stays strictly positive, so every window returned under
    /// [`OverflowPolicy::Reject`] satisfies
    /// `tokens(window) + desired_reply_reserve_tokens < max_context_tokens`
    /// whenever any history is kept. Calling again with the returned cursor
    /// and an unchanged history yields the same window.
    pub fn select(
        &self,
        counter: &TokenCounter,
        history: &[Message],
        priming: &[Message],
        oldest_retained_index: usize,
    ) -> SelectedWindow {
        let priming_tokens = counter.count_all(priming);
        let mut remaining = self.max_context_tokens as i64
            - priming_tokens as i64
            - self.desired_reply_reserve_tokens as i64;

        let floor = oldest_retained_index.min(history.len());
        let mut cursor = floor;
        let mut kept_tokens = 0;
        let mut first_kept = history.len();
        let mut newest_omitted = false;

        for idx in (floor..history.len()).rev() {
            let tokens = counter.count(&history[idx]);
            remaining -= tokens as i64;
            if remaining > 0 {
                kept_tokens += tokens;
                first_kept = idx;
                continue;
            }

            if idx + 1 == history.len() {
                match self.overflow {
                    OverflowPolicy::IncludeNewest => {
                        warn!(
                            "Newest message ({tokens} tokens) does not fit the context window; \
                             sending it over budget"
                        );
                        kept_tokens += tokens;
                        first_kept = idx;
                        cursor = idx;
                        break;
                    }
                    OverflowPolicy::Reject => newest_omitted = true,
                }
            }
            cursor = idx + 1;
            break;
        }

        let kept = history.len() - first_kept;
        let mut messages = Vec::with_capacity(priming.len() + kept);
        messages.extend_from_slice(priming);
        messages.extend_from_slice(&history[first_kept..]);

        let window = SelectedWindow {
            messages,
            oldest_retained_index: cursor,
            prompt_tokens: priming_tokens + kept_tokens,
            kept,
            newly_dropped: cursor - floor,
            newest_omitted,
        };
        debug!(
            "Context window: {} priming + {} history message(s), {} tokens, cursor {} -> {}",
            priming.len(),
            window.kept,
            window.prompt_tokens,
            oldest_retained_index,
            window.oldest_retained_index,
        );
        window
    }
}
