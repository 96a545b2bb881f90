//! Divide-and-conquer summarization of content too large for one request.
//!
//! Content that fits the short-context model together with the task is
//! summarized there in a single round. Content that only fits the
//! long-context model goes there instead. Anything larger is cut at its
//! character midpoint, each half (with a little overlap and a `[...]` marker
//! at the cut) is summarized recursively, and the two summaries are joined
//! with a separator. Every leaf is a fresh one-round [`ChatSession`] whose
//! history is the chunk and whose instruction is the task.
//!
//! What happens to the joined text is governed by [`MergePolicy`]: by
//! default it is returned as-is, so its size grows with the number of
//! leaves.

use crate::api::client::ChatBackend;
use crate::config::ModelProfile;
use crate::context::tokens::{MESSAGE_FRAMING_TOKENS, TokenCounter};
use crate::error::Error;
use crate::session::{ChatSession, ConversationState};
use crate::{Hyperparameters, Message};
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Marker placed where a chunk was cut.
pub const SPLIT_MARKER: &str = "[...]";

/// Default separator between the summaries of two halves.
pub const DEFAULT_SEPARATOR: &str = "\n---\n";

/// Characters each half extends past the midpoint.
pub const DEFAULT_OVERLAP_CHARS: usize = 10;

pub const DEFAULT_MAX_DEPTH: usize = 16;

/// Default instruction when the caller has none.
pub const DEFAULT_TASK: &str = "Please summarize the main content of the text above.";

/// What to do with the joined summaries once the recursion finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Return the joined summaries unchanged.
    #[default]
    Concatenate,
    /// Summarize the joined text once more when it fits a single request.
    /// Falls back to the joined text when it does not.
    Condense,
}

/// Configuration for [`RecursiveSummarizer`].
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub overlap_chars: usize,
    pub separator: String,
    /// Maximum number of nested splits before giving up.
    pub max_depth: usize,
    pub merge: MergePolicy,
    /// Sampling parameters for every leaf round.
    pub hyperparameters: Hyperparameters,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            overlap_chars: DEFAULT_OVERLAP_CHARS,
            separator: DEFAULT_SEPARATOR.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
            merge: MergePolicy::default(),
            hyperparameters: Hyperparameters::default(),
        }
    }
}

impl SummarizerConfig {
    pub fn with_merge(mut self, merge: MergePolicy) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_hyperparameters(mut self, hyperparameters: Hyperparameters) -> Self {
        self.hyperparameters = hyperparameters;
        self
    }
}

/// Result of a summarization with its cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub text: String,
    /// Single-round summarization calls made, including any condense pass.
    pub leaf_calls: usize,
    /// Deepest split level reached (0 when no split was needed).
    pub depth: usize,
}

/// Summarizes content of any size with a short- and a long-context model.
pub struct RecursiveSummarizer {
    backend: Arc<dyn ChatBackend>,
    counter: Arc<TokenCounter>,
    short: ModelProfile,
    long: ModelProfile,
    config: SummarizerConfig,
}

impl RecursiveSummarizer {
    /// Summarizer using `gpt-4` and falling back to `gpt-4-32k`.
    pub fn new(backend: Arc<dyn ChatBackend>, counter: Arc<TokenCounter>) -> Self {
        Self {
            backend,
            counter,
            short: ModelProfile::gpt4(),
            long: ModelProfile::gpt4_32k(),
            config: SummarizerConfig::default(),
        }
    }

    /// `short` is tried first; `long` should have at least as much context.
    pub fn with_models(mut self, short: ModelProfile, long: ModelProfile) -> Self {
        if short.max_context_tokens > long.max_context_tokens {
            warn!(
                "Short-context model {} has more context than long-context model {}",
                short.model, long.model
            );
        }
        self.short = short;
        self.long = long;
        self
    }

    pub fn with_config(mut self, config: SummarizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Summarize `content` following the instruction `task`.
    pub async fn summarize(&self, content: &str, task: &str) -> Result<String, Error> {
        Ok(self.summarize_detailed(content, task).await?.text)
    }

    /// Like [`summarize`](Self::summarize), also reporting call count and
    /// split depth.
    pub async fn summarize_detailed(&self, content: &str, task: &str) -> Result<Summary, Error> {
        let summary = self.summarize_at(content.to_string(), task, 0).await?;
        if self.config.merge == MergePolicy::Condense && summary.leaf_calls > 1 {
            return self.condense(summary, task).await;
        }
        Ok(summary)
    }

    /// Tokens charged for `content` and `task` sent as two user messages.
    /// Counted without the cache: chunks are rarely seen twice.
    fn token_len(&self, content: &str, task: &str) -> usize {
        self.counter.count_text(content)
            + self.counter.count_text(task.trim())
            + 2 * MESSAGE_FRAMING_TOKENS
    }

    /// The model that can take `token_len` in one request, preferring the
    /// short one.
    fn pick_model(&self, token_len: usize) -> Option<&ModelProfile> {
        [&self.short, &self.long]
            .into_iter()
            .find(|p| token_len + p.desired_reply_reserve_tokens < p.max_context_tokens)
    }

    fn summarize_at<'a>(
        &'a self,
        content: String,
        task: &'a str,
        depth: usize,
    ) -> BoxFuture<'a, Result<Summary, Error>> {
        async move {
            let token_len = self.token_len(&content, task);
            if let Some(profile) = self.pick_model(token_len) {
                debug!(
                    "Summarizing {token_len} tokens with {} at depth {depth}",
                    profile.model
                );
                let text = self.summarize_leaf(content, task, profile).await?;
                return Ok(Summary {
                    text,
                    leaf_calls: 1,
                    depth,
                });
            }

            if depth >= self.config.max_depth {
                warn!("Content still {token_len} tokens after {depth} split(s); giving up");
                return Err(Error::SummaryDepthExceeded { depth });
            }

            let (first, second) = split_halves(&content, self.config.overlap_chars);
            let len = content.chars().count();
            if first.chars().count() >= len || second.chars().count() >= len {
                warn!("Content of {len} chars no longer shrinks when split; giving up");
                return Err(Error::SummaryDepthExceeded { depth });
            }
            info!("Content is {token_len} tokens; splitting {len} chars at depth {depth}");
            drop(content);

            let first = self.summarize_at(first, task, depth + 1).await?;
            let second = self.summarize_at(second, task, depth + 1).await?;
            Ok(Summary {
                text: format!("{}{}{}", first.text, self.config.separator, second.text),
                leaf_calls: first.leaf_calls + second.leaf_calls,
                depth: first.depth.max(second.depth),
            })
        }
        .boxed()
    }

    async fn summarize_leaf(
        &self,
        content: String,
        task: &str,
        profile: &ModelProfile,
    ) -> Result<String, Error> {
        let state =
            ConversationState::new(profile, "", vec![]).with_history(vec![Message::user(content)]);
        ChatSession::new(self.backend.clone(), self.counter.clone(), state)
            .with_hyperparameters(self.config.hyperparameters.clone())
            .chat_round(task)
            .await
    }

    async fn condense(&self, summary: Summary, task: &str) -> Result<Summary, Error> {
        let token_len = self.token_len(&summary.text, task);
        let Some(profile) = self.pick_model(token_len) else {
            warn!("Joined summary is {token_len} tokens; returning it without condensing");
            return Ok(summary);
        };
        debug!("Condensing {} joined summaries with {}", summary.leaf_calls, profile.model);
        let text = self.summarize_leaf(summary.text, task, profile).await?;
        Ok(Summary {
            text,
            leaf_calls: summary.leaf_calls + 1,
            depth: summary.depth,
        })
    }
}

/// Cut `content` at its character midpoint. Each half reaches `overlap`
/// characters past the cut and is marked with [`SPLIT_MARKER`] there.
pub fn split_halves(content: &str, overlap: usize) -> (String, String) {
    let half = content.chars().count() / 2;
    let (head, _) = content.split_at(byte_offset(content, half + overlap));
    let (_, tail) = content.split_at(byte_offset(content, half.saturating_sub(overlap)));
    (
        format!("{head}\n{SPLIT_MARKER}"),
        format!("{SPLIT_MARKER}\n{tail}"),
    )
}

/// Byte offset of the `chars`-th character, clamped to the end.
fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tokens::CharEstimateTokenizer;
    use crate::test_support::{ScriptedBackend, reply};

    const TASK: &str = "Summarize.";

    fn counter() -> Arc<TokenCounter> {
        Arc::new(TokenCounter::with_tokenizer(CharEstimateTokenizer::new(1.0)))
    }

    /// Short model fits chunks under 230 chars, long under 530.
    fn summarizer(backend: &Arc<ScriptedBackend>) -> RecursiveSummarizer {
        RecursiveSummarizer::new(backend.clone(), counter()).with_models(
            ModelProfile::new("short", 300, 50),
            ModelProfile::new("long", 600, 50),
        )
    }

    fn echo_length() -> ScriptedBackend {
        ScriptedBackend::responding(|request| {
            let chunk = request.messages[0].content().chars().count();
            reply(&format!("<{chunk}>"), 10, 3)
        })
    }

    #[test]
    fn split_marks_and_overlaps() {
        let content: String = ('a'..='z').cycle().take(60).collect();
        let (first, second) = split_halves(&content, 10);
        let (head, _) = content.split_at(40);
        let (_, tail) = content.split_at(20);
        assert_eq!(first, format!("{head}\n[...]"));
        assert_eq!(second, format!("[...]\n{tail}"));
    }

    #[test]
    fn split_respects_char_boundaries() {
        let content = "é".repeat(50);
        let (first, second) = split_halves(&content, 3);
        assert!(first.starts_with(&"é".repeat(28)));
        assert_eq!(second.chars().filter(|c| *c == 'é').count(), 28);
    }

    #[test]
    fn split_overlap_larger_than_half() {
        let (first, second) = split_halves("abcd", 10);
        assert_eq!(first, "abcd\n[...]");
        assert_eq!(second, "[...]\nabcd");
    }

    #[tokio::test]
    async fn small_content_uses_short_model_once() {
        let backend = Arc::new(echo_length());
        let summary = summarizer(&backend)
            .summarize_detailed(&"x".repeat(100), TASK)
            .await
            .unwrap();

        assert_eq!(summary, Summary { text: "<100>".into(), leaf_calls: 1, depth: 0 });
        let request = &backend.requests()[0];
        assert_eq!(request.model, "short");
        assert_eq!(
            request.messages,
            vec![Message::user("x".repeat(100)), Message::user(TASK)]
        );
    }

    #[tokio::test]
    async fn medium_content_uses_long_model() {
        let backend = Arc::new(echo_length());
        summarizer(&backend).summarize(&"x".repeat(400), TASK).await.unwrap();
        assert_eq!(backend.calls(), 1);
        assert_eq!(backend.requests()[0].model, "long");
    }

    #[tokio::test]
    async fn double_budget_splits_exactly_once() {
        let backend = Arc::new(echo_length());
        let summary = summarizer(&backend)
            .summarize_detailed(&"x".repeat(1000), TASK)
            .await
            .unwrap();

        // Each half is 510 chars plus the 6-char marker.
        assert_eq!(summary.text, "<516>\n---\n<516>");
        assert_eq!(summary.leaf_calls, 2);
        assert_eq!(summary.depth, 1);
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].messages[0].content().ends_with("x\n[...]"));
        assert!(requests[1].messages[0].content().starts_with("[...]\nx"));
        assert!(requests.iter().all(|r| r.model == "long"));
    }

    #[tokio::test]
    async fn large_content_recurses_logarithmically() {
        let backend = Arc::new(echo_length());
        let summary = summarizer(&backend)
            .summarize_detailed(&"y".repeat(10_000), TASK)
            .await
            .unwrap();

        assert_eq!(summary.depth, 5);
        assert_eq!(summary.leaf_calls, 32);
        assert_eq!(backend.calls(), 32);
        assert!(!summary.text.is_empty());
        assert_eq!(summary.text.matches(DEFAULT_SEPARATOR).count(), 31);
    }

    #[tokio::test]
    async fn condense_runs_one_more_pass() {
        let backend = Arc::new(ScriptedBackend::new([
            reply("first part", 1, 1),
            reply("second part", 1, 1),
            reply("both parts", 1, 1),
        ]));
        let summarizer = summarizer(&backend)
            .with_config(SummarizerConfig::default().with_merge(MergePolicy::Condense));

        let summary = summarizer
            .summarize_detailed(&"x".repeat(1000), TASK)
            .await
            .unwrap();

        assert_eq!(summary.text, "both parts");
        assert_eq!(summary.leaf_calls, 3);
        let last = &backend.requests()[2];
        assert_eq!(last.model, "short");
        assert_eq!(last.messages[0].content(), "first part\n---\nsecond part");
    }

    #[tokio::test]
    async fn condense_skipped_without_split() {
        let backend = Arc::new(echo_length());
        let summarizer = summarizer(&backend)
            .with_config(SummarizerConfig::default().with_merge(MergePolicy::Condense));
        summarizer.summarize(&"x".repeat(100), TASK).await.unwrap();
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn depth_limit_is_enforced() {
        let backend = Arc::new(echo_length());
        let err = summarizer(&backend)
            .with_config(SummarizerConfig::default().with_max_depth(2))
            .summarize(&"y".repeat(10_000), TASK)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SummaryDepthExceeded { depth: 2 }));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn non_shrinking_split_gives_up() {
        let backend = Arc::new(echo_length());
        let tiny = ModelProfile::new("tiny", 60, 10);
        let err = RecursiveSummarizer::new(backend.clone(), counter())
            .with_models(tiny.clone(), tiny)
            .summarize(&"z".repeat(40), TASK)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SummaryDepthExceeded { .. }));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn leaf_failure_propagates() {
        let backend = Arc::new(ScriptedBackend::new([
            reply("first part", 1, 1),
            Err(crate::RequestError::permanent("HTTP 401").with_status(401)),
        ]));
        let err = summarizer(&backend)
            .summarize(&"x".repeat(1000), TASK)
            .await
            .unwrap_err();
        assert_eq!(err.request_kind(), Some(crate::ErrorKind::Permanent));
        assert_eq!(backend.calls(), 2);
    }
}
