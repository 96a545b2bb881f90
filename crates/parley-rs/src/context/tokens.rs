//! Token counting with a bounded, shared memoization cache.
//!
//! A [`TokenCounter`] charges every message the way the completion API bills
//! it: the tokens of its content, a fixed framing overhead per message, and
//! the tokens of the optional `name` and `function_call` fields. Counts are
//! memoized per [`Message`] in a FIFO [`TokenCache`]; since messages are
//! immutable a resident entry never goes stale.

use crate::Message;
use crate::error::Error;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tiktoken_rs::CoreBPE;
use tracing::debug;

/// Per-message framing charged by the chat format: 4 for the message
/// delimiters plus 1 for the role.
pub const MESSAGE_FRAMING_TOKENS: usize = 5;

/// Encoding used when the model has no known tokenizer.
pub const DEFAULT_ENCODING: &str = "cl100k_base";

/// Default number of messages kept in the token cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Default characters per token for [`CharEstimateTokenizer`]
/// (conservative estimate for English text).
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

// ── Tokenizers ─────────────────────────────────────────────────────

/// Counts the tokens in a piece of text.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Human-readable name of the encoding, for logs.
    fn encoding(&self) -> &str;
}

/// Byte-pair tokenizer backed by `tiktoken`.
pub struct BpeTokenizer {
    bpe: CoreBPE,
    encoding: String,
}

impl BpeTokenizer {
    /// Load the tokenizer for `model`, falling back to [`DEFAULT_ENCODING`]
    /// when the model is not recognized.
    ///
    /// Provider prefixes such as `openai/` are ignored. Fails only if the
    /// default encoding itself cannot be loaded.
    pub fn for_model(model: &str) -> Result<Self, Error> {
        let name = model.rsplit('/').next().unwrap_or(model);
        match tiktoken_rs::get_bpe_from_model(name) {
            Ok(bpe) => Ok(Self {
                bpe,
                encoding: format!("{name} (model-specific)"),
            }),
            Err(e) => {
                debug!("No tokenizer for model {model:?} ({e}); falling back to {DEFAULT_ENCODING}");
                Self::default_encoding()
            }
        }
    }

    /// Load [`DEFAULT_ENCODING`].
    pub fn default_encoding() -> Result<Self, Error> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(Self {
            bpe,
            encoding: DEFAULT_ENCODING.to_string(),
        })
    }
}

impl Tokenizer for BpeTokenizer {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn encoding(&self) -> &str {
        &self.encoding
    }
}

/// Character-ratio estimate. No vocabulary to load; useful offline and in
/// tests where exact counts must be easy to reason about.
#[derive(Debug, Clone)]
pub struct CharEstimateTokenizer {
    chars_per_token: f64,
}

impl CharEstimateTokenizer {
    pub fn new(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: if chars_per_token > 0.0 {
                chars_per_token
            } else {
                DEFAULT_CHARS_PER_TOKEN
            },
        }
    }
}

impl Default for CharEstimateTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl Tokenizer for CharEstimateTokenizer {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }

    fn encoding(&self) -> &str {
        "char-estimate"
    }
}

// ── Cache ──────────────────────────────────────────────────────────

/// Bounded message → token count map with first-in-first-out eviction.
#[derive(Debug)]
pub struct TokenCache {
    entries: HashMap<Message, usize>,
    order: VecDeque<Message>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl TokenCache {
    /// Create a cache holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a cached count.
    pub fn get(&mut self, message: &Message) -> Option<usize> {
        let found = self.entries.get(message).copied();
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    /// Store a count. Replacing an existing entry keeps its queue position.
    pub fn insert(&mut self, message: Message, tokens: usize) {
        if let Some(existing) = self.entries.get_mut(&message) {
            *existing = tokens;
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(message.clone());
        self.entries.insert(message, tokens);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

// ── Counter ────────────────────────────────────────────────────────

/// Memoizing per-message token counter. Share one across sessions with `Arc`.
pub struct TokenCounter {
    tokenizer: Box<dyn Tokenizer>,
    cache: Mutex<TokenCache>,
}

impl TokenCounter {
    /// Counter using the BPE tokenizer for `model` (or the default encoding).
    pub fn for_model(model: &str) -> Result<Self, Error> {
        let tokenizer = BpeTokenizer::for_model(model)?;
        debug!("Loaded tokenizer {} for {model}", tokenizer.encoding());
        Ok(Self::with_tokenizer(tokenizer))
    }

    pub fn with_tokenizer(tokenizer: impl Tokenizer + 'static) -> Self {
        Self {
            tokenizer: Box::new(tokenizer),
            cache: Mutex::new(TokenCache::default()),
        }
    }

    pub fn with_cache_capacity(self, capacity: usize) -> Self {
        Self {
            cache: Mutex::new(TokenCache::new(capacity)),
            ..self
        }
    }

    pub fn encoding(&self) -> &str {
        self.tokenizer.encoding()
    }

    /// Tokens in bare text, without message framing. Not cached.
    pub fn count_text(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    /// Tokens charged for `message`, including framing and optional fields.
    pub fn count(&self, message: &Message) -> usize {
        if let Some(tokens) = self.lock_cache().get(message) {
            return tokens;
        }
        // Counted outside the lock; a concurrent miss on the same message
        // just computes the same value twice.
        let tokens = self.uncached_count(message);
        self.lock_cache().insert(message.clone(), tokens);
        tokens
    }

    /// Total tokens charged for a slice of messages.
    pub fn count_all(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count(m)).sum()
    }

    /// Record the exact completion-token usage the API reported for a reply
    /// so it is never re-tokenized.
    pub fn seed(&self, message: &Message, completion_tokens: usize) {
        self.lock_cache()
            .insert(message.clone(), completion_tokens + MESSAGE_FRAMING_TOKENS);
    }

    /// Cached count for `message`, if resident.
    pub fn cached(&self, message: &Message) -> Option<usize> {
        self.lock_cache().entries.get(message).copied()
    }

    /// Snapshot of `(entries, hits, misses)` for diagnostics.
    pub fn cache_stats(&self) -> (usize, u64, u64) {
        let cache = self.lock_cache();
        (cache.len(), cache.hits(), cache.misses())
    }

    fn uncached_count(&self, message: &Message) -> usize {
        let mut tokens = self.tokenizer.count(message.content()) + MESSAGE_FRAMING_TOKENS;
        if let Some(name) = message.name() {
            tokens += self.tokenizer.count(name);
        }
        if let Some(call) = message.function_call() {
            tokens += self.tokenizer.count(&call.name);
            tokens += self.tokenizer.count(&call.arguments);
        }
        tokens
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, TokenCache> {
        // The cache holds plain counts; a panic mid-insert cannot leave a
        // value that is wrong, only one that is missing.
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("encoding", &self.tokenizer.encoding())
            .finish_non_exhaustive()
    }
}
