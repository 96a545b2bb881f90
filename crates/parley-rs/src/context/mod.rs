//! Keeping a conversation inside a model's token budget.
//!
//! 1. **[`tokens`]**: [`TokenCounter`] charges each message its tokenizer
//!    cost plus per-message framing and memoizes the result in a bounded
//!    FIFO cache.
//!
//! 2. **[`window`]**: [`ContextWindow`] picks the newest history suffix that
//!    fits beside the priming messages and the reply reserve, advancing a
//!    cursor that never moves back.
//!
//! 3. **[`summarizer`]**: [`RecursiveSummarizer`] compresses standalone
//!    content too large for any single request by splitting it in half until
//!    the pieces fit.

pub mod summarizer;
pub mod tokens;
pub mod window;

pub use summarizer::{MergePolicy, RecursiveSummarizer, Summary, SummarizerConfig};
pub use tokens::{BpeTokenizer, CharEstimateTokenizer, TokenCache, TokenCounter, Tokenizer};
pub use window::{ContextWindow, OverflowPolicy, SelectedWindow};
