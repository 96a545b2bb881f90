//! Convenience re-exports for common `parley-rs` types.
//!
//! ```ignore
//! use parley_rs::prelude::*;
//! ```
//!
//! Pulls in what most programs need to run a conversation or summarize a
//! document. Diagnostics types (retry classification helpers, token cache
//! internals) stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ChatCompletion, ChatRequest, Error, ErrorKind, FunctionCall, FunctionDef, Hyperparameters,
    Message, MessageRole, RequestError,
};

// ── Transport ───────────────────────────────────────────────────────
pub use crate::api::{ChatBackend, ResilientClient, RetryConfig};
pub use crate::config::{ClientConfig, ModelProfile};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    ContextWindow, MergePolicy, OverflowPolicy, RecursiveSummarizer, SummarizerConfig,
    TokenCounter,
};

// ── Sessions ────────────────────────────────────────────────────────
pub use crate::events::{
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler, SessionEvent,
};
pub use crate::session::{ChatSession, ConversationState, Exchange, UsageTracker};
