//! API interaction layer: the resilient HTTP client and its retry policy.
//!
//! - [`client`]: [`ResilientClient`] sends requests with bearer auth,
//!   classifies failures, and decodes chat completions. [`ChatBackend`] is
//!   the trait the rest of the crate depends on.
//! - [`retry`]: failure classification (429/5xx/timeouts are transient,
//!   other 4xx and undecodable bodies are permanent) and exponential backoff.
//!   Never retries a permanent failure.

pub mod client;
pub mod retry;

pub use client::{ChatBackend, CompletionFuture, ResilientClient};
pub use retry::RetryConfig;
