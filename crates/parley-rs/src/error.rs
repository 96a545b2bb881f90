//! Error taxonomy for conversation rounds and upstream requests.
//!
//! Upstream failures are classified once, at the transport boundary, into an
//! [`ErrorKind`]. Only [`ErrorKind::Transient`] failures are retried, and
//! retries never leave [`ResilientClient`](crate::api::client::ResilientClient).
//! Everything else propagates to the caller of
//! [`ChatSession::chat_round`](crate::session::ChatSession::chat_round) or
//! [`RecursiveSummarizer::summarize`](crate::context::summarizer::RecursiveSummarizer::summarize)
//! with enough structure to decide between "tell the user to try again" and
//! "page an operator".

use std::fmt;
use thiserror::Error;

/// Classification of an upstream request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeout, connection failure, HTTP 429 or 5xx. Retried.
    Transient,
    /// HTTP 4xx other than 429, or an API-level error object. Not retried.
    Permanent,
    /// The response body did not match the expected structure. Not retried.
    Decode,
}

impl ErrorKind {
    /// Whether a failure of this kind should be retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::Decode => write!(f, "decode"),
        }
    }
}

/// A classified failure from the completion API.
#[derive(Debug, Clone, Error)]
#[error("{kind} request error after {attempts} attempt(s): {detail}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub detail: String,
    /// HTTP status of the last attempt, if a response was received.
    pub status: Option<u16>,
    /// Raw response body. Always set for [`ErrorKind::Decode`].
    pub raw_body: Option<String>,
    /// Number of attempts made before giving up.
    pub attempts: u32,
}

impl RequestError {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, detail)
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, detail)
    }

    pub fn decode(detail: impl Into<String>, raw_body: impl Into<String>) -> Self {
        Self {
            raw_body: Some(raw_body.into()),
            ..Self::new(ErrorKind::Decode, detail)
        }
    }

    fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            status: None,
            raw_body: None,
            attempts: 1,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.raw_body = Some(body.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Top-level error for the context manager.
#[derive(Debug, Error)]
pub enum Error {
    /// The upstream request failed (after retries, if the failure was transient).
    #[error(transparent)]
    Request(#[from] RequestError),

    /// No tokenizer could be loaded, not even the default encoding.
    /// Only raised while constructing a [`TokenCounter`](crate::context::TokenCounter).
    #[error("failed to load tokenizer: {0}")]
    Tokenizer(String),

    /// The newest user message alone does not fit the context window.
    #[error("message needs {tokens} tokens but only {available} are available in the context window")]
    InputExceedsBudget { tokens: usize, available: i64 },

    /// A selected window exceeded its budget. This is a logic error; callers
    /// should treat it as fatal rather than retrying.
    #[error("context window used {used} tokens, exceeding the budget of {budget}")]
    BudgetInvariant { used: usize, budget: usize },

    /// Recursive summarization hit its depth limit without the chunks fitting.
    #[error("summarization exceeded the maximum split depth of {depth}")]
    SummaryDepthExceeded { depth: usize },
}

impl Error {
    /// The request classification, if this error came from the upstream API.
    pub fn request_kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Request(e) => Some(e.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::Decode.is_retryable());
    }

    #[test]
    fn decode_error_keeps_raw_body() {
        let err = RequestError::decode("missing field `choices`", "<html>oops</html>");
        assert_eq!(err.kind, ErrorKind::Decode);
        assert_eq!(err.raw_body.as_deref(), Some("<html>oops</html>"));
    }

    #[test]
    fn display_includes_kind_and_attempts() {
        let mut err = RequestError::transient("HTTP 503").with_status(503);
        err.attempts = 5;
        let text = err.to_string();
        assert!(text.contains("transient"));
        assert!(text.contains("5 attempt(s)"));
        assert!(text.contains("HTTP 503"));
    }

    #[test]
    fn request_kind_passes_through() {
        let err: Error = RequestError::permanent("HTTP 400").into();
        assert_eq!(err.request_kind(), Some(ErrorKind::Permanent));
        let err = Error::SummaryDepthExceeded { depth: 3 };
        assert_eq!(err.request_kind(), None);
    }
}
