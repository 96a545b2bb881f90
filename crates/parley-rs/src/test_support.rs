//! In-memory [`ChatBackend`] for unit tests.

use crate::api::client::{ChatBackend, CompletionFuture};
use crate::{ChatCompletion, ChatRequest, Message, RequestError, RequestOutcome};
use std::collections::VecDeque;
use std::sync::Mutex;

type Responder = Box<dyn Fn(&ChatRequest) -> RequestOutcome + Send + Sync>;

/// Plays back queued outcomes, then falls through to a responder (or a
/// permanent error when there is none). Every request is recorded.
pub(crate) struct ScriptedBackend {
    outcomes: Mutex<VecDeque<RequestOutcome>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new(outcomes: impl IntoIterator<Item = RequestOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            responder: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn responding(
        responder: impl Fn(&ChatRequest) -> RequestOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new([])
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ChatBackend for ScriptedBackend {
    fn complete<'a>(&'a self, request: &'a ChatRequest) -> CompletionFuture<'a> {
        self.requests.lock().unwrap().push(request.clone());
        let queued = self.outcomes.lock().unwrap().pop_front();
        let outcome = match (queued, &self.responder) {
            (Some(outcome), _) => outcome,
            (None, Some(responder)) => responder(request),
            (None, None) => Err(RequestError::permanent("script exhausted")),
        };
        Box::pin(async move { outcome })
    }
}

/// A successful completion replying `text`.
pub(crate) fn reply(text: &str, prompt_tokens: u32, completion_tokens: u32) -> RequestOutcome {
    Ok(ChatCompletion {
        message: Message::assistant(text),
        prompt_tokens,
        completion_tokens,
        finish_reason: Some("stop".into()),
    })
}
