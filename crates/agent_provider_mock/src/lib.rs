//! Deterministic scripted implementation of the shared `agent_provider` contract.
//!
//! Each call to [`CompletionProvider::stream`] consumes the next scripted
//! reply. The crate contains no transport logic and exists for contract-level
//! testing of the agent loop.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use agent_provider::{
    CancelSignal, CompletionProvider, CompletionRequest, ProviderProfile, StreamEvent,
    TransportError,
};

/// Stable provider identifier for the scripted provider.
pub const MOCK_PROVIDER_ID: &str = "mock";

/// Model identifier reported by [`ScriptedProvider::profile`].
pub const MOCK_MODEL_ID: &str = "mock-model";

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// One scripted answer to a completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Streams the text split on whitespace boundaries, then finishes.
    Text(String),
    /// Fails with the given transport error before streaming anything.
    Fail(TransportError),
    /// Streams the text, then waits until the cancel signal is raised.
    StallUntilCancelled(String),
    /// Streams the text, then blocks for the duration ignoring cancellation.
    StallIgnoringCancel(String, Duration),
    /// Returns from `stream` without emitting a terminal event.
    Truncated(String),
}

impl ScriptedReply {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

/// Scripted provider that records every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    token_delay: Duration,
}

impl ScriptedProvider {
    #[must_use]
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            token_delay: Duration::ZERO,
        }
    }

    /// Builds a provider whose replies are all plain text.
    #[must_use]
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(|text| ScriptedReply::Text(text.into())))
    }

    /// Sleeps between emitted chunks to simulate a slow network.
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Returns every request received so far, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        lock_unpoisoned(&self.requests).len()
    }

    #[must_use]
    pub fn remaining_replies(&self) -> usize {
        lock_unpoisoned(&self.replies).len()
    }

    fn emit_text(
        &self,
        text: &str,
        cancel: &CancelSignal,
        emit: &mut dyn FnMut(StreamEvent),
    ) -> bool {
        let mut pending_token = String::new();
        for ch in text.chars() {
            pending_token.push(ch);

            if matches!(ch, ' ' | '\n') {
                if cancel.load(Ordering::SeqCst) {
                    return false;
                }
                emit(StreamEvent::Chunk {
                    text: std::mem::take(&mut pending_token),
                });
                if !self.token_delay.is_zero() {
                    thread::sleep(self.token_delay);
                }
            }
        }

        if !pending_token.is_empty() {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
            emit(StreamEvent::Chunk {
                text: pending_token,
            });
        }

        true
    }
}

impl CompletionProvider for ScriptedProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: MOCK_PROVIDER_ID.to_string(),
            model_id: MOCK_MODEL_ID.to_string(),
        }
    }

    fn stream(
        &self,
        req: CompletionRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(StreamEvent),
    ) -> Result<(), String> {
        lock_unpoisoned(&self.requests).push(req);
        let reply = lock_unpoisoned(&self.replies).pop_front();

        emit(StreamEvent::Started);

        let Some(reply) = reply else {
            emit(StreamEvent::Failed {
                error: TransportError::new("scripted provider has no replies left"),
            });
            return Ok(());
        };

        match reply {
            ScriptedReply::Text(text) => {
                if self.emit_text(&text, &cancel, emit) {
                    emit(StreamEvent::Finished);
                } else {
                    emit(StreamEvent::Cancelled);
                }
            }
            ScriptedReply::Fail(error) => emit(StreamEvent::Failed { error }),
            ScriptedReply::StallUntilCancelled(text) => {
                self.emit_text(&text, &cancel, emit);
                while !cancel.load(Ordering::SeqCst) {
                    thread::sleep(CANCEL_POLL_INTERVAL);
                }
                emit(StreamEvent::Cancelled);
            }
            ScriptedReply::StallIgnoringCancel(text, duration) => {
                self.emit_text(&text, &cancel, emit);
                thread::sleep(duration);
                emit(StreamEvent::Finished);
            }
            ScriptedReply::Truncated(text) => {
                self.emit_text(&text, &cancel, emit);
            }
        }

        Ok(())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
