//! Blocking consumer for one streamed completion.
//!
//! The provider runs on its own worker thread and forwards lifecycle events
//! over a channel. The consumer polls that channel in short slices so a raised
//! cancel flag ends consumption promptly even when the provider is stuck in a
//! network read.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use agent_provider::{
    CancelSignal, CompletionProvider, CompletionRequest, StreamEvent, TransportError,
};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Why a completion stream stopped yielding fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTermination {
    Completed,
    Cancelled,
    Failed(TransportError),
}

/// Lazy, finite, non-restartable sequence of text fragments.
pub struct CompletionStream {
    receiver: Receiver<StreamEvent>,
    cancel: CancelSignal,
    worker: Option<JoinHandle<()>>,
    termination: Option<StreamTermination>,
}

impl CompletionStream {
    /// Starts `request` on a dedicated worker thread.
    pub fn start(
        provider: Arc<dyn CompletionProvider>,
        request: CompletionRequest,
        cancel: CancelSignal,
    ) -> Result<Self, TransportError> {
        let (sender, receiver) = mpsc::channel();
        let worker_cancel = Arc::clone(&cancel);
        let provider_id = provider.profile().provider_id;

        let worker = thread::Builder::new()
            .name(format!("halp-completion-{provider_id}"))
            .spawn(move || {
                let terminal_emitted = AtomicBool::new(false);
                let mut emit = |event: StreamEvent| {
                    if event.is_terminal() {
                        terminal_emitted.store(true, Ordering::SeqCst);
                    }
                    let _ = sender.send(event);
                };

                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    provider.stream(request, worker_cancel, &mut emit)
                }));

                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(error)) => Some(error),
                    Err(_) => Some("Completion provider panicked".to_string()),
                };

                if let Some(error) = failure {
                    emit(StreamEvent::Failed {
                        error: TransportError::new(error),
                    });
                } else if !terminal_emitted.load(Ordering::SeqCst) {
                    emit(StreamEvent::Failed {
                        error: TransportError::new(
                            "Completion provider exited without terminal event",
                        ),
                    });
                }
            })
            .map_err(|error| {
                TransportError::new(format!("Failed to spawn completion worker: {error}"))
            })?;

        Ok(Self {
            receiver,
            cancel,
            worker: Some(worker),
            termination: None,
        })
    }

    /// Termination reason once the sequence has ended.
    pub fn termination(&self) -> Option<&StreamTermination> {
        self.termination.as_ref()
    }

    /// Drains any remaining fragments and returns how the stream ended.
    pub fn into_termination(mut self) -> StreamTermination {
        while self.next().is_some() {}
        self.termination
            .take()
            .unwrap_or(StreamTermination::Cancelled)
    }

    fn finish(&mut self, termination: StreamTermination) {
        debug!(?termination, "completion stream ended");
        self.termination = Some(termination);
    }
}

impl Iterator for CompletionStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if self.termination.is_some() {
                return None;
            }

            if self.cancel.load(Ordering::SeqCst) {
                self.finish(StreamTermination::Cancelled);
                return None;
            }

            match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(StreamEvent::Started) | Err(RecvTimeoutError::Timeout) => {}
                Ok(StreamEvent::Chunk { text }) => {
                    if !text.is_empty() {
                        return Some(text);
                    }
                }
                Ok(StreamEvent::Finished) => self.finish(StreamTermination::Completed),
                Ok(StreamEvent::Cancelled) => self.finish(StreamTermination::Cancelled),
                Ok(StreamEvent::Failed { error }) => {
                    self.finish(StreamTermination::Failed(error));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.finish(StreamTermination::Failed(TransportError::new(
                        "Completion worker exited without terminal event",
                    )));
                }
            }
        }
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        // A provider ignoring cancellation may still be blocked; leave it detached.
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use agent_provider::{ChatMessage, ProviderProfile};
    use agent_provider_mock::{ScriptedProvider, ScriptedReply};

    use super::*;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "mock-model".to_string(),
            messages: vec![ChatMessage::user("hi")],
        }
    }

    fn start(provider: impl CompletionProvider, cancel: &CancelSignal) -> CompletionStream {
        CompletionStream::start(Arc::new(provider), request(), Arc::clone(cancel))
            .expect("worker should spawn")
    }

    #[test]
    fn fragments_arrive_in_order_then_complete() {
        let cancel = CancelSignal::default();
        let mut stream = start(ScriptedProvider::from_texts(["hello big world"]), &cancel);

        let fragments: Vec<String> = stream.by_ref().collect();
        assert_eq!(fragments.concat(), "hello big world");
        assert!(fragments.len() > 1);
        assert_eq!(stream.termination(), Some(&StreamTermination::Completed));
    }

    #[test]
    fn transport_failure_keeps_status() {
        let cancel = CancelSignal::default();
        let stream = start(
            ScriptedProvider::new([ScriptedReply::Fail(TransportError::with_status(
                503,
                "overloaded",
            ))]),
            &cancel,
        );

        assert_eq!(
            stream.into_termination(),
            StreamTermination::Failed(TransportError::with_status(503, "overloaded"))
        );
    }

    #[test]
    fn missing_terminal_event_is_a_failure() {
        let cancel = CancelSignal::default();
        let mut stream = start(
            ScriptedProvider::new([ScriptedReply::Truncated("partial ".to_string())]),
            &cancel,
        );

        assert_eq!(stream.next().as_deref(), Some("partial "));
        assert!(matches!(
            stream.into_termination(),
            StreamTermination::Failed(_)
        ));
    }

    struct PanickingProvider;

    impl CompletionProvider for PanickingProvider {
        fn profile(&self) -> ProviderProfile {
            ProviderProfile {
                provider_id: "panicking".to_string(),
                model_id: "none".to_string(),
            }
        }

        fn stream(
            &self,
            _req: CompletionRequest,
            _cancel: CancelSignal,
            _emit: &mut dyn FnMut(StreamEvent),
        ) -> Result<(), String> {
            panic!("provider bug");
        }
    }

    #[test]
    fn provider_panic_is_a_failure() {
        let cancel = CancelSignal::default();
        let stream = start(PanickingProvider, &cancel);

        assert_eq!(
            stream.into_termination(),
            StreamTermination::Failed(TransportError::new("Completion provider panicked"))
        );
    }

    #[test]
    fn cancellation_is_bounded_when_provider_ignores_it() {
        let cancel = CancelSignal::default();
        let mut stream = start(
            ScriptedProvider::new([ScriptedReply::StallIgnoringCancel(
                "thinking ".to_string(),
                Duration::from_secs(5),
            )]),
            &cancel,
        );

        assert_eq!(stream.next().as_deref(), Some("thinking "));
        let started = Instant::now();
        cancel.store(true, Ordering::SeqCst);

        assert_eq!(stream.next(), None);
        assert_eq!(stream.termination(), Some(&StreamTermination::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
