//! Ctrl-C handling.
//!
//! The first SIGINT/SIGTERM raises the shared cancel flag so the agent can
//! unwind to a clean `Cancelled` state. A second one exits immediately.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use agent_provider::CancelSignal;
use signal_hook::iterator::{Handle, Signals};
use tracing::debug;

use crate::agent::ExitStatus;

/// Keeps the signal watcher alive; dropping it stops watching.
pub struct InterruptGuard {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl InterruptGuard {
    pub fn install(cancel: CancelSignal) -> io::Result<Self> {
        let mut signals = Signals::new([libc::SIGINT, libc::SIGTERM])?;
        let handle = signals.handle();
        let received = AtomicUsize::new(0);

        let thread = thread::Builder::new()
            .name("halp-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    let count = received.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(signal, count, "interrupt received");
                    cancel.store(true, Ordering::SeqCst);
                    if count > 1 {
                        std::process::exit(i32::from(ExitStatus::Cancelled.code()));
                    }
                }
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
