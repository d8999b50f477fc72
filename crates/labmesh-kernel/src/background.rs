//! [`BackgroundTask`] – one-shot job off the event loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};

use labmesh_types::LabError;
use tracing::{debug, error};

use crate::panic_message;
use crate::signal::{SignalSender, SourceId};

/// Runs a job once and delivers its `Result<T, LabError>` on the signal.
///
/// A panic inside the job becomes [`LabError::Background`]; nothing is ever
/// re-raised on the owner's thread.  The owner discards the task once the
/// result has been handled.
pub struct BackgroundTask {
    source: SourceId,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    pub fn spawn<T, F>(job: F, signal: SignalSender) -> Result<Self, LabError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, LabError> + Send + 'static,
    {
        let source = signal.source();
        let thread = thread::Builder::new()
            .name(format!("labmesh-bg-{}", source.get()))
            .spawn(move || {
                let outcome = match catch_unwind(AssertUnwindSafe(job)) {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(source = %source, panic = %message, "background job panicked");
                        Err(LabError::Background(message))
                    }
                };
                if !signal.deliver(outcome) {
                    debug!(source = %source, "background result dropped; owner is gone");
                }
            })?;
        Ok(Self {
            source,
            thread: Some(thread),
        })
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Wait for the job's thread to exit.  Idempotent.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(source = %self.source, "background thread panicked");
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.join();
    }
}
