//! [`Timer`] – a periodic wakeup on a private thread.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use labmesh_types::LabError;
use tracing::error;

use crate::signal::{SignalSender, SourceId};

/// Fires a [`Payload::Tick`][crate::Payload::Tick] on its signal every
/// `period` until stopped.
///
/// Ticks are scheduled against a fixed grid (`start + n * period`); a tick
/// that would land in the past is skipped rather than fired late in a burst.
pub struct Timer {
    period: Duration,
    source: SourceId,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    /// Start firing every `period`.  The first tick comes one period after
    /// the call.
    ///
    /// # Errors
    ///
    /// [`LabError::InvalidArgument`] for a zero period.
    pub fn start(period: Duration, signal: SignalSender) -> Result<Self, LabError> {
        crate::check_period("period", period)?;
        let source = signal.source();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name(format!("labmesh-timer-{}", source.get()))
            .spawn(move || {
                let mut next = Instant::now() + period;
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    if !signal.notify() {
                        break;
                    }
                    next += period;
                    let now = Instant::now();
                    while next <= now {
                        next += period;
                    }
                }
            })?;
        Ok(Self {
            period,
            source,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the timer and wait for its thread to exit.  Idempotent.
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(source = %self.source, "timer thread panicked");
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
