//! [`PeriodicTask`] – a job run at a fixed cadence off the event loop.
//!
//! The job runs on the task's own thread; each result is moved to the owner
//! through the signal channel.  When an iteration finishes after the next
//! one was due, the task logs that it is falling behind and re-anchors its
//! schedule to the current instant, so a slow job never builds up a backlog
//! of immediate re-runs.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use labmesh_types::LabError;
use tracing::{error, warn};

use crate::panic_message;
use crate::signal::{SignalSender, SourceId};

pub struct PeriodicTask {
    period: Duration,
    source: SourceId,
    overruns: Arc<AtomicU64>,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Run `job` immediately and then every `period`, delivering each
    /// returned `T` on `signal`.
    ///
    /// A panicking iteration is logged and skipped; the schedule continues.
    /// A zero period is rejected with [`LabError::InvalidArgument`].
    pub fn start<T, F>(period: Duration, mut job: F, signal: SignalSender) -> Result<Self, LabError>
    where
        T: Send + 'static,
        F: FnMut() -> T + Send + 'static,
    {
        crate::check_period("period", period)?;
        let source = signal.source();
        let overruns = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&overruns);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name(format!("labmesh-periodic-{}", source.get()))
            .spawn(move || {
                let mut next = Instant::now();
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }

                    match catch_unwind(AssertUnwindSafe(&mut job)) {
                        Ok(value) => {
                            if !signal.deliver(value) {
                                break;
                            }
                        }
                        Err(panic) => {
                            error!(source = %source, panic = %panic_message(panic.as_ref()), "periodic job panicked");
                        }
                    }

                    next += period;
                    let now = Instant::now();
                    if now > next {
                        counter.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            source = %source,
                            period_ms = period.as_millis() as u64,
                            overrun_ms = (now - next).as_millis() as u64,
                            "periodic task falling behind"
                        );
                        next = now;
                    }
                }
            })?;

        Ok(Self {
            period,
            source,
            overruns,
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

    /// How many times the schedule had to be re-anchored.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop scheduling and wait for the thread to exit.  An iteration that
    /// is already running is allowed to finish first.
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(source = %self.source, "periodic task thread panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Poller;

    fn drain<T: 'static>(poller: &mut Poller) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(signal) = poller.try_recv() {
            if let Ok(v) = signal.payload.downcast::<T>() {
                out.push(v);
            }
        }
        out
    }

    #[test]
    fn delivers_each_result_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let mut poller = Poller::new();
        let mut n = 0u32;
        let mut task = PeriodicTask::start(
            Duration::from_millis(10),
            move || {
                n += 1;
                n
            },
            poller.register(),
        )?;
        std::thread::sleep(Duration::from_millis(80));
        task.stop();

        let values = drain::<u32>(&mut poller);
        assert!(values.len() >= 3, "got {values:?}");
        assert_eq!(values, (1..=values.len() as u32).collect::<Vec<_>>());
        assert_eq!(task.overruns(), 0);
        Ok(())
    }

    #[test]
    fn zero_period_is_rejected_before_the_job_runs() {
        let mut poller = Poller::new();
        let ran = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ran);
        let started = PeriodicTask::start(
            Duration::ZERO,
            move || counter.fetch_add(1, Ordering::Relaxed),
            poller.register(),
        );
        assert!(matches!(started.err(), Some(LabError::InvalidArgument { .. })));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn slow_job_resynchronises_instead_of_bursting() -> Result<(), Box<dyn std::error::Error>> {
        let mut poller = Poller::new();
        let mut task = PeriodicTask::start(
            Duration::from_millis(10),
            || {
                std::thread::sleep(Duration::from_millis(30));
                Instant::now()
            },
            poller.register(),
        )?;
        std::thread::sleep(Duration::from_millis(200));
        task.stop();

        assert!(task.overruns() >= 2);
        let stamps = drain::<Instant>(&mut poller);
        // After a resync the next run starts right away but never twice
        // without the job's own duration in between.
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(25));
        }
        Ok(())
    }

    #[test]
    fn panicking_iteration_does_not_end_the_schedule() -> Result<(), Box<dyn std::error::Error>> {
        let mut poller = Poller::new();
        let mut calls = 0u32;
        let mut task = PeriodicTask::start(
            Duration::from_millis(5),
            move || {
                calls += 1;
                if calls == 1 {
                    panic!("first iteration");
                }
                calls
            },
            poller.register(),
        )?;
        std::thread::sleep(Duration::from_millis(60));
        task.stop();
        let values = drain::<u32>(&mut poller);
        assert_eq!(values.first(), Some(&2));
        Ok(())
    }

    #[test]
    fn stop_waits_for_the_thread() -> Result<(), Box<dyn std::error::Error>> {
        let mut poller = Poller::new();
        let mut task = PeriodicTask::start(Duration::from_secs(60), || (), poller.register())?;
        task.stop();
        assert!(!task.is_running());
        Ok(())
    }
}
