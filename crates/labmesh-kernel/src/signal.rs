//! The signal channel.
//!
//! A [`Poller`] is owned by exactly one event loop.  Each background
//! primitive gets a [`SignalSender`] bound to a fresh [`SourceId`] and uses
//! it to wake the loop, optionally handing over a value.  Values are moved,
//! never copied or serialised, and the loop is the only reader.

use std::any::Any;
use std::fmt;

use tokio::sync::mpsc;

/// Identifies the primitive a [`Signal`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a signal carries.
pub enum Payload {
    /// Bare wakeup (timers).
    Tick,
    /// A value produced off-thread.
    Value(Box<dyn Any + Send>),
}

impl Payload {
    /// Take the carried value as `T`.  Returns the payload unchanged when it
    /// is a [`Payload::Tick`] or holds another type.
    pub fn downcast<T: 'static>(self) -> Result<T, Payload> {
        match self {
            Payload::Value(boxed) => boxed.downcast::<T>().map(|b| *b).map_err(Payload::Value),
            tick => Err(tick),
        }
    }

    pub fn is_tick(&self) -> bool {
        matches!(self, Payload::Tick)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Tick => f.write_str("Tick"),
            Payload::Value(_) => f.write_str("Value(..)"),
        }
    }
}

/// One readiness event.
#[derive(Debug)]
pub struct Signal {
    pub source: SourceId,
    pub payload: Payload,
}

/// Sending half handed to a background primitive.
#[derive(Clone)]
pub struct SignalSender {
    source: SourceId,
    tx: mpsc::UnboundedSender<Signal>,
}

impl SignalSender {
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Wake the owner.  Returns `false` once the owner's [`Poller`] is gone.
    pub fn notify(&self) -> bool {
        self.send(Payload::Tick)
    }

    /// Hand `value` to the owner.  Returns `false` once the owner's
    /// [`Poller`] is gone.
    pub fn deliver<T: Send + 'static>(&self, value: T) -> bool {
        self.send(Payload::Value(Box::new(value)))
    }

    fn send(&self, payload: Payload) -> bool {
        self.tx
            .send(Signal {
                source: self.source,
                payload,
            })
            .is_ok()
    }
}

/// Receiving half, owned by the event loop.
pub struct Poller {
    tx: mpsc::UnboundedSender<Signal>,
    rx: mpsc::UnboundedReceiver<Signal>,
    next_id: u64,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx, next_id: 1 }
    }

    /// Allocate a new source and return its sender.
    pub fn register(&mut self) -> SignalSender {
        let source = SourceId(self.next_id);
        self.next_id += 1;
        SignalSender {
            source,
            tx: self.tx.clone(),
        }
    }

    /// Wait for the next signal from any source.
    ///
    /// The poller keeps a sender of its own, so this only ever returns
    /// `None` if the channel is closed from the outside, which cannot
    /// happen; callers bound the wait with their own timeout.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }

    /// Take a signal that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }

    /// Block the current (non-async) thread until a signal arrives.
    pub fn recv_blocking(&mut self) -> Option<Signal> {
        self.rx.blocking_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_are_distinct() {
        let mut poller = Poller::new();
        let a = poller.register();
        let b = poller.register();
        assert_ne!(a.source(), b.source());
    }

    #[test]
    fn value_is_moved_to_the_owner() -> Result<(), Box<dyn std::error::Error>> {
        let mut poller = Poller::new();
        let sender = poller.register();
        let source = sender.source();

        std::thread::spawn(move || {
            sender.deliver(vec![1u32, 2, 3]);
        })
        .join()
        .map_err(|_| "sender thread panicked")?;

        let signal = poller.try_recv().ok_or("no signal queued")?;
        assert_eq!(signal.source, source);
        let value = signal.payload.downcast::<Vec<u32>>().map_err(|_| "wrong payload")?;
        assert_eq!(value, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn downcast_to_wrong_type_keeps_the_payload() {
        let payload = Payload::Value(Box::new(5i32));
        let back = payload.downcast::<String>().unwrap_err();
        assert_eq!(back.downcast::<i32>().ok(), Some(5));
        assert!(Payload::Tick.downcast::<i32>().unwrap_err().is_tick());
    }

    #[test]
    fn sender_reports_a_dropped_poller() {
        let mut poller = Poller::new();
        let sender = poller.register();
        drop(poller);
        assert!(!sender.notify());
    }
}
