//! `labmesh-kernel` – concurrency primitives and bookkeeping
//!
//! Everything a device worker needs to keep its own state single-threaded
//! while still doing blocking work elsewhere.
//!
//! # Modules
//!
//! - [`signal`] – [`Poller`][signal::Poller] and
//!   [`SignalSender`][signal::SignalSender]: the one-way wakeup channel
//!   through which every background thread hands control (and an optional
//!   payload) back to the owning event loop.
//! - [`timer`] – [`Timer`][timer::Timer]: a bare periodic wakeup.
//! - [`periodic`] – [`PeriodicTask`][periodic::PeriodicTask]: runs a job at a
//!   fixed cadence on its own thread and delivers each result; resynchronises
//!   instead of drifting when it falls behind.
//! - [`background`] – [`BackgroundTask`][background::BackgroundTask]: a
//!   one-shot job whose outcome (or panic) is delivered exactly once.
//! - [`capability`] – [`MethodTable`][capability::MethodTable]: the explicit
//!   table of remotely callable methods checked at dispatch time, and
//!   [`CallArgs`][capability::CallArgs].
//! - [`host_table`] – [`HostTable`][host_table::HostTable]: peer hosts with
//!   staleness derived from the last announcement.
//! - [`port_pool`] – [`PortPool`][port_pool::PortPool]: the used-port set.
//!
//! Every primitive that owns a thread stops synchronously: `stop()` (and
//! `Drop`) return only after the thread has exited.

use std::any::Any;
use std::time::Duration;

use labmesh_types::LabError;

pub mod background;
pub mod capability;
pub mod host_table;
pub mod periodic;
pub mod port_pool;
pub mod signal;
pub mod timer;

pub use background::BackgroundTask;
pub use capability::{CallArgs, MethodTable, RemoteMethod};
pub use host_table::{HostRecord, HostTable, Observed};
pub use periodic::PeriodicTask;
pub use port_pool::PortPool;
pub use signal::{Payload, Poller, Signal, SignalSender, SourceId};
pub use timer::Timer;

/// Reject a zero cadence; a scheduler thread would never sleep on one.
pub fn check_period(name: &str, period: Duration) -> Result<(), LabError> {
    if period.is_zero() {
        return Err(LabError::InvalidArgument {
            name: name.to_string(),
            details: "period must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let caught = std::panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static text");

        let caught = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "formatted 7");
    }

    #[test]
    fn periods_must_be_positive() {
        assert!(check_period("refresh_period", Duration::from_millis(1)).is_ok());
        match check_period("refresh_period", Duration::ZERO) {
            Err(LabError::InvalidArgument { name, .. }) => assert_eq!(name, "refresh_period"),
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }
}
