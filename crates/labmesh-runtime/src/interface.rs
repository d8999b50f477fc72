//! [`DeviceInterface`] – client-side proxy of a device worker.
//!
//! Calls are blocking and strictly one at a time per interface.  A call that
//! does not get its reply within the timeout fails with
//! [`LabError::Connection`] and the request socket is reopened; the call is
//! not retried, because the worker may already have executed it.

use std::time::Duration;

use labmesh_middleware::{RequestChannel, Subscriber};
use labmesh_types::{Endpoint, Envelope, LabError, Map, Request, Response, StatusMap, Topic, Value};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// How long a call waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

pub struct DeviceInterface {
    endpoint: Endpoint,
    channel: RequestChannel,
    subscribers: Vec<Subscriber>,
}

impl DeviceInterface {
    /// Proxy for the worker at `endpoint`.  Nothing is connected until the
    /// first call or subscription.
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: Endpoint, timeout: Duration) -> Self {
        let channel = RequestChannel::new(endpoint.req_addr(), timeout);
        Self {
            endpoint,
            channel,
            subscribers: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.channel.timeout()
    }

    /// Call `method` with positional arguments.
    pub fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, LabError> {
        self.call_with(method, args, Map::new())
    }

    /// Call `method` with positional and keyword arguments.
    ///
    /// # Errors
    ///
    /// - [`LabError::Connection`] on timeout, transport failure or a reply
    ///   that does not belong to this request; the socket has been reset.
    /// - [`LabError::Remote`] when the worker answered with an error kind.
    pub fn call_with(&mut self, method: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, LabError> {
        let request = Request::rpc(method, args, kwargs);
        let response = self.exchange(&request)?;
        response.into_result(method)
    }

    /// Call `method` and deserialise its result.
    pub fn call_typed<T: DeserializeOwned>(&mut self, method: &str, args: Vec<Value>) -> Result<T, LabError> {
        let value = self.call(method, args)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fresh status snapshot, fetched over the request channel.
    pub fn status(&mut self) -> Result<StatusMap, LabError> {
        match self.call("status", Vec::new())? {
            Value::Object(map) => Ok(map),
            other => Err(LabError::Serialization(format!("status is not a map: {other}"))),
        }
    }

    /// Names of the worker's remote methods.
    pub fn remote_methods(&mut self) -> Result<Vec<String>, LabError> {
        self.call_typed("remote_methods", Vec::new())
    }

    /// Attach a subscriber thread to the worker's publish channel.
    /// `callback` runs on that thread, not on the caller's.
    pub fn subscribe<F>(&mut self, topics: &[Topic], callback: F) -> Result<(), LabError>
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let subscriber = Subscriber::spawn(self.endpoint.pub_addr(), topics, callback)?;
        self.subscribers.push(subscriber);
        Ok(())
    }

    /// Subscribe to STATUS snapshots only.
    pub fn subscribe_status<F>(&mut self, mut callback: F) -> Result<(), LabError>
    where
        F: FnMut(StatusMap) + Send + 'static,
    {
        self.subscribe(&[Topic::Status], move |envelope| match envelope.contents {
            Value::Object(map) => callback(map),
            other => debug!(%other, "ignoring non-map status"),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Close the request socket and stop every subscriber thread.  The
    /// interface stays usable; the next call reconnects.
    pub fn close(&mut self) {
        self.channel.close();
        for mut subscriber in self.subscribers.drain(..) {
            subscriber.stop();
        }
    }

    /// Ask the worker to quit, then [`close`](Self::close).
    ///
    /// Stopping a worker that is already gone reports one
    /// [`LabError::Connection`] and never blocks beyond the timeout.
    pub fn stop(&mut self) -> Result<(), LabError> {
        let outcome = self.exchange(&Request::quit()).map(|_| ());
        self.close();
        outcome
    }

    fn exchange(&mut self, request: &Request) -> Result<Response, LabError> {
        let line = request.encode()?;
        let reply = self.channel.roundtrip(&line)?;
        let response = match Response::decode(&reply) {
            Ok(response) => response,
            Err(e) => return Err(self.desynchronized(format!("malformed reply: {e}"))),
        };
        if let (Some(sent), Some(got)) = (request.id, response.id) {
            if sent != got {
                return Err(self.desynchronized(format!("reply {got} does not match request {sent}")));
            }
        }
        Ok(response)
    }

    fn desynchronized(&mut self, reason: String) -> LabError {
        warn!(endpoint = %self.endpoint, %reason, "request channel desynchronized; resetting");
        self.channel.reset();
        LabError::Connection {
            endpoint: self.endpoint.req_addr(),
            reason,
        }
    }
}

impl Drop for DeviceInterface {
    fn drop(&mut self) {
        self.close();
    }
}

/// Declare a typed proxy around a [`DeviceInterface`].
///
/// Each declared method becomes a blocking call of the remote method with
/// the same name: arguments are serialised positionally, the result is
/// deserialised into the declared return type.  The proxy derefs to its
/// [`DeviceInterface`], so `status`, `subscribe`, `close` and `stop` stay
/// available.
///
/// ```no_run
/// use labmesh_runtime::{remote_interface, Endpoint};
///
/// remote_interface! {
///     /// Client of the demo voltage source.
///     pub struct DemoClient {
///         fn set_voltage(volts: f64) -> serde_json::Value;
///         fn get_voltage() -> f64;
///     }
/// }
///
/// let mut demo = DemoClient::new(Endpoint::local(30001, 30002));
/// demo.set_voltage(1.5)?;
/// assert_eq!(demo.get_voltage()?, 1.5);
/// # Ok::<(), labmesh_runtime::LabError>(())
/// ```
#[macro_export]
macro_rules! remote_interface {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident ( $( $arg:ident : $arg_ty:ty ),* $(,)? ) -> $ret:ty ;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            inner: $crate::DeviceInterface,
        }

        impl $name {
            /// Remote methods this proxy knows about.
            pub const METHODS: &'static [&'static str] = &[$(stringify!($method)),*];

            pub fn new(endpoint: $crate::Endpoint) -> Self {
                Self::from_interface($crate::DeviceInterface::new(endpoint))
            }

            pub fn with_timeout(endpoint: $crate::Endpoint, timeout: ::std::time::Duration) -> Self {
                Self::from_interface($crate::DeviceInterface::with_timeout(endpoint, timeout))
            }

            pub fn from_interface(inner: $crate::DeviceInterface) -> Self {
                Self { inner }
            }

            pub fn interface(&mut self) -> &mut $crate::DeviceInterface {
                &mut self.inner
            }

            pub fn into_interface(self) -> $crate::DeviceInterface {
                self.inner
            }

            $(
                $(#[$method_meta])*
                pub fn $method(&mut self $(, $arg: $arg_ty)*) -> ::std::result::Result<$ret, $crate::LabError> {
                    let args: ::std::vec::Vec<$crate::Value> = ::std::vec![$($crate::serde_json::to_value(&$arg)?),*];
                    self.inner.call_typed(stringify!($method), args)
                }
            )*
        }

        impl ::std::ops::Deref for $name {
            type Target = $crate::DeviceInterface;

            fn deref(&self) -> &Self::Target {
                &self.inner
            }
        }

        impl ::std::ops::DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.inner
            }
        }
    };
}
