//! `labmesh-types` – shared vocabulary of the device mesh.
//!
//! Every crate in the workspace speaks in these types: the addressing triple
//! of a worker ([`Endpoint`]), the schema-less status snapshot
//! ([`StatusMap`]), the wire envelopes in [`wire`], the reversible numeric
//! array codec in [`array`] and the single error type [`LabError`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod array;
pub mod wire;

pub use array::{ArrayElement, NumericArray};
pub use serde_json::{Map, Value};
pub use uuid::Uuid;
pub use wire::{Envelope, ErrorKind, Request, RequestKind, Response, Topic};

/// Status snapshot produced by a worker's `status()`: field name → value.
pub type StatusMap = Map<String, Value>;

/// Address of a device worker.  A device is reachable only through this
/// triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub req_port: u16,
    pub pub_port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, req_port: u16, pub_port: u16) -> Self {
        Self {
            host: host.into(),
            req_port,
            pub_port,
        }
    }

    /// Endpoint on the loopback interface.
    pub fn local(req_port: u16, pub_port: u16) -> Self {
        Self::new("127.0.0.1", req_port, pub_port)
    }

    /// `host:req_port`, the request/reply channel.
    pub fn req_addr(&self) -> String {
        format!("{}:{}", self.host, self.req_port)
    }

    /// `host:pub_port`, the publish channel.
    pub fn pub_addr(&self) -> String {
        format!("{}:{}", self.host, self.pub_port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.req_port, self.pub_port)
    }
}

/// A device process as advertised by an orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub device_type: String,
    pub host: String,
    pub req_port: u16,
    pub pub_port: u16,
}

/// A peer host as reported by `get_hosts()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub address: String,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

/// Error type shared by every labmesh crate.
#[derive(Error, Debug)]
pub enum LabError {
    /// Transport failure: timeout, refused connection, desynchronized reply.
    #[error("No connection to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// The worker answered with a non-`none` error kind.
    #[error("Remote call `{method}` failed ({kind}): {message}")]
    Remote {
        method: String,
        kind: ErrorKind,
        message: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid argument `{name}`: {details}")]
    InvalidArgument { name: String, details: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown device type: {0}")]
    UnknownDeviceType(String),

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("No free port left in {low}..{high}")]
    PortsExhausted { low: u16, high: u16 },

    #[error("Failed to spawn worker `{device_type}`: {details}")]
    Spawn { device_type: String, details: String },

    /// Application failure raised by a device method.
    #[error("Device fault on {component}: {details}")]
    Device { component: String, details: String },

    /// Error half of a background job's result.
    #[error("Background task failed: {0}")]
    Background(String),
}

impl LabError {
    /// Convenience constructor for [`LabError::Device`].
    pub fn device(component: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Device {
            component: component.into(),
            details: details.into(),
        }
    }

    /// `true` for transport failures the caller may retry after the proxy
    /// has reset its socket.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

impl From<serde_json::Error> for LabError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
