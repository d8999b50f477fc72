//! `labmesh-runtime` – device workers, their clients and the orchestrator
//!
//! # Modules
//!
//! - [`worker`] – [`DeviceWorker`]: the actor that owns one device, serves
//!   its remote methods, publishes its status and runs timers and background
//!   jobs from a single event loop.  Device types implement [`Device`].
//! - [`interface`] – [`DeviceInterface`]: the blocking client proxy, plus
//!   the [`remote_interface!`] macro that declares typed proxies.
//! - [`capture`] – [`OutputCapture`][capture::OutputCapture]: collects the
//!   log lines a worker publishes on its stdout/stderr topics.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP export.
//! - [`orchestrator`] – [`Orchestrator`][orchestrator::Orchestrator]: the
//!   per-host device-of-devices that discovers peers and starts, stops and
//!   lists workers across the mesh.

pub mod capture;
pub mod interface;
pub mod orchestrator;
pub mod telemetry;
pub mod worker;

pub use interface::{DEFAULT_REQUEST_TIMEOUT, DeviceInterface};
pub use labmesh_kernel::{CallArgs, MethodTable, check_period};
pub use labmesh_types::{
    DeviceInfo, Endpoint, Envelope, HostInfo, LabError, Map, NumericArray, StatusMap, Topic, Value,
};
pub use orchestrator::{Orchestrator, OrchestratorClient, OrchestratorConfig};
pub use worker::{Device, DeviceWorker, Methods, ShutdownHandle, WorkerConfig, WorkerContext, WorkerState};

// Used by `remote_interface!` expansions.
#[doc(hidden)]
pub use serde_json;
