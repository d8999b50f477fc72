//! [`Orchestrator`] – the per-host device of devices.
//!
//! An orchestrator is an ordinary [`Device`] hosted by a [`DeviceWorker`] on
//! the well-known server ports.  It
//!
//! - announces its hostname over UDP and learns about peer orchestrators
//!   the same way ([`discovery`]);
//! - subscribes to every peer's STATUS feed, where peers advertise the
//!   devices they run;
//! - starts and stops device workers on request, locally through a
//!   [`WorkerLauncher`] or by forwarding the call to the peer that owns the
//!   target host.
//!
//! All of its state lives in a [`Registry`] touched only by the worker's
//! event loop.
//!
//! [`DeviceWorker`]: crate::worker::DeviceWorker

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use labmesh_kernel::{CallArgs, Observed, PortPool, check_period};
use labmesh_types::{DeviceInfo, Endpoint, Envelope, LabError, Map, StatusMap, Topic, Value};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::interface::DEFAULT_REQUEST_TIMEOUT;
use crate::worker::{Device, Methods, WorkerContext};

pub mod client;
pub mod discovery;
pub mod launcher;
pub mod registry;

pub use client::OrchestratorClient;
pub use discovery::Discovery;
pub use launcher::{ExecLauncher, LaunchRequest, ThreadLauncher, WorkerEntry, WorkerLauncher, WorkerProcess};
pub use registry::{DeviceRecord, PeerHost, Registry};

/// Well-known request port of every orchestrator.
pub const SERVER_REQ_PORT: u16 = 23413;
/// Well-known publish port of every orchestrator.
pub const SERVER_PUB_PORT: u16 = 23412;
/// Well-known UDP discovery port.
pub const DISCOVERY_PORT: u16 = 14453;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub hostname: String,
    /// Ports at which peer orchestrators serve; normally the well-known ones.
    pub peer_req_port: u16,
    pub peer_pub_port: u16,
    /// `None` disables discovery entirely.
    pub discovery_port: Option<u16>,
    pub broadcast_address: String,
    /// Unicast target replacing the broadcast address.
    pub announce_to: Option<SocketAddr>,
    pub discovery_period: Duration,
    pub host_timeout: Duration,
    pub request_timeout: Duration,
    /// Worker ports are drawn from `low..high`.
    pub port_range: (u16, u16),
    /// Device types started locally when the orchestrator comes up.
    pub autostart: Vec<String>,
    /// How long a stopped worker may take to exit before it is killed.
    /// Capped so that a stop always answers within half the request
    /// timeout, see [`Orchestrator::stop_budget`].
    pub stop_grace: Duration,
    pub monitor_period: Duration,
}

impl OrchestratorConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            peer_req_port: SERVER_REQ_PORT,
            peer_pub_port: SERVER_PUB_PORT,
            discovery_port: Some(DISCOVERY_PORT),
            broadcast_address: "255.255.255.255".to_string(),
            announce_to: None,
            discovery_period: Duration::from_millis(200),
            host_timeout: Duration::from_secs(3),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            port_range: (30000, 40000),
            autostart: Vec::new(),
            stop_grace: Duration::from_secs(2),
            monitor_period: Duration::from_millis(200),
        }
    }

    /// Reject settings the orchestrator cannot run with: zero periods or
    /// timeouts and an empty port range.
    pub fn validate(&self) -> Result<(), LabError> {
        check_period("discovery_period", self.discovery_period)?;
        check_period("host_timeout", self.host_timeout)?;
        check_period("request_timeout", self.request_timeout)?;
        check_period("monitor_period", self.monitor_period)?;
        let (low, high) = self.port_range;
        if low >= high {
            return Err(LabError::InvalidArgument {
                name: "port_range".to_string(),
                details: format!("{low}..{high} is empty"),
            });
        }
        Ok(())
    }
}

/// Outcome of one discovery period.
type Announcements = BTreeMap<String, String>;

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

pub struct Orchestrator {
    config: OrchestratorConfig,
    launcher: Box<dyn WorkerLauncher>,
    registry: Registry,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, launcher: Box<dyn WorkerLauncher>) -> Self {
        let (low, high) = config.port_range;
        let registry = Registry::new(config.hostname.clone(), config.host_timeout, PortPool::new(low, high));
        Self {
            config,
            launcher,
            registry,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Time allowed for the QUIT round trip and for the process exit that
    /// follows.  Together they stay within half the request timeout, so the
    /// caller of `stop_device`, or a peer forwarding it, gets its reply
    /// before its own timeout.
    pub fn stop_budget(&self) -> (Duration, Duration) {
        let budget = self.config.request_timeout / 2;
        let quit = budget / 4;
        (quit, self.config.stop_grace.min(budget - quit))
    }

    fn is_local(&self, host: Option<&str>) -> bool {
        match host {
            None => true,
            Some(h) => h.is_empty() || h == self.config.hostname || h == "localhost",
        }
    }

    // ── start / stop ────────────────────────────────────────────────────────

    fn start_device(&mut self, args: CallArgs) -> Result<Value, LabError> {
        let device_type: String = args.get(0, "device_type")?;
        let host: Option<String> = args.get_or(1, "host", None)?;
        if !self.is_local(host.as_deref()) {
            let host = host.unwrap_or_default();
            return self.forward(&host, "start_device", args);
        }
        let params: Value = args.get_or(2, "args", Value::Object(Map::new()))?;
        let name: Option<String> = args.get_or(3, "name", None)?;
        let info = self.start_local(&device_type, name.as_deref(), params)?;
        Ok(serde_json::to_value(info)?)
    }

    fn start_local(&mut self, device_type: &str, name: Option<&str>, params: Value) -> Result<DeviceInfo, LabError> {
        if !self.launcher.knows(device_type) {
            return Err(LabError::UnknownDeviceType(device_type.to_string()));
        }
        let (req_port, pub_port) = self.registry.ports_mut().allocate_pair()?;
        let requested = match name {
            Some(name) => name.to_string(),
            None => format!("{device_type}_{req_port}"),
        };
        let name = self.registry.unique_name(&requested);
        let request = LaunchRequest {
            name: name.clone(),
            device_type: device_type.to_string(),
            req_port,
            pub_port,
            args: params,
        };
        let process = match self.launcher.launch(&request) {
            Ok(process) => process,
            Err(e) => {
                self.registry.ports_mut().release(req_port);
                self.registry.ports_mut().release(pub_port);
                return Err(e);
            }
        };
        let record = DeviceRecord {
            name: name.clone(),
            device_type: device_type.to_string(),
            req_port,
            pub_port,
            process,
            interface: crate::DeviceInterface::with_timeout(Endpoint::local(req_port, pub_port), self.stop_budget().0),
        };
        let info = record.info(&self.config.hostname);
        self.registry.insert(record);
        info!(device = %name, %device_type, req_port, pub_port, "device started");
        Ok(info)
    }

    fn stop_device(&mut self, args: CallArgs) -> Result<Value, LabError> {
        let name: String = args.get(0, "name")?;
        let host: Option<String> = args.get_or(1, "host", None)?;
        if !self.is_local(host.as_deref()) {
            let host = host.unwrap_or_default();
            return self.forward(&host, "stop_device", args);
        }
        self.stop_local(&name)?;
        Ok(Value::Null)
    }

    /// QUIT, wait up to the grace period, kill, then destroy the record.
    fn stop_local(&mut self, name: &str) -> Result<(), LabError> {
        let (_, grace) = self.stop_budget();
        let record = self
            .registry
            .get_mut(name)
            .ok_or_else(|| LabError::UnknownDevice(name.to_string()))?;
        if let Err(e) = record.interface.stop() {
            debug!(device = %name, error = %e, "quit request failed");
        }
        if !record.process.wait_for(grace) {
            warn!(device = %name, grace_ms = grace.as_millis() as u64, "worker did not exit in time; killing");
            record.process.kill();
        }
        self.registry.remove(name);
        info!(device = %name, "device stopped");
        Ok(())
    }

    /// Send the call unchanged to the orchestrator of `host`.
    fn forward(&mut self, host: &str, method: &str, args: CallArgs) -> Result<Value, LabError> {
        let peer = self
            .registry
            .hosts
            .get_mut(host)
            .ok_or_else(|| LabError::UnknownHost(host.to_string()))?;
        debug!(%host, %method, "forwarding to peer");
        peer.handle.interface.call_with(method, args.args, args.kwargs)
    }

    // ── discovery ───────────────────────────────────────────────────────────

    fn on_announcements(&mut self, ctx: &mut WorkerContext<Self>, found: Announcements) {
        let now = Instant::now();
        for (hostname, address) in found {
            let endpoint = Endpoint::new(address.clone(), self.config.peer_req_port, self.config.peer_pub_port);
            let timeout = self.config.request_timeout;
            let observed = self
                .registry
                .hosts
                .observe(&hostname, &address, now, |_, _| Ok(PeerHost::new(endpoint.clone(), timeout)));
            match observed {
                Ok(Observed::New) => {
                    info!(host = %hostname, %address, "new host discovered");
                    self.watch_peer(ctx, &hostname, &endpoint);
                }
                Ok(Observed::Moved { from, previous }) => {
                    info!(host = %hostname, %from, to = %address, "host moved");
                    if let Some(source) = previous.subscription {
                        ctx.stop_source(source);
                    }
                    self.watch_peer(ctx, &hostname, &endpoint);
                }
                Ok(Observed::Seen) => {}
                Err(e) => warn!(host = %hostname, error = %e, "cannot track host"),
            }
        }
    }

    fn watch_peer(&mut self, ctx: &mut WorkerContext<Self>, hostname: &str, endpoint: &Endpoint) {
        let host = hostname.to_string();
        let subscribed = ctx.subscribe(endpoint, &[Topic::Status], move |orch: &mut Orchestrator, _, envelope| {
            orch.on_peer_status(&host, envelope);
        });
        match subscribed {
            Ok(source) => {
                if let Some(peer) = self.registry.hosts.get_mut(hostname) {
                    peer.handle.subscription = Some(source);
                }
            }
            Err(e) => warn!(host = %hostname, error = %e, "cannot subscribe to peer"),
        }
    }

    fn on_peer_status(&mut self, hostname: &str, envelope: Envelope) {
        let Some(peer) = self.registry.hosts.get_mut(hostname) else {
            return;
        };
        let Some(devices) = envelope.contents.get("devices") else {
            return;
        };
        match serde_json::from_value::<Vec<DeviceInfo>>(devices.clone()) {
            Ok(devices) => peer.handle.devices = devices,
            Err(e) => debug!(host = %hostname, error = %e, "peer advertised an unreadable device list"),
        }
    }

    // ── process monitor ─────────────────────────────────────────────────────

    fn reap(&mut self) {
        for record in self.registry.reap_exited() {
            warn!(device = %record.name, req_port = record.req_port, "device process exited");
        }
    }
}

impl Device for Orchestrator {
    fn remote_methods() -> Methods<Self> {
        Methods::new()
            .expose("get_hosts", |orch: &mut Orchestrator, _: &mut WorkerContext<Orchestrator>, _| {
                Ok(serde_json::to_value(orch.registry.host_report(Instant::now()))?)
            })
            .expose("get_local_devices", |orch: &mut Orchestrator, _: &mut WorkerContext<Orchestrator>, _| {
                Ok(serde_json::to_value(orch.registry.local_devices())?)
            })
            .expose("get_devices", |orch: &mut Orchestrator, _: &mut WorkerContext<Orchestrator>, _| {
                Ok(serde_json::to_value(orch.registry.all_devices(Instant::now()))?)
            })
            .expose("get_device_types", |orch: &mut Orchestrator, _: &mut WorkerContext<Orchestrator>, _| {
                Ok(json!(orch.launcher.device_types()))
            })
            .expose("start_device", |orch: &mut Orchestrator, _: &mut WorkerContext<Orchestrator>, args| {
                orch.start_device(args)
            })
            .expose("stop_device", |orch: &mut Orchestrator, _: &mut WorkerContext<Orchestrator>, args| {
                orch.stop_device(args)
            })
    }

    fn init_device(&mut self, ctx: &mut WorkerContext<Self>) -> Result<(), LabError> {
        if let Err(e) = self.config.validate() {
            ctx.request_stop();
            return Err(e);
        }
        info!(hostname = %self.config.hostname, "orchestrator starting");

        ctx.start_timer(self.config.monitor_period, |orch: &mut Orchestrator, _| orch.reap())?;

        if let Some(port) = self.config.discovery_port {
            let discovery = match self.config.announce_to {
                Some(target) => Discovery::bind_with_target(&self.config.hostname, port, target),
                None => Discovery::bind(&self.config.hostname, port, &self.config.broadcast_address),
            };
            match discovery {
                Ok(discovery) => {
                    ctx.start_periodic_task(
                        self.config.discovery_period,
                        move || discovery.poll(),
                        |orch: &mut Orchestrator, ctx, found: Announcements| orch.on_announcements(ctx, found),
                    )?;
                }
                Err(e) => error!(port, error = %e, "discovery disabled: cannot bind"),
            }
        }

        for device_type in self.config.autostart.clone() {
            if let Err(e) = self.start_local(&device_type, None, Value::Object(Map::new())) {
                error!(%device_type, error = %e, "autostart failed");
            }
        }
        Ok(())
    }

    fn destroy_device(&mut self, _ctx: &mut WorkerContext<Self>) -> Result<(), LabError> {
        for name in self.registry.device_names() {
            if let Err(e) = self.stop_local(&name) {
                warn!(device = %name, error = %e, "stop on shutdown failed");
            }
        }
        Ok(())
    }

    fn status(&mut self) -> Result<StatusMap, LabError> {
        let mut status = StatusMap::new();
        status.insert("hostname".into(), json!(self.config.hostname));
        status.insert("devices".into(), serde_json::to_value(self.registry.local_devices())?);
        Ok(status)
    }
}
