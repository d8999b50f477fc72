//! Sub-command implementations.

use std::thread;
use std::time::Duration;

use clap::ValueEnum;
use colored::Colorize;
use labmesh_hal::DeviceCatalog;
use labmesh_runtime::capture::OutputCapture;
use labmesh_runtime::orchestrator::WorkerLauncher;
use labmesh_runtime::telemetry::init_tracing;
use labmesh_runtime::{
    DeviceInfo, DeviceWorker, Endpoint, Envelope, LabError, Orchestrator, OrchestratorClient, ShutdownHandle, Topic,
    Value, WorkerConfig,
};
use tracing::{info, warn};

use crate::config::{self, Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TopicArg {
    Status,
    Stdout,
    Stderr,
}

impl From<TopicArg> for Topic {
    fn from(arg: TopicArg) -> Self {
        match arg {
            TopicArg::Status => Topic::Status,
            TopicArg::Stdout => Topic::Stdout,
            TopicArg::Stderr => Topic::Stderr,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Long-running roles
// ─────────────────────────────────────────────────────────────────────────────

pub fn server(cfg: &Config, in_process: bool, no_discovery: bool, autostart: Vec<String>) -> Result<(), LabError> {
    let capture = OutputCapture::new();
    let _guard = init_tracing("labmesh-server", Some(&capture));

    let catalog = DeviceCatalog::builtin();
    let mut orch_cfg = cfg.orchestrator_config();
    if no_discovery {
        orch_cfg.discovery_port = None;
    }
    orch_cfg.autostart.extend(autostart);
    let launcher: Box<dyn WorkerLauncher> = if in_process {
        Box::new(catalog.thread_launcher().with_refresh_period(cfg.refresh_period()))
    } else {
        Box::new(catalog.exec_launcher(std::env::current_exe()?))
    };

    println!(
        "  {} orchestrator {} on ports {}/{}",
        "labmesh".bold().cyan(),
        orch_cfg.hostname.bold(),
        cfg.server_req_port,
        cfg.server_pub_port
    );
    println!("  Device types: {}", catalog.device_types().join(", ").dimmed());

    let worker_cfg =
        WorkerConfig::new(cfg.server_req_port, cfg.server_pub_port).with_refresh_period(cfg.refresh_period());
    let mut worker = DeviceWorker::new(Orchestrator::new(orch_cfg, launcher), worker_cfg).with_output(capture);
    install_ctrlc(worker.shutdown_handle());
    worker.run()
}

pub fn worker(
    cfg: &Config,
    device_type: &str,
    name: Option<&str>,
    req_port: u16,
    pub_port: u16,
    args: &str,
) -> Result<(), LabError> {
    let capture = OutputCapture::new();
    let _guard = init_tracing("labmesh-worker", Some(&capture));

    let args: Value = serde_json::from_str(args).map_err(|e| LabError::InvalidArgument {
        name: "args".to_string(),
        details: e.to_string(),
    })?;
    let config = WorkerConfig::new(req_port, pub_port).with_refresh_period(cfg.refresh_period());
    let shutdown = ShutdownHandle::new();
    install_ctrlc(shutdown.clone());
    info!(device = name.unwrap_or(device_type), %device_type, req_port, pub_port, "worker process starting");
    DeviceCatalog::builtin().run(device_type, config, args, shutdown, capture)
}

fn install_ctrlc(shutdown: ShutdownHandle) {
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Interrupt received – shutting down …".yellow().bold());
        shutdown.request();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client commands
// ─────────────────────────────────────────────────────────────────────────────

fn client(cfg: &Config, server: &str) -> OrchestratorClient {
    OrchestratorClient::with_timeout(
        Endpoint::new(server, cfg.server_req_port, cfg.server_pub_port),
        cfg.request_timeout(),
    )
}

fn find_device(client: &mut OrchestratorClient, name: &str) -> Result<DeviceInfo, LabError> {
    client
        .get_devices()?
        .into_iter()
        .find(|d| d.name == name)
        .ok_or_else(|| LabError::UnknownDevice(name.to_string()))
}

pub fn devices(cfg: &Config, server: &str, local: bool) -> Result<(), LabError> {
    let mut client = client(cfg, server);
    let devices = if local {
        client.get_local_devices()?
    } else {
        client.get_devices()?
    };
    if devices.is_empty() {
        println!("  {}", "No devices running.".dimmed());
        return Ok(());
    }
    println!("  {:<20} {:<12} {:<16} {}", "NAME".bold(), "TYPE".bold(), "HOST".bold(), "PORTS".bold());
    for d in &devices {
        println!("{}", device_row(d));
    }
    Ok(())
}

fn device_row(d: &DeviceInfo) -> String {
    format!("  {:<20} {:<12} {:<16} {}/{}", d.name, d.device_type, d.host, d.req_port, d.pub_port)
}

pub fn hosts(cfg: &Config, server: &str) -> Result<(), LabError> {
    let hosts = client(cfg, server).get_hosts()?;
    for (name, host) in &hosts {
        let state = if host.connected {
            "connected".green()
        } else {
            "stale".red()
        };
        println!(
            "  {:<20} {:<16} {:<10} last seen {}",
            name.bold(),
            host.address,
            state,
            host.last_seen.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub fn types(cfg: &Config, server: &str) -> Result<(), LabError> {
    let catalog = DeviceCatalog::builtin();
    for device_type in client(cfg, server).get_device_types()? {
        let description = catalog.describe(&device_type).unwrap_or("");
        println!("  {:<12} {}", device_type.bold(), description.dimmed());
    }
    Ok(())
}

pub fn start(
    cfg: &Config,
    server: &str,
    device_type: &str,
    on: Option<&str>,
    name: Option<&str>,
    args: &str,
) -> Result<(), LabError> {
    let args: Value = serde_json::from_str(args).map_err(|e| LabError::InvalidArgument {
        name: "args".to_string(),
        details: e.to_string(),
    })?;
    let info = client(cfg, server).start_device(device_type, on, args, name)?;
    println!("  {} started {}", "✓".green().bold(), device_row(&info).trim_start());
    Ok(())
}

pub fn stop(cfg: &Config, server: &str, name: &str, on: Option<&str>) -> Result<(), LabError> {
    client(cfg, server).stop_device(name, on)?;
    println!("  {} stopped {}", "✓".green().bold(), name.bold());
    Ok(())
}

/// A CLI argument as a JSON value; anything that does not parse is a string.
pub(crate) fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn call(cfg: &Config, server: &str, device: &str, method: &str, args: &[String]) -> Result<(), LabError> {
    let mut client = client(cfg, server);
    let info = find_device(&mut client, device)?;
    let mut proxy = client.proxy_for(&info)?;
    let result = proxy.call(method, args.iter().map(|a| parse_arg(a)).collect())?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

pub fn watch(cfg: &Config, server: &str, device: &str, topics: &[TopicArg]) -> Result<(), LabError> {
    let mut client = client(cfg, server);
    let info = find_device(&mut client, device)?;
    let mut proxy = client.proxy_for(&info)?;
    let topics: Vec<Topic> = if topics.is_empty() {
        Topic::ALL.to_vec()
    } else {
        topics.iter().map(|&t| t.into()).collect()
    };

    let shutdown = ShutdownHandle::new();
    install_ctrlc(shutdown.clone());
    proxy.subscribe(&topics, |envelope| {
        for line in render(&envelope) {
            println!("{line}");
        }
    })?;
    println!("  Watching {} – Ctrl-C to stop.", info.name.bold());
    while !shutdown.is_requested() {
        thread::sleep(Duration::from_millis(100));
    }
    proxy.close();
    Ok(())
}

/// Terminal lines for one envelope.
pub(crate) fn render(envelope: &Envelope) -> Vec<String> {
    let lines = |contents: &Value| -> Vec<String> {
        match contents {
            Value::Array(items) => items
                .iter()
                .map(|l| l.as_str().map_or_else(|| l.to_string(), str::to_string))
                .collect(),
            other => vec![other.to_string()],
        }
    };
    match envelope.topic {
        Topic::Status => vec![format!("{} {}", "status".cyan(), envelope.contents)],
        Topic::Stdout => lines(&envelope.contents),
        Topic::Stderr => lines(&envelope.contents).into_iter().map(|l| l.red().to_string()).collect(),
    }
}

pub fn show_config(cfg: &Config, init: bool) -> Result<(), LabError> {
    if init {
        let path = config::save(cfg)?;
        println!("  {} Config saved to {}", "✓".green().bold(), path.display().to_string().bold());
    } else {
        println!("  # {}", config::config_path().display());
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| LabError::Serialization(e.to_string()))?;
    println!("{raw}");
    println!("  # resolved hostname: {}", cfg.resolved_hostname());
    Ok(())
}
