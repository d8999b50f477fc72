//! `labmesh-cli` – the labmesh command line
//!
//! One binary plays every role:
//!
//! 1. `labmesh server` runs this host's orchestrator on the well-known
//!    ports, announces it on the LAN and starts workers on request.
//! 2. `labmesh worker` hosts a single device; the server spawns these with
//!    the ports it allocated.
//! 3. The remaining sub-commands are clients of a server: list hosts and
//!    devices, start and stop devices, call a method, watch a device's
//!    topics.
//!
//! Ctrl-C stops servers and workers gracefully.

mod commands;
mod config;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;

#[derive(Parser)]
#[command(name = "labmesh", version, about = "Device workers, discovery and orchestration for lab hardware")]
struct Cli {
    /// Orchestrator to talk to (client commands)
    #[arg(long, global = true, default_value = "127.0.0.1")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run this host's orchestrator
    Server {
        /// Run workers as threads of this process instead of child processes
        #[arg(long)]
        in_process: bool,
        /// Neither announce this host nor listen for peers
        #[arg(long)]
        no_discovery: bool,
        /// Extra device types to start at boot
        #[arg(long = "autostart", value_name = "TYPE")]
        autostart: Vec<String>,
    },
    /// Host one device (normally spawned by the server)
    Worker {
        #[arg(long = "type", value_name = "TYPE")]
        device_type: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        req_port: u16,
        #[arg(long)]
        pub_port: u16,
        /// Construction arguments as JSON
        #[arg(long, default_value = "null")]
        args: String,
    },
    /// List devices (local and on connected peers)
    Devices {
        /// Only the server's own devices
        #[arg(long)]
        local: bool,
    },
    /// List known hosts
    Hosts,
    /// List device types the server can start
    Types,
    /// Start a device
    Start {
        device_type: String,
        /// Host to start it on (default: the server's own)
        #[arg(long)]
        on: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Construction arguments as JSON
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Stop a device
    Stop {
        name: String,
        #[arg(long)]
        on: Option<String>,
    },
    /// Call a remote method; each argument is parsed as JSON, or taken as a
    /// string when it is not valid JSON
    Call {
        device: String,
        method: String,
        args: Vec<String>,
    },
    /// Print a device's status and output until Ctrl-C
    Watch {
        device: String,
        /// Print only these topics
        #[arg(long, value_enum)]
        topic: Vec<commands::TopicArg>,
    },
    /// Show the effective configuration
    Config {
        /// Write the defaults to ~/.labmesh/config.toml
        #[arg(long)]
        init: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red());
            eprintln!("  Using default configuration.");
            config::Config::default()
        }
    };

    // Servers and workers install their own subscriber with output capture.
    let _guard = match cli.command {
        Command::Server { .. } | Command::Worker { .. } => None,
        _ => Some(labmesh_runtime::telemetry::init_tracing("labmesh-cli", None)),
    };

    let outcome = match cli.command {
        Command::Server {
            in_process,
            no_discovery,
            autostart,
        } => commands::server(&cfg, in_process, no_discovery, autostart),
        Command::Worker {
            device_type,
            name,
            req_port,
            pub_port,
            args,
        } => commands::worker(&cfg, &device_type, name.as_deref(), req_port, pub_port, &args),
        Command::Devices { local } => commands::devices(&cfg, &cli.server, local),
        Command::Hosts => commands::hosts(&cfg, &cli.server),
        Command::Types => commands::types(&cfg, &cli.server),
        Command::Start {
            device_type,
            on,
            name,
            args,
        } => commands::start(&cfg, &cli.server, &device_type, on.as_deref(), name.as_deref(), &args),
        Command::Stop { name, on } => commands::stop(&cfg, &cli.server, &name, on.as_deref()),
        Command::Call { device, method, args } => commands::call(&cfg, &cli.server, &device, &method, &args),
        Command::Watch { device, topic } => commands::watch(&cfg, &cli.server, &device, &topic),
        Command::Config { init } => commands::show_config(&cfg, init),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}
