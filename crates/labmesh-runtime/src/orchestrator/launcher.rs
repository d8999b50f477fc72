//! How the orchestrator turns a device type into a running worker.
//!
//! [`ExecLauncher`] starts a new OS process (the labmesh binary's `worker`
//! sub-command) with the ports injected on its command line.
//! [`ThreadLauncher`] runs workers on threads of the current process, which
//! is what tests and single-binary deployments use.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use labmesh_types::{LabError, Value};
use tracing::{debug, warn};

use crate::worker::{ShutdownHandle, WorkerConfig};

const EXIT_POLL: Duration = Duration::from_millis(20);

/// How long `kill` waits for an in-process worker before detaching it.
const THREAD_KILL_WAIT: Duration = Duration::from_millis(100);

/// Everything a launcher needs to start one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub name: String,
    pub device_type: String,
    pub req_port: u16,
    pub pub_port: u16,
    /// Device-specific construction arguments.
    pub args: Value,
}

/// Handle on a started worker.
pub trait WorkerProcess: Send {
    /// OS process id, when the worker is a separate process.
    fn pid(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Wait up to `timeout` for the worker to exit.  Returns `true` once it
    /// has.
    fn wait_for(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL);
        }
    }

    /// Terminate the worker without giving it a chance to clean up.
    fn kill(&mut self);
}

pub trait WorkerLauncher: Send {
    /// Device types this launcher can start, sorted.
    fn device_types(&self) -> Vec<String>;

    fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn WorkerProcess>, LabError>;

    fn knows(&self, device_type: &str) -> bool {
        self.device_types().iter().any(|t| t == device_type)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Separate processes
// ─────────────────────────────────────────────────────────────────────────────

/// Spawns `<program> worker --type T --name N --req-port R --pub-port P --args J`.
///
/// A worker's output already reaches clients on its STDOUT/STDERR topics,
/// so the child's stdout is discarded and its stderr only lands in this
/// process's debug log.
pub struct ExecLauncher {
    program: PathBuf,
    device_types: Vec<String>,
}

impl ExecLauncher {
    pub fn new(program: impl Into<PathBuf>, device_types: Vec<String>) -> Self {
        let mut device_types = device_types;
        device_types.sort();
        device_types.dedup();
        Self {
            program: program.into(),
            device_types,
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe(device_types: Vec<String>) -> Result<Self, LabError> {
        Ok(Self::new(std::env::current_exe()?, device_types))
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("worker")
            .arg("--type")
            .arg(&request.device_type)
            .arg("--name")
            .arg(&request.name)
            .arg("--req-port")
            .arg(request.req_port.to_string())
            .arg("--pub-port")
            .arg(request.pub_port.to_string())
            .arg("--args")
            .arg(request.args.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        command
    }
}

impl WorkerLauncher for ExecLauncher {
    fn device_types(&self) -> Vec<String> {
        self.device_types.clone()
    }

    fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn WorkerProcess>, LabError> {
        if !self.knows(&request.device_type) {
            return Err(LabError::UnknownDeviceType(request.device_type.clone()));
        }
        let mut child = self.command(request).spawn().map_err(|e| LabError::Spawn {
            device_type: request.device_type.clone(),
            details: e.to_string(),
        })?;
        debug!(pid = child.id(), name = %request.name, "worker process spawned");
        if let Some(stderr) = child.stderr.take() {
            let device = request.name.clone();
            let forwarded = forward_lines(&request.name, stderr, move |line| {
                debug!(%device, "{line}");
            });
            if let Err(e) = forwarded {
                warn!(name = %request.name, error = %e, "worker stderr is not forwarded");
            }
        }
        Ok(Box::new(ChildProcess { child }))
    }
}

/// Read `source` line by line on a thread of its own until EOF.  Draining
/// the pipe keeps a chatty child from blocking on a full buffer.
fn forward_lines<R, F>(name: &str, source: R, mut sink: F) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
    F: FnMut(String) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("labmesh-{name}-stderr"))
        .spawn(move || {
            for line in BufReader::new(source).lines().map_while(Result::ok) {
                sink(line);
            }
        })
}

struct ChildProcess {
    child: Child,
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(pid = self.child.id(), error = %e, "kill failed");
        }
        let _ = self.child.wait();
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            warn!(pid = self.child.id(), "killing orphaned worker process");
            self.kill();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process threads
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point that builds and runs one worker until it stops.
pub type WorkerEntry = Arc<dyn Fn(WorkerConfig, Value, ShutdownHandle) -> Result<(), LabError> + Send + Sync>;

/// Runs each worker on its own thread.  `kill` is cooperative: it raises the
/// worker's shutdown flag, which the loop notices within one poll period.
#[derive(Default)]
pub struct ThreadLauncher {
    entries: BTreeMap<String, WorkerEntry>,
    refresh_period: Option<Duration>,
}

impl ThreadLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, device_type: &str, entry: F) -> Self
    where
        F: Fn(WorkerConfig, Value, ShutdownHandle) -> Result<(), LabError> + Send + Sync + 'static,
    {
        self.entries.insert(device_type.to_string(), Arc::new(entry));
        self
    }

    pub fn with_refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = Some(period);
        self
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn device_types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn WorkerProcess>, LabError> {
        let entry = self
            .entries
            .get(&request.device_type)
            .cloned()
            .ok_or_else(|| LabError::UnknownDeviceType(request.device_type.clone()))?;
        let mut config = WorkerConfig::new(request.req_port, request.pub_port);
        if let Some(period) = self.refresh_period {
            config = config.with_refresh_period(period);
        }
        let args = request.args.clone();
        let shutdown = ShutdownHandle::new();
        let handle = shutdown.clone();
        let name = request.name.clone();
        let thread = thread::Builder::new()
            .name(format!("labmesh-{}", request.name))
            .spawn(move || {
                if let Err(e) = entry(config, args, handle) {
                    warn!(device = %name, error = %e, "in-process worker failed");
                }
            })
            .map_err(|e| LabError::Spawn {
                device_type: request.device_type.clone(),
                details: e.to_string(),
            })?;
        Ok(Box::new(ThreadProcess {
            shutdown,
            thread: Some(thread),
        }))
    }
}

struct ThreadProcess {
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl WorkerProcess for ThreadProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        let finished = self.thread.as_ref().is_none_or(|t| t.is_finished());
        if finished {
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
        !finished
    }

    /// Threads cannot be killed: raise the shutdown flag, give the loop a
    /// moment, and detach the thread if it is still busy (a slow
    /// `destroy_device`, say).  It exits on its own later.
    fn kill(&mut self) {
        self.shutdown.request();
        if !self.wait_for(THREAD_KILL_WAIT) {
            warn!("in-process worker still running after kill; detaching");
            self.thread.take();
        }
    }
}

impl Drop for ThreadProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.kill();
        }
    }
}
