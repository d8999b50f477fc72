//! [`DeviceCatalog`] – which device types this binary can host.
//!
//! Each entry maps a type tag to a function that builds the device from its
//! JSON arguments and runs its worker until it stops.  The same catalog
//! backs the `worker` sub-command (one process per device) and the
//! in-process [`ThreadLauncher`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use labmesh_runtime::capture::OutputCapture;
use labmesh_runtime::orchestrator::{ExecLauncher, ThreadLauncher};
use labmesh_runtime::{Device, DeviceWorker, LabError, ShutdownHandle, Value, WorkerConfig};
use tracing::info;

use crate::demo::DemoDevice;
use crate::sim_rover::SimRover;

/// Builds and runs one worker to completion.
pub type WorkerRunner = fn(WorkerConfig, Value, ShutdownHandle, OutputCapture) -> Result<(), LabError>;

#[derive(Clone, Copy)]
struct Entry {
    description: &'static str,
    run: WorkerRunner,
}

#[derive(Clone, Default)]
pub struct DeviceCatalog {
    entries: BTreeMap<String, Entry>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device types shipped with labmesh.
    pub fn builtin() -> Self {
        Self::new()
            .register("demo", "pretend voltage source", run_demo)
            .register("sim_rover", "simulated differential-drive base", run_sim_rover)
    }

    pub fn register(mut self, device_type: &str, description: &'static str, run: WorkerRunner) -> Self {
        self.entries.insert(device_type.to_string(), Entry { description, run });
        self
    }

    /// Sorted type tags.
    pub fn device_types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn describe(&self, device_type: &str) -> Option<&'static str> {
        self.entries.get(device_type).map(|e| e.description)
    }

    pub fn contains(&self, device_type: &str) -> bool {
        self.entries.contains_key(device_type)
    }

    /// Run a worker of `device_type` on the calling thread.
    ///
    /// # Errors
    ///
    /// [`LabError::UnknownDeviceType`] for tags not in the catalog, otherwise
    /// whatever the worker returns.
    pub fn run(
        &self,
        device_type: &str,
        config: WorkerConfig,
        args: Value,
        shutdown: ShutdownHandle,
        output: OutputCapture,
    ) -> Result<(), LabError> {
        let entry = self
            .entries
            .get(device_type)
            .ok_or_else(|| LabError::UnknownDeviceType(device_type.to_string()))?;
        (entry.run)(config, args, shutdown, output)
    }

    /// Launcher running every catalog type on threads of this process.
    pub fn thread_launcher(&self) -> ThreadLauncher {
        self.entries.iter().fold(ThreadLauncher::new(), |launcher, (device_type, entry)| {
            let run = entry.run;
            launcher.register(device_type, move |config, args, shutdown| {
                run(config, args, shutdown, OutputCapture::new())
            })
        })
    }

    /// Launcher spawning `program worker …` for every catalog type.
    pub fn exec_launcher(&self, program: impl Into<PathBuf>) -> ExecLauncher {
        ExecLauncher::new(program, self.device_types())
    }
}

fn host<D: Device>(device: D, config: WorkerConfig, shutdown: ShutdownHandle, output: OutputCapture) -> Result<(), LabError> {
    info!(req_port = config.req_port, pub_port = config.pub_port, "hosting worker");
    DeviceWorker::new(device, config)
        .with_shutdown(shutdown)
        .with_output(output)
        .run()
}

fn run_demo(config: WorkerConfig, args: Value, shutdown: ShutdownHandle, output: OutputCapture) -> Result<(), LabError> {
    host(DemoDevice::from_args(&args)?, config, shutdown, output)
}

fn run_sim_rover(
    config: WorkerConfig,
    _args: Value,
    shutdown: ShutdownHandle,
    output: OutputCapture,
) -> Result<(), LabError> {
    host(SimRover::default(), config, shutdown, output)
}
