//! `labmesh-hal` – built-in device workers
//!
//! # Modules
//!
//! - [`actuator`] – [`Actuator`][actuator::Actuator]: velocity-controlled
//!   motor abstraction plus the simulated [`SimWheel`][actuator::SimWheel].
//! - [`demo`] – [`DemoDevice`][demo::DemoDevice]: a voltage source with a
//!   background "measurement", handy for trying the mesh end to end.
//! - [`sim_rover`] – [`SimRover`][sim_rover::SimRover]: a simulated
//!   differential-drive base with a command watchdog.
//! - [`catalog`] – [`DeviceCatalog`][catalog::DeviceCatalog]: device-type
//!   tag → worker entry point, used by both the `worker` command and the
//!   in-process launcher.

pub mod actuator;
pub mod catalog;
pub mod demo;
pub mod sim_rover;

pub use catalog::DeviceCatalog;
pub use demo::DemoDevice;
pub use sim_rover::SimRover;
