//! [`SimRover`] – simulated differential-drive base.
//!
//! # Drive mapping
//!
//! A `drive(throttle, turning)` command (linear + angular velocity) is
//! split into wheel targets with a unit-wheelbase model:
//! `left = v - ω/2`, `right = v + ω/2`.  A Timer advances wheel dynamics and
//! integrates the pose every [`SIM_STEP`].
//!
//! # Watchdog
//!
//! Commands expire: if no `drive` arrives for [`COMMAND_TIMEOUT`], both
//! wheel targets drop to zero so a client that disappears cannot leave the
//! rover running.

use std::time::{Duration, Instant};

use labmesh_runtime::{CallArgs, Device, LabError, Methods, StatusMap, Value, WorkerContext};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::actuator::{Actuator, SimWheel};

pub const SIM_STEP: Duration = Duration::from_millis(10);
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(200);

const MAX_WHEEL_SPEED: f64 = 2.0;
const MAX_WHEEL_ACCEL: f64 = 4.0;

/// Position in metres and heading in radians.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

pub struct SimRover {
    left: Box<dyn Actuator>,
    right: Box<dyn Actuator>,
    throttle: f64,
    turning: f64,
    last_command: Option<Instant>,
    watchdog_tripped: bool,
    pose: Pose,
}

impl Default for SimRover {
    fn default() -> Self {
        Self::new(
            SimWheel::new("left_wheel", MAX_WHEEL_SPEED, MAX_WHEEL_ACCEL),
            SimWheel::new("right_wheel", MAX_WHEEL_SPEED, MAX_WHEEL_ACCEL),
        )
    }
}

impl SimRover {
    pub fn new(left: Box<dyn Actuator>, right: Box<dyn Actuator>) -> Self {
        Self {
            left,
            right,
            throttle: 0.0,
            turning: 0.0,
            last_command: None,
            watchdog_tripped: false,
            pose: Pose::default(),
        }
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn wheels(&self) -> [f64; 2] {
        [self.left.velocity(), self.right.velocity()]
    }

    /// Set linear (`throttle`) and angular (`turning`) velocity.
    pub fn drive(&mut self, throttle: f64, turning: f64, now: Instant) -> Result<(), LabError> {
        self.left.set_velocity(throttle - turning * 0.5)?;
        self.right.set_velocity(throttle + turning * 0.5)?;
        self.throttle = throttle;
        self.turning = turning;
        self.last_command = Some(now);
        self.watchdog_tripped = false;
        Ok(())
    }

    pub fn halt(&mut self) -> Result<(), LabError> {
        self.left.set_velocity(0.0)?;
        self.right.set_velocity(0.0)?;
        self.throttle = 0.0;
        self.turning = 0.0;
        self.last_command = None;
        Ok(())
    }

    /// Advance the simulation by `dt`.
    pub fn step(&mut self, now: Instant, dt: Duration) {
        let expired = self
            .last_command
            .is_some_and(|at| now.saturating_duration_since(at) > COMMAND_TIMEOUT);
        if expired {
            warn!(timeout_ms = COMMAND_TIMEOUT.as_millis() as u64, "drive command expired; stopping");
            if let Err(e) = self.halt() {
                warn!(error = %e, "watchdog halt failed");
            }
            self.watchdog_tripped = true;
        }

        let dt = dt.as_secs_f64();
        self.left.update(dt);
        self.right.update(dt);
        let [left, right] = self.wheels();
        let v = (left + right) / 2.0;
        let w = right - left;
        self.pose.heading += w * dt;
        self.pose.x += v * self.pose.heading.cos() * dt;
        self.pose.y += v * self.pose.heading.sin() * dt;
    }
}

impl Device for SimRover {
    fn remote_methods() -> Methods<Self> {
        Methods::new()
            .expose("drive", |rover: &mut SimRover, _: &mut WorkerContext<SimRover>, args: CallArgs| {
                let throttle: f64 = args.get(0, "throttle")?;
                let turning: f64 = args.get_or(1, "turning", 0.0)?;
                rover.drive(throttle, turning, Instant::now())?;
                Ok(Value::Null)
            })
            .expose("stop_motors", |rover: &mut SimRover, _: &mut WorkerContext<SimRover>, _: CallArgs| {
                rover.halt()?;
                Ok(Value::Null)
            })
            .expose("get_pose", |rover: &mut SimRover, _: &mut WorkerContext<SimRover>, _: CallArgs| {
                Ok(serde_json::to_value(rover.pose)?)
            })
            .expose("reset_pose", |rover: &mut SimRover, _: &mut WorkerContext<SimRover>, _: CallArgs| {
                rover.pose = Pose::default();
                Ok(Value::Null)
            })
            .expose("get_wheels", |rover: &mut SimRover, _: &mut WorkerContext<SimRover>, _: CallArgs| {
                Ok(json!(rover.wheels()))
            })
    }

    fn init_device(&mut self, ctx: &mut WorkerContext<Self>) -> Result<(), LabError> {
        ctx.start_timer(SIM_STEP, |rover: &mut SimRover, _| rover.step(Instant::now(), SIM_STEP))?;
        info!(step_ms = SIM_STEP.as_millis() as u64, "rover simulation running");
        Ok(())
    }

    fn destroy_device(&mut self, _ctx: &mut WorkerContext<Self>) -> Result<(), LabError> {
        self.halt()
    }

    fn status(&mut self) -> Result<StatusMap, LabError> {
        let mut status = StatusMap::new();
        status.insert("throttle".into(), json!(self.throttle));
        status.insert("turning".into(), json!(self.turning));
        status.insert("wheels".into(), json!(self.wheels()));
        status.insert("pose".into(), serde_json::to_value(self.pose)?);
        status.insert("watchdog_tripped".into(), json!(self.watchdog_tripped));
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(rover: &mut SimRover, start: Instant, steps: u32) {
        for i in 1..=steps {
            rover.step(start + SIM_STEP * i, SIM_STEP);
        }
    }

    #[test]
    fn straight_drive_moves_forward_only() -> Result<(), LabError> {
        let mut rover = SimRover::default();
        let t0 = Instant::now();
        rover.drive(1.0, 0.0, t0)?;
        run(&mut rover, t0, 15);
        let pose = rover.pose();
        assert!(pose.x > 0.0);
        assert!(pose.y.abs() < 1e-9);
        assert!(pose.heading.abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn turning_splits_wheel_targets() -> Result<(), LabError> {
        let mut rover = SimRover::default();
        let t0 = Instant::now();
        rover.drive(0.0, 1.0, t0)?;
        run(&mut rover, t0, 15);
        let [left, right] = rover.wheels();
        assert!(left < 0.0 && right > 0.0);
        assert!((left + right).abs() < 1e-9);
        assert!(rover.pose().heading > 0.0);
        Ok(())
    }

    #[test]
    fn stale_commands_trip_the_watchdog() -> Result<(), LabError> {
        let mut rover = SimRover::default();
        let t0 = Instant::now();
        rover.drive(1.0, 0.0, t0)?;
        rover.step(t0 + COMMAND_TIMEOUT + Duration::from_millis(1), SIM_STEP);
        let status = rover.status()?;
        assert_eq!(status["watchdog_tripped"], true);
        assert_eq!(status["throttle"], 0.0);

        // Wheels coast down to zero after the trip.
        run(&mut rover, t0 + COMMAND_TIMEOUT, 100);
        assert_eq!(rover.wheels(), [0.0, 0.0]);
        Ok(())
    }
}
