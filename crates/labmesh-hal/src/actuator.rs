//! Generic `Actuator` trait for wheels, fans and any velocity-controlled
//! motor.
//!
//! Devices only ever talk to the trait, so a simulated wheel and a real
//! motor controller are interchangeable.

use labmesh_types::LabError;

/// A velocity-controlled motor.
pub trait Actuator: Send {
    /// Stable identifier, e.g. `"left_wheel"`.
    fn id(&self) -> &str;

    /// Command a new target velocity.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Device`] when the command cannot be applied.
    fn set_velocity(&mut self, target: f64) -> Result<(), LabError>;

    /// Most recently known velocity.
    fn velocity(&self) -> f64;

    /// Advance internal dynamics by `dt` seconds.  Real drivers that read
    /// their state from hardware leave this empty.
    fn update(&mut self, _dt: f64) {}
}

/// Simulated wheel that ramps toward its target with bounded acceleration.
pub struct SimWheel {
    id: String,
    velocity: f64,
    target: f64,
    max_speed: f64,
    max_accel: f64,
}

impl SimWheel {
    pub fn new(id: impl Into<String>, max_speed: f64, max_accel: f64) -> Box<Self> {
        Box::new(Self {
            id: id.into(),
            velocity: 0.0,
            target: 0.0,
            max_speed,
            max_accel,
        })
    }

    pub fn target(&self) -> f64 {
        self.target
    }
}

impl Actuator for SimWheel {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_velocity(&mut self, target: f64) -> Result<(), LabError> {
        if !target.is_finite() {
            return Err(LabError::device(&self.id, format!("target velocity {target} is not finite")));
        }
        self.target = target.clamp(-self.max_speed, self.max_speed);
        Ok(())
    }

    fn velocity(&self) -> f64 {
        self.velocity
    }

    fn update(&mut self, dt: f64) {
        let max_step = self.max_accel * dt;
        let error = self.target - self.velocity;
        self.velocity += error.clamp(-max_step, max_step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wheel_ramps_with_bounded_acceleration() {
        let mut wheel = SimWheel::new("left_wheel", 2.0, 1.0);
        wheel.set_velocity(0.5).unwrap();
        wheel.update(0.1);
        assert!((wheel.velocity() - 0.1).abs() < 1e-9);
        for _ in 0..10 {
            wheel.update(0.1);
        }
        assert!((wheel.velocity() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn wheel_clamps_and_rejects_bad_targets() {
        let mut wheel = SimWheel::new("right_wheel", 1.0, 10.0);
        wheel.set_velocity(5.0).unwrap();
        assert_eq!(wheel.target(), 1.0);
        assert!(wheel.set_velocity(f64::NAN).is_err());
        assert_eq!(wheel.target(), 1.0);
    }
}
