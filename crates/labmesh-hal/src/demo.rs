//! [`DemoDevice`] – a pretend voltage source.
//!
//! Useful for exercising the mesh without hardware: it has a settable
//! voltage, a constant `get_value()` reading and a slow "measurement" that
//! runs as a background job and returns a [`NumericArray`].

use std::thread;
use std::time::Duration;

use labmesh_runtime::{CallArgs, Device, LabError, Methods, NumericArray, StatusMap, Value, WorkerContext};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

const DEFAULT_VOLTAGE: f64 = 0.2;

/// Construction arguments, passed as `--args '{"voltage": 1.5}'`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DemoArgs {
    voltage: Option<f64>,
}

#[derive(Debug, Default)]
enum Measurement {
    #[default]
    Idle,
    Running,
    Done(Result<NumericArray, String>),
}

#[derive(Debug)]
pub struct DemoDevice {
    voltage: f64,
    measurement: Measurement,
}

impl Default for DemoDevice {
    fn default() -> Self {
        Self::new(DEFAULT_VOLTAGE)
    }
}

impl DemoDevice {
    pub fn new(voltage: f64) -> Self {
        Self {
            voltage,
            measurement: Measurement::Idle,
        }
    }

    /// Build from the worker's JSON construction arguments; `null` means
    /// defaults.
    pub fn from_args(args: &Value) -> Result<Self, LabError> {
        if args.is_null() {
            return Ok(Self::default());
        }
        let parsed: DemoArgs = serde_json::from_value(args.clone()).map_err(|e| LabError::InvalidArgument {
            name: "args".to_string(),
            details: e.to_string(),
        })?;
        Ok(Self::new(parsed.voltage.unwrap_or(DEFAULT_VOLTAGE)))
    }

    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    fn start_measurement(&mut self, ctx: &mut WorkerContext<Self>, samples: usize, step: Duration) -> Result<(), LabError> {
        if matches!(self.measurement, Measurement::Running) {
            return Err(LabError::device("demo", "a measurement is already running"));
        }
        let amplitude = self.voltage;
        ctx.run_in_background(
            move || {
                let trace: Vec<f64> = (0..samples)
                    .map(|i| {
                        thread::sleep(step);
                        amplitude * (i as f64 * 0.1).sin()
                    })
                    .collect();
                Ok(NumericArray::from_slice(&trace))
            },
            |demo: &mut DemoDevice, ctx, outcome: Result<NumericArray, LabError>| {
                match &outcome {
                    Ok(trace) => ctx.print(format!("measurement finished: {} samples", trace.len())),
                    Err(e) => ctx.eprint(format!("measurement failed: {e}")),
                }
                demo.measurement = Measurement::Done(outcome.map_err(|e| e.to_string()));
            },
        )?;
        self.measurement = Measurement::Running;
        Ok(())
    }

    fn take_measurement(&mut self) -> Result<Value, LabError> {
        match std::mem::take(&mut self.measurement) {
            Measurement::Done(Ok(trace)) => Ok(trace.to_value()),
            Measurement::Done(Err(message)) => Err(LabError::Background(message)),
            Measurement::Running => {
                self.measurement = Measurement::Running;
                Err(LabError::device("demo", "measurement still running"))
            }
            Measurement::Idle => Err(LabError::device("demo", "no measurement was started")),
        }
    }
}

impl Device for DemoDevice {
    fn remote_methods() -> Methods<Self> {
        Methods::new()
            .expose("set_voltage", |demo: &mut DemoDevice, _: &mut WorkerContext<DemoDevice>, args: CallArgs| {
                demo.voltage = args.get(0, "v")?;
                Ok(Value::Null)
            })
            .expose("inc_voltage", |demo: &mut DemoDevice, _: &mut WorkerContext<DemoDevice>, _: CallArgs| {
                demo.voltage += 1.0;
                Ok(Value::Null)
            })
            .expose("get_voltage", |demo: &mut DemoDevice, _: &mut WorkerContext<DemoDevice>, _: CallArgs| {
                Ok(json!(demo.voltage))
            })
            .expose("get_value", |_: &mut DemoDevice, _: &mut WorkerContext<DemoDevice>, _: CallArgs| {
                Ok(json!(42))
            })
            .expose(
                "start_measurement",
                |demo: &mut DemoDevice, ctx: &mut WorkerContext<DemoDevice>, args: CallArgs| {
                    let samples: usize = args.get_or(0, "samples", 100)?;
                    let step_ms: u64 = args.get_or(1, "step_ms", 1)?;
                    demo.start_measurement(ctx, samples, Duration::from_millis(step_ms))?;
                    Ok(Value::Null)
                },
            )
            .expose(
                "is_measurement_finished",
                |demo: &mut DemoDevice, _: &mut WorkerContext<DemoDevice>, _: CallArgs| {
                    Ok(json!(matches!(demo.measurement, Measurement::Done(_))))
                },
            )
            .expose("get_measurement", |demo: &mut DemoDevice, _: &mut WorkerContext<DemoDevice>, _: CallArgs| {
                demo.take_measurement()
            })
    }

    fn init_device(&mut self, ctx: &mut WorkerContext<Self>) -> Result<(), LabError> {
        info!(voltage = self.voltage, "demo device initialized");
        ctx.print("Dummy device initialized");
        Ok(())
    }

    fn status(&mut self) -> Result<StatusMap, LabError> {
        let mut status = StatusMap::new();
        status.insert("connected".into(), json!(true));
        status.insert("voltage".into(), json!(self.voltage));
        status.insert(
            "measuring".into(),
            json!(matches!(self.measurement, Measurement::Running)),
        );
        Ok(status)
    }
}
