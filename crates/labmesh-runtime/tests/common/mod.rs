#![allow(dead_code)]

use std::net::{TcpListener, TcpStream, UdpSocket};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use labmesh_runtime::{
    CallArgs, Device, DeviceWorker, Endpoint, LabError, Methods, ShutdownHandle, StatusMap, Value, WorkerConfig,
    WorkerContext,
};
use serde_json::json;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

pub fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// Block until something accepts connections on `port`.
pub fn wait_listening(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("nothing listening on port {port}");
}

/// Poll `check` until it returns `Some` or `timeout` passes.
pub fn eventually<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Device used by the end-to-end tests.
pub struct Meter {
    pub total: i64,
}

impl Device for Meter {
    fn remote_methods() -> Methods<Self> {
        Methods::new()
            .expose("get_value", |_: &mut Meter, _: &mut WorkerContext<Meter>, _: CallArgs| Ok(json!(42)))
            .expose("add", |m: &mut Meter, _: &mut WorkerContext<Meter>, args: CallArgs| {
                m.total += args.get::<i64>(0, "n")?;
                Ok(json!(m.total))
            })
            .expose("echo", |_: &mut Meter, _: &mut WorkerContext<Meter>, args: CallArgs| {
                Ok(Value::from(args.args))
            })
            .expose("say", |_: &mut Meter, ctx: &mut WorkerContext<Meter>, args: CallArgs| {
                ctx.print(args.get::<String>(0, "line")?);
                Ok(Value::Null)
            })
            .expose("nap", |_: &mut Meter, _: &mut WorkerContext<Meter>, args: CallArgs| {
                thread::sleep(Duration::from_millis(args.get(0, "ms")?));
                Ok(json!("rested"))
            })
            .expose("fail", |_: &mut Meter, _: &mut WorkerContext<Meter>, _: CallArgs| {
                Err(LabError::device("meter", "overload"))
            })
    }

    fn status(&mut self) -> Result<StatusMap, LabError> {
        let mut status = StatusMap::new();
        status.insert("total".into(), json!(self.total));
        Ok(status)
    }
}

pub struct RunningWorker {
    pub endpoint: Endpoint,
    pub shutdown: ShutdownHandle,
    thread: Option<JoinHandle<Result<(), LabError>>>,
}

impl RunningWorker {
    /// Stop the loop and wait for the thread.
    pub fn kill(&mut self) {
        self.shutdown.request();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn join(&mut self) -> Option<Result<(), LabError>> {
        self.thread.take().and_then(|t| t.join().ok())
    }
}

impl Drop for RunningWorker {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Start `device` on fresh loopback ports.
pub fn spawn_worker<D, F>(make: F, refresh: Duration) -> RunningWorker
where
    D: Device,
    F: FnOnce() -> D + Send + 'static,
{
    spawn_worker_on(free_port(), free_port(), make, refresh)
}

pub fn spawn_worker_on<D, F>(req_port: u16, pub_port: u16, make: F, refresh: Duration) -> RunningWorker
where
    D: Device,
    F: FnOnce() -> D + Send + 'static,
{
    let shutdown = ShutdownHandle::new();
    let handle = shutdown.clone();
    let thread = thread::spawn(move || {
        let config = WorkerConfig::new(req_port, pub_port)
            .with_bind_host("127.0.0.1")
            .with_refresh_period(refresh);
        DeviceWorker::new(make(), config).with_shutdown(handle).run()
    });
    wait_listening(req_port);
    RunningWorker {
        endpoint: Endpoint::local(req_port, pub_port),
        shutdown,
        thread: Some(thread),
    }
}

pub fn spawn_meter() -> RunningWorker {
    spawn_worker(|| Meter { total: 0 }, Duration::from_millis(50))
}
