//! [`DeviceWorker`] – the device actor.
//!
//! A worker owns one device value and drives it from a single event loop:
//!
//! ```text
//!   clients ──req──▶ ReplyServer ─┐
//!                                 ├──▶ event loop ──▶ &mut device
//!   Timer / PeriodicTask /        │         │
//!   BackgroundTask / Subscriber ──┘ (signal)│
//!                                           └──▶ Publisher ──▶ subscribers
//! ```
//!
//! Only the loop ever touches the device.  Blocking work runs on the
//! primitives' own threads and comes back through the signal channel, so a
//! slow driver call in a background job never stalls the request server.
//!
//! Lifecycle: `Created → Running → Stopping → Stopped`.  [`DeviceWorker::run`]
//! performs the whole sequence and returns once the worker has stopped,
//! either because a client sent QUIT, the device asked to stop, or the
//! [`ShutdownHandle`] fired.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use labmesh_kernel::{
    BackgroundTask, CallArgs, MethodTable, Payload, PeriodicTask, Poller, Signal, SourceId, Timer, check_period,
    panic_message,
};
use labmesh_middleware::{IncomingRequest, Publisher, ReplyServer, Subscriber};
use labmesh_types::{
    Endpoint, Envelope, ErrorKind, LabError, Request, RequestKind, Response, StatusMap, Topic, Uuid, Value,
};
use tracing::{debug, error, info, warn};

use crate::capture::OutputCapture;

/// Upper bound on one wait of the event loop.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Time given to in-flight replies when the worker shuts its server down.
const REPLY_GRACE: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────────────────────────────────────
// Device trait
// ─────────────────────────────────────────────────────────────────────────────

/// Remote methods of device `D`.
pub type Methods<D> = MethodTable<D, WorkerContext<D>>;

/// A device type that can be hosted by a [`DeviceWorker`].
///
/// Only the methods returned by [`remote_methods`](Device::remote_methods)
/// are reachable over the network.  Every worker also answers `status`
/// (a fresh [`status`](Device::status) snapshot) and `remote_methods` (the
/// sorted list of exposed names).
pub trait Device: Sized + 'static {
    fn remote_methods() -> Methods<Self>;

    /// Called once the endpoints are open.  An error is logged and the
    /// worker keeps running.
    fn init_device(&mut self, _ctx: &mut WorkerContext<Self>) -> Result<(), LabError> {
        Ok(())
    }

    /// Called once on the way to `Stopped`, before any primitive is stopped.
    fn destroy_device(&mut self, _ctx: &mut WorkerContext<Self>) -> Result<(), LabError> {
        Ok(())
    }

    /// Snapshot published on the STATUS topic every refresh period.
    fn status(&mut self) -> Result<StatusMap, LabError> {
        Ok(StatusMap::new())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub req_port: u16,
    pub pub_port: u16,
    /// Interface both endpoints bind to.
    pub bind_host: String,
    /// Cadence of the status/output publication.
    pub refresh_period: Duration,
}

impl WorkerConfig {
    pub fn new(req_port: u16, pub_port: u16) -> Self {
        Self {
            req_port,
            pub_port,
            bind_host: "0.0.0.0".to_string(),
            refresh_period: Duration::from_millis(100),
        }
    }

    pub fn with_refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = period;
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Loopback endpoint of this worker, as a local client would use it.
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::local(self.req_port, self.pub_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Created => "created",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Cloneable external stop request, e.g. from a Ctrl-C handler.  The loop
/// notices it within one [`POLL_TIMEOUT`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker context
// ─────────────────────────────────────────────────────────────────────────────

type TickCallback<D> = Box<dyn FnMut(&mut D, &mut WorkerContext<D>)>;
type ValueCallback<D> = Box<dyn FnMut(&mut D, &mut WorkerContext<D>, Payload)>;
type OnceCallback<D> = Box<dyn FnOnce(&mut D, &mut WorkerContext<D>, Payload)>;
type EnvelopeCallback<D> = Box<dyn FnMut(&mut D, &mut WorkerContext<D>, Envelope)>;

enum Registration<D> {
    Timer {
        timer: Timer,
        callback: TickCallback<D>,
    },
    Periodic {
        task: PeriodicTask,
        callback: ValueCallback<D>,
    },
    Background {
        task: BackgroundTask,
        callback: OnceCallback<D>,
    },
    Subscription {
        subscriber: Subscriber,
        callback: EnvelopeCallback<D>,
    },
}

impl<D> Registration<D> {
    fn kind(&self) -> &'static str {
        match self {
            Registration::Timer { .. } => "timer",
            Registration::Periodic { .. } => "periodic task",
            Registration::Background { .. } => "background task",
            Registration::Subscription { .. } => "subscription",
        }
    }

    fn stop(&mut self) {
        match self {
            Registration::Timer { timer, .. } => timer.stop(),
            Registration::Periodic { task, .. } => task.stop(),
            Registration::Background { task, .. } => task.join(),
            Registration::Subscription { subscriber, .. } => subscriber.stop(),
        }
    }
}

/// Everything a device can do to its own worker besides answering calls:
/// start timers and jobs, watch other workers, print to the output topics
/// and ask the worker to stop.
///
/// Callbacks registered here run on the event loop with `&mut` access to
/// the device and this context.
pub struct WorkerContext<D> {
    config: WorkerConfig,
    poller: Poller,
    registrations: HashMap<SourceId, Registration<D>>,
    /// Source whose callback is running, and whether it stopped itself.
    in_flight: Option<(SourceId, bool)>,
    output: OutputCapture,
    stop_requested: bool,
}

impl<D: 'static> WorkerContext<D> {
    pub(crate) fn new(config: WorkerConfig, output: OutputCapture) -> Self {
        Self {
            config,
            poller: Poller::new(),
            registrations: HashMap::new(),
            in_flight: None,
            output,
            stop_requested: false,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Call `callback` every `period` until the source is stopped.
    pub fn start_timer<F>(&mut self, period: Duration, callback: F) -> Result<SourceId, LabError>
    where
        F: FnMut(&mut D, &mut WorkerContext<D>) + 'static,
    {
        let timer = Timer::start(period, self.poller.register())?;
        let source = timer.source();
        self.registrations.insert(
            source,
            Registration::Timer {
                timer,
                callback: Box::new(callback),
            },
        );
        Ok(source)
    }

    /// Run `job` off the loop every `period` and hand each result to
    /// `callback` on the loop.
    pub fn start_periodic_task<T, J, F>(&mut self, period: Duration, job: J, mut callback: F) -> Result<SourceId, LabError>
    where
        T: Send + 'static,
        J: FnMut() -> T + Send + 'static,
        F: FnMut(&mut D, &mut WorkerContext<D>, T) + 'static,
    {
        let task = PeriodicTask::start(period, job, self.poller.register())?;
        let source = task.source();
        let callback: ValueCallback<D> = Box::new(move |device, ctx, payload| match payload.downcast::<T>() {
            Ok(value) => callback(device, ctx, value),
            Err(other) => warn!(?other, "periodic task delivered an unexpected payload"),
        });
        self.registrations.insert(source, Registration::Periodic { task, callback });
        Ok(source)
    }

    /// Run `job` once off the loop; `callback` receives its outcome on the
    /// loop and the task is then discarded.
    pub fn run_in_background<T, J, F>(&mut self, job: J, callback: F) -> Result<SourceId, LabError>
    where
        T: Send + 'static,
        J: FnOnce() -> Result<T, LabError> + Send + 'static,
        F: FnOnce(&mut D, &mut WorkerContext<D>, Result<T, LabError>) + 'static,
    {
        let task = BackgroundTask::spawn(job, self.poller.register())?;
        let source = task.source();
        let callback: OnceCallback<D> = Box::new(move |device, ctx, payload| {
            match payload.downcast::<Result<T, LabError>>() {
                Ok(outcome) => callback(device, ctx, outcome),
                Err(other) => warn!(?other, "background task delivered an unexpected payload"),
            }
        });
        self.registrations.insert(source, Registration::Background { task, callback });
        Ok(source)
    }

    /// Subscribe to another worker's publish channel; matching envelopes are
    /// handed to `callback` on this worker's loop.
    pub fn subscribe<F>(&mut self, endpoint: &Endpoint, topics: &[Topic], callback: F) -> Result<SourceId, LabError>
    where
        F: FnMut(&mut D, &mut WorkerContext<D>, Envelope) + 'static,
    {
        let signal = self.poller.register();
        let source = signal.source();
        let subscriber = Subscriber::spawn(endpoint.pub_addr(), topics, move |envelope| {
            signal.deliver(envelope);
        })?;
        self.registrations.insert(
            source,
            Registration::Subscription {
                subscriber,
                callback: Box::new(callback),
            },
        );
        Ok(source)
    }

    /// Stop and unregister a source.  Safe to call from the source's own
    /// callback.  Returns `false` for unknown sources.
    pub fn stop_source(&mut self, source: SourceId) -> bool {
        if let Some(mut registration) = self.registrations.remove(&source) {
            registration.stop();
            return true;
        }
        match &mut self.in_flight {
            Some((running, cancelled)) if *running == source => {
                *cancelled = true;
                true
            }
            _ => false,
        }
    }

    /// Number of live registrations (timers, tasks, subscriptions).
    pub fn active_sources(&self) -> usize {
        self.registrations.len()
    }

    /// Queue a line for the STDOUT topic.
    pub fn print(&self, line: impl Into<String>) {
        self.output.print(line);
    }

    /// Queue a line for the STDERR topic.
    pub fn eprint(&self, line: impl Into<String>) {
        self.output.eprint(line);
    }

    /// Ask the worker to stop after the current event.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    fn dispatch_signal(&mut self, device: &mut D, signal: Signal) {
        let source = signal.source;
        let Some(registration) = self.registrations.remove(&source) else {
            debug!(%source, "signal from a stopped source ignored");
            return;
        };
        let kind = registration.kind();
        self.in_flight = Some((source, false));
        let keep = match registration {
            Registration::Timer { timer, mut callback } => {
                guarded(kind, || callback(device, self));
                Some(Registration::Timer { timer, callback })
            }
            Registration::Periodic { task, mut callback } => {
                guarded(kind, || callback(device, self, signal.payload));
                Some(Registration::Periodic { task, callback })
            }
            Registration::Background { mut task, callback } => {
                guarded(kind, || callback(device, self, signal.payload));
                task.join();
                None
            }
            Registration::Subscription { subscriber, mut callback } => match signal.payload.downcast::<Envelope>() {
                Ok(envelope) => {
                    guarded(kind, || callback(device, self, envelope));
                    Some(Registration::Subscription { subscriber, callback })
                }
                Err(other) => {
                    warn!(?other, "subscription delivered an unexpected payload");
                    Some(Registration::Subscription { subscriber, callback })
                }
            },
        };
        let cancelled = matches!(self.in_flight.take(), Some((_, true)));
        if let Some(mut registration) = keep {
            if cancelled {
                registration.stop();
            } else {
                self.registrations.insert(source, registration);
            }
        }
    }

    fn stop_all(&mut self) {
        for (source, mut registration) in self.registrations.drain() {
            debug!(%source, kind = registration.kind(), "stopping");
            registration.stop();
        }
    }
}

fn guarded(kind: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!(kind, panic = %panic_message(panic.as_ref()), "callback panicked");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DeviceWorker
// ─────────────────────────────────────────────────────────────────────────────

enum LoopEvent {
    Request(IncomingRequest),
    Signal(Signal),
    Idle,
}

/// Hosts one [`Device`] behind a request/reply and a publish endpoint.
pub struct DeviceWorker<D: Device> {
    device: D,
    methods: Methods<D>,
    config: WorkerConfig,
    output: OutputCapture,
    shutdown: ShutdownHandle,
    state: WorkerState,
}

impl<D: Device> DeviceWorker<D> {
    pub fn new(device: D, config: WorkerConfig) -> Self {
        let mut methods = D::remote_methods();
        methods.insert_default("status", |device: &mut D, _: &mut WorkerContext<D>, _: CallArgs| {
            Ok(Value::Object(device.status()?))
        });
        let mut names = methods.names();
        if !names.iter().any(|n| n == "remote_methods") {
            names.push("remote_methods".to_string());
            names.sort();
        }
        methods.insert_default("remote_methods", move |_: &mut D, _: &mut WorkerContext<D>, _: CallArgs| {
            Ok(Value::from(names.clone()))
        });
        Self {
            device,
            methods,
            config,
            output: OutputCapture::new(),
            shutdown: ShutdownHandle::new(),
            state: WorkerState::Created,
        }
    }

    /// Publish lines from this capture (typically the one wired into the
    /// process's tracing subscriber) on the output topics.
    pub fn with_output(mut self, output: OutputCapture) -> Self {
        self.output = output;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Run the worker to completion on a private Tokio runtime.
    ///
    /// Must not be called from inside an async context; use
    /// [`serve`](Self::serve) there.
    pub fn run(&mut self) -> Result<(), LabError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("labmesh-worker-io")
            .enable_all()
            .build()?;
        runtime.block_on(self.serve())
    }

    /// Run the worker to completion on the current runtime.
    ///
    /// # Errors
    ///
    /// Fails without entering the loop when the refresh period is zero, an
    /// endpoint cannot be bound or the worker has already run.
    pub async fn serve(&mut self) -> Result<(), LabError> {
        if self.state != WorkerState::Created {
            return Err(LabError::device("worker", format!("cannot run a worker that is {}", self.state)));
        }
        if let Err(e) = check_period("refresh_period", self.config.refresh_period) {
            self.state = WorkerState::Stopped;
            error!(req_port = self.config.req_port, error = %e, "invalid worker configuration");
            return Err(e);
        }
        let host = &self.config.bind_host;
        let bound = async {
            let server = ReplyServer::bind(&format!("{host}:{}", self.config.req_port)).await?;
            let publisher = Publisher::bind(&format!("{host}:{}", self.config.pub_port)).await?;
            Ok::<_, LabError>((server, publisher))
        }
        .await;
        let (mut server, publisher) = match bound {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.state = WorkerState::Stopped;
                error!(req_port = self.config.req_port, pub_port = self.config.pub_port, error = %e, "worker failed to bind");
                return Err(e);
            }
        };

        self.state = WorkerState::Running;
        info!(
            device = std::any::type_name::<D>(),
            req_port = self.config.req_port,
            pub_port = self.config.pub_port,
            "worker started"
        );

        let mut ctx = WorkerContext::new(self.config.clone(), self.output.clone());
        match catch_unwind(AssertUnwindSafe(|| self.device.init_device(&mut ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "init_device failed"),
            Err(panic) => error!(panic = %panic_message(panic.as_ref()), "init_device panicked"),
        }

        let mut status_timer = Timer::start(self.config.refresh_period, ctx.poller.register())?;
        let status_source = status_timer.source();

        while !ctx.stop_requested && !self.shutdown.is_requested() {
            let event = tokio::select! {
                request = server.next() => match request {
                    Some(request) => LoopEvent::Request(request),
                    None => LoopEvent::Idle,
                },
                signal = ctx.poller.recv() => match signal {
                    Some(signal) => LoopEvent::Signal(signal),
                    None => LoopEvent::Idle,
                },
                _ = tokio::time::sleep(POLL_TIMEOUT) => LoopEvent::Idle,
            };
            match event {
                LoopEvent::Request(request) => {
                    let reply = self.handle_request(&mut ctx, &request.line);
                    request.respond(reply);
                }
                LoopEvent::Signal(signal) if signal.source == status_source => {
                    self.publish_status(&ctx, &publisher);
                }
                LoopEvent::Signal(signal) => ctx.dispatch_signal(&mut self.device, signal),
                LoopEvent::Idle => {}
            }
        }

        self.state = WorkerState::Stopping;
        info!(req_port = self.config.req_port, "worker stopping");
        match catch_unwind(AssertUnwindSafe(|| self.device.destroy_device(&mut ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "destroy_device failed"),
            Err(panic) => error!(panic = %panic_message(panic.as_ref()), "destroy_device panicked"),
        }
        status_timer.stop();
        ctx.stop_all();
        server.shutdown(REPLY_GRACE).await;
        publisher.close();

        self.state = WorkerState::Stopped;
        info!(req_port = self.config.req_port, pub_port = self.config.pub_port, "worker stopped");
        Ok(())
    }

    /// Decode, dispatch and answer one request line.  Never fails: every
    /// problem becomes an error response.
    fn handle_request(&mut self, ctx: &mut WorkerContext<D>, line: &str) -> String {
        let response = match Request::decode(line) {
            Err(e) => {
                warn!(error = %e, "invalid request");
                Response::error(request_id(line), ErrorKind::InvalidRequest, e.to_string())
            }
            Ok(request) => match request.kind {
                RequestKind::Quit => {
                    info!("quit requested");
                    ctx.request_stop();
                    Response::ok(request.id, Value::Null)
                }
                RequestKind::Rpc => self.call(ctx, request),
            },
        };
        match response.encode() {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "response could not be encoded");
                let fallback = Response::error(response.id, ErrorKind::InternalError, e.to_string());
                fallback.encode().unwrap_or_default()
            }
        }
    }

    fn call(&mut self, ctx: &mut WorkerContext<D>, request: Request) -> Response {
        let Request {
            id,
            method_name,
            args,
            kwargs,
            ..
        } = request;
        if !self.methods.contains(&method_name) {
            warn!(method = %method_name, "unknown method");
            return Response::error(id, ErrorKind::UnknownMethod, format!("no remote method `{method_name}`"));
        }
        let args = CallArgs::new(args, kwargs);
        let methods = &self.methods;
        let device = &mut self.device;
        let outcome = catch_unwind(AssertUnwindSafe(|| methods.dispatch(device, ctx, &method_name, args)));
        match outcome {
            Ok(Ok(result)) => Response::ok(id, result),
            Ok(Err(e)) => {
                error!(method = %method_name, error = %e, "remote method failed");
                Response::error(id, ErrorKind::InternalError, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(method = %method_name, panic = %message, "remote method panicked");
                Response::error(id, ErrorKind::InternalError, message)
            }
        }
    }

    fn publish_status(&mut self, ctx: &WorkerContext<D>, publisher: &Publisher) {
        match catch_unwind(AssertUnwindSafe(|| self.device.status())) {
            Ok(Ok(status)) => publish(publisher, Topic::Status, Value::Object(status)),
            Ok(Err(e)) => error!(error = %e, "status() failed"),
            Err(panic) => error!(panic = %panic_message(panic.as_ref()), "status() panicked"),
        }
        let output = ctx.output.drain();
        if !output.stdout.is_empty() {
            publish(publisher, Topic::Stdout, Value::from(output.stdout));
        }
        if !output.stderr.is_empty() {
            publish(publisher, Topic::Stderr, Value::from(output.stderr));
        }
    }
}

fn publish(publisher: &Publisher, topic: Topic, contents: Value) {
    if let Err(e) = publisher.publish(&Envelope::new(topic, contents)) {
        warn!(?topic, error = %e, "publish failed");
    }
}

/// Best-effort correlation id of a request that failed to decode.
fn request_id(line: &str) -> Option<Uuid> {
    let value: Value = serde_json::from_str(line).ok()?;
    serde_json::from_value(value.get("id")?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Counter {
        count: i64,
        log: Vec<String>,
    }

    impl Device for Counter {
        fn remote_methods() -> Methods<Self> {
            Methods::new()
                .expose("add", |c: &mut Counter, _: &mut WorkerContext<Counter>, args: CallArgs| {
                    c.count += args.get::<i64>(0, "n")?;
                    Ok(json!(c.count))
                })
                .expose("fail", |_: &mut Counter, _: &mut WorkerContext<Counter>, _: CallArgs| {
                    Err(LabError::device("counter", "refused"))
                })
                .expose("explode", |_: &mut Counter, _: &mut WorkerContext<Counter>, _: CallArgs| {
                    panic!("wiring fault")
                })
        }

        fn status(&mut self) -> Result<StatusMap, LabError> {
            let mut map = StatusMap::new();
            map.insert("count".into(), json!(self.count));
            Ok(map)
        }
    }

    fn worker() -> (DeviceWorker<Counter>, WorkerContext<Counter>) {
        let config = WorkerConfig::new(0, 0);
        let worker = DeviceWorker::new(
            Counter {
                count: 0,
                log: Vec::new(),
            },
            config.clone(),
        );
        (worker, WorkerContext::new(config, OutputCapture::new()))
    }

    fn rpc(method: &str, args: Vec<Value>) -> String {
        Request::rpc(method, args, Default::default()).encode().unwrap()
    }

    #[test]
    fn builtins_are_exposed() {
        let (mut worker, mut ctx) = worker();
        let reply = Response::decode(&worker.handle_request(&mut ctx, &rpc("remote_methods", vec![]))).unwrap();
        assert_eq!(reply.result, json!(["add", "explode", "fail", "remote_methods", "status"]));

        let reply = Response::decode(&worker.handle_request(&mut ctx, &rpc("status", vec![]))).unwrap();
        assert_eq!(reply.result, json!({"count": 0}));
    }

    #[test]
    fn dispatch_outcomes_map_to_error_kinds() {
        let (mut worker, mut ctx) = worker();
        let cases = [
            (rpc("add", vec![json!(2)]), ErrorKind::None),
            (rpc("nope", vec![]), ErrorKind::UnknownMethod),
            (rpc("fail", vec![]), ErrorKind::InternalError),
            (rpc("explode", vec![]), ErrorKind::InternalError),
            (rpc("add", vec![json!("two")]), ErrorKind::InternalError),
            ("{not json".to_string(), ErrorKind::InvalidRequest),
            (r#"{"type":"launch"}"#.to_string(), ErrorKind::InvalidRequest),
        ];
        for (line, expected) in cases {
            let reply = Response::decode(&worker.handle_request(&mut ctx, &line)).unwrap();
            assert_eq!(reply.error, expected, "for {line}");
        }
        // The panic did not poison anything; the worker still serves calls.
        let reply = Response::decode(&worker.handle_request(&mut ctx, &rpc("add", vec![json!(3)]))).unwrap();
        assert_eq!(reply.result, json!(5));
    }

    #[test]
    fn replies_echo_the_request_id() {
        let (mut worker, mut ctx) = worker();
        let request = Request::rpc("add", vec![json!(1)], Default::default());
        let reply = Response::decode(&worker.handle_request(&mut ctx, &request.encode().unwrap())).unwrap();
        assert_eq!(reply.id, request.id);

        let id = Uuid::new_v4();
        let broken = format!(r#"{{"type":"bogus","id":"{id}"}}"#);
        let reply = Response::decode(&worker.handle_request(&mut ctx, &broken)).unwrap();
        assert_eq!(reply.id, Some(id));
    }

    #[test]
    fn quit_requests_a_stop() {
        let (mut worker, mut ctx) = worker();
        let reply = Response::decode(&worker.handle_request(&mut ctx, &Request::quit().encode().unwrap())).unwrap();
        assert_eq!(reply.error, ErrorKind::None);
        assert!(ctx.stop_requested);
    }

    #[test]
    fn background_registration_is_released_after_delivery() -> Result<(), Box<dyn std::error::Error>> {
        let (mut worker, mut ctx) = worker();
        ctx.run_in_background(
            || Ok(40),
            |c: &mut Counter, _: &mut WorkerContext<Counter>, outcome: Result<i64, LabError>| {
                c.count += outcome.unwrap_or(0) + 2;
            },
        )?;
        assert_eq!(ctx.active_sources(), 1);
        let signal = ctx.poller.recv_blocking().ok_or("no signal")?;
        ctx.dispatch_signal(&mut worker.device, signal);
        assert_eq!(worker.device.count, 42);
        assert_eq!(ctx.active_sources(), 0);
        Ok(())
    }

    #[test]
    fn a_timer_can_stop_itself_from_its_callback() -> Result<(), Box<dyn std::error::Error>> {
        let (mut worker, mut ctx) = worker();
        let source = std::rc::Rc::new(std::cell::Cell::new(None));
        let own = source.clone();
        let id = ctx.start_timer(Duration::from_millis(5), move |c: &mut Counter, ctx: &mut WorkerContext<Counter>| {
            c.log.push("tick".into());
            if let Some(id) = own.get() {
                ctx.stop_source(id);
            }
        })?;
        source.set(Some(id));

        let signal = ctx.poller.recv_blocking().ok_or("no signal")?;
        ctx.dispatch_signal(&mut worker.device, signal);
        assert_eq!(worker.device.log, vec!["tick"]);
        assert_eq!(ctx.active_sources(), 0);
        Ok(())
    }
}
