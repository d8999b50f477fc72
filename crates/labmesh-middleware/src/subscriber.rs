//! Client-side subscription to a worker's publish channel.
//!
//! A [`Subscriber`] owns one background thread that connects to the
//! worker's `pub_port`, decodes every envelope, drops the ones whose topic
//! was not asked for and hands the rest to the callback.  When the worker
//! goes away the thread keeps retrying the connection until it is stopped,
//! so a subscription outlives worker restarts on the same port.

use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use labmesh_types::{Envelope, LabError, Topic};
use tracing::{debug, error, warn};

use crate::codec::read_line;

/// Delay between reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(250);

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Background reader of a publish channel.  Stopping is synchronous: after
/// [`stop`](Self::stop) returns the callback will not run again.
pub struct Subscriber {
    address: String,
    topics: Vec<Topic>,
    stopped: Arc<AtomicBool>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    wake: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Subscriber {
    /// Start reading `address` (`host:port`) and deliver envelopes of the
    /// given `topics` to `callback`, in publish order.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Io`] when the reader thread cannot be spawned.
    pub fn spawn<F>(address: impl Into<String>, topics: &[Topic], callback: F) -> Result<Self, LabError>
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let address = address.into();
        let topics = topics.to_vec();
        let stopped = Arc::new(AtomicBool::new(false));
        let stream = Arc::new(Mutex::new(None));
        let (wake, wait) = mpsc::channel();

        let reader = Reader {
            address: address.clone(),
            topics: topics.clone(),
            stopped: Arc::clone(&stopped),
            stream: Arc::clone(&stream),
            wait,
            callback: Box::new(callback),
        };
        let thread = thread::Builder::new()
            .name("labmesh-sub".into())
            .spawn(move || reader.run())?;

        Ok(Self {
            address,
            topics,
            stopped,
            stream,
            wake: Some(wake),
            thread: Some(thread),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the reader thread and wait for it to exit.  Idempotent.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        {
            let guard = self.stream.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(stream) = guard.as_ref() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        self.wake.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(address = %self.address, "subscriber thread panicked");
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Reader {
    address: String,
    topics: Vec<Topic>,
    stopped: Arc<AtomicBool>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    wait: mpsc::Receiver<()>,
    callback: Box<dyn FnMut(Envelope) + Send>,
}

impl Reader {
    fn run(mut self) {
        while !self.stopped.load(Ordering::SeqCst) {
            match self.connect() {
                Ok(stream) => {
                    if self.read_until_closed(stream) {
                        break;
                    }
                }
                Err(e) => debug!(address = %self.address, error = %e, "subscriber connect failed"),
            }
            match self.wait.recv_timeout(RECONNECT_DELAY) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
        }
        debug!(address = %self.address, "subscriber stopped");
    }

    fn connect(&self) -> std::io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = self.address.to_socket_addrs()?.collect();
        let mut last = std::io::Error::new(std::io::ErrorKind::NotFound, "address did not resolve");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Read envelopes until the connection drops.  Returns `true` when the
    /// subscriber was stopped.
    fn read_until_closed(&mut self, stream: TcpStream) -> bool {
        {
            let mut guard = self.stream.lock().unwrap_or_else(|e| e.into_inner());
            if self.stopped.load(Ordering::SeqCst) {
                return true;
            }
            match stream.try_clone() {
                Ok(clone) => *guard = Some(clone),
                Err(e) => {
                    warn!(address = %self.address, error = %e, "cannot clone subscriber socket");
                    return false;
                }
            }
        }
        debug!(address = %self.address, "subscriber connected");

        let mut reader = BufReader::new(stream);
        loop {
            let line = match read_line(&mut reader) {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(address = %self.address, error = %e, "subscriber read error");
                    break;
                }
            };
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let envelope = match Envelope::decode(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(address = %self.address, error = %e, "dropping malformed envelope");
                    continue;
                }
            };
            if !self.topics.contains(&envelope.topic) {
                continue;
            }
            let callback = &mut self.callback;
            if catch_unwind(AssertUnwindSafe(|| callback(envelope))).is_err() {
                error!(address = %self.address, "subscriber callback panicked");
            }
        }

        self.stream.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::TcpListener;
    use std::time::Instant;

    use crate::codec::write_line;

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn filters_by_topic_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut sub = Subscriber::spawn(addr, &[Topic::Status], move |env| {
            sink.lock().unwrap().push(env.contents);
        })
        .unwrap();

        let (mut conn, _) = listener.accept().unwrap();
        for (topic, n) in [(Topic::Status, 1), (Topic::Stdout, 2), (Topic::Status, 3)] {
            let line = Envelope::new(topic, json!(n)).encode().unwrap();
            write_line(&mut conn, &line).unwrap();
        }

        assert!(wait_until(|| seen.lock().unwrap().len() == 2));
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(3)]);
        sub.stop();
        assert!(!sub.is_running());
    }

    #[test]
    fn reconnects_after_the_publisher_restarts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = Subscriber::spawn(addr, &Topic::ALL, move |env| {
            sink.lock().unwrap().push(env.contents);
        })
        .unwrap();

        let (mut first, _) = listener.accept().unwrap();
        write_line(&mut first, &Envelope::new(Topic::Status, json!("a")).encode().unwrap()).unwrap();
        assert!(wait_until(|| seen.lock().unwrap().len() == 1));
        drop(first);

        let (mut second, _) = listener.accept().unwrap();
        write_line(&mut second, &Envelope::new(Topic::Status, json!("b")).encode().unwrap()).unwrap();
        assert!(wait_until(|| seen.lock().unwrap().len() == 2));
    }

    #[test]
    fn stop_returns_while_blocked_on_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut sub = Subscriber::spawn(addr, &Topic::ALL, |_| {}).unwrap();
        let (_conn, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        sub.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn panicking_callback_does_not_kill_the_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let _sub = Subscriber::spawn(addr, &Topic::ALL, move |_| {
            let mut n = sink.lock().unwrap();
            *n += 1;
            if *n == 1 {
                drop(n);
                panic!("first envelope");
            }
        })
        .unwrap();

        let (mut conn, _) = listener.accept().unwrap();
        for i in 0..2 {
            write_line(&mut conn, &Envelope::new(Topic::Status, json!(i)).encode().unwrap()).unwrap();
        }
        assert!(wait_until(|| *count.lock().unwrap() == 2));
    }
}
