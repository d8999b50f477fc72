//! Client-side request channel.
//!
//! A blocking, single-outstanding-request connection to a worker's
//! `req_port`.  The connection is opened lazily and every round trip is
//! bounded by the configured timeout (connect time included).  Any failure
//! (timeout, refused connection, peer hang-up) drops the socket so that the
//! next round trip starts from a fresh connection to the same address; the
//! failed round trip itself is reported as [`LabError::Connection`] and never
//! retried here.

use std::io::{BufReader, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use labmesh_types::LabError;
use tracing::{debug, warn};

use crate::codec::{read_line, write_line};

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

/// Blocking request/reply client.
pub struct RequestChannel {
    address: String,
    timeout: Duration,
    conn: Option<Connection>,
}

impl RequestChannel {
    /// Create a channel to `address` (`host:port`).  No connection is made
    /// until the first [`roundtrip`](Self::roundtrip).
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            conn: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Send `line` and wait for the single reply line.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Connection`] when no reply arrives within the
    /// timeout or the transport fails; the socket has already been reset
    /// when this returns.
    pub fn roundtrip(&mut self, line: &str) -> Result<String, LabError> {
        let deadline = Instant::now() + self.timeout;
        match self.try_roundtrip(line, deadline) {
            Ok(reply) => Ok(reply),
            Err(reason) => {
                warn!(address = %self.address, %reason, "request failed; resetting connection");
                self.reset();
                Err(LabError::Connection {
                    endpoint: self.address.clone(),
                    reason,
                })
            }
        }
    }

    /// Drop the current connection; the next round trip reconnects.
    pub fn reset(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.writer.shutdown(Shutdown::Both);
        }
    }

    pub fn close(&mut self) {
        self.reset();
    }

    fn try_roundtrip(&mut self, line: &str, deadline: Instant) -> Result<String, String> {
        if self.conn.is_none() {
            self.conn = Some(self.connect(deadline)?);
        }
        let conn = self.conn.as_mut().ok_or("not connected")?;

        conn.writer
            .set_write_timeout(Some(remaining(deadline)?))
            .map_err(|e| e.to_string())?;
        write_line(&mut conn.writer, line).map_err(describe)?;

        conn.reader
            .get_ref()
            .set_read_timeout(Some(remaining(deadline)?))
            .map_err(|e| e.to_string())?;
        match read_line(&mut conn.reader) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err("connection closed by peer".to_string()),
            Err(e) => Err(describe(e)),
        }
    }

    fn connect(&self, deadline: Instant) -> Result<Connection, String> {
        let addrs: Vec<SocketAddr> = self
            .address
            .to_socket_addrs()
            .map_err(|e| format!("cannot resolve {}: {e}", self.address))?
            .collect();
        let mut last_error = format!("no address for {}", self.address);
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, remaining(deadline)?) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let writer = stream.try_clone().map_err(|e| e.to_string())?;
                    debug!(%addr, "request channel connected");
                    return Ok(Connection {
                        reader: BufReader::new(stream),
                        writer,
                    });
                }
                Err(e) => last_error = describe(e),
            }
        }
        Err(last_error)
    }
}

impl Drop for RequestChannel {
    fn drop(&mut self) {
        self.reset();
    }
}

fn remaining(deadline: Instant) -> Result<Duration, String> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err("request timed out".to_string())
    } else {
        Ok(left)
    }
}

fn describe(e: std::io::Error) -> String {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => "request timed out".to_string(),
        _ => e.to_string(),
    }
}
