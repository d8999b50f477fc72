//! UDP host discovery.
//!
//! Every orchestrator periodically broadcasts its hostname (raw UTF-8, no
//! framing) on the discovery port and collects whatever announcements are
//! waiting.  There is no acknowledgement: a lost datagram only delays
//! detection until the next period.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use labmesh_types::LabError;
use tracing::{debug, warn};

/// Largest announcement accepted.
const MAX_DATAGRAM: usize = 1024;

pub struct Discovery {
    socket: UdpSocket,
    hostname: String,
    target: SocketAddr,
}

impl Discovery {
    /// Listen on `port` on all interfaces and announce to
    /// `broadcast_address:port`.
    pub fn bind(hostname: &str, port: u16, broadcast_address: &str) -> Result<Self, LabError> {
        let target = resolve(broadcast_address, port)?;
        Self::bind_with_target(hostname, port, target)
    }

    /// Listen on `port` and announce to an explicit `target` (unicast setups
    /// and tests).
    pub fn bind_with_target(hostname: &str, port: u16, target: SocketAddr) -> Result<Self, LabError> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        debug!(port, announce_to = %target, "discovery socket bound");
        Ok(Self {
            socket,
            hostname: hostname.to_string(),
            target,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn local_port(&self) -> Result<u16, LabError> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Send one announcement.
    pub fn announce(&self) -> Result<(), LabError> {
        self.socket.send_to(self.hostname.as_bytes(), self.target)?;
        Ok(())
    }

    /// Collect every announcement already queued, without waiting:
    /// hostname → sender IP.  Our own announcements are skipped; a hostname
    /// heard twice keeps its latest address.
    pub fn drain(&self) -> BTreeMap<String, String> {
        let mut found = BTreeMap::new();
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, sender)) => match std::str::from_utf8(&buf[..len]) {
                    Ok(name) => {
                        let name = name.trim();
                        if !name.is_empty() && name != self.hostname {
                            found.insert(name.to_string(), sender.ip().to_string());
                        }
                    }
                    Err(_) => debug!(%sender, "ignoring non-UTF-8 announcement"),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(error = %e, "discovery receive error");
                    break;
                }
            }
        }
        found
    }

    /// One discovery period: announce, then drain.
    pub fn poll(&self) -> BTreeMap<String, String> {
        if let Err(e) = self.announce() {
            warn!(announce_to = %self.target, error = %e, "discovery announcement failed");
        }
        self.drain()
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, LabError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| LabError::UnknownHost(host.to_string()))
}
