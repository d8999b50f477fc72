//! Worker-side publish endpoint.
//!
//! Built on a [`tokio::sync::broadcast`] channel: every envelope is encoded
//! once and handed to one forwarding task per connected subscriber, so a
//! slow subscriber never blocks the worker or the other subscribers.  A
//! subscriber that falls more than [`DEFAULT_CAPACITY`] envelopes behind
//! skips the oldest ones and a lag warning is logged.

use std::net::SocketAddr;
use std::sync::Arc;

use labmesh_types::{Envelope, LabError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::codec::write_line_async;

/// Envelopes buffered per subscriber before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out publisher bound to a worker's `pub_port`.
pub struct Publisher {
    sender: broadcast::Sender<Arc<str>>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Publisher {
    /// Bind the publish endpoint and start accepting subscribers.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Io`] when the address cannot be bound.
    pub async fn bind(addr: &str) -> Result<Self, LabError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        let accept_sender = sender.clone();
        let accept_task = tokio::spawn(accept_loop(listener, accept_sender));
        debug!(%local_addr, "publisher bound");
        Ok(Self {
            sender,
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of subscribers currently connected.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish `envelope` to every connected subscriber.
    ///
    /// Returns the number of subscribers that were handed the envelope.
    /// Publishing with nobody listening is normal and returns `Ok(0)`.
    pub fn publish(&self, envelope: &Envelope) -> Result<usize, LabError> {
        let line: Arc<str> = Arc::from(envelope.encode()?);
        Ok(self.sender.send(line).unwrap_or(0))
    }

    /// Stop accepting subscribers and disconnect the existing ones.
    pub fn close(self) {
        self.accept_task.abort();
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, sender: broadcast::Sender<Arc<str>>) {
    let mut forwarders = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "subscriber connected");
                    let rx = sender.subscribe();
                    forwarders.spawn(forward(stream, peer, rx));
                }
                Err(e) => warn!(error = %e, "publisher accept error"),
            },
            Some(_) = forwarders.join_next(), if !forwarders.is_empty() => {}
        }
    }
}

async fn forward(mut stream: TcpStream, peer: SocketAddr, mut rx: broadcast::Receiver<Arc<str>>) {
    loop {
        match rx.recv().await {
            Ok(line) => {
                if let Err(e) = write_line_async(&mut stream, &line).await {
                    debug!(%peer, error = %e, "subscriber disconnected");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(%peer, lagged_by = n, "subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labmesh_types::Topic;
    use serde_json::json;
    use tokio::io::BufReader;
    use tokio::time::{Duration, sleep, timeout};

    use crate::codec::read_line_async;

    async fn wait_for_subscribers(publisher: &Publisher, n: usize) {
        for _ in 0..200 {
            if publisher.subscriber_count() >= n {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("subscribers never connected");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let publisher = Publisher::bind("127.0.0.1:0").await?;
        let n = publisher.publish(&Envelope::new(Topic::Status, json!({})))?;
        assert_eq!(n, 0);
        Ok(())
    }

    #[tokio::test]
    async fn every_subscriber_receives_every_envelope() -> Result<(), Box<dyn std::error::Error>> {
        let publisher = Publisher::bind("127.0.0.1:0").await?;
        let addr = publisher.local_addr();

        let mut a = BufReader::new(TcpStream::connect(addr).await?);
        let mut b = BufReader::new(TcpStream::connect(addr).await?);
        wait_for_subscribers(&publisher, 2).await;

        publisher.publish(&Envelope::new(Topic::Status, json!({"voltage": 1.0})))?;
        publisher.publish(&Envelope::new(Topic::Stdout, json!(["hello"])))?;

        for reader in [&mut a, &mut b] {
            let first = timeout(Duration::from_secs(2), read_line_async(reader)).await??;
            let first = Envelope::decode(&first.ok_or("closed")?)?;
            assert_eq!(first.topic, Topic::Status);
            let second = timeout(Duration::from_secs(2), read_line_async(reader)).await??;
            let second = Envelope::decode(&second.ok_or("closed")?)?;
            assert_eq!(second.topic, Topic::Stdout);
        }
        Ok(())
    }

    #[tokio::test]
    async fn close_disconnects_subscribers() -> Result<(), Box<dyn std::error::Error>> {
        let publisher = Publisher::bind("127.0.0.1:0").await?;
        let mut sub = BufReader::new(TcpStream::connect(publisher.local_addr()).await?);
        wait_for_subscribers(&publisher, 1).await;

        publisher.close();
        let line = timeout(Duration::from_secs(2), read_line_async(&mut sub)).await?;
        assert!(matches!(line, Ok(None) | Err(_)));
        Ok(())
    }
}
