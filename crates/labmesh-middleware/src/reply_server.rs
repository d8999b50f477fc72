//! Worker-side request/reply endpoint.
//!
//! Each client connection gets its own task that reads one request line,
//! forwards it to the worker's event loop as an [`IncomingRequest`] and waits
//! for the loop's answer before reading the next line.  The connection is
//! therefore strictly request-then-reply; the worker state itself is only
//! ever touched by the loop that drains [`ReplyServer::next`].

use std::net::SocketAddr;
use std::time::Duration;

use labmesh_types::LabError;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::codec::{read_line_async, write_line_async};

/// One raw request line waiting for the event loop's reply.
#[derive(Debug)]
pub struct IncomingRequest {
    pub peer: SocketAddr,
    pub line: String,
    reply: oneshot::Sender<String>,
}

impl IncomingRequest {
    /// Send the reply line back to the client.  Exactly one reply per
    /// request; dropping an `IncomingRequest` without responding closes the
    /// client's connection.
    pub fn respond(self, line: String) {
        if self.reply.send(line).is_err() {
            debug!(peer = %self.peer, "client went away before the reply");
        }
    }
}

/// Request/reply server bound to a worker's `req_port`.
pub struct ReplyServer {
    incoming: mpsc::UnboundedReceiver<IncomingRequest>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ReplyServer {
    /// Bind the endpoint and start accepting clients.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn bind(addr: &str) -> Result<Self, LabError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, tx, shutdown_rx));
        debug!(%local_addr, "reply server bound");
        Ok(Self {
            incoming,
            local_addr,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next request from any client.
    pub async fn next(&mut self) -> Option<IncomingRequest> {
        self.incoming.recv().await
    }

    /// Stop accepting clients and drop every open connection immediately.
    pub fn close(self) {
        self.accept_task.abort();
    }

    /// Stop accepting clients, let every reply that was already handed to
    /// [`IncomingRequest::respond`] reach its client, then close all
    /// connections.  Requests still queued are dropped unanswered.  Waits at
    /// most `grace` before closing forcibly.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.shutdown.send(true);
        self.incoming.close();
        while self.incoming.try_recv().is_ok() {}
        if tokio::time::timeout(grace, &mut self.accept_task).await.is_err() {
            debug!(local_addr = %self.local_addr, "reply server shutdown timed out");
            self.accept_task.abort();
        }
    }
}

impl Drop for ReplyServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::UnboundedSender<IncomingRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "client connected");
                    connections.spawn(serve_client(stream, peer, tx.clone(), shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "reply server accept error"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    drop(tx);
    while connections.join_next().await.is_some() {}
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<IncomingRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        if *shutdown.borrow() {
            break;
        }
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = read_line_async(&mut reader) => read,
        };
        let line = match read {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(%peer, error = %e, "client read error");
                break;
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = IncomingRequest {
            peer,
            line,
            reply: reply_tx,
        };
        if tx.send(request).is_err() {
            break;
        }
        let Ok(reply) = reply_rx.await else {
            break;
        };
        if let Err(e) = write_line_async(&mut write_half, &reply).await {
            debug!(%peer, error = %e, "client write error");
            break;
        }
    }
    debug!(%peer, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn replies_in_request_order() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = ReplyServer::bind("127.0.0.1:0").await?;
        let stream = TcpStream::connect(server.local_addr()).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Pipelined lines are still answered one at a time, in order.
        write_half.write_all(b"first\nsecond\n").await?;

        for expected in ["first", "second"] {
            let req = timeout(Duration::from_secs(2), server.next()).await?.ok_or("closed")?;
            assert_eq!(req.line, expected);
            req.respond(format!("re:{expected}"));
            let reply = read_line_async(&mut reader).await?.ok_or("closed")?;
            assert_eq!(reply, format!("re:{expected}"));
        }
        Ok(())
    }

    #[tokio::test]
    async fn dropping_a_request_closes_the_client() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = ReplyServer::bind("127.0.0.1:0").await?;
        let stream = TcpStream::connect(server.local_addr()).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"ignored\n").await?;
        let req = timeout(Duration::from_secs(2), server.next()).await?.ok_or("closed")?;
        drop(req);

        let reply = timeout(Duration::from_secs(2), read_line_async(&mut reader)).await?;
        assert!(matches!(reply, Ok(None) | Err(_)));
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_flushes_answered_requests() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = ReplyServer::bind("127.0.0.1:0").await?;
        let addr = server.local_addr();
        let stream = TcpStream::connect(addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"quit\n").await?;
        let req = timeout(Duration::from_secs(2), server.next()).await?.ok_or("closed")?;
        req.respond("bye".to_string());
        server.shutdown(Duration::from_secs(1)).await;

        let reply = timeout(Duration::from_secs(2), read_line_async(&mut reader)).await??;
        assert_eq!(reply.as_deref(), Some("bye"));
        let after = timeout(Duration::from_secs(2), read_line_async(&mut reader)).await?;
        assert!(matches!(after, Ok(None) | Err(_)));
        assert!(TcpStream::connect(addr).await.is_err());
        Ok(())
    }
}
