//! A managed connection to a single device.
//!
//! Wraps a framed TCP stream with a background I/O task so callers
//! interact through plain channels. Per-direction ordering is
//! preserved: one ordered stream in, one ordered stream out. Dropping
//! the [`Connection`] handle closes both channels, which ends the I/O
//! task and closes the socket, so the peer observes EOF promptly.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::WireCodec;
use crate::error::TandemError;
use crate::message::{Decoded, Message};

/// Cloneable handle for writing to a connection.
pub type ConnectionSender = mpsc::Sender<Message>;

/// A live bidirectional message stream to one device.
#[derive(Debug)]
pub struct Connection {
    tx: ConnectionSender,
    rx: mpsc::Receiver<Decoded>,
}

impl Connection {
    /// Take ownership of a TCP stream and spawn its I/O task.
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".into());
        let mut framed = Framed::new(stream, WireCodec::new());

        // Caller -> network
        let (user_tx, mut outbound_rx) = mpsc::channel::<Message>(100);

        // Network -> caller
        let (inbound_tx, user_rx) = mpsc::channel::<Decoded>(100);

        // One task owns the framed stream for both directions, so the
        // socket is dropped (and the peer sees EOF) as soon as either
        // side of the conversation ends.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => match outbound {
                        Some(msg) => {
                            if let Err(e) = framed.send(msg).await {
                                warn!(peer = %peer, error = %e, "connection write failed");
                                break;
                            }
                        }
                        // Connection handle dropped.
                        None => break,
                    },
                    inbound = framed.next() => match inbound {
                        Some(Ok(item)) => {
                            if inbound_tx.send(item).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(peer = %peer, error = %e, "connection read failed");
                            break;
                        }
                        // Peer closed the stream.
                        None => break,
                    },
                }
            }
            debug!(peer = %peer, "connection task done");
        });

        Self {
            tx: user_tx,
            rx: user_rx,
        }
    }

    /// Dial the coordinator endpoint described by `info`.
    pub async fn connect(info: &ConnectionInfo) -> Result<Self, TandemError> {
        let stream = TcpStream::connect(info.to_socket_string()).await?;
        Ok(Self::new(stream))
    }

    /// Queue one message for the I/O task.
    pub async fn send(&self, msg: Message) -> Result<(), TandemError> {
        self.tx.send(msg).await?;
        Ok(())
    }

    /// Receive the next inbound item. `None` means the peer is gone.
    pub async fn recv(&mut self) -> Option<Decoded> {
        self.rx.recv().await
    }

    /// A cloneable write handle, independent of the connection's
    /// lifetime borrow.
    pub fn sender(&self) -> ConnectionSender {
        self.tx.clone()
    }
}

// ── ConnectionInfo ───────────────────────────────────────────────

/// Host/port pair identifying one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn to_socket_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ── Tests ────────────────────────────────────────────────────────
