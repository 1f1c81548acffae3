//! In-process duplex transport.
//!
//! [`duplex`] returns a connected reader/writer pair for the server side and a
//! [`MemoryPeer`] that plays the remote client. Useful for driving sessions in
//! tests without sockets.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{CloseReason, FrameReader, FrameWriter, Inbound, TransportError};

/// A frame written by the server side, as observed by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Ping,
    Close(Option<CloseReason>),
}

/// Receiving half of an in-memory connection.
pub struct MemoryReader {
    rx: mpsc::Receiver<Result<Inbound, TransportError>>,
}

/// Sending half of an in-memory connection.
pub struct MemoryWriter {
    tx: mpsc::Sender<Outgoing>,
    closed: bool,
}

/// The remote end of an in-memory connection.
///
/// Dropping the peer closes the connection as seen by the reader.
pub struct MemoryPeer {
    tx: mpsc::Sender<Result<Inbound, TransportError>>,
    rx: mpsc::Receiver<Outgoing>,
}

/// Create a connected in-memory transport.
///
/// `capacity` bounds both directions; a peer that stops reading makes
/// writes wait, like a stalled socket.
#[must_use]
pub fn duplex(capacity: usize) -> (MemoryReader, MemoryWriter, MemoryPeer) {
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (out_tx, out_rx) = mpsc::channel(capacity);
    (
        MemoryReader { rx: in_rx },
        MemoryWriter {
            tx: out_tx,
            closed: false,
        },
        MemoryPeer {
            tx: in_tx,
            rx: out_rx,
        },
    )
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

impl MemoryWriter {
    async fn push(&mut self, frame: Outgoing) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.push(Outgoing::Text(text.to_owned())).await
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.push(Outgoing::Ping).await
    }

    async fn close(&mut self, reason: Option<CloseReason>) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        let result = self.push(Outgoing::Close(reason)).await;
        self.closed = true;
        result
    }
}

impl MemoryPeer {
    /// Send a text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has dropped its reader.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Inbound::Text(text.into())).await
    }

    /// Send a keepalive ping to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has dropped its reader.
    pub async fn send_ping(&self) -> Result<(), TransportError> {
        self.send(Inbound::Ping).await
    }

    /// Answer a ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has dropped its reader.
    pub async fn send_pong(&self) -> Result<(), TransportError> {
        self.send(Inbound::Pong).await
    }

    /// Deliver an arbitrary inbound frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has dropped its reader.
    pub async fn send(&self, frame: Inbound) -> Result<(), TransportError> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Make the server's next read fail with `error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has dropped its reader.
    pub async fn fail(&self, error: TransportError) -> Result<(), TransportError> {
        self.tx
            .send(Err(error))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame written by the server.
    ///
    /// Returns `None` once the writer has been dropped.
    pub async fn recv(&mut self) -> Option<Outgoing> {
        self.rx.recv().await
    }

    /// Receive the next frame that is not a ping.
    pub async fn recv_skip_pings(&mut self) -> Option<Outgoing> {
        loop {
            match self.rx.recv().await {
                Some(Outgoing::Ping) => continue,
                other => return other,
            }
        }
    }
}
