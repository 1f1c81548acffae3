//! Transport abstraction traits for Switchyard.
//!
//! A connection is handled as two independent halves: a [`FrameReader`] driven
//! by the read loop and a [`FrameWriter`] driven by the write loop. The two
//! halves are moved into different tasks, so neither trait requires `Sync`.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a connection.
///
/// Distinguishes two sessions of the same user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// A frame received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame.
    Text(String),
    /// A binary frame. The protocol is text-only, so these are ignored upstream.
    Binary(Vec<u8>),
    /// A keepalive ping from the peer. The transport answers it.
    Ping,
    /// A keepalive pong answering one of our pings.
    Pong,
}

/// Close code and reason sent with a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    /// Token refresh failed.
    pub const SESSION_EXPIRED: u16 = 4001;
    /// A newer connection of the same user took over.
    pub const SESSION_REPLACED: u16 = 4002;

    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn session_expired() -> Self {
        Self::new(Self::SESSION_EXPIRED, "session expired")
    }

    #[must_use]
    pub fn session_replaced() -> Self {
        Self::new(Self::SESSION_REPLACED, "session replaced")
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation did not complete before its deadline.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound frame exceeds the read limit.
    #[error("Frame of {size} bytes exceeds read limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The receiving half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` if the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

/// The sending half of a connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Send a keepalive ping.
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Send a close frame and shut the sending half down.
    ///
    /// Closing twice is a no-op.
    async fn close(&mut self, reason: Option<CloseReason>) -> Result<(), TransportError>;
}
