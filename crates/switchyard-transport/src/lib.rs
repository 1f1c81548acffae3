//! # switchyard-transport
//!
//! Transport abstraction layer for the Switchyard gateway.
//!
//! A connection is split into a [`FrameReader`] and a [`FrameWriter`] so the
//! read loop and the write loop can run as separate tasks:
//!
//! - **WebSocket** - axum upgraded sockets (feature `websocket`, default)
//! - **Memory** - an in-process duplex for tests and embedding
//!
//! ```rust,ignore
//! use switchyard_transport::{FrameReader, Inbound};
//!
//! async fn drain(mut reader: impl FrameReader) {
//!     while let Ok(Some(frame)) = reader.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{
    CloseReason, ConnectionId, FrameReader, FrameWriter, Inbound, TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketReader, WebSocketWriter};
