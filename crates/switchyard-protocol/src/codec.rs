//! Codec for encoding and decoding Switchyard events.
//!
//! Frames are JSON text. Outbound events are encoded once per fan-out and
//! shared between recipients; inbound frames are size-checked before parsing.

use std::sync::Arc;

use thiserror::Error;

use crate::events::{ClientEvent, Event};

/// Default maximum inbound frame size in bytes.
pub const MAX_FRAME_SIZE: usize = 4096;

/// An encoded frame, cheap to clone across recipients.
pub type EncodedEvent = Arc<str>;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Envelope is not valid JSON or not an object with a `type`.
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope has an empty `type`.
    #[error("Event type cannot be empty")]
    EmptyType,

    /// Payload does not match the shape required by its tag.
    #[error("Invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode an event to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(event: &Event) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Encode an event into a shareable frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_shared(event: &Event) -> Result<EncodedEvent, ProtocolError> {
    encode(event).map(Arc::from)
}

/// Decode an inbound frame into an envelope, limited to [`MAX_FRAME_SIZE`].
///
/// # Errors
///
/// Returns an error if the frame is too large or not a valid envelope.
pub fn decode(text: &str) -> Result<Event, ProtocolError> {
    decode_with_limit(text, MAX_FRAME_SIZE)
}

/// Decode an inbound frame of at most `max` bytes into an envelope.
///
/// # Errors
///
/// Returns an error if the frame is too large or not a valid envelope.
pub fn decode_with_limit(text: &str, max: usize) -> Result<Event, ProtocolError> {
    if text.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max,
        });
    }

    let event: Event = serde_json::from_str(text)?;
    if event.kind.is_empty() {
        return Err(ProtocolError::EmptyType);
    }

    Ok(event)
}

/// Decode an inbound frame of at most `max` bytes into a client event.
///
/// Returns `Ok(None)` when the envelope is valid but its tag is not one a
/// client may send.
///
/// # Errors
///
/// Returns an error if the frame is too large, or the envelope or its
/// payload is malformed.
pub fn decode_client(text: &str, max: usize) -> Result<Option<ClientEvent>, ProtocolError> {
    let event = decode_with_limit(text, max)?;
    ClientEvent::from_event(&event)
}
