//! # switchyard-protocol
//!
//! Wire protocol definitions for the Switchyard event gateway.
//!
//! Clients and the gateway exchange JSON text frames shaped as
//! `{"type": <tag>, "data": <payload>}`. This crate defines the envelope,
//! the tag catalogue, the typed payloads and the codec.
//!
//! ## Example
//!
//! ```rust
//! use switchyard_protocol::{codec, tags, Event};
//!
//! let event = Event::new(tags::MESSAGE_CREATE, serde_json::json!({"content": "hi"})).unwrap();
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.kind, "MESSAGE_CREATE");
//! ```

pub mod codec;
pub mod events;
pub mod payloads;

pub use codec::{decode, decode_with_limit, encode, EncodedEvent, ProtocolError, MAX_FRAME_SIZE};
pub use events::{tags, ClientEvent, Event};
pub use payloads::*;
