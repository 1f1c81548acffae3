//! # switchyard-core
//!
//! Connection registry, channel routing, and per-connection loops for the
//! Switchyard event gateway.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Registry of live connections and channel subscriptions
//! - **OutboundQueue** - Bounded per-connection queue with delivery policies
//! - **Client** - Read and write loops for one connection
//! - **Session** - `IDENTIFY` handshake and registration
//! - **Presence / Voice** - Online lifecycle and voice channel occupancy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Client    │────▶│     Hub     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                                       │
//!        │            ┌─────────────┐            │
//!        └────────────│  Outbound   │◀───────────┘
//!                     │   queue     │
//!                     └─────────────┘
//! ```

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod delivery;
pub mod directory;
pub mod handle;
pub mod hub;
pub mod outbound;
pub mod presence;
pub mod session;
pub mod voice;

pub use auth::{AuthError, Authenticator, Identity, StaticAuthenticator};
pub use broadcast::broadcast_to_members;
pub use client::{Client, ClientConfig, Termination};
pub use delivery::{Delivery, DeliveryConfig, DeliveryPolicy, DeliveryReport};
pub use directory::{DirectoryError, InMemoryDirectory, MemberDirectory};
pub use handle::ClientHandle;
pub use hub::{Hub, HubConfig, HubError, HubStats};
pub use outbound::{OutboundQueue, DEFAULT_OUTBOUND_CAPACITY};
pub use presence::{spawn_presence_fanout, PresenceChange};
pub use session::{accept, HandshakeError, SessionContext};
pub use voice::{VoiceState, VoiceStates};
