//! Event envelope and tag catalogue for the Switchyard protocol.
//!
//! Every frame on the wire is a JSON envelope `{"type": ..., "data": ...}`.
//! The `type` tags listed in [`tags`] are part of the wire contract; any other
//! tag is routed untouched from external producers to clients.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;
use crate::payloads::{
    DmCallData, IdentifyData, PresenceUpdateData, SubscribeData, TokenRefreshData, TypingStartData,
    VoiceChannelData,
};

/// Event type tags.
pub mod tags {
    // Client -> server
    pub const IDENTIFY: &str = "IDENTIFY";
    pub const HEARTBEAT: &str = "HEARTBEAT";
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
    pub const TOKEN_REFRESH: &str = "TOKEN_REFRESH";
    pub const VOICE_JOIN: &str = "VOICE_JOIN";
    pub const VOICE_LEAVE: &str = "VOICE_LEAVE";
    pub const DM_CALL_START: &str = "DM_CALL_START";

    // Both directions
    pub const TYPING_START: &str = "TYPING_START";
    pub const PRESENCE_UPDATE: &str = "PRESENCE_UPDATE";
    pub const DM_CALL_ACCEPT: &str = "DM_CALL_ACCEPT";
    pub const DM_CALL_END: &str = "DM_CALL_END";

    // Server -> client
    pub const READY: &str = "READY";
    pub const HEARTBEAT_ACK: &str = "HEARTBEAT_ACK";
    pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
    pub const MESSAGE_UPDATE: &str = "MESSAGE_UPDATE";
    pub const MESSAGE_DELETE: &str = "MESSAGE_DELETE";
    pub const CHANNEL_CREATE: &str = "CHANNEL_CREATE";
    pub const CHANNEL_UPDATE: &str = "CHANNEL_UPDATE";
    pub const CHANNEL_DELETE: &str = "CHANNEL_DELETE";
    pub const MEMBER_JOIN: &str = "MEMBER_JOIN";
    pub const MEMBER_LEAVE: &str = "MEMBER_LEAVE";
    pub const VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
    pub const DM_MESSAGE_CREATE: &str = "DM_MESSAGE_CREATE";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const DM_CALL_RING: &str = "DM_CALL_RING";
}

/// A protocol event.
///
/// `kind` is serialized as `type`. `data` is an opaque payload whose shape
/// depends on the tag; it is `null` for events without a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Tag-specific payload.
    #[serde(default)]
    pub data: Value,
}

impl Event {
    /// Create an event, serializing `data` into the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` cannot be represented as JSON.
    pub fn new(kind: impl Into<String>, data: impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: kind.into(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Create an event with a `null` payload.
    #[must_use]
    pub fn empty(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: Value::Null,
        }
    }

    /// Decode the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPayload`] if the payload does not match `T`.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.data).map_err(|source| ProtocolError::InvalidPayload {
            kind: self.kind.clone(),
            source,
        })
    }

    /// Check the tag.
    #[must_use]
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// An event a client may send to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Identify(IdentifyData),
    Heartbeat,
    Subscribe(SubscribeData),
    Unsubscribe(SubscribeData),
    TypingStart(TypingStartData),
    PresenceUpdate(PresenceUpdateData),
    TokenRefresh(TokenRefreshData),
    VoiceJoin(VoiceChannelData),
    VoiceLeave(VoiceChannelData),
    DmCallStart(DmCallData),
    DmCallAccept(DmCallData),
    DmCallEnd(DmCallData),
}

impl ClientEvent {
    /// Interpret an envelope as a client event.
    ///
    /// Returns `Ok(None)` for tags that are not client -> server tags.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag is known but its payload is malformed.
    pub fn from_event(event: &Event) -> Result<Option<Self>, ProtocolError> {
        let parsed = match event.kind.as_str() {
            tags::IDENTIFY => Self::Identify(event.decode_data()?),
            tags::HEARTBEAT => Self::Heartbeat,
            tags::SUBSCRIBE => Self::Subscribe(event.decode_data()?),
            tags::UNSUBSCRIBE => Self::Unsubscribe(event.decode_data()?),
            tags::TYPING_START => Self::TypingStart(event.decode_data()?),
            tags::PRESENCE_UPDATE => Self::PresenceUpdate(event.decode_data()?),
            tags::TOKEN_REFRESH => Self::TokenRefresh(event.decode_data()?),
            tags::VOICE_JOIN => Self::VoiceJoin(event.decode_data()?),
            tags::VOICE_LEAVE => Self::VoiceLeave(event.decode_data()?),
            tags::DM_CALL_START => Self::DmCallStart(event.decode_data()?),
            tags::DM_CALL_ACCEPT => Self::DmCallAccept(event.decode_data()?),
            tags::DM_CALL_END => Self::DmCallEnd(event.decode_data()?),
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }

    /// Get the wire tag of this event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identify(_) => tags::IDENTIFY,
            Self::Heartbeat => tags::HEARTBEAT,
            Self::Subscribe(_) => tags::SUBSCRIBE,
            Self::Unsubscribe(_) => tags::UNSUBSCRIBE,
            Self::TypingStart(_) => tags::TYPING_START,
            Self::PresenceUpdate(_) => tags::PRESENCE_UPDATE,
            Self::TokenRefresh(_) => tags::TOKEN_REFRESH,
            Self::VoiceJoin(_) => tags::VOICE_JOIN,
            Self::VoiceLeave(_) => tags::VOICE_LEAVE,
            Self::DmCallStart(_) => tags::DM_CALL_START,
            Self::DmCallAccept(_) => tags::DM_CALL_ACCEPT,
            Self::DmCallEnd(_) => tags::DM_CALL_END,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::PresenceStatus;
    use serde_json::json;

    #[test]
    fn test_event_new_and_empty() {
        let event = Event::new(tags::MESSAGE_CREATE, json!({"content": "hello world"})).unwrap();
        assert_eq!(event.kind, "MESSAGE_CREATE");
        assert_eq!(event.data["content"], "hello world");

        let ack = Event::empty(tags::HEARTBEAT_ACK);
        assert!(ack.data.is_null());
        let text = serde_json::to_string(&ack).unwrap();
        assert!(text.contains(r#""type":"HEARTBEAT_ACK""#));
    }

    #[test]
    fn test_event_missing_data_defaults_to_null() {
        let event: Event = serde_json::from_str(r#"{"type":"HEARTBEAT"}"#).unwrap();
        assert!(event.is(tags::HEARTBEAT));
        assert!(event.data.is_null());
    }

    #[test]
    fn test_client_event_identify() {
        let event: Event =
            serde_json::from_str(r#"{"type":"IDENTIFY","data":{"token":"abc123"}}"#).unwrap();
        match ClientEvent::from_event(&event).unwrap() {
            Some(ClientEvent::Identify(data)) => assert_eq!(data.token, "abc123"),
            other => panic!("Expected Identify, got {:?}", other),
        }
    }

    #[test]
    fn test_client_event_unknown_tag() {
        let event = Event::empty("MESSAGE_CREATE");
        assert_eq!(ClientEvent::from_event(&event).unwrap(), None);
    }

    #[test]
    fn test_client_event_malformed_payload() {
        let event = Event::new(tags::SUBSCRIBE, json!({"channel": "general"})).unwrap();
        assert!(matches!(
            ClientEvent::from_event(&event),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_typing_start_ignores_client_identity() {
        for data in [
            json!({"channel_id": "general"}),
            json!({"channel_id": "general", "user_id": "mallory"}),
            json!({"channel_id": "general", "user_id": 42}),
            json!({"channel_id": "general", "username": null}),
        ] {
            let event = Event::new(tags::TYPING_START, data).unwrap();
            match ClientEvent::from_event(&event).unwrap() {
                Some(ClientEvent::TypingStart(data)) => assert_eq!(data.channel_id, "general"),
                other => panic!("Expected TypingStart, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_presence_update_rejects_unknown_status() {
        let ok = Event::new(tags::PRESENCE_UPDATE, json!({"status": "idle"})).unwrap();
        match ClientEvent::from_event(&ok).unwrap() {
            Some(ClientEvent::PresenceUpdate(data)) => {
                assert_eq!(data.status, PresenceStatus::Idle)
            }
            other => panic!("Expected PresenceUpdate, got {:?}", other),
        }

        let bad = Event::new(tags::PRESENCE_UPDATE, json!({"status": "sleeping"})).unwrap();
        assert!(ClientEvent::from_event(&bad).is_err());
    }

    #[test]
    fn test_client_event_kind() {
        assert_eq!(ClientEvent::Heartbeat.kind(), tags::HEARTBEAT);
        let sub = ClientEvent::Subscribe(SubscribeData {
            channel_id: "general".into(),
        });
        assert_eq!(sub.kind(), tags::SUBSCRIBE);
    }
}
