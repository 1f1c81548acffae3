//! Typed payloads carried in the `data` field of an [`Event`](crate::Event).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `IDENTIFY` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyData {
    /// Bearer token.
    pub token: String,
}

/// `TOKEN_REFRESH` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRefreshData {
    /// Replacement bearer token.
    pub token: String,
}

/// `SUBSCRIBE` / `UNSUBSCRIBE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeData {
    pub channel_id: String,
}

/// Inbound `TYPING_START` payload.
///
/// Any identity fields a client adds are ignored, whatever their type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStartData {
    pub channel_id: String,
}

/// Broadcast `TYPING_START` payload, carrying the sender's verified identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingData {
    pub channel_id: String,
    pub user_id: Uuid,
    pub username: String,
}

/// User presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Invisible,
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Dnd => "dnd",
            Self::Invisible => "invisible",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Inbound `PRESENCE_UPDATE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdateData {
    pub status: PresenceStatus,
}

/// Broadcast `PRESENCE_UPDATE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceData {
    pub user_id: Uuid,
    pub username: String,
    pub status: PresenceStatus,
}

/// `READY` payload, sent once after a successful `IDENTIFY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyData {
    pub user_id: Uuid,
    pub username: String,
    #[serde(default)]
    pub online_user_ids: Vec<Uuid>,
}

/// `SESSION_EXPIRED` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExpiredData {
    pub reason: String,
}

/// `VOICE_JOIN` / `VOICE_LEAVE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceChannelData {
    pub channel_id: String,
    pub server_id: Uuid,
}

/// `VOICE_STATE_UPDATE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateData {
    pub user_id: Uuid,
    pub username: String,
    pub channel_id: String,
    pub server_id: Uuid,
    pub joined: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
}

/// `DM_CALL_START` / `DM_CALL_ACCEPT` / `DM_CALL_END` payload from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmCallData {
    pub conversation_id: Uuid,
}

/// `DM_CALL_RING` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmCallRingData {
    pub conversation_id: Uuid,
    pub caller_id: Uuid,
    pub caller_username: String,
}

/// Broadcast `DM_CALL_ACCEPT` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmCallAcceptData {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
}

/// Broadcast `DM_CALL_END` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmCallEndData {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
}
