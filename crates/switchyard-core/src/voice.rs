//! Voice channel occupancy.
//!
//! A user is in at most one voice channel at a time. Joining a channel moves
//! the user out of any previous one.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use switchyard_protocol::VoiceStateData;
use uuid::Uuid;

/// One user's presence in a voice channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceState {
    pub user_id: Uuid,
    pub username: String,
    pub channel_id: String,
    pub server_id: Uuid,
    pub muted: bool,
    pub deafened: bool,
}

impl VoiceState {
    /// Payload announcing this state to other members.
    #[must_use]
    pub fn to_update(&self, joined: bool) -> VoiceStateData {
        VoiceStateData {
            user_id: self.user_id,
            username: self.username.clone(),
            channel_id: self.channel_id.clone(),
            server_id: self.server_id,
            joined,
            muted: self.muted,
            deafened: self.deafened,
        }
    }
}

/// Voice occupancy indexed both by channel and by user.
#[derive(Debug, Default)]
pub struct VoiceStates {
    /// channel id -> user id -> state
    channels: DashMap<String, HashMap<Uuid, VoiceState>>,
    /// user id -> channel id
    users: DashMap<Uuid, String>,
}

impl VoiceStates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a user in a voice channel.
    ///
    /// Returns the state the user had in a different channel, if any.
    pub fn join(&self, state: VoiceState) -> Option<VoiceState> {
        let previous = self
            .users
            .insert(state.user_id, state.channel_id.clone())
            .filter(|old| *old != state.channel_id)
            .and_then(|old| self.remove_from_channel(state.user_id, &old));

        self.channels
            .entry(state.channel_id.clone())
            .or_default()
            .insert(state.user_id, state);

        previous
    }

    /// Take a user out of `channel_id`.
    ///
    /// A no-op if the user is not in that channel.
    pub fn leave(&self, user_id: Uuid, channel_id: &str) -> Option<VoiceState> {
        self.users
            .remove_if(&user_id, |_, current| current == channel_id)?;
        self.remove_from_channel(user_id, channel_id)
    }

    /// Take a user out of whichever voice channel they are in.
    pub fn leave_any(&self, user_id: Uuid) -> Option<VoiceState> {
        let (_, channel_id) = self.users.remove(&user_id)?;
        self.remove_from_channel(user_id, &channel_id)
    }

    fn remove_from_channel(&self, user_id: Uuid, channel_id: &str) -> Option<VoiceState> {
        let removed = self
            .channels
            .get_mut(channel_id)
            .and_then(|mut users| users.remove(&user_id));
        self.channels.remove_if(channel_id, |_, users| users.is_empty());
        removed
    }

    /// Snapshot of everyone in a voice channel.
    #[must_use]
    pub fn participants(&self, channel_id: &str) -> Vec<VoiceState> {
        self.channels
            .get(channel_id)
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The voice channel a user is in.
    #[must_use]
    pub fn channel_of(&self, user_id: Uuid) -> Option<String> {
        self.users.get(&user_id).map(|c| c.clone())
    }

    /// Number of voice channels with at least one participant.
    #[must_use]
    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(user_id: Uuid, channel_id: &str) -> VoiceState {
        VoiceState {
            user_id,
            username: "alice".into(),
            channel_id: channel_id.into(),
            server_id: Uuid::nil(),
            muted: false,
            deafened: false,
        }
    }

    #[test]
    fn test_join_moves_between_channels() {
        let voice = VoiceStates::new();
        let user = Uuid::new_v4();

        assert!(voice.join(state(user, "lobby")).is_none());
        let moved_from = voice.join(state(user, "raid")).unwrap();

        assert_eq!(moved_from.channel_id, "lobby");
        assert!(voice.participants("lobby").is_empty());
        assert_eq!(voice.participants("raid").len(), 1);
        assert_eq!(voice.channel_of(user).as_deref(), Some("raid"));
        assert_eq!(voice.active_channels(), 1);
    }

    #[test]
    fn test_rejoin_same_channel_keeps_one_entry() {
        let voice = VoiceStates::new();
        let user = Uuid::new_v4();

        voice.join(state(user, "lobby"));
        assert!(voice.join(state(user, "lobby")).is_none());
        assert_eq!(voice.participants("lobby").len(), 1);
    }

    #[test]
    fn test_leave_wrong_channel_is_noop() {
        let voice = VoiceStates::new();
        let user = Uuid::new_v4();
        voice.join(state(user, "lobby"));

        assert!(voice.leave(user, "raid").is_none());
        assert_eq!(voice.channel_of(user).as_deref(), Some("lobby"));

        assert!(voice.leave(user, "lobby").is_some());
        assert!(voice.channel_of(user).is_none());
        assert_eq!(voice.active_channels(), 0);
    }

    #[test]
    fn test_leave_any() {
        let voice = VoiceStates::new();
        let user = Uuid::new_v4();
        assert!(voice.leave_any(user).is_none());

        voice.join(state(user, "lobby"));
        let left = voice.leave_any(user).unwrap();
        assert_eq!(left.channel_id, "lobby");
        assert!(voice.participants("lobby").is_empty());
    }
}
