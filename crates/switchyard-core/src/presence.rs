//! Online/offline lifecycle and presence fan-out.
//!
//! The hub emits a [`PresenceChange`] whenever a user comes online or goes
//! offline. [`spawn_presence_fanout`] turns those into `PRESENCE_UPDATE`
//! events for the user's co-members, and announces voice departures caused
//! by a disconnect.

use std::sync::Arc;

use switchyard_protocol::{tags, Event, PresenceData, PresenceStatus};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broadcast::broadcast_to_members;
use crate::delivery::DeliveryReport;
use crate::directory::MemberDirectory;
use crate::hub::Hub;
use crate::voice::VoiceState;

/// A user came online or went offline.
#[derive(Debug, Clone)]
pub struct PresenceChange {
    pub user_id: Uuid,
    pub username: String,
    pub status: PresenceStatus,
    /// Voice channel the user was removed from by the disconnect.
    pub left_voice: Option<VoiceState>,
}

impl PresenceChange {
    #[must_use]
    pub fn data(&self) -> PresenceData {
        PresenceData {
            user_id: self.user_id,
            username: self.username.clone(),
            status: self.status,
        }
    }
}

/// Send `PRESENCE_UPDATE` for `presence` to the user's co-members.
pub async fn announce_presence(
    hub: &Hub,
    directory: &dyn MemberDirectory,
    presence: &PresenceData,
) -> DeliveryReport {
    let co_members = match directory.co_member_ids(presence.user_id).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(
                user = %presence.user_id,
                error = %e,
                "Failed to resolve co-members for presence"
            );
            return DeliveryReport::default();
        }
    };

    match Event::new(tags::PRESENCE_UPDATE, presence) {
        Ok(event) => broadcast_to_members(hub, &co_members, &event, Some(presence.user_id)).await,
        Err(e) => {
            warn!(error = %e, "Failed to build presence event");
            DeliveryReport::default()
        }
    }
}

/// Send `VOICE_STATE_UPDATE` for `state` to every member of its server.
pub async fn announce_voice(
    hub: &Hub,
    directory: &dyn MemberDirectory,
    state: &VoiceState,
    joined: bool,
) -> DeliveryReport {
    let members = match directory.server_member_ids(state.server_id).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(
                server = %state.server_id,
                error = %e,
                "Failed to resolve server members for voice update"
            );
            return DeliveryReport::default();
        }
    };

    match Event::new(tags::VOICE_STATE_UPDATE, state.to_update(joined)) {
        Ok(event) => broadcast_to_members(hub, &members, &event, None).await,
        Err(e) => {
            warn!(error = %e, "Failed to build voice state event");
            DeliveryReport::default()
        }
    }
}

/// Spawn the task that fans lifecycle changes out to co-members.
///
/// Runs for as long as the hub is alive. A lagging task skips the changes it
/// missed.
pub fn spawn_presence_fanout(
    hub: Arc<Hub>,
    directory: Arc<dyn MemberDirectory>,
) -> JoinHandle<()> {
    let mut rx = hub.presence_events();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(change) => {
                    let report = announce_presence(&hub, directory.as_ref(), &change.data()).await;
                    debug!(
                        user = %change.user_id,
                        status = %change.status,
                        delivered = report.delivered,
                        "Presence announced"
                    );

                    if let Some(voice) = &change.left_voice {
                        announce_voice(&hub, directory.as_ref(), voice, false).await;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Presence fan-out lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
