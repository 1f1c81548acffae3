//! The central connection registry and channel router.
//!
//! The hub maps user ids to their live connection and channel ids to their
//! subscribers. All state lives in sharded concurrent maps; every operation
//! acts on them directly and no shard lock is held across an await point.
//! Fan-out snapshots the recipients first and then delivers, so a slow
//! recipient never stalls registration or subscription changes.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use switchyard_protocol::{codec, EncodedEvent, Event, PresenceStatus};
use switchyard_transport::CloseReason;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::delivery::{Delivery, DeliveryConfig, DeliveryReport};
use crate::handle::ClientHandle;
use crate::outbound::DEFAULT_OUTBOUND_CAPACITY;
use crate::presence::PresenceChange;
use crate::voice::{VoiceState, VoiceStates};

/// Capacity of the presence lifecycle channel.
const PRESENCE_CHANNEL_CAPACITY: usize = 1024;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Invalid channel id.
    #[error("Invalid channel id: {0}")]
    InvalidChannel(&'static str),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached ({limit})")]
    TooManySubscriptions { limit: usize },

    /// The connection is no longer the user's live session.
    #[error("Connection is not the live session")]
    NotLive,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Pending frames per connection.
    pub outbound_capacity: usize,
    /// Maximum channels one user can be subscribed to.
    pub max_subscriptions_per_user: usize,
    /// Maximum channel id length in bytes.
    pub max_channel_id_len: usize,
    /// Backpressure policy per event tag.
    pub delivery: DeliveryConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_subscriptions_per_user: 500,
            max_channel_id_len: 256,
            delivery: DeliveryConfig::default(),
        }
    }
}

/// Validate a channel id.
///
/// # Errors
///
/// Returns a description of the problem if the id is invalid.
pub fn validate_channel_id(channel_id: &str, max_len: usize) -> Result<(), &'static str> {
    if channel_id.is_empty() {
        return Err("Channel id cannot be empty");
    }
    if channel_id.len() > max_len {
        return Err("Channel id too long");
    }
    if channel_id.chars().any(char::is_control) {
        return Err("Channel id contains control characters");
    }
    Ok(())
}

/// The central event router.
pub struct Hub {
    /// Live connection per user.
    clients: DashMap<Uuid, ClientHandle>,
    /// Channel id -> subscribed user ids.
    channels: DashMap<String, HashSet<Uuid>>,
    /// User id -> subscribed channel ids.
    subscriptions: DashMap<Uuid, HashSet<String>>,
    /// Voice channel occupancy.
    voice: VoiceStates,
    /// Online/offline transitions.
    presence_tx: broadcast::Sender<PresenceChange>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    config: HubConfig,
}

impl Hub {
    /// Create a new hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a new hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        let (presence_tx, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        Self {
            clients: DashMap::new(),
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
            voice: VoiceStates::new(),
            presence_tx,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Build a handle for a verified identity using the configured queue size.
    #[must_use]
    pub fn create_handle(&self, identity: Identity) -> ClientHandle {
        ClientHandle::new(identity, self.config.outbound_capacity)
    }

    /// Subscribe to online/offline transitions.
    #[must_use]
    pub fn presence_events(&self) -> broadcast::Receiver<PresenceChange> {
        self.presence_tx.subscribe()
    }

    // ── Registry ─────────────────────────────────────────────────────────

    /// Make `handle` the live connection of its user.
    ///
    /// A previously registered connection of the same user is closed with
    /// [`CloseReason::SESSION_REPLACED`] and returned. The user's channel
    /// subscriptions are cleared either way, so a session always starts
    /// with none.
    pub fn register(&self, handle: ClientHandle) -> Option<ClientHandle> {
        let user_id = handle.user_id();

        let previous = match self.clients.entry(user_id) {
            Entry::Occupied(mut entry) => {
                self.unsubscribe_all(user_id);
                Some(entry.insert(handle.clone()))
            }
            Entry::Vacant(entry) => {
                self.unsubscribe_all(user_id);
                entry.insert(handle.clone());
                None
            }
        };

        match &previous {
            Some(old) => {
                old.close(CloseReason::session_replaced());
                info!(
                    user = %user_id,
                    old_connection = %old.connection_id(),
                    new_connection = %handle.connection_id(),
                    "Session replaced"
                );
            }
            None => {
                debug!(user = %user_id, connection = %handle.connection_id(), "Client registered");
                self.announce(PresenceChange {
                    user_id,
                    username: handle.username(),
                    status: PresenceStatus::Online,
                    left_voice: None,
                });
            }
        }

        previous
    }

    /// Remove `handle` from the registry if it is still the user's live
    /// connection.
    ///
    /// The handle's queue is closed in every case. Returns `false` when a
    /// newer connection had already replaced it, in which case the newer
    /// session's state is left alone.
    pub fn unregister(&self, handle: &ClientHandle) -> bool {
        let user_id = handle.user_id();
        handle.queue().close();

        let Entry::Occupied(entry) = self.clients.entry(user_id) else {
            return false;
        };
        if !entry.get().same_connection(handle) {
            trace!(user = %user_id, connection = %handle.connection_id(), "Stale unregister ignored");
            return false;
        }

        let channels = self.unsubscribe_all(user_id);
        let left_voice = self.voice.leave_any(user_id);
        entry.remove();

        debug!(
            user = %user_id,
            connection = %handle.connection_id(),
            channels,
            "Client unregistered"
        );
        self.announce(PresenceChange {
            user_id,
            username: handle.username(),
            status: PresenceStatus::Offline,
            left_voice,
        });
        true
    }

    fn announce(&self, change: PresenceChange) {
        // No receivers is fine.
        let _ = self.presence_tx.send(change);
    }

    /// The live connection of a user.
    #[must_use]
    pub fn get(&self, user_id: Uuid) -> Option<ClientHandle> {
        self.clients.get(&user_id).map(|c| c.clone())
    }

    #[must_use]
    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.clients.contains_key(&user_id)
    }

    /// Snapshot of all online user ids.
    #[must_use]
    pub fn online_users(&self) -> Vec<Uuid> {
        self.clients.iter().map(|e| *e.key()).collect()
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.clients.len()
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    /// Subscribe the user behind `handle` to a channel.
    ///
    /// Returns `false` if the user was already subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel id is invalid, the user is at the
    /// subscription limit, or `handle` has been replaced or unregistered.
    pub fn subscribe(&self, handle: &ClientHandle, channel_id: &str) -> Result<bool, HubError> {
        validate_channel_id(channel_id, self.config.max_channel_id_len)
            .map_err(HubError::InvalidChannel)?;

        let user_id = handle.user_id();
        // Held until the subscription lands so a replacing register waits.
        let live = self.clients.get(&user_id).ok_or(HubError::NotLive)?;
        if !live.same_connection(handle) {
            return Err(HubError::NotLive);
        }

        let mut subs = self.subscriptions.entry(user_id).or_default();
        if subs.contains(channel_id) {
            return Ok(false);
        }
        let limit = self.config.max_subscriptions_per_user;
        if subs.len() >= limit {
            return Err(HubError::TooManySubscriptions { limit });
        }
        subs.insert(channel_id.to_owned());

        let mut members = self.channels.entry(channel_id.to_owned()).or_default();
        members.insert(user_id);

        debug!(
            channel = %channel_id,
            user = %user_id,
            subscribers = members.len(),
            "Subscribed"
        );
        Ok(true)
    }

    /// Unsubscribe the user behind `handle` from a channel.
    ///
    /// Returns `false` if the user was not subscribed or `handle` is no
    /// longer the live session. The channel entry is removed once its last
    /// subscriber leaves.
    pub fn unsubscribe(&self, handle: &ClientHandle, channel_id: &str) -> bool {
        let user_id = handle.user_id();
        let Some(live) = self.clients.get(&user_id) else {
            return false;
        };
        if !live.same_connection(handle) {
            trace!(user = %user_id, connection = %handle.connection_id(), "Stale unsubscribe ignored");
            return false;
        }

        let removed = self
            .subscriptions
            .get_mut(&user_id)
            .map(|mut subs| subs.remove(channel_id))
            .unwrap_or(false);
        self.subscriptions.remove_if(&user_id, |_, subs| subs.is_empty());

        if removed {
            self.leave_channel(user_id, channel_id);
            debug!(channel = %channel_id, user = %user_id, "Unsubscribed");
        }
        removed
    }

    /// Unsubscribe a user from every channel.
    ///
    /// Returns the number of channels left.
    pub fn unsubscribe_all(&self, user_id: Uuid) -> usize {
        let Some((_, channels)) = self.subscriptions.remove(&user_id) else {
            return 0;
        };
        for channel_id in &channels {
            self.leave_channel(user_id, channel_id);
        }
        channels.len()
    }

    fn leave_channel(&self, user_id: Uuid, channel_id: &str) {
        if let Some(mut members) = self.channels.get_mut(channel_id) {
            members.remove(&user_id);
        }
        if self
            .channels
            .remove_if(channel_id, |_, members| members.is_empty())
            .is_some()
        {
            debug!(channel = %channel_id, "Removed empty channel");
        }
    }

    #[must_use]
    pub fn is_subscribed(&self, user_id: Uuid, channel_id: &str) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|members| members.contains(&user_id))
    }

    #[must_use]
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        self.channels.get(channel_id).map_or(0, |m| m.len())
    }

    #[must_use]
    pub fn channel_exists(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    /// Channels a user is subscribed to.
    #[must_use]
    pub fn user_channels(&self, user_id: Uuid) -> Vec<String> {
        self.subscriptions
            .get(&user_id)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── Fan-out ──────────────────────────────────────────────────────────

    /// Deliver an event to every subscriber of a channel except `exclude`.
    ///
    /// The event is encoded once. Each recipient's queue applies the
    /// delivery policy of the event's tag; a full queue affects only that
    /// recipient.
    pub async fn broadcast_to_channel(
        &self,
        channel_id: &str,
        event: &Event,
        exclude: Option<Uuid>,
    ) -> DeliveryReport {
        let Some(frame) = encode(event) else {
            return DeliveryReport::default();
        };

        let member_ids: Vec<Uuid> = match self.channels.get(channel_id) {
            Some(members) => members
                .iter()
                .copied()
                .filter(|id| Some(*id) != exclude)
                .collect(),
            None => {
                trace!(channel = %channel_id, "Broadcast to channel without subscribers");
                return DeliveryReport::default();
            }
        };

        let recipients = self.handles(&member_ids);
        let report = self.deliver(&recipients, &event.kind, &frame).await;
        trace!(
            channel = %channel_id,
            kind = %event.kind,
            delivered = report.delivered,
            dropped = report.dropped,
            "Broadcast"
        );
        report
    }

    /// Deliver an event to one user, if online.
    ///
    /// Sending to an offline user is a no-op.
    pub async fn send_to_user(&self, user_id: Uuid, event: &Event) -> DeliveryReport {
        let Some(frame) = encode(event) else {
            return DeliveryReport::default();
        };
        self.send_encoded(user_id, &event.kind, &frame).await
    }

    pub(crate) async fn send_encoded(
        &self,
        user_id: Uuid,
        kind: &str,
        frame: &EncodedEvent,
    ) -> DeliveryReport {
        match self.get(user_id) {
            Some(handle) => self.deliver(&[handle], kind, frame).await,
            None => DeliveryReport::default(),
        }
    }

    /// Live handles for the given users, skipping offline ones.
    pub(crate) fn handles(&self, user_ids: &[Uuid]) -> Vec<ClientHandle> {
        user_ids
            .iter()
            .filter_map(|id| self.clients.get(id).map(|c| c.clone()))
            .collect()
    }

    /// Deliver one encoded frame to each recipient under the tag's policy.
    ///
    /// Blocking deliveries wait concurrently.
    pub(crate) async fn deliver(
        &self,
        recipients: &[ClientHandle],
        kind: &str,
        frame: &EncodedEvent,
    ) -> DeliveryReport {
        let policy = self.config.delivery.policy_for(kind);

        let outcomes: Vec<Delivery> = if policy.may_block() && recipients.len() > 1 {
            join_all(
                recipients
                    .iter()
                    .map(|client| client.queue().deliver(frame.clone(), policy)),
            )
            .await
        } else {
            let mut outcomes = Vec::with_capacity(recipients.len());
            for client in recipients {
                outcomes.push(client.queue().deliver(frame.clone(), policy).await);
            }
            outcomes
        };

        let mut report = DeliveryReport::default();
        for (client, outcome) in recipients.iter().zip(outcomes) {
            if !outcome.is_delivered() {
                trace!(
                    user = %client.user_id(),
                    kind = %kind,
                    outcome = ?outcome,
                    "Frame not delivered"
                );
            }
            report.record(outcome);
        }

        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }

    // ── Voice ────────────────────────────────────────────────────────────

    /// Put a user in a voice channel, leaving any previous one.
    pub fn join_voice(&self, state: VoiceState) -> Option<VoiceState> {
        debug!(user = %state.user_id, channel = %state.channel_id, "Joined voice");
        self.voice.join(state)
    }

    /// Take a user out of a voice channel.
    pub fn leave_voice(&self, user_id: Uuid, channel_id: &str) -> Option<VoiceState> {
        let left = self.voice.leave(user_id, channel_id);
        if left.is_some() {
            debug!(user = %user_id, channel = %channel_id, "Left voice");
        }
        left
    }

    /// Snapshot of a voice channel's participants.
    #[must_use]
    pub fn voice_participants(&self, channel_id: &str) -> Vec<VoiceState> {
        self.voice.participants(channel_id)
    }

    // ── Stats ────────────────────────────────────────────────────────────

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            online_users: self.clients.len(),
            channel_count: self.channels.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
            voice_channels: self.voice.active_channels(),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            events_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(event: &Event) -> Option<EncodedEvent> {
    match codec::encode_shared(event) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(kind = %event.kind, error = %e, "Failed to encode event");
            None
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct HubStats {
    /// Number of online users.
    pub online_users: usize,
    /// Number of channels with at least one subscriber.
    pub channel_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
    /// Number of occupied voice channels.
    pub voice_channels: usize,
    /// Frames accepted by recipient queues since start.
    pub events_delivered: u64,
    /// Frames not delivered since start.
    pub events_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryPolicy;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use switchyard_protocol::tags;

    fn client(hub: &Hub, name: &str) -> ClientHandle {
        hub.create_handle(Identity::new(Uuid::new_v4(), name))
    }

    fn kinds(handle: &ClientHandle) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Some(frame) = handle.queue().try_pop() {
            kinds.push(codec::decode(&frame).unwrap().kind);
        }
        kinds
    }

    fn message(content: &str) -> Event {
        Event::new(tags::MESSAGE_CREATE, json!({ "content": content })).unwrap()
    }

    #[test]
    fn test_register_unregister_online() {
        let hub = Hub::new();
        let a = client(&hub, "alice");

        assert!(!hub.is_online(a.user_id()));
        assert!(hub.register(a.clone()).is_none());
        assert!(hub.is_online(a.user_id()));

        assert!(hub.unregister(&a));
        assert!(!hub.is_online(a.user_id()));
        assert!(a.queue().is_closed());
    }

    #[test]
    fn test_online_users_counts_distinct() {
        let hub = Hub::new();
        let handles: Vec<_> = ["a", "b", "c"].iter().map(|n| client(&hub, n)).collect();
        for h in handles.iter().rev() {
            hub.register(h.clone());
        }
        hub.register(hub.create_handle(handles[0].identity()));

        assert_eq!(hub.online_users().len(), 3);
        assert_eq!(hub.online_count(), 3);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers_once() {
        let hub = Hub::new();
        let a = client(&hub, "alice");
        let b = client(&hub, "bob");
        let outsider = client(&hub, "carol");
        for h in [&a, &b, &outsider] {
            hub.register(h.clone());
        }
        hub.subscribe(&a, "general").unwrap();
        hub.subscribe(&b, "general").unwrap();

        let report = hub.broadcast_to_channel("general", &message("hi"), None).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(kinds(&a), vec![tags::MESSAGE_CREATE]);
        assert_eq!(kinds(&b), vec![tags::MESSAGE_CREATE]);
        assert!(kinds(&outsider).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let hub = Hub::new();
        let a = client(&hub, "alice");
        let b = client(&hub, "bob");
        hub.register(a.clone());
        hub.register(b.clone());
        hub.subscribe(&a, "general").unwrap();
        hub.subscribe(&b, "general").unwrap();

        hub.broadcast_to_channel("general", &message("hi"), Some(a.user_id()))
            .await;

        assert!(kinds(&a).is_empty());
        assert_eq!(kinds(&b).len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_user_stops_receiving() {
        let hub = Hub::new();
        let a = client(&hub, "alice");
        let b = client(&hub, "bob");
        hub.register(a.clone());
        hub.register(b.clone());
        hub.subscribe(&a, "general").unwrap();
        hub.subscribe(&b, "general").unwrap();

        hub.broadcast_to_channel("general", &message("one"), None).await;
        assert_eq!(kinds(&a), vec![tags::MESSAGE_CREATE]);
        assert_eq!(kinds(&b), vec![tags::MESSAGE_CREATE]);

        assert!(hub.unsubscribe(&b, "general"));
        hub.broadcast_to_channel("general", &message("two"), None).await;

        assert_eq!(kinds(&a), vec![tags::MESSAGE_CREATE]);
        let late = tokio::time::timeout(Duration::from_millis(50), b.queue().pop()).await;
        assert!(late.is_err());
    }

    #[test]
    fn test_last_unsubscribe_removes_channel() {
        let hub = Hub::new();
        let alice = client(&hub, "alice");
        hub.register(alice.clone());
        let user = alice.user_id();

        assert!(hub.subscribe(&alice, "general").unwrap());
        assert!(!hub.subscribe(&alice, "general").unwrap());
        assert_eq!(hub.subscriber_count("general"), 1);

        assert!(hub.unsubscribe(&alice, "general"));
        assert!(!hub.channel_exists("general"));
        assert!(!hub.unsubscribe(&alice, "general"));
        assert!(hub.user_channels(user).is_empty());

        assert!(hub.subscribe(&alice, "general").unwrap());
        assert_eq!(hub.subscriber_count("general"), 1);
        assert!(hub.is_subscribed(user, "general"));
    }

    #[test]
    fn test_subscribe_validation() {
        let hub = Hub::with_config(HubConfig {
            max_subscriptions_per_user: 2,
            ..HubConfig::default()
        });
        let user = client(&hub, "alice");
        hub.register(user.clone());

        assert!(matches!(
            hub.subscribe(&user, ""),
            Err(HubError::InvalidChannel(_))
        ));
        assert!(matches!(
            hub.subscribe(&user, &"x".repeat(257)),
            Err(HubError::InvalidChannel(_))
        ));

        hub.subscribe(&user, "one").unwrap();
        hub.subscribe(&user, "two").unwrap();
        assert!(matches!(
            hub.subscribe(&user, "three"),
            Err(HubError::TooManySubscriptions { limit: 2 })
        ));
        assert!(!hub.subscribe(&user, "two").unwrap());
    }

    #[tokio::test]
    async fn test_send_to_offline_user_is_noop() {
        let hub = Hub::new();
        let report = hub
            .send_to_user(Uuid::new_v4(), &Event::empty(tags::READY))
            .await;
        assert_eq!(report, DeliveryReport::default());
    }

    #[tokio::test]
    async fn test_send_to_user() {
        let hub = Hub::new();
        let a = client(&hub, "alice");
        hub.register(a.clone());

        hub.send_to_user(a.user_id(), &Event::empty(tags::READY)).await;

        let frame = tokio::time::timeout(Duration::from_millis(100), a.queue().pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(codec::decode(&frame).unwrap().kind, tags::READY);
        assert!(a.queue().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let hub = Hub::new();
        let a = client(&hub, "alice");
        hub.register(a.clone());

        for i in 0..256 {
            let event = Event::new(tags::MESSAGE_CREATE, json!({ "n": i })).unwrap();
            hub.send_to_user(a.user_id(), &event).await;
        }
        let overflow = Event::new(tags::MESSAGE_CREATE, json!({ "n": 256 })).unwrap();
        let report = tokio::time::timeout(
            Duration::from_millis(100),
            hub.send_to_user(a.user_id(), &overflow),
        )
        .await
        .unwrap();

        assert_eq!(report.dropped, 1);
        assert_eq!(a.queue().len(), 256);

        let mut seen = Vec::new();
        while let Some(frame) = a.queue().try_pop() {
            seen.push(codec::decode(&frame).unwrap().data["n"].as_u64().unwrap());
        }
        assert_eq!(seen, (0..256).collect::<Vec<u64>>());
        assert_eq!(hub.stats().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_drop_oldest_policy() {
        let hub = Hub::with_config(HubConfig {
            outbound_capacity: 2,
            delivery: DeliveryConfig::default()
                .with_override(tags::TYPING_START, DeliveryPolicy::DropOldest),
            ..HubConfig::default()
        });
        let a = client(&hub, "alice");
        hub.register(a.clone());

        for i in 0..3 {
            let event = Event::new(tags::TYPING_START, json!({ "n": i })).unwrap();
            hub.send_to_user(a.user_id(), &event).await;
        }

        let first = a.queue().try_pop().unwrap();
        assert_eq!(codec::decode(&first).unwrap().data["n"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_policy_waits_concurrently() {
        let hub = Arc::new(Hub::with_config(HubConfig {
            outbound_capacity: 1,
            delivery: DeliveryConfig::default().with_override(
                tags::MESSAGE_DELETE,
                DeliveryPolicy::block(Duration::from_millis(250)),
            ),
            ..HubConfig::default()
        }));
        let a = client(&hub, "alice");
        let b = client(&hub, "bob");
        for h in [&a, &b] {
            hub.register(h.clone());
            hub.subscribe(h, "general").unwrap();
            h.queue().try_push(Arc::from("filler"));
        }

        let started = tokio::time::Instant::now();
        let report = hub
            .broadcast_to_channel("general", &Event::empty(tags::MESSAGE_DELETE), None)
            .await;

        assert_eq!(report.dropped, 2);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_block_policy_delivers_when_drained() {
        let hub = Arc::new(Hub::with_config(HubConfig {
            outbound_capacity: 1,
            delivery: DeliveryConfig::default().with_override(
                tags::MESSAGE_DELETE,
                DeliveryPolicy::block(Duration::from_secs(5)),
            ),
            ..HubConfig::default()
        }));
        let a = client(&hub, "alice");
        hub.register(a.clone());
        a.queue().try_push(Arc::from("filler"));

        let h = hub.clone();
        let user = a.user_id();
        let sender = tokio::spawn(async move {
            h.send_to_user(user, &Event::empty(tags::MESSAGE_DELETE))
                .await
        });

        tokio::task::yield_now().await;
        assert_eq!(a.queue().pop().await.as_deref(), Some("filler"));
        assert_eq!(sender.await.unwrap().delivered, 1);
        assert_eq!(kinds(&a), vec![tags::MESSAGE_DELETE]);
    }

    #[tokio::test]
    async fn test_replacement_closes_old_session() {
        let hub = Hub::new();
        let old = client(&hub, "alice");
        hub.register(old.clone());
        hub.subscribe(&old, "general").unwrap();

        let new = hub.create_handle(old.identity());
        let replaced = hub.register(new.clone()).unwrap();

        assert!(replaced.same_connection(&old));
        assert!(old.queue().is_closed());
        assert_eq!(
            old.queue().close_reason().map(|r| r.code),
            Some(CloseReason::SESSION_REPLACED)
        );
        assert!(!hub.is_subscribed(new.user_id(), "general"));
        assert!(!hub.channel_exists("general"));

        hub.subscribe(&new, "general").unwrap();
        assert!(!hub.unregister(&old));
        assert!(hub.is_online(new.user_id()));
        assert!(hub.is_subscribed(new.user_id(), "general"));
        assert!(!new.queue().is_closed());
    }

    #[test]
    fn test_stale_session_cannot_touch_subscriptions() {
        let hub = Hub::new();
        let old = client(&hub, "alice");
        hub.register(old.clone());
        let new = hub.create_handle(old.identity());
        hub.register(new.clone());
        hub.subscribe(&new, "general").unwrap();

        assert!(matches!(
            hub.subscribe(&old, "random"),
            Err(HubError::NotLive)
        ));
        assert!(!hub.unsubscribe(&old, "general"));

        assert_eq!(hub.user_channels(new.user_id()), vec!["general".to_owned()]);
        assert_eq!(hub.subscriber_count("general"), 1);
        assert!(!hub.channel_exists("random"));

        hub.unregister(&new);
        assert!(matches!(
            hub.subscribe(&new, "general"),
            Err(HubError::NotLive)
        ));
        assert!(!hub.channel_exists("general"));
    }

    #[tokio::test]
    async fn test_saturated_recipient_does_not_block_others() {
        let hub = Hub::new();
        let slow = client(&hub, "slow");
        let fast = client(&hub, "fast");
        for h in [&slow, &fast] {
            hub.register(h.clone());
            hub.subscribe(h, "general").unwrap();
        }
        for i in 0..256 {
            let event = Event::new(tags::MESSAGE_CREATE, json!({ "n": i })).unwrap();
            hub.send_to_user(slow.user_id(), &event).await;
        }

        let overflow = Event::new(tags::MESSAGE_CREATE, json!({ "n": 256 })).unwrap();
        let report = tokio::time::timeout(
            Duration::from_millis(100),
            hub.broadcast_to_channel("general", &overflow, None),
        )
        .await
        .unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);

        let frame = fast.queue().try_pop().unwrap();
        assert_eq!(codec::decode(&frame).unwrap().data["n"], 256);
        assert!(fast.queue().is_empty());

        let mut seen = Vec::new();
        while let Some(frame) = slow.queue().try_pop() {
            seen.push(codec::decode(&frame).unwrap().data["n"].as_u64().unwrap());
        }
        assert_eq!(seen, (0..256).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_presence_changes() {
        let hub = Hub::new();
        let mut rx = hub.presence_events();
        let a = client(&hub, "alice");

        hub.register(a.clone());
        hub.register(hub.create_handle(a.identity()));
        let current = hub.get(a.user_id()).unwrap();
        hub.unregister(&current);

        let online = rx.recv().await.unwrap();
        assert_eq!(online.status, PresenceStatus::Online);
        let offline = rx.recv().await.unwrap();
        assert_eq!(offline.status, PresenceStatus::Offline);
        assert_eq!(offline.username, "alice");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unregister_clears_everything() {
        let hub = Hub::new();
        let a = client(&hub, "alice");
        hub.register(a.clone());
        hub.subscribe(&a, "one").unwrap();
        hub.subscribe(&a, "two").unwrap();
        hub.join_voice(VoiceState {
            user_id: a.user_id(),
            username: "alice".into(),
            channel_id: "lobby".into(),
            server_id: Uuid::new_v4(),
            muted: false,
            deafened: false,
        });

        hub.unregister(&a);

        let stats = hub.stats();
        assert_eq!(stats.online_users, 0);
        assert_eq!(stats.channel_count, 0);
        assert_eq!(stats.total_subscriptions, 0);
        assert_eq!(stats.voice_channels, 0);
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_broadcast() {
        let hub = Arc::new(Hub::new());
        let users: Vec<_> = (0..32).map(|i| client(&hub, &format!("u{i}"))).collect();
        for u in &users {
            hub.register(u.clone());
        }

        let mut tasks = Vec::new();
        for u in users.clone() {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                hub.subscribe(&u, "general").unwrap();
                hub.broadcast_to_channel("general", &message("x"), None)
                    .await;
                hub.unsubscribe(&u, "general");
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert!(!hub.channel_exists("general"));
        assert_eq!(hub.stats().total_subscriptions, 0);
    }
}
