//! Shared fixtures for the Switchyard benchmarks.

use serde_json::json;
use switchyard_core::{ClientHandle, DeliveryConfig, Hub, HubConfig, Identity};
use switchyard_protocol::{tags, Event};
use uuid::Uuid;

/// Channel every fixture subscriber joins.
pub const CHANNEL: &str = "bench:general";

/// A hub with `subscribers` registered users, all subscribed to [`CHANNEL`].
///
/// Queue capacity is large enough that a drained fixture never drops.
#[must_use]
pub fn populated_hub(subscribers: usize, delivery: DeliveryConfig) -> (Hub, Vec<ClientHandle>) {
    let hub = Hub::with_config(HubConfig {
        outbound_capacity: 1024,
        delivery,
        ..HubConfig::default()
    });

    let handles = (0..subscribers)
        .map(|i| {
            let handle = hub.create_handle(Identity::new(Uuid::new_v4(), format!("user{i}")));
            hub.register(handle.clone());
            // One channel per user, well under the subscription limit.
            let _ = hub.subscribe(&handle, CHANNEL);
            handle
        })
        .collect();

    (hub, handles)
}

/// Discard everything queued for `handles`.
pub fn drain(handles: &[ClientHandle]) {
    for handle in handles {
        while handle.queue().try_pop().is_some() {}
    }
}

/// A `MESSAGE_CREATE` with `content_len` bytes of content.
#[must_use]
pub fn message_event(content_len: usize) -> Event {
    Event::new(
        tags::MESSAGE_CREATE,
        json!({
            "id": Uuid::nil(),
            "channel_id": CHANNEL,
            "content": "x".repeat(content_len),
        }),
    )
    .unwrap_or_else(|_| Event::empty(tags::MESSAGE_CREATE))
}
