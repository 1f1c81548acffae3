//! Fan-out to an externally computed recipient list.

use switchyard_protocol::{codec, Event};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::delivery::DeliveryReport;
use crate::hub::Hub;

/// Deliver `event` once to each user in `member_ids` except `exclude`.
///
/// The event is encoded once for all recipients. Offline users and
/// duplicate ids are skipped.
pub async fn broadcast_to_members(
    hub: &Hub,
    member_ids: &[Uuid],
    event: &Event,
    exclude: Option<Uuid>,
) -> DeliveryReport {
    let frame = match codec::encode_shared(event) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(kind = %event.kind, error = %e, "Failed to encode event");
            return DeliveryReport::default();
        }
    };

    let mut seen = std::collections::HashSet::with_capacity(member_ids.len());
    let targets: Vec<Uuid> = member_ids
        .iter()
        .copied()
        .filter(|id| Some(*id) != exclude && seen.insert(*id))
        .collect();

    let recipients = hub.handles(&targets);
    let report = hub.deliver(&recipients, &event.kind, &frame).await;
    trace!(
        kind = %event.kind,
        members = member_ids.len(),
        delivered = report.delivered,
        "Broadcast to members"
    );
    report
}
